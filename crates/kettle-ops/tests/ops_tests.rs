// Operator tests — host path against direct definitions
//
// Convolution is checked against a naive seven-loop reference and
// deconvolution against it through the adjoint identity
// <conv(x), y> == <x, deconv(y)>.

use kettle_core::{HostTensor, WeightBlob, WeightBlobBuilder, WeightRef};
use kettle_ops::{
    Activation, BatchNorm, CellKind, CellWeights, ConvParams, Convolution, Deconvolution, Eltwise,
    Forward, Operator, RnnCell, RnnLayer, Split, StackedRnn,
};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};

fn approx(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() <= tol * (1.0 + b.abs())
}

fn assert_vec_approx(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(approx(*a, *e, tol), "index {i}: {a} != {e} (tol={tol})");
    }
}

fn random(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// Activations

#[test]
fn relu_concrete_values() {
    let blob = WeightBlob::default();
    let y = Activation::relu(0.0, 4, false)
        .forward(&blob, HostTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]))
        .unwrap();
    assert_eq!(y.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    let y = Activation::relu(0.5, 4, false)
        .forward(&blob, HostTensor::from_vec(vec![-1.0, -2.0, 3.0, 4.0]))
        .unwrap();
    assert_eq!(y.to_vec(), vec![-0.5, -1.0, 3.0, 4.0]);
}

proptest! {
    #[test]
    fn activation_identities(x in -30.0f32..30.0, alpha in 0.01f32..3.0) {
        let blob = WeightBlob::default();
        let run = |a: Activation| a.forward(&blob, HostTensor::from_vec(vec![x])).unwrap().to_vec()[0];

        prop_assert_eq!(run(Activation::relu(0.0, 1, false)), x.max(0.0));
        let elu = if x > 0.0 { x } else { alpha * (x.exp() - 1.0) };
        prop_assert!(approx(run(Activation::elu(alpha, 1, true)), elu, 1e-5));
        let sig = 0.5 * (0.5 * x).tanh() + 0.5;
        prop_assert!((run(Activation::sigmoid(1, false)) - sig).abs() < 1e-5);
        prop_assert!(approx(run(Activation::tanh(1, false)), x.tanh(), 1e-6));
    }
}

// BatchNorm

proptest! {
    #[test]
    fn batchnorm_standardizes_each_channel(
        num in 1usize..4,
        channels in 1usize..4,
        spatial in 2usize..9,
        seed in any::<u64>(),
    ) {
        let blob = WeightBlob::default();
        let mut data = random(num * channels * spatial, seed);
        // spread the channels apart so normalization has work to do
        for (i, v) in data.iter_mut().enumerate() {
            let c = (i / spatial) % channels;
            *v = *v * (c + 1) as f32 + c as f32 * 10.0;
        }
        let bn = BatchNorm::new(num, channels, spatial, 0.0).unwrap();
        let y = bn.forward(&blob, HostTensor::from_vec(data)).unwrap();
        let (mean, var) = y.mean_var(num, channels, spatial).unwrap();
        for c in 0..channels {
            prop_assert!(mean[c].abs() < 1e-4, "mean[{}] = {}", c, mean[c]);
            prop_assert!((var[c] - 1.0).abs() < 1e-3, "var[{}] = {}", c, var[c]);
        }
    }
}

// Convolution

fn naive_conv(p: &ConvParams, out_hw: [usize; 2], x: &[f32], w: &[f32], bias: &[f32]) -> Vec<f32> {
    let [h, wd] = p.input_hw;
    let [oh, ow] = out_hw;
    let cin_g = p.in_channels / p.group;
    let cout_g = p.out_channels / p.group;
    let mut y = vec![0.0; p.num * p.out_channels * oh * ow];
    for n in 0..p.num {
        for co in 0..p.out_channels {
            let g = co / cout_g;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias[co];
                    for ci in 0..cin_g {
                        for ky in 0..p.kernel[0] {
                            for kx in 0..p.kernel[1] {
                                let iy = (oy * p.stride[0] + ky * p.dilation[0]) as isize
                                    - p.pad[0] as isize;
                                let ix = (ox * p.stride[1] + kx * p.dilation[1]) as isize
                                    - p.pad[1] as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= wd as isize {
                                    continue;
                                }
                                let c = g * cin_g + ci;
                                let xv = x[((n * p.in_channels + c) * h + iy as usize) * wd + ix as usize];
                                let wv = w[((co * cin_g + ci) * p.kernel[0] + ky) * p.kernel[1] + kx];
                                acc += xv * wv;
                            }
                        }
                    }
                    y[((n * p.out_channels + co) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    y
}

#[test]
fn convolution_matches_direct_definition() {
    let cases = [
        ConvParams::new(2, 3, [7, 6], 4, [3, 3]).with_pad([1, 1]),
        ConvParams::new(1, 4, [9, 9], 6, [3, 2])
            .with_stride([2, 1])
            .with_dilation([2, 1])
            .with_group(2),
        ConvParams::new(3, 2, [5, 5], 3, [1, 1]),
        ConvParams::new(1, 2, [6, 7], 2, [2, 2]).with_stride([2, 2]).with_pad([1, 0]),
    ];
    for (i, p) in cases.into_iter().enumerate() {
        let mut b = WeightBlobBuilder::new();
        let w = random(p.weight_len(), 10 + i as u64);
        let bias = random(p.out_channels, 20 + i as u64);
        let wr = b.push(&w);
        let br = b.push(&bias);
        let blob = b.finish();
        let conv = Convolution::new(p, wr, Some(br)).unwrap();
        let [_, _, oh, ow] = conv.output_shape();
        let x = random(p.num * p.in_channels * p.input_hw[0] * p.input_hw[1], 30 + i as u64);
        let got = conv.forward(&blob, HostTensor::from_slice(&x)).unwrap();
        assert_vec_approx(&got.to_vec(), &naive_conv(&p, [oh, ow], &x, &w, &bias), 1e-4);
    }
}

#[test]
fn deconvolution_is_the_adjoint_of_convolution() {
    let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    let cases = [
        // (conv params, input hw chosen so the sizes invert exactly)
        ConvParams::new(1, 2, [7, 7], 3, [3, 3]).with_stride([2, 2]).with_pad([1, 1]),
        ConvParams::new(2, 4, [6, 6], 2, [2, 2]).with_stride([2, 2]).with_group(2),
        ConvParams::new(1, 3, [5, 5], 2, [3, 3]).with_dilation([2, 2]),
        ConvParams::new(1, 2, [4, 4], 2, [1, 1]),
    ];
    for (i, p) in cases.into_iter().enumerate() {
        let mut b = WeightBlobBuilder::new();
        let wr = b.push(&random(p.weight_len(), 40 + i as u64));
        let blob = b.finish();
        let conv = Convolution::new(p, wr, None).unwrap();
        let [num, co, oh, ow] = conv.output_shape();

        // same weight array read as [C_in(deconv) = co, C_out / group, kh, kw]
        let dp = ConvParams {
            in_channels: co,
            out_channels: p.in_channels,
            input_hw: [oh, ow],
            ..p
        };
        let deconv = Deconvolution::new(dp, wr, None).unwrap();
        assert_eq!(deconv.output_shape(), [num, p.in_channels, p.input_hw[0], p.input_hw[1]]);

        let x = random(p.num * p.in_channels * p.input_hw[0] * p.input_hw[1], 50 + i as u64);
        let y = random(num * co * oh * ow, 60 + i as u64);
        let cx = conv.forward(&blob, HostTensor::from_slice(&x)).unwrap();
        let dy = deconv.forward(&blob, HostTensor::from_slice(&y)).unwrap();
        let lhs = dot(cx.as_slice(), &y);
        let rhs = dot(&x, dy.as_slice());
        assert!(approx(lhs, rhs, 1e-4), "case {i}: {lhs} vs {rhs}");
    }
}

#[test]
fn buffer_form_matches_tensor_form_for_convolution() {
    let p = ConvParams::new(2, 2, [4, 4], 3, [3, 3]).with_pad([1, 1]);
    let mut b = WeightBlobBuilder::new();
    let wr = b.push(&random(p.weight_len(), 70));
    let blob = b.finish();
    let conv = Convolution::new(p, wr, None).unwrap();
    let x = random(64, 71);
    let mut out = vec![0.0f32; conv.output_count()];
    conv.forward_buffers(&blob, &[&x[..]], &mut [&mut out[..]]).unwrap();
    let t = conv.forward(&blob, HostTensor::from_slice(&x)).unwrap();
    assert_eq!(t.to_vec(), out);
}

proptest! {
    #[test]
    fn deconvolution_inverts_convolution_size(
        out_len in 1usize..7,
        kernel in 1usize..5,
        stride in 1usize..4,
        dilation in 1usize..3,
        pad in 0usize..3,
    ) {
        let eff = dilation * (kernel - 1) + 1;
        let grown = (out_len - 1) * stride + eff;
        prop_assume!(grown > 2 * pad);
        let h = grown - 2 * pad;

        let p = ConvParams::new(1, 2, [h, h], 3, [kernel, kernel])
            .with_stride([stride, stride])
            .with_pad([pad, pad])
            .with_dilation([dilation, dilation]);
        let conv = Convolution::new(p, WeightRef::new(0, p.weight_len()), None).unwrap();
        let [_, co, oh, ow] = conv.output_shape();
        prop_assert_eq!((oh, ow), (out_len, out_len));

        let dp = ConvParams { in_channels: co, out_channels: 2, input_hw: [oh, ow], ..p };
        let deconv = Deconvolution::new(dp, WeightRef::new(0, dp.out_channels * co * kernel * kernel), None).unwrap();
        prop_assert_eq!(deconv.output_shape(), [1, 2, h, h]);
    }
}

// Recurrent cells

fn zero_weight_cell(b: &mut WeightBlobBuilder, kind: CellKind, input: usize, hidden: usize) -> CellWeights {
    let rows = kind.gates() * hidden;
    let bias: Vec<f32> = (0..rows).map(|i| 0.1 * i as f32 - 0.3).collect();
    CellWeights {
        w_ih: b.push(&vec![0.0; rows * input]),
        w_hh: b.push(&vec![0.0; rows * hidden]),
        b_ih: Some(b.push(&bias)),
        b_hh: Some(b.push(&bias)),
    }
}

proptest! {
    #[test]
    fn zero_weight_cells_emit_bias_only_constant(x in -50.0f32..50.0) {
        let hidden = 2;
        let mut b = WeightBlobBuilder::new();
        let gru_w = zero_weight_cell(&mut b, CellKind::Gru, 3, hidden);
        let lstm_w = zero_weight_cell(&mut b, CellKind::Lstm, 3, hidden);
        let blob = b.finish();
        let bias = |k: usize| 2.0 * (0.1 * k as f32 - 0.3);
        let input = [x; 3];

        let gru = RnnCell::new(CellKind::Gru, 1, 3, hidden, gru_w).unwrap();
        let mut state = [0.0f32; 2];
        let mut out = [0.0f32; 2];
        gru.step(&blob, &input, &mut state, &mut out, hidden).unwrap();
        for j in 0..hidden {
            let r = sigmoid(bias(j));
            let z = sigmoid(bias(hidden + j));
            let bn = 0.1 * (2 * hidden + j) as f32 - 0.3;
            let n = (bn + r * bn).tanh();
            prop_assert!(approx(out[j], (1.0 - z) * n, 1e-5));
        }

        let lstm = RnnCell::new(CellKind::Lstm, 1, 3, hidden, lstm_w).unwrap();
        let mut state = [0.0f32; 4];
        let mut out = [0.0f32; 2];
        lstm.step(&blob, &input, &mut state, &mut out, hidden).unwrap();
        for j in 0..hidden {
            let i = sigmoid(bias(j));
            let g = bias(2 * hidden + j).tanh();
            let o = sigmoid(bias(3 * hidden + j));
            let c = i * g;
            prop_assert!(approx(state[hidden + j], c, 1e-5));
            prop_assert!(approx(out[j], o * c.tanh(), 1e-5));
        }
    }
}

#[test]
fn bidirectional_stack_shapes() {
    let mut b = WeightBlobBuilder::new();
    let (batch, input, hidden, seq) = (2, 3, 4, 5);
    let fw = zero_weight_cell(&mut b, CellKind::Lstm, input, hidden);
    let rv = zero_weight_cell(&mut b, CellKind::Lstm, input, hidden);
    let top = zero_weight_cell(&mut b, CellKind::Lstm, 2 * hidden, 1);
    let blob = b.finish();
    let stack = StackedRnn::new(
        vec![
            RnnLayer::bidirectional(
                RnnCell::new(CellKind::Lstm, batch, input, hidden, fw).unwrap(),
                RnnCell::new(CellKind::Lstm, batch, input, hidden, rv).unwrap(),
            )
            .unwrap(),
            RnnLayer::unidirectional(RnnCell::new(CellKind::Lstm, batch, 2 * hidden, 1, top).unwrap()),
        ],
        seq,
    )
    .unwrap();
    let mut states = stack.initial_state();
    assert_eq!(states[0].count(), 2 * batch * 2 * hidden);
    let y = stack
        .forward_with_state(&blob, &random(seq * batch * input, 80), &mut states)
        .unwrap();
    assert_eq!(y.count(), seq * batch);
    assert!(y.as_slice().iter().all(|v| v.is_finite()));
}

// Fan-out / fan-in

proptest! {
    #[test]
    fn split_then_sum_doubles(data in proptest::collection::vec(-1e3f32..1e3, 1..32)) {
        let blob = WeightBlob::default();
        let n = data.len();
        let split = Operator::from(Split::new(n, 2).unwrap());
        let sum = Operator::from(Eltwise::sum(n, 2).unwrap());
        let branches = split.execute(&blob, vec![HostTensor::from_slice(&data)]).unwrap();
        let y = sum.execute(&blob, branches).unwrap();
        let want: Vec<f32> = data.iter().map(|v| 2.0 * v).collect();
        prop_assert_eq!(y[0].to_vec(), want);
    }
}
