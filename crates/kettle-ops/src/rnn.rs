// Recurrent layers — GRU / LSTM cells, uni- and bidirectional layers, stacks
//
// LAYOUT:
//   sequence     [seq_len, batch, features]
//   GRU state    [batch, H]
//   LSTM state   [batch, 2H]   h then c
//   bidi state   [2, batch, state]   forward direction first
//   bidi output  [seq_len, batch, 2H]   forward half then reverse half
//
// ONE STEP:
//   gi = W_ih * x + b_ih          [batch, G*H]
//   gh = W_hh * h + b_hh          [batch, G*H]
//
//   GRU (G = 3; reset, update, new):
//     r  = sigmoid(gi_r + gh_r)
//     z  = sigmoid(gi_z + gh_z)
//     n  = tanh(gi_n + r * gh_n)
//     h' = (1 - z) * n + z * h
//
//   LSTM (G = 4; input, forget, cell, output):
//     i, f, o = sigmoid(gi + gh)
//     g       = tanh(gi_g + gh_g)
//     c'      = f * c + i * g
//     h'      = o * tanh(c')
//
// A stacked RNN feeds each layer the whole output sequence of the layer
// below; every layer keeps its own state tensor.

use std::cell::RefCell;

use kettle_core::blas::{gemv, Transpose};
use kettle_core::{Error, HostTensor, Result, WeightBlob, WeightRef};

#[cfg(feature = "cuda")]
use kettle_cuda::{DeviceContext, DeviceTensor, DeviceWeights, KernelArg, KernelLaunch, MathKernel};

use crate::module::{check_arity, check_param, Forward};

const OP: &str = "rnn";

/// Which recurrence a cell computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Gru,
    Lstm,
}

impl CellKind {
    /// Gates stacked in the weight matrices.
    pub fn gates(self) -> usize {
        match self {
            CellKind::Gru => 3,
            CellKind::Lstm => 4,
        }
    }

    /// State width in units of the hidden size.
    pub fn state_factor(self) -> usize {
        match self {
            CellKind::Gru => 1,
            CellKind::Lstm => 2,
        }
    }
}

/// Parameters of one cell. `w_ih` is `[G*H, input]`, `w_hh` is `[G*H, H]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellWeights {
    pub w_ih: WeightRef,
    pub w_hh: WeightRef,
    pub b_ih: Option<WeightRef>,
    pub b_hh: Option<WeightRef>,
}

#[derive(Debug)]
struct GateScratch {
    gi: Vec<f32>,
    gh: Vec<f32>,
}

/// One GRU or LSTM cell for a fixed batch size.
#[derive(Debug)]
pub struct RnnCell {
    kind: CellKind,
    batch: usize,
    input_dim: usize,
    hidden: usize,
    params: CellWeights,
    scratch: RefCell<GateScratch>,
}

impl RnnCell {
    pub fn new(
        kind: CellKind,
        batch: usize,
        input_dim: usize,
        hidden: usize,
        params: CellWeights,
    ) -> Result<Self> {
        if batch == 0 || input_dim == 0 || hidden == 0 {
            return Err(Error::invalid(OP, "batch, input and hidden sizes must be non-zero"));
        }
        let rows = kind.gates() * hidden;
        check_param(OP, "w_ih", Some(params.w_ih), rows * input_dim)?;
        check_param(OP, "w_hh", Some(params.w_hh), rows * hidden)?;
        check_param(OP, "b_ih", params.b_ih, rows)?;
        check_param(OP, "b_hh", params.b_hh, rows)?;
        tracing::debug!(?kind, batch, input_dim, hidden, "rnn cell");
        Ok(RnnCell {
            kind,
            batch,
            input_dim,
            hidden,
            params,
            scratch: RefCell::new(GateScratch {
                gi: vec![0.0; batch * rows],
                gh: vec![0.0; batch * rows],
            }),
        })
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Elements in this cell's state tensor.
    pub fn state_len(&self) -> usize {
        self.batch * self.kind.state_factor() * self.hidden
    }

    /// Advance one timestep. `x` is `[batch, input]`; `state` is updated in
    /// place and the new `h` of sample `b` lands at `out[b * out_stride..]`.
    pub fn step(
        &self,
        weights: &WeightBlob,
        x: &[f32],
        state: &mut [f32],
        out: &mut [f32],
        out_stride: usize,
    ) -> Result<()> {
        kettle_core::ensure_count!(self.batch * self.input_dim, x.len());
        kettle_core::ensure_count!(self.state_len(), state.len());
        let (h, g) = (self.hidden, self.kind.gates());
        let rows = g * h;
        let out_needed = (self.batch - 1) * out_stride + h;
        if out.len() < out_needed {
            return Err(Error::CountMismatch {
                expected: out_needed,
                got: out.len(),
            });
        }
        let w_ih = weights.get(self.params.w_ih)?;
        let w_hh = weights.get(self.params.w_hh)?;
        let b_ih = weights.get_opt(self.params.b_ih)?;
        let b_hh = weights.get_opt(self.params.b_hh)?;
        let state_width = self.kind.state_factor() * h;

        let mut scratch = self.scratch.borrow_mut();
        let GateScratch { gi, gh } = &mut *scratch;
        for b in 0..self.batch {
            let gi_b = &mut gi[b * rows..(b + 1) * rows];
            let gh_b = &mut gh[b * rows..(b + 1) * rows];
            seed_bias(gi_b, b_ih);
            seed_bias(gh_b, b_hh);
            let beta = |bias: Option<&[f32]>| if bias.is_some() { 1.0 } else { 0.0 };
            let x_b = &x[b * self.input_dim..(b + 1) * self.input_dim];
            gemv(Transpose::No, rows, self.input_dim, 1.0, w_ih, x_b, beta(b_ih), gi_b);
            let h_b = &state[b * state_width..b * state_width + h];
            gemv(Transpose::No, rows, h, 1.0, w_hh, h_b, beta(b_hh), gh_b);
        }

        for b in 0..self.batch {
            let gi_b = &gi[b * rows..(b + 1) * rows];
            let gh_b = &gh[b * rows..(b + 1) * rows];
            let s = &mut state[b * state_width..(b + 1) * state_width];
            let o = &mut out[b * out_stride..b * out_stride + h];
            match self.kind {
                CellKind::Gru => {
                    for j in 0..h {
                        let r = sigmoid(gi_b[j] + gh_b[j]);
                        let z = sigmoid(gi_b[h + j] + gh_b[h + j]);
                        let n = (gi_b[2 * h + j] + r * gh_b[2 * h + j]).tanh();
                        let v = (1.0 - z) * n + z * s[j];
                        s[j] = v;
                        o[j] = v;
                    }
                }
                CellKind::Lstm => {
                    for j in 0..h {
                        let i = sigmoid(gi_b[j] + gh_b[j]);
                        let f = sigmoid(gi_b[h + j] + gh_b[h + j]);
                        let gg = (gi_b[2 * h + j] + gh_b[2 * h + j]).tanh();
                        let og = sigmoid(gi_b[3 * h + j] + gh_b[3 * h + j]);
                        let c = f * s[h + j] + i * gg;
                        let hn = og * c.tanh();
                        s[h + j] = c;
                        s[j] = hn;
                        o[j] = hn;
                    }
                }
            }
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    #[allow(clippy::too_many_arguments)]
    fn step_device(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        x: u64,
        state: u64,
        out: u64,
        out_stride: usize,
        gi: &DeviceTensor<'_>,
        gh: &DeviceTensor<'_>,
    ) -> Result<()> {
        let (h, rows) = (self.hidden, self.kind.gates() * self.hidden);
        let b_ih = weights.ptr_opt(self.params.b_ih)?;
        let b_hh = weights.ptr_opt(self.params.b_hh)?;
        let n = rows * self.batch;
        ctx.enqueue(&KernelLaunch::math(
            MathKernel::Matvec,
            n,
            vec![
                KernelArg::Buffer(weights.ptr(self.params.w_ih)?),
                KernelArg::Buffer(x),
                KernelArg::Buffer(b_ih.unwrap_or(0)),
                KernelArg::Buffer(gi.device_ptr()),
                KernelArg::count(rows)?,
                KernelArg::count(self.input_dim)?,
                KernelArg::count(self.batch)?,
                KernelArg::count(self.input_dim)?,
                KernelArg::flag(b_ih.is_some()),
            ],
        )?)?;
        ctx.enqueue(&KernelLaunch::math(
            MathKernel::Matvec,
            n,
            vec![
                KernelArg::Buffer(weights.ptr(self.params.w_hh)?),
                KernelArg::Buffer(state),
                KernelArg::Buffer(b_hh.unwrap_or(0)),
                KernelArg::Buffer(gh.device_ptr()),
                KernelArg::count(rows)?,
                KernelArg::count(h)?,
                KernelArg::count(self.batch)?,
                KernelArg::count(self.kind.state_factor() * h)?,
                KernelArg::flag(b_hh.is_some()),
            ],
        )?)?;
        let gates = match self.kind {
            CellKind::Gru => MathKernel::GruGates,
            CellKind::Lstm => MathKernel::LstmGates,
        };
        ctx.enqueue(&KernelLaunch::math(
            gates,
            h * self.batch,
            vec![
                KernelArg::Buffer(gi.device_ptr()),
                KernelArg::Buffer(gh.device_ptr()),
                KernelArg::Buffer(state),
                KernelArg::Buffer(out),
                KernelArg::count(h)?,
                KernelArg::count(self.batch)?,
                KernelArg::count(out_stride)?,
            ],
        )?)
    }
}

fn seed_bias(dst: &mut [f32], bias: Option<&[f32]>) {
    if let Some(b) = bias {
        dst.copy_from_slice(b);
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One recurrent layer over a whole sequence.
#[derive(Debug)]
pub enum RnnLayer {
    Unidirectional(RnnCell),
    /// Two independently weighted cells; the second reads the sequence
    /// back to front.
    Bidirectional { forward: RnnCell, reverse: RnnCell },
}

impl RnnLayer {
    pub fn unidirectional(cell: RnnCell) -> Self {
        RnnLayer::Unidirectional(cell)
    }

    pub fn bidirectional(forward: RnnCell, reverse: RnnCell) -> Result<Self> {
        if forward.kind != reverse.kind
            || forward.batch != reverse.batch
            || forward.input_dim != reverse.input_dim
            || forward.hidden != reverse.hidden
        {
            return Err(Error::invalid(OP, "bidirectional cells must have identical shapes"));
        }
        Ok(RnnLayer::Bidirectional { forward, reverse })
    }

    fn cells(&self) -> Vec<&RnnCell> {
        match self {
            RnnLayer::Unidirectional(c) => vec![c],
            RnnLayer::Bidirectional { forward, reverse } => vec![forward, reverse],
        }
    }

    fn first(&self) -> &RnnCell {
        match self {
            RnnLayer::Unidirectional(c) => c,
            RnnLayer::Bidirectional { forward, .. } => forward,
        }
    }

    pub fn directions(&self) -> usize {
        match self {
            RnnLayer::Unidirectional(_) => 1,
            RnnLayer::Bidirectional { .. } => 2,
        }
    }

    pub fn kind(&self) -> CellKind {
        self.first().kind
    }

    pub fn batch(&self) -> usize {
        self.first().batch
    }

    pub fn input_dim(&self) -> usize {
        self.first().input_dim
    }

    /// Features per timestep and sample in the output sequence.
    pub fn output_dim(&self) -> usize {
        self.directions() * self.first().hidden
    }

    /// Elements of the layer's state tensor (all directions).
    pub fn state_len(&self) -> usize {
        self.directions() * self.first().state_len()
    }

    /// Run over `input` (`[seq_len, batch, input]`), carrying `state` and
    /// writing `[seq_len, batch, output_dim]` to `output`.
    pub fn forward(
        &self,
        weights: &WeightBlob,
        input: &[f32],
        state: &mut [f32],
        output: &mut [f32],
    ) -> Result<()> {
        let step_in = self.batch() * self.input_dim();
        let step_out = self.batch() * self.output_dim();
        if input.len() % step_in != 0 {
            return Err(Error::invalid(
                OP,
                format!("input of {} values is not a whole number of {step_in}-value steps", input.len()),
            ));
        }
        let seq_len = input.len() / step_in;
        kettle_core::ensure_count!(seq_len * step_out, output.len());
        kettle_core::ensure_count!(self.state_len(), state.len());

        let out_stride = self.output_dim();
        let cell_state = self.first().state_len();
        for (dir, (cell, s)) in self
            .cells()
            .into_iter()
            .zip(state.chunks_exact_mut(cell_state))
            .enumerate()
        {
            for step in 0..seq_len {
                let t = if dir == 0 { step } else { seq_len - 1 - step };
                let x = &input[t * step_in..(t + 1) * step_in];
                let o = &mut output[t * step_out + dir * cell.hidden..(t + 1) * step_out];
                cell.step(weights, x, s, o, out_stride)?;
            }
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn forward_device(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: &DeviceTensor<'_>,
        state: &DeviceTensor<'_>,
        output: &DeviceTensor<'_>,
        seq_len: usize,
    ) -> Result<()> {
        let step_in = self.batch() * self.input_dim();
        let step_out = self.batch() * self.output_dim();
        kettle_core::ensure_count!(seq_len * step_in, input.count());
        kettle_core::ensure_count!(seq_len * step_out, output.count());
        kettle_core::ensure_count!(self.state_len(), state.count());
        let rows = self.kind().gates() * self.first().hidden;
        let gi = DeviceTensor::zeros(ctx, self.batch() * rows)?;
        let gh = DeviceTensor::zeros(ctx, self.batch() * rows)?;
        for (dir, cell) in self.cells().into_iter().enumerate() {
            let s = state.ptr_at(dir * cell.state_len());
            for step in 0..seq_len {
                let t = if dir == 0 { step } else { seq_len - 1 - step };
                cell.step_device(
                    ctx,
                    weights,
                    input.ptr_at(t * step_in),
                    s,
                    output.ptr_at(t * step_out + dir * cell.hidden),
                    self.output_dim(),
                    &gi,
                    &gh,
                )?;
            }
        }
        Ok(())
    }
}

/// Layers chained bottom to top over a fixed-length sequence.
#[derive(Debug)]
pub struct StackedRnn {
    layers: Vec<RnnLayer>,
    seq_len: usize,
}

impl StackedRnn {
    pub fn new(layers: Vec<RnnLayer>, seq_len: usize) -> Result<Self> {
        if layers.is_empty() || seq_len == 0 {
            return Err(Error::invalid(OP, "a stack needs at least one layer and one timestep"));
        }
        for pair in layers.windows(2) {
            if pair[1].input_dim() != pair[0].output_dim() || pair[1].batch() != pair[0].batch() {
                return Err(Error::invalid(
                    OP,
                    format!(
                        "layer expects {} features, previous layer emits {}",
                        pair[1].input_dim(),
                        pair[0].output_dim()
                    ),
                ));
            }
        }
        tracing::debug!(layers = layers.len(), seq_len, "stacked rnn");
        Ok(StackedRnn { layers, seq_len })
    }

    pub fn layers(&self) -> &[RnnLayer] {
        &self.layers
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Fresh zeroed state tensors, one per layer.
    pub fn initial_state(&self) -> Vec<HostTensor<'static>> {
        self.layers.iter().map(|l| HostTensor::zeros(l.state_len())).collect()
    }

    /// Run the stack, carrying one state tensor per layer. The states hold
    /// the final hidden (and cell) values afterwards.
    pub fn forward_with_state(
        &self,
        weights: &WeightBlob,
        input: &[f32],
        states: &mut [HostTensor<'_>],
    ) -> Result<HostTensor<'static>> {
        check_arity(OP, self.layers.len(), states.len())?;
        let mut current = input.to_vec();
        for (layer, state) in self.layers.iter().zip(states.iter_mut()) {
            let mut next = vec![0.0; self.seq_len * layer.batch() * layer.output_dim()];
            layer.forward(weights, &current, state.as_mut_slice(), &mut next)?;
            current = next;
        }
        Ok(HostTensor::from_vec(current))
    }

    /// Device twin of [`forward_with_state`](Self::forward_with_state).
    #[cfg(feature = "cuda")]
    pub fn forward_device_with_state(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: &DeviceTensor<'_>,
        states: &mut [DeviceTensor<'_>],
    ) -> Result<DeviceTensor<'static>> {
        check_arity(OP, self.layers.len(), states.len())?;
        let mut current: Option<DeviceTensor<'static>> = None;
        for (layer, state) in self.layers.iter().zip(states.iter()) {
            let next =
                DeviceTensor::zeros(ctx, self.seq_len * layer.batch() * layer.output_dim())?;
            let src = current.as_ref().unwrap_or(input);
            layer.forward_device(ctx, weights, src, state, &next, self.seq_len)?;
            current = Some(next);
        }
        current.ok_or_else(|| Error::msg("stacked rnn has no layers"))
    }
}

impl Forward for StackedRnn {
    fn name(&self) -> &'static str {
        OP
    }

    fn output_count(&self) -> usize {
        self.layers
            .last()
            .map_or(0, |l| self.seq_len * l.batch() * l.output_dim())
    }

    /// Runs from a zero state.
    fn forward<'a>(&self, weights: &WeightBlob, input: HostTensor<'a>) -> Result<HostTensor<'a>> {
        let mut states = self.initial_state();
        self.forward_with_state(weights, input.as_slice(), &mut states)
    }

    /// `inputs` is the sequence alone (zero state) or the sequence followed
    /// by one state per layer. `outputs` is the output sequence, optionally
    /// followed by one buffer per layer receiving the final states.
    fn forward_buffers(
        &self,
        weights: &WeightBlob,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        let layers = self.layers.len();
        let (input, initial) = match inputs.split_first() {
            Some((input, rest)) if rest.is_empty() || rest.len() == layers => (*input, rest),
            _ => return Err(Error::ArityMismatch { op: OP, expected: 1 + layers, got: inputs.len() }),
        };
        let (output, finals) = match outputs.split_first_mut() {
            Some((output, rest)) if rest.is_empty() || rest.len() == layers => (output, rest),
            _ => return Err(Error::ArityMismatch { op: OP, expected: 1 + layers, got: outputs.len() }),
        };

        let mut states = self.initial_state();
        for (state, init) in states.iter_mut().zip(initial) {
            state.copy_data(&HostTensor::from_slice(init))?;
        }
        let result = self.forward_with_state(weights, input, &mut states)?;
        kettle_core::ensure_count!(result.count(), output.len());
        output.copy_from_slice(result.as_slice());
        for (dst, state) in finals.iter_mut().zip(&states) {
            kettle_core::ensure_count!(state.count(), dst.len());
            dst.copy_from_slice(state.as_slice());
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn forward_device<'a>(
        &self,
        ctx: &DeviceContext,
        weights: &DeviceWeights,
        input: DeviceTensor<'a>,
    ) -> Result<DeviceTensor<'a>> {
        let mut states = self
            .layers
            .iter()
            .map(|l| DeviceTensor::zeros(ctx, l.state_len()))
            .collect::<Result<Vec<_>>>()?;
        self.forward_device_with_state(ctx, weights, &input, &mut states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kettle_core::WeightBlobBuilder;

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    fn cell(b: &mut WeightBlobBuilder, kind: CellKind, input: usize, hidden: usize, w: f32) -> CellWeights {
        let rows = kind.gates() * hidden;
        CellWeights {
            w_ih: b.push(&vec![w; rows * input]),
            w_hh: b.push(&vec![w; rows * hidden]),
            b_ih: Some(b.push(&vec![0.1; rows])),
            b_hh: None,
        }
    }

    #[test]
    fn gru_step_by_hand() {
        let mut b = WeightBlobBuilder::new();
        let p = cell(&mut b, CellKind::Gru, 1, 1, 0.5);
        let blob = b.finish();
        let c = RnnCell::new(CellKind::Gru, 1, 1, 1, p).unwrap();
        let mut state = [0.2f32];
        let mut out = [0.0f32];
        c.step(&blob, &[1.0], &mut state, &mut out, 1).unwrap();

        let pre = 0.5 * 1.0 + 0.1;
        let r = sigmoid(pre + 0.5 * 0.2);
        let z = r;
        let n = (pre + r * (0.5 * 0.2)).tanh();
        let want = (1.0 - z) * n + z * 0.2;
        assert!(approx(state[0], want, 1e-6));
        assert_eq!(out[0], state[0]);
    }

    #[test]
    fn lstm_step_by_hand() {
        let mut b = WeightBlobBuilder::new();
        let p = cell(&mut b, CellKind::Lstm, 1, 1, 0.3);
        let blob = b.finish();
        let c = RnnCell::new(CellKind::Lstm, 1, 1, 1, p).unwrap();
        // h = 0.5, c = -0.25
        let mut state = [0.5f32, -0.25];
        let mut out = [0.0f32];
        c.step(&blob, &[2.0], &mut state, &mut out, 1).unwrap();

        let pre = 0.3 * 2.0 + 0.1 + 0.3 * 0.5;
        let (i, f, o) = (sigmoid(pre), sigmoid(pre), sigmoid(pre));
        let g = pre.tanh();
        let cn = f * -0.25 + i * g;
        let hn = o * cn.tanh();
        assert!(approx(state[1], cn, 1e-6));
        assert!(approx(state[0], hn, 1e-6));
        assert!(approx(out[0], hn, 1e-6));
    }

    #[test]
    fn bidirectional_reverse_reads_backwards() {
        let mut b = WeightBlobBuilder::new();
        let fwd = cell(&mut b, CellKind::Gru, 1, 1, 1.0);
        let rev = cell(&mut b, CellKind::Gru, 1, 1, 1.0);
        let blob = b.finish();
        let layer = RnnLayer::bidirectional(
            RnnCell::new(CellKind::Gru, 1, 1, 1, fwd).unwrap(),
            RnnCell::new(CellKind::Gru, 1, 1, 1, rev).unwrap(),
        )
        .unwrap();
        let input = [1.0, -1.0, 0.5];
        let mut state = [0.0f32; 2];
        let mut out = [0.0f32; 6];
        layer.forward(&blob, &input, &mut state, &mut out).unwrap();

        // identical weights: the reverse pass over x equals the forward pass
        // over reversed x
        let single = RnnLayer::unidirectional(RnnCell::new(CellKind::Gru, 1, 1, 1, fwd).unwrap());
        let reversed = [0.5, -1.0, 1.0];
        let mut s = [0.0f32];
        let mut o = [0.0f32; 3];
        single.forward(&blob, &reversed, &mut s, &mut o).unwrap();
        for t in 0..3 {
            assert!(approx(out[t * 2 + 1], o[2 - t], 1e-6));
        }
        assert!(approx(state[1], o[2], 1e-6));
        assert!(approx(state[0], out[4], 1e-6));
    }

    #[test]
    fn stack_checks_layer_chaining() {
        let mut b = WeightBlobBuilder::new();
        let p1 = cell(&mut b, CellKind::Lstm, 3, 2, 0.0);
        let p2 = cell(&mut b, CellKind::Lstm, 4, 2, 0.0);
        let l1 = RnnLayer::unidirectional(RnnCell::new(CellKind::Lstm, 1, 3, 2, p1).unwrap());
        let l2 = RnnLayer::unidirectional(RnnCell::new(CellKind::Lstm, 1, 4, 2, p2).unwrap());
        assert!(StackedRnn::new(vec![l1, l2], 5).is_err());
        assert!(StackedRnn::new(vec![], 5).is_err());
    }

    #[test]
    fn stacked_forward_updates_every_state() {
        let mut b = WeightBlobBuilder::new();
        let p1 = cell(&mut b, CellKind::Gru, 2, 3, 0.2);
        let p2 = cell(&mut b, CellKind::Gru, 3, 1, -0.4);
        let blob = b.finish();
        let stack = StackedRnn::new(
            vec![
                RnnLayer::unidirectional(RnnCell::new(CellKind::Gru, 2, 2, 3, p1).unwrap()),
                RnnLayer::unidirectional(RnnCell::new(CellKind::Gru, 2, 3, 1, p2).unwrap()),
            ],
            4,
        )
        .unwrap();
        let input: Vec<f32> = (0..16).map(|i| i as f32 * 0.1).collect();
        let mut states = stack.initial_state();
        let out = stack.forward_with_state(&blob, &input, &mut states).unwrap();
        assert_eq!(out.count(), stack.output_count());
        assert_eq!(out.count(), 4 * 2);
        // final state of the top layer is the last timestep's output
        assert_eq!(states[1].as_slice(), &out.as_slice()[6..8]);
        assert!(states[0].as_slice().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn buffer_form_reports_final_states() {
        let mut b = WeightBlobBuilder::new();
        let p = cell(&mut b, CellKind::Lstm, 1, 1, 0.5);
        let blob = b.finish();
        let stack = StackedRnn::new(
            vec![RnnLayer::unidirectional(RnnCell::new(CellKind::Lstm, 1, 1, 1, p).unwrap())],
            2,
        )
        .unwrap();
        let input = [1.0f32, 2.0];
        let init = [0.0f32, 0.0];
        let mut out = [0.0f32; 2];
        let mut fin = [0.0f32; 2];
        stack
            .forward_buffers(&blob, &[&input[..], &init[..]], &mut [&mut out[..], &mut fin[..]])
            .unwrap();
        assert_eq!(fin[0], out[1]);
        let t = stack.forward(&blob, HostTensor::from_slice(&input)).unwrap();
        assert_eq!(t.to_vec(), out.to_vec());
    }
}
