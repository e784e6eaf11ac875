// Per-channel statistics over [num, channels, spatial] buffers.
//
// Both moments are computed as two mat-vec reductions against constant
// vectors of ones: first every (sample, channel) row is averaged over its
// spatial extent, then the per-sample rows are summed over the batch. The
// ones vectors and the intermediate buffers are allocated once so repeated
// calls (one per forward pass) do not allocate.

use crate::blas::{gemv, Transpose};

/// Reusable scratch for per-channel mean / variance reductions.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    num: usize,
    channels: usize,
    spatial: usize,
    spatial_ones: Vec<f32>,
    batch_ones: Vec<f32>,
    num_by_chans: Vec<f32>,
    squared: Vec<f32>,
}

impl ChannelStats {
    pub fn new(num: usize, channels: usize, spatial: usize) -> Self {
        ChannelStats {
            num,
            channels,
            spatial,
            spatial_ones: vec![1.0; spatial],
            batch_ones: vec![1.0; num],
            num_by_chans: vec![0.0; num * channels],
            squared: vec![0.0; num * channels * spatial],
        }
    }

    pub fn count(&self) -> usize {
        self.num * self.channels * self.spatial
    }

    /// Per-channel mean of `data` into `mean[channels]`.
    pub fn mean(&mut self, data: &[f32], mean: &mut [f32]) {
        let (num, channels, spatial) = (self.num, self.channels, self.spatial);
        if num * spatial == 0 {
            mean.fill(0.0);
            return;
        }
        let scale = 1.0 / (num * spatial) as f32;
        gemv(
            Transpose::No,
            num * channels,
            spatial,
            scale,
            data,
            &self.spatial_ones,
            0.0,
            &mut self.num_by_chans,
        );
        gemv(
            Transpose::Yes,
            num,
            channels,
            1.0,
            &self.num_by_chans,
            &self.batch_ones,
            0.0,
            mean,
        );
    }

    /// Per-channel mean of `data^2`. On mean-centred data this is the
    /// biased variance.
    pub fn mean_of_squares(&mut self, data: &[f32], out: &mut [f32]) {
        let mut squared = std::mem::take(&mut self.squared);
        for (s, &x) in squared.iter_mut().zip(data) {
            *s = x * x;
        }
        self.mean(&squared, out);
        self.squared = squared;
    }

    /// Mean and biased variance `E[(x - mean)^2]` per channel.
    pub fn mean_var(&mut self, data: &[f32], mean: &mut [f32], var: &mut [f32]) {
        self.mean(data, mean);
        let spatial = self.spatial.max(1);
        let channels = self.channels.max(1);
        let mut squared = std::mem::take(&mut self.squared);
        for (i, (s, &x)) in squared.iter_mut().zip(data).enumerate() {
            let d = x - mean[(i / spatial) % channels];
            *s = d * d;
        }
        self.mean(&squared, var);
        self.squared = squared;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_samples_two_channels() {
        // sample 0: ch0 = [1, 3], ch1 = [0, 0]
        // sample 1: ch0 = [5, 7], ch1 = [2, 2]
        let data = [1.0, 3.0, 0.0, 0.0, 5.0, 7.0, 2.0, 2.0];
        let mut stats = ChannelStats::new(2, 2, 2);
        let mut mean = [0.0; 2];
        let mut var = [0.0; 2];
        stats.mean_var(&data, &mut mean, &mut var);
        assert_eq!(mean, [4.0, 1.0]);
        assert_eq!(var, [5.0, 1.0]);
    }
}
