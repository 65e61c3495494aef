/// Radial basis function grid over the `(bw_in, bw_out)` plane of one address.
///
/// Bandwidth is normalized by the scope quota of each direction, so grid points lie on
/// `{0, 1/d, …, 1}²` for divisor `d`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rbf {
    divisor: usize,
    sigma: f64,
}

impl Rbf {
    pub(crate) fn new(divisor: usize) -> Self {
        Self { divisor, sigma: 0.5 / (divisor as f64 + 1.0) }
    }

    /// Features per address.
    #[inline]
    pub(crate) const fn block_len(&self) -> usize {
        (self.divisor + 1) * (self.divisor + 1)
    }

    /// Writes the features of `(bw_in, bw_out)` under `quota` into `block`.
    pub(crate) fn encode(&self, block: &mut [f64], (bw_in, bw_out): (u32, u32), quota: (u64, u64)) {
        let x = normalize(bw_in, quota.0);
        let y = normalize(bw_out, quota.1);
        let step = 1.0 / self.divisor as f64;
        let denominator = 2.0 * self.sigma * self.sigma;

        for (k, feature) in block.iter_mut().enumerate().take(self.block_len()) {
            let gx = (k / (self.divisor + 1)) as f64 * step;
            let gy = (k % (self.divisor + 1)) as f64 * step;
            let dist = (x - gx).powi(2) + (y - gy).powi(2);
            *feature = (-dist / denominator).exp();
        }
    }
}

/// `bw / quota`, capped at 1.
#[inline]
fn normalize(bw: u32, quota: u64) -> f64 {
    if quota == 0 {
        return 1.0;
    }
    (bw as f64 / quota as f64).min(1.0)
}
