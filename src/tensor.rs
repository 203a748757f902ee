/// Flat f32 tensor helpers shared by aggregation, diagnostics, and the
/// hyperweight policies.
///
/// All operations are free functions on flat f32 slices with explicit
/// dimensions. Row-major layout throughout. Checkpoint math never needs
/// more structure than this: every parameter set is flattened to one
/// contiguous vector before any cross-client arithmetic.

/// Dot product of two equal-length vectors.
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Element-wise subtract: out[i] = a[i] - b[i].
pub fn sub_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] - b[i];
    }
}

/// Accumulate a scaled vector: out[i] += scalar * a[i].
pub fn axpy_f32(scalar: f32, a: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] += scalar * a[i];
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements. Numerically stable (max-subtracted).
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Mean over the rows of a [rows, cols] matrix: out[j] = mean_i(a[i, j]).
pub fn mean_rows_f32(a: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(a.len(), rows * cols);
    debug_assert_eq!(out.len(), cols);
    for x in out.iter_mut() {
        *x = 0.0;
    }
    if rows == 0 {
        return;
    }
    let inv = 1.0 / rows as f32;
    for r in 0..rows {
        for c in 0..cols {
            out[c] += a[r * cols + c] * inv;
        }
    }
}

/// Simple xorshift64 PRNG for deterministic parameter init and test data.
/// Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_orthogonal() {
        assert_eq!(dot_f32(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(dot_f32(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }

    #[test]
    fn test_softmax_uniform_row() {
        let scores = [0.0f32, 0.0, 0.0];
        let mut out = [0.0f32; 3];
        softmax_f32(&scores, &mut out, 1, 3);
        for v in out {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mean_rows() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let mut out = [0.0f32; 2];
        mean_rows_f32(&a, &mut out, 2, 2);
        assert_eq!(out, [2.0, 3.0]);
    }

    #[test]
    fn test_rng_deterministic() {
        let mut a = SimpleRng::new(42);
        let mut b = SimpleRng::new(42);
        for _ in 0..16 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }
}
