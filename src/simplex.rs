/// Probability-simplex machinery for conflict-averse weighting.
///
/// Two pieces: the exact Euclidean projection onto {w : w ≥ 0, Σw = 1}
/// (sort-and-threshold, Duchi et al. 2008) and a projected-gradient solver
/// for the conflict-averse objective over the simplex. Both run in f64: the
/// problem size is the client count, so precision costs nothing, and the
/// projection carries a 1e-9 sum contract.

const EPS: f64 = 1e-8;

/// Euclidean projection of `v` onto the probability simplex.
///
/// O(n log n): sort descending, find the threshold support, clamp. Output is
/// non-negative, sums to 1 within 1e-9, and is the nearest such point.
pub fn project_to_simplex(v: &[f64]) -> Vec<f64> {
    let n = v.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }

    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    // Largest j (1-indexed) with sorted[j-1] - (cumsum_j - 1)/j > 0.
    let mut cumsum = 0.0f64;
    let mut theta = 0.0f64;
    for (j, &u) in sorted.iter().enumerate() {
        cumsum += u;
        let t = (cumsum - 1.0) / (j + 1) as f64;
        if u - t > 0.0 {
            theta = t;
        }
    }

    v.iter().map(|&x| (x - theta).max(0.0)).collect()
}

/// Projected-gradient descent for the conflict-averse weight problem:
///
///   min_w  ⟨w, A·b̄⟩ + c·√(wᵀAw + ε)   over the simplex,
///
/// where `gram` is the N×N row-major Gram matrix A of client deltas and b̄
/// is the uniform weight vector (so the linear term is A's row mean).
///
/// Step size halves on non-improvement and grows on acceptance; iteration
/// stops on L1 step convergence or the iteration budget. Deterministic for
/// a given (A, c): uniform start, no randomness.
pub fn solve_simplex_projected_gd(
    gram: &[f64],
    n: usize,
    c: f64,
    max_iters: usize,
    tol: f64,
) -> Vec<f64> {
    debug_assert_eq!(gram.len(), n * n);
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }

    // Linear term: A·b̄ = row means of the Gram matrix.
    let lin: Vec<f64> = (0..n)
        .map(|i| gram[i * n..(i + 1) * n].iter().sum::<f64>() / n as f64)
        .collect();

    let objective = |w: &[f64]| -> f64 {
        let mut linear = 0.0;
        let mut quad = 0.0;
        for i in 0..n {
            linear += w[i] * lin[i];
            let mut aw = 0.0;
            for j in 0..n {
                aw += gram[i * n + j] * w[j];
            }
            quad += w[i] * aw;
        }
        linear + c * (quad + EPS).sqrt()
    };

    let mut w = vec![1.0 / n as f64; n];
    let mut f_w = objective(&w);
    let mut step = 0.5f64;

    for _ in 0..max_iters {
        // ∇f = lin + c·Aw/√(wᵀAw + ε)
        let mut aw = vec![0.0f64; n];
        let mut quad = 0.0f64;
        for i in 0..n {
            for j in 0..n {
                aw[i] += gram[i * n + j] * w[j];
            }
            quad += w[i] * aw[i];
        }
        let denom = (quad + EPS).sqrt();
        let grad: Vec<f64> = (0..n).map(|i| lin[i] + c * aw[i] / denom).collect();

        let trial: Vec<f64> = (0..n).map(|i| w[i] - step * grad[i]).collect();
        let candidate = project_to_simplex(&trial);
        let f_cand = objective(&candidate);

        if f_cand <= f_w {
            let moved: f64 = candidate
                .iter()
                .zip(&w)
                .map(|(a, b)| (a - b).abs())
                .sum();
            w = candidate;
            f_w = f_cand;
            step *= 1.2;
            if moved < tol {
                break;
            }
        } else {
            step *= 0.5;
            if step < 1e-12 {
                break;
            }
        }
    }

    w
}
