/// Per-round divergence and conflict statistics across client encoder
/// deltas. Derived and display-only: nothing here feeds back into training.

use serde::{Deserialize, Serialize};

use crate::error::{AggregateError, Result};
use crate::tensor::{dot_f32, vec_norm_f32};
use crate::weightmap::{delta, flatten, WeightMap};

const EPS: f32 = 1e-8;

/// Divergence record for one round. All statistics are over the flattened
/// per-client encoder deltas (current − last).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundDiagnostics {
    /// Norm of the cross-client mean delta.
    pub mean_delta_norm: f32,
    /// Mean per-client delta norm.
    pub mean_client_delta_norm: f32,
    /// Mean distance of each client's delta to the mean delta.
    pub mean_dist_to_mean: f32,
    /// Mean pairwise cosine over all unordered client pairs.
    pub mean_cosine: f32,
    /// Fraction of unordered pairs with negative cosine (conflicting pairs).
    pub frac_negative_cosine: f32,
}

impl RoundDiagnostics {
    /// Statistics from flattened per-client deltas. Fewer than 2 clients
    /// yields the degenerate record (zero divergence, cosine 1), never an
    /// error — a single-client federation is a valid configuration.
    pub fn from_deltas(deltas: &[Vec<f32>]) -> Self {
        let n = deltas.len();
        if n < 2 {
            let norm = deltas.first().map(|d| vec_norm_f32(d)).unwrap_or(0.0);
            return RoundDiagnostics {
                mean_delta_norm: norm,
                mean_client_delta_norm: norm,
                mean_dist_to_mean: 0.0,
                mean_cosine: 1.0,
                frac_negative_cosine: 0.0,
            };
        }

        let dim = deltas[0].len();
        let mut mean = vec![0.0f32; dim];
        for d in deltas {
            debug_assert_eq!(d.len(), dim);
            for (m, &x) in mean.iter_mut().zip(d) {
                *m += x / n as f32;
            }
        }

        let mean_delta_norm = vec_norm_f32(&mean);
        let mean_client_delta_norm =
            deltas.iter().map(|d| vec_norm_f32(d)).sum::<f32>() / n as f32;

        let mut dist_sum = 0.0f32;
        for d in deltas {
            let dist: f32 = d
                .iter()
                .zip(&mean)
                .map(|(x, m)| (x - m) * (x - m))
                .sum::<f32>()
                .sqrt();
            dist_sum += dist;
        }
        let mean_dist_to_mean = dist_sum / n as f32;

        let mut cos_sum = 0.0f32;
        let mut neg = 0usize;
        let mut pairs = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                let cos = dot_f32(&deltas[i], &deltas[j])
                    / (vec_norm_f32(&deltas[i]) * vec_norm_f32(&deltas[j]) + EPS);
                cos_sum += cos;
                if cos < 0.0 {
                    neg += 1;
                }
                pairs += 1;
            }
        }

        RoundDiagnostics {
            mean_delta_norm,
            mean_client_delta_norm,
            mean_dist_to_mean,
            mean_cosine: cos_sum / pairs as f32,
            frac_negative_cosine: neg as f32 / pairs as f32,
        }
    }

    /// Statistics from two checkpoint snapshots, over encoder keys only.
    /// The encoder key set of each client's current checkpoint defines that
    /// client's delta; disagreement between its current and last snapshots,
    /// or between clients' flattened delta lengths, is a shape error.
    pub fn from_checkpoints(current: &[WeightMap], last: &[WeightMap]) -> Result<Self> {
        debug_assert_eq!(current.len(), last.len());
        let mut deltas: Vec<Vec<f32>> = Vec::with_capacity(current.len());
        for (cur, prev) in current.iter().zip(last) {
            let keys = cur.encoder_keys();
            let d = delta(cur, prev, &keys)?;
            let flat = flatten(&d, &keys)?;
            if let Some(first) = deltas.first() {
                if flat.len() != first.len() {
                    return Err(AggregateError::ShapeMismatch {
                        key: String::new(),
                        detail: format!(
                            "encoder delta length {} vs {} across clients",
                            flat.len(),
                            first.len()
                        ),
                    });
                }
            }
            deltas.push(flat);
        }
        Ok(Self::from_deltas(&deltas))
    }
}
