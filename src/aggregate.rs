/// Per-round encoder/decoder combination strategies.
///
/// Consumes the fully-materialized current/previous checkpoint snapshots,
/// stages one aggregated checkpoint per client, and commits by reloading
/// every client only after every branch has succeeded. The only tensors
/// that outlive the call are the explicit clones placed into the
/// Hyperweight caches; everything else is function-local and dropped at
/// return (ownership does the round-arena bookkeeping).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{group_signature, TrainClient};
use crate::error::{AggregateError, Result};
use crate::hyperweight::{DecCache, EncCache, Hyperweight};
use crate::simplex::solve_simplex_projected_gd;
use crate::tensor::vec_norm_f32;
use crate::weightmap::{
    abs_decoder_key, flatten, mean_soup, rel_decoder_key, shapes_of, unflatten, WeightMap,
};

const EPS: f32 = 1e-8;
const SOLVER_MAX_ITERS: usize = 64;
const SOLVER_TOL: f64 = 1e-8;

/// Encoder combination strategy. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderAgg {
    None,
    FedAvg,
    ConflictAverse,
}

/// Decoder combination strategy. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderAgg {
    None,
    FedAvg,
    CrossAttention,
}

/// One round's aggregation settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub encoder: EncoderAgg,
    pub decoder: DecoderAgg,
    /// Conflict-averse coefficient C ≥ 0. C = 0 degenerates toward the
    /// plain cross-client mean delta.
    pub coeff_c: f32,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        AggregateConfig {
            encoder: EncoderAgg::ConflictAverse,
            decoder: DecoderAgg::CrossAttention,
            coeff_c: 0.5,
        }
    }
}

/// Run one round of aggregation and commit the results to the clients.
///
/// `current`/`previous` are the post-training and pre-round checkpoint
/// snapshots, index-aligned with `clients`. Returns the staged per-client
/// aggregated checkpoints (the same maps the clients were reloaded from).
/// Any error is raised before a single client is touched.
pub fn aggregate_round(
    clients: &mut [Box<dyn TrainClient>],
    current: &[WeightMap],
    previous: &[WeightMap],
    mut hyper: Option<&mut Hyperweight>,
    cfg: &AggregateConfig,
) -> Result<Vec<WeightMap>> {
    assert!(cfg.coeff_c >= 0.0, "coefficient C must be non-negative");
    debug_assert_eq!(clients.len(), current.len());
    debug_assert_eq!(clients.len(), previous.len());

    // Eager strategy check, before any mutation (including cache installs).
    if cfg.decoder == DecoderAgg::CrossAttention && hyper.is_none() {
        return Err(AggregateError::UnsupportedStrategy {
            strategy: "cross_attention".into(),
        });
    }

    let n = clients.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut staged: Vec<WeightMap> = vec![WeightMap::new(); n];

    match cfg.encoder {
        EncoderAgg::None => {}
        EncoderAgg::FedAvg => {
            let keys = current[0].encoder_keys();
            let subs: Vec<WeightMap> = current.iter().map(|c| c.pick(&keys)).collect();
            let mean = mean_soup(&subs)?;
            for s in staged.iter_mut() {
                for (k, t) in mean.iter() {
                    s.insert(k.clone(), t.clone());
                }
            }
        }
        EncoderAgg::ConflictAverse => {
            aggregate_encoder_conflict_averse(
                clients,
                current,
                previous,
                hyper.as_deref_mut(),
                cfg.coeff_c,
                &mut staged,
            )?;
        }
    }

    match cfg.decoder {
        DecoderAgg::None => {}
        DecoderAgg::FedAvg => {
            aggregate_decoder_fedavg(clients, current, &mut staged)?;
        }
        DecoderAgg::CrossAttention => {
            let h = hyper.as_deref_mut().expect("checked above");
            aggregate_decoder_cross_attention(clients, current, previous, h, &mut staged)?;
        }
    }

    // Commit: every branch succeeded, reload each client by name.
    for (client, ckpt) in clients.iter_mut().zip(&staged) {
        client.load_checkpoint(ckpt);
    }
    debug!(clients = n, "aggregation committed");
    Ok(staged)
}

// ── Encoder: conflict-averse ──────────────────────────────────────────

/// Global conflict-averse delta + homogeneous-group averaging, optionally
/// personalized through the encoder policy.
fn aggregate_encoder_conflict_averse(
    clients: &[Box<dyn TrainClient>],
    current: &[WeightMap],
    previous: &[WeightMap],
    hyper: Option<&mut Hyperweight>,
    coeff_c: f32,
    staged: &mut [WeightMap],
) -> Result<()> {
    let n = clients.len();
    let keys = current[0].encoder_keys();
    let shapes = shapes_of(&current[0], &keys)?;

    let mut last_flat = Vec::with_capacity(n);
    let mut deltas = Vec::with_capacity(n);
    for i in 0..n {
        let last = flatten(&previous[i].pick(&keys), &keys)?;
        let cur = flatten(&current[i].pick(&keys), &keys)?;
        if cur.len() != last.len() {
            return Err(AggregateError::ShapeMismatch {
                key: String::new(),
                detail: format!(
                    "client {} encoder size {} vs baseline {}",
                    clients[i].id(),
                    cur.len(),
                    last.len()
                ),
            });
        }
        let d: Vec<f32> = cur.iter().zip(&last).map(|(c, l)| c - l).collect();
        last_flat.push(last);
        deltas.push(d);
    }

    let global_delta = conflict_averse_delta(&deltas, coeff_c);
    let homo_delta = homogeneous_group_average(clients, &deltas);

    let outs: Vec<Vec<f32>> = match hyper {
        Some(h) => {
            // Clone everything crossing the cache boundary; the cache must
            // survive this round while all the locals above are dropped.
            let cache = EncCache {
                enc_keys: keys.clone(),
                enc_shapes: shapes.clone(),
                last_flat: last_flat.clone(),
                homo_delta: homo_delta.clone(),
                global_delta: global_delta.clone(),
            };
            h.install_enc_cache_and_forward(cache)
        }
        None => last_flat
            .iter()
            .zip(&homo_delta)
            .map(|(last, homo)| {
                last.iter()
                    .zip(homo)
                    .zip(&global_delta)
                    .map(|((&l, &h), &g)| l + h + g)
                    .collect()
            })
            .collect(),
    };

    for (i, out) in outs.iter().enumerate() {
        let map = unflatten(out, &keys, &shapes)?;
        for (k, t) in map.iter() {
            staged[i].insert(k.clone(), t.clone());
        }
    }
    Ok(())
}

/// CAGrad-style conflict-averse combination of N flat deltas.
///
/// Stack the deltas as G[N, D], Gram = G·Gᵀ, g0_norm = √(mean(Gram)+ε);
/// solve for simplex weights w minimizing ⟨w, G·mean(G)⟩ +
/// (C·g0_norm)·√(wᵀ·Gram·w + ε); then blend:
/// gw = Σ w_i·G_i, λ = (C·g0_norm+ε)/(‖gw‖+ε),
/// result = (mean(G) + λ·gw) / (1 + C²).
pub fn conflict_averse_delta(deltas: &[Vec<f32>], coeff_c: f32) -> Vec<f32> {
    let n = deltas.len();
    if n == 0 {
        return Vec::new();
    }
    let d = deltas[0].len();

    let mut gram = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..n {
            let mut dot = 0.0f64;
            for x in 0..d {
                dot += deltas[i][x] as f64 * deltas[j][x] as f64;
            }
            gram[i * n + j] = dot;
        }
    }

    let gram_mean = gram.iter().sum::<f64>() / (n * n) as f64;
    let g0_norm = (gram_mean + EPS as f64).sqrt();
    let c = coeff_c as f64 * g0_norm;

    let w = solve_simplex_projected_gd(&gram, n, c, SOLVER_MAX_ITERS, SOLVER_TOL);

    let mut gw = vec![0.0f32; d];
    for i in 0..n {
        for x in 0..d {
            gw[x] += w[i] as f32 * deltas[i][x];
        }
    }

    let lambda = (coeff_c * g0_norm as f32 + EPS) / (vec_norm_f32(&gw) + EPS);
    let scale = 1.0 / (1.0 + coeff_c * coeff_c);

    let inv_n = 1.0 / n as f32;
    let mut out = vec![0.0f32; d];
    for x in 0..d {
        let mut mean = 0.0f32;
        for delta_i in deltas {
            mean += delta_i[x] * inv_n;
        }
        out[x] = (mean + lambda * gw[x]) * scale;
    }
    out
}

/// Average local deltas inside homogeneous groups: only clients sharing
/// (dataset signature, ordered task list) are averaged together. Every
/// group member receives the group mean; singleton groups keep their own
/// delta unchanged.
fn homogeneous_group_average(
    clients: &[Box<dyn TrainClient>],
    deltas: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, c) in clients.iter().enumerate() {
        groups.entry(group_signature(c.as_ref())).or_default().push(i);
    }

    let mut out = deltas.to_vec();
    for members in groups.values() {
        if members.len() < 2 {
            continue;
        }
        let d = deltas[members[0]].len();
        let inv = 1.0 / members.len() as f32;
        let mut mean = vec![0.0f32; d];
        for &m in members {
            for x in 0..d {
                mean[x] += deltas[m][x] * inv;
            }
        }
        for &m in members {
            out[m] = mean.clone();
        }
    }
    out
}

// ── Decoder strategies ────────────────────────────────────────────────

/// One (client, task) decoder block with its relative key inventory.
struct Block {
    client: usize,
    task: String,
    /// relative key → (absolute key, shape)
    keys: BTreeMap<String, (String, Vec<usize>)>,
}

fn collect_blocks(
    clients: &[Box<dyn TrainClient>],
    current: &[WeightMap],
) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    for (ci, client) in clients.iter().enumerate() {
        for task in client.tasks() {
            let abs_keys = current[ci].decoder_keys(task);
            let mut keys = BTreeMap::new();
            for abs in abs_keys {
                let rel = rel_decoder_key(&abs, task)?;
                let shape = current[ci]
                    .get(&abs)
                    .map(|t| t.shape.clone())
                    .unwrap_or_default();
                keys.insert(rel, (abs, shape));
            }
            blocks.push(Block { client: ci, task: task.clone(), keys });
        }
    }
    Ok(blocks)
}

/// Decoder fedavg: the canonical relative-key set comes from the first
/// block only. Per key, average over the blocks that carry it and write
/// the mean identically to each of them. A block missing one of the keys
/// is reported, never silently truncated.
fn aggregate_decoder_fedavg(
    clients: &[Box<dyn TrainClient>],
    current: &[WeightMap],
    staged: &mut [WeightMap],
) -> Result<()> {
    let blocks = collect_blocks(clients, current)?;
    let Some(first) = blocks.first() else {
        return Ok(());
    };
    let rel_keys: Vec<String> = first.keys.keys().cloned().collect();

    for rel in &rel_keys {
        let mut carriers: Vec<&Block> = Vec::new();
        for b in &blocks {
            if b.keys.contains_key(rel) {
                carriers.push(b);
            } else {
                warn!(
                    client = clients[b.client].id(),
                    task = b.task.as_str(),
                    key = rel.as_str(),
                    "decoder block missing canonical key; skipped in fedavg"
                );
            }
        }

        let shape = &first.keys[rel].1;
        let numel: usize = shape.iter().product();
        let inv = 1.0 / carriers.len() as f32;
        let mut mean = vec![0.0f32; numel];
        for b in &carriers {
            let (abs, bshape) = &b.keys[rel];
            if bshape != shape {
                return Err(AggregateError::ShapeMismatch {
                    key: abs.clone(),
                    detail: format!("{:?} vs {:?}", bshape, shape),
                });
            }
            let t = current[b.client].get(abs).expect("key from this map");
            for (m, &x) in mean.iter_mut().zip(&t.data) {
                *m += x * inv;
            }
        }

        for b in &carriers {
            let (abs, _) = &b.keys[rel];
            staged[b.client].insert(
                abs.clone(),
                crate::weightmap::Tensor::from_flat(mean.clone(), shape.clone()),
            );
        }
    }
    Ok(())
}

/// Decoder cross-attention: per-block last/delta over the canonical
/// relative-key set, cached into the policy, personalized outputs written
/// back by task-qualified key.
fn aggregate_decoder_cross_attention(
    clients: &[Box<dyn TrainClient>],
    current: &[WeightMap],
    previous: &[WeightMap],
    hyper: &mut Hyperweight,
    staged: &mut [WeightMap],
) -> Result<()> {
    let blocks = collect_blocks(clients, current)?;
    let Some(first) = blocks.first() else {
        return Ok(());
    };
    let rel_keys: Vec<String> = first.keys.keys().cloned().collect();

    // Attention stacks all blocks positionally: every block must carry
    // every canonical key with an identical shape.
    for b in &blocks {
        for rel in &rel_keys {
            let Some((abs, shape)) = b.keys.get(rel) else {
                return Err(AggregateError::ShapeMismatch {
                    key: rel.clone(),
                    detail: format!(
                        "missing from block ({}, {})",
                        clients[b.client].id(),
                        b.task
                    ),
                });
            };
            if shape != &first.keys[rel].1 {
                return Err(AggregateError::ShapeMismatch {
                    key: abs.clone(),
                    detail: format!("{:?} vs {:?}", shape, first.keys[rel].1),
                });
            }
        }
    }

    let mut last_blocks = Vec::with_capacity(blocks.len());
    let mut delta_blocks = Vec::with_capacity(blocks.len());
    for b in &blocks {
        let mut last_map = BTreeMap::new();
        let mut delta_map = BTreeMap::new();
        for rel in &rel_keys {
            let (abs, _) = &b.keys[rel];
            let abs_keys = vec![abs.clone()];
            let last = flatten(&previous[b.client].pick(&abs_keys), &abs_keys)?;
            let cur = flatten(&current[b.client].pick(&abs_keys), &abs_keys)?;
            if last.len() != cur.len() {
                return Err(AggregateError::ShapeMismatch {
                    key: abs.clone(),
                    detail: format!("last size {} vs current {}", last.len(), cur.len()),
                });
            }
            let d: Vec<f32> = cur.iter().zip(&last).map(|(c, l)| c - l).collect();
            last_map.insert(rel.clone(), last);
            delta_map.insert(rel.clone(), d);
        }
        last_blocks.push(last_map);
        delta_blocks.push(delta_map);
    }

    let cache = DecCache {
        rel_keys: rel_keys.clone(),
        task_of_block: blocks.iter().map(|b| b.task.clone()).collect(),
        client_of_block: blocks.iter().map(|b| b.client).collect(),
        last_blocks,
        delta_blocks,
    };
    let outs = hyper.install_dec_cache_and_forward(cache);

    for (b, out) in blocks.iter().zip(&outs) {
        for rel in &rel_keys {
            let (_, shape) = &b.keys[rel];
            let abs = abs_decoder_key(rel, &b.task);
            staged[b.client].insert(
                abs,
                crate::weightmap::Tensor::from_flat(out[rel].clone(), shape.clone()),
            );
        }
    }
    Ok(())
}
