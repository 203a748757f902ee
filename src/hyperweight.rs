/// Hyperweight: learnable aggregation policies and their one-round-delayed
/// meta-update.
///
/// Two policies share one credit-assignment scheme:
/// - encoder: one scalar alpha per client gating absorption of the global
///   conflict-resolved delta,
/// - decoder: one beta vector per relative layer name (length K = total
///   (client, task) blocks) gating absorption of cross-block attention.
///
/// During round r's aggregation the policies run forward over tensors cloned
/// into EncCache/DecCache. At the start of round r+1, `meta_update` consumes
/// those caches exactly once: last round's forward output is treated as a
/// function of the policy parameters, the objective is
/// Σ ⟨forward_output, true_diff⟩ with true_diff = (previous last − current),
/// and one SGD step adjusts the parameters. Credit is assigned to what the
/// policy predicted a round ago, not to the current task loss.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tensor::{dot_f32, softmax_f32};
use crate::weightmap::{abs_decoder_key, delta, flatten, WeightMap};

/// Meta-optimization settings shared by both policies.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MetaConfig {
    /// SGD learning rate for alpha and beta.
    pub lr: f32,
    /// Initial alpha value per client.
    pub alpha_init: f32,
    /// Initial beta value per block.
    pub beta_init: f32,
}

impl Default for MetaConfig {
    fn default() -> Self {
        MetaConfig { lr: 1e-2, alpha_init: 0.5, beta_init: 0.5 }
    }
}

fn clip01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

// ── Shared credit-assignment step ─────────────────────────────────────

/// One-round-delayed credit assignment, shared by both policies.
///
/// Each policy's forward output is linear in its clipped parameter:
/// out = base + clip(p)·direction. The delayed objective ⟨out, true_diff⟩
/// therefore has gradient ⟨direction, true_diff⟩ through clip, gated to
/// zero where the raw parameter sits outside [0, 1] (clamp semantics).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct MetaSgd {
    lr: f32,
}

impl MetaSgd {
    /// Gradient of ⟨clip(p)·direction, true_diff⟩ with respect to p.
    fn credit_grad(param: f32, direction: &[f32], true_diff: &[f32]) -> f32 {
        if (0.0..=1.0).contains(&param) {
            dot_f32(direction, true_diff)
        } else {
            0.0
        }
    }

    fn step(&self, param: &mut f32, grad: f32) {
        *param -= self.lr * grad;
    }
}

// ── Caches ────────────────────────────────────────────────────────────

/// Tensors cloned out of one round's encoder aggregation, consumed by the
/// next round's meta-update. Everything here is an owned copy: nothing in
/// the cache aliases aggregation temporaries.
#[derive(Clone, Debug)]
pub struct EncCache {
    pub enc_keys: Vec<String>,
    pub enc_shapes: Vec<Vec<usize>>,
    /// Per-client flattened "last" encoder state.
    pub last_flat: Vec<Vec<f32>>,
    /// Per-client homogeneous-group-averaged local delta.
    pub homo_delta: Vec<Vec<f32>>,
    /// Global conflict-resolved delta.
    pub global_delta: Vec<f32>,
}

/// Decoder-side cache: one entry per (client, task) block, keyed inside by
/// task-agnostic relative layer name.
#[derive(Clone, Debug)]
pub struct DecCache {
    pub rel_keys: Vec<String>,
    pub task_of_block: Vec<String>,
    pub client_of_block: Vec<usize>,
    /// Per block: relative key → flattened "last" values.
    pub last_blocks: Vec<BTreeMap<String, Vec<f32>>>,
    /// Per block: relative key → flattened delta (current − last).
    pub delta_blocks: Vec<BTreeMap<String, Vec<f32>>>,
}

// ── Encoder policy ────────────────────────────────────────────────────

/// Per-client scalar gate on the global encoder delta.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderPolicy {
    alpha: Vec<f32>,
}

impl EncoderPolicy {
    fn new(num_clients: usize, init: f32) -> Self {
        EncoderPolicy { alpha: vec![init; num_clients] }
    }

    /// Clipped alpha values, for display and logging.
    pub fn alpha(&self) -> Vec<f32> {
        self.alpha.iter().map(|&a| clip01(a)).collect()
    }

    /// out_i = last_i + homo_delta_i + clip(alpha_i)·global_delta.
    fn forward(&self, cache: &EncCache) -> Vec<Vec<f32>> {
        debug_assert_eq!(cache.last_flat.len(), self.alpha.len());
        let mut outs = Vec::with_capacity(self.alpha.len());
        for (i, last) in cache.last_flat.iter().enumerate() {
            let a = clip01(self.alpha[i]);
            let homo = &cache.homo_delta[i];
            let out: Vec<f32> = last
                .iter()
                .zip(homo)
                .zip(&cache.global_delta)
                .map(|((&l, &h), &g)| l + h + a * g)
                .collect();
            outs.push(out);
        }
        outs
    }
}

// ── Decoder policy ────────────────────────────────────────────────────

/// Per-layer attention gate: beta[rel_key] ∈ ℝ^K over all blocks.
/// Lazily sized — layer names and K depend on the client architectures,
/// which are only known once the first decoder aggregation runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DecoderPolicy {
    beta: BTreeMap<String, Vec<f32>>,
    beta_init: f32,
}

impl DecoderPolicy {
    fn new(init: f32) -> Self {
        DecoderPolicy { beta: BTreeMap::new(), beta_init: init }
    }

    /// Clipped beta vectors, for display and logging.
    pub fn beta(&self) -> BTreeMap<String, Vec<f32>> {
        self.beta
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().map(|&b| clip01(b)).collect()))
            .collect()
    }

    /// Force every beta entry to a fixed value. Test/driver hook.
    pub fn set_all_beta(&mut self, value: f32) {
        for v in self.beta.values_mut() {
            for b in v.iter_mut() {
                *b = value;
            }
        }
        self.beta_init = value;
    }

    fn ensure_layers(&mut self, rel_keys: &[String], num_blocks: usize) {
        for k in rel_keys {
            let v = self
                .beta
                .entry(k.clone())
                .or_insert_with(|| vec![self.beta_init; num_blocks]);
            if v.len() != num_blocks {
                // Client set changed size without a reset; resize rather
                // than index out of bounds. `reset` is the supported path.
                v.resize(num_blocks, self.beta_init);
            }
        }
    }

    /// Cross-block attention per relative key.
    ///
    /// For key k: stack the K blocks' flattened deltas as rows of [K, D];
    /// block i queries with its own delta against all deltas (keys and
    /// values), temperature 1/√D; output_i = last_i + clip(beta_k[i])·attn_i.
    /// beta = 0 is therefore a strict no-op on "last".
    fn forward(&self, cache: &DecCache) -> Vec<BTreeMap<String, Vec<f32>>> {
        let k_blocks = cache.delta_blocks.len();
        let mut outs: Vec<BTreeMap<String, Vec<f32>>> = vec![BTreeMap::new(); k_blocks];
        for key in &cache.rel_keys {
            let deltas: Vec<&[f32]> = cache
                .delta_blocks
                .iter()
                .map(|b| b[key].as_slice())
                .collect();
            let attn = attention_rows(&deltas);
            let beta = &self.beta[key];
            for i in 0..k_blocks {
                let b = clip01(beta[i]);
                let last = &cache.last_blocks[i][key];
                let out: Vec<f32> = last
                    .iter()
                    .zip(&attn[i])
                    .map(|(&l, &a)| l + b * a)
                    .collect();
                outs[i].insert(key.clone(), out);
            }
        }
        outs
    }
}

/// Scaled dot-product self-attention over K stacked delta rows.
/// Row i is the attention output for query i. Temperature 1/√D.
fn attention_rows(rows: &[&[f32]]) -> Vec<Vec<f32>> {
    let k = rows.len();
    if k == 0 {
        return Vec::new();
    }
    let d = rows[0].len();
    let scale = 1.0 / (d as f32).sqrt();

    let mut scores = vec![0.0f32; k * k];
    for i in 0..k {
        debug_assert_eq!(rows[i].len(), d);
        for j in 0..k {
            scores[i * k + j] = dot_f32(rows[i], rows[j]) * scale;
        }
    }
    let mut weights = vec![0.0f32; k * k];
    softmax_f32(&scores, &mut weights, k, k);

    let mut outs = vec![vec![0.0f32; d]; k];
    for i in 0..k {
        for j in 0..k {
            let w = weights[i * k + j];
            for x in 0..d {
                outs[i][x] += w * rows[j][x];
            }
        }
    }
    outs
}

// ── Hyperweight ───────────────────────────────────────────────────────

/// Owner of both policies and their round-delayed caches.
///
/// Serializable for persistence across server restarts; the caches are
/// ephemeral round state and are not persisted.
#[derive(Clone, Serialize, Deserialize)]
pub struct Hyperweight {
    enc: EncoderPolicy,
    dec: DecoderPolicy,
    #[serde(skip)]
    enc_cache: Option<EncCache>,
    #[serde(skip)]
    dec_cache: Option<DecCache>,
    meta: MetaSgd,
    config: MetaConfig,
    meta_updates: usize,
}

impl Hyperweight {
    pub fn new(num_clients: usize, config: MetaConfig) -> Self {
        Hyperweight {
            enc: EncoderPolicy::new(num_clients, config.alpha_init),
            dec: DecoderPolicy::new(config.beta_init),
            enc_cache: None,
            dec_cache: None,
            meta: MetaSgd { lr: config.lr },
            config,
            meta_updates: 0,
        }
    }

    pub fn num_clients(&self) -> usize {
        self.enc.alpha.len()
    }

    pub fn alpha(&self) -> Vec<f32> {
        self.enc.alpha()
    }

    pub fn beta(&self) -> BTreeMap<String, Vec<f32>> {
        self.dec.beta()
    }

    pub fn decoder_mut(&mut self) -> &mut DecoderPolicy {
        &mut self.dec
    }

    /// How many meta-update steps have been applied since construction.
    pub fn meta_updates_applied(&self) -> usize {
        self.meta_updates
    }

    pub fn has_cache(&self) -> bool {
        self.enc_cache.is_some() || self.dec_cache.is_some()
    }

    /// Install the encoder cache for next round's meta-update, dropping any
    /// stale cache first, and run the encoder forward pass over it.
    pub fn install_enc_cache_and_forward(&mut self, cache: EncCache) -> Vec<Vec<f32>> {
        self.enc_cache = None; // release stale cache before replacement
        let outs = self.enc.forward(&cache);
        self.enc_cache = Some(cache);
        outs
    }

    /// Decoder counterpart: size beta lazily, install the cache, forward.
    pub fn install_dec_cache_and_forward(
        &mut self,
        cache: DecCache,
    ) -> Vec<BTreeMap<String, Vec<f32>>> {
        self.dec_cache = None;
        self.dec
            .ensure_layers(&cache.rel_keys, cache.delta_blocks.len());
        let outs = self.dec.forward(&cache);
        self.dec_cache = Some(cache);
        outs
    }

    /// One-round-delayed meta-update. Consumes whatever caches exist
    /// (each exactly once), computes true_diff = (previous last − current)
    /// per client from the checkpoints, and applies one SGD step per policy.
    /// Returns the number of policy steps applied (0 when no cache exists,
    /// i.e. at round 0).
    pub fn meta_update(
        &mut self,
        prev_last: &[WeightMap],
        current: &[WeightMap],
    ) -> Result<usize> {
        let mut applied = 0usize;

        if let Some(cache) = self.enc_cache.take() {
            for (i, _) in cache.last_flat.iter().enumerate() {
                let diff = delta(&prev_last[i], &current[i], &cache.enc_keys)?;
                let diff_flat = flatten(&diff, &cache.enc_keys)?;
                let grad =
                    MetaSgd::credit_grad(self.enc.alpha[i], &cache.global_delta, &diff_flat);
                self.meta.step(&mut self.enc.alpha[i], grad);
            }
            applied += 1;
        }

        if let Some(cache) = self.dec_cache.take() {
            for key in &cache.rel_keys {
                let deltas: Vec<&[f32]> = cache
                    .delta_blocks
                    .iter()
                    .map(|b| b[key].as_slice())
                    .collect();
                let attn = attention_rows(&deltas);
                let beta = self
                    .dec
                    .beta
                    .get_mut(key)
                    .expect("beta sized before cache install");
                for (i, attn_i) in attn.iter().enumerate() {
                    let client = cache.client_of_block[i];
                    let abs = abs_decoder_key(key, &cache.task_of_block[i]);
                    let keys = vec![abs];
                    let diff = delta(&prev_last[client], &current[client], &keys)?;
                    let diff_flat = flatten(&diff, &keys)?;
                    let grad = MetaSgd::credit_grad(beta[i], attn_i, &diff_flat);
                    self.meta.step(&mut beta[i], grad);
                }
            }
            applied += 1;
        }

        self.meta_updates += applied.min(1);
        Ok(applied)
    }

    /// Drop caches and re-initialize both policies for a new client list.
    pub fn reset(&mut self, num_clients: usize) {
        self.enc_cache = None;
        self.dec_cache = None;
        self.enc = EncoderPolicy::new(num_clients, self.config.alpha_init);
        self.dec = DecoderPolicy::new(self.config.beta_init);
        self.meta_updates = 0;
    }
}
