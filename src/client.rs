/// Trainable client boundary.
///
/// The engine never sees layers, optimizers, or data — only this trait:
/// identity, ordered enabled-task list, a dataset/grouping signature, local
/// train/evaluate calls, and checkpoint export/load. `MockClient` is the
/// in-crate stand-in used by the integration tests, in the same spirit as a
/// mock allreduce backend: deterministic, no real training.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::tensor::SimpleRng;
use crate::weightmap::{Tensor, WeightMap};

/// Result of one evaluation pass: named scalar metrics plus raw model
/// outputs for display.
#[derive(Clone, Debug, Default)]
pub struct EvalReport {
    pub metrics: BTreeMap<String, f32>,
    pub outputs: Vec<f32>,
}

/// One federated participant. Implementations own their model and data.
pub trait TrainClient {
    fn id(&self) -> &str;

    /// Ordered list of enabled tasks. Order is part of the grouping
    /// signature and of decoder block ordering.
    fn tasks(&self) -> &[String];

    /// Dataset signature: clients sharing signature + task list form a
    /// homogeneous group.
    fn signature(&self) -> &str;

    /// Run local training for `epochs` epochs, returning one scalar loss
    /// per epoch.
    fn train(&mut self, epochs: usize) -> Result<Vec<f32>>;

    /// Evaluate the current model, returning named scalar metrics and raw
    /// outputs.
    fn evaluate(&mut self) -> Result<EvalReport>;

    /// Export a full checkpoint. An independent snapshot, not an alias of
    /// the live parameters.
    fn export_checkpoint(&self) -> WeightMap;

    /// Reload parameters by name. Names present in `ckpt` overwrite the
    /// live value; absent names keep the model's current value. Partial and
    /// additive, never a destructive full replace.
    fn load_checkpoint(&mut self, ckpt: &WeightMap);
}

/// Grouping key: dataset signature + ordered enabled-task list.
pub fn group_signature(client: &dyn TrainClient) -> String {
    format!("{}::{}", client.signature(), client.tasks().join("+"))
}

// ── MockClient ────────────────────────────────────────────────────────

/// Deterministic test client. "Training" either applies a scripted delta
/// (once per epoch) or nudges every parameter with seeded uniform noise.
pub struct MockClient {
    id: String,
    tasks: Vec<String>,
    signature: String,
    params: WeightMap,
    rng: SimpleRng,
    /// Per-epoch parameter nudge scale for the random mode.
    drift: f32,
    /// When set, train() adds exactly this delta per epoch instead of noise.
    scripted_delta: Option<WeightMap>,
    /// When set, train() returns an error (round-abort tests).
    fail_training: bool,
}

impl MockClient {
    /// Client with `enc/dense/kernel` of length `enc_dim` and, per task,
    /// `dec/<task>/head/kernel` of length `dec_dim`. All parameters start
    /// at seeded uniform values.
    pub fn new(
        id: impl Into<String>,
        tasks: &[&str],
        signature: impl Into<String>,
        enc_dim: usize,
        dec_dim: usize,
        seed: u64,
    ) -> Self {
        let mut rng = SimpleRng::new(seed);
        let mut params = WeightMap::new();
        let mut enc = vec![0.0f32; enc_dim];
        rng.fill_uniform(&mut enc, 0.5);
        params.insert("enc/dense/kernel", Tensor::from_flat(enc, vec![enc_dim]));
        for task in tasks {
            let mut dec = vec![0.0f32; dec_dim];
            rng.fill_uniform(&mut dec, 0.5);
            params.insert(
                format!("dec/{task}/head/kernel"),
                Tensor::from_flat(dec, vec![dec_dim]),
            );
        }
        MockClient {
            id: id.into(),
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            signature: signature.into(),
            params,
            rng,
            drift: 0.1,
            scripted_delta: None,
            fail_training: false,
        }
    }

    /// Replace the random per-epoch nudge with a fixed delta.
    pub fn script_delta(&mut self, delta: WeightMap) {
        self.scripted_delta = Some(delta);
    }

    pub fn set_fail_training(&mut self, fail: bool) {
        self.fail_training = fail;
    }

    /// Overwrite one parameter tensor directly (test setup).
    pub fn set_param(&mut self, key: impl Into<String>, data: Vec<f32>) {
        let shape = vec![data.len()];
        self.params.insert(key, Tensor::from_flat(data, shape));
    }

    pub fn params(&self) -> &WeightMap {
        &self.params
    }
}

impl TrainClient for MockClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn tasks(&self) -> &[String] {
        &self.tasks
    }

    fn signature(&self) -> &str {
        &self.signature
    }

    fn train(&mut self, epochs: usize) -> Result<Vec<f32>> {
        if self.fail_training {
            return Err(crate::error::AggregateError::Client {
                client: self.id.clone(),
                detail: "scripted training failure".into(),
            });
        }
        let mut losses = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            match &self.scripted_delta {
                Some(delta) => {
                    let updates: Vec<(String, Tensor)> = delta
                        .iter()
                        .map(|(k, d)| {
                            let cur = self.params.get(k).expect("scripted key exists");
                            debug_assert_eq!(cur.shape, d.shape);
                            let data: Vec<f32> =
                                cur.data.iter().zip(&d.data).map(|(a, b)| a + b).collect();
                            (k.clone(), Tensor::from_flat(data, cur.shape.clone()))
                        })
                        .collect();
                    for (k, t) in updates {
                        self.params.insert(k, t);
                    }
                }
                None => {
                    let keys: Vec<String> = self.params.keys().cloned().collect();
                    for k in keys {
                        let t = self.params.get(&k).unwrap().clone();
                        let data: Vec<f32> = t
                            .data
                            .iter()
                            .map(|&x| x + self.rng.uniform(self.drift))
                            .collect();
                        self.params.insert(k, Tensor::from_flat(data, t.shape));
                    }
                }
            }
            losses.push(1.0 / (epoch as f32 + 2.0));
        }
        Ok(losses)
    }

    fn evaluate(&mut self) -> Result<EvalReport> {
        let mut metrics = BTreeMap::new();
        let norm: f32 = self
            .params
            .iter()
            .map(|(_, t)| t.data.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt();
        metrics.insert("param_norm".to_string(), norm);
        let outputs = self
            .params
            .get("enc/dense/kernel")
            .map(|t| t.data.clone())
            .unwrap_or_default();
        Ok(EvalReport { metrics, outputs })
    }

    fn export_checkpoint(&self) -> WeightMap {
        self.params.clone()
    }

    fn load_checkpoint(&mut self, ckpt: &WeightMap) {
        for (k, t) in ckpt.iter() {
            if self.params.contains_key(k) {
                self.params.insert(k.clone(), t.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_is_partial() {
        let mut c = MockClient::new("a", &["seg"], "x", 4, 2, 7);
        let before_dec = c.params().get("dec/seg/head/kernel").unwrap().clone();
        let mut partial = WeightMap::new();
        partial.insert(
            "enc/dense/kernel",
            Tensor::from_flat(vec![9.0; 4], vec![4]),
        );
        partial.insert("enc/unknown", Tensor::from_flat(vec![1.0], vec![1]));
        c.load_checkpoint(&partial);
        assert_eq!(c.params().get("enc/dense/kernel").unwrap().data, vec![9.0; 4]);
        // absent and unknown names leave live values untouched
        assert_eq!(c.params().get("dec/seg/head/kernel").unwrap(), &before_dec);
        assert!(!c.params().contains_key("enc/unknown"));
    }

    #[test]
    fn test_group_signature_orders_tasks() {
        let a = MockClient::new("a", &["seg", "depth"], "x", 2, 2, 1);
        let b = MockClient::new("b", &["depth", "seg"], "x", 2, 2, 2);
        assert_ne!(group_signature(&a), group_signature(&b));
    }
}
