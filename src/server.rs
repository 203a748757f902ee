/// FederatedServer: the round state machine.
///
/// idle → training → collecting → diagnosing → (meta-updating) →
/// aggregating → rotating → idle. Training is strictly sequential in client
/// list order, bounding peak memory; aggregation and meta-update are
/// synchronous. The server never partially commits a round: every failure
/// path returns before checkpoints or the round counter change, leaving the
/// clients at their post-training state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregate::{aggregate_round, AggregateConfig, DecoderAgg, EncoderAgg};
use crate::client::{EvalReport, TrainClient};
use crate::diagnostics::RoundDiagnostics;
use crate::error::Result;
use crate::hyperweight::{Hyperweight, MetaConfig};
use crate::weightmap::{canonicalize, WeightMap};

/// What round 0 aggregates against. The pre-training "last" snapshot is an
/// untrained baseline; skipping lets drivers avoid folding it in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstRound {
    /// Aggregate round 0 against the untrained pre-training snapshot.
    Baseline,
    /// Train and rotate checkpoints on round 0 without aggregating.
    SkipAggregation,
}

/// Mutable server configuration, re-read at the start of every step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub epochs_per_client: usize,
    pub encoder: EncoderAgg,
    pub decoder: DecoderAgg,
    pub coeff_c: f32,
    /// Compute diagnostics every N rounds; 0 disables them.
    pub diagnostics_every: usize,
    /// Record clipped alpha/beta after each round.
    pub record_hyperweights: bool,
    pub first_round: FirstRound,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            epochs_per_client: 1,
            encoder: EncoderAgg::ConflictAverse,
            decoder: DecoderAgg::CrossAttention,
            coeff_c: 0.5,
            diagnostics_every: 1,
            record_hyperweights: false,
            first_round: FirstRound::Baseline,
        }
    }
}

/// Round phase, exposed for drivers. Transitions only inside `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Training,
    Collecting,
    Diagnosing,
    MetaUpdating,
    Aggregating,
    Rotating,
}

/// What one completed round produced.
#[derive(Clone, Debug)]
pub struct RoundReport {
    /// Index of the round that just completed.
    pub round: usize,
    /// Per-client per-epoch training losses, in client list order.
    pub client_losses: Vec<Vec<f32>>,
    /// Diagnostics, when the cadence fired this round.
    pub diagnostics: Option<RoundDiagnostics>,
    /// Whether a meta-update step was applied this round.
    pub meta_updated: bool,
}

type ClientTrainedCallback = Box<dyn FnMut(usize, &str, &[f32])>;
type AggregatedCallback = Box<dyn FnMut(usize)>;
type EvaluatedCallback = Box<dyn FnMut(&str, &EvalReport)>;
type ProgressCallback = Box<dyn FnMut(usize, Phase)>;

/// Round orchestrator. Owns the baseline checkpoints and the hyperweight
/// policies; clients are borrowed per call.
pub struct FederatedServer {
    pub config: ServerConfig,
    policy_config: Option<MetaConfig>,
    hyper: Option<Hyperweight>,
    round: usize,
    phase: Phase,
    /// Pre-round baseline snapshot per client ("last").
    last_ckpt: Option<Vec<WeightMap>>,
    last_diagnostics: Option<RoundDiagnostics>,
    alpha_history: Vec<Vec<f32>>,
    beta_history: Vec<BTreeMap<String, Vec<f32>>>,
    on_client_trained: Option<ClientTrainedCallback>,
    on_aggregated: Option<AggregatedCallback>,
    on_evaluated: Option<EvaluatedCallback>,
    on_progress: Option<ProgressCallback>,
}

impl FederatedServer {
    pub fn new(config: ServerConfig) -> Self {
        FederatedServer {
            config,
            policy_config: None,
            hyper: None,
            round: 0,
            phase: Phase::Idle,
            last_ckpt: None,
            last_diagnostics: None,
            alpha_history: Vec::new(),
            beta_history: Vec::new(),
            on_client_trained: None,
            on_aggregated: None,
            on_evaluated: None,
            on_progress: None,
        }
    }

    /// Attach a hyperweight policy. The policy itself is created lazily at
    /// the first step (or at `reset`), sized to the client list.
    pub fn with_policy(mut self, meta: MetaConfig) -> Self {
        self.policy_config = Some(meta);
        self
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_diagnostics(&self) -> Option<&RoundDiagnostics> {
        self.last_diagnostics.as_ref()
    }

    /// Clipped per-client alpha, when a policy is attached and initialized.
    pub fn alpha(&self) -> Option<Vec<f32>> {
        self.hyper.as_ref().map(|h| h.alpha())
    }

    /// Clipped per-layer beta, when a policy is attached and initialized.
    pub fn beta(&self) -> Option<BTreeMap<String, Vec<f32>>> {
        self.hyper.as_ref().map(|h| h.beta())
    }

    pub fn alpha_history(&self) -> &[Vec<f32>] {
        &self.alpha_history
    }

    pub fn beta_history(&self) -> &[BTreeMap<String, Vec<f32>>] {
        &self.beta_history
    }

    pub fn hyperweight(&self) -> Option<&Hyperweight> {
        self.hyper.as_ref()
    }

    pub fn hyperweight_mut(&mut self) -> Option<&mut Hyperweight> {
        self.hyper.as_mut()
    }

    /// Display-only callback, fired after each client finishes training.
    pub fn set_on_client_trained(&mut self, cb: ClientTrainedCallback) {
        self.on_client_trained = Some(cb);
    }

    /// Display-only callback, fired after each committed round.
    pub fn set_on_aggregated(&mut self, cb: AggregatedCallback) {
        self.on_aggregated = Some(cb);
    }

    /// Display-only callback, fired per client by `evaluate_all`.
    pub fn set_on_evaluated(&mut self, cb: EvaluatedCallback) {
        self.on_evaluated = Some(cb);
    }

    /// Display-only callback, fired at each phase transition within a round.
    pub fn set_on_progress(&mut self, cb: ProgressCallback) {
        self.on_progress = Some(cb);
    }

    /// Run one federated round.
    pub fn step(&mut self, clients: &mut [Box<dyn TrainClient>]) -> Result<RoundReport> {
        // Configuration is read once, at step start; mid-step mutation of
        // `self.config` by callbacks affects the next round only.
        let cfg = self.config.clone();
        debug!(round = self.round, clients = clients.len(), "round start");

        // First call: capture the pre-training baseline.
        if self.last_ckpt.is_none() {
            let baseline = snapshot(clients)?;
            self.last_ckpt = Some(baseline);
        }

        if self.hyper.is_none() {
            if let Some(meta) = self.policy_config {
                self.hyper = Some(Hyperweight::new(clients.len(), meta));
            }
        }

        // Training: strictly sequential in list order.
        self.phase = Phase::Training;
        if let Some(cb) = self.on_progress.as_mut() {
            cb(self.round, Phase::Training);
        }
        let mut client_losses = Vec::with_capacity(clients.len());
        for (i, client) in clients.iter_mut().enumerate() {
            let losses = match client.train(cfg.epochs_per_client) {
                Ok(l) => l,
                Err(e) => {
                    self.phase = Phase::Idle;
                    return Err(e);
                }
            };
            if let Some(cb) = self.on_client_trained.as_mut() {
                cb(i, client.id(), &losses);
            }
            client_losses.push(losses);
        }

        // Collect the post-training snapshot. Ephemeral: dropped at commit.
        self.phase = Phase::Collecting;
        if let Some(cb) = self.on_progress.as_mut() {
            cb(self.round, Phase::Collecting);
        }
        let save_ckpt = match snapshot(clients) {
            Ok(s) => s,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e);
            }
        };
        let last_ckpt = self.last_ckpt.as_ref().expect("baseline captured above");

        // Everything below stages into locals; server state mutates only at
        // commit, keeping failed rounds invisible.
        let result = Self::run_round_body(
            &cfg,
            self.round,
            clients,
            &save_ckpt,
            last_ckpt,
            self.hyper.as_mut(),
            &mut self.phase,
            self.on_progress.as_mut(),
        );
        let (diagnostics, meta_updated) = match result {
            Ok(r) => r,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e);
            }
        };

        // Rotate: fresh post-aggregation snapshot becomes "last"; the old
        // baseline and the ephemeral save snapshot are released here.
        self.phase = Phase::Rotating;
        if let Some(cb) = self.on_progress.as_mut() {
            cb(self.round, Phase::Rotating);
        }
        let rotated = match snapshot(clients) {
            Ok(s) => s,
            Err(e) => {
                self.phase = Phase::Idle;
                return Err(e);
            }
        };
        drop(save_ckpt);
        self.last_ckpt = Some(rotated);
        if let Some(d) = &diagnostics {
            self.last_diagnostics = Some(d.clone());
        }
        if cfg.record_hyperweights {
            if let Some(h) = &self.hyper {
                self.alpha_history.push(h.alpha());
                self.beta_history.push(h.beta());
            }
        }

        let completed = self.round;
        self.round += 1;
        self.phase = Phase::Idle;
        info!(round = completed, meta_updated, "round committed");
        if let Some(cb) = self.on_aggregated.as_mut() {
            cb(completed);
        }

        Ok(RoundReport { round: completed, client_losses, diagnostics, meta_updated })
    }

    /// Diagnose, meta-update, aggregate. Pure staging up to the aggregation
    /// commit inside `aggregate_round`.
    fn run_round_body(
        cfg: &ServerConfig,
        round: usize,
        clients: &mut [Box<dyn TrainClient>],
        save_ckpt: &[WeightMap],
        last_ckpt: &[WeightMap],
        mut hyper: Option<&mut Hyperweight>,
        phase: &mut Phase,
        mut progress: Option<&mut ProgressCallback>,
    ) -> Result<(Option<RoundDiagnostics>, bool)> {
        *phase = Phase::Diagnosing;
        if let Some(cb) = progress.as_mut() {
            cb(round, Phase::Diagnosing);
        }
        let diagnostics = if cfg.diagnostics_every > 0 && round % cfg.diagnostics_every == 0 {
            Some(RoundDiagnostics::from_checkpoints(save_ckpt, last_ckpt)?)
        } else {
            None
        };

        // Meta-update from round 1 on: no cache exists at round 0. Consumes
        // the previous round's cache exactly once.
        *phase = Phase::MetaUpdating;
        if let Some(cb) = progress.as_mut() {
            cb(round, Phase::MetaUpdating);
        }
        let mut meta_updated = false;
        if round > 0 {
            if let Some(h) = hyper.as_deref_mut() {
                meta_updated = h.meta_update(last_ckpt, save_ckpt)? > 0;
            }
        }

        *phase = Phase::Aggregating;
        if let Some(cb) = progress.as_mut() {
            cb(round, Phase::Aggregating);
        }
        let skip = round == 0 && cfg.first_round == FirstRound::SkipAggregation;
        if !skip {
            let agg_cfg = AggregateConfig {
                encoder: cfg.encoder,
                decoder: cfg.decoder,
                coeff_c: cfg.coeff_c,
            };
            aggregate_round(clients, save_ckpt, last_ckpt, hyper, &agg_cfg)?;
        }

        Ok((diagnostics, meta_updated))
    }

    /// Evaluate every client, firing the display callback per client.
    pub fn evaluate_all(
        &mut self,
        clients: &mut [Box<dyn TrainClient>],
    ) -> Result<Vec<EvalReport>> {
        let mut all = Vec::with_capacity(clients.len());
        for client in clients.iter_mut() {
            let report = client.evaluate()?;
            if let Some(cb) = self.on_evaluated.as_mut() {
                cb(client.id(), &report);
            }
            all.push(report);
        }
        Ok(all)
    }

    /// Back to round 0: release held checkpoints, rebuild the hyperweight
    /// sized to the (possibly new) client list, clear recorded history.
    pub fn reset(&mut self, clients: &[Box<dyn TrainClient>]) {
        self.round = 0;
        self.phase = Phase::Idle;
        self.last_ckpt = None;
        self.last_diagnostics = None;
        self.alpha_history.clear();
        self.beta_history.clear();
        self.hyper = self
            .policy_config
            .map(|meta| Hyperweight::new(clients.len(), meta));
        debug!(clients = clients.len(), "server reset");
    }
}

/// Canonicalized independent snapshot of every client.
fn snapshot(clients: &[Box<dyn TrainClient>]) -> Result<Vec<WeightMap>> {
    clients
        .iter()
        .map(|c| canonicalize(&c.export_checkpoint()))
        .collect()
}
