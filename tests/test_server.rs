//! FederatedServer round state machine: stepping, meta-update gating,
//! atomicity, reset, callbacks, config serialization.

use std::cell::RefCell;
use std::rc::Rc;

use fedmtl_core::aggregate::{DecoderAgg, EncoderAgg};
use fedmtl_core::client::{MockClient, TrainClient};
use fedmtl_core::diagnostics::RoundDiagnostics;
use fedmtl_core::hyperweight::MetaConfig;
use fedmtl_core::server::{FederatedServer, FirstRound, Phase, ServerConfig};
use fedmtl_core::weightmap::{Tensor, WeightMap};

// ── Helper functions ──────────────────────────────────────────────────

const ENC_KEY: &str = "enc/dense/kernel";

fn enc_delta(values: Vec<f32>) -> WeightMap {
    let mut m = WeightMap::new();
    let shape = vec![values.len()];
    m.insert(ENC_KEY, Tensor::from_flat(values, shape));
    m
}

fn three_clients() -> Vec<Box<dyn TrainClient>> {
    vec![
        Box::new(MockClient::new("a", &["seg"], "x", 4, 2, 101)),
        Box::new(MockClient::new("b", &["seg"], "x", 4, 2, 102)),
        Box::new(MockClient::new("c", &["seg"], "x", 4, 2, 103)),
    ]
}

fn fedavg_config() -> ServerConfig {
    ServerConfig {
        encoder: EncoderAgg::FedAvg,
        decoder: DecoderAgg::None,
        ..Default::default()
    }
}

// ── Group 1: stepping and fedavg property ─────────────────────────────

#[test]
fn test_one_step_fedavg_encoder_identical_mean() {
    // Scripted deltas make the post-training state predictable.
    let deltas = [
        vec![1.0f32, 0.0, 0.0, 0.0],
        vec![0.0f32, 1.0, 0.0, 0.0],
        vec![0.0f32, 0.0, 1.0, 0.0],
    ];
    let mut a = MockClient::new("a", &["seg"], "x", 4, 2, 101);
    let mut b = MockClient::new("b", &["seg"], "x", 4, 2, 102);
    let mut c = MockClient::new("c", &["seg"], "x", 4, 2, 103);
    let mut expected = vec![0.0f32; 4];
    for (m, d) in [&a, &b, &c].iter().zip(&deltas) {
        let base = &m.params().get(ENC_KEY).unwrap().data;
        for i in 0..4 {
            expected[i] += (base[i] + d[i]) / 3.0;
        }
    }
    a.script_delta(enc_delta(deltas[0].clone()));
    b.script_delta(enc_delta(deltas[1].clone()));
    c.script_delta(enc_delta(deltas[2].clone()));
    let mut clients: Vec<Box<dyn TrainClient>> =
        vec![Box::new(a), Box::new(b), Box::new(c)];

    let mut server = FederatedServer::new(fedavg_config());
    let report = server.step(&mut clients).unwrap();
    assert_eq!(report.round, 0);
    assert_eq!(server.round(), 1);
    assert_eq!(report.client_losses.len(), 3);

    let after: Vec<Vec<f32>> = clients
        .iter()
        .map(|c| c.export_checkpoint().get(ENC_KEY).unwrap().data.clone())
        .collect();
    assert_eq!(after[0], after[1]);
    assert_eq!(after[1], after[2]);
    for (a, e) in after[0].iter().zip(&expected) {
        assert!((a - e).abs() < 1e-5, "{a} vs {e}");
    }
}

#[test]
fn test_decoder_fedavg_shared_task_average() {
    let mut clients: Vec<Box<dyn TrainClient>> = vec![
        Box::new(MockClient::new("a", &["A"], "x", 2, 3, 1)),
        Box::new(MockClient::new("b", &["A"], "y", 2, 3, 2)),
    ];
    let mut server = FederatedServer::new(ServerConfig {
        encoder: EncoderAgg::None,
        decoder: DecoderAgg::FedAvg,
        ..Default::default()
    });
    server.step(&mut clients).unwrap();

    let key = "dec/A/head/kernel";
    let a = clients[0].export_checkpoint().get(key).unwrap().data.clone();
    let b = clients[1].export_checkpoint().get(key).unwrap().data.clone();
    assert_eq!(a, b);
}

// ── Group 2: meta-update gating ───────────────────────────────────────

#[test]
fn test_meta_update_fires_zero_then_once() {
    let mut clients = three_clients();
    let mut server = FederatedServer::new(ServerConfig {
        encoder: EncoderAgg::ConflictAverse,
        decoder: DecoderAgg::None,
        ..Default::default()
    })
    .with_policy(MetaConfig::default());

    let r0 = server.step(&mut clients).unwrap();
    assert!(!r0.meta_updated, "no cache exists at round 0");
    assert_eq!(server.hyperweight().unwrap().meta_updates_applied(), 0);

    let r1 = server.step(&mut clients).unwrap();
    assert!(r1.meta_updated, "round 1 consumes round 0's cache");
    assert_eq!(server.hyperweight().unwrap().meta_updates_applied(), 1);
}

#[test]
fn test_alpha_visible_with_policy() {
    let mut clients = three_clients();
    let mut server =
        FederatedServer::new(fedavg_config()).with_policy(MetaConfig::default());
    assert!(server.alpha().is_none(), "policy built lazily at first step");
    server.step(&mut clients).unwrap();
    assert_eq!(server.alpha().unwrap().len(), 3);
}

// ── Group 3: atomicity ────────────────────────────────────────────────

#[test]
fn test_training_failure_leaves_round_unchanged() {
    let mut a = MockClient::new("a", &["seg"], "x", 4, 2, 1);
    a.set_fail_training(true);
    let mut clients: Vec<Box<dyn TrainClient>> = vec![
        Box::new(a),
        Box::new(MockClient::new("b", &["seg"], "x", 4, 2, 2)),
    ];

    let mut server = FederatedServer::new(fedavg_config());
    assert!(server.step(&mut clients).is_err());
    assert_eq!(server.round(), 0);
    assert!(server.last_diagnostics().is_none());
}

#[test]
fn test_aggregation_failure_preserves_trained_state() {
    // cross_attention without a policy fails eagerly inside aggregation;
    // the round must not commit, but training effects stay on the clients.
    let mut clients: Vec<Box<dyn TrainClient>> =
        vec![Box::new(MockClient::new("a", &["A"], "x", 2, 2, 3))];
    let baseline = clients[0].export_checkpoint();

    let mut server = FederatedServer::new(ServerConfig {
        encoder: EncoderAgg::None,
        decoder: DecoderAgg::CrossAttention,
        ..Default::default()
    });
    assert!(server.step(&mut clients).is_err());
    assert_eq!(server.round(), 0);
    // Trained, but never aggregated: parameters moved away from baseline.
    assert_ne!(clients[0].export_checkpoint(), baseline);
}

// ── Group 4: diagnostics cadence and first-round policy ───────────────

#[test]
fn test_diagnostics_cadence() {
    let mut clients = three_clients();
    let mut server = FederatedServer::new(ServerConfig {
        diagnostics_every: 2,
        ..fedavg_config()
    });

    let r0 = server.step(&mut clients).unwrap();
    assert!(r0.diagnostics.is_some());
    let r1 = server.step(&mut clients).unwrap();
    assert!(r1.diagnostics.is_none());
    // last_diagnostics keeps the most recent computed record.
    assert!(server.last_diagnostics().is_some());
}

#[test]
fn test_skip_first_round_aggregation() {
    let mut a = MockClient::new("a", &["seg"], "x", 3, 2, 5);
    let delta = vec![1.0f32, 2.0, 3.0];
    a.script_delta(enc_delta(delta.clone()));
    let base = a.params().get(ENC_KEY).unwrap().data.clone();
    let mut clients: Vec<Box<dyn TrainClient>> = vec![
        Box::new(a),
        Box::new(MockClient::new("b", &["seg"], "y", 3, 2, 6)),
    ];

    let mut server = FederatedServer::new(ServerConfig {
        first_round: FirstRound::SkipAggregation,
        ..fedavg_config()
    });
    server.step(&mut clients).unwrap();
    assert_eq!(server.round(), 1);

    // Round 0 trained but did not aggregate: client a keeps base + delta.
    let after = clients[0].export_checkpoint().get(ENC_KEY).unwrap().data.clone();
    for i in 0..3 {
        assert!((after[i] - (base[i] + delta[i])).abs() < 1e-6);
    }
}

// ── Group 5: reset, history, callbacks ────────────────────────────────

#[test]
fn test_reset_restarts_state() {
    let mut clients = three_clients();
    let mut server = FederatedServer::new(ServerConfig {
        record_hyperweights: true,
        encoder: EncoderAgg::ConflictAverse,
        decoder: DecoderAgg::None,
        ..Default::default()
    })
    .with_policy(MetaConfig::default());

    server.step(&mut clients).unwrap();
    server.step(&mut clients).unwrap();
    assert_eq!(server.round(), 2);
    assert_eq!(server.alpha_history().len(), 2);

    server.reset(&clients);
    assert_eq!(server.round(), 0);
    assert!(server.alpha_history().is_empty());
    assert!(server.last_diagnostics().is_none());
    assert_eq!(server.alpha().unwrap().len(), 3);
    assert_eq!(server.hyperweight().unwrap().meta_updates_applied(), 0);
}

#[test]
fn test_callbacks_fire_in_order() {
    let mut clients = three_clients();
    let trained: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let aggregated: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    let mut server = FederatedServer::new(fedavg_config());
    let t = trained.clone();
    server.set_on_client_trained(Box::new(move |_, id, losses| {
        assert!(!losses.is_empty());
        t.borrow_mut().push(id.to_string());
    }));
    let g = aggregated.clone();
    server.set_on_aggregated(Box::new(move |round| {
        g.borrow_mut().push(round);
    }));

    server.step(&mut clients).unwrap();
    assert_eq!(*trained.borrow(), vec!["a", "b", "c"]);
    assert_eq!(*aggregated.borrow(), vec![0]);
}

#[test]
fn test_progress_reports_phase_sequence() {
    let mut clients = three_clients();
    let phases: Rc<RefCell<Vec<Phase>>> = Rc::new(RefCell::new(Vec::new()));
    let mut server = FederatedServer::new(fedavg_config());
    let p = phases.clone();
    server.set_on_progress(Box::new(move |round, phase| {
        assert_eq!(round, 0);
        p.borrow_mut().push(phase);
    }));
    server.step(&mut clients).unwrap();
    assert_eq!(
        *phases.borrow(),
        vec![
            Phase::Training,
            Phase::Collecting,
            Phase::Diagnosing,
            Phase::MetaUpdating,
            Phase::Aggregating,
            Phase::Rotating,
        ]
    );
}

#[test]
fn test_evaluate_all_returns_metrics() {
    let mut clients = three_clients();
    let seen: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let mut server = FederatedServer::new(fedavg_config());
    let s = seen.clone();
    server.set_on_evaluated(Box::new(move |_, report| {
        assert!(report.metrics.contains_key("param_norm"));
        assert!(!report.outputs.is_empty());
        *s.borrow_mut() += 1;
    }));
    let all = server.evaluate_all(&mut clients).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(*seen.borrow(), 3);
}

// ── Group 6: serialization ────────────────────────────────────────────

#[test]
fn test_server_config_round_trip() {
    let cfg = ServerConfig {
        epochs_per_client: 3,
        encoder: EncoderAgg::ConflictAverse,
        decoder: DecoderAgg::CrossAttention,
        coeff_c: 0.25,
        diagnostics_every: 4,
        record_hyperweights: true,
        first_round: FirstRound::SkipAggregation,
    };
    let json = serde_json::to_string(&cfg).unwrap();
    assert!(json.contains("conflict_averse"));
    assert!(json.contains("cross_attention"));
    let back: ServerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.epochs_per_client, 3);
    assert_eq!(back.encoder, EncoderAgg::ConflictAverse);
    assert_eq!(back.first_round, FirstRound::SkipAggregation);
}

#[test]
fn test_diagnostics_round_trip() {
    let d = RoundDiagnostics::from_deltas(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
    let json = serde_json::to_string(&d).unwrap();
    let back: RoundDiagnostics = serde_json::from_str(&json).unwrap();
    assert_eq!(d, back);
}
