pub mod tensor;
pub mod weightmap;
pub mod simplex;
pub mod diagnostics;
pub mod error;
pub mod hyperweight;
pub mod aggregate;
pub mod client;
pub mod server;

pub use aggregate::{AggregateConfig, DecoderAgg, EncoderAgg};
pub use client::{EvalReport, MockClient, TrainClient};
pub use diagnostics::RoundDiagnostics;
pub use error::AggregateError;
pub use hyperweight::{Hyperweight, MetaConfig};
pub use server::{FederatedServer, FirstRound, Phase, RoundReport, ServerConfig};
pub use weightmap::{Tensor, WeightMap};
