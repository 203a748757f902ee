/// Aggregation errors. All of these are fatal to the current round: the
/// server surfaces them before any checkpoint write-back, so client models
/// and round state stay at their pre-aggregation values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregateError {
    /// A WeightMap operation received disagreeing key sets or shapes where
    /// exact agreement is required.
    #[error("shape mismatch at key `{key}`: {detail}")]
    ShapeMismatch { key: String, detail: String },

    /// Canonicalization mapped two distinct raw keys onto one logical name.
    #[error("key collision: `{first}` and `{second}` both canonicalize to `{canonical}`")]
    KeyCollision {
        first: String,
        second: String,
        canonical: String,
    },

    /// A strategy was selected that needs an attached hyperweight policy.
    #[error("strategy `{strategy}` requires an attached hyperweight policy")]
    UnsupportedStrategy { strategy: String },

    /// A decoder key did not carry the expected task prefix.
    #[error("malformed decoder key `{key}`: expected prefix `{expected}`")]
    MalformedKey { key: String, expected: String },

    /// A client's train/evaluate call failed.
    #[error("client `{client}` failed: {detail}")]
    Client { client: String, detail: String },
}

pub type Result<T> = std::result::Result<T, AggregateError>;
