use thiserror::Error;

/// Errors raised while building the processor or encoding a span payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A configuration value was rejected at construction time.
    #[error("invalid value for `{name}`: {reason}")]
    InvalidConfig {
        /// Name of the offending builder option.
        name: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// The scheduler worker thread could not be spawned.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A span snapshot could not be encoded into a record body.
    #[error("failed to serialize span payload: {0}")]
    Serialization(#[from] serde_json::Error),
}
