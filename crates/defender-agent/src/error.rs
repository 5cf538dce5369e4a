/// Errors returned by the defender agent's public operations.
///
/// Configuration errors (`InvalidInput`, `PeriodTooShort`, `AlreadyStarted`,
/// `InvalidConfig`) are returned synchronously and never mutate agent state.
/// `Encoding` and `MalformedResponse` arise inside a reporting cycle; the
/// background task turns them into events instead of stopping.
///
/// # Examples
///
/// ```rust
/// use defender_agent::error::DefenderError;
///
/// let err = DefenderError::PeriodTooShort { period: 299, minimum: 300 };
/// assert!(err.to_string().contains("299"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum DefenderError {
    /// A metrics group or flag identifier outside the known set.
    #[error("Defender: invalid input: {0}")]
    InvalidInput(String),

    /// The requested reporting period is below the allowed minimum.
    #[error("Defender: period {period}s is shorter than the minimum of {minimum}s")]
    PeriodTooShort { period: u32, minimum: u32 },

    /// `start` was called while the agent is already running.
    #[error("Defender: agent is already started")]
    AlreadyStarted,

    /// Start parameters are missing or malformed.
    #[error("Defender: invalid start configuration: {0}")]
    InvalidConfig(String),

    /// The report could not be represented by the codec.
    #[error("Defender: report encoding failed: {0}")]
    Encoding(String),

    /// A reply document could not be decoded or has an unexpected shape.
    #[error("Defender: malformed response: {0}")]
    MalformedResponse(String),

    /// `start` was called outside a Tokio runtime.
    #[error("Defender: no Tokio runtime available to drive the reporting task")]
    NoRuntime,

    /// The agent configuration file could not be read or parsed.
    #[error("Defender: configuration error: {0}")]
    Config(String),
}

/// Convenience `Result` alias for defender operations.
pub type Result<T> = std::result::Result<T, DefenderError>;
