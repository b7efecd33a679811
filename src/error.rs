use thiserror::Error;

/// Errors reported back to callers of `execute`.
///
/// Everything except `Unauthenticated` is delivered as a string through the
/// output sink, either immediately (missing arguments) or on the next drain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No valid access token; nothing was sent.
    #[error("unauthenticated or expired access token")]
    Unauthenticated,

    #[error("Argument '{0}' required.")]
    MissingArgument(&'static str),

    /// Connection level failure, carries the transport's message.
    #[error("{0}")]
    Transport(String),

    /// Non-204 status on a command that expects no content.
    #[error("{0}")]
    Application(u16),
}
