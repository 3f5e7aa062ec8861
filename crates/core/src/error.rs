use std::fmt;

/// Error classification used by the retry harness and the worker node.
///
/// `Transient` errors are worth retrying: network hiccups, throttled or
/// otherwise failed driver calls, a render subprocess that exited non-zero.
/// `Fatal` errors are not: schema violations, a failed upload child, missing
/// required configuration. `Cancelled` marks an OS-signal exit and is never
/// retried.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("transient: {0:#}")]
    Transient(#[source] anyhow::Error),
    #[error("fatal: {0:#}")]
    Fatal(#[source] anyhow::Error),
    #[error("cancelled by signal")]
    Cancelled,
}

impl TaskError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }

    pub fn transient_msg(msg: impl fmt::Display) -> Self {
        Self::Transient(anyhow::anyhow!("{msg}"))
    }

    pub fn fatal_msg(msg: impl fmt::Display) -> Self {
        Self::Fatal(anyhow::anyhow!("{msg}"))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_preserved() {
        assert!(TaskError::transient_msg("socket reset").is_transient());
        assert!(!TaskError::fatal_msg("bad DONE value").is_transient());
        assert!(!TaskError::Cancelled.is_transient());
    }

    #[test]
    fn display_includes_cause() {
        let err = TaskError::transient(anyhow::anyhow!("connection refused"));
        assert_eq!(err.to_string(), "transient: connection refused");
    }
}
