use thiserror::Error;

/// Convenience alias for `Result<T, TesselError>`.
pub type TesselResult<T> = Result<T, TesselError>;

/// Error classification for retry/escalation decisions.
///
/// - `Config`       — bad sharding key/type, malformed range. Fatal, no retry.
/// - `Precondition` — operation attempted out of order; state unchanged.
/// - `Conflict`     — target already held (live master, concurrent migration).
/// - `Copy`         — snapshot/restore failed; recovery is a fresh snapshot.
/// - `Stream`       — checkpoint malformed or out of range; fresh cycle needed.
/// - `Consistency`  — partition tiling or diff violation; blocks migration.
/// - `Irreversible` — reverse requested after the source link is gone.
/// - `Transient`    — storage hiccup; streamers retry with backoff.
/// - `Internal`     — should never happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Precondition,
    Conflict,
    Copy,
    Stream,
    Consistency,
    Irreversible,
    Transient,
    Internal,
}

/// Top-level error type for every orchestration operation.
///
/// Each variant carries a human-readable reason; `code()` yields the stable
/// machine-parseable kind string surfaced by the command layer.
#[derive(Error, Debug)]
pub enum TesselError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Copy failure: {0}")]
    CopyFailure(String),

    #[error("Stream corruption: {0}")]
    StreamCorruption(String),

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Irreversible: {0}")]
    Irreversible(String),

    #[error("Transient: {reason} (retry after {retry_after_ms}ms)")]
    Transient { reason: String, retry_after_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesselError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesselError::Config(_) => ErrorKind::Config,
            TesselError::Precondition(_) => ErrorKind::Precondition,
            TesselError::Conflict(_) => ErrorKind::Conflict,
            TesselError::CopyFailure(_) => ErrorKind::Copy,
            TesselError::StreamCorruption(_) => ErrorKind::Stream,
            TesselError::Consistency(_) => ErrorKind::Consistency,
            TesselError::Irreversible(_) => ErrorKind::Irreversible,
            TesselError::Transient { .. } => ErrorKind::Transient,
            TesselError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-parseable error kind, the non-zero-exit contract of the
    /// command surface. Never changes across patch versions.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Config => "config",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Copy => "copy_failure",
            ErrorKind::Stream => "stream_corruption",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Irreversible => "irreversible",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }

    /// Returns true if a streamer should retry this operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if recovery requires a fresh snapshot/restore cycle.
    pub fn needs_fresh_copy(&self) -> bool {
        matches!(self.kind(), ErrorKind::Copy | ErrorKind::Stream)
    }

    /// Suggested retry delay in milliseconds (0 = do not retry).
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            TesselError::Transient { retry_after_ms, .. } => *retry_after_ms,
            _ => 0,
        }
    }

    /// Construct a transient storage/backpressure error.
    pub fn transient(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        TesselError::Transient {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Add context to an error, **preserving its classification**.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            TesselError::Config(m) => TesselError::Config(format!("{ctx}: {m}")),
            TesselError::Precondition(m) => TesselError::Precondition(format!("{ctx}: {m}")),
            TesselError::Conflict(m) => TesselError::Conflict(format!("{ctx}: {m}")),
            TesselError::CopyFailure(m) => TesselError::CopyFailure(format!("{ctx}: {m}")),
            TesselError::StreamCorruption(m) => {
                TesselError::StreamCorruption(format!("{ctx}: {m}"))
            }
            TesselError::Consistency(m) => TesselError::Consistency(format!("{ctx}: {m}")),
            TesselError::Irreversible(m) => TesselError::Irreversible(format!("{ctx}: {m}")),
            TesselError::Transient {
                reason,
                retry_after_ms,
            } => TesselError::Transient {
                reason: format!("{ctx}: {reason}"),
                retry_after_ms,
            },
            TesselError::Internal(m) => TesselError::Internal(format!("{ctx}: {m}")),
        }
    }

    /// Emit a structured log entry for consistency violations. Must be called
    /// before surfacing a `Consistency` error to the command layer.
    pub fn log_if_consistency(&self) {
        if let TesselError::Consistency(m) = self {
            tracing::error!(code = self.code(), "consistency violation: {}", m);
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `some_result.ctx("stage=restore, shard=80-c0")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> TesselResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> TesselResult<T>;
}

impl<T> ErrorContext<T> for TesselResult<T> {
    fn ctx(self, context: &str) -> TesselResult<T> {
        self.map_err(|e| e.with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> TesselResult<T> {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_fatal() {
        let e = TesselError::Config("sharding column mismatch".into());
        assert_eq!(e.kind(), ErrorKind::Config);
        assert_eq!(e.code(), "config");
        assert!(!e.is_transient());
        assert_eq!(e.retry_after_ms(), 0);
    }

    #[test]
    fn test_transient_carries_retry_delay() {
        let e = TesselError::transient("write rejected", 250);
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_transient());
        assert_eq!(e.retry_after_ms(), 250);
    }

    #[test]
    fn test_copy_and_stream_need_fresh_cycle() {
        assert!(TesselError::CopyFailure("export aborted".into()).needs_fresh_copy());
        assert!(TesselError::StreamCorruption("checkpoint ahead of log".into()).needs_fresh_copy());
        assert!(!TesselError::Precondition("x".into()).needs_fresh_copy());
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TesselError::Precondition("x".into()).code(), "precondition");
        assert_eq!(TesselError::Conflict("x".into()).code(), "conflict");
        assert_eq!(TesselError::Consistency("x".into()).code(), "consistency");
        assert_eq!(TesselError::Irreversible("x".into()).code(), "irreversible");
        assert_eq!(
            TesselError::StreamCorruption("x".into()).code(),
            "stream_corruption"
        );
    }

    #[test]
    fn test_with_context_preserves_kind() {
        let e = TesselError::transient("locked", 50).with_context("stage=apply");
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.to_string().contains("stage=apply"));
        assert!(e.to_string().contains("locked"));

        let e = TesselError::Precondition("not migrated".into()).with_context("type=master");
        assert_eq!(e.kind(), ErrorKind::Precondition);
        assert!(e.to_string().contains("type=master"));
    }

    #[test]
    fn test_ctx_trait() {
        let r: TesselResult<()> = Err(TesselError::Conflict("master exists".into()));
        let err = r.ctx("shard=80-").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("shard=80-"));

        let ok: TesselResult<u32> = Ok(7);
        assert_eq!(ok.ctx("unused").unwrap(), 7);
    }
}
