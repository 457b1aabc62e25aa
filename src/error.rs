//! The error taxonomy shared by the scheduler, the command surface and the
//! enforcer: `Transient`, `PolicyInvalid`, `Shortage`, `InvariantViolated`
//! and `Fatal`.

use std::fmt;

use camino::Utf8PathBuf;

/// The outcome of a task the scheduler ran, used to decide retry/backoff.
#[derive(Debug)]
pub enum EnforcerError {
    /// Database or HSM temporarily unavailable; retry with backoff.
    Transient(String),
    /// An imported policy document was malformed; rejected atomically.
    PolicyInvalid(String),
    /// The key factory could not satisfy a slot; not fatal, the zone is
    /// rescheduled and a key-generate task queued.
    Shortage {
        bits: u32,
        repository: Box<str>,
        policy: Box<str>,
    },
    /// The state machine or reconciler hit a combination that should be
    /// impossible; the affected key is benched and the task still commits.
    InvariantViolated(String),
    /// Unrecoverable; the process should abort at startup.
    Fatal(String),
}

impl fmt::Display for EnforcerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcerError::Transient(msg) => write!(f, "transient error: {msg}"),
            EnforcerError::PolicyInvalid(msg) => write!(f, "invalid policy: {msg}"),
            EnforcerError::Shortage {
                bits,
                repository,
                policy,
            } => write!(
                f,
                "key shortage: no spare {bits}-bit key in repository '{repository}' for policy '{policy}'"
            ),
            EnforcerError::InvariantViolated(msg) => write!(f, "invariant violated: {msg}"),
            EnforcerError::Fatal(msg) => write!(f, "fatal error: {msg}"),
        }
    }
}

impl std::error::Error for EnforcerError {}

impl EnforcerError {
    /// Whether a task that failed with this error should be retried with
    /// backoff rather than dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnforcerError::Transient(_) | EnforcerError::Shortage { .. }
        )
    }
}

//----------- Narrower, call-site errors -----------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneAddError {
    AlreadyExists,
    NoSuchPolicy,
    PolicyMidDeletion,
}

impl fmt::Display for ZoneAddError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlreadyExists => "a zone of this name already exists",
            Self::NoSuchPolicy => "no policy with that name exists",
            Self::PolicyMidDeletion => "the specified policy is being deleted",
        })
    }
}

impl std::error::Error for ZoneAddError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneRemoveError {
    NoSuchZone,
}

impl fmt::Display for ZoneRemoveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSuchZone => "no zone of this name is known",
        })
    }
}

impl std::error::Error for ZoneRemoveError {}

#[derive(Debug, Clone)]
pub enum PolicyReloadError {
    Io(Utf8PathBuf, String),
}

impl fmt::Display for PolicyReloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let PolicyReloadError::Io(p, e) = self;
        write!(f, "{p}: {e}")
    }
}

impl std::error::Error for PolicyReloadError {}

/// The outer-level error returned when the daemon cannot start at all.
#[derive(Debug)]
pub struct ExitError(pub String);

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ExitError {}

impl From<String> for ExitError {
    fn from(s: String) -> Self {
        ExitError(s)
    }
}

impl From<&str> for ExitError {
    fn from(s: &str) -> Self {
        ExitError(s.to_string())
    }
}
