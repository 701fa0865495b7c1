//! Crate-wide error taxonomy

use thiserror::Error;

/// Errors surfaced by core engine components.
///
/// Library code returns `Result<T, DsmeError>` so callers can match on
/// the failure kind; the event loop and spawned tasks convert these to
/// `anyhow::Error` at the boundary with `.context(...)`.
#[derive(Debug, Error)]
pub enum DsmeError {
    /// A telinit request named a runlevel string the engine doesn't know.
    #[error("invalid telinit request: {0}")]
    InvalidTelinit(String),

    /// Timer creation failed on a critical path (shutdown, watchdog).
    ///
 /// the caller should attempt the callback immediately
    /// as degraded recovery; if that also fails, the process terminates.
    #[error("failed to create timer: {0}")]
    TimerCreate(String),

    /// A shutdown/reboot transition was denied (e.g. USB mounted).
    #[error("transition denied: state={state}, reason={reason}")]
    TransitionDenied { state: String, reason: String },

    /// IPHB or lifeguard client protocol violation; caller should drop
    /// the offending connection and never let it affect other clients.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// A supervised process could not be spawned.
    #[error("spawn failed (errno {errno}): {command}")]
    SpawnFailed { command: String, errno: i32 },

    /// A PROCESS_START refers to a command that is already supervised.
    #[error("process already supervised: {0}")]
    DuplicateProcess(String),

    /// An operation requiring elevated privilege was attempted by a
    /// non-root, non-whitelisted caller.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Persisted-state I/O failure (alarm head file, lifeguard stats).
    /// Recoverable: callers log at WARNING and continue.
    #[error("persistence I/O error: {0}")]
    Persistence(#[from] std::io::Error),

    /// The IPHB/lifeguard Unix socket could not be bound.
    #[error("socket bind failed at {path}: {source}")]
    SocketBind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An irrecoverable security violation was reported; MALF must be
    /// entered or the device force-shutdown.
    #[error("security violation: {0}")]
    SecurityViolation(String),
}

/// Convenience alias used throughout library modules.
pub type DsmeResult<T> = Result<T, DsmeError>;
