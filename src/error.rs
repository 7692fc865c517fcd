use thiserror::Error;
use uuid::Uuid;

/// Typed failure kinds for lifecycle operations, named per the external
/// contract callers match on (rather than parsing `anyhow` message text).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("fdu {0} does not exist")]
    FDUNotExisting(Uuid),

    #[error("state transition not allowed: fdu {fdu} is {from:?}, requested {requested}")]
    StateTransitionNotAllowed {
        fdu: Uuid,
        from: crate::status::FduState,
        requested: &'static str,
    },

    #[error("failed to resolve {kind} reference for fdu {fdu}: {reason}")]
    ResolutionFailure {
        fdu: Uuid,
        kind: &'static str,
        reason: String,
    },

    #[error("hypervisor transport error: {0}")]
    HypervisorTransportError(#[source] anyhow::Error),

    #[error("external command `{command}` failed: {reason}")]
    ExternalCommandFailure { command: String, reason: String },
}
