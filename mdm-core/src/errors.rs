use crate::ids::ScopeId;
use thiserror::Error;

/// The full error taxonomy surfaced in Error replies and internal `Result`s.
///
/// One variant per wire error code. Kept as a closed enum (rather than the
/// `anyhow::Error` the control-flow engine this crate is modeled on uses for
/// its own store errors) because every error here is matched on by variant to
/// pick the code that goes out over the wire — a string message alone isn't
/// enough.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("address does not resolve: {0}")]
    NotFound(String),

    #[error("path and id disagree for {0}")]
    AddressMismatch(String),

    #[error("value type incompatible with {path}: expected {expected}, got {got}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("numeric value {value} out of range [{lo}, {hi}] for {path}")]
    OutOfRange {
        path: String,
        value: f64,
        lo: f64,
        hi: f64,
    },

    #[error("write to {0} vetoed by pre-update hook")]
    Vetoed(String),

    #[error("write to {0} vetoed by post-update hook, previous value restored")]
    PostVetoed(String),

    #[error("hook on {0} failed: {1}")]
    HookFailed(String, String),

    #[error("method {0} has no bound callback")]
    UnboundCallback(String),

    #[error("scope {0} depended on a node that was removed")]
    DependencyLost(ScopeId),

    #[error("scope {0} was cancelled")]
    Cancelled(ScopeId),

    #[error("tree model is malformed: {0}")]
    MalformedModel(String),

    #[error("subscription filter is ill-formed: {0}")]
    InvalidFilter(String),

    /// An internal invariant (dead id index, parent/child mismatch) was
    /// violated. This is fatal; a library can't abort the host process on
    /// its caller's behalf, so this variant exists for the embedder to match
    /// on and treat as unrecoverable (log loudly, tear the manager down,
    /// don't keep dispatching against a corrupted tree).
    #[error("internal invariant violated: {0}")]
    Corrupted(String),
}

impl CoreError {
    /// The stable wire error code an embedder sends back to a caller.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::AddressMismatch(_) => "ADDRESS_MISMATCH",
            CoreError::TypeMismatch { .. } => "TYPE_MISMATCH",
            CoreError::OutOfRange { .. } => "OUT_OF_RANGE",
            CoreError::Vetoed(_) => "VETOED",
            CoreError::PostVetoed(_) => "POST_VETOED",
            CoreError::HookFailed(..) => "HOOK_FAILED",
            CoreError::UnboundCallback(_) => "UNBOUND_CALLBACK",
            CoreError::DependencyLost(_) => "DEPENDENCY_LOST",
            CoreError::Cancelled(_) => "CANCELLED",
            CoreError::MalformedModel(_) => "MALFORMED_MODEL",
            CoreError::InvalidFilter(_) => "INVALID_FILTER",
            CoreError::Corrupted(_) => "CORRUPTED",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
