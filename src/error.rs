//! Session-level error taxonomy.
//!
//! Mirrors the layering the rest of the stack uses for subsystem errors
//! (a leaf error per concern, composed into one top-level type): each
//! variant here maps to a specific downstream-visible outcome.

use thiserror::Error;

/// Errors produced while mediating a single downstream/upstream session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `subscribe-active` (or any polymorphic asset payload) named something
    /// the Asset Registry has no mapping for. The message text matches the
    /// upstream's own wording verbatim, since downstream clients pattern-match
    /// on it.
    #[error("Ativo desconhecido: {0}")]
    UnknownAsset(String),

    /// A downstream command requires the upstream link to be `Ready` and it
    /// is not.
    #[error("upstream not ready")]
    NotReady,

    /// `open-position` failed validation before it was ever transmitted.
    #[error("bad order: {0}")]
    BadOrder(&'static str),

    /// Upstream replied `unauthorized` to the handshake. Terminal, no retry.
    #[error("upstream rejected credential")]
    AuthRejected,

    /// Upstream transport closed or a frame failed to parse after reconnect
    /// attempts were exhausted. Terminal.
    #[error("upstream connection lost")]
    UpstreamLost,
}

// Heuristic-Ambiguous (an unmatched balance-flavor heuristic) has no
// variant here: it never surfaces to the downstream client, only a
// `tracing::warn!` at the call site in `balance::select_record`.

impl SessionError {
    /// The downstream event name this error surfaces under.
    pub fn downstream_event_name(&self) -> &'static str {
        match self {
            SessionError::UnknownAsset(_) => "error",
            SessionError::NotReady => "error",
            SessionError::BadOrder(_) => "error",
            SessionError::AuthRejected => "unauthorized",
            SessionError::UpstreamLost => "error",
        }
    }

    /// Whether this error also implies session teardown (a terminal
    /// `disconnected` event must follow).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::AuthRejected | SessionError::UpstreamLost)
    }
}
