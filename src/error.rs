//! Crate-wide error taxonomy
//!
//! Every fallible operation in the agent resolves to one of these kinds.
//! `MessageCodec` maps each kind to the corresponding `<request>_error`
//! response shape; nothing outside this module needs to know the wire
//! format.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Malformed or semantically invalid request from a client.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The instance is not in a state that permits the requested action.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The node has no more of some resource to hand out (ports, instance
    /// slots, disk).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A collaborator outside the agent's own process failed (docker,
    /// systemd, a provisioning script, the hpws helper).
    #[error("external failure: {0}")]
    ExternalFailure(String),

    /// The Store could not complete a read or write.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A control-channel transport broke (socket closed, helper pipe EOF,
    /// malformed frame).
    #[error("transport error: {0}")]
    Transport(String),
}

impl AgentError {
    /// Short machine-readable tag used in the `error`/`<req>_error` response
    /// body's `reason` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::BadRequest(_) => "bad_request",
            AgentError::PreconditionFailed(_) => "precondition_failed",
            AgentError::ResourceExhausted(_) => "resource_exhausted",
            AgentError::ExternalFailure(_) => "external_failure",
            AgentError::PersistenceFailure(_) => "persistence_failure",
            AgentError::Transport(_) => "transport",
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::PersistenceFailure(e.to_string())
    }
}

impl From<bollard::errors::Error> for AgentError {
    fn from(e: bollard::errors::Error) -> Self {
        AgentError::ExternalFailure(format!("docker: {e}"))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::ExternalFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_response_reason_strings() {
        assert_eq!(AgentError::BadRequest("x".into()).kind(), "bad_request");
        assert_eq!(
            AgentError::PreconditionFailed("x".into()).kind(),
            "precondition_failed"
        );
        assert_eq!(
            AgentError::ResourceExhausted("x".into()).kind(),
            "resource_exhausted"
        );
        assert_eq!(AgentError::Transport("x".into()).kind(), "transport");
    }
}
