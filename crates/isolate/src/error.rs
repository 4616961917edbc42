use serde_json::json;

/// Failure taxonomy for the call pipeline. Every variant is reported to the
/// caller as a rejection payload, never as a transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// No bearer token on the request. The message text is load-bearing:
    /// existing callers match on it.
    #[error("No token provided")]
    MissingCredential,

    /// A token was supplied but its payload could not be decoded.
    #[error("invalid token: {0}")]
    InvalidCredential(String),

    /// Submitted source text failed to evaluate.
    #[error("{0}")]
    Compilation(String),

    /// Evaluation succeeded but the completion value is not invokable.
    #[error("Executed handler's code didn't return a function.")]
    CompilationResult,

    /// The callable (or the machinery invoking it) failed outside of a
    /// JS-thrown value, e.g. a dead worker or a drained-but-pending promise.
    #[error("{0}")]
    Invocation(String),

    /// The failure serializer itself could not represent a value.
    #[error("failure could not be serialized: {0}")]
    Serialization(String),
}

impl CallError {
    pub fn name(&self) -> &'static str {
        match self {
            CallError::MissingCredential => "MissingCredentialError",
            CallError::InvalidCredential(_) => "InvalidCredentialError",
            CallError::Compilation(_) => "CompilationError",
            CallError::CompilationResult => "CompilationResultError",
            CallError::Invocation(_) => "InvocationError",
            CallError::Serialization(_) => "SerializationError",
        }
    }

    /// The JSON shape placed under `"rejected"` in responses.
    pub fn rejection(&self) -> serde_json::Value {
        json!({ "name": self.name(), "message": self.to_string() })
    }
}
