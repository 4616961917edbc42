use std::sync::Arc;

use isolate::{CallError, CallOutcome, CallRequest, PassthroughOutcome};
use serde_json::json;

use crate::RuntimeState;
use crate::envelope::{
    CallParams, RequestEnvelope, ResponseEnvelope, parse_call_body, parse_call_options,
};
use crate::identity::build_capabilities;

/// Structured call: always produces a response payload, `{"resolved": v}`
/// or `{"rejected": f}`. Nothing in the pipeline escapes as an error.
pub async fn execute_call(state: Arc<RuntimeState>, body: &[u8]) -> serde_json::Value {
    let params = match parse_call_body(body) {
        Ok(params) => params,
        Err(err) => return rejected(err.rejection()),
    };
    tracing::debug!(
        "call body params: code {} bytes, data {}",
        params.code.as_deref().map(str::len).unwrap_or(0),
        params.data
    );

    match state.pool.execute(call_request(&state, params)).await {
        CallOutcome::Resolved(value) => {
            tracing::debug!("call result: {}", value);
            json!({ "resolved": value })
        }
        CallOutcome::Rejected(failure) => rejected(failure),
    }
}

/// Passthrough call outcome, one step before HTTP: the recorded response,
/// a delegation (the callable called next() and wrote nothing), or a
/// rejection payload.
pub enum PassthroughReply {
    Response(ResponseEnvelope),
    NotHandled,
    Rejected(serde_json::Value),
}

/// Passthrough call: parse the `deep-call-options` header, then the same
/// compile/capabilities pipeline, with the request envelope handed to the
/// callable as `(req, res, next, context)`.
pub async fn execute_http_call(
    state: Arc<RuntimeState>,
    options_header: Option<&str>,
    request: RequestEnvelope,
) -> PassthroughReply {
    let params = match parse_call_options(options_header) {
        Ok(params) => params,
        Err(err) => {
            tracing::debug!("rejected: {}", err);
            return PassthroughReply::Rejected(err.rejection());
        }
    };

    let request_value = match serde_json::to_value(&request) {
        Ok(value) => value,
        Err(err) => {
            let err = CallError::Serialization(format!("request envelope: {}", err));
            return PassthroughReply::Rejected(err.rejection());
        }
    };

    let outcome = state
        .pool
        .execute_passthrough(call_request(&state, params).with_http_request(request_value))
        .await;

    match outcome {
        PassthroughOutcome::Response(recorded) => match ResponseEnvelope::from_value(recorded) {
            Ok(envelope) => PassthroughReply::Response(envelope),
            Err(err) => {
                let err = CallError::Serialization(format!("recorded response: {}", err));
                PassthroughReply::Rejected(err.rejection())
            }
        },
        PassthroughOutcome::NotHandled => PassthroughReply::NotHandled,
        PassthroughOutcome::Rejected(failure) => {
            tracing::debug!("rejected: {}", failure);
            PassthroughReply::Rejected(failure)
        }
    }
}

fn call_request(state: &RuntimeState, params: CallParams) -> CallRequest {
    let capabilities = build_capabilities(
        &state.config,
        params.jwt.as_deref(),
        params.secret.as_deref(),
    )
    .and_then(|bundle| {
        serde_json::to_value(&bundle)
            .map_err(|err| CallError::Serialization(format!("capability bundle: {}", err)))
    });
    CallRequest::new(params.code.unwrap_or_default(), capabilities, params.data)
}

fn rejected(failure: serde_json::Value) -> serde_json::Value {
    tracing::debug!("rejected: {}", failure);
    json!({ "rejected": failure })
}

#[cfg(test)]
mod tests {
    use super::{PassthroughReply, execute_call, execute_http_call};
    use crate::envelope::RequestEnvelope;
    use crate::{RuntimeConfig, RuntimeState};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn state() -> Arc<RuntimeState> {
        let mut config = RuntimeConfig::from_env_with(&|_| None);
        config.workers = 1;
        Arc::new(RuntimeState::new(config))
    }

    fn token() -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(json!({ "userId": 42 }).to_string().as_bytes());
        format!("{}.{}.signature", header, body)
    }

    fn call_body(code: &str, data: serde_json::Value) -> Vec<u8> {
        json!({ "params": { "jwt": token(), "code": code, "data": data } })
            .to_string()
            .into_bytes()
    }

    #[tokio::test]
    async fn resolved_value_is_wrapped() {
        let state = state();
        let body = call_body("({ data }) => data.x + 1", json!({ "x": 1 }));
        let reply = execute_call(state, &body).await;
        assert_eq!(reply, json!({ "resolved": 2 }));
    }

    #[tokio::test]
    async fn missing_code_rejects_as_non_function() {
        let state = state();
        let body = json!({ "params": { "jwt": token() } }).to_string().into_bytes();
        let reply = execute_call(state, &body).await;
        assert_eq!(reply["rejected"]["name"], "CompilationResultError");
    }

    // Empty params compile an empty source first, so the non-function
    // failure wins over the missing credential.
    #[tokio::test]
    async fn missing_params_rejects_as_non_function() {
        let state = state();
        let reply = execute_call(state, br#"{}"#).await;
        assert_eq!(reply["rejected"]["name"], "CompilationResultError");
    }

    #[tokio::test]
    async fn missing_jwt_rejects_with_missing_credential() {
        let state = state();
        let body = json!({ "params": { "code": "() => 1" } }).to_string().into_bytes();
        let reply = execute_call(state, &body).await;
        assert_eq!(reply["rejected"]["message"], "No token provided");
    }

    #[tokio::test]
    async fn undecodable_body_is_a_rejection_not_an_error() {
        let state = state();
        let reply = execute_call(state, b"not json").await;
        assert_eq!(reply["rejected"]["name"], "InvocationError");
    }

    #[tokio::test]
    async fn callable_identity_comes_from_the_token() {
        let state = state();
        let body = call_body("({ deep }) => deep.linkId", json!(null));
        let reply = execute_call(state, &body).await;
        assert_eq!(reply, json!({ "resolved": 42 }));
    }

    #[tokio::test]
    async fn passthrough_reply_carries_the_recorded_response() {
        let state = state();
        let options = urlencoding::encode(
            &json!({
                "jwt": token(),
                "code": "(req, res) => { res.status(202).send('accepted'); }",
            })
            .to_string(),
        )
        .into_owned();
        let request = RequestEnvelope {
            url: "http://localhost/http-call".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        match execute_http_call(state, Some(&options), request).await {
            PassthroughReply::Response(envelope) => {
                assert_eq!(envelope.status, 202);
                assert_eq!(envelope.body, "accepted");
            }
            PassthroughReply::NotHandled => panic!("expected a response"),
            PassthroughReply::Rejected(failure) => panic!("rejected: {}", failure),
        }
    }

    #[tokio::test]
    async fn passthrough_without_options_header_rejects() {
        let state = state();
        let request = RequestEnvelope {
            url: "http://localhost/http-call".to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        match execute_http_call(state, None, request).await {
            PassthroughReply::Rejected(failure) => {
                assert_eq!(failure["name"], "InvocationError");
            }
            _ => panic!("expected rejection"),
        }
    }
}
