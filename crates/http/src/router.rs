use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;

use engine::{
    PassthroughReply, RequestEnvelope, ResponseEnvelope, RuntimeState, execute_call,
    execute_http_call,
};

const OPTIONS_HEADER: &str = "deep-call-options";

// Callers ship code and data in one JSON body; keep the limit generous.
const BODY_LIMIT: usize = 50 * 1024 * 1024;

pub fn app_router(state: Arc<RuntimeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/init", post(init))
        .route("/call", post(handle_call))
        .route("/http-call", any(handle_http_call))
        .route("/http-call/*rest", any(handle_http_call))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({}))
}

async fn init() -> Json<serde_json::Value> {
    Json(json!({}))
}

/// Structured call. Always 200; failure lives in the payload shape.
async fn handle_call(State(state): State<Arc<RuntimeState>>, body: bytes::Bytes) -> Response {
    let reply = execute_call(state, &body).await;
    Json(reply).into_response()
}

/// Passthrough call. The submitted callable owns the response; everything
/// else (delegation, rejection) is shaped here.
async fn handle_http_call(
    State(state): State<Arc<RuntimeState>>,
    request: Request,
) -> Response {
    let method = request.method().as_str().to_string();
    let uri = request.uri().to_string();
    tracing::debug!("[http-call] {} {}", method, uri);

    let options = request
        .headers()
        .get(OPTIONS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut headers = std::collections::HashMap::with_capacity(request.headers().len());
    for (key, value) in request.headers().iter() {
        headers.insert(
            key.as_str().to_string(),
            value.to_str().unwrap_or("").to_string(),
        );
    }

    let content_len = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(usize::MAX);

    let body = if content_len == 0 {
        None
    } else {
        match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
            Ok(bytes) if !bytes.is_empty() => Some(String::from_utf8_lossy(&bytes).to_string()),
            Ok(_) => None,
            Err(err) => {
                let failure = json!({
                    "name": "InvocationError",
                    "message": format!("request body over {} bytes: {}", BODY_LIMIT, err),
                });
                return rejection_response(state.config.passthrough_rejection_status, failure);
            }
        }
    };

    let envelope = RequestEnvelope {
        url: format!("http://localhost{}", uri),
        method,
        headers,
        body,
    };

    match execute_http_call(Arc::clone(&state), options.as_deref(), envelope).await {
        PassthroughReply::Response(recorded) => envelope_response(recorded),
        PassthroughReply::NotHandled => StatusCode::NOT_FOUND.into_response(),
        PassthroughReply::Rejected(failure) => {
            rejection_response(state.config.passthrough_rejection_status, failure)
        }
    }
}

fn envelope_response(envelope: ResponseEnvelope) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::OK));

    for (key, value) in envelope.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            tracing::warn!("Skipping invalid response header: {}", key);
            continue;
        };
        response = response.header(name, value);
    }

    let body = if let Some(body_base64) = envelope.body_base64 {
        match base64::engine::general_purpose::STANDARD.decode(body_base64.as_bytes()) {
            Ok(bytes) => axum::body::Body::from(bytes),
            Err(err) => {
                return Response::builder()
                    .status(500)
                    .body(axum::body::Body::from(format!(
                        "Failed to decode body: {}",
                        err
                    )))
                    .unwrap();
            }
        }
    } else {
        axum::body::Body::from(envelope.body)
    };

    response.body(body).unwrap()
}

fn rejection_response(status: u16, failure: serde_json::Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, Json(json!({ "rejected": failure }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::app_router;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use engine::{RuntimeConfig, RuntimeState};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        app_with(|_| {})
    }

    fn app_with(tweak: impl FnOnce(&mut RuntimeConfig)) -> Router {
        let mut config = RuntimeConfig::from_env_with(&|_| None);
        config.workers = 1;
        tweak(&mut config);
        app_router(Arc::new(RuntimeState::new(config)))
    }

    fn token() -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(json!({ "userId": 42 }).to_string().as_bytes());
        format!("{}.{}.signature", header, body)
    }

    fn call_options(code: &str) -> String {
        urlencoding::encode(&json!({ "jwt": token(), "code": code }).to_string()).into_owned()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_init_answer_empty_objects() {
        for (method, path) in [("GET", "/healthz"), ("POST", "/init")] {
            let response = app()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(path)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(body_json(response).await, json!({}));
        }
    }

    #[tokio::test]
    async fn call_answers_200_even_when_rejected() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/call")
                    .body(Body::from(r#"{"params":{"code":"() => 1"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let reply = body_json(response).await;
        assert_eq!(reply["rejected"]["message"], "No token provided");
    }

    #[tokio::test]
    async fn call_resolves_submitted_code() {
        let body = json!({
            "params": { "jwt": token(), "code": "({ data }) => data.x * 2", "data": { "x": 3 } },
        });
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/call")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await, json!({ "resolved": 6 }));
    }

    #[tokio::test]
    async fn http_call_writes_the_recorded_response() {
        let code = "(req, res) => { res.status(202).set('x-tag', 'deep').send('accepted'); }";
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/http-call")
                    .header("deep-call-options", call_options(code))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        assert_eq!(response.headers()["x-tag"], "deep");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"accepted");
    }

    #[tokio::test]
    async fn http_call_subpaths_reach_the_callable() {
        let code = "(req, res) => { res.json({ url: req.url, method: req.method }); }";
        let response = app()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/http-call/links/7")
                    .header("deep-call-options", call_options(code))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let reply = body_json(response).await;
        assert_eq!(reply["url"], "http://localhost/http-call/links/7");
        assert_eq!(reply["method"], "PUT");
    }

    #[tokio::test]
    async fn http_call_delegation_yields_404() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/http-call")
                    .header(
                        "deep-call-options",
                        call_options("(req, res, next) => { next(); }"),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn http_call_refuses_an_oversized_body() {
        let code = "(req, res) => { res.send('should not run'); }";
        let oversized = vec![b' '; super::BODY_LIMIT + 1];
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/http-call")
                    .header("deep-call-options", call_options(code))
                    .body(Body::from(oversized))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let reply = body_json(response).await;
        assert_eq!(reply["rejected"]["name"], "InvocationError");
    }

    #[tokio::test]
    async fn http_call_rejection_status_is_configurable() {
        let response = app_with(|config| config.passthrough_rejection_status = 500)
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/http-call")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let reply = body_json(response).await;
        assert_eq!(reply["rejected"]["name"], "InvocationError");
    }

    #[tokio::test]
    async fn http_call_rejection_defaults_to_200() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/http-call")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(body_json(response).await.get("rejected").is_some());
    }
}
