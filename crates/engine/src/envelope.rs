use std::collections::HashMap;

use isolate::CallError;
use serde::{Deserialize, Serialize};

/// Per-call parameters. Both entry points carry the same four fields, one
/// in the JSON body under `params`, the other URI-encoded in the
/// `deep-call-options` header.
#[derive(Debug, Default, Deserialize)]
pub struct CallParams {
    pub jwt: Option<String>,
    pub secret: Option<String>,
    pub code: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct CallBody {
    params: Option<CallParams>,
}

/// Parses a structured-call body. A missing or null `params` key behaves as
/// empty params; a body that is not JSON at all is an error the dispatcher
/// reports as a rejection.
pub fn parse_call_body(body: &[u8]) -> Result<CallParams, CallError> {
    if body.is_empty() {
        return Ok(CallParams::default());
    }
    let body: CallBody = serde_json::from_slice(body)
        .map_err(|err| CallError::Invocation(format!("invalid request body: {}", err)))?;
    Ok(body.params.unwrap_or_default())
}

/// Parses the `deep-call-options` header of a passthrough call: URI-decoded,
/// then JSON. An absent header carries no credential or code, so it fails
/// here rather than deeper in the pipeline.
pub fn parse_call_options(header: Option<&str>) -> Result<CallParams, CallError> {
    let header = header.ok_or_else(|| {
        CallError::Invocation("missing deep-call-options header".to_string())
    })?;
    let decoded = urlencoding::decode(header)
        .map_err(|err| CallError::Invocation(format!("undecodable deep-call-options: {}", err)))?;
    serde_json::from_str(&decoded)
        .map_err(|err| CallError::Invocation(format!("invalid deep-call-options: {}", err)))
}

/// The request as submitted code sees it on the passthrough path.
#[derive(Debug, Serialize)]
pub struct RequestEnvelope {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// The response state recorded by submitted code on the passthrough path.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_base64: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl ResponseEnvelope {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{ResponseEnvelope, parse_call_body, parse_call_options};
    use serde_json::json;

    #[test]
    fn missing_params_behaves_as_empty() {
        let params = parse_call_body(br#"{}"#).unwrap();
        assert!(params.jwt.is_none());
        assert!(params.code.is_none());
        assert!(params.data.is_null());

        let params = parse_call_body(b"").unwrap();
        assert!(params.jwt.is_none());
    }

    #[test]
    fn params_fields_are_all_optional() {
        let params = parse_call_body(br#"{"params":{"code":"() => 1"}}"#).unwrap();
        assert_eq!(params.code.as_deref(), Some("() => 1"));
        assert!(params.jwt.is_none());
    }

    #[test]
    fn non_json_body_is_an_error() {
        assert!(parse_call_body(b"not json").is_err());
    }

    #[test]
    fn call_options_header_is_uri_decoded_json() {
        let header = urlencoding::encode(r#"{"jwt":"t","code":"() => 1","data":{"x":1}}"#)
            .into_owned();
        let params = parse_call_options(Some(&header)).unwrap();
        assert_eq!(params.jwt.as_deref(), Some("t"));
        assert_eq!(params.data, json!({ "x": 1 }));

        assert!(parse_call_options(None).is_err());
        assert!(parse_call_options(Some("undefined")).is_err());
    }

    #[test]
    fn recorded_response_defaults_to_200() {
        let envelope = ResponseEnvelope::from_value(json!({ "body": "ok" })).unwrap();
        assert_eq!(envelope.status, 200);
        assert!(envelope.body_base64.is_none());
    }
}
