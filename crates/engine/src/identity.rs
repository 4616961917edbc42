use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use isolate::CallError;
use serde::Serialize;

use crate::config::RuntimeConfig;

const HASURA_CLAIMS_NAMESPACE: &str = "https://hasura.io/jwt/claims";

/// Connection descriptor for the data client capability.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataCapability {
    pub path: String,
    pub ssl: bool,
}

/// Connection descriptor for the administrative capability. Only built when
/// the caller presented the elevated secret.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdminCapability {
    pub path: String,
    pub ssl: bool,
    pub secret: String,
}

/// Everything submitted code may reach through its `deep` client, built
/// fresh per request and serialized into the isolate as the context seed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CapabilityBundle {
    #[serde(rename = "linkId")]
    pub link_id: Option<i64>,
    pub token: String,
    pub client: DataCapability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminCapability>,
}

/// Assembles the capability bundle for one call. The token payload is only
/// decoded for the caller identity; signature verification stays upstream.
/// A secret without a token still fails: the data credential is mandatory.
pub fn build_capabilities(
    config: &RuntimeConfig,
    jwt: Option<&str>,
    secret: Option<&str>,
) -> Result<CapabilityBundle, CallError> {
    let token = match jwt {
        Some(token) if !token.is_empty() => token,
        _ => return Err(CallError::MissingCredential),
    };

    let claims = decode_claims(token)?;
    let link_id = caller_identity(&claims);

    let admin = secret
        .filter(|secret| !secret.is_empty())
        .map(|secret| AdminCapability {
            path: config.hasura_path.clone(),
            ssl: config.hasura_ssl,
            secret: secret.to_string(),
        });

    Ok(CapabilityBundle {
        link_id,
        token: token.to_string(),
        client: DataCapability {
            path: config.gql_path.clone(),
            ssl: config.gql_ssl,
        },
        admin,
    })
}

/// Decodes the payload segment of a JWT without verifying the signature.
pub fn decode_claims(token: &str) -> Result<serde_json::Value, CallError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CallError::InvalidCredential("token has no payload segment".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| CallError::InvalidCredential(format!("payload is not base64: {}", err)))?;

    serde_json::from_slice(&bytes)
        .map_err(|err| CallError::InvalidCredential(format!("payload is not JSON: {}", err)))
}

/// The caller's link id: a top-level `userId` claim, or the Hasura claims
/// namespace's `x-hasura-user-id`. Either may arrive as a number or a
/// numeric string depending on the token issuer.
pub fn caller_identity(claims: &serde_json::Value) -> Option<i64> {
    if let Some(user_id) = claims.get("userId").and_then(claim_as_id) {
        return Some(user_id);
    }
    claims
        .get(HASURA_CLAIMS_NAMESPACE)?
        .get("x-hasura-user-id")
        .and_then(claim_as_id)
}

fn claim_as_id(claim: &serde_json::Value) -> Option<i64> {
    match claim {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
