use isolate::PoolConfig;

/// Service configuration, read once at startup. Variable names are kept
/// stable so existing compose files keep working.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    /// GraphQL endpoint for the data client capability (GQL_URN).
    pub gql_path: String,
    pub gql_ssl: bool,
    /// Administrative API endpoint for the elevated capability
    /// (DEEPLINKS_HASURA_PATH).
    pub hasura_path: String,
    pub hasura_ssl: bool,
    pub workers: usize,
    pub call_timeout_ms: u64,
    /// Status code used when a passthrough call rejects before the callable
    /// wrote a response. Historically always 200; deployments that want an
    /// error status set HTTP_CALL_REJECTION_STATUS.
    pub passthrough_rejection_status: u16,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(&|var| std::env::var(var).ok())
    }

    pub fn from_env_with<F>(env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PoolConfig::default();
        Self {
            port: env_get("PORT")
                .and_then(|value| value.parse().ok())
                .unwrap_or(9090),
            gql_path: env_get("GQL_URN")
                .unwrap_or_else(|| "host.docker.internal:3006/gql".to_string()),
            gql_ssl: env_truthy_with("GQL_SSL", env_get),
            hasura_path: env_get("DEEPLINKS_HASURA_PATH")
                .unwrap_or_else(|| "host.docker.internal:8080".to_string()),
            hasura_ssl: env_truthy_with("DEEPLINKS_HASURA_SSL", env_get),
            workers: env_get("CALL_WORKERS")
                .and_then(|value| value.parse().ok())
                .filter(|workers| *workers > 0)
                .unwrap_or(defaults.num_workers),
            call_timeout_ms: env_get("CALL_TIMEOUT_MS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.request_timeout_ms),
            passthrough_rejection_status: env_get("HTTP_CALL_REJECTION_STATUS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(200),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            num_workers: self.workers,
            request_timeout_ms: self.call_timeout_ms,
        }
    }
}

pub fn env_truthy_with<F>(var: &str, env_get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env_get(var).map(|value| is_truthy(&value)).unwrap_or(false)
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}
