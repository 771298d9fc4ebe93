//! Domain error taxonomy. Each subsystem returns its own `thiserror` enum;
//! binaries and orchestration code compose them under `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read template '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing key '{0}' (strict missing-key policy)")]
    MissingKey(String),
    #[error("unknown template helper '{0}'")]
    UnknownHelper(String),
    #[error("helper '{helper}' called with wrong arguments: {detail}")]
    BadHelperArgs { helper: String, detail: String },
    #[error("malformed template expression: {0}")]
    Malformed(String),
    #[error("rendered manifest is not valid YAML/JSON: {0}")]
    InvalidOutput(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transient API error, retries exhausted: {0}")]
    Transient(String),
    #[error("permanent API error: {0}")]
    Permanent(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Error)]
#[error("wait for readiness timed out after {elapsed_secs}s (limit {limit_secs}s): {context}")]
pub struct WaitTimeoutError {
    pub elapsed_secs: u64,
    pub limit_secs: u64,
    pub context: String,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("tcp connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("probe pod exec failed: {0}")]
    Exec(String),
    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("indexer io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("indexer serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter acquisition cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    #[error("wait timeout: {0}")]
    WaitTimeout(#[from] WaitTimeoutError),
    #[error("job cancelled")]
    Cancelled,
}
