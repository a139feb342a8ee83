use thiserror::Error;

/// Typed failures that stop a run (or a database group) outright.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported schema format: {0}")]
    UnsupportedFormat(String),

    #[error("unknown prompt style: {0}")]
    UnknownPromptStyle(String),

    #[error("prompt style {style} requires shots > 0")]
    MissingExamples { style: String },

    #[error("database {db_id}: {detail}")]
    Database { db_id: String, detail: String },

    #[error("persistence error at {path}: {detail}")]
    Persistence { path: String, detail: String },
}

impl PipelineError {
    pub fn database(db_id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Database {
            db_id: db_id.into(),
            detail: detail.to_string(),
        }
    }

    pub fn persistence(path: &std::path::Path, detail: impl std::fmt::Display) -> Self {
        Self::Persistence {
            path: path.display().to_string(),
            detail: detail.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunErrorKind {
    MissingConfig,
    ConfigParse,
    ProviderRateLimit,
    ProviderTimeout,
    ProviderServer,
    ProviderAuth,
    Network,
    MalformedOutput,
    Other,
}

/// Structured provider/runtime error. Providers build these directly; free-form
/// messages from anywhere else go through [`RunError::classify_message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub provider: Option<String>,
    pub detail: Option<String>,
    /// True when kind was inferred from free-form message parsing.
    pub legacy_classified: bool,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            status: None,
            provider: None,
            detail: None,
            legacy_classified: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn missing_config(path: impl Into<String>, detail: impl Into<String>) -> Self {
        let path = path.into();
        let detail = detail.into();
        Self::new(
            RunErrorKind::MissingConfig,
            format!("Config file not found: {}", path),
        )
        .with_path(path)
        .with_detail(detail)
    }

    pub fn config_parse(path: Option<String>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let mut err = Self::new(RunErrorKind::ConfigParse, detail.clone()).with_detail(detail);
        if let Some(path) = path {
            err = err.with_path(path);
        }
        err
    }

    pub fn provider_rate_limit(status: u16, provider: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            RunErrorKind::ProviderRateLimit,
            format!("{provider} rate limit (status {status}): {detail}"),
        )
        .with_status(status)
        .with_provider(provider)
        .with_detail(detail)
    }

    pub fn provider_status(status: u16, provider: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let kind = match status {
            401 | 403 => RunErrorKind::ProviderAuth,
            408 => RunErrorKind::ProviderTimeout,
            429 => RunErrorKind::ProviderRateLimit,
            500..=599 => RunErrorKind::ProviderServer,
            // Some gateways report exhausted quota as 400 with a descriptive body.
            _ if is_quota_text(&detail) => RunErrorKind::ProviderRateLimit,
            _ => RunErrorKind::Other,
        };
        Self::new(kind, format!("{provider} API error (status {status}): {detail}"))
            .with_status(status)
            .with_provider(provider)
            .with_detail(detail)
    }

    pub fn network(provider: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(RunErrorKind::Network, format!("{provider} network error: {detail}"))
            .with_provider(provider)
            .with_detail(detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(RunErrorKind::MalformedOutput, detail.clone()).with_detail(detail)
    }

    pub fn classify_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let msg = message.to_lowercase();

        let kind = if msg.contains("no config found")
            || msg.contains("config file not found")
            || (msg.contains("failed to read config") && msg.contains("os error 2"))
        {
            RunErrorKind::MissingConfig
        } else if msg.contains("config error")
            || msg.contains("failed to parse yaml")
            || msg.contains("unknown field")
            || msg.contains("missing field")
        {
            RunErrorKind::ConfigParse
        } else if is_quota_text(&msg) {
            RunErrorKind::ProviderRateLimit
        } else if msg.contains("timeout") || msg.contains("timed out") {
            RunErrorKind::ProviderTimeout
        } else if msg.contains("500")
            || msg.contains("502")
            || msg.contains("503")
            || msg.contains("504")
            || msg.contains("provider error")
        {
            RunErrorKind::ProviderServer
        } else if msg.contains("unauthorized") || msg.contains("invalid api key") {
            RunErrorKind::ProviderAuth
        } else if msg.contains("network") || msg.contains("connection") || msg.contains("dns") {
            RunErrorKind::Network
        } else {
            RunErrorKind::Other
        };

        let mut run_error = Self::new(kind, message);
        run_error.legacy_classified = true;
        run_error
    }

    /// Typed errors are taken as-is; anything else is classified by message.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(run_error) = err.downcast_ref::<RunError>() {
            return run_error.clone();
        }
        Self::classify_message(format!("{err:#}"))
    }

    pub fn is_quota(&self) -> bool {
        self.kind == RunErrorKind::ProviderRateLimit
    }
}

fn is_quota_text(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("rate limit")
        || msg.contains("rate_limit")
        || msg.contains("quota")
        || msg.contains("resource exhausted")
        || msg.contains("resource_exhausted")
        || msg.contains("429")
}

/// Quota predicate used by the retry layer.
pub fn is_quota_exhausted(err: &anyhow::Error) -> bool {
    RunError::from_anyhow(err).is_quota()
}
