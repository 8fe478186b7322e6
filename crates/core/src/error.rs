use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("not found for {entity}: {details}")]
    NotFound { entity: String, details: String },

    #[error("ambiguous question: {0}")]
    Ambiguous(String),

    #[error("{service} unavailable: {details}")]
    UpstreamUnavailable { service: String, details: String },

    #[error("no index built for {0}")]
    IndexNotBuilt(String),

    #[error("corrupt index for {entity}: {details}")]
    CorruptIndex { entity: String, details: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal failure in {handler}: {details}")]
    Internal { handler: String, details: String },
}

impl RagError {
    pub fn not_found(entity: impl Into<String>, details: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            details: details.into(),
        }
    }

    pub fn upstream(service: impl Into<String>, details: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            details: details.into(),
        }
    }

    pub fn corrupt(entity: impl Into<String>, details: impl Into<String>) -> Self {
        Self::CorruptIndex {
            entity: entity.into(),
            details: details.into(),
        }
    }

    /// Errors the caller can act on (re-prompt, retry, rebuild) rather than internal faults.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Ambiguous(_)
                | Self::IndexNotBuilt(_)
                | Self::UpstreamUnavailable { .. }
                | Self::CorruptIndex { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unexpected response from {url}: {status}")]
    BadResponse { url: String, status: String },

    #[error("source not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Storage(Box<RagError>),
}

impl From<RagError> for FetchError {
    fn from(value: RagError) -> Self {
        FetchError::Storage(Box::new(value))
    }
}

impl From<FetchError> for RagError {
    fn from(value: FetchError) -> Self {
        match value {
            FetchError::UnknownEntity(entity) => {
                RagError::not_found(entity, "no filer registered under this symbol")
            }
            FetchError::Io(error) => RagError::Io(error),
            FetchError::Serialization(error) => RagError::Serialization(error),
            FetchError::Url(error) => RagError::Url(error),
            FetchError::Storage(error) => *error,
            other => RagError::upstream("filing source", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_maps_to_not_found() {
        let error: RagError = FetchError::UnknownEntity("ZZZZ".to_string()).into();
        assert!(matches!(error, RagError::NotFound { ref entity, .. } if entity == "ZZZZ"));
        assert!(error.is_user_facing());
    }

    #[test]
    fn transport_failures_map_to_upstream() {
        let error: RagError = FetchError::BadResponse {
            url: "https://data.sec.gov".to_string(),
            status: "503".to_string(),
        }
        .into();
        assert!(matches!(error, RagError::UpstreamUnavailable { .. }));
    }

    #[test]
    fn plumbing_errors_are_not_user_facing() {
        let error = RagError::InvalidArgument("x".to_string());
        assert!(!error.is_user_facing());
    }
}
