use thiserror::Error;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocess,
    Hosting,
    Invocation,
    Resolution,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Hosting => "hosting",
            Stage::Invocation => "invocation",
            Stage::Resolution => "resolution",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes surfaced to callers and recorded in receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Decode,
    HostingExhausted,
    Validation,
    Transient,
    Auth,
    Quota,
    NoResult,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Decode => "decode",
            FailureKind::HostingExhausted => "hosting_exhausted",
            FailureKind::Validation => "validation",
            FailureKind::Transient => "transient",
            FailureKind::Auth => "auth",
            FailureKind::Quota => "quota",
            FailureKind::NoResult => "no_result",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the try-on pipeline.
///
/// `Validation` means the remote service rejected the request shape and a
/// different field spelling may succeed. `Transient` covers timeouts,
/// connect failures and 5xx responses and is worth retrying. `Auth` and
/// `Quota` are terminal for the whole variant. Detail strings are truncated
/// provider text and never contain credentials.
#[derive(Error, Debug, Clone)]
pub enum TryOnError {
    #[error("image decode failed: {detail}")]
    Decode { detail: String },

    #[error("no hosting backend produced a fetchable url: {detail}")]
    HostingExhausted { detail: String },

    #[error("{provider} rejected the request: {detail}")]
    Validation { provider: String, detail: String },

    #[error("{provider} transient failure: {detail}")]
    Transient { provider: String, detail: String },

    #[error("{provider} authentication failed: {detail}")]
    Auth { provider: String, detail: String },

    #[error("{provider} quota exhausted: {detail}")]
    Quota { provider: String, detail: String },

    #[error("{provider} returned a response with no usable image")]
    NoResult { provider: String },
}

impl TryOnError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TryOnError::Decode { .. } => FailureKind::Decode,
            TryOnError::HostingExhausted { .. } => FailureKind::HostingExhausted,
            TryOnError::Validation { .. } => FailureKind::Validation,
            TryOnError::Transient { .. } => FailureKind::Transient,
            TryOnError::Auth { .. } => FailureKind::Auth,
            TryOnError::Quota { .. } => FailureKind::Quota,
            TryOnError::NoResult { .. } => FailureKind::NoResult,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            TryOnError::Decode { .. } | TryOnError::HostingExhausted { .. } => None,
            TryOnError::Validation { provider, .. }
            | TryOnError::Transient { provider, .. }
            | TryOnError::Auth { provider, .. }
            | TryOnError::Quota { provider, .. }
            | TryOnError::NoResult { provider } => Some(provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        let err = TryOnError::Quota {
            provider: "replicate".to_string(),
            detail: "insufficient credit".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Quota);
        assert_eq!(err.provider(), Some("replicate"));

        let err = TryOnError::Decode {
            detail: "not an image".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::Decode);
        assert_eq!(err.provider(), None);
    }

    #[test]
    fn display_names_provider_and_detail() {
        let err = TryOnError::Validation {
            provider: "segmind".to_string(),
            detail: "unknown field cloth_image".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("segmind"));
        assert!(text.contains("unknown field cloth_image"));
    }

    #[test]
    fn stage_and_kind_strings_are_stable() {
        assert_eq!(Stage::Preprocess.as_str(), "preprocess");
        assert_eq!(Stage::Resolution.to_string(), "resolution");
        assert_eq!(FailureKind::HostingExhausted.as_str(), "hosting_exhausted");
        assert_eq!(FailureKind::NoResult.to_string(), "no_result");
    }
}
