//! Operator configuration

use std::time::Duration;

/// Default reporting controller name for events
pub const DEFAULT_REPORTER: &str = "mallory-operator";

/// Runtime configuration for the reconciliation core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Controller name attached to published events
    pub reporter: String,
    /// Namespace to watch; all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Requeue delay after a failed pass, in seconds
    pub error_requeue_secs: u64,
    /// Upper bound for one exec or log stream, in seconds
    pub stream_timeout_secs: u64,
    /// Bytes kept per captured stream
    pub max_output_bytes: usize,
    /// Lines requested from a pod log
    pub log_tail_lines: i64,
}

impl OperatorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With reporter name
    #[inline]
    #[must_use]
    pub fn with_reporter(mut self, reporter: impl Into<String>) -> Self {
        self.reporter = reporter.into();
        self
    }

    /// With watched namespace
    #[inline]
    #[must_use]
    pub fn with_watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.watch_namespace = namespace;
        self
    }

    /// With error requeue delay
    #[inline]
    #[must_use]
    pub fn with_error_requeue_secs(mut self, secs: u64) -> Self {
        self.error_requeue_secs = secs;
        self
    }

    /// With stream timeout
    #[inline]
    #[must_use]
    pub fn with_stream_timeout_secs(mut self, secs: u64) -> Self {
        self.stream_timeout_secs = secs;
        self
    }

    /// With captured output cap
    #[inline]
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// With log tail length
    #[inline]
    #[must_use]
    pub fn with_log_tail_lines(mut self, lines: i64) -> Self {
        self.log_tail_lines = lines;
        self
    }

    /// Requeue delay as a `Duration`
    #[inline]
    #[must_use]
    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    /// Stream timeout as a `Duration`
    #[inline]
    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// Stream limits handed to scoped clients
    #[inline]
    #[must_use]
    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            timeout: self.stream_timeout(),
            max_output_bytes: self.max_output_bytes,
        }
    }

    /// Reject values that would make every stream fail
    ///
    /// # Errors
    /// `Error::Config` naming the offending field
    pub fn validate(&self) -> crate::Result<()> {
        if self.reporter.is_empty() {
            return Err(crate::Error::Config("reporter must not be empty".to_string()));
        }
        if self.stream_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "stream timeout must be at least one second".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(crate::Error::Config("max output bytes must be positive".to_string()));
        }
        if self.log_tail_lines <= 0 {
            return Err(crate::Error::Config("log tail lines must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            reporter: DEFAULT_REPORTER.to_string(),
            watch_namespace: None,
            error_requeue_secs: 30,
            stream_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
            log_tail_lines: 10,
        }
    }
}

/// Bounds applied to exec and log streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Wall-clock bound for the whole stream
    pub timeout: Duration,
    /// Bytes kept per captured stream
    pub max_output_bytes: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        OperatorConfig::default().stream_limits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OperatorConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_tail_lines, 10);
        assert_eq!(config.reporter, DEFAULT_REPORTER);
    }

    #[test]
    fn builder_overrides() {
        let config = OperatorConfig::new()
            .with_reporter("red-team")
            .with_watch_namespace(Some("sandbox".to_string()))
            .with_stream_timeout_secs(5)
            .with_max_output_bytes(64);

        assert_eq!(config.reporter, "red-team");
        assert_eq!(config.watch_namespace.as_deref(), Some("sandbox"));
        assert_eq!(
            config.stream_limits(),
            StreamLimits {
                timeout: Duration::from_secs(5),
                max_output_bytes: 64,
            }
        );
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = OperatorConfig::new().with_stream_timeout_secs(0).validate().unwrap_err();
        assert!(err.to_string().contains("stream timeout"));
    }

    #[test]
    fn non_positive_tail_rejected() {
        assert!(OperatorConfig::new().with_log_tail_lines(0).validate().is_err());
    }
}
