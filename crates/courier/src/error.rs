// ABOUTME: Error types for the courier pipeline including the ErrorCode enum and CourierError struct.
// ABOUTME: Provides categorized errors with convenience constructors and boolean helpers.

use std::fmt;

/// Error codes representing the failure classes of a migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Scheme, host, or resolved address rejected by policy.
    PolicyViolation,
    /// Declared content type or length failed the pre-flight probe.
    ProbeRejected,
    /// Size ceiling exceeded, network error, or bad status during the real transfer.
    TransferAborted,
    /// The overall deadline fired. A transfer abort for retry purposes.
    Timeout,
    /// Disk write, rename, or permission error.
    StorageFailure,
    /// Options rejected at build time.
    InvalidConfig,
}

impl ErrorCode {
    /// Only transfer-class failures are worth retrying later, and only by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::TransferAborted | ErrorCode::Timeout)
    }

    /// Stable snake_case name used in JSON output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PolicyViolation => "policy_violation",
            ErrorCode::ProbeRejected => "probe_rejected",
            ErrorCode::TransferAborted => "transfer_aborted",
            ErrorCode::Timeout => "timeout",
            ErrorCode::StorageFailure => "storage_failure",
            ErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::PolicyViolation => "policy violation",
            ErrorCode::ProbeRejected => "probe rejected",
            ErrorCode::TransferAborted => "transfer aborted",
            ErrorCode::Timeout => "timeout",
            ErrorCode::StorageFailure => "storage failure",
            ErrorCode::InvalidConfig => "invalid configuration",
        };
        write!(f, "{}", s)
    }
}

/// The main error type for courier operations.
#[derive(Debug, thiserror::Error)]
pub struct CourierError {
    pub code: ErrorCode,
    pub url: String,
    pub op: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl fmt::Display for CourierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "courier: {} {}: {}", self.op, self.url, self.code)?;
        if let Some(ref src) = self.source {
            write!(f, ": {}", src)?;
        }
        Ok(())
    }
}

impl CourierError {
    fn new(
        code: ErrorCode,
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self {
            code,
            url: crate::redact_url(&url.into()),
            op: op.into(),
            source,
        }
    }

    /// Create a PolicyViolation error.
    pub fn policy(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::PolicyViolation, url, op, source)
    }

    /// Create a ProbeRejected error.
    pub fn probe(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::ProbeRejected, url, op, source)
    }

    /// Create a TransferAborted error.
    pub fn transfer(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::TransferAborted, url, op, source)
    }

    /// Create a Timeout error.
    pub fn timeout(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::Timeout, url, op, source)
    }

    /// Create a StorageFailure error.
    pub fn storage(
        url: impl Into<String>,
        op: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        Self::new(ErrorCode::StorageFailure, url, op, source)
    }

    /// Create an InvalidConfig error. Config errors have no URL.
    pub fn config(op: impl Into<String>, source: Option<anyhow::Error>) -> Self {
        Self::new(ErrorCode::InvalidConfig, String::new(), op, source)
    }

    /// Returns true if this is a PolicyViolation error.
    pub fn is_policy_violation(&self) -> bool {
        self.code == ErrorCode::PolicyViolation
    }

    /// Returns true if this is a ProbeRejected error.
    pub fn is_probe_rejected(&self) -> bool {
        self.code == ErrorCode::ProbeRejected
    }

    /// Returns true for TransferAborted, including timeouts.
    pub fn is_transfer_aborted(&self) -> bool {
        matches!(self.code, ErrorCode::TransferAborted | ErrorCode::Timeout)
    }

    /// Returns true if this is a Timeout error.
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    /// Returns true if this is a StorageFailure error.
    pub fn is_storage_failure(&self) -> bool {
        self.code == ErrorCode::StorageFailure
    }

    /// Returns true if this is an InvalidConfig error.
    pub fn is_invalid_config(&self) -> bool {
        self.code == ErrorCode::InvalidConfig
    }

    /// The error's message without the URL, safe to hand back to untrusted callers.
    pub fn reason(&self) -> String {
        match self.source {
            Some(ref src) => format!("{}: {}", self.code, src),
            None => self.code.to_string(),
        }
    }
}
