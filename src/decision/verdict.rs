//! Oracle verdicts.

use reqwest::StatusCode;

/// Final answer for one call, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied(Option<String>),
    RateLimited(Option<String>),
    OracleError(String),
}

impl Verdict {
    /// Metrics and log label.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Denied(_) => "denied",
            Verdict::RateLimited(_) => "rate_limited",
            Verdict::OracleError(_) => "oracle_error",
        }
    }
}

/// What the oracle's HTTP status says, before the body is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleOutcome {
    Allow,
    Forbid,
    Overload,
    Unrecognized(StatusCode),
}

impl OracleOutcome {
    pub fn classify(status: StatusCode) -> Self {
        match status {
            StatusCode::OK | StatusCode::NO_CONTENT => OracleOutcome::Allow,
            StatusCode::FORBIDDEN => OracleOutcome::Forbid,
            StatusCode::TOO_MANY_REQUESTS => OracleOutcome::Overload,
            other => OracleOutcome::Unrecognized(other),
        }
    }

    /// Whether the reply body carries a reason worth reading.
    pub fn wants_reason(self) -> bool {
        matches!(self, OracleOutcome::Forbid | OracleOutcome::Overload)
    }

    pub fn into_verdict(self, reason: Option<String>) -> Verdict {
        match self {
            OracleOutcome::Allow => Verdict::Approved,
            OracleOutcome::Forbid => Verdict::Denied(reason),
            OracleOutcome::Overload => Verdict::RateLimited(reason),
            OracleOutcome::Unrecognized(status) => {
                Verdict::OracleError(format!("unexpected oracle status {}", status.as_u16()))
            }
        }
    }
}
