use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Reason codes returned by the ingress validator.
///
/// These are stable identifiers surfaced synchronously to the caller; they
/// never describe delivery-time failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// The sender is blocked by at least one recipient.
    SenderBlocked,
    /// The sender does not meet the platform minimum age.
    BelowMinimumAge,
    /// The conversation was frozen by an external safety process.
    ConversationFrozen,
    /// A recipient account does not exist.
    UnknownRecipient,
    /// The request itself is malformed (empty recipients, bad cursor, ...).
    Malformed,
    /// A cancel arrived after the grace window (or after first delivery).
    CancelWindowElapsed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SenderBlocked => "SENDER_BLOCKED",
            RejectReason::BelowMinimumAge => "BELOW_MINIMUM_AGE",
            RejectReason::ConversationFrozen => "CONVERSATION_FROZEN",
            RejectReason::UnknownRecipient => "UNKNOWN_RECIPIENT",
            RejectReason::Malformed => "MALFORMED",
            RejectReason::CancelWindowElapsed => "CANCEL_WINDOW_ELAPSED",
        }
    }
}

/// Engine error taxonomy.
///
/// Validation and rate-limit errors are synchronous and user-visible.
/// Delivery errors are handled internally through retry/backoff and only
/// reach the sender as a terminal "not delivered" notice once a record is
/// dropped. Region unavailability triggers a reroute and is never surfaced
/// to the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0:?}")]
    Validation(RejectReason),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transient delivery failure: {0}")]
    TransientDelivery(String),

    #[error("permanent delivery failure: {0}")]
    PermanentDelivery(String),

    #[error("region unavailable: {0}")]
    RegionUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("billing collaborator rejected the message: {0}")]
    BillingRejected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable code for programmatic handling and audit records.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            EngineError::TransientDelivery(_) => "TRANSIENT_DELIVERY_ERROR",
            EngineError::PermanentDelivery(_) => "PERMANENT_DELIVERY_ERROR",
            EngineError::RegionUnavailable(_) => "REGION_UNAVAILABLE",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::BillingRejected(_) => "BILLING_REJECTED",
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Only transient delivery failures re-enter the backoff schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientDelivery(_))
    }

    /// Log this error with a level matching its severity.
    pub fn log(&self) {
        match self {
            EngineError::Validation(_) | EngineError::RateLimited { .. } => {
                tracing::debug!(error = %self, error_code = %self.error_code(), "Request rejected");
            }
            EngineError::TransientDelivery(_) => {
                tracing::debug!(error = %self, error_code = %self.error_code(), "Delivery attempt failed");
            }
            EngineError::RegionUnavailable(_) => {
                tracing::warn!(error = %self, error_code = %self.error_code(), "Region unavailable");
            }
            _ => {
                tracing::error!(error = %self, error_code = %self.error_code(), "Engine error");
            }
        }
    }

    pub fn validation(reason: RejectReason) -> Self {
        EngineError::Validation(reason)
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::TransientDelivery(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        EngineError::PermanentDelivery(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(EngineError::transient("timeout").is_retryable());
        assert!(!EngineError::permanent("account gone").is_retryable());
        assert!(!EngineError::Validation(RejectReason::SenderBlocked).is_retryable());
        assert!(!EngineError::RateLimited { retry_after_secs: 30 }.is_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            EngineError::RateLimited { retry_after_secs: 1 }.error_code(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            EngineError::Validation(RejectReason::ConversationFrozen).error_code(),
            "VALIDATION_ERROR"
        );
    }
}
