use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, RejectReason};
use crate::model::{BillingState, SubmitRequest};

/// Directory collaborator: user and conversation facts the validator needs.
/// Owned elsewhere; this engine only reads.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Whether `recipient` has blocked `sender`.
    async fn is_blocked(&self, sender_id: Uuid, recipient_id: Uuid) -> bool;

    /// Age in years, when declared.
    async fn age_years(&self, user_id: Uuid) -> Option<u32>;

    /// Whether the account exists at all.
    async fn exists(&self, user_id: Uuid) -> bool;

    /// Declared country, used to derive the conversation's home region.
    async fn country(&self, user_id: Uuid) -> Option<String>;

    /// Whether an external safety process froze the conversation.
    async fn is_conversation_frozen(&self, conversation_id: Uuid) -> bool;
}

/// Permissive directory for deployments that wire the checks elsewhere,
/// and for tests.
pub struct OpenDirectory;

#[async_trait]
impl UserDirectory for OpenDirectory {
    async fn is_blocked(&self, _sender_id: Uuid, _recipient_id: Uuid) -> bool {
        false
    }

    async fn age_years(&self, _user_id: Uuid) -> Option<u32> {
        None
    }

    async fn exists(&self, _user_id: Uuid) -> bool {
        true
    }

    async fn country(&self, _user_id: Uuid) -> Option<String> {
        None
    }

    async fn is_conversation_frozen(&self, _conversation_id: Uuid) -> bool {
        false
    }
}

/// Billing collaborator contract: consulted once, before enqueue, as a
/// pass-through check. This engine never debits or credits; the returned
/// state is carried opaquely on the message and never touched again.
#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn authorize(&self, request: &SubmitRequest) -> EngineResult<BillingState>;
}

/// Default client for unbilled deployments.
pub struct NoopBillingClient;

#[async_trait]
impl BillingClient for NoopBillingClient {
    async fn authorize(&self, _request: &SubmitRequest) -> EngineResult<BillingState> {
        Ok(BillingState::none())
    }
}

/// Ingress checks, in order: structural validity, sender not blocked by any
/// recipient, minimum age, conversation not frozen. The admission token
/// (rate limiter) is taken by the engine right after these pass. No state
/// is mutated here.
pub struct IngressValidator {
    directory: Arc<dyn UserDirectory>,
    minimum_age_years: u32,
}

pub const PLATFORM_MINIMUM_AGE_YEARS: u32 = 13;

impl IngressValidator {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            directory,
            minimum_age_years: PLATFORM_MINIMUM_AGE_YEARS,
        }
    }

    pub async fn check(&self, request: &SubmitRequest) -> EngineResult<()> {
        if request.validate().is_err() {
            return Err(EngineError::validation(RejectReason::Malformed));
        }

        for recipient_id in &request.recipient_ids {
            if !self.directory.exists(*recipient_id).await {
                return Err(EngineError::validation(RejectReason::UnknownRecipient));
            }
            if self.directory.is_blocked(request.sender_id, *recipient_id).await {
                return Err(EngineError::validation(RejectReason::SenderBlocked));
            }
        }

        if let Some(age) = self.directory.age_years(request.sender_id).await {
            if age < self.minimum_age_years {
                return Err(EngineError::validation(RejectReason::BelowMinimumAge));
            }
        }

        if self
            .directory
            .is_conversation_frozen(request.conversation_id)
            .await
        {
            return Err(EngineError::validation(RejectReason::ConversationFrozen));
        }

        Ok(())
    }
}
