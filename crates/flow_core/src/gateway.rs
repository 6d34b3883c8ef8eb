use async_trait::async_trait;
use shared::{
    domain::{EquivalentCode, ParticipantId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClearingResult, ParticipantSummary, PaymentReceipt, PaymentTarget, TrustlineSummary,
    },
};
use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<ErrorCode>,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn from_api(status: Option<u16>, error: ApiError) -> Self {
        Self {
            message: error.message,
            status,
            code: Some(error.code),
        }
    }

    pub fn actions_disabled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: Some(ErrorCode::ActionsDisabled),
        }
    }

    pub fn is_actions_disabled(&self) -> bool {
        self.code.is_some_and(ErrorCode::is_actions_disabled)
    }
}

/// Implementations never retry.
#[async_trait]
pub trait ActionGateway: Send + Sync {
    async fn send_payment(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
        amount: &str,
    ) -> GatewayResult<PaymentReceipt>;
    async fn create_trustline(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
        limit: &str,
    ) -> GatewayResult<()>;
    async fn update_trustline(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
        new_limit: &str,
    ) -> GatewayResult<()>;
    async fn close_trustline(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> GatewayResult<()>;
    async fn run_clearing(&self, equivalent: &EquivalentCode) -> GatewayResult<ClearingResult>;
    async fn fetch_participants(&self) -> GatewayResult<Vec<ParticipantSummary>>;
    async fn fetch_trustlines(
        &self,
        equivalent: &EquivalentCode,
    ) -> GatewayResult<Vec<TrustlineSummary>>;
    async fn fetch_payment_targets(
        &self,
        equivalent: &EquivalentCode,
        from: &ParticipantId,
        max_hops: u8,
    ) -> GatewayResult<Vec<PaymentTarget>>;
}
