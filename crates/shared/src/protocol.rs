use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EquivalentCode, ParticipantId, TrustlineStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    pub display_name: String,
}

/// Amounts travel as decimal strings; the backend owns the arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustlineSummary {
    pub from_id: ParticipantId,
    pub to_id: ParticipantId,
    pub limit: String,
    pub used: String,
    pub reverse_used: String,
    pub available: String,
    pub status: TrustlineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentTarget {
    pub to_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearingEdge {
    pub from_id: ParticipantId,
    pub to_id: ParticipantId,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearingCycle {
    pub edges: Vec<ClearingEdge>,
    pub cleared_amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearingResult {
    pub cycles: Vec<ClearingCycle>,
    pub total_cleared: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl PaymentReceipt {
    /// A 2xx answer can still carry a payment that did not commit.
    pub fn is_rejected(&self) -> bool {
        self.status.as_deref().is_some_and(|status| {
            ["rejected", "aborted", "failed"]
                .iter()
                .any(|rejected| status.eq_ignore_ascii_case(rejected))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub equivalent: EquivalentCode,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustlineLimitRequest {
    pub equivalent: EquivalentCode,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub limit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustlineCloseRequest {
    pub equivalent: EquivalentCode,
    pub from: ParticipantId,
    pub to: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearingRequest {
    pub equivalent: EquivalentCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTargetsQuery {
    pub equivalent: EquivalentCode,
    pub from: ParticipantId,
    pub max_hops: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalentQuery {
    pub equivalent: EquivalentCode,
}
