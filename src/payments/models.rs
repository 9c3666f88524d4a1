use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// key: payment-models -> intents,plans,status machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "approved" => Some(PaymentStatus::Approved),
            "rejected" => Some(PaymentStatus::Rejected),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Weekly,
    Monthly,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Weekly => "weekly",
            PlanKind::Monthly => "monthly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "weekly" => Some(PlanKind::Weekly),
            "monthly" => Some(PlanKind::Monthly),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PlanKind::Weekly => "Weekly Plan",
            PlanKind::Monthly => "Monthly Plan",
        }
    }

    /// Fixed tier pricing in integer minor units.
    pub fn amount_cents(&self) -> i64 {
        match self {
            PlanKind::Weekly => 1000,
            PlanKind::Monthly => 2000,
        }
    }

    /// Entitlement extension granted by one approved purchase.
    pub fn duration(&self) -> Duration {
        match self {
            PlanKind::Weekly => Duration::days(7),
            PlanKind::Monthly => Duration::days(30),
        }
    }
}

/// Durable record of one payment intent. Append-only; the status field is
/// the only mutable part and moves exclusively through the ledger guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub user_id: i64,
    pub plan: PlanKind,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub qr_code: String,
    pub qr_code_base64: String,
    pub ticket_url: String,
}
