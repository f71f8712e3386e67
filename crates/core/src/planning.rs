//! Embedded documents carried inside an event record: the guest list and
//! the expense ledger. Both are stored wholesale with the event and
//! replaced wholesale on update.

use serde::{Deserialize, Serialize};

/// Invitation state for a single guest email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl GuestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestStatus::Pending => "Pending",
            GuestStatus::Accepted => "Accepted",
            GuestStatus::Rejected => "Rejected",
        }
    }
}

impl std::str::FromStr for GuestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(GuestStatus::Pending),
            "Accepted" => Ok(GuestStatus::Accepted),
            "Rejected" => Ok(GuestStatus::Rejected),
            other => Err(format!("unknown guest status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestEntry {
    pub email: String,
    pub status: GuestStatus,
}

impl GuestEntry {
    pub fn invited(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            status: GuestStatus::Pending,
        }
    }
}

/// Whether an expense line settles a hired vendor or something ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpenseKind {
    Vendor,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseEntry {
    pub name: String,
    pub amount: f64,
    pub kind: ExpenseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}
