use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

// =============================================================================
// Payment Types
// =============================================================================

/// What a payment buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_for", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentFor {
    Course,
    LiveSession,
    Enquiry,
}

impl PaymentFor {
    /// Course and live-session access is granted to a person, so those
    /// purchases cannot be made as a guest.
    pub fn requires_user(&self) -> bool {
        matches!(self, PaymentFor::Course | PaymentFor::LiveSession)
    }
}

impl std::fmt::Display for PaymentFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentFor::Course => write!(f, "COURSE"),
            PaymentFor::LiveSession => write!(f, "LIVE_SESSION"),
            PaymentFor::Enquiry => write!(f, "ENQUIRY"),
        }
    }
}

/// The single item a payment is for. Holding the id inside the variant keeps
/// "exactly one target reference" true by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "paymentFor", content = "targetId", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentTarget {
    Course(String),
    LiveSession(String),
    Enquiry(String),
}

impl PaymentTarget {
    pub fn new(kind: PaymentFor, id: impl Into<String>) -> Self {
        let id = id.into();
        match kind {
            PaymentFor::Course => PaymentTarget::Course(id),
            PaymentFor::LiveSession => PaymentTarget::LiveSession(id),
            PaymentFor::Enquiry => PaymentTarget::Enquiry(id),
        }
    }

    pub fn kind(&self) -> PaymentFor {
        match self {
            PaymentTarget::Course(_) => PaymentFor::Course,
            PaymentTarget::LiveSession(_) => PaymentFor::LiveSession,
            PaymentTarget::Enquiry(_) => PaymentFor::Enquiry,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            PaymentTarget::Course(id)
            | PaymentTarget::LiveSession(id)
            | PaymentTarget::Enquiry(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Created)
    }

    /// Whether moving from `self` to `next` is a legal step of the state
    /// machine. Only `created` may move, and only to a terminal state.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        *self == PaymentStatus::Created && next.is_terminal()
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Created => write!(f, "created"),
            PaymentStatus::Success => write!(f, "success"),
            PaymentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = crate::DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(PaymentStatus::Created),
            "success" => Ok(PaymentStatus::Success),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(crate::DbError::encoding(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }
}

/// `failure_reason` recorded when a confirmation carries a signature that
/// does not verify.
pub const FAILURE_BAD_SIGNATURE: &str = "bad_signature";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    #[serde(flatten)]
    pub target: PaymentTarget,
    pub user_id: Option<String>,
    /// Smallest currency unit (paise for INR).
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    #[serde(skip_serializing)]
    pub gateway_signature: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn payment_for(&self) -> PaymentFor {
        self.target.kind()
    }
}

/// Raw `payments` row. The three nullable target columns are folded into a
/// [`PaymentTarget`] by the converters.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct PaymentRow {
    pub id: Uuid,
    pub payment_for: PaymentFor,
    pub course_id: Option<String>,
    pub live_session_id: Option<String>,
    pub enquiry_id: Option<String>,
    pub user_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub gateway_order_id: String,
    pub gateway_payment_id: Option<String>,
    pub gateway_signature: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub target: PaymentTarget,
    pub user_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub gateway_order_id: String,
}

/// Result of inserting a pending payment. A repeated insert for the same
/// gateway order is not an error; it hands back the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Payment),
    Existing(Payment),
}

impl CreateOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            CreateOutcome::Created(p) | CreateOutcome::Existing(p) => p,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            CreateOutcome::Created(p) | CreateOutcome::Existing(p) => p,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Existing(_))
    }
}

/// Result of a compare-and-swap on a payment's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// This caller moved the payment out of `created`.
    Applied(Payment),
    /// The payment was already terminal; nothing was written.
    AlreadyTerminal(Payment),
}

impl Transition {
    pub fn payment(&self) -> &Payment {
        match self {
            Transition::Applied(p) | Transition::AlreadyTerminal(p) => p,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            Transition::Applied(p) | Transition::AlreadyTerminal(p) => p,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

// =============================================================================
// Enrollment Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub target: PaymentTarget,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct EnrollmentRow {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub user_id: Option<String>,
    pub payment_for: PaymentFor,
    pub target_id: String,
    pub created_at: DateTime<Utc>,
}

/// Price of a purchasable item as listed in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CatalogPrice {
    pub amount: i64,
    pub currency: String,
}

// =============================================================================
// Enrollment Retry Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "enrollment_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentJobState {
    Pending,
    Done,
    Dead,
}

/// A payment whose enrollment still has to be applied. Keyed by payment id,
/// so enqueueing the same payment twice leaves a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct EnrollmentJob {
    pub payment_id: Uuid,
    pub attempts: i32,
    pub state: EnrollmentJobState,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_status_only_moves_forward() {
        use PaymentStatus::*;
        assert!(Created.can_transition_to(Success));
        assert!(Created.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Created));
        for terminal in [Success, Failed] {
            for next in [Created, Success, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        assert_eq!(
            "SUCCESS".parse::<PaymentStatus>().unwrap(),
            PaymentStatus::Success
        );
        assert!("captured".parse::<PaymentStatus>().is_err());
        assert!("".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_target_serializes_with_kind() {
        let target = PaymentTarget::new(PaymentFor::LiveSession, "ls_1");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["paymentFor"], "LIVE_SESSION");
        assert_eq!(json["targetId"], "ls_1");
        assert_eq!(target.kind(), PaymentFor::LiveSession);
        assert_eq!(target.id(), "ls_1");
    }

    #[test]
    fn test_guest_payments_only_for_enquiries() {
        assert!(PaymentFor::Course.requires_user());
        assert!(PaymentFor::LiveSession.requires_user());
        assert!(!PaymentFor::Enquiry.requires_user());
    }
}
