use thiserror::Error;

/// Rejections raised at the boundary before data reaches the analyzer or the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown fee payment status `{0}` (expected paid, partial, pending or overdue)")]
    UnknownFeeStatus(String),

    #[error("unknown attendance status `{0}` (expected present, absent or late)")]
    UnknownAttendanceStatus(String),

    #[error("unknown risk level `{0}`")]
    UnknownRiskLevel(String),

    #[error("student identity is incomplete: {0}")]
    MissingIdentity(&'static str),

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("obtained marks {obtained} exceed maximum marks {max}")]
    MarksExceedMaximum { obtained: f64, max: f64 },

    #[error("payment amount must be positive, got {0}")]
    NonPositivePayment(f64),

    #[error("invalid test score `{0}`")]
    InvalidTestScore(String),

    #[error("unknown invitation role `{0}` (expected student or mentor)")]
    UnknownInvitationRole(String),

    #[error("invitation code {code} is for a {issued_for}, not a {requested}")]
    InvitationRoleMismatch {
        code: String,
        issued_for: &'static str,
        requested: &'static str,
    },

    #[error("line {line}: {source}")]
    Import {
        line: u64,
        #[source]
        source: Box<ValidationError>,
    },
}
