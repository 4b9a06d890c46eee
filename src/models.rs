use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Alert type emitted by the risk analyzer.
pub const MULTI_FACTOR_ALERT: &str = "multi-factor";

/// Per-factor risk tier. Ordered so that `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            _ => Err(ValidationError::UnknownRiskLevel(s.to_string())),
        }
    }
}

/// Overall risk level aggregated from the three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn requires_attention(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            _ => Err(ValidationError::UnknownRiskLevel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePaymentStatus {
    Paid,
    Partial,
    Pending,
    Overdue,
}

impl FeePaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeePaymentStatus::Paid => "paid",
            FeePaymentStatus::Partial => "partial",
            FeePaymentStatus::Pending => "pending",
            FeePaymentStatus::Overdue => "overdue",
        }
    }
}

impl fmt::Display for FeePaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeePaymentStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paid" => Ok(FeePaymentStatus::Paid),
            "partial" => Ok(FeePaymentStatus::Partial),
            "pending" => Ok(FeePaymentStatus::Pending),
            "overdue" => Ok(FeePaymentStatus::Overdue),
            _ => Err(ValidationError::UnknownFeeStatus(s.to_string())),
        }
    }
}

/// Dedup key for open alerts: one unacknowledged alert per (type, severity).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub alert_type: String,
    pub severity: RiskLevel,
}

/// Read-only bundle of a student's current data fed into the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentSnapshot {
    pub attendance_percentage: f64,
    pub gpa: f64,
    pub recent_test_percentages: Vec<f64>,
    pub fee_payment_status: FeePaymentStatus,
    pub fee_pending_amount: f64,
    pub fee_due_date: Option<NaiveDate>,
    pub existing_unacknowledged_alerts: HashSet<AlertKey>,
}

impl Default for StudentSnapshot {
    fn default() -> Self {
        Self {
            attendance_percentage: 0.0,
            gpa: 0.0,
            recent_test_percentages: Vec::new(),
            fee_payment_status: FeePaymentStatus::Pending,
            fee_pending_amount: 0.0,
            fee_due_date: None,
            existing_unacknowledged_alerts: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    pub severity: RiskLevel,
    pub message: String,
    pub acknowledged: bool,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            alert_type: self.alert_type.clone(),
            severity: self.severity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAnalysis {
    pub attendance_risk: RiskTier,
    pub academic_risk: RiskTier,
    pub financial_risk: RiskTier,
    pub overall_risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub generated_alert: Option<Alert>,
}

/// Who an alert message names. Needs a name plus a roll number or an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub name: String,
    pub roll_number: Option<String>,
    pub email: Option<String>,
}

impl StudentIdentity {
    pub fn new(
        name: &str,
        roll_number: Option<&str>,
        email: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingIdentity("name is empty"));
        }

        let non_blank = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let roll_number = non_blank(roll_number);
        let email = non_blank(email);

        if roll_number.is_none() && email.is_none() {
            return Err(ValidationError::MissingIdentity(
                "either a roll number or an email is required",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            roll_number,
            email,
        })
    }

    /// Roll number when known, otherwise email.
    pub fn label(&self) -> &str {
        self.roll_number
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct StoredAnalysis {
    pub analysis: RiskAnalysis,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StudentOverview {
    pub student_id: Uuid,
    pub identity: StudentIdentity,
    pub attendance_percentage: Option<f64>,
    pub analysis: Option<StoredAnalysis>,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub identity: StudentIdentity,
    pub alert: Alert,
    pub created_at: DateTime<Utc>,
}

/// Role an invitation code enrolls its holder as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationRole {
    Student,
    Mentor,
}

impl InvitationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationRole::Student => "student",
            InvitationRole::Mentor => "mentor",
        }
    }
}

impl fmt::Display for InvitationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvitationRole {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(InvitationRole::Student),
            "mentor" => Ok(InvitationRole::Mentor),
            _ => Err(ValidationError::UnknownInvitationRole(s.to_string())),
        }
    }
}

/// Organization-scoped code that lets a student or mentor join. Codes are
/// reusable; `uses` counts enrollments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invitation {
    pub code: String,
    pub organization_id: Uuid,
    pub role: InvitationRole,
    pub uses: i64,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    /// Six-digit code derived from `entropy`.
    pub fn code_from(entropy: u128) -> String {
        (100_000 + entropy % 900_000).to_string()
    }

    /// Organization joined by redeeming this code as `role`.
    pub fn organization_for(&self, role: InvitationRole) -> Result<Uuid, ValidationError> {
        if self.role != role {
            return Err(ValidationError::InvitationRoleMismatch {
                code: self.code.clone(),
                issued_for: self.role.as_str(),
                requested: role.as_str(),
            });
        }
        Ok(self.organization_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Department {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub student_count: i64,
}

#[derive(Debug, Clone)]
pub struct WellbeingSummary {
    pub responses: usize,
    pub avg_mood: f64,
    pub avg_stress: f64,
    pub avg_sleep: f64,
}
