use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::models::{AlertKey, FeePaymentStatus, StudentIdentity, StudentSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }

    /// Late arrivals still count towards attendance.
    pub fn counts_as_attended(&self) -> bool {
        !matches!(self, AttendanceStatus::Absent)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            "late" => Ok(AttendanceStatus::Late),
            _ => Err(ValidationError::UnknownAttendanceStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub subject: String,
}

/// Attendance a student arrives with, before session-level tracking began.
/// `classes` is how many sessions the reported percentage stands for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceBaseline {
    pub percentage: f64,
    pub classes: i64,
}

impl AttendanceBaseline {
    pub const REPORTED_CLASSES: i64 = 100;

    /// Baseline for a reported percentage, kept as given (clamped to 0-100).
    pub fn from_percentage(percentage: f64) -> Self {
        Self {
            percentage: clamp_percentage(percentage),
            classes: Self::REPORTED_CLASSES,
        }
    }

    /// Share of classes attended across the baseline and `sessions` recorded
    /// sessions, unrounded. `None` when no classes are known at all.
    pub fn combined_with(&self, sessions: i64, attended: i64) -> Option<f64> {
        let baseline_classes = self.classes.max(0) as f64;
        let sessions = sessions.max(0);
        let total = baseline_classes + sessions as f64;
        if total <= 0.0 {
            return None;
        }

        let attended = baseline_classes * clamp_percentage(self.percentage) / 100.0
            + attended.clamp(0, sessions) as f64;
        Some((attended * 100.0 / total).min(100.0))
    }
}

fn clamp_percentage(percentage: f64) -> f64 {
    if percentage.is_finite() {
        percentage.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Percentage of classes attended across the baseline and the recorded sessions.
/// Unrounded, so threshold checks see the exact ratio; round when displaying.
pub fn attendance_percentage(baseline: AttendanceBaseline, history: &[AttendanceEntry]) -> Option<f64> {
    let attended = history
        .iter()
        .filter(|entry| entry.status.counts_as_attended())
        .count();
    baseline.combined_with(history.len() as i64, attended as i64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub subject: String,
    pub test_name: String,
    pub max_marks: f64,
    pub obtained_marks: f64,
    pub percentage: f64,
    pub date: NaiveDate,
    pub grade: String,
}

impl TestResult {
    pub fn new(
        subject: &str,
        test_name: &str,
        max_marks: f64,
        obtained_marks: f64,
        date: NaiveDate,
    ) -> Result<Self, ValidationError> {
        if !max_marks.is_finite() || max_marks <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "max_marks",
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
                value: max_marks,
            });
        }
        if !obtained_marks.is_finite() || obtained_marks < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "obtained_marks",
                min: 0.0,
                max: max_marks,
                value: obtained_marks,
            });
        }
        if obtained_marks > max_marks {
            return Err(ValidationError::MarksExceedMaximum {
                obtained: obtained_marks,
                max: max_marks,
            });
        }

        let percentage = obtained_marks * 100.0 / max_marks;
        Ok(Self {
            subject: subject.trim().to_string(),
            test_name: test_name.trim().to_string(),
            max_marks,
            obtained_marks,
            percentage,
            date,
            grade: letter_grade(percentage).to_string(),
        })
    }
}

pub fn letter_grade(percentage: f64) -> &'static str {
    const BANDS: [(f64, &str); 12] = [
        (97.0, "A+"),
        (93.0, "A"),
        (90.0, "A-"),
        (87.0, "B+"),
        (83.0, "B"),
        (80.0, "B-"),
        (77.0, "C+"),
        (73.0, "C"),
        (70.0, "C-"),
        (67.0, "D+"),
        (63.0, "D"),
        (60.0, "D-"),
    ];

    BANDS
        .iter()
        .find(|(floor, _)| percentage >= *floor)
        .map(|(_, grade)| *grade)
        .unwrap_or("F")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectPerformance {
    pub subject: String,
    pub average_percentage: f64,
    pub total_tests: usize,
    pub last_test_date: NaiveDate,
}

pub fn subject_performance(results: &[TestResult]) -> Vec<SubjectPerformance> {
    let mut by_subject: BTreeMap<&str, (f64, usize, NaiveDate)> = BTreeMap::new();

    for result in results {
        let entry = by_subject
            .entry(result.subject.as_str())
            .or_insert((0.0, 0, result.date));
        entry.0 += result.percentage;
        entry.1 += 1;
        entry.2 = entry.2.max(result.date);
    }

    by_subject
        .into_iter()
        .map(|(subject, (total, count, last))| SubjectPerformance {
            subject: subject.to_string(),
            average_percentage: round_one(total / count as f64),
            total_tests: count,
            last_test_date: last,
        })
        .collect()
}

/// Test percentages oldest first; equal dates keep their recorded order.
pub fn recent_percentages(results: &[TestResult]) -> Vec<f64> {
    let mut ordered: Vec<&TestResult> = results.iter().collect();
    ordered.sort_by(|a, b| a.date.cmp(&b.date));
    ordered.into_iter().map(|r| r.percentage).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePayment {
    pub amount: f64,
    pub payment_date: NaiveDate,
    pub payment_method: String,
    pub receipt_number: String,
    pub description: String,
}

impl FeePayment {
    pub fn new(
        amount: f64,
        payment_date: NaiveDate,
        payment_method: Option<&str>,
        receipt_number: Option<&str>,
        description: Option<&str>,
    ) -> Result<Self, ValidationError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ValidationError::NonPositivePayment(amount));
        }

        let receipt_number = receipt_number
            .map(str::to_string)
            .unwrap_or_else(|| {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("RCP{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
            });

        Ok(Self {
            amount,
            payment_date,
            payment_method: payment_method.unwrap_or("cash").to_string(),
            receipt_number,
            description: description.unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeLedger {
    pub total_fee_amount: f64,
    pub paid_amount: f64,
    pub pending_amount: f64,
    pub payment_status: FeePaymentStatus,
    pub due_date: Option<NaiveDate>,
    pub last_payment_date: Option<NaiveDate>,
}

impl Default for FeeLedger {
    fn default() -> Self {
        Self {
            total_fee_amount: 0.0,
            paid_amount: 0.0,
            pending_amount: 0.0,
            payment_status: FeePaymentStatus::Pending,
            due_date: None,
            last_payment_date: None,
        }
    }
}

impl FeeLedger {
    pub fn apply_payment(&mut self, payment: &FeePayment, now: DateTime<Utc>) {
        self.paid_amount += payment.amount;
        self.pending_amount = (self.total_fee_amount - self.paid_amount).max(0.0);
        self.last_payment_date = Some(payment.payment_date);
        self.payment_status = self.derive_payment_status(now);
    }

    pub fn set_total(&mut self, total: f64, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if !total.is_finite() || total < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "total_fee_amount",
                min: 0.0,
                max: f64::MAX,
                value: total,
            });
        }
        self.total_fee_amount = total;
        self.pending_amount = (total - self.paid_amount).max(0.0);
        self.payment_status = self.derive_payment_status(now);
        Ok(())
    }

    pub fn set_due_date(&mut self, due_date: NaiveDate, now: DateTime<Utc>) {
        self.due_date = Some(due_date);
        self.payment_status = self.derive_payment_status(now);
    }

    pub fn derive_payment_status(&self, now: DateTime<Utc>) -> FeePaymentStatus {
        let past_due = self
            .due_date
            .map(|due| now > due.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(false);

        if self.pending_amount <= 0.0 {
            FeePaymentStatus::Paid
        } else if self.paid_amount > 0.0 {
            FeePaymentStatus::Partial
        } else if past_due {
            FeePaymentStatus::Overdue
        } else {
            FeePaymentStatus::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellbeingResponse {
    pub date: NaiveDate,
    pub mood: i16,
    pub stress: i16,
    pub sleep: i16,
    pub notes: String,
}

impl WellbeingResponse {
    pub fn new(
        date: NaiveDate,
        mood: i16,
        stress: i16,
        sleep: i16,
        notes: Option<&str>,
    ) -> Result<Self, ValidationError> {
        for (field, value) in [("mood", mood), ("stress", stress), ("sleep", sleep)] {
            if !(1..=5).contains(&value) {
                return Err(ValidationError::OutOfRange {
                    field,
                    min: 1.0,
                    max: 5.0,
                    value: value as f64,
                });
            }
        }

        Ok(Self {
            date,
            mood,
            stress,
            sleep,
            notes: notes.unwrap_or_default().to_string(),
        })
    }
}

/// Everything the store keeps about one student.
#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub mentor_id: Option<Uuid>,
    pub department: Option<String>,
    pub identity: StudentIdentity,
    pub gpa: Option<f64>,
    pub attendance_baseline: AttendanceBaseline,
    pub attendance: Vec<AttendanceEntry>,
    pub tests: Vec<TestResult>,
    pub fees: FeeLedger,
}

impl StudentRecord {
    pub fn attendance_percentage(&self) -> Option<f64> {
        attendance_percentage(self.attendance_baseline, &self.attendance)
    }

    pub fn snapshot(&self, open_alerts: HashSet<AlertKey>) -> StudentSnapshot {
        StudentSnapshot {
            attendance_percentage: self.attendance_percentage().unwrap_or(0.0),
            gpa: self.gpa.unwrap_or(0.0),
            recent_test_percentages: recent_percentages(&self.tests),
            fee_payment_status: self.fees.payment_status,
            fee_pending_amount: self.fees.pending_amount,
            fee_due_date: self.fees.due_date,
            existing_unacknowledged_alerts: open_alerts,
        }
    }
}

fn round_one(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskTier;
    use crate::risk::attendance_tier;
    use chrono::TimeZone;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 9, 0, 0).unwrap()
    }

    fn mark(day: u32, status: AttendanceStatus, subject: &str) -> AttendanceEntry {
        AttendanceEntry {
            date: date(2024, 1, day),
            status,
            subject: subject.to_string(),
        }
    }

    #[test]
    fn late_counts_as_attended() {
        let history = vec![
            mark(15, AttendanceStatus::Present, "Mathematics"),
            mark(16, AttendanceStatus::Present, "Physics"),
            mark(17, AttendanceStatus::Absent, "Chemistry"),
            mark(18, AttendanceStatus::Late, "Computer Science"),
            mark(19, AttendanceStatus::Present, "English"),
        ];
        assert_eq!(
            attendance_percentage(AttendanceBaseline::default(), &history),
            Some(80.0)
        );
        assert_eq!(attendance_percentage(AttendanceBaseline::default(), &[]), None);
    }

    #[test]
    fn sessions_extend_the_baseline() {
        let baseline = AttendanceBaseline::from_percentage(85.0);
        assert_eq!(attendance_percentage(baseline, &[]), Some(85.0));

        let history = vec![
            mark(20, AttendanceStatus::Absent, "Mathematics"),
            mark(21, AttendanceStatus::Absent, "Physics"),
        ];
        let pct = attendance_percentage(baseline, &history).unwrap();
        assert!((pct - 8500.0 / 102.0).abs() < 1e-9, "got {pct}");
    }

    #[test]
    fn baseline_from_percentage_clamps() {
        assert_eq!(AttendanceBaseline::from_percentage(130.0).percentage, 100.0);
        assert_eq!(AttendanceBaseline::from_percentage(-4.0).percentage, 0.0);
        assert_eq!(AttendanceBaseline::from_percentage(f64::NAN).percentage, 0.0);
        assert_eq!(
            AttendanceBaseline::from_percentage(64.6).classes,
            AttendanceBaseline::REPORTED_CLASSES
        );
    }

    #[test]
    fn reported_percentage_keeps_its_tier() {
        let low = AttendanceBaseline::from_percentage(74.6).combined_with(0, 0).unwrap();
        assert!(low < 75.0, "got {low}");
        assert_eq!(attendance_tier(low), RiskTier::Medium);

        let critical = AttendanceBaseline::from_percentage(59.6).combined_with(0, 0).unwrap();
        assert!(critical < 60.0, "got {critical}");
        assert_eq!(attendance_tier(critical), RiskTier::High);

        let exact = AttendanceBaseline::from_percentage(75.0).combined_with(0, 0).unwrap();
        assert_eq!(attendance_tier(exact), RiskTier::Low);
    }

    #[test]
    fn session_ratio_is_not_rounded_up_to_a_threshold() {
        let counted = AttendanceBaseline::default();
        let pct = counted.combined_with(4000, 2999).unwrap();
        assert_eq!(pct, 74.975);
        assert_eq!(attendance_tier(pct), RiskTier::Medium);

        let pct = counted.combined_with(10_000, 5_999).unwrap();
        assert!(pct < 60.0, "got {pct}");
        assert_eq!(attendance_tier(pct), RiskTier::High);
    }

    #[test]
    fn attended_count_is_capped_by_sessions() {
        let pct = AttendanceBaseline::default().combined_with(4, 9).unwrap();
        assert_eq!(pct, 100.0);
        assert_eq!(AttendanceBaseline::default().combined_with(-3, 0), None);
    }

    #[test]
    fn attendance_status_rejects_unknown_values() {
        assert_eq!("LATE".parse::<AttendanceStatus>().unwrap(), AttendanceStatus::Late);
        assert!("excused".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn test_result_derives_percentage_and_grade() {
        let quiz = TestResult::new("Physics", "Quiz 1", 50.0, 42.0, date(2024, 1, 12)).unwrap();
        assert_eq!(quiz.percentage, 84.0);
        assert_eq!(quiz.grade, "B");

        let lab = TestResult::new("Chemistry", "Lab Test", 75.0, 30.0, date(2024, 1, 14)).unwrap();
        assert_eq!(lab.percentage, 40.0);
        assert_eq!(lab.grade, "F");
    }

    #[test]
    fn test_percentage_near_a_threshold_stays_below_it() {
        let result = TestResult::new("Maths", "Quiz", 2000.0, 999.0, date(2024, 1, 10)).unwrap();
        assert!(result.percentage < 50.0, "got {}", result.percentage);
        assert_eq!(
            crate::risk::academic_tier(3.5, crate::risk::recent_average(&[result.percentage])),
            RiskTier::High
        );
    }

    #[test]
    fn test_result_rejects_impossible_marks() {
        assert!(matches!(
            TestResult::new("Maths", "Mid-term", 100.0, 101.0, date(2024, 1, 10)),
            Err(ValidationError::MarksExceedMaximum { .. })
        ));
        assert!(TestResult::new("Maths", "Mid-term", 0.0, 0.0, date(2024, 1, 10)).is_err());
        assert!(TestResult::new("Maths", "Mid-term", 100.0, -1.0, date(2024, 1, 10)).is_err());
    }

    #[test]
    fn subject_performance_groups_and_sorts() {
        let results = vec![
            TestResult::new("Physics", "Quiz 1", 50.0, 40.0, date(2024, 1, 12)).unwrap(),
            TestResult::new("Mathematics", "Mid-term", 100.0, 78.0, date(2024, 1, 10)).unwrap(),
            TestResult::new("Physics", "Quiz 2", 50.0, 45.0, date(2024, 1, 20)).unwrap(),
        ];

        let summary = subject_performance(&results);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].subject, "Mathematics");
        assert_eq!(summary[1].subject, "Physics");
        assert_eq!(summary[1].average_percentage, 85.0);
        assert_eq!(summary[1].total_tests, 2);
        assert_eq!(summary[1].last_test_date, date(2024, 1, 20));
    }

    #[test]
    fn recent_percentages_are_date_ordered() {
        let results = vec![
            TestResult::new("CS", "Assignment", 100.0, 92.0, date(2024, 1, 16)).unwrap(),
            TestResult::new("Maths", "Mid-term", 100.0, 78.0, date(2024, 1, 10)).unwrap(),
        ];
        assert_eq!(recent_percentages(&results), vec![78.0, 92.0]);
    }

    #[test]
    fn payments_move_ledger_from_pending_to_paid() {
        let mut ledger = FeeLedger::default();
        ledger.set_total(50000.0, at(2024, 1, 1)).unwrap();
        assert_eq!(ledger.payment_status, FeePaymentStatus::Pending);
        assert_eq!(ledger.pending_amount, 50000.0);

        let first = FeePayment::new(15000.0, date(2024, 1, 1), Some("online"), Some("RCP001"), None)
            .unwrap();
        ledger.apply_payment(&first, at(2024, 1, 1));
        assert_eq!(ledger.payment_status, FeePaymentStatus::Partial);
        assert_eq!(ledger.pending_amount, 35000.0);

        let rest = FeePayment::new(35000.0, date(2024, 1, 15), None, Some("RCP002"), None).unwrap();
        ledger.apply_payment(&rest, at(2024, 1, 15));
        assert_eq!(ledger.payment_status, FeePaymentStatus::Paid);
        assert_eq!(ledger.pending_amount, 0.0);
        assert_eq!(ledger.last_payment_date, Some(date(2024, 1, 15)));
    }

    #[test]
    fn unpaid_ledger_past_due_is_overdue() {
        let mut ledger = FeeLedger::default();
        ledger.set_total(50000.0, at(2024, 1, 1)).unwrap();
        ledger.set_due_date(date(2024, 1, 31), at(2024, 2, 2));
        assert_eq!(ledger.payment_status, FeePaymentStatus::Overdue);
    }

    #[test]
    fn payment_must_be_positive() {
        assert_eq!(
            FeePayment::new(0.0, date(2024, 1, 1), None, None, None).unwrap_err(),
            ValidationError::NonPositivePayment(0.0)
        );
        let payment = FeePayment::new(10.0, date(2024, 1, 1), None, None, None).unwrap();
        assert_eq!(payment.payment_method, "cash");
        assert!(payment.receipt_number.starts_with("RCP"));
    }

    #[test]
    fn generated_receipts_do_not_collide() {
        let receipts: HashSet<String> = (0..50)
            .map(|_| {
                FeePayment::new(10.0, date(2024, 1, 1), None, None, None)
                    .unwrap()
                    .receipt_number
            })
            .collect();
        assert_eq!(receipts.len(), 50);
    }

    #[test]
    fn wellbeing_scores_must_be_one_to_five() {
        assert!(WellbeingResponse::new(date(2024, 1, 1), 3, 4, 2, None).is_ok());
        assert!(matches!(
            WellbeingResponse::new(date(2024, 1, 1), 3, 6, 2, None),
            Err(ValidationError::OutOfRange { field: "stress", .. })
        ));
    }

    #[test]
    fn snapshot_defaults_missing_values_to_zero() {
        let mut record = StudentRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            mentor_id: None,
            department: None,
            identity: StudentIdentity::new("Alice Johnson", Some("CS2023001"), None).unwrap(),
            gpa: None,
            attendance_baseline: AttendanceBaseline::default(),
            attendance: Vec::new(),
            tests: Vec::new(),
            fees: FeeLedger::default(),
        };

        let snapshot = record.snapshot(HashSet::new());
        assert_eq!(snapshot.attendance_percentage, 0.0);
        assert_eq!(snapshot.gpa, 0.0);
        assert!(snapshot.recent_test_percentages.is_empty());

        record.attendance_baseline = AttendanceBaseline::from_percentage(85.0);
        record.gpa = Some(3.2);
        record
            .tests
            .push(TestResult::new("Maths", "Mid-term", 100.0, 78.0, date(2024, 1, 10)).unwrap());
        let snapshot = record.snapshot(HashSet::new());
        assert_eq!(snapshot.attendance_percentage, 85.0);
        assert_eq!(snapshot.gpa, 3.2);
        assert_eq!(snapshot.recent_test_percentages, vec![78.0]);
    }
}
