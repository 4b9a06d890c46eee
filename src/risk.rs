use std::collections::HashSet;

use chrono::{DateTime, NaiveTime, Utc};

use crate::models::{
    Alert, AlertKey, FeePaymentStatus, RiskAnalysis, RiskLevel, RiskTier, StudentIdentity,
    StudentSnapshot, MULTI_FACTOR_ALERT,
};

pub const CRITICAL_ATTENDANCE: &str = "Critical attendance below 60%";
pub const LOW_ATTENDANCE: &str = "Low attendance below 75%";
pub const POOR_ACADEMICS: &str = "Poor academic performance (GPA < 2.0 or recent tests < 50%)";
pub const DECLINING_ACADEMICS: &str = "Declining academic performance";
pub const OVERDUE_FEES: &str = "Overdue fee payments";
pub const PENDING_FEES: &str = "Pending fee payments";
pub const MULTIPLE_HIGH_RISKS: &str = "Multiple high-risk factors detected";

/// Number of most recent tests averaged for the academic factor.
pub const RECENT_TEST_WINDOW: usize = 3;

pub fn analyze(snapshot: &StudentSnapshot) -> RiskAnalysis {
    analyze_at(snapshot, Utc::now())
}

/// Scores a snapshot against a fixed "now". Factors are appended in the order
/// attendance, academic, financial, aggregate.
pub fn analyze_at(snapshot: &StudentSnapshot, now: DateTime<Utc>) -> RiskAnalysis {
    let mut risk_factors = Vec::new();

    let attendance_risk = attendance_tier(snapshot.attendance_percentage);
    match attendance_risk {
        RiskTier::High => risk_factors.push(CRITICAL_ATTENDANCE.to_string()),
        RiskTier::Medium => risk_factors.push(LOW_ATTENDANCE.to_string()),
        RiskTier::Low => {}
    }

    let academic_risk = academic_tier(
        snapshot.gpa,
        recent_average(&snapshot.recent_test_percentages),
    );
    match academic_risk {
        RiskTier::High => risk_factors.push(POOR_ACADEMICS.to_string()),
        RiskTier::Medium => risk_factors.push(DECLINING_ACADEMICS.to_string()),
        RiskTier::Low => {}
    }

    let financial_risk = financial_tier(snapshot, now);
    match financial_risk {
        RiskTier::High => risk_factors.push(OVERDUE_FEES.to_string()),
        RiskTier::Medium => risk_factors.push(PENDING_FEES.to_string()),
        RiskTier::Low => {}
    }

    let overall_risk_level = overall_level(attendance_risk, academic_risk, financial_risk);
    if overall_risk_level == RiskLevel::Critical {
        risk_factors.push(MULTIPLE_HIGH_RISKS.to_string());
    }

    RiskAnalysis {
        attendance_risk,
        academic_risk,
        financial_risk,
        overall_risk_level,
        risk_factors,
        generated_alert: None,
    }
}

/// Runs the analysis and attaches an alert when one is due, deduplicated against
/// the snapshot's open alerts.
pub fn analyze_with_alert(
    snapshot: &StudentSnapshot,
    identity: &StudentIdentity,
    now: DateTime<Utc>,
) -> RiskAnalysis {
    let mut analysis = analyze_at(snapshot, now);
    analysis.generated_alert =
        generate_alert(&analysis, identity, &snapshot.existing_unacknowledged_alerts);
    analysis
}

pub fn generate_alert(
    analysis: &RiskAnalysis,
    identity: &StudentIdentity,
    existing_unacknowledged: &HashSet<AlertKey>,
) -> Option<Alert> {
    if !analysis.overall_risk_level.requires_attention() {
        return None;
    }

    let alert = Alert {
        alert_type: MULTI_FACTOR_ALERT.to_string(),
        severity: analysis.overall_risk_level,
        message: format!(
            "Student {} ({}) requires immediate attention: {}",
            identity.name,
            identity.label(),
            analysis.risk_factors.join(", ")
        ),
        acknowledged: false,
    };

    if existing_unacknowledged.contains(&alert.key()) {
        return None;
    }
    Some(alert)
}

pub fn attendance_tier(attendance_percentage: f64) -> RiskTier {
    let attendance = clamp_or_zero(attendance_percentage, 0.0, 100.0);
    if attendance < 60.0 {
        RiskTier::High
    } else if attendance < 75.0 {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

pub fn academic_tier(gpa: f64, recent_average: f64) -> RiskTier {
    let gpa = clamp_or_zero(gpa, 0.0, 4.0);
    let recent_average = clamp_or_zero(recent_average, 0.0, 100.0);
    if gpa < 2.0 || recent_average < 50.0 {
        RiskTier::High
    } else if gpa < 2.5 || recent_average < 65.0 {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

pub fn financial_tier(snapshot: &StudentSnapshot, now: DateTime<Utc>) -> RiskTier {
    let pending = clamp_or_zero(snapshot.fee_pending_amount, 0.0, f64::MAX);
    let past_due = snapshot
        .fee_due_date
        .map(|due| now > due.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(false);

    if snapshot.fee_payment_status == FeePaymentStatus::Overdue || (past_due && pending > 0.0) {
        RiskTier::High
    } else if snapshot.fee_payment_status == FeePaymentStatus::Partial || pending > 0.0 {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

pub fn overall_level(attendance: RiskTier, academic: RiskTier, financial: RiskTier) -> RiskLevel {
    let tiers = [attendance, academic, financial];
    let high_count = tiers.iter().filter(|t| **t == RiskTier::High).count();
    let medium_count = tiers.iter().filter(|t| **t == RiskTier::Medium).count();

    if high_count >= 2 {
        RiskLevel::Critical
    } else if high_count >= 1 {
        RiskLevel::High
    } else if medium_count >= 2 {
        RiskLevel::High
    } else if medium_count >= 1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Mean of the last three test percentages, 0 when there are none.
pub fn recent_average(test_percentages: &[f64]) -> f64 {
    let start = test_percentages.len().saturating_sub(RECENT_TEST_WINDOW);
    let recent = &test_percentages[start..];
    if recent.is_empty() {
        return 0.0;
    }

    let total: f64 = recent
        .iter()
        .map(|value| clamp_or_zero(*value, 0.0, 100.0))
        .sum();
    total / recent.len() as f64
}

pub const TIP_IMPROVE_ATTENDANCE: &str =
    "Try to maintain consistent attendance. Plan commute and set reminders.";
pub const TIP_GOOD_ATTENDANCE: &str = "Great attendance! Keep up the consistency.";
pub const TIP_CONTACT_MENTOR: &str = "Reach out to your mentor if you feel overwhelmed.";
pub const TIP_STUDY_PLAN: &str = "Create a weekly study plan and stick to short, focused sessions.";
pub const TIP_STAY_SHARP: &str = "Challenge yourself with practice problems to stay sharp.";
pub const TIP_REST: &str = "Take short breaks, stay hydrated, and get enough sleep to improve focus.";

/// Study and wellbeing tips for a student. Unknown attendance gets no attendance
/// tip; an unscored student is treated as low risk.
pub fn student_tips(attendance_percentage: Option<f64>, level: Option<RiskLevel>) -> Vec<&'static str> {
    let mut tips = Vec::with_capacity(3);

    match attendance_percentage {
        Some(pct) if attendance_tier(pct) != RiskTier::Low => tips.push(TIP_IMPROVE_ATTENDANCE),
        Some(_) => tips.push(TIP_GOOD_ATTENDANCE),
        None => {}
    }

    tips.push(match level.unwrap_or(RiskLevel::Low) {
        RiskLevel::High | RiskLevel::Critical => TIP_CONTACT_MENTOR,
        RiskLevel::Medium => TIP_STUDY_PLAN,
        RiskLevel::Low => TIP_STAY_SHARP,
    });

    tips.push(TIP_REST);
    tips
}

fn clamp_or_zero(value: f64, min: f64, max: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn snapshot(
        attendance: f64,
        gpa: f64,
        tests: &[f64],
        status: FeePaymentStatus,
        pending: f64,
    ) -> StudentSnapshot {
        StudentSnapshot {
            attendance_percentage: attendance,
            gpa,
            recent_test_percentages: tests.to_vec(),
            fee_payment_status: status,
            fee_pending_amount: pending,
            fee_due_date: None,
            existing_unacknowledged_alerts: HashSet::new(),
        }
    }

    fn identity(name: &str, roll: &str) -> StudentIdentity {
        StudentIdentity::new(name, Some(roll), None).unwrap()
    }

    #[test]
    fn steady_student_with_partial_fees_is_medium() {
        let mut s = snapshot(
            85.0,
            3.2,
            &[78.0, 84.0, 77.0, 92.0],
            FeePaymentStatus::Partial,
            20000.0,
        );
        s.fee_due_date = Some(date(2024, 3, 31));

        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.attendance_risk, RiskTier::Low);
        assert_eq!(result.academic_risk, RiskTier::Low);
        assert_eq!(result.financial_risk, RiskTier::Medium);
        assert_eq!(result.overall_risk_level, RiskLevel::Medium);
        assert_eq!(result.risk_factors, vec![PENDING_FEES.to_string()]);
    }

    #[test]
    fn one_high_factor_with_two_mediums_is_high() {
        let s = snapshot(
            65.0,
            2.1,
            &[45.0, 56.0, 51.0, 62.0],
            FeePaymentStatus::Overdue,
            50000.0,
        );

        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.attendance_risk, RiskTier::Medium);
        assert_eq!(result.academic_risk, RiskTier::Medium);
        assert_eq!(result.financial_risk, RiskTier::High);
        assert_eq!(result.overall_risk_level, RiskLevel::High);
        assert_eq!(
            result.risk_factors,
            vec![LOW_ATTENDANCE, DECLINING_ACADEMICS, OVERDUE_FEES]
        );
    }

    #[test]
    fn three_high_factors_are_critical() {
        let s = snapshot(
            55.0,
            1.8,
            &[35.0, 44.0, 40.0, 48.0],
            FeePaymentStatus::Overdue,
            40000.0,
        );

        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.attendance_risk, RiskTier::High);
        assert_eq!(result.academic_risk, RiskTier::High);
        assert_eq!(result.financial_risk, RiskTier::High);
        assert_eq!(result.overall_risk_level, RiskLevel::Critical);
        assert_eq!(
            result.risk_factors,
            vec![
                CRITICAL_ATTENDANCE,
                POOR_ACADEMICS,
                OVERDUE_FEES,
                MULTIPLE_HIGH_RISKS
            ]
        );
    }

    #[test]
    fn fully_paid_strong_student_is_low_and_gets_no_alert() {
        let s = snapshot(
            95.0,
            3.8,
            &[95.0, 96.0, 93.0, 98.0],
            FeePaymentStatus::Paid,
            0.0,
        );

        let result = analyze_with_alert(&s, &identity("Carol Davis", "CS2023003"), at(2024, 2, 1));
        assert_eq!(result.attendance_risk, RiskTier::Low);
        assert_eq!(result.academic_risk, RiskTier::Low);
        assert_eq!(result.financial_risk, RiskTier::Low);
        assert_eq!(result.overall_risk_level, RiskLevel::Low);
        assert!(result.risk_factors.is_empty());
        assert!(result.generated_alert.is_none());
    }

    #[test]
    fn alert_messages_are_per_student_but_dedup_ignores_content() {
        let now = at(2024, 2, 1);
        let bob = snapshot(65.0, 2.1, &[56.0, 51.0, 62.0], FeePaymentStatus::Overdue, 100.0);
        let eve = snapshot(50.0, 3.5, &[90.0], FeePaymentStatus::Paid, 0.0);

        let bob_result = analyze_at(&bob, now);
        let eve_result = analyze_at(&eve, now);
        assert_eq!(bob_result.overall_risk_level, RiskLevel::High);
        assert_eq!(eve_result.overall_risk_level, RiskLevel::High);
        assert_ne!(bob_result.risk_factors, eve_result.risk_factors);

        let none = HashSet::new();
        let bob_alert = generate_alert(&bob_result, &identity("Bob Smith", "CS2023002"), &none)
            .expect("bob alert");
        let eve_alert = generate_alert(&eve_result, &identity("Eve Park", "CS2023005"), &none)
            .expect("eve alert");

        assert_eq!(
            bob_alert.message,
            "Student Bob Smith (CS2023002) requires immediate attention: \
             Low attendance below 75%, Declining academic performance, Overdue fee payments"
        );
        assert_eq!(
            eve_alert.message,
            "Student Eve Park (CS2023005) requires immediate attention: Critical attendance below 60%"
        );
        assert_eq!(bob_alert.key(), eve_alert.key());
        assert!(!bob_alert.acknowledged);
        assert_eq!(bob_alert.alert_type, MULTI_FACTOR_ALERT);
    }

    #[test]
    fn second_alert_is_suppressed_while_first_is_open() {
        let s = snapshot(65.0, 2.1, &[56.0, 51.0, 62.0], FeePaymentStatus::Overdue, 100.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        let who = identity("Bob Smith", "CS2023002");

        let mut open = HashSet::new();
        let first = generate_alert(&result, &who, &open).expect("first alert");
        open.insert(first.key());

        assert!(generate_alert(&result, &who, &open).is_none());
    }

    #[test]
    fn open_alert_of_other_severity_does_not_suppress() {
        let s = snapshot(55.0, 1.8, &[40.0], FeePaymentStatus::Overdue, 100.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.overall_risk_level, RiskLevel::Critical);

        let open: HashSet<AlertKey> = [AlertKey {
            alert_type: MULTI_FACTOR_ALERT.to_string(),
            severity: RiskLevel::High,
        }]
        .into();
        let alert = generate_alert(&result, &identity("David Wilson", "CS2023004"), &open)
            .expect("critical alert");
        assert_eq!(alert.severity, RiskLevel::Critical);
    }

    #[test]
    fn alert_falls_back_to_email_without_roll_number() {
        let s = snapshot(40.0, 3.0, &[80.0], FeePaymentStatus::Paid, 0.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        let who = StudentIdentity::new("Ana Ruiz", None, Some("ana@student.edu")).unwrap();
        let alert = generate_alert(&result, &who, &HashSet::new()).expect("alert");
        assert!(alert.message.starts_with("Student Ana Ruiz (ana@student.edu) requires"));
    }

    #[test]
    fn medium_overall_produces_no_alert() {
        let s = snapshot(70.0, 3.0, &[80.0], FeePaymentStatus::Paid, 0.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.overall_risk_level, RiskLevel::Medium);
        assert!(generate_alert(&result, &identity("Ana", "R1"), &HashSet::new()).is_none());
    }

    #[test]
    fn analysis_is_deterministic() {
        let mut s = snapshot(
            61.5,
            2.4,
            &[70.0, 49.0, 66.0],
            FeePaymentStatus::Pending,
            10.0,
        );
        s.fee_due_date = Some(date(2024, 1, 10));
        let now = at(2024, 2, 1);

        let first = analyze_at(&s, now);
        for _ in 0..10 {
            assert_eq!(analyze_at(&s, now), first);
        }
    }

    #[test]
    fn lower_attendance_never_lowers_attendance_risk() {
        let now = at(2024, 2, 1);
        let mut previous = RiskTier::Low;
        let mut attendance = 100.0;
        while attendance >= 0.0 {
            let s = snapshot(attendance, 3.0, &[80.0], FeePaymentStatus::Paid, 0.0);
            let tier = analyze_at(&s, now).attendance_risk;
            assert!(tier >= previous, "attendance {attendance} lowered risk");
            previous = tier;
            attendance -= 0.5;
        }
        assert_eq!(previous, RiskTier::High);
    }

    #[test]
    fn attendance_boundaries() {
        assert_eq!(attendance_tier(59.99), RiskTier::High);
        assert_eq!(attendance_tier(60.0), RiskTier::Medium);
        assert_eq!(attendance_tier(74.99), RiskTier::Medium);
        assert_eq!(attendance_tier(75.0), RiskTier::Low);
    }

    #[test]
    fn two_mediums_escalate_to_high_not_critical() {
        assert_eq!(
            overall_level(RiskTier::Medium, RiskTier::Medium, RiskTier::Low),
            RiskLevel::High
        );
        assert_eq!(
            overall_level(RiskTier::Medium, RiskTier::Medium, RiskTier::Medium),
            RiskLevel::High
        );
        assert_eq!(
            overall_level(RiskTier::High, RiskTier::High, RiskTier::Low),
            RiskLevel::Critical
        );
        assert_eq!(
            overall_level(RiskTier::Low, RiskTier::Medium, RiskTier::Low),
            RiskLevel::Medium
        );
    }

    #[test]
    fn two_medium_factors_do_not_add_aggregate_factor() {
        let s = snapshot(70.0, 2.3, &[80.0], FeePaymentStatus::Paid, 0.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.overall_risk_level, RiskLevel::High);
        assert_eq!(result.risk_factors, vec![LOW_ATTENDANCE, DECLINING_ACADEMICS]);
    }

    #[test]
    fn single_weak_academic_signal_is_enough() {
        assert_eq!(academic_tier(3.9, 45.0), RiskTier::High);
        assert_eq!(academic_tier(1.9, 95.0), RiskTier::High);
        assert_eq!(academic_tier(3.9, 60.0), RiskTier::Medium);
        assert_eq!(academic_tier(2.4, 95.0), RiskTier::Medium);
        assert_eq!(academic_tier(2.5, 65.0), RiskTier::Low);
    }

    #[test]
    fn recent_average_uses_last_three_tests() {
        assert_eq!(recent_average(&[]), 0.0);
        assert_eq!(recent_average(&[80.0]), 80.0);
        assert!((recent_average(&[35.0, 44.0, 40.0, 48.0]) - 44.0).abs() < 1e-9);
        assert!((recent_average(&[78.0, 84.0, 77.0, 92.0]) - 84.333).abs() < 0.001);
    }

    #[test]
    fn no_tests_counts_as_zero_average() {
        let s = snapshot(90.0, 3.5, &[], FeePaymentStatus::Paid, 0.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.academic_risk, RiskTier::High);
    }

    #[test]
    fn past_due_date_with_balance_is_high_even_when_pending() {
        let mut s = snapshot(90.0, 3.5, &[90.0], FeePaymentStatus::Pending, 500.0);
        s.fee_due_date = Some(date(2024, 1, 31));

        assert_eq!(analyze_at(&s, at(2024, 1, 30)).financial_risk, RiskTier::Medium);
        assert_eq!(analyze_at(&s, at(2024, 2, 1)).financial_risk, RiskTier::High);

        s.fee_pending_amount = 0.0;
        s.fee_payment_status = FeePaymentStatus::Paid;
        assert_eq!(analyze_at(&s, at(2024, 2, 1)).financial_risk, RiskTier::Low);
    }

    #[test]
    fn any_pending_balance_is_at_least_medium() {
        let s = snapshot(90.0, 3.5, &[90.0], FeePaymentStatus::Paid, 0.01);
        assert_eq!(analyze_at(&s, at(2024, 2, 1)).financial_risk, RiskTier::Medium);
    }

    #[test]
    fn malformed_numbers_fall_back_to_safe_defaults() {
        let s = snapshot(f64::NAN, f64::NAN, &[f64::INFINITY], FeePaymentStatus::Paid, -50.0);
        let result = analyze_at(&s, at(2024, 2, 1));
        assert_eq!(result.attendance_risk, RiskTier::High);
        assert_eq!(result.academic_risk, RiskTier::High);
        assert_eq!(result.financial_risk, RiskTier::Low);

        let over = snapshot(140.0, 5.0, &[120.0], FeePaymentStatus::Paid, 0.0);
        let result = analyze_at(&over, at(2024, 2, 1));
        assert_eq!(result.overall_risk_level, RiskLevel::Low);
    }

    #[test]
    fn tips_follow_attendance_and_level() {
        assert_eq!(
            student_tips(Some(74.9), Some(RiskLevel::Medium)),
            vec![TIP_IMPROVE_ATTENDANCE, TIP_STUDY_PLAN, TIP_REST]
        );
        assert_eq!(
            student_tips(Some(75.0), Some(RiskLevel::Low)),
            vec![TIP_GOOD_ATTENDANCE, TIP_STAY_SHARP, TIP_REST]
        );
        assert_eq!(
            student_tips(Some(55.0), Some(RiskLevel::Critical)),
            vec![TIP_IMPROVE_ATTENDANCE, TIP_CONTACT_MENTOR, TIP_REST]
        );
        assert_eq!(student_tips(None, None), vec![TIP_STAY_SHARP, TIP_REST]);
    }
}
