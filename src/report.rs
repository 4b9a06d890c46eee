use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{AlertRecord, RiskLevel, StudentOverview, WellbeingSummary};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
    pub unscored: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortSummary {
    pub total_students: usize,
    pub attendance_rate: f64,
    pub at_risk_students: usize,
    pub risk_counts: RiskCounts,
}

pub fn summarize(overviews: &[StudentOverview]) -> CohortSummary {
    let mut risk_counts = RiskCounts::default();
    for overview in overviews {
        match overview.analysis.as_ref().map(|a| a.analysis.overall_risk_level) {
            Some(RiskLevel::Low) => risk_counts.low += 1,
            Some(RiskLevel::Medium) => risk_counts.medium += 1,
            Some(RiskLevel::High) => risk_counts.high += 1,
            Some(RiskLevel::Critical) => risk_counts.critical += 1,
            None => risk_counts.unscored += 1,
        }
    }

    let attendance: Vec<f64> = overviews
        .iter()
        .filter_map(|o| o.attendance_percentage)
        .collect();
    let attendance_rate = if attendance.is_empty() {
        0.0
    } else {
        let mean = attendance.iter().sum::<f64>() / attendance.len() as f64;
        (mean * 10.0).round() / 10.0
    };

    CohortSummary {
        total_students: overviews.len(),
        attendance_rate,
        at_risk_students: risk_counts.high + risk_counts.critical,
        risk_counts,
    }
}

/// Most severe first, newest first within a severity.
pub fn sort_alerts(alerts: &mut [AlertRecord]) {
    alerts.sort_by(|a, b| {
        b.alert
            .severity
            .cmp(&a.alert.severity)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

/// Students at high or critical risk, most severe first, then by name.
pub fn needing_attention(overviews: &[StudentOverview]) -> Vec<&StudentOverview> {
    let mut flagged: Vec<&StudentOverview> = overviews
        .iter()
        .filter(|o| {
            o.analysis
                .as_ref()
                .map(|a| a.analysis.overall_risk_level.requires_attention())
                .unwrap_or(false)
        })
        .collect();

    flagged.sort_by(|a, b| {
        let level = |o: &StudentOverview| o.analysis.as_ref().map(|a| a.analysis.overall_risk_level);
        level(*b)
            .cmp(&level(*a))
            .then_with(|| a.identity.name.cmp(&b.identity.name))
    });
    flagged
}

pub fn build_report(
    scope: &str,
    generated_on: NaiveDate,
    overviews: &[StudentOverview],
    alerts: &[AlertRecord],
    wellbeing: &WellbeingSummary,
) -> String {
    let summary = summarize(overviews);
    let mut output = String::new();

    let _ = writeln!(output, "# EduBeacon Risk Report");
    let _ = writeln!(output, "Generated for {} on {}", scope, generated_on);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Students: {}", summary.total_students);
    let _ = writeln!(output, "- Average attendance: {:.1}%", summary.attendance_rate);
    let _ = writeln!(output, "- At risk (high or critical): {}", summary.at_risk_students);

    let stale = overviews.iter().filter(|o| o.stale).count();
    if stale > 0 {
        let _ = writeln!(
            output,
            "- {} student(s) could not be refreshed; their last known analysis is shown",
            stale
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Distribution");
    let counts = &summary.risk_counts;
    let _ = writeln!(output, "- critical: {}", counts.critical);
    let _ = writeln!(output, "- high: {}", counts.high);
    let _ = writeln!(output, "- medium: {}", counts.medium);
    let _ = writeln!(output, "- low: {}", counts.low);
    if counts.unscored > 0 {
        let _ = writeln!(output, "- not yet analyzed: {}", counts.unscored);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students Needing Attention");
    let flagged = needing_attention(overviews);
    if flagged.is_empty() {
        let _ = writeln!(output, "No students at high or critical risk.");
    } else {
        for overview in flagged {
            let Some(stored) = overview.analysis.as_ref() else {
                continue;
            };
            let attendance = overview
                .attendance_percentage
                .map(|pct| format!("{pct:.1}%"))
                .unwrap_or_else(|| "n/a".to_string());
            let _ = writeln!(
                output,
                "- {} ({}) {} risk, attendance {}{}: {}",
                overview.identity.name,
                overview.identity.label(),
                stored.analysis.overall_risk_level,
                attendance,
                if overview.stale {
                    format!(" [stale since {}]", stored.analyzed_at.format("%Y-%m-%d %H:%M"))
                } else {
                    String::new()
                },
                stored.analysis.risk_factors.join(", ")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Open Alerts");
    if alerts.is_empty() {
        let _ = writeln!(output, "No unacknowledged alerts.");
    } else {
        let mut ordered = alerts.to_vec();
        sort_alerts(&mut ordered);
        for record in ordered.iter() {
            let _ = writeln!(
                output,
                "- [{}] {} (raised {})",
                record.alert.severity,
                record.alert.message,
                record.created_at.format("%Y-%m-%d")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Wellbeing");
    if wellbeing.responses == 0 {
        let _ = writeln!(output, "No wellbeing responses recorded.");
    } else {
        let _ = writeln!(
            output,
            "{} responses: mood {:.1}, stress {:.1}, sleep {:.1} (scale 1-5)",
            wellbeing.responses, wellbeing.avg_mood, wellbeing.avg_stress, wellbeing.avg_sleep
        );
    }

    output
}
