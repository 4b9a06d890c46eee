use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod config;
mod db;
mod error;
mod models;
mod records;
mod report;
mod risk;

use models::{InvitationRole, RiskAnalysis};
use records::{AttendanceEntry, AttendanceStatus, FeePayment, TestResult, WellbeingResponse};

#[derive(Parser)]
#[command(name = "edubeacon")]
#[command(about = "Student dropout-risk tracking for EduBeacon organizations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo organization, mentor and students
    Seed,
    /// Import student snapshots from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        organization: Uuid,
    },
    /// Register an organization
    CreateOrg {
        #[arg(long)]
        name: String,
    },
    /// Issue an invitation code for students or mentors
    GenerateCode {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        role: InvitationRole,
    },
    /// List an organization's invitation codes
    Invitations {
        #[arg(long)]
        organization: Uuid,
    },
    /// Add a mentor to an organization, directly or with a mentor invitation code
    #[command(group(
        ArgGroup::new("membership")
            .args(["organization", "code"])
            .required(true)
            .multiple(false)
    ))]
    AddMentor {
        #[arg(long)]
        organization: Option<Uuid>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Add a student to an organization, directly or with a student invitation code
    #[command(group(
        ArgGroup::new("membership")
            .args(["organization", "code"])
            .required(true)
            .multiple(false)
    ))]
    AddStudent {
        #[arg(long)]
        organization: Option<Uuid>,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        roll_number: Option<String>,
        #[arg(long)]
        gpa: Option<f64>,
        #[arg(long)]
        mentor: Option<Uuid>,
    },
    /// Create (or reactivate) a department
    AddDepartment {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List an organization's departments
    Departments {
        #[arg(long)]
        organization: Uuid,
    },
    /// Place a student in a department
    AssignDepartment {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        department: Uuid,
    },
    /// Close a department to new assignments
    ArchiveDepartment {
        #[arg(long)]
        department: Uuid,
    },
    /// Assign a mentor to a student
    AssignMentor {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        mentor: Uuid,
    },
    /// Recompute risk for one student or a whole organization
    #[command(group(
        ArgGroup::new("scope")
            .args(["student", "organization"])
            .required(true)
            .multiple(false)
    ))]
    Analyze {
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long)]
        organization: Option<Uuid>,
        #[arg(long, requires = "organization")]
        mentor: Option<Uuid>,
        #[arg(long)]
        json: bool,
    },
    /// Show a student's attendance, fees, subject averages and current standing
    Profile {
        #[arg(long)]
        student: Uuid,
    },
    /// Study and wellbeing tips for a student
    Tips {
        #[arg(long)]
        student: Uuid,
    },
    /// Mark a student present, absent or late for a session
    Attendance {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        status: AttendanceStatus,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record a test result
    AddTest {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        max_marks: f64,
        #[arg(long)]
        obtained: f64,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record a fee payment
    Pay {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        receipt: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Change a student's total fee or due date
    #[command(group(
        ArgGroup::new("terms")
            .args(["total", "due_date"])
            .required(true)
            .multiple(true)
    ))]
    FeeTerms {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        total: Option<f64>,
        #[arg(long)]
        due_date: Option<NaiveDate>,
    },
    /// Submit a wellbeing survey (scores 1-5)
    Wellbeing {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        mood: i16,
        #[arg(long)]
        stress: i16,
        #[arg(long)]
        sleep: i16,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// List unacknowledged high and critical alerts
    Alerts {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        mentor: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Acknowledge an alert as the student's mentor
    Acknowledge {
        #[arg(long)]
        alert: Uuid,
        #[arg(long)]
        mentor: Uuid,
    },
    /// Refresh and summarize risk across students
    Overview {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        mentor: Option<Uuid>,
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        mentor: Option<Uuid>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("edubeacon=info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_analysis(label: &str, analysis: &RiskAnalysis) {
    println!(
        "{label}: {} risk (attendance {}, academic {}, financial {})",
        analysis.overall_risk_level,
        analysis.attendance_risk,
        analysis.academic_risk,
        analysis.financial_risk
    );
    for factor in analysis.risk_factors.iter() {
        println!("  - {factor}");
    }
    if let Some(alert) = &analysis.generated_alert {
        println!("  new {} alert: {}", alert.severity, alert.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
            println!("Organization: {}", db::DEMO_ORGANIZATION_ID);
            println!("Mentor: {}", db::DEMO_MENTOR_ID);
        }
        Commands::Import { csv, organization } => {
            let imported = db::import_csv(&pool, organization, &csv).await?;
            println!("Imported {imported} students from {}.", csv.display());
        }
        Commands::CreateOrg { name } => {
            let id = db::create_organization(&pool, &name).await?;
            println!("Organization {name}: {id}");
        }
        Commands::GenerateCode { organization, role } => {
            let invitation = db::create_invitation(&pool, organization, role).await?;
            println!("Invitation code for {}s: {}", invitation.role, invitation.code);
        }
        Commands::Invitations { organization } => {
            let invitations = db::list_invitations(&pool, organization).await?;
            if invitations.is_empty() {
                println!("No invitation codes issued.");
            }
            for invitation in invitations.iter() {
                println!(
                    "- {} {} (used {} times, issued {})",
                    invitation.code,
                    invitation.role,
                    invitation.uses,
                    invitation.created_at.format("%Y-%m-%d")
                );
            }
        }
        Commands::AddMentor {
            organization,
            code,
            name,
            email,
        } => {
            let (organization, id) = match (organization, code) {
                (Some(organization), _) => (
                    organization,
                    db::create_mentor(&pool, organization, &name, &email).await?,
                ),
                (None, Some(code)) => db::enroll_mentor(&pool, &code, &name, &email).await?,
                (None, None) => bail!("either --organization or --code is required"),
            };
            println!("Mentor {name}: {id} (organization {organization})");
        }
        Commands::AddStudent {
            organization,
            code,
            name,
            email,
            roll_number,
            gpa,
            mentor,
        } => {
            let mut student = db::NewStudent::new(&name, &email, roll_number.as_deref())?;
            student.gpa = gpa;
            let id = match (organization, code) {
                (Some(organization), _) => db::create_student(&pool, organization, &student).await?,
                (None, Some(code)) => db::enroll_student(&pool, &code, &student).await?.1,
                (None, None) => bail!("either --organization or --code is required"),
            };
            if let Some(mentor) = mentor {
                db::assign_mentor(&pool, id, mentor).await?;
            }
            let analysis = db::recompute(&pool, id).await?;
            println!("Student {name}: {id}");
            print_analysis(&name, &analysis);
        }
        Commands::AddDepartment {
            organization,
            name,
            description,
        } => {
            let id = db::create_department(&pool, organization, &name, description.as_deref()).await?;
            println!("Department {name}: {id}");
        }
        Commands::Departments { organization } => {
            let departments = db::list_departments(&pool, organization).await?;
            if departments.is_empty() {
                println!("No departments.");
            }
            for department in departments.iter() {
                println!(
                    "- {} {} ({} students){}{}",
                    department.id,
                    department.name,
                    department.student_count,
                    if department.is_active { "" } else { " [archived]" },
                    if department.description.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", department.description)
                    }
                );
            }
        }
        Commands::AssignDepartment {
            student,
            department,
        } => {
            db::assign_department(&pool, student, department).await?;
            println!("Student {student} placed in department {department}.");
        }
        Commands::ArchiveDepartment { department } => {
            db::archive_department(&pool, department).await?;
            println!("Department {department} archived.");
        }
        Commands::AssignMentor { student, mentor } => {
            db::assign_mentor(&pool, student, mentor).await?;
            println!("Mentor {mentor} assigned to student {student}.");
        }
        Commands::Analyze {
            student,
            organization,
            mentor,
            json,
        } => {
            let student_ids = match (student, organization) {
                (Some(student), _) => vec![student],
                (None, Some(organization)) => {
                    db::list_student_ids(&pool, organization, mentor).await?
                }
                (None, None) => bail!("either --student or --organization is required"),
            };

            let mut results = Vec::with_capacity(student_ids.len());
            let mut failures = 0usize;
            for student_id in student_ids {
                let pool = &pool;
                match db::with_retry("recompute", move || db::recompute(pool, student_id)).await {
                    Ok(analysis) => results.push((student_id, analysis)),
                    Err(e) if student.is_none() => {
                        warn!("skipping {student_id}: {e:#}");
                        failures += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if json {
                let payload: Vec<serde_json::Value> = results
                    .iter()
                    .map(|(student_id, analysis)| {
                        serde_json::json!({ "student_id": student_id, "analysis": analysis })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                for (student_id, analysis) in results.iter() {
                    print_analysis(&student_id.to_string(), analysis);
                }
            }

            info!("analyzed {} students, {} failed", results.len(), failures);
        }
        Commands::Profile { student } => {
            let record = db::fetch_student(&pool, student).await?;
            println!(
                "{} ({}) {} in organization {}",
                record.identity.name,
                record.identity.label(),
                record.id,
                record.organization_id
            );
            match record.mentor_id {
                Some(mentor) => println!("Mentor: {mentor}"),
                None => println!("Mentor: unassigned"),
            }
            if let Some(department) = &record.department {
                println!("Department: {department}");
            }
            match record.attendance_percentage() {
                Some(pct) => println!(
                    "Attendance: {pct:.1}% ({} recorded sessions)",
                    record.attendance.len()
                ),
                None => println!("Attendance: no classes recorded"),
            }
            if let Some(gpa) = record.gpa {
                println!("GPA: {gpa:.2}");
            }
            println!(
                "Fees: paid {:.2} of {:.2}, pending {:.2} ({})",
                record.fees.paid_amount,
                record.fees.total_fee_amount,
                record.fees.pending_amount,
                record.fees.payment_status
            );

            let subjects = records::subject_performance(&record.tests);
            if !subjects.is_empty() {
                println!("Subjects:");
            }
            for subject in subjects.iter() {
                println!(
                    "  - {}: {:.1}% over {} tests (last {})",
                    subject.subject,
                    subject.average_percentage,
                    subject.total_tests,
                    subject.last_test_date
                );
            }

            // Read-only view; stored analysis and alerts are left untouched.
            let analysis = risk::analyze(&record.snapshot(HashSet::new()));
            print_analysis("Current standing", &analysis);
        }
        Commands::Tips { student } => {
            let record = db::fetch_student(&pool, student).await?;
            let analysis = risk::analyze(&record.snapshot(HashSet::new()));
            println!("Tips for {}:", record.identity.name);
            for tip in risk::student_tips(
                record.attendance_percentage(),
                Some(analysis.overall_risk_level),
            ) {
                println!("- {tip}");
            }
        }
        Commands::Attendance {
            student,
            status,
            subject,
            date,
        } => {
            let entry = AttendanceEntry {
                date: date.unwrap_or_else(|| Utc::now().date_naive()),
                status,
                subject,
            };
            let analysis = db::record_attendance(&pool, student, &entry).await?;
            println!("Marked {} for {} on {}.", entry.status, entry.subject, entry.date);
            print_analysis(&student.to_string(), &analysis);
        }
        Commands::AddTest {
            student,
            subject,
            name,
            max_marks,
            obtained,
            date,
        } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let result = TestResult::new(&subject, &name, max_marks, obtained, date)?;
            let analysis = db::add_test_result(&pool, student, &result).await?;
            println!(
                "Recorded {} {}: {:.1}% ({}).",
                result.subject, result.test_name, result.percentage, result.grade
            );
            print_analysis(&student.to_string(), &analysis);
        }
        Commands::Pay {
            student,
            amount,
            date,
            method,
            receipt,
            description,
        } => {
            let payment = FeePayment::new(
                amount,
                date.unwrap_or_else(|| Utc::now().date_naive()),
                method.as_deref(),
                receipt.as_deref(),
                description.as_deref(),
            )?;
            let (ledger, analysis) = db::record_payment(&pool, student, &payment).await?;
            println!(
                "Receipt {}: paid {:.2} of {:.2}, pending {:.2} ({}).",
                payment.receipt_number,
                ledger.paid_amount,
                ledger.total_fee_amount,
                ledger.pending_amount,
                ledger.payment_status
            );
            print_analysis(&student.to_string(), &analysis);
        }
        Commands::FeeTerms {
            student,
            total,
            due_date,
        } => {
            let (ledger, analysis) = db::update_fee_terms(&pool, student, total, due_date).await?;
            println!(
                "Fees: total {:.2}, pending {:.2}, due {} ({}).",
                ledger.total_fee_amount,
                ledger.pending_amount,
                ledger
                    .due_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "not set".to_string()),
                ledger.payment_status
            );
            print_analysis(&student.to_string(), &analysis);
        }
        Commands::Wellbeing {
            student,
            mood,
            stress,
            sleep,
            notes,
            date,
        } => {
            let response = WellbeingResponse::new(
                date.unwrap_or_else(|| Utc::now().date_naive()),
                mood,
                stress,
                sleep,
                notes.as_deref(),
            )?;
            db::record_wellbeing(&pool, student, &response).await?;
            println!("Thank you for your response.");
        }
        Commands::Alerts {
            organization,
            mentor,
            limit,
        } => {
            let mut alerts = db::list_open_alerts(&pool, organization, mentor).await?;
            if alerts.is_empty() {
                println!("No unacknowledged alerts.");
                return Ok(());
            }

            report::sort_alerts(&mut alerts);
            for record in alerts.iter().take(limit) {
                println!(
                    "- {} [{}] {} ({}, student {}): {} ({})",
                    record.id,
                    record.alert.severity,
                    record.identity.name,
                    record.identity.label(),
                    record.student_id,
                    record.alert.message,
                    record.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Acknowledge { alert, mentor } => {
            db::acknowledge_alert(&pool, alert, mentor).await?;
            println!("Alert acknowledged successfully.");
        }
        Commands::Overview {
            organization,
            mentor,
            json,
        } => {
            let overviews = db::refresh_overview(&pool, organization, mentor).await?;
            let summary = report::summarize(&overviews);

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }

            println!(
                "{} students, average attendance {:.1}%, {} at risk",
                summary.total_students, summary.attendance_rate, summary.at_risk_students
            );
            for overview in overviews.iter() {
                let level = overview
                    .analysis
                    .as_ref()
                    .map(|stored| stored.analysis.overall_risk_level.to_string())
                    .unwrap_or_else(|| "unscored".to_string());
                println!(
                    "- {} ({}) {}{}",
                    overview.identity.name,
                    overview.identity.label(),
                    level,
                    if overview.stale { " (stale)" } else { "" }
                );
            }
        }
        Commands::Report {
            organization,
            mentor,
            out,
        } => {
            let overviews = db::refresh_overview(&pool, organization, mentor).await?;
            let alerts = db::list_open_alerts(&pool, organization, mentor).await?;
            let wellbeing = db::fetch_wellbeing_summary(&pool, organization, mentor).await?;
            let scope = match mentor {
                Some(mentor) => format!("mentor {mentor}"),
                None => format!("organization {organization}"),
            };
            let report = report::build_report(
                &scope,
                Utc::now().date_naive(),
                &overviews,
                &alerts,
                &wellbeing,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
