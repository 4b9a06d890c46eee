use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::models::{
    Alert, AlertKey, AlertRecord, Department, FeePaymentStatus, Invitation, InvitationRole,
    RiskAnalysis, StoredAnalysis, StudentIdentity, StudentOverview, WellbeingSummary,
};
use crate::records::{
    AttendanceBaseline, AttendanceEntry, FeeLedger, FeePayment, StudentRecord, TestResult,
    WellbeingResponse,
};
use crate::risk;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Retries `operation` on transient storage faults with exponential backoff.
pub async fn with_retry<T, F, Fut>(operation: &str, f: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{operation} succeeded after {attempt} attempts");
                }
                return Ok(value);
            }
            Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                warn!("{operation} attempt {attempt} failed: {e:#}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Io(_)) | Some(sqlx::Error::PoolTimedOut) => true,
        Some(sqlx::Error::Database(db)) => db.code().is_some_and(|code| is_retryable_sqlstate(&code)),
        _ => false,
    }
}

/// serialization_failure and deadlock_detected.
fn is_retryable_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01")
}

/// Student as supplied by seed data or an import.
#[derive(Debug, Clone)]
pub struct NewStudent {
    pub identity: StudentIdentity,
    pub email: String,
    pub gpa: Option<f64>,
    pub attendance: AttendanceBaseline,
    pub fees: FeeLedger,
}

impl NewStudent {
    pub fn new(name: &str, email: &str, roll_number: Option<&str>) -> Result<Self, ValidationError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(ValidationError::MissingIdentity("email is required"));
        }
        let identity = StudentIdentity::new(name, roll_number, Some(&email))?;
        Ok(Self {
            identity,
            email,
            gpa: None,
            attendance: AttendanceBaseline::default(),
            fees: FeeLedger::default(),
        })
    }
}

pub async fn create_organization(pool: &PgPool, name: &str) -> anyhow::Result<Uuid> {
    create_organization_with_id(pool, Uuid::new_v4(), name).await
}

async fn create_organization_with_id(pool: &PgPool, id: Uuid, name: &str) -> anyhow::Result<Uuid> {
    let name = name.trim();
    if name.is_empty() {
        bail!("organization name must not be empty");
    }

    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO edubeacon.organizations (id, name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(name)
    .fetch_one(pool)
    .await?
    .get("id");

    Ok(id)
}

pub async fn create_mentor(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    email: &str,
) -> anyhow::Result<Uuid> {
    create_mentor_with_id(pool, Uuid::new_v4(), organization_id, name, email).await
}

async fn create_mentor_with_id(
    pool: &PgPool,
    id: Uuid,
    organization_id: Uuid,
    name: &str,
    email: &str,
) -> anyhow::Result<Uuid> {
    let mut conn = pool.acquire().await?;
    insert_mentor(&mut conn, id, organization_id, name, email).await
}

async fn insert_mentor(
    conn: &mut PgConnection,
    id: Uuid,
    organization_id: Uuid,
    name: &str,
    email: &str,
) -> anyhow::Result<Uuid> {
    let row = sqlx::query(
        r#"
        INSERT INTO edubeacon.mentors (id, organization_id, full_name, email)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name
        WHERE edubeacon.mentors.organization_id = EXCLUDED.organization_id
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(name.trim())
    .bind(email.trim().to_lowercase())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(row.get("id")),
        None => bail!("mentor {email} already belongs to another organization"),
    }
}

pub async fn create_student(
    pool: &PgPool,
    organization_id: Uuid,
    student: &NewStudent,
) -> anyhow::Result<Uuid> {
    let mut conn = pool.acquire().await?;
    upsert_student(&mut conn, Uuid::new_v4(), organization_id, student).await
}

async fn upsert_student(
    conn: &mut PgConnection,
    id: Uuid,
    organization_id: Uuid,
    student: &NewStudent,
) -> anyhow::Result<Uuid> {
    let row = sqlx::query(
        r#"
        INSERT INTO edubeacon.students
        (id, organization_id, full_name, email, roll_number, gpa,
         baseline_attendance, baseline_classes,
         fee_total, fee_paid, fee_pending, fee_status, fee_due_date, fee_last_payment_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            roll_number = EXCLUDED.roll_number,
            gpa = EXCLUDED.gpa,
            baseline_attendance = EXCLUDED.baseline_attendance,
            baseline_classes = EXCLUDED.baseline_classes,
            fee_total = EXCLUDED.fee_total,
            fee_paid = EXCLUDED.fee_paid,
            fee_pending = EXCLUDED.fee_pending,
            fee_status = EXCLUDED.fee_status,
            fee_due_date = EXCLUDED.fee_due_date,
            fee_last_payment_date = EXCLUDED.fee_last_payment_date,
            updated_at = now()
        WHERE edubeacon.students.organization_id = EXCLUDED.organization_id
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(&student.identity.name)
    .bind(&student.email)
    .bind(student.identity.roll_number.as_deref())
    .bind(student.gpa)
    .bind(student.attendance.percentage)
    .bind(student.attendance.classes)
    .bind(student.fees.total_fee_amount)
    .bind(student.fees.paid_amount)
    .bind(student.fees.pending_amount)
    .bind(student.fees.payment_status.as_str())
    .bind(student.fees.due_date)
    .bind(student.fees.last_payment_date)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(row.get("id")),
        None => bail!(
            "student {} already belongs to another organization",
            student.email
        ),
    }
}

/// Links a student to a mentor of the same organization.
pub async fn assign_mentor(pool: &PgPool, student_id: Uuid, mentor_id: Uuid) -> anyhow::Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE edubeacon.students s
        SET mentor_id = m.id, updated_at = now()
        FROM edubeacon.mentors m
        WHERE s.id = $1 AND m.id = $2 AND m.organization_id = s.organization_id
        "#,
    )
    .bind(student_id)
    .bind(mentor_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        bail!("student {student_id} and mentor {mentor_id} are not in the same organization");
    }
    Ok(())
}

const INVITATION_ATTEMPTS: u32 = 5;

fn invitation_from_row(row: &PgRow) -> anyhow::Result<Invitation> {
    let role: String = row.get("role");
    Ok(Invitation {
        code: row.get("code"),
        organization_id: row.get("organization_id"),
        role: role.parse()?,
        uses: row.get("uses"),
        created_at: row.get("created_at"),
    })
}

/// Issues a fresh code that enrolls its holder into `organization_id` as `role`.
pub async fn create_invitation(
    pool: &PgPool,
    organization_id: Uuid,
    role: InvitationRole,
) -> anyhow::Result<Invitation> {
    for _ in 0..INVITATION_ATTEMPTS {
        let code = Invitation::code_from(Uuid::new_v4().as_u128());
        let row = sqlx::query(
            r#"
            INSERT INTO edubeacon.invitation_codes (code, organization_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (code) DO NOTHING
            RETURNING code, organization_id, role, uses, created_at
            "#,
        )
        .bind(&code)
        .bind(organization_id)
        .bind(role.as_str())
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to create invitation for organization {organization_id}"))?;

        match row {
            Some(row) => {
                info!("issued {role} invitation {code} for organization {organization_id}");
                return invitation_from_row(&row);
            }
            None => debug!("invitation code {code} already taken"),
        }
    }
    bail!("could not allocate a unique invitation code after {INVITATION_ATTEMPTS} attempts")
}

pub async fn list_invitations(pool: &PgPool, organization_id: Uuid) -> anyhow::Result<Vec<Invitation>> {
    let rows = sqlx::query(
        r#"
        SELECT code, organization_id, role, uses, created_at
        FROM edubeacon.invitation_codes
        WHERE organization_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(invitation_from_row).collect()
}

/// Checks `code` admits `role` and counts the enrollment. Returns the organization.
async fn redeem_invitation(
    conn: &mut PgConnection,
    code: &str,
    role: InvitationRole,
) -> anyhow::Result<Uuid> {
    let code = code.trim();
    let row = sqlx::query(
        r#"
        SELECT code, organization_id, role, uses, created_at
        FROM edubeacon.invitation_codes
        WHERE code = $1
        FOR UPDATE
        "#,
    )
    .bind(code)
    .fetch_optional(&mut *conn)
    .await?
    .with_context(|| format!("invalid invitation code {code}"))?;

    let organization_id = invitation_from_row(&row)?.organization_for(role)?;
    sqlx::query("UPDATE edubeacon.invitation_codes SET uses = uses + 1 WHERE code = $1")
        .bind(code)
        .execute(&mut *conn)
        .await?;
    Ok(organization_id)
}

/// Creates a student in the organization named by a student invitation code.
/// Returns `(organization_id, student_id)`.
pub async fn enroll_student(
    pool: &PgPool,
    code: &str,
    student: &NewStudent,
) -> anyhow::Result<(Uuid, Uuid)> {
    let mut tx = pool.begin().await?;
    let organization_id = redeem_invitation(&mut tx, code, InvitationRole::Student).await?;
    let student_id = upsert_student(&mut tx, Uuid::new_v4(), organization_id, student).await?;
    tx.commit().await?;
    Ok((organization_id, student_id))
}

pub async fn enroll_mentor(
    pool: &PgPool,
    code: &str,
    name: &str,
    email: &str,
) -> anyhow::Result<(Uuid, Uuid)> {
    let mut tx = pool.begin().await?;
    let organization_id = redeem_invitation(&mut tx, code, InvitationRole::Mentor).await?;
    let mentor_id = insert_mentor(&mut tx, Uuid::new_v4(), organization_id, name, email).await?;
    tx.commit().await?;
    Ok((organization_id, mentor_id))
}

pub async fn create_department(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    description: Option<&str>,
) -> anyhow::Result<Uuid> {
    let name = name.trim();
    if name.is_empty() {
        bail!("department name must not be empty");
    }

    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO edubeacon.departments (id, organization_id, name, description)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (organization_id, name) DO UPDATE
        SET description = EXCLUDED.description, is_active = TRUE
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(name)
    .bind(description.unwrap_or_default().trim())
    .fetch_one(pool)
    .await?
    .get("id");

    Ok(id)
}

pub async fn list_departments(pool: &PgPool, organization_id: Uuid) -> anyhow::Result<Vec<Department>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.organization_id, d.name, d.description, d.is_active,
               COUNT(s.id) AS student_count
        FROM edubeacon.departments d
        LEFT JOIN edubeacon.students s ON s.department_id = d.id
        WHERE d.organization_id = $1
        GROUP BY d.id
        ORDER BY d.name
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Department {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            name: row.get("name"),
            description: row.get("description"),
            is_active: row.get("is_active"),
            student_count: row.get("student_count"),
        })
        .collect())
}

/// Places a student in an active department of the same organization.
pub async fn assign_department(
    pool: &PgPool,
    student_id: Uuid,
    department_id: Uuid,
) -> anyhow::Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE edubeacon.students s
        SET department_id = d.id, updated_at = now()
        FROM edubeacon.departments d
        WHERE s.id = $1 AND d.id = $2
          AND d.organization_id = s.organization_id
          AND d.is_active
        "#,
    )
    .bind(student_id)
    .bind(department_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        bail!("student {student_id} and active department {department_id} are not in the same organization");
    }
    Ok(())
}

/// Stops new assignments to a department; current members keep it.
pub async fn archive_department(pool: &PgPool, department_id: Uuid) -> anyhow::Result<()> {
    let result = sqlx::query("UPDATE edubeacon.departments SET is_active = FALSE WHERE id = $1")
        .bind(department_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        bail!("department {department_id} not found");
    }
    Ok(())
}

async fn lock_student(conn: &mut PgConnection, student_id: Uuid) -> anyhow::Result<()> {
    sqlx::query("SELECT id FROM edubeacon.students WHERE id = $1 FOR UPDATE")
        .bind(student_id)
        .fetch_optional(&mut *conn)
        .await?
        .with_context(|| format!("student {student_id} not found"))?;
    Ok(())
}

async fn load_student(conn: &mut PgConnection, student_id: Uuid) -> anyhow::Result<StudentRecord> {
    let row = sqlx::query(
        r#"
        SELECT s.id, s.organization_id, s.mentor_id, d.name AS department,
               s.full_name, s.email, s.roll_number, s.gpa,
               s.baseline_attendance, s.baseline_classes,
               s.fee_total, s.fee_paid, s.fee_pending, s.fee_status, s.fee_due_date,
               s.fee_last_payment_date
        FROM edubeacon.students s
        LEFT JOIN edubeacon.departments d ON d.id = s.department_id
        WHERE s.id = $1
        "#,
    )
    .bind(student_id)
    .fetch_optional(&mut *conn)
    .await?
    .with_context(|| format!("student {student_id} not found"))?;

    let full_name: String = row.get("full_name");
    let email: String = row.get("email");
    let roll_number: Option<String> = row.get("roll_number");
    let identity = StudentIdentity::new(&full_name, roll_number.as_deref(), Some(&email))?;
    let fee_status: String = row.get("fee_status");

    let fees = FeeLedger {
        total_fee_amount: row.get("fee_total"),
        paid_amount: row.get("fee_paid"),
        pending_amount: row.get("fee_pending"),
        payment_status: fee_status.parse::<FeePaymentStatus>()?,
        due_date: row.get("fee_due_date"),
        last_payment_date: row.get("fee_last_payment_date"),
    };

    let attendance_rows = sqlx::query(
        r#"
        SELECT session_date, subject, status
        FROM edubeacon.attendance_records
        WHERE student_id = $1
        ORDER BY session_date, subject
        "#,
    )
    .bind(student_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut attendance = Vec::with_capacity(attendance_rows.len());
    for entry in attendance_rows {
        let status: String = entry.get("status");
        attendance.push(AttendanceEntry {
            date: entry.get("session_date"),
            status: status.parse()?,
            subject: entry.get("subject"),
        });
    }

    let tests = sqlx::query(
        r#"
        SELECT subject, test_name, max_marks, obtained_marks, percentage, grade, taken_on
        FROM edubeacon.test_results
        WHERE student_id = $1
        ORDER BY taken_on, recorded_at
        "#,
    )
    .bind(student_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|test| TestResult {
        subject: test.get("subject"),
        test_name: test.get("test_name"),
        max_marks: test.get("max_marks"),
        obtained_marks: test.get("obtained_marks"),
        percentage: test.get("percentage"),
        date: test.get("taken_on"),
        grade: test.get("grade"),
    })
    .collect();

    Ok(StudentRecord {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        mentor_id: row.get("mentor_id"),
        department: row.get("department"),
        identity,
        gpa: row.get("gpa"),
        attendance_baseline: AttendanceBaseline {
            percentage: row.get("baseline_attendance"),
            classes: row.get("baseline_classes"),
        },
        attendance,
        tests,
        fees,
    })
}

async fn load_open_alert_keys(
    conn: &mut PgConnection,
    student_id: Uuid,
) -> anyhow::Result<HashSet<AlertKey>> {
    let rows = sqlx::query(
        r#"
        SELECT alert_type, severity
        FROM edubeacon.alerts
        WHERE student_id = $1 AND NOT acknowledged
        "#,
    )
    .bind(student_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut keys = HashSet::with_capacity(rows.len());
    for row in rows {
        let severity: String = row.get("severity");
        keys.insert(AlertKey {
            alert_type: row.get("alert_type"),
            severity: severity.parse()?,
        });
    }
    Ok(keys)
}

async fn save_analysis(
    conn: &mut PgConnection,
    student_id: Uuid,
    analysis: &RiskAnalysis,
    analyzed_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO edubeacon.risk_analyses
        (student_id, attendance_risk, academic_risk, financial_risk,
         overall_risk_level, risk_factors, analyzed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (student_id) DO UPDATE
        SET attendance_risk = EXCLUDED.attendance_risk,
            academic_risk = EXCLUDED.academic_risk,
            financial_risk = EXCLUDED.financial_risk,
            overall_risk_level = EXCLUDED.overall_risk_level,
            risk_factors = EXCLUDED.risk_factors,
            analyzed_at = EXCLUDED.analyzed_at
        "#,
    )
    .bind(student_id)
    .bind(analysis.attendance_risk.as_str())
    .bind(analysis.academic_risk.as_str())
    .bind(analysis.financial_risk.as_str())
    .bind(analysis.overall_risk_level.as_str())
    .bind(&analysis.risk_factors)
    .bind(analyzed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_alert(conn: &mut PgConnection, student_id: Uuid, alert: &Alert) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO edubeacon.alerts (id, student_id, alert_type, severity, message)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (student_id, alert_type, severity) WHERE NOT acknowledged DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(&alert.alert_type)
    .bind(alert.severity.as_str())
    .bind(&alert.message)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Re-scores one student inside the caller's transaction. The student row stays
/// locked until the transaction ends, so concurrent recomputes for the same
/// student cannot both append an alert.
async fn recompute_in(
    conn: &mut PgConnection,
    student_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<RiskAnalysis> {
    lock_student(conn, student_id).await?;
    let record = load_student(conn, student_id).await?;
    let open_alerts = load_open_alert_keys(conn, student_id).await?;
    let snapshot = record.snapshot(open_alerts);

    let analysis = risk::analyze_with_alert(&snapshot, &record.identity, now);
    save_analysis(conn, student_id, &analysis, now).await?;

    if let Some(alert) = &analysis.generated_alert {
        if insert_alert(conn, student_id, alert).await? {
            info!(
                "raised {} alert for {} ({})",
                alert.severity,
                record.identity.name,
                record.identity.label()
            );
        }
    }

    debug!(
        "recomputed {student_id}: overall {} with {} factors",
        analysis.overall_risk_level,
        analysis.risk_factors.len()
    );
    Ok(analysis)
}

pub async fn recompute(pool: &PgPool, student_id: Uuid) -> anyhow::Result<RiskAnalysis> {
    let mut tx = pool.begin().await?;
    let analysis = recompute_in(&mut tx, student_id, Utc::now()).await?;
    tx.commit().await?;
    Ok(analysis)
}

pub async fn fetch_student(pool: &PgPool, student_id: Uuid) -> anyhow::Result<StudentRecord> {
    let mut conn = pool.acquire().await?;
    load_student(&mut conn, student_id).await
}

pub async fn list_student_ids(
    pool: &PgPool,
    organization_id: Uuid,
    mentor_id: Option<Uuid>,
) -> anyhow::Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        SELECT id FROM edubeacon.students
        WHERE organization_id = $1 AND ($2::uuid IS NULL OR mentor_id = $2)
        ORDER BY full_name
        "#,
    )
    .bind(organization_id)
    .bind(mentor_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| row.get("id")).collect())
}

pub async fn record_attendance(
    pool: &PgPool,
    student_id: Uuid,
    entry: &AttendanceEntry,
) -> anyhow::Result<RiskAnalysis> {
    let mut tx = pool.begin().await?;
    lock_student(&mut tx, student_id).await?;

    sqlx::query(
        r#"
        INSERT INTO edubeacon.attendance_records (id, student_id, session_date, subject, status)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (student_id, session_date, subject) DO UPDATE
        SET status = EXCLUDED.status
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(entry.date)
    .bind(entry.subject.trim())
    .bind(entry.status.as_str())
    .execute(&mut *tx)
    .await?;

    let analysis = recompute_in(&mut tx, student_id, Utc::now()).await?;
    tx.commit().await?;
    Ok(analysis)
}

async fn insert_test_result(
    conn: &mut PgConnection,
    student_id: Uuid,
    result: &TestResult,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO edubeacon.test_results
        (id, student_id, subject, test_name, max_marks, obtained_marks, percentage, grade, taken_on)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(&result.subject)
    .bind(&result.test_name)
    .bind(result.max_marks)
    .bind(result.obtained_marks)
    .bind(result.percentage)
    .bind(&result.grade)
    .bind(result.date)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn add_test_result(
    pool: &PgPool,
    student_id: Uuid,
    result: &TestResult,
) -> anyhow::Result<RiskAnalysis> {
    let mut tx = pool.begin().await?;
    lock_student(&mut tx, student_id).await?;
    insert_test_result(&mut tx, student_id, result).await?;
    let analysis = recompute_in(&mut tx, student_id, Utc::now()).await?;
    tx.commit().await?;
    Ok(analysis)
}

async fn save_ledger(conn: &mut PgConnection, student_id: Uuid, ledger: &FeeLedger) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE edubeacon.students
        SET fee_total = $2, fee_paid = $3, fee_pending = $4, fee_status = $5,
            fee_due_date = $6, fee_last_payment_date = $7, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(student_id)
    .bind(ledger.total_fee_amount)
    .bind(ledger.paid_amount)
    .bind(ledger.pending_amount)
    .bind(ledger.payment_status.as_str())
    .bind(ledger.due_date)
    .bind(ledger.last_payment_date)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_payment(
    conn: &mut PgConnection,
    student_id: Uuid,
    payment: &FeePayment,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO edubeacon.fee_payments
        (id, student_id, amount, payment_date, payment_method, receipt_number, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(payment.amount)
    .bind(payment.payment_date)
    .bind(&payment.payment_method)
    .bind(&payment.receipt_number)
    .bind(&payment.description)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("failed to record receipt {}", payment.receipt_number))?;
    Ok(())
}

pub async fn record_payment(
    pool: &PgPool,
    student_id: Uuid,
    payment: &FeePayment,
) -> anyhow::Result<(FeeLedger, RiskAnalysis)> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    lock_student(&mut tx, student_id).await?;

    let mut ledger = load_student(&mut tx, student_id).await?.fees;
    ledger.apply_payment(payment, now);
    insert_payment(&mut tx, student_id, payment).await?;
    save_ledger(&mut tx, student_id, &ledger).await?;

    let analysis = recompute_in(&mut tx, student_id, now).await?;
    tx.commit().await?;
    Ok((ledger, analysis))
}

pub async fn update_fee_terms(
    pool: &PgPool,
    student_id: Uuid,
    total: Option<f64>,
    due_date: Option<NaiveDate>,
) -> anyhow::Result<(FeeLedger, RiskAnalysis)> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    lock_student(&mut tx, student_id).await?;

    let mut ledger = load_student(&mut tx, student_id).await?.fees;
    if let Some(total) = total {
        ledger.set_total(total, now)?;
    }
    if let Some(due_date) = due_date {
        ledger.set_due_date(due_date, now);
    }
    save_ledger(&mut tx, student_id, &ledger).await?;

    let analysis = recompute_in(&mut tx, student_id, now).await?;
    tx.commit().await?;
    Ok((ledger, analysis))
}

pub async fn record_wellbeing(
    pool: &PgPool,
    student_id: Uuid,
    response: &WellbeingResponse,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO edubeacon.wellbeing_responses
        (id, student_id, responded_on, mood, stress, sleep, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(response.date)
    .bind(response.mood)
    .bind(response.stress)
    .bind(response.sleep)
    .bind(&response.notes)
    .execute(pool)
    .await
    .with_context(|| format!("failed to record wellbeing for student {student_id}"))?;
    Ok(())
}

fn stored_analysis(row: &PgRow) -> anyhow::Result<Option<StoredAnalysis>> {
    let analyzed_at: Option<DateTime<Utc>> = row.get("analyzed_at");
    let Some(analyzed_at) = analyzed_at else {
        return Ok(None);
    };

    let tier = |column: &str| -> anyhow::Result<String> {
        row.try_get::<String, _>(column)
            .with_context(|| format!("analysis column {column} is missing"))
    };

    Ok(Some(StoredAnalysis {
        analysis: RiskAnalysis {
            attendance_risk: tier("attendance_risk")?.parse()?,
            academic_risk: tier("academic_risk")?.parse()?,
            financial_risk: tier("financial_risk")?.parse()?,
            overall_risk_level: tier("overall_risk_level")?.parse()?,
            risk_factors: row.get("risk_factors"),
            generated_alert: None,
        },
        analyzed_at,
    }))
}

/// Students with their last stored analysis, without re-scoring.
pub async fn fetch_overview(
    pool: &PgPool,
    organization_id: Uuid,
    mentor_id: Option<Uuid>,
) -> anyhow::Result<Vec<StudentOverview>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.full_name, s.email, s.roll_number,
               s.baseline_attendance, s.baseline_classes,
               COALESCE(a.sessions, 0) AS sessions, COALESCE(a.attended, 0) AS attended,
               r.attendance_risk, r.academic_risk, r.financial_risk,
               r.overall_risk_level, r.risk_factors, r.analyzed_at
        FROM edubeacon.students s
        LEFT JOIN (
            SELECT student_id,
                   COUNT(*) AS sessions,
                   COUNT(*) FILTER (WHERE status <> 'absent') AS attended
            FROM edubeacon.attendance_records
            GROUP BY student_id
        ) a ON a.student_id = s.id
        LEFT JOIN edubeacon.risk_analyses r ON r.student_id = s.id
        WHERE s.organization_id = $1 AND ($2::uuid IS NULL OR s.mentor_id = $2)
        ORDER BY s.full_name
        "#,
    )
    .bind(organization_id)
    .bind(mentor_id)
    .fetch_all(pool)
    .await?;

    let mut overviews = Vec::with_capacity(rows.len());
    for row in rows {
        let full_name: String = row.get("full_name");
        let email: String = row.get("email");
        let roll_number: Option<String> = row.get("roll_number");
        let baseline = AttendanceBaseline {
            percentage: row.get("baseline_attendance"),
            classes: row.get("baseline_classes"),
        };

        overviews.push(StudentOverview {
            student_id: row.get("id"),
            identity: StudentIdentity::new(&full_name, roll_number.as_deref(), Some(&email))?,
            attendance_percentage: baseline.combined_with(row.get("sessions"), row.get("attended")),
            analysis: stored_analysis(&row)?,
            stale: false,
        });
    }

    Ok(overviews)
}

/// Re-scores every student in scope, then returns the overview. A student whose
/// refresh fails keeps the last stored analysis, flagged as stale.
pub async fn refresh_overview(
    pool: &PgPool,
    organization_id: Uuid,
    mentor_id: Option<Uuid>,
) -> anyhow::Result<Vec<StudentOverview>> {
    let mut failed = HashSet::new();

    for student_id in list_student_ids(pool, organization_id, mentor_id).await? {
        if let Err(e) = with_retry("recompute", move || recompute(pool, student_id)).await {
            warn!("showing last known analysis for {student_id}: {e:#}");
            failed.insert(student_id);
        }
    }

    let mut overviews = fetch_overview(pool, organization_id, mentor_id).await?;
    for overview in overviews.iter_mut() {
        overview.stale = failed.contains(&overview.student_id);
    }
    Ok(overviews)
}

/// Unacknowledged high and critical alerts in scope, unsorted.
pub async fn list_open_alerts(
    pool: &PgPool,
    organization_id: Uuid,
    mentor_id: Option<Uuid>,
) -> anyhow::Result<Vec<AlertRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id, a.student_id, s.full_name, s.roll_number, s.email,
               a.alert_type, a.severity, a.message, a.acknowledged, a.created_at
        FROM edubeacon.alerts a
        JOIN edubeacon.students s ON s.id = a.student_id
        WHERE s.organization_id = $1
          AND ($2::uuid IS NULL OR s.mentor_id = $2)
          AND NOT a.acknowledged
          AND a.severity IN ('high', 'critical')
        "#,
    )
    .bind(organization_id)
    .bind(mentor_id)
    .fetch_all(pool)
    .await?;

    let mut alerts = Vec::with_capacity(rows.len());
    for row in rows {
        let full_name: String = row.get("full_name");
        let email: String = row.get("email");
        let roll_number: Option<String> = row.get("roll_number");
        let severity: String = row.get("severity");

        alerts.push(AlertRecord {
            id: row.get("id"),
            student_id: row.get("student_id"),
            identity: StudentIdentity::new(&full_name, roll_number.as_deref(), Some(&email))?,
            alert: Alert {
                alert_type: row.get("alert_type"),
                severity: severity.parse()?,
                message: row.get("message"),
                acknowledged: row.get("acknowledged"),
            },
            created_at: row.get("created_at"),
        });
    }

    Ok(alerts)
}

/// Marks an open alert acknowledged by the student's mentor.
pub async fn acknowledge_alert(pool: &PgPool, alert_id: Uuid, mentor_id: Uuid) -> anyhow::Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE edubeacon.alerts a
        SET acknowledged = TRUE, acknowledged_by = $2, acknowledged_at = now()
        FROM edubeacon.students s
        WHERE a.id = $1
          AND s.id = a.student_id
          AND s.mentor_id = $2
          AND NOT a.acknowledged
        "#,
    )
    .bind(alert_id)
    .bind(mentor_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        bail!("alert {alert_id} not found, already acknowledged, or not assigned to mentor {mentor_id}");
    }
    info!("alert {alert_id} acknowledged by mentor {mentor_id}");
    Ok(())
}

pub async fn fetch_wellbeing_summary(
    pool: &PgPool,
    organization_id: Uuid,
    mentor_id: Option<Uuid>,
) -> anyhow::Result<WellbeingSummary> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(w.id) AS responses,
               COALESCE(AVG(w.mood)::float8, 0) AS avg_mood,
               COALESCE(AVG(w.stress)::float8, 0) AS avg_stress,
               COALESCE(AVG(w.sleep)::float8, 0) AS avg_sleep
        FROM edubeacon.wellbeing_responses w
        JOIN edubeacon.students s ON s.id = w.student_id
        WHERE s.organization_id = $1 AND ($2::uuid IS NULL OR s.mentor_id = $2)
        "#,
    )
    .bind(organization_id)
    .bind(mentor_id)
    .fetch_one(pool)
    .await?;

    let responses: i64 = row.get("responses");
    Ok(WellbeingSummary {
        responses: responses.max(0) as usize,
        avg_mood: row.get("avg_mood"),
        avg_stress: row.get("avg_stress"),
        avg_sleep: row.get("avg_sleep"),
    })
}

pub const DEMO_ORGANIZATION_ID: &str = "6f1c2a3e-8d4b-4c59-9e1f-2b7a0c4d5e61";
pub const DEMO_MENTOR_ID: &str = "a3d9e5f7-1b2c-4d3e-8f40-5a6b7c8d9e02";

struct SeedStudent {
    id: &'static str,
    name: &'static str,
    email: &'static str,
    roll_number: &'static str,
    attendance: f64,
    gpa: f64,
    tests: [(&'static str, &'static str, f64, f64, (u32, u32)); 4],
    fee_paid: f64,
    fee_status: FeePaymentStatus,
    due: (i32, u32, u32),
    payments: &'static [(f64, (i32, u32, u32), &'static str, &'static str, &'static str)],
}

fn seed_students() -> Vec<SeedStudent> {
    vec![
        SeedStudent {
            id: "9af3284b-f23b-49b8-9647-e925084ab89e",
            name: "Alice Johnson",
            email: "alice.johnson@student.edu",
            roll_number: "CS2023001",
            attendance: 85.0,
            gpa: 3.2,
            tests: [
                ("Mathematics", "Mid-term Exam", 100.0, 78.0, (1, 10)),
                ("Physics", "Quiz 1", 50.0, 42.0, (1, 12)),
                ("Chemistry", "Lab Test", 75.0, 58.0, (1, 14)),
                ("Computer Science", "Programming Assignment", 100.0, 92.0, (1, 16)),
            ],
            fee_paid: 30000.0,
            fee_status: FeePaymentStatus::Partial,
            due: (2024, 3, 31),
            payments: &[
                (15000.0, (2024, 1, 1), "online", "RCP001", "First installment"),
                (15000.0, (2024, 1, 15), "card", "RCP002", "Second installment"),
            ],
        },
        SeedStudent {
            id: "9e421abc-35bc-4ed1-a7df-680495a72ded",
            name: "Bob Smith",
            email: "bob.smith@student.edu",
            roll_number: "CS2023002",
            attendance: 65.0,
            gpa: 2.1,
            tests: [
                ("Mathematics", "Mid-term Exam", 100.0, 45.0, (1, 10)),
                ("Physics", "Quiz 1", 50.0, 28.0, (1, 12)),
                ("Chemistry", "Lab Test", 75.0, 38.0, (1, 14)),
                ("Computer Science", "Programming Assignment", 100.0, 62.0, (1, 16)),
            ],
            fee_paid: 0.0,
            fee_status: FeePaymentStatus::Overdue,
            due: (2024, 1, 31),
            payments: &[],
        },
        SeedStudent {
            id: "84958f85-d9ec-4826-be1d-bf61614ae950",
            name: "Carol Davis",
            email: "carol.davis@student.edu",
            roll_number: "CS2023003",
            attendance: 95.0,
            gpa: 3.8,
            tests: [
                ("Mathematics", "Mid-term Exam", 100.0, 95.0, (1, 10)),
                ("Physics", "Quiz 1", 50.0, 48.0, (1, 12)),
                ("Chemistry", "Lab Test", 75.0, 70.0, (1, 14)),
                ("Computer Science", "Programming Assignment", 100.0, 98.0, (1, 16)),
            ],
            fee_paid: 50000.0,
            fee_status: FeePaymentStatus::Paid,
            due: (2024, 3, 31),
            payments: &[(50000.0, (2024, 1, 1), "online", "RCP003", "Full payment")],
        },
        SeedStudent {
            id: "9b8e7c61-5d4f-4a3b-9c2d-1e0f6a7b8c94",
            name: "David Wilson",
            email: "david.wilson@student.edu",
            roll_number: "CS2023004",
            attendance: 55.0,
            gpa: 1.8,
            tests: [
                ("Mathematics", "Mid-term Exam", 100.0, 35.0, (1, 10)),
                ("Physics", "Quiz 1", 50.0, 22.0, (1, 12)),
                ("Chemistry", "Lab Test", 75.0, 30.0, (1, 14)),
                ("Computer Science", "Programming Assignment", 100.0, 48.0, (1, 16)),
            ],
            fee_paid: 10000.0,
            fee_status: FeePaymentStatus::Overdue,
            due: (2024, 1, 15),
            payments: &[(10000.0, (2023, 12, 15), "cash", "RCP004", "Partial payment")],
        },
    ]
}

fn ymd((year, month, day): (i32, u32, u32)) -> anyhow::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day).context("invalid date")
}

/// Loads a demo organization, one mentor and four students with mixed risk profiles.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let organization_id = create_organization_with_id(
        pool,
        Uuid::parse_str(DEMO_ORGANIZATION_ID)?,
        "EduBeacon Demo Academy",
    )
    .await?;
    let mentor_id = create_mentor_with_id(
        pool,
        Uuid::parse_str(DEMO_MENTOR_ID)?,
        organization_id,
        "Priya Raman",
        "priya.raman@edubeacon.org",
    )
    .await?;

    let mut student_ids = Vec::new();
    let mut tx = pool.begin().await?;

    for sample in seed_students() {
        let mut student = NewStudent::new(sample.name, sample.email, Some(sample.roll_number))?;
        student.gpa = Some(sample.gpa);
        student.attendance = AttendanceBaseline::from_percentage(sample.attendance);
        student.fees = FeeLedger {
            total_fee_amount: 50000.0,
            paid_amount: sample.fee_paid,
            pending_amount: 50000.0 - sample.fee_paid,
            payment_status: sample.fee_status,
            due_date: Some(ymd(sample.due)?),
            last_payment_date: sample
                .payments
                .last()
                .map(|payment| ymd(payment.1))
                .transpose()?,
        };

        let student_id =
            upsert_student(&mut tx, Uuid::parse_str(sample.id)?, organization_id, &student).await?;

        // Seeded history is replaced wholesale on every run.
        sqlx::query("DELETE FROM edubeacon.test_results WHERE student_id = $1")
            .bind(student_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM edubeacon.fee_payments WHERE student_id = $1")
            .bind(student_id)
            .execute(&mut *tx)
            .await?;

        for (subject, test_name, max_marks, obtained, (month, day)) in sample.tests {
            let result = TestResult::new(subject, test_name, max_marks, obtained, ymd((2024, month, day))?)?;
            insert_test_result(&mut tx, student_id, &result).await?;
        }

        for (amount, date, method, receipt, description) in sample.payments {
            let payment = FeePayment::new(
                *amount,
                ymd(*date)?,
                Some(*method),
                Some(*receipt),
                Some(*description),
            )?;
            insert_payment(&mut tx, student_id, &payment).await?;
        }

        student_ids.push(student_id);
    }
    tx.commit().await?;

    for student_id in student_ids {
        assign_mentor(pool, student_id, mentor_id).await?;
        let analysis = with_retry("recompute", move || recompute(pool, student_id)).await?;
        info!("seeded {student_id} at {} risk", analysis.overall_risk_level);
    }

    Ok(())
}

/// One line of a student import file.
#[derive(Debug, serde::Deserialize)]
struct ImportRow {
    full_name: String,
    email: String,
    roll_number: Option<String>,
    attendance_percentage: Option<f64>,
    gpa: Option<f64>,
    recent_tests: Option<String>,
    fee_status: String,
    fee_total: Option<f64>,
    fee_paid: Option<f64>,
    fee_due_date: Option<NaiveDate>,
}

/// Validates an import row. Errors carry the file line they came from.
fn parse_import_row(
    row: ImportRow,
    line: u64,
    imported_on: NaiveDate,
) -> Result<(NewStudent, Vec<TestResult>), ValidationError> {
    let at_line = |source: ValidationError| ValidationError::Import {
        line,
        source: Box::new(source),
    };

    let mut student = NewStudent::new(&row.full_name, &row.email, row.roll_number.as_deref())
        .map_err(at_line)?;
    student.gpa = row.gpa;
    if let Some(percentage) = row.attendance_percentage {
        student.attendance = AttendanceBaseline::from_percentage(percentage);
    }

    let total = row.fee_total.unwrap_or(0.0).max(0.0);
    let paid = row.fee_paid.unwrap_or(0.0).max(0.0);
    student.fees = FeeLedger {
        total_fee_amount: total,
        paid_amount: paid,
        pending_amount: (total - paid).max(0.0),
        payment_status: row.fee_status.parse().map_err(at_line)?,
        due_date: row.fee_due_date,
        last_payment_date: None,
    };

    let mut tests = Vec::new();
    for (position, raw) in row
        .recent_tests
        .as_deref()
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .enumerate()
    {
        let percentage: f64 = raw
            .parse()
            .map_err(|_| at_line(ValidationError::InvalidTestScore(raw.to_string())))?;
        let name = format!("Imported test {}", position + 1);
        tests.push(TestResult::new("General", &name, 100.0, percentage, imported_on).map_err(at_line)?);
    }

    Ok((student, tests))
}

/// Upserts every row of a CSV file into one organization. The file is imported
/// in a single transaction; the first bad row aborts it.
pub async fn import_csv(
    pool: &PgPool,
    organization_id: Uuid,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let imported_on = Utc::now().date_naive();
    let mut student_ids = Vec::new();
    let mut tx = pool.begin().await?;

    for (index, result) in reader.deserialize::<ImportRow>().enumerate() {
        let line = index as u64 + 2;
        let row = result.with_context(|| format!("line {line}: malformed row"))?;
        let (student, tests) = parse_import_row(row, line, imported_on)?;

        let student_id = upsert_student(&mut tx, Uuid::new_v4(), organization_id, &student).await?;
        sqlx::query(
            "DELETE FROM edubeacon.test_results WHERE student_id = $1 AND test_name LIKE 'Imported test %'",
        )
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
        for test in &tests {
            insert_test_result(&mut tx, student_id, test).await?;
        }

        student_ids.push(student_id);
    }
    tx.commit().await?;

    for student_id in &student_ids {
        let student_id = *student_id;
        with_retry("recompute", move || recompute(pool, student_id)).await?;
    }

    info!("imported {} students from {}", student_ids.len(), csv_path.display());
    Ok(student_ids.len())
}
