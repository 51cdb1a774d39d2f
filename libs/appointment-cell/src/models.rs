// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use std::fmt;
use tracing::warn;

use shared_config::AppConfig;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub department: String,
    /// Inclusive start of the half-open slot `[slot_start, slot_end)`.
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub reschedule_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Half-open interval overlap: `[a, b)` and `[c, d)` overlap iff `a < d && c < b`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        slots_overlap(self.slot_start, self.slot_end, start, end)
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == AppointmentStatus::Scheduled
    }

    /// Whether the appointment occupies one of the doctor's daily places.
    pub fn counts_toward_daily_cap(&self) -> bool {
        matches!(self.status, AppointmentStatus::Scheduled | AppointmentStatus::Completed)
    }
}

pub fn slots_overlap(
    start1: DateTime<Utc>,
    end1: DateTime<Utc>,
    start2: DateTime<Utc>,
    end2: DateTime<Utc>,
) -> bool {
    start1 < end2 && start2 < end1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppointmentStatus::Scheduled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentStatus::Scheduled => write!(f, "SCHEDULED"),
            AppointmentStatus::Completed => write!(f, "COMPLETED"),
            AppointmentStatus::Cancelled => write!(f, "CANCELLED"),
            AppointmentStatus::NoShow => write!(f, "NO_SHOW"),
        }
    }
}

/// Transitions out of `SCHEDULED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentAction {
    Reschedule,
    Cancel,
    Complete,
    NoShow,
}

impl AppointmentAction {
    pub fn target_status(&self) -> AppointmentStatus {
        match self {
            AppointmentAction::Reschedule => AppointmentStatus::Scheduled,
            AppointmentAction::Cancel => AppointmentStatus::Cancelled,
            AppointmentAction::Complete => AppointmentStatus::Completed,
            AppointmentAction::NoShow => AppointmentStatus::NoShow,
        }
    }
}

impl fmt::Display for AppointmentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentAction::Reschedule => write!(f, "reschedule"),
            AppointmentAction::Cancel => write!(f, "cancel"),
            AppointmentAction::Complete => write!(f, "complete"),
            AppointmentAction::NoShow => write!(f, "no-show"),
        }
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub department: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
}

/// The parts of a booking request an idempotency key is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFingerprint {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub department: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
}

impl From<&BookAppointmentRequest> for BookingFingerprint {
    fn from(request: &BookAppointmentRequest) -> Self {
        Self {
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            department: request.department.clone(),
            slot_start: request.slot_start,
            slot_end: request.slot_end,
        }
    }
}

impl From<&Appointment> for BookingFingerprint {
    fn from(appointment: &Appointment) -> Self {
        Self {
            patient_id: appointment.patient_id,
            doctor_id: appointment.doctor_id,
            department: appointment.department.clone(),
            slot_start: appointment.slot_start,
            slot_end: appointment.slot_end,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub new_slot_start: DateTime<Utc>,
    pub new_slot_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentFilter {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl AppointmentFilter {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 100;

    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.patient_id.map_or(true, |id| appointment.patient_id == id)
            && self.doctor_id.map_or(true, |id| appointment.doctor_id == id)
            && self.status.map_or(true, |status| appointment.status == status)
            && self.from_date.map_or(true, |from| appointment.slot_start >= from)
            && self.to_date.map_or(true, |to| appointment.slot_start < to)
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// One page of a filtered listing. `total` counts every match, not just this page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentPage {
    pub appointments: Vec<Appointment>,
    pub total: usize,
}

/// Fee/refund split handed to billing. Percentages only; amounts are billing's business.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundPolicy {
    pub fee_percent: u8,
    pub refund_percent: u8,
}

impl RefundPolicy {
    pub fn with_fee(fee_percent: u8) -> Self {
        let fee_percent = fee_percent.min(100);
        Self {
            fee_percent,
            refund_percent: 100 - fee_percent,
        }
    }
}

/// Result of a committed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentOutcome {
    pub appointment: Appointment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundPolicy>,
}

// ==============================================================================
// COLLABORATOR MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoctorProfile {
    pub exists: bool,
    pub department: String,
}

impl DoctorProfile {
    pub fn missing() -> Self {
        Self {
            exists: false,
            department: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillKind {
    Completion,
    Refund,
    Fee,
}

impl fmt::Display for BillKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillKind::Completion => write!(f, "COMPLETION"),
            BillKind::Refund => write!(f, "REFUND"),
            BillKind::Fee => write!(f, "FEE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    AppointmentConfirmed,
    AppointmentRescheduled,
    AppointmentCancelled,
    AppointmentCompleted,
    NoShow,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationEvent::AppointmentConfirmed => write!(f, "APPOINTMENT_CONFIRMED"),
            NotificationEvent::AppointmentRescheduled => write!(f, "APPOINTMENT_RESCHEDULED"),
            NotificationEvent::AppointmentCancelled => write!(f, "APPOINTMENT_CANCELLED"),
            NotificationEvent::AppointmentCompleted => write!(f, "APPOINTMENT_COMPLETED"),
            NotificationEvent::NoShow => write!(f, "NO_SHOW"),
        }
    }
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

/// Why a requested booking or transition was refused. `code()` is the stable machine-readable form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectionReason {
    #[error("Appointment must start at least {min_hours} hours from now")]
    LeadTimeViolation { min_hours: i64 },

    #[error("Slot start must be before slot end")]
    InvalidSlot,

    #[error("Appointments must be between {open} and {close} on a single day")]
    OutsideClinicHours { open: NaiveTime, close: NaiveTime },

    #[error("Appointment must be exactly {minutes} minutes")]
    SlotDurationInvalid { minutes: i64 },

    #[error("Doctor does not belong to department {requested}")]
    DepartmentMismatch { requested: String },

    #[error("Patient not found")]
    PatientNotFound,

    #[error("Doctor not found")]
    DoctorNotFound,

    #[error("Maximum {max} reschedules allowed")]
    RescheduleLimitExceeded { max: u32 },

    #[error("Cannot reschedule within {cutoff_hours} hour(s) of the appointment")]
    RescheduleWindowClosed { cutoff_hours: i64 },

    #[error("Cannot {action} an appointment that is {status}")]
    InvalidStateForAction { action: AppointmentAction, status: AppointmentStatus },

    #[error("Patient has a conflicting appointment")]
    PatientDoubleBooked { conflicting_appointment_id: Uuid },

    #[error("Doctor has a conflicting appointment at this time")]
    DoctorSlotTaken { conflicting_appointment_id: Uuid },

    #[error("Doctor has reached the maximum of {cap} appointments for the day")]
    DoctorDailyCapExceeded { cap: usize },

    #[error("Idempotency key was already used for a different booking")]
    IdempotencyKeyReused,
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::LeadTimeViolation { .. } => "LEAD_TIME_VIOLATION",
            RejectionReason::InvalidSlot => "INVALID_SLOT",
            RejectionReason::OutsideClinicHours { .. } => "OUTSIDE_CLINIC_HOURS",
            RejectionReason::SlotDurationInvalid { .. } => "SLOT_DURATION_INVALID",
            RejectionReason::DepartmentMismatch { .. } => "DEPARTMENT_MISMATCH",
            RejectionReason::PatientNotFound => "PATIENT_NOT_FOUND",
            RejectionReason::DoctorNotFound => "DOCTOR_NOT_FOUND",
            RejectionReason::RescheduleLimitExceeded { .. } => "RESCHEDULE_LIMIT_EXCEEDED",
            RejectionReason::RescheduleWindowClosed { .. } => "RESCHEDULE_WINDOW_CLOSED",
            RejectionReason::InvalidStateForAction { .. } => "INVALID_STATE_FOR_ACTION",
            RejectionReason::PatientDoubleBooked { .. } => "PATIENT_DOUBLE_BOOKED",
            RejectionReason::DoctorSlotTaken { .. } => "DOCTOR_SLOT_TAKEN",
            RejectionReason::DoctorDailyCapExceeded { .. } => "DOCTOR_DAILY_CAP_EXCEEDED",
            RejectionReason::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
        }
    }

    /// Conflicts with other appointments, as opposed to problems with the request itself.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RejectionReason::PatientDoubleBooked { .. }
                | RejectionReason::DoctorSlotTaken { .. }
                | RejectionReason::DoctorDailyCapExceeded { .. }
                | RejectionReason::IdempotencyKeyReused
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("{0}")]
    Rejected(RejectionReason),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AppointmentError {
    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            AppointmentError::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, AppointmentError::Unavailable(_) | AppointmentError::Storage(_))
    }
}

impl From<RejectionReason> for AppointmentError {
    fn from(reason: RejectionReason) -> Self {
        AppointmentError::Rejected(reason)
    }
}

// ==============================================================================
// POLICY
// ==============================================================================

const CLINIC_OPEN: NaiveTime = match NaiveTime::from_hms_opt(9, 0, 0) {
    Some(time) => time,
    None => panic!("invalid clinic opening time"),
};

const CLINIC_CLOSE: NaiveTime = match NaiveTime::from_hms_opt(18, 0, 0) {
    Some(time) => time,
    None => panic!("invalid clinic closing time"),
};

/// Business constants for the scheduling rules. Fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct SchedulingPolicy {
    pub min_lead_time: Duration,
    pub clinic_open: NaiveTime,
    pub clinic_close: NaiveTime,
    pub clinic_offset: FixedOffset,
    pub max_reschedules: u32,
    pub reschedule_cutoff: Duration,
    pub late_cancellation_window: Duration,
    pub late_cancellation_fee_percent: u8,
    pub no_show_fee_percent: u8,
    pub doctor_daily_cap: usize,
    pub slot_duration: Option<Duration>,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            min_lead_time: Duration::hours(2),
            clinic_open: CLINIC_OPEN,
            clinic_close: CLINIC_CLOSE,
            clinic_offset: Utc.fix(),
            max_reschedules: 2,
            reschedule_cutoff: Duration::hours(1),
            late_cancellation_window: Duration::hours(2),
            late_cancellation_fee_percent: 50,
            no_show_fee_percent: 100,
            doctor_daily_cap: 8,
            slot_duration: None,
        }
    }
}

impl SchedulingPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        let clinic_offset = config
            .clinic_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!(
                    "CLINIC_UTC_OFFSET_MINUTES={} is out of range, using UTC",
                    config.clinic_utc_offset_minutes
                );
                Utc.fix()
            });

        Self {
            clinic_offset,
            slot_duration: config
                .slot_duration_minutes
                .filter(|minutes| *minutes > 0)
                .map(Duration::minutes),
            ..Self::default()
        }
    }

    /// Calendar day of `instant` in the clinic's timezone.
    pub fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.clinic_offset).date_naive()
    }

    /// UTC bounds `[start, end)` of a clinic-local calendar day.
    pub fn day_bounds(&self, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let offset = Duration::seconds(i64::from(self.clinic_offset.local_minus_utc()));
        let start = day.and_time(NaiveTime::MIN).and_utc() - offset;
        (start, start + Duration::days(1))
    }
}
