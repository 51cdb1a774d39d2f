// libs/appointment-cell/src/services/rules.rs
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{
    Appointment, AppointmentAction, DoctorProfile, RejectionReason, SchedulingPolicy,
};

/// Pure timing, quota and state rules. Nothing here touches storage or collaborators.
#[derive(Debug, Clone)]
pub struct RuleValidator {
    policy: SchedulingPolicy,
}

impl RuleValidator {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    /// Booking eligibility. Lead time is checked first so that a too-early slot is always
    /// reported as `LEAD_TIME_VIOLATION`, whatever else is wrong with the request.
    pub fn validate_booking(
        &self,
        slot_start: DateTime<Utc>,
        slot_end: DateTime<Utc>,
        requested_department: &str,
        patient_exists: bool,
        doctor: &DoctorProfile,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        self.validate_slot(slot_start, slot_end, now)?;

        if !patient_exists {
            return Err(RejectionReason::PatientNotFound);
        }

        self.validate_department(requested_department, doctor)
    }

    /// Lead time, slot ordering, clinic hours and (when configured) fixed duration.
    pub fn validate_slot(
        &self,
        slot_start: DateTime<Utc>,
        slot_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        if slot_start < now + self.policy.min_lead_time {
            debug!("Slot {} violates lead time at {}", slot_start, now);
            return Err(RejectionReason::LeadTimeViolation {
                min_hours: self.policy.min_lead_time.num_hours(),
            });
        }

        if slot_start >= slot_end {
            return Err(RejectionReason::InvalidSlot);
        }

        self.validate_clinic_hours(slot_start, slot_end)?;

        if let Some(duration) = self.policy.slot_duration {
            if slot_end - slot_start != duration {
                return Err(RejectionReason::SlotDurationInvalid {
                    minutes: duration.num_minutes(),
                });
            }
        }

        Ok(())
    }

    fn validate_clinic_hours(
        &self,
        slot_start: DateTime<Utc>,
        slot_end: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        let local_start = slot_start.with_timezone(&self.policy.clinic_offset);
        let local_end = slot_end.with_timezone(&self.policy.clinic_offset);

        let same_day = local_start.date_naive() == local_end.date_naive();
        let opens_in_time = local_start.time() >= self.policy.clinic_open;
        let closes_in_time = local_end.time() <= self.policy.clinic_close;

        if same_day && opens_in_time && closes_in_time {
            Ok(())
        } else {
            Err(RejectionReason::OutsideClinicHours {
                open: self.policy.clinic_open,
                close: self.policy.clinic_close,
            })
        }
    }

    pub fn validate_department(
        &self,
        requested_department: &str,
        doctor: &DoctorProfile,
    ) -> Result<(), RejectionReason> {
        if !doctor.exists {
            return Err(RejectionReason::DoctorNotFound);
        }

        if doctor.department != requested_department {
            return Err(RejectionReason::DepartmentMismatch {
                requested: requested_department.to_string(),
            });
        }

        Ok(())
    }

    /// Reschedule eligibility against the appointment's *current* slot.
    /// The new slot is validated separately with `validate_slot`.
    pub fn validate_reschedule(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        self.validate_transition(appointment, AppointmentAction::Reschedule)?;

        if appointment.reschedule_count >= self.policy.max_reschedules {
            return Err(RejectionReason::RescheduleLimitExceeded {
                max: self.policy.max_reschedules,
            });
        }

        // Exactly at the cutoff counts as inside the window.
        if appointment.slot_start - now <= self.policy.reschedule_cutoff {
            return Err(RejectionReason::RescheduleWindowClosed {
                cutoff_hours: self.policy.reschedule_cutoff.num_hours(),
            });
        }

        Ok(())
    }

    /// Every action requires a `SCHEDULED` appointment.
    pub fn validate_transition(
        &self,
        appointment: &Appointment,
        action: AppointmentAction,
    ) -> Result<(), RejectionReason> {
        if appointment.status.is_terminal() {
            return Err(RejectionReason::InvalidStateForAction {
                action,
                status: appointment.status,
            });
        }
        Ok(())
    }
}
