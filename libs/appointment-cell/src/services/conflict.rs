use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentError, RejectionReason, SchedulingPolicy};
use crate::services::store::AppointmentStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResult {
    NoConflict,
    PatientDoubleBooked { conflicting_appointment_id: Uuid },
    DoctorSlotTaken { conflicting_appointment_id: Uuid },
    DoctorDailyCapExceeded { booked: usize, cap: usize },
}

impl ConflictResult {
    pub fn has_conflict(&self) -> bool {
        !matches!(self, ConflictResult::NoConflict)
    }

    pub fn into_result(self) -> Result<(), RejectionReason> {
        match self {
            ConflictResult::NoConflict => Ok(()),
            ConflictResult::PatientDoubleBooked { conflicting_appointment_id } => {
                Err(RejectionReason::PatientDoubleBooked { conflicting_appointment_id })
            }
            ConflictResult::DoctorSlotTaken { conflicting_appointment_id } => {
                Err(RejectionReason::DoctorSlotTaken { conflicting_appointment_id })
            }
            ConflictResult::DoctorDailyCapExceeded { cap, .. } => {
                Err(RejectionReason::DoctorDailyCapExceeded { cap })
            }
        }
    }
}

/// Read-only conflict queries against persisted appointments.
///
/// Results are only meaningful while the caller holds the patient and doctor-day
/// locks for the candidate slot; otherwise another commit can race the check.
pub struct ConflictChecker {
    store: Arc<dyn AppointmentStore>,
    policy: SchedulingPolicy,
}

impl ConflictChecker {
    pub fn new(store: Arc<dyn AppointmentStore>, policy: SchedulingPolicy) -> Self {
        Self { store, policy }
    }

    /// Check a candidate slot for patient overlap, doctor overlap and the doctor's daily cap,
    /// in that order. `exclude_appointment_id` lets a reschedule ignore its own current slot.
    pub async fn check_conflicts(
        &self,
        patient_id: Uuid,
        doctor_id: Uuid,
        slot_start: DateTime<Utc>,
        slot_end: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<ConflictResult, AppointmentError> {
        debug!(
            "Checking conflicts for patient {} with doctor {} from {} to {}",
            patient_id, doctor_id, slot_start, slot_end
        );

        let not_excluded = |appointment: &Appointment| Some(appointment.id) != exclude_appointment_id;

        let patient_overlap = self
            .store
            .patient_appointments_overlapping(patient_id, slot_start, slot_end)
            .await?
            .into_iter()
            .filter(not_excluded)
            .find(Appointment::is_scheduled);

        if let Some(existing) = patient_overlap {
            warn!("Patient {} already booked in appointment {}", patient_id, existing.id);
            return Ok(ConflictResult::PatientDoubleBooked {
                conflicting_appointment_id: existing.id,
            });
        }

        let doctor_overlap = self
            .store
            .doctor_appointments_overlapping(doctor_id, slot_start, slot_end)
            .await?
            .into_iter()
            .filter(not_excluded)
            .find(Appointment::is_scheduled);

        if let Some(existing) = doctor_overlap {
            warn!("Doctor {} already booked in appointment {}", doctor_id, existing.id);
            return Ok(ConflictResult::DoctorSlotTaken {
                conflicting_appointment_id: existing.id,
            });
        }

        let booked = self.count_doctor_day(doctor_id, slot_start, exclude_appointment_id).await?;
        if booked >= self.policy.doctor_daily_cap {
            warn!(
                "Doctor {} has {} appointments on {}, cap is {}",
                doctor_id,
                booked,
                self.policy.local_day(slot_start),
                self.policy.doctor_daily_cap
            );
            return Ok(ConflictResult::DoctorDailyCapExceeded {
                booked,
                cap: self.policy.doctor_daily_cap,
            });
        }

        Ok(ConflictResult::NoConflict)
    }

    /// Appointments in `SCHEDULED` or `COMPLETED` that start on the same clinic-local day.
    pub async fn count_doctor_day(
        &self,
        doctor_id: Uuid,
        slot_start: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<usize, AppointmentError> {
        let (day_start, day_end) = self.policy.day_bounds(self.policy.local_day(slot_start));

        let count = self
            .store
            .doctor_appointments_starting_between(doctor_id, day_start, day_end)
            .await?
            .iter()
            .filter(|appointment| Some(appointment.id) != exclude_appointment_id)
            .filter(|appointment| appointment.counts_toward_daily_cap())
            .count();

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentStatus;
    use crate::services::store::InMemoryAppointmentStore;
    use chrono::{Duration, FixedOffset, TimeZone};

    struct Fixture {
        store: Arc<InMemoryAppointmentStore>,
        checker: ConflictChecker,
    }

    fn fixture_with(policy: SchedulingPolicy) -> Fixture {
        let store = Arc::new(InMemoryAppointmentStore::new());
        let checker = ConflictChecker::new(store.clone(), policy);
        Fixture { store, checker }
    }

    fn fixture() -> Fixture {
        fixture_with(SchedulingPolicy::default())
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, hour, minute, 0).unwrap()
    }

    async fn seed(
        store: &InMemoryAppointmentStore,
        patient_id: Uuid,
        doctor_id: Uuid,
        start: DateTime<Utc>,
        status: AppointmentStatus,
    ) -> Uuid {
        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id,
            doctor_id,
            department: "Cardio".to_string(),
            slot_start: start,
            slot_end: start + Duration::minutes(30),
            status,
            reschedule_count: 0,
            idempotency_key: None,
            created_at: start - Duration::days(1),
            updated_at: start - Duration::days(1),
        };
        let id = appointment.id;
        store.insert(appointment).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_patient_double_booking_detected() {
        let f = fixture();
        let patient = Uuid::new_v4();
        let existing = seed(&f.store, patient, Uuid::new_v4(), at(10, 0), AppointmentStatus::Scheduled).await;

        let result = f.checker.check_conflicts(patient, Uuid::new_v4(), at(10, 15), at(10, 45), None).await.unwrap();
        assert_eq!(result, ConflictResult::PatientDoubleBooked { conflicting_appointment_id: existing });
    }

    #[tokio::test]
    async fn test_adjacent_slot_is_not_a_conflict() {
        let f = fixture();
        let patient = Uuid::new_v4();
        let doctor = Uuid::new_v4();
        seed(&f.store, patient, doctor, at(10, 0), AppointmentStatus::Scheduled).await;

        let result = f.checker.check_conflicts(patient, doctor, at(10, 30), at(11, 0), None).await.unwrap();
        assert!(!result.has_conflict());
    }

    #[tokio::test]
    async fn test_terminal_patient_appointments_do_not_block() {
        let f = fixture();
        let patient = Uuid::new_v4();
        for status in [AppointmentStatus::Cancelled, AppointmentStatus::NoShow, AppointmentStatus::Completed] {
            seed(&f.store, patient, Uuid::new_v4(), at(10, 0), status).await;
        }

        let result = f.checker.check_conflicts(patient, Uuid::new_v4(), at(10, 0), at(10, 30), None).await.unwrap();
        assert_eq!(result, ConflictResult::NoConflict);
    }

    #[tokio::test]
    async fn test_excluded_appointment_is_ignored() {
        let f = fixture();
        let patient = Uuid::new_v4();
        let doctor = Uuid::new_v4();
        let existing = seed(&f.store, patient, doctor, at(10, 0), AppointmentStatus::Scheduled).await;

        let result = f.checker.check_conflicts(patient, doctor, at(10, 15), at(10, 45), Some(existing)).await.unwrap();
        assert_eq!(result, ConflictResult::NoConflict);
    }

    #[tokio::test]
    async fn test_doctor_overlap_detected() {
        let f = fixture();
        let doctor = Uuid::new_v4();
        let existing = seed(&f.store, Uuid::new_v4(), doctor, at(14, 0), AppointmentStatus::Scheduled).await;

        let result = f.checker.check_conflicts(Uuid::new_v4(), doctor, at(14, 0), at(14, 30), None).await.unwrap();
        assert_eq!(result, ConflictResult::DoctorSlotTaken { conflicting_appointment_id: existing });
        assert_eq!(result.into_result().unwrap_err().code(), "DOCTOR_SLOT_TAKEN");
    }

    #[tokio::test]
    async fn test_daily_cap_counts_scheduled_and_completed() {
        let f = fixture();
        let doctor = Uuid::new_v4();
        for hour in 9..13 {
            seed(&f.store, Uuid::new_v4(), doctor, at(hour, 0), AppointmentStatus::Scheduled).await;
        }
        for hour in 13..17 {
            seed(&f.store, Uuid::new_v4(), doctor, at(hour, 0), AppointmentStatus::Completed).await;
        }
        seed(&f.store, Uuid::new_v4(), doctor, at(17, 0), AppointmentStatus::Cancelled).await;

        let result = f.checker.check_conflicts(Uuid::new_v4(), doctor, at(17, 30), at(18, 0), None).await.unwrap();
        assert_eq!(result, ConflictResult::DoctorDailyCapExceeded { booked: 8, cap: 8 });
    }

    #[tokio::test]
    async fn test_daily_cap_below_limit_passes() {
        let f = fixture();
        let doctor = Uuid::new_v4();
        for hour in 9..16 {
            seed(&f.store, Uuid::new_v4(), doctor, at(hour, 0), AppointmentStatus::Scheduled).await;
        }
        seed(&f.store, Uuid::new_v4(), doctor, at(16, 0), AppointmentStatus::NoShow).await;

        let result = f.checker.check_conflicts(Uuid::new_v4(), doctor, at(17, 0), at(17, 30), None).await.unwrap();
        assert_eq!(result, ConflictResult::NoConflict);
        assert_eq!(f.checker.count_doctor_day(doctor, at(17, 0), None).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_daily_cap_uses_clinic_local_day() {
        // UTC+05:00: 20:00 UTC on the 10th is 01:00 local on the 11th
        let f = fixture_with(SchedulingPolicy {
            clinic_offset: FixedOffset::east_opt(5 * 3600).unwrap(),
            ..SchedulingPolicy::default()
        });
        let doctor = Uuid::new_v4();
        let late_utc = Utc.with_ymd_and_hms(2026, 3, 10, 20, 0, 0).unwrap();
        seed(&f.store, Uuid::new_v4(), doctor, late_utc, AppointmentStatus::Scheduled).await;

        assert_eq!(f.checker.count_doctor_day(doctor, at(5, 0), None).await.unwrap(), 1);
        let previous_local_day = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        assert_eq!(f.checker.count_doctor_day(doctor, previous_local_day, None).await.unwrap(), 0);
    }
}
