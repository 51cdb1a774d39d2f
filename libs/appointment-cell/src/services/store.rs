// libs/appointment-cell/src/services/store.rs
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentError, AppointmentFilter, AppointmentPage, BookAppointmentRequest,
    BookingFingerprint, RejectionReason,
};

/// An appointment created under an idempotency key, with the request it was created from.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentBooking {
    pub appointment: Appointment,
    pub fingerprint: BookingFingerprint,
}

impl IdempotentBooking {
    /// The original appointment, provided `request` is the one the key was first used for.
    pub fn replay(self, request: &BookAppointmentRequest) -> Result<Appointment, RejectionReason> {
        if self.fingerprint != BookingFingerprint::from(request) {
            return Err(RejectionReason::IdempotencyKeyReused);
        }
        Ok(self.appointment)
    }
}

/// Persistence for appointment records.
///
/// Implementations must index by patient and by doctor so that the two conflict
/// queries do not scan every appointment. Callers serialize conflicting writers
/// with `KeyedLocks`; the store itself only needs to make single writes atomic.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, AppointmentError>;

    async fn insert(&self, appointment: Appointment) -> Result<(), AppointmentError>;

    async fn update(&self, appointment: Appointment) -> Result<(), AppointmentError>;

    /// The booking made under `key`. Its fingerprint is the slot as first booked, even if moved since.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IdempotentBooking>, AppointmentError>;

    /// Patient's appointments whose slot overlaps `[start, end)`, any status.
    async fn patient_appointments_overlapping(
        &self,
        patient_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, AppointmentError>;

    /// Doctor's appointments whose slot overlaps `[start, end)`, any status.
    async fn doctor_appointments_overlapping(
        &self,
        doctor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, AppointmentError>;

    /// Doctor's appointments whose `slot_start` falls in `[from, to)`, any status.
    async fn doctor_appointments_starting_between(
        &self,
        doctor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, AppointmentError>;

    /// Filtered page, newest slot first.
    async fn list(&self, filter: &AppointmentFilter) -> Result<AppointmentPage, AppointmentError>;
}

type SlotIndex = HashMap<Uuid, BTreeSet<(DateTime<Utc>, Uuid)>>;

#[derive(Default)]
struct StoreInner {
    appointments: HashMap<Uuid, Appointment>,
    by_patient: SlotIndex,
    by_doctor: SlotIndex,
    by_idempotency_key: HashMap<String, (Uuid, BookingFingerprint)>,
}

impl StoreInner {
    fn index(&mut self, appointment: &Appointment) {
        let entry = (appointment.slot_start, appointment.id);
        self.by_patient.entry(appointment.patient_id).or_default().insert(entry);
        self.by_doctor.entry(appointment.doctor_id).or_default().insert(entry);
    }

    fn unindex(&mut self, appointment: &Appointment) {
        let entry = (appointment.slot_start, appointment.id);
        if let Some(slots) = self.by_patient.get_mut(&appointment.patient_id) {
            slots.remove(&entry);
        }
        if let Some(slots) = self.by_doctor.get_mut(&appointment.doctor_id) {
            slots.remove(&entry);
        }
    }

    fn overlapping(&self, index: &SlotIndex, owner: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Appointment> {
        let Some(slots) = index.get(&owner) else {
            return Vec::new();
        };

        // Only slots starting before `end` can overlap; of those keep the ones ending after `start`.
        slots
            .range(..(end, Uuid::nil()))
            .filter_map(|(_, id)| self.appointments.get(id))
            .filter(|appointment| appointment.overlaps(start, end))
            .cloned()
            .collect()
    }
}

/// In-process store with per-patient and per-doctor slot indexes.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.appointments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, AppointmentError> {
        Ok(self.inner.read().await.appointments.get(&id).cloned())
    }

    async fn insert(&self, appointment: Appointment) -> Result<(), AppointmentError> {
        let mut inner = self.inner.write().await;

        if inner.appointments.contains_key(&appointment.id) {
            return Err(AppointmentError::Storage(format!(
                "Appointment {} already exists",
                appointment.id
            )));
        }

        if let Some(key) = &appointment.idempotency_key {
            inner
                .by_idempotency_key
                .insert(key.clone(), (appointment.id, BookingFingerprint::from(&appointment)));
        }
        inner.index(&appointment);
        debug!("Stored appointment {}", appointment.id);
        inner.appointments.insert(appointment.id, appointment);
        Ok(())
    }

    async fn update(&self, appointment: Appointment) -> Result<(), AppointmentError> {
        let mut inner = self.inner.write().await;

        let previous = inner
            .appointments
            .get(&appointment.id)
            .cloned()
            .ok_or(AppointmentError::NotFound)?;

        inner.unindex(&previous);
        inner.index(&appointment);
        inner.appointments.insert(appointment.id, appointment);
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IdempotentBooking>, AppointmentError> {
        let inner = self.inner.read().await;
        Ok(inner.by_idempotency_key.get(key).and_then(|(id, fingerprint)| {
            inner.appointments.get(id).map(|appointment| IdempotentBooking {
                appointment: appointment.clone(),
                fingerprint: fingerprint.clone(),
            })
        }))
    }

    async fn patient_appointments_overlapping(
        &self,
        patient_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let inner = self.inner.read().await;
        Ok(inner.overlapping(&inner.by_patient, patient_id, start, end))
    }

    async fn doctor_appointments_overlapping(
        &self,
        doctor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let inner = self.inner.read().await;
        Ok(inner.overlapping(&inner.by_doctor, doctor_id, start, end))
    }

    async fn doctor_appointments_starting_between(
        &self,
        doctor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let inner = self.inner.read().await;
        let Some(slots) = inner.by_doctor.get(&doctor_id) else {
            return Ok(Vec::new());
        };

        Ok(slots
            .range((from, Uuid::nil())..(to, Uuid::nil()))
            .filter_map(|(_, id)| inner.appointments.get(id))
            .cloned()
            .collect())
    }

    async fn list(&self, filter: &AppointmentFilter) -> Result<AppointmentPage, AppointmentError> {
        let inner = self.inner.read().await;

        let mut matching: Vec<Appointment> = inner
            .appointments
            .values()
            .filter(|appointment| filter.matches(appointment))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.slot_start.cmp(&a.slot_start).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len();
        let appointments = matching
            .into_iter()
            .skip(filter.effective_offset())
            .take(filter.effective_limit())
            .collect();

        Ok(AppointmentPage { appointments, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentStatus;
    use chrono::{Duration, TimeZone};

    fn appointment(patient_id: Uuid, doctor_id: Uuid, start: DateTime<Utc>) -> Appointment {
        Appointment {
            id: Uuid::new_v4(),
            patient_id,
            doctor_id,
            department: "Cardio".to_string(),
            slot_start: start,
            slot_end: start + Duration::minutes(30),
            status: AppointmentStatus::Scheduled,
            reschedule_count: 0,
            idempotency_key: None,
            created_at: start,
            updated_at: start,
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_overlap_query_is_half_open() {
        let store = InMemoryAppointmentStore::new();
        let patient = Uuid::new_v4();
        store.insert(appointment(patient, Uuid::new_v4(), at(10, 0))).await.unwrap();

        // touching at either edge does not overlap
        assert!(store.patient_appointments_overlapping(patient, at(10, 30), at(11, 0)).await.unwrap().is_empty());
        assert!(store.patient_appointments_overlapping(patient, at(9, 30), at(10, 0)).await.unwrap().is_empty());

        assert_eq!(store.patient_appointments_overlapping(patient, at(10, 15), at(10, 45)).await.unwrap().len(), 1);
        assert_eq!(store.patient_appointments_overlapping(patient, at(9, 0), at(12, 0)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_moves_index_entry() {
        let store = InMemoryAppointmentStore::new();
        let doctor = Uuid::new_v4();
        let mut moved = appointment(Uuid::new_v4(), doctor, at(10, 0));
        store.insert(moved.clone()).await.unwrap();

        moved.slot_start = at(14, 0);
        moved.slot_end = at(14, 30);
        store.update(moved.clone()).await.unwrap();

        assert!(store.doctor_appointments_overlapping(doctor, at(10, 0), at(10, 30)).await.unwrap().is_empty());
        let found = store.doctor_appointments_overlapping(doctor, at(14, 0), at(14, 30)).await.unwrap();
        assert_eq!(found, vec![moved]);
    }

    #[tokio::test]
    async fn test_doctor_day_range() {
        let store = InMemoryAppointmentStore::new();
        let doctor = Uuid::new_v4();
        for hour in [9, 11, 17] {
            store.insert(appointment(Uuid::new_v4(), doctor, at(hour, 0))).await.unwrap();
        }
        store.insert(appointment(Uuid::new_v4(), Uuid::new_v4(), at(12, 0))).await.unwrap();

        let day = store.doctor_appointments_starting_between(doctor, at(0, 0), at(12, 0)).await.unwrap();
        assert_eq!(day.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryAppointmentStore::new();
        let record = appointment(Uuid::new_v4(), Uuid::new_v4(), at(10, 0));
        store.insert(record.clone()).await.unwrap();

        assert!(matches!(store.insert(record).await, Err(AppointmentError::Storage(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = InMemoryAppointmentStore::new();
        let record = appointment(Uuid::new_v4(), Uuid::new_v4(), at(10, 0));
        assert!(matches!(store.update(record).await, Err(AppointmentError::NotFound)));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = InMemoryAppointmentStore::new();
        let patient = Uuid::new_v4();
        for hour in [9, 13, 11] {
            store.insert(appointment(patient, Uuid::new_v4(), at(hour, 0))).await.unwrap();
        }
        let mut cancelled = appointment(patient, Uuid::new_v4(), at(15, 0));
        cancelled.status = AppointmentStatus::Cancelled;
        store.insert(cancelled).await.unwrap();
        store.insert(appointment(Uuid::new_v4(), Uuid::new_v4(), at(10, 0))).await.unwrap();

        let filter = AppointmentFilter {
            patient_id: Some(patient),
            status: Some(AppointmentStatus::Scheduled),
            ..AppointmentFilter::default()
        };
        let listed = store.list(&filter).await.unwrap();
        let hours: Vec<DateTime<Utc>> = listed.appointments.iter().map(|a| a.slot_start).collect();
        assert_eq!(hours, vec![at(13, 0), at(11, 0), at(9, 0)]);
        assert_eq!(listed.total, 3);

        let page = AppointmentFilter {
            offset: Some(1),
            limit: Some(1),
            ..filter
        };
        let page = store.list(&page).await.unwrap();
        assert_eq!(page.appointments.len(), 1);
        assert_eq!(page.appointments[0].slot_start, at(11, 0));
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_idempotency_key_lookup() {
        let store = InMemoryAppointmentStore::new();
        let mut record = appointment(Uuid::new_v4(), Uuid::new_v4(), at(10, 0));
        record.idempotency_key = Some("key-1".to_string());
        store.insert(record.clone()).await.unwrap();

        let found = store.find_by_idempotency_key("key-1").await.unwrap().unwrap();
        assert_eq!(found.appointment, record);
        assert!(store.find_by_idempotency_key("key-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_fingerprint_survives_reschedule() {
        let store = InMemoryAppointmentStore::new();
        let mut record = appointment(Uuid::new_v4(), Uuid::new_v4(), at(10, 0));
        record.idempotency_key = Some("key-1".to_string());
        store.insert(record.clone()).await.unwrap();

        let original = BookAppointmentRequest {
            patient_id: record.patient_id,
            doctor_id: record.doctor_id,
            department: record.department.clone(),
            slot_start: record.slot_start,
            slot_end: record.slot_end,
        };

        let mut moved = record.clone();
        moved.slot_start = at(14, 0);
        moved.slot_end = at(14, 30);
        store.update(moved).await.unwrap();

        let found = store.find_by_idempotency_key("key-1").await.unwrap().unwrap();
        assert_eq!(found.clone().replay(&original).unwrap().slot_start, at(14, 0));

        let other_patient = BookAppointmentRequest {
            patient_id: Uuid::new_v4(),
            ..original
        };
        assert_eq!(found.replay(&other_patient), Err(RejectionReason::IdempotencyKeyReused));
    }
}
