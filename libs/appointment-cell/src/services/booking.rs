// libs/appointment-cell/src/services/booking.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{
    Appointment, AppointmentError, AppointmentFilter, AppointmentOutcome, AppointmentPage,
    BookAppointmentRequest, RescheduleAppointmentRequest, SchedulingPolicy,
};
use crate::services::clock::{Clock, SystemClock};
use crate::services::collaborators::{
    BillingGateway, CollaboratorError, DoctorDirectory, HttpBillingGateway, HttpDoctorDirectory,
    HttpNotificationGateway, HttpPatientDirectory, NotificationGateway, PatientDirectory,
};
use crate::services::lifecycle::{AppointmentLifecycle, Committed};
use crate::services::outbox::{DispatcherConfig, InMemoryOutbox, Outbox, RedisOutbox, SideEffectDispatcher};
use crate::services::store::{AppointmentStore, InMemoryAppointmentStore};

/// The four external services the engine talks to.
pub struct Collaborators {
    pub patients: Arc<dyn PatientDirectory>,
    pub doctors: Arc<dyn DoctorDirectory>,
    pub billing: Arc<dyn BillingGateway>,
    pub notifications: Arc<dyn NotificationGateway>,
    /// Upper bound on any single collaborator call.
    pub timeout: Duration,
}

impl Collaborators {
    pub fn http(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            patients: Arc::new(HttpPatientDirectory::new(config)?),
            doctors: Arc::new(HttpDoctorDirectory::new(config)?),
            billing: Arc::new(HttpBillingGateway::new(config)?),
            notifications: Arc::new(HttpNotificationGateway::new(config)?),
            timeout: Duration::from_millis(config.collaborator_timeout_ms),
        })
    }
}

/// Entry point for every appointment operation.
///
/// Lookups against the Patient and Doctor services happen before any local state
/// is touched, so a collaborator outage aborts the request cleanly. Billing and
/// notification run after the commit through the outbox and never undo it.
pub struct AppointmentService {
    lifecycle: AppointmentLifecycle,
    store: Arc<dyn AppointmentStore>,
    outbox: Arc<dyn Outbox>,
    patients: Arc<dyn PatientDirectory>,
    doctors: Arc<dyn DoctorDirectory>,
    dispatcher: Arc<SideEffectDispatcher>,
    collaborator_timeout: Duration,
}

impl AppointmentService {
    pub fn new(
        policy: SchedulingPolicy,
        store: Arc<dyn AppointmentStore>,
        outbox: Arc<dyn Outbox>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatch = DispatcherConfig {
            call_timeout: collaborators.timeout,
            ..DispatcherConfig::default()
        };
        Self::with_dispatcher_config(policy, store, outbox, collaborators, clock, dispatch)
    }

    pub fn with_dispatcher_config(
        policy: SchedulingPolicy,
        store: Arc<dyn AppointmentStore>,
        outbox: Arc<dyn Outbox>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        dispatch: DispatcherConfig,
    ) -> Self {
        let dispatcher = Arc::new(SideEffectDispatcher::new(
            Arc::clone(&outbox),
            collaborators.billing,
            collaborators.notifications,
            Arc::clone(&clock),
            dispatch,
        ));

        Self {
            lifecycle: AppointmentLifecycle::new(policy, Arc::clone(&store), clock),
            store,
            outbox,
            patients: collaborators.patients,
            doctors: collaborators.doctors,
            dispatcher,
            collaborator_timeout: collaborators.timeout,
        }
    }

    /// Production wiring: HTTP collaborators, in-memory appointment store, and a Redis
    /// outbox when `REDIS_URL` is configured.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let outbox: Arc<dyn Outbox> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisOutbox::new(url)
                    .await
                    .context("Failed to connect side-effect outbox to Redis")?,
            ),
            None => Arc::new(InMemoryOutbox::new()),
        };

        let collaborators = Collaborators::http(config)?;
        let dispatch = DispatcherConfig {
            max_attempts: config.outbox_max_attempts,
            call_timeout: collaborators.timeout,
            ..DispatcherConfig::default()
        };

        Ok(Self::with_dispatcher_config(
            SchedulingPolicy::from_config(config),
            Arc::new(InMemoryAppointmentStore::new()),
            outbox,
            collaborators,
            Arc::new(SystemClock),
            dispatch,
        ))
    }

    pub fn dispatcher(&self) -> Arc<SideEffectDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    async fn call<T, F>(&self, service: &'static str, call: F) -> Result<T, AppointmentError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        match tokio::time::timeout(self.collaborator_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} lookup failed: {}", service, e);
                Err(AppointmentError::Unavailable(e.to_string()))
            }
            Err(_) => {
                warn!("{} lookup timed out after {:?}", service, self.collaborator_timeout);
                Err(AppointmentError::Unavailable(format!("{} service timed out", service)))
            }
        }
    }

    #[instrument(skip(self, request), fields(patient_id = %request.patient_id, doctor_id = %request.doctor_id))]
    pub async fn book(
        &self,
        request: BookAppointmentRequest,
        idempotency_key: Option<String>,
    ) -> Result<AppointmentOutcome, AppointmentError> {
        // Replays skip the collaborators; the lifecycle re-checks under the lock.
        if let Some(key) = &idempotency_key {
            if let Some(earlier) = self.store.find_by_idempotency_key(key).await? {
                let existing = earlier
                    .replay(&request)
                    .map_err(AppointmentError::from)
                    .inspect_err(|e| log_rejection("book", e))?;
                info!("Returning appointment {} for repeated idempotency key", existing.id);
                return Ok(AppointmentOutcome {
                    appointment: existing,
                    refund: None,
                });
            }
        }

        let (patient_exists, doctor) = tokio::try_join!(
            self.call("patient", self.patients.exists(request.patient_id)),
            self.call("doctor", self.doctors.get_doctor(request.doctor_id)),
        )?;

        let committed = self
            .lifecycle
            .book(&request, patient_exists, &doctor, idempotency_key)
            .await
            .inspect_err(|e| log_rejection("book", e))?;

        if !committed.replayed {
            info!(
                appointment_id = %committed.appointment.id,
                slot_start = %committed.appointment.slot_start,
                "appointment_created"
            );
        }
        Ok(self.finish(committed).await)
    }

    #[instrument(skip(self, request))]
    pub async fn reschedule(
        &self,
        appointment_id: Uuid,
        request: RescheduleAppointmentRequest,
    ) -> Result<AppointmentOutcome, AppointmentError> {
        let current = self.get(appointment_id).await?;
        let doctor = self.call("doctor", self.doctors.get_doctor(current.doctor_id)).await?;

        let committed = self
            .lifecycle
            .reschedule(appointment_id, &request, &doctor)
            .await
            .inspect_err(|e| log_rejection("reschedule", e))?;

        info!(
            appointment_id = %appointment_id,
            reschedule_count = committed.appointment.reschedule_count,
            "appointment_rescheduled"
        );
        Ok(self.finish(committed).await)
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, appointment_id: Uuid) -> Result<AppointmentOutcome, AppointmentError> {
        let committed = self
            .lifecycle
            .cancel(appointment_id)
            .await
            .inspect_err(|e| log_rejection("cancel", e))?;

        if let Some(refund) = committed.refund {
            info!(
                appointment_id = %appointment_id,
                fee_percent = refund.fee_percent,
                refund_percent = refund.refund_percent,
                "appointment_cancelled"
            );
        }
        Ok(self.finish(committed).await)
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, appointment_id: Uuid) -> Result<AppointmentOutcome, AppointmentError> {
        let committed = self
            .lifecycle
            .complete(appointment_id)
            .await
            .inspect_err(|e| log_rejection("complete", e))?;

        info!(appointment_id = %appointment_id, "appointment_completed");
        Ok(self.finish(committed).await)
    }

    #[instrument(skip(self))]
    pub async fn mark_no_show(&self, appointment_id: Uuid) -> Result<AppointmentOutcome, AppointmentError> {
        let committed = self
            .lifecycle
            .mark_no_show(appointment_id)
            .await
            .inspect_err(|e| log_rejection("no-show", e))?;

        info!(appointment_id = %appointment_id, "appointment_no_show");
        Ok(self.finish(committed).await)
    }

    pub async fn get(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store.get(appointment_id).await?.ok_or(AppointmentError::NotFound)
    }

    pub async fn list(&self, filter: &AppointmentFilter) -> Result<AppointmentPage, AppointmentError> {
        self.store.list(filter).await
    }

    /// Record side effects while the commit's locks are held, release them, then make the
    /// first delivery attempt. Anything that fails stays in the outbox for the dispatcher;
    /// effects the outbox refused are held by the dispatcher itself.
    async fn finish(&self, committed: Committed) -> AppointmentOutcome {
        let mut queued = Vec::with_capacity(committed.side_effects.len());
        let mut unrecorded = Vec::new();
        for entry in &committed.side_effects {
            match self.outbox.enqueue(entry.clone()).await {
                Ok(true) => queued.push(entry.clone()),
                Ok(false) => {}
                Err(e) => {
                    error!(
                        "Failed to record side effect {} for appointment {}: {}",
                        entry.dedup_key, entry.appointment_id, e
                    );
                    unrecorded.push(entry.clone());
                }
            }
        }

        let outcome = committed.release();

        for entry in queued {
            self.dispatcher.deliver(entry).await;
        }
        for entry in unrecorded {
            self.dispatcher.deliver_unrecorded(entry).await;
        }

        outcome
    }
}

fn log_rejection(operation: &str, error: &AppointmentError) {
    match error {
        AppointmentError::Rejected(reason) => {
            warn!("{} rejected with {}: {}", operation, reason.code(), reason)
        }
        AppointmentError::NotFound => warn!("{} of unknown appointment", operation),
        other => error!("{} failed: {}", operation, other),
    }
}
