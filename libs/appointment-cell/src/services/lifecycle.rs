// libs/appointment-cell/src/services/lifecycle.rs
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentAction, AppointmentError, AppointmentOutcome, AppointmentStatus, BillKind,
    BookAppointmentRequest, DoctorProfile, NotificationEvent, RefundPolicy,
    RescheduleAppointmentRequest, SchedulingPolicy,
};
use crate::services::clock::Clock;
use crate::services::conflict::ConflictChecker;
use crate::services::locks::{KeyedLocks, LockSet};
use crate::services::outbox::{OutboxEntry, SideEffect};
use crate::services::refund::RefundCalculator;
use crate::services::rules::RuleValidator;
use crate::services::store::AppointmentStore;

/// A persisted transition whose locks are still held.
///
/// The caller enqueues `side_effects` before dropping the value, so no other
/// writer can observe the new state without its follow-up work being recorded.
#[derive(Debug)]
pub struct Committed {
    pub appointment: Appointment,
    pub refund: Option<RefundPolicy>,
    pub side_effects: Vec<OutboxEntry>,
    /// Set when an idempotency key matched an earlier booking and nothing was written.
    pub replayed: bool,
    locks: LockSet,
}

impl Committed {
    pub fn lock_keys(&self) -> &[String] {
        self.locks.keys()
    }

    /// Drop the locks and keep only what the caller reports back.
    pub fn release(self) -> AppointmentOutcome {
        drop(self.locks);
        AppointmentOutcome {
            appointment: self.appointment,
            refund: self.refund,
        }
    }
}

/// The transitions that end an appointment.
#[derive(Debug, Clone, Copy)]
enum Closing {
    Cancel,
    Complete,
    NoShow,
}

impl Closing {
    fn action(self) -> AppointmentAction {
        match self {
            Closing::Cancel => AppointmentAction::Cancel,
            Closing::Complete => AppointmentAction::Complete,
            Closing::NoShow => AppointmentAction::NoShow,
        }
    }
}

/// SCHEDULED is the only state with outgoing transitions:
///
/// ```text
/// SCHEDULED --reschedule--> SCHEDULED (reschedule_count + 1)
/// SCHEDULED --cancel------> CANCELLED
/// SCHEDULED --complete----> COMPLETED
/// SCHEDULED --noshow------> NO_SHOW
/// ```
///
/// Every transition runs check-then-write under the keyed locks covering the
/// records it reads, so two requests can never both pass a conflict check
/// that only one of them may win.
pub struct AppointmentLifecycle {
    store: Arc<dyn AppointmentStore>,
    rules: RuleValidator,
    conflicts: ConflictChecker,
    refunds: RefundCalculator,
    locks: KeyedLocks,
    clock: Arc<dyn Clock>,
}

impl AppointmentLifecycle {
    pub fn new(policy: SchedulingPolicy, store: Arc<dyn AppointmentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conflicts: ConflictChecker::new(Arc::clone(&store), policy.clone()),
            refunds: RefundCalculator::new(&policy),
            rules: RuleValidator::new(policy),
            locks: KeyedLocks::new(),
            store,
            clock,
        }
    }

    pub fn rules(&self) -> &RuleValidator {
        &self.rules
    }

    fn policy(&self) -> &SchedulingPolicy {
        self.rules.policy()
    }

    fn idempotency_lock_key(key: &str) -> String {
        format!("idempotency:{}", key)
    }

    pub async fn book(
        &self,
        request: &BookAppointmentRequest,
        patient_exists: bool,
        doctor: &DoctorProfile,
        idempotency_key: Option<String>,
    ) -> Result<Committed, AppointmentError> {
        let mut keys = vec![
            KeyedLocks::patient_key(request.patient_id),
            KeyedLocks::doctor_day_key(request.doctor_id, self.policy().local_day(request.slot_start)),
        ];
        if let Some(key) = &idempotency_key {
            keys.push(Self::idempotency_lock_key(key));
        }
        let locks = self.locks.acquire(keys).await;

        if let Some(key) = &idempotency_key {
            if let Some(earlier) = self.store.find_by_idempotency_key(key).await? {
                let existing = earlier.replay(request)?;
                info!("Idempotency key {} already booked appointment {}", key, existing.id);
                return Ok(Committed {
                    appointment: existing,
                    refund: None,
                    side_effects: Vec::new(),
                    replayed: true,
                    locks,
                });
            }
        }

        let now = self.clock.now();
        self.rules.validate_booking(
            request.slot_start,
            request.slot_end,
            &request.department,
            patient_exists,
            doctor,
            now,
        )?;

        self.conflicts
            .check_conflicts(request.patient_id, request.doctor_id, request.slot_start, request.slot_end, None)
            .await?
            .into_result()?;

        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            department: request.department.clone(),
            slot_start: request.slot_start,
            slot_end: request.slot_end,
            status: AppointmentStatus::Scheduled,
            reschedule_count: 0,
            idempotency_key,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(appointment.clone()).await?;

        let side_effects = vec![OutboxEntry::new(
            appointment.id,
            SideEffect::Notify {
                event: NotificationEvent::AppointmentConfirmed,
            },
            now,
        )];

        Ok(Committed {
            appointment,
            refund: None,
            side_effects,
            replayed: false,
            locks,
        })
    }

    /// `doctor` is the doctor's current directory entry, re-fetched by the caller.
    pub async fn reschedule(
        &self,
        appointment_id: Uuid,
        request: &RescheduleAppointmentRequest,
        doctor: &DoctorProfile,
    ) -> Result<Committed, AppointmentError> {
        let snapshot = self.load(appointment_id).await?;

        let locks = self
            .locks
            .acquire(vec![
                KeyedLocks::appointment_key(appointment_id),
                KeyedLocks::patient_key(snapshot.patient_id),
                KeyedLocks::doctor_day_key(snapshot.doctor_id, self.policy().local_day(request.new_slot_start)),
            ])
            .await;

        // Re-read: another request may have moved or closed it while we waited.
        let mut appointment = self.load(appointment_id).await?;
        let now = self.clock.now();

        self.rules.validate_reschedule(&appointment, now)?;
        self.rules.validate_slot(request.new_slot_start, request.new_slot_end, now)?;
        self.rules.validate_department(&appointment.department, doctor)?;

        self.conflicts
            .check_conflicts(
                appointment.patient_id,
                appointment.doctor_id,
                request.new_slot_start,
                request.new_slot_end,
                Some(appointment.id),
            )
            .await?
            .into_result()?;

        debug!(
            "Moving appointment {} from {} to {}",
            appointment.id, appointment.slot_start, request.new_slot_start
        );
        appointment.slot_start = request.new_slot_start;
        appointment.slot_end = request.new_slot_end;
        appointment.reschedule_count += 1;
        appointment.updated_at = now;
        self.store.update(appointment.clone()).await?;

        let side_effects = vec![OutboxEntry::new(
            appointment.id,
            SideEffect::Notify {
                event: NotificationEvent::AppointmentRescheduled,
            },
            now,
        )
        .with_sequence(appointment.reschedule_count)];

        Ok(Committed {
            appointment,
            refund: None,
            side_effects,
            replayed: false,
            locks,
        })
    }

    pub async fn cancel(&self, appointment_id: Uuid) -> Result<Committed, AppointmentError> {
        self.close(appointment_id, Closing::Cancel).await
    }

    pub async fn complete(&self, appointment_id: Uuid) -> Result<Committed, AppointmentError> {
        self.close(appointment_id, Closing::Complete).await
    }

    pub async fn mark_no_show(&self, appointment_id: Uuid) -> Result<Committed, AppointmentError> {
        self.close(appointment_id, Closing::NoShow).await
    }

    /// Move a SCHEDULED appointment into one of the terminal states.
    async fn close(&self, appointment_id: Uuid, closing: Closing) -> Result<Committed, AppointmentError> {
        let locks = self.locks.acquire(vec![KeyedLocks::appointment_key(appointment_id)]).await;

        let mut appointment = self.load(appointment_id).await?;
        let now = self.clock.now();
        let action = closing.action();

        if let Err(reason) = self.rules.validate_transition(&appointment, action) {
            warn!("Rejected {} of appointment {}: {}", action, appointment_id, reason);
            return Err(reason.into());
        }

        let (refund, effects) = match closing {
            Closing::Cancel => {
                let refund = self.refunds.compute_refund(appointment.slot_start, now);
                let effects = vec![
                    SideEffect::Bill {
                        kind: BillKind::Refund,
                        percent: refund.refund_percent,
                    },
                    SideEffect::Notify {
                        event: NotificationEvent::AppointmentCancelled,
                    },
                ];
                (Some(refund), effects)
            }
            Closing::Complete => {
                let effects = vec![
                    SideEffect::Bill {
                        kind: BillKind::Completion,
                        percent: 100,
                    },
                    SideEffect::Notify {
                        event: NotificationEvent::AppointmentCompleted,
                    },
                ];
                (None, effects)
            }
            Closing::NoShow => {
                let refund = self.refunds.no_show();
                let effects = vec![
                    SideEffect::Bill {
                        kind: BillKind::Fee,
                        percent: refund.fee_percent,
                    },
                    SideEffect::Notify {
                        event: NotificationEvent::NoShow,
                    },
                ];
                (Some(refund), effects)
            }
        };

        appointment.status = action.target_status();
        appointment.updated_at = now;
        self.store.update(appointment.clone()).await?;

        let side_effects = effects
            .into_iter()
            .map(|effect| OutboxEntry::new(appointment.id, effect, now))
            .collect();

        Ok(Committed {
            appointment,
            refund,
            side_effects,
            replayed: false,
            locks,
        })
    }

    async fn load(&self, appointment_id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store.get(appointment_id).await?.ok_or(AppointmentError::NotFound)
    }
}
