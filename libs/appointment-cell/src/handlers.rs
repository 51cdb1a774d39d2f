// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::{
    AppointmentError, AppointmentFilter, AppointmentOutcome, BookAppointmentRequest,
    RescheduleAppointmentRequest,
};
use crate::services::booking::AppointmentService;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

impl From<AppointmentError> for AppError {
    fn from(error: AppointmentError) -> Self {
        match error {
            AppointmentError::NotFound => AppError::NotFound("Appointment not found".to_string()),
            AppointmentError::Rejected(reason) if reason.is_conflict() => AppError::Conflict {
                code: reason.code(),
                message: reason.to_string(),
            },
            AppointmentError::Rejected(reason) => AppError::Rejected {
                code: reason.code(),
                message: reason.to_string(),
            },
            AppointmentError::Unavailable(detail) | AppointmentError::Storage(detail) => {
                AppError::Unavailable(detail)
            }
        }
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };

    let key = value
        .to_str()
        .map_err(|_| AppError::BadRequest("Idempotency-Key must be visible ASCII".to_string()))?
        .trim();

    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::BadRequest(format!(
            "Idempotency-Key must be 1 to {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }

    Ok(Some(key.to_string()))
}

fn outcome_json(outcome: AppointmentOutcome) -> Result<Json<Value>, AppError> {
    serde_json::to_value(outcome)
        .map(Json)
        .map_err(|e| AppError::Internal(format!("Failed to serialize appointment: {}", e)))
}

// ==============================================================================
// LIFECYCLE HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn book_appointment(
    State(service): State<Arc<AppointmentService>>,
    headers: HeaderMap,
    Json(request): Json<BookAppointmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let key = idempotency_key(&headers)?;
    let outcome = service.book(request, key).await?;
    Ok((StatusCode::CREATED, outcome_json(outcome)?))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(service): State<Arc<AppointmentService>>,
    Path(appointment_id): Path<Uuid>,
    Json(request): Json<RescheduleAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = service.reschedule(appointment_id, request).await?;
    outcome_json(outcome)
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(service): State<Arc<AppointmentService>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let outcome = service.cancel(appointment_id).await?;
    outcome_json(outcome)
}

#[axum::debug_handler]
pub async fn complete_appointment(
    State(service): State<Arc<AppointmentService>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let outcome = service.complete(appointment_id).await?;
    outcome_json(outcome)
}

#[axum::debug_handler]
pub async fn mark_no_show(
    State(service): State<Arc<AppointmentService>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let outcome = service.mark_no_show(appointment_id).await?;
    outcome_json(outcome)
}

// ==============================================================================
// QUERY HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn get_appointment(
    State(service): State<Arc<AppointmentService>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = service.get(appointment_id).await?;
    Ok(Json(json!(appointment)))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(service): State<Arc<AppointmentService>>,
    Query(filter): Query<AppointmentFilter>,
) -> Result<Json<Value>, AppError> {
    if let (Some(from), Some(to)) = (filter.from_date, filter.to_date) {
        if from > to {
            return Err(AppError::BadRequest("from_date must not be after to_date".to_string()));
        }
    }

    let page = service.list(&filter).await?;
    debug!("Listed {} of {} appointments", page.appointments.len(), page.total);

    Ok(Json(json!({
        "appointments": page.appointments,
        "total": page.total,
        "limit": filter.effective_limit(),
        "offset": filter.effective_offset(),
    })))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "appointment-service",
    }))
}
