// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::correlation_id_middleware;

use crate::handlers;
use crate::services::booking::AppointmentService;

pub fn appointment_routes(service: Arc<AppointmentService>) -> Router {
    let appointment_routes = Router::new()
        .route("/", post(handlers::book_appointment).get(handlers::list_appointments))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}/reschedule", post(handlers::reschedule_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/{appointment_id}/complete", post(handlers::complete_appointment))
        .route("/{appointment_id}/noshow", post(handlers::mark_no_show));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/v1/appointments", appointment_routes)
        .layer(middleware::from_fn(correlation_id_middleware))
        .with_state(service)
}
