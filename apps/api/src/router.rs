use std::sync::Arc;

use axum::{routing::get, Router};

use appointment_cell::router::appointment_routes;
use appointment_cell::services::booking::AppointmentService;

pub fn create_router(service: Arc<AppointmentService>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic appointment service is running!" }))
        .merge(appointment_routes(service))
}
