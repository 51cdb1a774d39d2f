use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use appointment_cell::models::SchedulingPolicy;
use appointment_cell::router::appointment_routes;
use appointment_cell::services::booking::{AppointmentService, Collaborators};
use appointment_cell::services::clock::FixedClock;
use appointment_cell::services::outbox::InMemoryOutbox;
use appointment_cell::services::store::InMemoryAppointmentStore;
use shared_models::error::UNAVAILABLE_MESSAGE;
use shared_utils::test_utils::{MockServiceResponses, TestConfig};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap()
}

fn app(mock_server: &MockServer, clock: Arc<FixedClock>) -> Router {
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();
    let service = AppointmentService::new(
        SchedulingPolicy::default(),
        Arc::new(InMemoryAppointmentStore::new()),
        Arc::new(InMemoryOutbox::new()),
        Collaborators::http(&config).unwrap(),
        clock,
    );
    appointment_routes(Arc::new(service))
}

async fn mount_collaborators(mock_server: &MockServer, patient_id: Uuid, doctor_id: Uuid, department: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/patients/{}/exists", patient_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(MockServiceResponses::patient_exists(true)))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/v1/doctors/{}", doctor_id)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(MockServiceResponses::doctor_response(&doctor_id.to_string(), department)),
        )
        .mount(mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/notifications"))
        .respond_with(ResponseTemplate::new(202).set_body_json(MockServiceResponses::notification_ack()))
        .mount(mock_server)
        .await;
}

fn booking_body(patient_id: Uuid, doctor_id: Uuid, hour: u32) -> Value {
    json!({
        "patient_id": patient_id,
        "doctor_id": doctor_id,
        "department": "Cardio",
        "slot_start": format!("2026-03-11T{:02}:00:00Z", hour),
        "slot_end": format!("2026-03-11T{:02}:30:00Z", hour),
    })
}

fn post(uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method("POST").uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_check() {
    let mock_server = MockServer::start().await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-correlation-id"));
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "appointment-service");
}

#[tokio::test]
async fn test_book_and_fetch_appointment() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let (status, json) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["appointment"]["status"], "SCHEDULED");
    assert_eq!(json["appointment"]["reschedule_count"], 0);

    let id = json["appointment"]["id"].as_str().unwrap().to_string();
    let (status, fetched) = send(
        &app,
        Request::builder().uri(format!("/v1/appointments/{}", id)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["doctor_id"], doctor_id.to_string());

    let (status, listed) = send(
        &app,
        Request::builder()
            .uri(format!("/v1/appointments?patient_id={}&status=SCHEDULED", patient_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["total"], 1);
}

#[tokio::test]
async fn test_list_total_counts_beyond_the_page() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    for hour in [10, 12, 14] {
        let (status, _) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, hour)))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, listed) = send(
        &app,
        Request::builder()
            .uri(format!("/v1/appointments?doctor_id={}&limit=2&offset=1", doctor_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["appointments"].as_array().unwrap().len(), 2);
    assert_eq!(listed["total"], 3);
    assert_eq!(listed["limit"], 2);
    assert_eq!(listed["offset"], 1);
}

#[tokio::test]
async fn test_department_mismatch_is_400_with_code() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Neuro").await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let (status, json) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "DEPARTMENT_MISMATCH");
    assert!(json["error"].as_str().unwrap().contains("Cardio"));
}

#[tokio::test]
async fn test_double_booking_is_409() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let (status, _) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "PATIENT_DOUBLE_BOOKED");
}

#[tokio::test]
async fn test_idempotency_key_header_replays_booking() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let request = |hour: u32| {
        Request::builder()
            .method("POST")
            .uri("/v1/appointments")
            .header("content-type", "application/json")
            .header("idempotency-key", "booking-7")
            .body(Body::from(booking_body(patient_id, doctor_id, hour).to_string()))
            .unwrap()
    };

    let (first_status, first) = send(&app, request(10)).await;
    let (second_status, second) = send(&app, request(10)).await;

    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(first["appointment"]["id"], second["appointment"]["id"]);

    // same key, different slot
    let (status, json) = send(&app, request(14)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "IDEMPOTENCY_KEY_REUSED");
    assert!(json.get("appointment").is_none());
}

#[tokio::test]
async fn test_patient_service_outage_is_503_without_detail() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database on fire"))
        .mount(&mock_server)
        .await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let (status, json) = send(
        &app,
        post("/v1/appointments", Some(booking_body(Uuid::new_v4(), Uuid::new_v4(), 10))),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], UNAVAILABLE_MESSAGE);
    assert!(!json.to_string().contains("database on fire"));
}

#[tokio::test]
async fn test_cancel_sends_refund_bill() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    Mock::given(method("POST"))
        .and(path("/v1/bills"))
        .and(header_exists("idempotency-key"))
        .and(body_partial_json(json!({"kind": "REFUND", "percent": 100})))
        .respond_with(ResponseTemplate::new(201).set_body_json(MockServiceResponses::bill_created()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let app = app(&mock_server, Arc::new(FixedClock::new(now())));
    let (_, booked) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;
    let id = booked["appointment"]["id"].as_str().unwrap().to_string();

    let (status, json) = send(&app, post(&format!("/v1/appointments/{}/cancel", id), None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["appointment"]["status"], "CANCELLED");
    assert_eq!(json["refund"]["refund_percent"], 100);
    assert_eq!(json["refund"]["fee_percent"], 0);
}

#[tokio::test]
async fn test_no_show_then_complete_is_rejected() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    Mock::given(method("POST"))
        .and(path("/v1/bills"))
        .respond_with(ResponseTemplate::new(201).set_body_json(MockServiceResponses::bill_created()))
        .mount(&mock_server)
        .await;

    let clock = Arc::new(FixedClock::new(now()));
    let app = app(&mock_server, clock.clone());
    let (_, booked) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;
    let id = booked["appointment"]["id"].as_str().unwrap().to_string();

    clock.set(Utc.with_ymd_and_hms(2026, 3, 11, 10, 40, 0).unwrap());
    let (status, json) = send(&app, post(&format!("/v1/appointments/{}/noshow", id), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["appointment"]["status"], "NO_SHOW");
    assert_eq!(json["refund"]["fee_percent"], 100);

    let (status, json) = send(&app, post(&format!("/v1/appointments/{}/complete", id), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_STATE_FOR_ACTION");
}

#[tokio::test]
async fn test_reschedule_over_http() {
    let mock_server = MockServer::start().await;
    let (patient_id, doctor_id) = (Uuid::new_v4(), Uuid::new_v4());
    mount_collaborators(&mock_server, patient_id, doctor_id, "Cardio").await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let (_, booked) = send(&app, post("/v1/appointments", Some(booking_body(patient_id, doctor_id, 10)))).await;
    let id = booked["appointment"]["id"].as_str().unwrap().to_string();

    let body = json!({
        "new_slot_start": "2026-03-11T11:00:00Z",
        "new_slot_end": "2026-03-11T11:30:00Z",
    });
    let (status, json) = send(&app, post(&format!("/v1/appointments/{}/reschedule", id), Some(body))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["appointment"]["reschedule_count"], 1);
    assert_eq!(json["appointment"]["slot_start"], "2026-03-11T11:00:00Z");
}

#[tokio::test]
async fn test_unknown_appointment_is_404() {
    let mock_server = MockServer::start().await;
    let app = app(&mock_server, Arc::new(FixedClock::new(now())));

    let (status, json) = send(
        &app,
        Request::builder()
            .uri(format!("/v1/appointments/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}
