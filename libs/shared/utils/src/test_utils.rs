use serde_json::json;
use uuid::Uuid;

use shared_config::AppConfig;

pub struct TestConfig {
    pub collaborator_base_url: String,
    pub collaborator_timeout_ms: u64,
    pub clinic_utc_offset_minutes: i32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            collaborator_base_url: "http://localhost:54321".to_string(),
            collaborator_timeout_ms: 500,
            clinic_utc_offset_minutes: 0,
        }
    }
}

impl TestConfig {
    pub fn with_mock_server(uri: &str) -> Self {
        Self {
            collaborator_base_url: uri.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            collaborator_timeout_ms: self.collaborator_timeout_ms,
            clinic_utc_offset_minutes: self.clinic_utc_offset_minutes,
            ..AppConfig::with_collaborators_at(&self.collaborator_base_url)
        }
    }
}

/// Canned collaborator payloads, shaped like the Patient, Doctor and Billing services answer.
pub struct MockServiceResponses;

impl MockServiceResponses {
    pub fn patient_exists(exists: bool) -> serde_json::Value {
        json!({ "exists": exists })
    }

    pub fn doctor_response(doctor_id: &str, department: &str) -> serde_json::Value {
        json!({
            "id": doctor_id,
            "first_name": "Test",
            "last_name": "Doctor",
            "department": department,
            "is_available": true
        })
    }

    pub fn bill_created() -> serde_json::Value {
        json!({ "bill_id": Uuid::new_v4().to_string() })
    }

    pub fn notification_ack() -> serde_json::Value {
        json!({ "status": "queued" })
    }
}
