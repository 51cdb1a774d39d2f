// libs/appointment-cell/src/services/collaborators.rs
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use shared_client::ServiceClient;
use shared_config::AppConfig;

use crate::models::{BillKind, DoctorProfile, NotificationEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} service timed out")]
    Timeout { service: &'static str },

    #[error("{service} service unavailable: {message}")]
    Unavailable { service: &'static str, message: String },
}

impl CollaboratorError {
    fn from_client(service: &'static str, err: anyhow::Error) -> Self {
        let message = err.to_string();
        if message.contains("timed out") {
            CollaboratorError::Timeout { service }
        } else {
            CollaboratorError::Unavailable { service, message }
        }
    }
}

// ==============================================================================
// PORTS
// ==============================================================================

#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn exists(&self, patient_id: Uuid) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait DoctorDirectory: Send + Sync {
    /// A doctor the directory does not know is `DoctorProfile::missing()`, not an error.
    async fn get_doctor(&self, doctor_id: Uuid) -> Result<DoctorProfile, CollaboratorError>;
}

#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Returns the bill id. `idempotency_key` makes retries safe on the billing side.
    async fn create_bill(
        &self,
        appointment_id: Uuid,
        kind: BillKind,
        percent: u8,
        idempotency_key: &str,
    ) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(
        &self,
        appointment_id: Uuid,
        event: NotificationEvent,
        idempotency_key: &str,
    ) -> Result<(), CollaboratorError>;
}

// ==============================================================================
// HTTP ADAPTERS
// ==============================================================================

fn client(service: &'static str, base_url: &str, config: &AppConfig) -> anyhow::Result<ServiceClient> {
    ServiceClient::new(
        service,
        base_url,
        Duration::from_millis(config.collaborator_timeout_ms),
    )
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Deserialize)]
struct DoctorResponse {
    department: String,
}

#[derive(Deserialize)]
struct BillResponse {
    bill_id: String,
}

pub struct HttpPatientDirectory {
    client: ServiceClient,
}

impl HttpPatientDirectory {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: client("patient", &config.patient_service_url, config)?,
        })
    }
}

#[async_trait]
impl PatientDirectory for HttpPatientDirectory {
    async fn exists(&self, patient_id: Uuid) -> Result<bool, CollaboratorError> {
        let path = format!("/v1/patients/{}/exists", patient_id);
        let response: Option<ExistsResponse> = self
            .client
            .get_optional(&path)
            .await
            .map_err(|e| CollaboratorError::from_client(self.client.service(), e))?;

        Ok(response.is_some_and(|r| r.exists))
    }
}

pub struct HttpDoctorDirectory {
    client: ServiceClient,
}

impl HttpDoctorDirectory {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: client("doctor", &config.doctor_service_url, config)?,
        })
    }
}

#[async_trait]
impl DoctorDirectory for HttpDoctorDirectory {
    async fn get_doctor(&self, doctor_id: Uuid) -> Result<DoctorProfile, CollaboratorError> {
        let path = format!("/v1/doctors/{}", doctor_id);
        let response: Option<DoctorResponse> = self
            .client
            .get_optional(&path)
            .await
            .map_err(|e| CollaboratorError::from_client(self.client.service(), e))?;

        Ok(match response {
            Some(doctor) => DoctorProfile {
                exists: true,
                department: doctor.department,
            },
            None => {
                debug!("Doctor {} not found in directory", doctor_id);
                DoctorProfile::missing()
            }
        })
    }
}

pub struct HttpBillingGateway {
    client: ServiceClient,
}

impl HttpBillingGateway {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: client("billing", &config.billing_service_url, config)?,
        })
    }
}

#[async_trait]
impl BillingGateway for HttpBillingGateway {
    async fn create_bill(
        &self,
        appointment_id: Uuid,
        kind: BillKind,
        percent: u8,
        idempotency_key: &str,
    ) -> Result<String, CollaboratorError> {
        let body = json!({
            "appointment_id": appointment_id,
            "kind": kind,
            "percent": percent,
        });

        let response: BillResponse = self
            .client
            .request(Method::POST, "/v1/bills", Some(body), Some(idempotency_key))
            .await
            .map_err(|e| CollaboratorError::from_client(self.client.service(), e))?;

        Ok(response.bill_id)
    }
}

pub struct HttpNotificationGateway {
    client: ServiceClient,
}

impl HttpNotificationGateway {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: client("notification", &config.notification_service_url, config)?,
        })
    }
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn notify(
        &self,
        appointment_id: Uuid,
        event: NotificationEvent,
        idempotency_key: &str,
    ) -> Result<(), CollaboratorError> {
        let body = json!({
            "event_type": event,
            "data": { "appointment_id": appointment_id },
        });

        // The acknowledgement body carries nothing we need.
        let _: serde_json::Value = self
            .client
            .request(Method::POST, "/v1/notifications", Some(body), Some(idempotency_key))
            .await
            .map_err(|e| CollaboratorError::from_client(self.client.service(), e))?;

        Ok(())
    }
}
