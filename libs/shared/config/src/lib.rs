use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub patient_service_url: String,
    pub doctor_service_url: String,
    pub billing_service_url: String,
    pub notification_service_url: String,
    pub collaborator_timeout_ms: u64,
    pub clinic_utc_offset_minutes: i32,
    pub slot_duration_minutes: Option<i64>,
    pub redis_url: Option<String>,
    pub outbox_poll_interval_ms: u64,
    pub outbox_max_attempts: u32,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            patient_service_url: url_var("PATIENT_SERVICE_URL", "http://localhost:8001"),
            doctor_service_url: url_var("DOCTOR_SERVICE_URL", "http://localhost:8002"),
            billing_service_url: url_var("BILLING_SERVICE_URL", "http://localhost:8003"),
            notification_service_url: url_var("NOTIFICATION_SERVICE_URL", "http://localhost:8007"),
            collaborator_timeout_ms: parsed_var("COLLABORATOR_TIMEOUT_MS", 3000),
            clinic_utc_offset_minutes: parsed_var("CLINIC_UTC_OFFSET_MINUTES", 0),
            slot_duration_minutes: optional_parsed_var("SLOT_DURATION_MINUTES"),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            outbox_poll_interval_ms: parsed_var("OUTBOX_POLL_INTERVAL_MS", 1000),
            outbox_max_attempts: parsed_var("OUTBOX_MAX_ATTEMPTS", 10),
            port: parsed_var("PORT", 8004),
        };

        if config.redis_url.is_none() {
            warn!("REDIS_URL not set, side-effect outbox will not survive restarts");
        }

        config
    }

    /// Point every collaborator at the same base URL. Used by tests against a single mock server.
    pub fn with_collaborators_at(base_url: &str) -> Self {
        Self {
            patient_service_url: base_url.to_string(),
            doctor_service_url: base_url.to_string(),
            billing_service_url: base_url.to_string(),
            notification_service_url: base_url.to_string(),
            ..Self::default()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            patient_service_url: "http://localhost:8001".to_string(),
            doctor_service_url: "http://localhost:8002".to_string(),
            billing_service_url: "http://localhost:8003".to_string(),
            notification_service_url: "http://localhost:8007".to_string(),
            collaborator_timeout_ms: 3000,
            clinic_utc_offset_minutes: 0,
            slot_duration_minutes: None,
            redis_url: None,
            outbox_poll_interval_ms: 1000,
            outbox_max_attempts: 10,
            port: 8004,
        }
    }
}

fn url_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| {
        warn!("{} not set, using default {}", name, default);
        default.to_string()
    })
}

fn parsed_var<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn optional_parsed_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{} has invalid value {:?}, ignoring", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborators_share_base_url() {
        let config = AppConfig::with_collaborators_at("http://127.0.0.1:9999");

        assert_eq!(config.patient_service_url, "http://127.0.0.1:9999");
        assert_eq!(config.notification_service_url, "http://127.0.0.1:9999");
        assert_eq!(config.collaborator_timeout_ms, 3000);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_invalid_numeric_value_falls_back() {
        env::set_var("CLINIC_TEST_BOGUS_NUMBER", "not-a-number");
        let value: u64 = parsed_var("CLINIC_TEST_BOGUS_NUMBER", 42);
        assert_eq!(value, 42);

        let missing: Option<i64> = optional_parsed_var("CLINIC_TEST_SURELY_UNSET");
        assert!(missing.is_none());
    }
}
