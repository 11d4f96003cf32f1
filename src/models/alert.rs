use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    #[serde(rename = "SPEED_ALERT")]
    Speed,
    #[serde(rename = "OUT_OF_HOURS_IGNITION")]
    OutOfHoursIgnition,
    #[serde(rename = "SUSPICIOUS_COORDINATES")]
    SuspiciousCoordinates,
    #[serde(rename = "PANIC_ALERT")]
    Panic,
    #[serde(rename = "BATCH_FAILED")]
    BatchFailed,
    #[serde(rename = "POOL_EXHAUSTED")]
    PoolExhausted,
    #[serde(rename = "SHUTDOWN_TIMEOUT")]
    ShutdownTimeout,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Speed => "SPEED_ALERT",
            AlertKind::OutOfHoursIgnition => "OUT_OF_HOURS_IGNITION",
            AlertKind::SuspiciousCoordinates => "SUSPICIOUS_COORDINATES",
            AlertKind::Panic => "PANIC_ALERT",
            AlertKind::BatchFailed => "BATCH_FAILED",
            AlertKind::PoolExhausted => "POOL_EXHAUSTED",
            AlertKind::ShutdownTimeout => "SHUTDOWN_TIMEOUT",
        }
    }
}

/// One alert event as published on `/topic/alerts`. Transport to email/SMS
/// is the business of external subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub message: String,
    pub details: Map<String, Value>,
    pub timestamp: NaiveDateTime,
}

impl Alert {
    pub fn new(level: AlertLevel, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            device_id: None,
            message: message.into(),
            details: Map::new(),
            timestamp: chrono::Utc::now().naive_utc(),
        }
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(AlertKind::Speed.as_str(), "SPEED_ALERT");
        assert_eq!(AlertKind::BatchFailed.as_str(), "BATCH_FAILED");
        let json = serde_json::to_value(AlertKind::Speed).unwrap();
        assert_eq!(json, "SPEED_ALERT");
    }

    #[test]
    fn builder_attaches_device_and_details() {
        let alert = Alert::new(AlertLevel::Critical, AlertKind::Speed, "speed 180 > 120")
            .for_device("D5")
            .detail("speed", 180.0)
            .detail("threshold", 120.0);
        assert_eq!(alert.device_id.as_deref(), Some("D5"));
        assert_eq!(alert.details["speed"], 180.0);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["level"], "CRITICAL");
        assert_eq!(json["kind"], "SPEED_ALERT");
    }
}
