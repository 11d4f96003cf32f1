use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Optional owner ids copied from the vehicle record onto every sample at
/// ingest so queries and topic routing never need a join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerRefs {
    pub dealer_id: Option<i64>,
    pub admin_id: Option<i64>,
    pub client_id: Option<i64>,
    pub user_id: Option<i64>,
    pub superadmin_id: Option<i64>,
}

impl OwnerRefs {
    pub fn is_empty(&self) -> bool {
        self.dealer_id.is_none()
            && self.admin_id.is_none()
            && self.client_id.is_none()
            && self.user_id.is_none()
            && self.superadmin_id.is_none()
    }
}

/// One normalized device position record.
///
/// `recorded_at` is the device-local wall clock exactly as published; it is
/// never converted to or from a timezone anywhere in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    pub device_id: String,
    pub recorded_at: NaiveDateTime,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<String>,
    pub ignition: Option<bool>,
    pub vehicle_status: Option<String>,
    pub gsm_strength: Option<String>,
    pub sequence_no: Option<String>,
    pub panic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_no: Option<String>,
    /// `N1` marks a live report, `N2` buffered history. Not persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Free-form device extras, recognized on the wire but not stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_intervals: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_interval: Option<String>,
    #[serde(flatten)]
    pub owners: OwnerRefs,
}

impl LocationSample {
    /// Minimal sample with every optional field empty.
    pub fn new(device_id: impl Into<String>, recorded_at: NaiveDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            recorded_at,
            latitude: None,
            longitude: None,
            speed: None,
            course: None,
            ignition: None,
            vehicle_status: None,
            gsm_strength: None,
            sequence_no: None,
            panic: false,
            imei: None,
            serial_no: None,
            status: None,
            additional_data: None,
            time_intervals: None,
            distance_interval: None,
            owners: OwnerRefs::default(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.as_deref() != Some("N2")
    }

    /// (0, 0) is the fix a dead GPS module reports.
    pub fn has_suspicious_coordinates(&self) -> bool {
        matches!((self.latitude, self.longitude), (Some(la), Some(lo)) if la == 0.0 && lo == 0.0)
    }

    pub fn month_key(&self) -> (i32, u32) {
        use chrono::Datelike;
        (self.recorded_at.year(), self.recorded_at.month())
    }
}

/// Result of parsing one broker payload: the usable samples plus a count
/// of sibling objects that were dropped.
#[derive(Debug)]
pub struct ParsedPayload {
    pub samples: Vec<LocationSample>,
    pub skipped: usize,
}

/// Parse a broker payload into samples.
///
/// Devices publish either a single JSON object or several objects
/// concatenated back-to-back with no wrapping array; the streaming
/// deserializer handles both. An object that fails validation is skipped
/// and counted, valid siblings still go through. A JSON syntax error ends
/// the stream (there is no way to resync) but keeps whatever parsed before
/// it. The result is an error only when not a single sample was usable.
pub fn parse_payload(payload: &str) -> Result<ParsedPayload, ValidationError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    let mut first_error: Option<ValidationError> = None;
    let mut syntax_error: Option<String> = None;

    for object in serde_json::Deserializer::from_str(trimmed).into_iter::<Value>() {
        match object {
            Ok(value) => match sample_from_value(&value) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    skipped += 1;
                    tracing::debug!("skipping invalid payload object: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            },
            Err(e) => {
                syntax_error = Some(e.to_string());
                break;
            }
        }
    }

    if samples.is_empty() {
        if let Some(e) = first_error {
            return Err(e);
        }
        if let Some(e) = syntax_error {
            return Err(ValidationError::Malformed(e));
        }
        return Err(ValidationError::EmptyPayload);
    }
    if let Some(e) = syntax_error {
        skipped += 1;
        tracing::debug!("payload truncated after {} samples: {e}", samples.len());
    }
    Ok(ParsedPayload { samples, skipped })
}

/// Cheap device-id scan over the raw payload, used to pick an ingest shard
/// before the full parse happens on the worker. Finds the first quoted
/// `deviceID` key (any case) and returns its string value. A wrong hint
/// only costs shard affinity, never correctness, so this stays a scan and
/// not a parser.
pub fn sniff_device_id(payload: &str) -> Option<&str> {
    let bytes = payload.as_bytes();
    let key = b"deviceid";
    let mut i = 1;
    while i + key.len() < bytes.len() {
        if bytes[i - 1] == b'"'
            && bytes[i..i + key.len()].eq_ignore_ascii_case(key)
            && bytes.get(i + key.len()) == Some(&b'"')
        {
            let mut j = i + key.len() + 1;
            while matches!(bytes.get(j), Some(b' ' | b'\t' | b'\r' | b'\n')) {
                j += 1;
            }
            if bytes.get(j) != Some(&b':') {
                i += 1;
                continue;
            }
            j += 1;
            while matches!(bytes.get(j), Some(b' ' | b'\t' | b'\r' | b'\n')) {
                j += 1;
            }
            if bytes.get(j) != Some(&b'"') {
                i += 1;
                continue;
            }
            j += 1;
            let start = j;
            while j < bytes.len() && bytes[j] != b'"' {
                j += 1;
            }
            if j < bytes.len() && j > start {
                return std::str::from_utf8(&bytes[start..j]).ok();
            }
        }
        i += 1;
    }
    None
}

/// Build one sample from a raw JSON object, tolerating the documented
/// case-insensitive key variants and string-or-number values.
pub fn sample_from_value(object: &Value) -> Result<LocationSample, ValidationError> {
    let device_id = get_str(object, "deviceID")
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingField("deviceID"))?;

    let raw_ts = get_str(object, "timestamp").ok_or(ValidationError::MissingField("timestamp"))?;
    let recorded_at = NaiveDateTime::parse_from_str(&raw_ts, TIMESTAMP_FORMAT)
        .map_err(|_| ValidationError::BadTimestamp(raw_ts.clone()))?;

    Ok(LocationSample {
        latitude: get_f64(object, "latitude")?,
        longitude: get_f64(object, "longitude")?,
        speed: get_f64(object, "speed")?,
        course: get_str(object, "course"),
        ignition: get_str(object, "ignition").map(|v| v.eq_ignore_ascii_case("ON")),
        vehicle_status: get_str(object, "vehicleStatus"),
        gsm_strength: get_str(object, "gsmStrength"),
        sequence_no: get_str(object, "sequenceNumber"),
        panic: get_flag(object, "panic"),
        imei: get_str(object, "IMEI"),
        serial_no: get_str(object, "serialNo"),
        status: get_str(object, "status"),
        additional_data: get_str(object, "additionalData"),
        time_intervals: get_str(object, "timeIntervals"),
        distance_interval: get_str(object, "distanceInterval"),
        ..LocationSample::new(device_id, recorded_at)
    })
}

fn get_field<'a>(object: &'a Value, key: &str) -> Option<&'a Value> {
    let map = object.as_object()?;
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn get_str(object: &Value, key: &str) -> Option<String> {
    match get_field(object, key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn get_f64(object: &Value, key: &'static str) -> Result<Option<f64>, ValidationError> {
    match get_field(object, key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>()
                .map(Some)
                .map_err(|_| ValidationError::BadNumber {
                    field: key,
                    value: s.to_string(),
                })
        }
        Some(other) => Err(ValidationError::BadNumber {
            field: key,
            value: other.to_string(),
        }),
    }
}

fn get_flag(object: &Value, key: &str) -> bool {
    match get_field(object, key) {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s.trim() == "1",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_payload() -> &'static str {
        r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31","latitude":"25.2","longitude":"55.3","speed":"40","status":"N2"}"#
    }

    #[test]
    fn parses_single_object() {
        let parsed = parse_payload(base_payload()).unwrap();
        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.skipped, 0);
        let s = &parsed.samples[0];
        assert_eq!(s.device_id, "D1");
        assert_eq!(s.latitude, Some(25.2));
        assert_eq!(s.longitude, Some(55.3));
        assert_eq!(s.speed, Some(40.0));
        assert!(!s.is_live());
    }

    #[test]
    fn parses_concatenated_objects_without_array() {
        let payload = format!("{}{}", base_payload(), base_payload().replace("D1", "D2"));
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.samples.len(), 2);
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.samples[0].device_id, "D1");
        assert_eq!(parsed.samples[1].device_id, "D2");
    }

    #[test]
    fn invalid_sibling_is_skipped_valid_one_survives() {
        // Second object has no usable timestamp; the first still parses.
        let bad = r#"{"deviceID":"D2","timestamp":"not a time"}"#;
        let payload = format!("{}{bad}", base_payload());
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.samples[0].device_id, "D1");
        assert_eq!(parsed.skipped, 1);

        // Order does not matter: bad first, good second.
        let payload = format!("{bad}{}", base_payload());
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.samples[0].device_id, "D1");
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn syntax_garbage_keeps_earlier_samples() {
        let payload = format!("{}{{not json", base_payload());
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.skipped, 1);

        // Garbage with nothing usable before it is an error.
        assert!(matches!(
            parse_payload("{not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn all_invalid_objects_surface_the_first_error() {
        let payload = r#"{"deviceID":"D1"}{"timestamp":"2025-07-09 08:15:31"}"#;
        assert!(matches!(
            parse_payload(payload),
            Err(ValidationError::MissingField("timestamp"))
        ));
    }

    #[test]
    fn timestamp_round_trips_verbatim() {
        let parsed = parse_payload(base_payload()).unwrap();
        let formatted = parsed.samples[0]
            .recorded_at
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert_eq!(formatted, "2025-07-09 08:15:31");
    }

    #[test]
    fn keys_are_case_insensitive() {
        let payload = r#"{"DEVICEid":"D9","TIMESTAMP":"2025-07-09 08:15:31","Latitude":12.5,"IGNITION":"on","PANIC":1}"#;
        let parsed = parse_payload(payload).unwrap();
        let s = &parsed.samples[0];
        assert_eq!(s.device_id, "D9");
        assert_eq!(s.latitude, Some(12.5));
        assert_eq!(s.ignition, Some(true));
        assert!(s.panic);
    }

    #[test]
    fn numbers_accept_string_and_numeric_forms() {
        let payload = r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31","latitude":25.2,"speed":"0"}"#;
        let parsed = parse_payload(payload).unwrap();
        let s = &parsed.samples[0];
        assert_eq!(s.latitude, Some(25.2));
        assert_eq!(s.speed, Some(0.0));
        assert_eq!(s.longitude, None);
    }

    #[test]
    fn missing_device_id_is_rejected() {
        let payload = r#"{"timestamp":"2025-07-09 08:15:31"}"#;
        assert!(matches!(
            parse_payload(payload),
            Err(ValidationError::MissingField("deviceID"))
        ));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let payload = r#"{"deviceID":"D1","timestamp":"09/07/2025 08:15"}"#;
        assert!(matches!(
            parse_payload(payload),
            Err(ValidationError::BadTimestamp(_))
        ));
    }

    #[test]
    fn garbage_numeric_is_rejected() {
        let payload = r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31","speed":"fast"}"#;
        assert!(matches!(
            parse_payload(payload),
            Err(ValidationError::BadNumber { field: "speed", .. })
        ));
    }

    #[test]
    fn device_extras_are_recognized() {
        let payload = r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31",
            "additionalData":"fw=2.1","timeIntervals":"30","distanceInterval":"100",
            "IMEI":"356938035643809","serialNo":"TW-0042","sequenceNumber":"17",
            "gsmStrength":"21","course":"182","vehicleStatus":"moving"}"#;
        let parsed = parse_payload(payload).unwrap();
        let s = &parsed.samples[0];
        assert_eq!(s.additional_data.as_deref(), Some("fw=2.1"));
        assert_eq!(s.time_intervals.as_deref(), Some("30"));
        assert_eq!(s.distance_interval.as_deref(), Some("100"));
        assert_eq!(s.imei.as_deref(), Some("356938035643809"));
        assert_eq!(s.serial_no.as_deref(), Some("TW-0042"));
        assert_eq!(s.sequence_no.as_deref(), Some("17"));
        assert_eq!(s.gsm_strength.as_deref(), Some("21"));
        assert_eq!(s.course.as_deref(), Some("182"));
        assert_eq!(s.vehicle_status.as_deref(), Some("moving"));
    }

    #[test]
    fn suspicious_coordinates_detected() {
        let payload = r#"{"deviceID":"D1","timestamp":"2025-07-09 08:15:31","latitude":"0","longitude":"0"}"#;
        let parsed = parse_payload(payload).unwrap();
        assert!(parsed.samples[0].has_suspicious_coordinates());
    }

    #[test]
    fn device_id_sniff_matches_the_parser() {
        assert_eq!(sniff_device_id(base_payload()), Some("D1"));
        assert_eq!(
            sniff_device_id(r#"{"DEVICEid" : "D9","timestamp":"2025-07-09 08:15:31"}"#),
            Some("D9")
        );
        // First object names the shard for a concatenated payload.
        let multi = format!("{}{}", base_payload(), base_payload().replace("D1", "D2"));
        assert_eq!(sniff_device_id(&multi), Some("D1"));
        assert_eq!(sniff_device_id(r#"{"timestamp":"2025-07-09 08:15:31"}"#), None);
        assert_eq!(sniff_device_id(r#"{"deviceID":""}"#), None);
        assert_eq!(sniff_device_id("not json at all"), None);
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(
            parse_payload("   "),
            Err(ValidationError::EmptyPayload)
        ));
    }
}
