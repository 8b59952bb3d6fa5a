use crate::error::DecodeError;
use crate::reading::{MetricKey, Reading};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Aliases the gateway has used for each power field across firmware versions.
/// kW names are tried before W names.
struct PowerField {
    key: MetricKey,
    kw_names: &'static [&'static str],
    w_names: &'static [&'static str],
}

const POWER_FIELDS: [PowerField; 3] = [
    PowerField {
        key: MetricKey::PvPower,
        kw_names: &["pv_p", "solar_p", "pv_kw"],
        w_names: &["solar_w", "pv_w"],
    },
    PowerField {
        key: MetricKey::HomeLoadPower,
        kw_names: &["site_load_p", "load_p", "load_kw"],
        w_names: &["load_w", "house_w"],
    },
    PowerField {
        key: MetricKey::GridNetPower,
        kw_names: &["net_p", "grid_p", "net_kw"],
        w_names: &["net_w", "grid_w"],
    },
];

/// Fields copied through without unit conversion.
const PLAIN_FIELDS: [(MetricKey, &[&str]); 4] = [
    (MetricKey::BatterySoc, &["soc", "battery_soc", "ess_soc"]),
    (MetricKey::PvLifetimeEnergy, &["pv_en"]),
    (MetricKey::HomeLoadLifetimeEnergy, &["site_load_en"]),
    (MetricKey::GridNetLifetimeEnergy, &["net_en"]),
];

/// Decodes a frame stamped with the current wall-clock time.
pub fn decode(raw: &str) -> Result<Reading, DecodeError> {
    decode_at(raw, Utc::now())
}

/// Decodes one frame from the gateway into a reading captured at `captured_at`.
///
/// Readings are pulled from a `params` or `power` envelope when present, otherwise
/// from the top-level object. Unknown fields are ignored. Grid net power is derived
/// from load and PV when the frame omits it, and is always split into an import and
/// an export component.
pub fn decode_at(raw: &str, captured_at: DateTime<Utc>) -> Result<Reading, DecodeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }

    let document: Value = serde_json::from_str(raw)?;
    let Value::Object(document) = document else {
        return Err(DecodeError::NotAnObject);
    };
    let payload = envelope(&document);

    let mut reading = Reading::new(captured_at);

    for field in &POWER_FIELDS {
        let watts = first_number(payload, field.kw_names)
            .map(|kw| kw * 1000.0)
            .or_else(|| first_number(payload, field.w_names));
        if let Some(watts) = watts {
            reading.insert(field.key, watts);
        }
    }

    for (key, names) in PLAIN_FIELDS {
        if let Some(value) = first_number(payload, names) {
            reading.insert(key, value);
        }
    }

    if !reading.contains(MetricKey::GridNetPower) {
        if let (Some(load), Some(pv)) = (
            reading.get(MetricKey::HomeLoadPower),
            reading.get(MetricKey::PvPower),
        ) {
            reading.insert(MetricKey::GridNetPower, load - pv);
        }
    }

    if let Some(net) = reading.get(MetricKey::GridNetPower) {
        reading.insert(MetricKey::GridImportPower, net.max(0.0));
        reading.insert(MetricKey::GridExportPower, (-net).max(0.0));
    }

    if reading.is_empty() {
        return Err(DecodeError::NoKnownFields);
    }
    Ok(reading)
}

fn envelope(document: &Map<String, Value>) -> &Map<String, Value> {
    ["params", "power"]
        .iter()
        .find_map(|name| document.get(*name).and_then(Value::as_object))
        .unwrap_or(document)
}

fn first_number(payload: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    names
        .iter()
        .filter_map(|name| payload.get(*name))
        .find_map(as_number)
}

/// The gateway sometimes sends numbers as strings.
fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.map(|a| (a - b).abs() < 1e-9).unwrap_or(false)
    }

    #[test]
    fn test_decode_params_envelope_in_kw() {
        let reading = decode(
            r#"{"notification":"power","params":{"time":1700000000,"pv_p":3.2,"site_load_p":1.5,"net_p":-1.7,"soc":0.81}}"#,
        )
        .unwrap();

        assert!(approx(reading.get(MetricKey::PvPower), 3200.0));
        assert!(approx(reading.get(MetricKey::HomeLoadPower), 1500.0));
        assert!(approx(reading.get(MetricKey::GridNetPower), -1700.0));
        assert!(approx(reading.get(MetricKey::GridImportPower), 0.0));
        assert!(approx(reading.get(MetricKey::GridExportPower), 1700.0));
        assert!(approx(reading.get(MetricKey::BatterySoc), 0.81));
    }

    #[test]
    fn test_decode_power_envelope_and_top_level() {
        let reading = decode(r#"{"power":{"pv_kw":1.0}}"#).unwrap();
        assert!(approx(reading.get(MetricKey::PvPower), 1000.0));

        let reading = decode(r#"{"load_kw":0.75}"#).unwrap();
        assert!(approx(reading.get(MetricKey::HomeLoadPower), 750.0));
    }

    #[test]
    fn test_kw_field_preferred_over_watt_field() {
        let reading = decode(r#"{"pv_p":2.0,"solar_w":1234}"#).unwrap();
        assert!(approx(reading.get(MetricKey::PvPower), 2000.0));

        let reading = decode(r#"{"solar_w":1234}"#).unwrap();
        assert!(approx(reading.get(MetricKey::PvPower), 1234.0));
    }

    #[test]
    fn test_net_derived_from_load_and_pv() {
        let reading = decode(r#"{"pv_p":1.0,"site_load_p":1.5}"#).unwrap();
        assert!(approx(reading.get(MetricKey::GridNetPower), 500.0));
        assert!(approx(reading.get(MetricKey::GridImportPower), 500.0));
        assert!(approx(reading.get(MetricKey::GridExportPower), 0.0));
    }

    #[test]
    fn test_lifetime_energy_fields() {
        let reading =
            decode(r#"{"params":{"pv_en":12345.6,"site_load_en":"9876.5","net_en":-12.0}}"#)
                .unwrap();
        assert!(approx(reading.get(MetricKey::PvLifetimeEnergy), 12345.6));
        assert!(approx(reading.get(MetricKey::HomeLoadLifetimeEnergy), 9876.5));
        assert!(approx(reading.get(MetricKey::GridNetLifetimeEnergy), -12.0));
        assert!(!reading.contains(MetricKey::PvPower));
    }

    #[test]
    fn test_unknown_and_invalid_values_ignored() {
        let reading =
            decode(r#"{"pv_p":"n/a","solar_w":800,"firmware":"2024.1","net_p":null,"extra":{"a":1}}"#)
                .unwrap();
        assert!(approx(reading.get(MetricKey::PvPower), 800.0));
        assert!(!reading.contains(MetricKey::GridNetPower));
        assert_eq!(reading.len(), 1);
    }

    #[test]
    fn test_empty_payload() {
        assert!(matches!(decode(""), Err(DecodeError::Empty)));
        assert!(matches!(decode("  \n"), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_truncated_payload() {
        let result = decode(r#"{"params":{"pv_p":3.2,"site_lo"#);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_non_object_payload() {
        assert!(matches!(decode("[1,2,3]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(decode("42"), Err(DecodeError::NotAnObject)));
    }

    #[test]
    fn test_no_known_fields_is_soft_failure() {
        let result = decode(r#"{"notification":"hello","params":{"version":3}}"#);
        assert_err!(&result);
        assert!(matches!(result, Err(DecodeError::NoKnownFields)));
    }

    #[test]
    fn test_capture_time_is_kept() {
        let at = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let reading = decode_at(r#"{"pv_p":1}"#, at).unwrap();
        assert_eq!(reading.captured_at, at);
    }
}
