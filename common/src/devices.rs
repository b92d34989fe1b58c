use log::warn;
use serde_json::Value;

use crate::{
    error::ParseError,
    registry::{DeviceId, Light},
};

pub const LIGHT_DEVICE_TYPE: &str = "light";

fn device_type(device: &Value) -> Option<&str> {
    device.get("type").and_then(Value::as_str)
}

/// Extracts the lights from a `GET /devices` response body.
///
/// Lights without a string `id` and devices without a `type` are skipped.
/// The returned identifiers are owned copies.
pub fn parse_lights(body: &[u8]) -> Result<Vec<Light>, ParseError> {
    let end = body
        .iter()
        .rposition(|byte| *byte != 0)
        .map_or(0, |index| index + 1);
    let root: Value = serde_json::from_slice(&body[..end]).map_err(|_| ParseError::NotJson)?;
    let Value::Array(devices) = root else {
        return Err(ParseError::NotArray);
    };

    let count = devices
        .iter()
        .filter(|device| device_type(device) == Some(LIGHT_DEVICE_TYPE))
        .count();
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut lights = Vec::with_capacity(count);
    for (index, device) in devices.iter().enumerate() {
        match device_type(device) {
            Some(LIGHT_DEVICE_TYPE) => {}
            Some(_) => continue,
            None => {
                warn!("skipping device #{index}: missing `type`");
                continue;
            }
        }

        match device.get("id").and_then(Value::as_str) {
            Some(id) => lights.push(Light::new(DeviceId::new(id))),
            None => warn!("skipping light #{index}: missing string `id`"),
        }
    }

    Ok(lights)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ids(lights: &[Light]) -> Vec<&str> {
        lights.iter().map(|light| light.id().as_str()).collect()
    }

    #[test]
    fn keeps_only_lights() {
        let lights =
            parse_lights(br#"[{"type":"light","id":"abc"},{"type":"outlet","id":"xyz"}]"#)
                .unwrap();
        assert_eq!(ids(&lights), vec!["abc"]);
    }

    #[test]
    fn empty_array_is_not_an_error() {
        assert!(parse_lights(b"[]").unwrap().is_empty());
    }

    #[test]
    fn non_array_root_is_rejected() {
        assert_eq!(parse_lights(br#""not an array""#), Err(ParseError::NotArray));
        assert_eq!(parse_lights(br#"{"type":"light"}"#), Err(ParseError::NotArray));
    }

    #[test]
    fn garbage_is_not_json() {
        assert_eq!(parse_lights(b"<html>502</html>"), Err(ParseError::NotJson));
        assert_eq!(parse_lights(b""), Err(ParseError::NotJson));
        assert_eq!(parse_lights(br#"[{"type":"light","id":"abc""#), Err(ParseError::NotJson));
    }

    #[test]
    fn light_without_id_is_skipped() {
        assert!(parse_lights(br#"[{"type":"light"}]"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_records_do_not_abort_discovery() {
        let body = br#"[
            {"id":"no-type"},
            {"type":"light","id":7},
            {"type":"light","id":"first","attributes":{"isOn":true}},
            {"type":"sensor","id":"motion"},
            {"type":"light","id":"second"},
            "stray"
        ]"#;

        assert_eq!(ids(&parse_lights(body).unwrap()), vec!["first", "second"]);
    }

    #[test]
    fn trailing_terminator_bytes_are_ignored() {
        let lights = parse_lights(b"[{\"type\":\"light\",\"id\":\"abc\"}]\0\0\0").unwrap();
        assert_eq!(ids(&lights), vec!["abc"]);
    }
}
