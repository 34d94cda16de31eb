//! Inbound payload classification and weather-report parsing
//!
//! Every record the endpoint receives is classified exactly once, in
//! priority order: presence notice, handshake acknowledgement, actuator
//! command, weather report, everything else. Presence notices are checked
//! before the ack keyword because `CONSOLE_CONNECTED` textually contains
//! `CONNECTED`.

use serde::{Deserialize, Serialize};

use super::wire::{ActuatorCommand, Role, ACK};

/// Field labels that mark a payload as a weather report
const REPORT_LABELS: [&str; 4] = ["city", "weather", "temperature", "humidity"];

// ─────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────

/// The result of classifying one received record
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// Peer-presence notice from the broker (`<ROLE>_CONNECTED`)
    Presence(Role),
    /// Handshake acknowledgement; log-only
    Ack,
    /// Recognized actuator command, raw token preserved
    Command(ActuatorCommand),
    /// Parsed weather report
    Report(WeatherReport),
    /// Anything else; discarded
    Unrecognized,
}

impl Classified {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Classified::Presence(_) => "presence",
            Classified::Ack => "ack",
            Classified::Command(_) => "command",
            Classified::Report(_) => "report",
            Classified::Unrecognized => "unrecognized",
        }
    }
}

/// Classify one received record in priority order
pub fn classify(payload: &str) -> Classified {
    if let Some(role) = Role::from_presence_notice(payload) {
        return Classified::Presence(role);
    }

    if payload.contains(ACK) || payload.contains("connected") {
        return Classified::Ack;
    }

    if let Some(cmd) = ActuatorCommand::from_payload(payload) {
        return Classified::Command(cmd);
    }

    if looks_like_report(payload) {
        return Classified::Report(WeatherReport::parse(payload));
    }

    Classified::Unrecognized
}

/// A payload is a report when any report label appears before a colon
fn looks_like_report(payload: &str) -> bool {
    payload.lines().any(|line| {
        line.split_once(':')
            .map(|(key, _)| {
                let key = key.trim();
                REPORT_LABELS.iter().any(|label| key.eq_ignore_ascii_case(label))
            })
            .unwrap_or(false)
    })
}

// ─────────────────────────────────────────────────────────────────
// Weather Report
// ─────────────────────────────────────────────────────────────────

/// Structured weather record bridged to local consumers as one JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub city: String,
    pub weather: String,
    /// Bare numeric string, units stripped (e.g. "21.5")
    pub temperature: String,
    /// Bare numeric string, "%" stripped (e.g. "45")
    pub humidity: String,
}

impl Default for WeatherReport {
    fn default() -> Self {
        Self {
            city: "Unknown".to_string(),
            weather: "Unknown".to_string(),
            temperature: "25.0".to_string(),
            humidity: "60".to_string(),
        }
    }
}

impl WeatherReport {
    /// Parse colon-delimited `label: value` lines into a report.
    ///
    /// Unmatched labels keep their defaults; temperature and humidity are
    /// normalized by stripping every non-numeric character, so "21.5C" and
    /// "45%" come out as "21.5" and "45". A humidity of "N/A" survives
    /// verbatim.
    pub fn parse(text: &str) -> WeatherReport {
        let mut report = WeatherReport::default();

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            if key.eq_ignore_ascii_case("city") {
                report.city = value.to_string();
            } else if key.eq_ignore_ascii_case("weather") {
                report.weather = value.to_string();
            } else if key.eq_ignore_ascii_case("temperature") {
                if let Some(num) = extract_numeric(value) {
                    report.temperature = num;
                }
            } else if key.eq_ignore_ascii_case("humidity") {
                if let Some(num) = extract_numeric(value) {
                    report.humidity = num;
                } else if value.contains("N/A") {
                    report.humidity = "N/A".to_string();
                }
            }
        }

        report
    }

    /// Render as the colon-delimited wire text the provider sends
    pub fn to_wire_text(&self) -> String {
        format!(
            "city: {}\nweather: {}\ntemperature: {}C\nhumidity: {}%\n",
            self.city, self.weather, self.temperature, self.humidity
        )
    }

    /// Serialize as the one-line JSON record written to the report pipe
    pub fn to_json(&self) -> String {
        // A struct of four plain strings cannot fail to serialize
        serde_json::to_string(self).expect("weather report serialization")
    }
}

/// Keep digits, dots and minus signs; None if nothing numeric remains
fn extract_numeric(value: &str) -> Option<String> {
    let num: String = value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if num.is_empty() {
        None
    } else {
        Some(num)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
