//! Weather provider role
//!
//! Connects to the broker under the Provider role, answers city queries from
//! the console, and feeds weather reports into the relay. Reports come from
//! an HTTP weather API (seniverse-style `now.json`); the interesting fields
//! are pulled out of the JSON response and rendered as the colon-delimited
//! report text the rest of the system classifies.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointConfig, EndpointEvent, EndpointHandle, EndpointState};
use crate::error::{Error, Result};
use crate::protocol::{Role, WeatherReport};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Weather API and provider behavior settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API base URL (e.g. "https://api.seniverse.com/v3")
    pub api_base_url: String,

    /// API key
    pub api_key: String,

    /// City queried until the console sends an update
    pub default_city: String,

    /// Response language code
    pub language: String,

    /// Temperature unit ("c" or "f")
    pub unit: String,

    /// Attempts per fetch before giving up and relaying an error text
    pub fetch_retries: u32,

    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.seniverse.com/v3".to_string(),
            api_key: String::new(),
            default_city: "guangzhou".to_string(),
            language: "zh-Hans".to_string(),
            unit: "c".to_string(),
            fetch_retries: 3,
            timeout_secs: 10,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Weather API Client
// ─────────────────────────────────────────────────────────────────

/// Thin client over the weather HTTP API
pub struct WeatherApi {
    client: Client,
    config: ProviderConfig,
}

impl WeatherApi {
    /// Build the HTTP client
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("wxrelay/0.1")
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Fetch current weather for a city
    pub async fn fetch_current(&self, city: &str) -> Result<WeatherReport> {
        let url = format!("{}/weather/now.json", self.config.api_base_url);
        debug!(city = %city, url = %url, "Fetching weather");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("location", city),
                ("language", self.config.language.as_str()),
                ("unit", self.config.unit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::weather_fetch(city, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::weather_fetch(
                city,
                format!("HTTP status {}", response.status()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::weather_fetch(city, e.to_string()))?;

        parse_now_response(&body)
    }
}

/// Pull the report fields out of a `now.json` response body
fn parse_now_response(body: &Value) -> Result<WeatherReport> {
    let entry = body
        .get("results")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .ok_or_else(|| Error::WeatherParse {
            message: "no results entry".to_string(),
        })?;

    let city = entry
        .pointer("/location/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::WeatherParse {
            message: "missing location name".to_string(),
        })?;

    let now = entry.get("now").ok_or_else(|| Error::WeatherParse {
        message: "missing now block".to_string(),
    })?;

    let weather = now
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::WeatherParse {
            message: "missing weather text".to_string(),
        })?;

    let temperature = now
        .get("temperature")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::WeatherParse {
            message: "missing temperature".to_string(),
        })?;

    // Humidity is absent on some API tiers, and shows up as either a string
    // or a number when present
    let humidity = match now.get("humidity") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "N/A".to_string(),
    };

    Ok(WeatherReport {
        city: city.to_string(),
        weather: weather.to_string(),
        temperature: temperature.to_string(),
        humidity,
    })
}

// ─────────────────────────────────────────────────────────────────
// Provider Loop
// ─────────────────────────────────────────────────────────────────

/// Run the provider role until ctrl-c
pub async fn run(provider_config: ProviderConfig, mut endpoint_config: EndpointConfig) -> Result<()> {
    endpoint_config.role = Role::Provider;
    let api = WeatherApi::new(provider_config.clone())?;

    let endpoint = Endpoint::new(endpoint_config, None);
    let (handle, mut events) = endpoint.start();

    let mut current_city = provider_config.default_city.clone();
    info!(city = %current_city, "Provider started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                handle.stop();
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    info!("Endpoint event channel closed");
                    break;
                };

                match event {
                    EndpointEvent::StateChanged(EndpointState::Connected) => {
                        fetch_and_relay(&api, &handle, &current_city, provider_config.fetch_retries).await;
                    }

                    EndpointEvent::StateChanged(EndpointState::Error) => {
                        warn!("Endpoint gave up reconnecting, exiting");
                        break;
                    }

                    EndpointEvent::StateChanged(state) => {
                        debug!(state = ?state, "Endpoint state");
                    }

                    EndpointEvent::PeerPresent(peer) => {
                        // A freshly joined peer gets the current report
                        info!(peer = %peer, "Peer joined, re-sending current report");
                        fetch_and_relay(&api, &handle, &current_city, provider_config.fetch_retries).await;
                    }

                    EndpointEvent::Unrecognized(text) => {
                        // Console city updates arrive as plain text
                        let city = text.trim();
                        if city.is_empty() {
                            continue;
                        }
                        info!(city = %city, "City update from console");
                        current_city = city.to_string();
                        fetch_and_relay(&api, &handle, &current_city, provider_config.fetch_retries).await;
                    }

                    EndpointEvent::CommandReceived(_) | EndpointEvent::ReportReceived(_) => {
                        // Not the provider's traffic; ignore
                    }
                }
            }
        }
    }

    Ok(())
}

/// Fetch with bounded retries and relay the report (or an error text)
async fn fetch_and_relay(api: &WeatherApi, handle: &EndpointHandle, city: &str, retries: u32) {
    for attempt in 1..=retries.max(1) {
        match api.fetch_current(city).await {
            Ok(report) => {
                info!(city = %report.city, weather = %report.weather, "Weather fetched");
                if let Err(e) = handle.send_command(&report.to_wire_text()).await {
                    warn!(error = %e, "Failed to relay report");
                }
                return;
            }
            Err(e) => {
                warn!(city = %city, attempt, error = %e, "Weather fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    let message = format!(
        "Weather lookup for {} failed; check that the city name is correct",
        city
    );
    if let Err(e) = handle.send_command(&message).await {
        warn!(error = %e, "Failed to relay fetch-error text");
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_config_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.default_city, "guangzhou");
        assert_eq!(config.fetch_retries, 3);
        assert!(config.api_base_url.contains("seniverse"));
    }

    #[test]
    fn test_parse_now_response() {
        let body = json!({
            "results": [{
                "location": {"name": "Guangzhou"},
                "now": {"text": "Sunny", "temperature": "28", "humidity": "70"},
                "last_update": "2024-05-01T12:00:00+08:00"
            }]
        });

        let report = parse_now_response(&body).unwrap();
        assert_eq!(report.city, "Guangzhou");
        assert_eq!(report.weather, "Sunny");
        assert_eq!(report.temperature, "28");
        assert_eq!(report.humidity, "70");
    }

    #[test]
    fn test_parse_numeric_humidity() {
        let body = json!({
            "results": [{
                "location": {"name": "Oslo"},
                "now": {"text": "Cloudy", "temperature": "8", "humidity": 81}
            }]
        });

        let report = parse_now_response(&body).unwrap();
        assert_eq!(report.humidity, "81");
    }

    #[test]
    fn test_parse_missing_humidity_defaults() {
        let body = json!({
            "results": [{
                "location": {"name": "Lima"},
                "now": {"text": "Fog", "temperature": "17"}
            }]
        });

        let report = parse_now_response(&body).unwrap();
        assert_eq!(report.humidity, "N/A");
    }

    #[test]
    fn test_parse_rejects_empty_results() {
        let body = json!({"results": []});
        assert!(parse_now_response(&body).is_err());

        let body = json!({"status": "API key invalid"});
        assert!(parse_now_response(&body).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let body = json!({
            "results": [{
                "location": {"name": "Quito"},
                "now": {"text": "Rain"}
            }]
        });
        assert!(parse_now_response(&body).is_err());
    }

    #[test]
    fn test_report_wire_text_classifies_back() {
        let report = WeatherReport {
            city: "Guangzhou".to_string(),
            weather: "Sunny".to_string(),
            temperature: "28".to_string(),
            humidity: "70".to_string(),
        };
        let text = report.to_wire_text();

        match crate::protocol::classify(&text) {
            crate::protocol::Classified::Report(parsed) => assert_eq!(parsed, report),
            other => panic!("expected report, got {:?}", other),
        }
    }
}
