use serde::{Deserialize, Serialize};

/// Advertised name of the peripheral the original firmware ships with.
pub const DEFAULT_DEVICE_NAME: &str = "ESP32 HeartRate";

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Advertised name the scanner matches peripherals against.
    pub device_name: String,
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn round_trips_camel_case_keys() {
        let config: Config =
            serde_json::from_str(r#"{"deviceName":"Polar H10","connectTimeoutSecs":5}"#).unwrap();
        assert_eq!(config.device_name, "Polar H10");
        assert_eq!(config.connect_timeout_secs, 5);
    }
}
