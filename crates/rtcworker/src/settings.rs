use std::time::Duration;

use rtcworker_frame::FrameConfig;

use crate::engine::RtcConfiguration;

/// Default period of the buffered-amount sampler.
pub const DEFAULT_BUFFERED_AMOUNT_INTERVAL: Duration = Duration::from_secs(1);

/// Library-level worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Process id announced to the host and reported in dumps.
    pub pid: u32,
    /// Applied to `createHandler` requests that carry no configuration.
    pub rtc_configuration: Option<RtcConfiguration>,
    /// Period of the per-handler buffered-amount sampler.
    pub buffered_amount_interval: Duration,
    pub frame: FrameConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pid: std::process::id(),
            rtc_configuration: None,
            buffered_amount_interval: DEFAULT_BUFFERED_AMOUNT_INTERVAL,
            frame: FrameConfig::default(),
        }
    }
}

/// Errors in launch-time settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid RTCConfiguration: {0}")]
    RtcConfiguration(String),

    #[error("invalid duration \"{0}\"")]
    Duration(String),
}

/// Parse and validate a JSON connection configuration.
pub fn parse_rtc_configuration(input: &str) -> Result<RtcConfiguration, SettingsError> {
    let configuration: RtcConfiguration = serde_json::from_str(input)
        .map_err(|err| SettingsError::RtcConfiguration(err.to_string()))?;
    configuration
        .validate()
        .map_err(SettingsError::RtcConfiguration)?;
    Ok(configuration)
}

/// Parse `500ms`, `2s`, `1m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, SettingsError> {
    let input = input.trim();
    let invalid = || SettingsError::Duration(input.to_string());

    let (number, unit_millis) = if let Some(number) = input.strip_suffix("ms") {
        (number, 1)
    } else if let Some(number) = input.strip_suffix('s') {
        (number, 1_000)
    } else if let Some(number) = input.strip_suffix('m') {
        (number, 60_000)
    } else {
        (input, 1_000)
    };

    let value: u64 = number.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    let millis = value.checked_mul(unit_millis).ok_or_else(invalid)?;
    Ok(Duration::from_millis(millis))
}
