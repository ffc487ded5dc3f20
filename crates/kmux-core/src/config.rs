//! Connection and admission configuration.
//!
//! [`MuxConfig`] is serde-friendly so hosts can load it from JSON. Missing
//! fields fall back to the defaults in [`crate::constants`], and durations are
//! written as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNECTION_WINDOW, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_INITIAL_STREAM_WINDOW,
    DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_REQUEST_HEADERS_TIMEOUT, DEFAULT_REQUEST_QUEUE_LIMIT, DEFAULT_SHUTDOWN_TIMEOUT,
    MAX_WINDOW_SIZE,
};
use crate::error::{Error, Result};
use crate::timeout::MinDataRate;

/// Per-reason timeout durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle time with no request streams before the connection stops.
    #[serde(with = "duration_millis")]
    pub keep_alive: Duration,
    /// Time allowed for the peer to complete its SETTINGS preamble.
    #[serde(with = "duration_millis")]
    pub request_headers: Duration,
    /// Minimum rate for data received from the peer. `None` disables it.
    pub min_request_body_data_rate: Option<MinDataRate>,
    /// Minimum rate for data consumed by the peer. `None` disables it.
    pub min_response_data_rate: Option<MinDataRate>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let rate = MinDataRate::default();
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE_TIMEOUT,
            request_headers: DEFAULT_REQUEST_HEADERS_TIMEOUT,
            min_request_body_data_rate: Some(rate),
            min_response_data_rate: Some(rate),
        }
    }
}

/// Request admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests processed at once.
    pub max_concurrent_requests: usize,
    /// Requests allowed to wait for a slot.
    pub request_queue_limit: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            request_queue_limit: DEFAULT_REQUEST_QUEUE_LIMIT,
        }
    }
}

/// Configuration for a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Request streams processed concurrently on one connection.
    pub max_concurrent_streams: u32,
    /// Initial send window for each stream.
    pub initial_stream_window: u32,
    /// Connection-level send window.
    pub connection_window: u32,
    /// Interval between heartbeat ticks.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    /// Time given to in-flight streams after a graceful shutdown starts.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
    /// Timeout settings.
    pub timeouts: TimeoutConfig,
    /// Admission settings.
    pub admission: AdmissionConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            initial_stream_window: DEFAULT_INITIAL_STREAM_WINDOW,
            connection_window: DEFAULT_CONNECTION_WINDOW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            timeouts: TimeoutConfig::default(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Parse from JSON, filling missing fields with defaults, and validate.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the per-connection stream limit.
    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Set the initial stream and connection windows.
    pub fn with_windows(mut self, stream: u32, connection: u32) -> Self {
        self.initial_stream_window = stream;
        self.connection_window = connection;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the keep-alive timeout.
    pub fn with_keep_alive(mut self, timeout: Duration) -> Self {
        self.timeouts.keep_alive = timeout;
        self
    }

    /// Set the request headers timeout.
    pub fn with_request_headers_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_headers = timeout;
        self
    }

    /// Set both minimum data rates. `None` disables rate enforcement.
    pub fn with_min_data_rates(
        mut self,
        request_body: Option<MinDataRate>,
        response: Option<MinDataRate>,
    ) -> Self {
        self.timeouts.min_request_body_data_rate = request_body;
        self.timeouts.min_response_data_rate = response;
        self
    }

    /// Set admission limits.
    pub fn with_admission(mut self, max_concurrent_requests: usize, request_queue_limit: usize) -> Self {
        self.admission = AdmissionConfig {
            max_concurrent_requests,
            request_queue_limit,
        };
        self
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        fn invalid(message: impl Into<String>) -> Result<()> {
            Err(Error::InvalidConfig {
                message: message.into(),
            })
        }

        if self.max_concurrent_streams == 0 {
            return invalid("max_concurrent_streams must be at least 1");
        }
        if self.admission.max_concurrent_requests == 0 {
            return invalid("max_concurrent_requests must be at least 1");
        }
        if self.heartbeat_interval.is_zero() {
            return invalid("heartbeat_interval must be non-zero");
        }
        for (name, window) in [
            ("initial_stream_window", self.initial_stream_window),
            ("connection_window", self.connection_window),
        ] {
            if window > MAX_WINDOW_SIZE as u32 {
                return invalid(format!("{name} exceeds {MAX_WINDOW_SIZE}"));
            }
        }
        for (name, rate) in [
            ("min_request_body_data_rate", &self.timeouts.min_request_body_data_rate),
            ("min_response_data_rate", &self.timeouts.min_response_data_rate),
        ] {
            if let Some(rate) = rate
                && rate.validate().is_err()
            {
                return invalid(format!("{name} must be a positive number of bytes per second"));
            }
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
