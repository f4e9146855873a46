use std::time::Duration;

use amqchan_frame::{FrameConfig, DEFAULT_CHANNEL_MAX, DEFAULT_FRAME_MAX};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Smallest frame-max a peer may negotiate.
pub const FRAME_MIN_SIZE: usize = 4096;

/// Connection behaviour settings.
///
/// Durations serialize as milliseconds. Missing fields take the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on every synchronous channel exchange. `None` waits forever.
    #[serde(rename = "rpc_timeout_ms", with = "option_millis")]
    pub rpc_timeout: Option<Duration>,
    /// Bound on the `Connection.Close` / `Connection.CloseOk` exchange.
    #[serde(rename = "close_timeout_ms", with = "millis")]
    pub close_timeout: Duration,
    /// Highest channel number the connection will allocate.
    pub channel_max: u16,
    /// Negotiated frame-max, overhead included.
    pub frame_max: usize,
    /// Socket write timeout applied to streams built with `Connection::from_stream`.
    #[serde(rename = "write_timeout_ms", with = "option_millis")]
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Some(Duration::from_secs(30)),
            close_timeout: Duration::from_secs(5),
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: DEFAULT_FRAME_MAX,
            write_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Reject settings the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_max == 0 {
            return Err(ClientError::Config(
                "channel_max must be at least 1".to_string(),
            ));
        }
        if self.frame_max < FRAME_MIN_SIZE {
            return Err(ClientError::Config(format!(
                "frame_max {} is below the protocol minimum {}",
                self.frame_max, FRAME_MIN_SIZE
            )));
        }
        if self.rpc_timeout == Some(Duration::ZERO) {
            return Err(ClientError::Config(
                "rpc_timeout must be non-zero (use null to wait forever)".to_string(),
            ));
        }
        Ok(())
    }

    /// Frame codec settings derived from this config.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            write_timeout: self.write_timeout,
            ..FrameConfig::for_frame_max(self.frame_max)
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
