//! Node configuration.

use std::time::Duration;

use prifi_core::CipherRate;
use prifi_proto::ProtocolParams;

/// Runtime configuration shared by every run a node hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Parameters each new run starts with.
    pub params: ProtocolParams,
    /// Delay between trustee ciphers at [`CipherRate::Full`].
    pub full_rate_interval: Duration,
    /// Delay between trustee ciphers at [`CipherRate::Half`].
    pub half_rate_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            params: ProtocolParams::default(),
            full_rate_interval: Duration::from_millis(10),
            half_rate_interval: Duration::from_millis(20),
        }
    }
}

impl NodeConfig {
    /// Delay between ciphers at `rate`, or `None` if the stream is not
    /// producing.
    pub fn interval(&self, rate: CipherRate) -> Option<Duration> {
        match rate {
            CipherRate::Full => Some(self.full_rate_interval),
            CipherRate::Half => Some(self.half_rate_interval),
            CipherRate::Stopped | CipherRate::Kill => None,
        }
    }

    /// Check the configuration before spawning runs.
    pub fn validate(&self) -> Result<(), String> {
        self.params.validate().map_err(str::to_string)?;
        if self.full_rate_interval.is_zero() {
            return Err("full rate interval must be non-zero".to_string());
        }
        if self.half_rate_interval < self.full_rate_interval {
            return Err("half rate interval must not be shorter than the full rate one".to_string());
        }
        Ok(())
    }
}
