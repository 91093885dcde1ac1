//! Link profiles.

use std::time::Duration;

use crate::LinkError;

/// Default loss probability.
pub const DEFAULT_LOSS_RATE: f64 = 0.0;

/// Default one-way propagation delay.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1);

/// Default bandwidth in bytes per second.
pub const DEFAULT_BANDWIDTH: u64 = 10_000;

/// Default buffering budget.
pub const DEFAULT_BUFFER_TIME: Duration = Duration::from_millis(250);

/// Physical characteristics of a link.
///
/// Updating a link's profile does not recreate the link or reset its queue
/// clocks.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LinkProfile {
    /// Probability in `[0, 1]` that an admitted packet is lost.
    pub loss_rate: f64,
    /// Propagation delay added after serialization.
    #[cfg_attr(feature = "serde", serde(rename = "delay_ms", with = "millis"))]
    pub delay: Duration,
    /// Bytes per second; must be positive.
    pub bandwidth: u64,
    /// Longest a packet may wait (queueing plus serialization) before it is
    /// refused at admission.
    #[cfg_attr(feature = "serde", serde(rename = "buffer_time_ms", with = "millis"))]
    pub buffer_time: Duration,
}

impl Default for LinkProfile {
    fn default() -> Self {
        LinkProfile {
            loss_rate: DEFAULT_LOSS_RATE,
            delay: DEFAULT_DELAY,
            bandwidth: DEFAULT_BANDWIDTH,
            buffer_time: DEFAULT_BUFFER_TIME,
        }
    }
}

impl LinkProfile {
    /// Create a validated profile.
    pub fn new(
        loss_rate: f64,
        delay: Duration,
        bandwidth: u64,
        buffer_time: Duration,
    ) -> Result<Self, LinkError> {
        let profile = LinkProfile {
            loss_rate,
            delay,
            bandwidth,
            buffer_time,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Set the loss rate.
    pub fn with_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate;
        self
    }

    /// Set the propagation delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the bandwidth in bytes per second.
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Set the buffering budget.
    pub fn with_buffer_time(mut self, buffer_time: Duration) -> Self {
        self.buffer_time = buffer_time;
        self
    }

    /// Check the profile's invariants.
    pub fn validate(&self) -> Result<(), LinkError> {
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(LinkError::InvalidLossRate(self.loss_rate));
        }
        if self.bandwidth == 0 {
            return Err(LinkError::ZeroBandwidth);
        }
        Ok(())
    }

    /// Serialization time for `size` bytes, in whole microseconds.
    pub fn serialization_micros(&self, size: usize) -> u64 {
        size as u64 * 1_000_000 / self.bandwidth
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let profile = LinkProfile::default();
        assert_eq!(profile.loss_rate, 0.0);
        assert_eq!(profile.delay, Duration::from_millis(1));
        assert_eq!(profile.bandwidth, 10_000);
        assert_eq!(profile.buffer_time, Duration::from_millis(250));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            LinkProfile::default().with_loss_rate(1.5).validate(),
            Err(LinkError::InvalidLossRate(1.5))
        );
        assert_eq!(
            LinkProfile::default().with_bandwidth(0).validate(),
            Err(LinkError::ZeroBandwidth)
        );
        assert!(LinkProfile::new(1.0, Duration::ZERO, 1, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_serialization_time() {
        let profile = LinkProfile::default().with_bandwidth(1_000);
        assert_eq!(profile.serialization_micros(1_000), 1_000_000);
        assert_eq!(profile.serialization_micros(1), 1_000);
        // Integer division truncates
        let profile = LinkProfile::default().with_bandwidth(3);
        assert_eq!(profile.serialization_micros(1), 333_333);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_yaml_profile_uses_milliseconds() {
        let profile: LinkProfile =
            serde_yaml::from_str("loss_rate: 0.25\ndelay_ms: 10\nbandwidth: 500\n").unwrap();
        assert_eq!(profile.loss_rate, 0.25);
        assert_eq!(profile.delay, Duration::from_millis(10));
        assert_eq!(profile.bandwidth, 500);
        assert_eq!(profile.buffer_time, DEFAULT_BUFFER_TIME);
    }
}
