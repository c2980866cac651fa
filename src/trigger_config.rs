use std::time::Duration;

use crate::channel_config::{CaptureConfigError, Channel, ChannelScaling};
use crate::native::NativeTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDirection {
    Above,
    Below,
    Rising,
    Falling,
    RisingOrFalling,
}

#[derive(Debug, Clone, Copy)]
pub struct SimpleTriggerBuilder {
    source: Channel,
    delay: u64,
    auto_trigger: Option<Duration>,
}

impl SimpleTriggerBuilder {
    /// Start capturing `samples` after the trigger event.
    pub fn delay(mut self, samples: u64) -> Self {
        self.delay = samples;
        self
    }

    /// Fire anyway when no trigger event happened within `after`.
    pub fn auto_trigger(mut self, after: Duration) -> Self {
        self.auto_trigger = Some(after);
        self
    }

    pub fn rising(self, volts: f64) -> SimpleTrigger {
        self.build(volts, ThresholdDirection::Rising)
    }

    pub fn falling(self, volts: f64) -> SimpleTrigger {
        self.build(volts, ThresholdDirection::Falling)
    }

    pub fn rising_or_falling(self, volts: f64) -> SimpleTrigger {
        self.build(volts, ThresholdDirection::RisingOrFalling)
    }

    /// Level trigger: fires while the signal is above `volts`.
    pub fn above(self, volts: f64) -> SimpleTrigger {
        self.build(volts, ThresholdDirection::Above)
    }

    pub fn below(self, volts: f64) -> SimpleTrigger {
        self.build(volts, ThresholdDirection::Below)
    }

    fn build(self, volts: f64, direction: ThresholdDirection) -> SimpleTrigger {
        SimpleTrigger {
            source: self.source,
            volts,
            direction,
            delay: self.delay,
            auto_trigger: self.auto_trigger,
        }
    }
}

/// Edge or level trigger on one analog channel, threshold in volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleTrigger {
    source: Channel,
    volts: f64,
    direction: ThresholdDirection,
    delay: u64,
    auto_trigger: Option<Duration>,
}

impl SimpleTrigger {
    pub fn on(source: Channel) -> SimpleTriggerBuilder {
        SimpleTriggerBuilder {
            source,
            delay: 0,
            auto_trigger: None,
        }
    }

    pub fn source(&self) -> Channel {
        self.source
    }

    pub fn volts(&self) -> f64 {
        self.volts
    }

    pub fn direction(&self) -> ThresholdDirection {
        self.direction
    }

    /// Convert the threshold into ADC counts of the source channel.
    pub fn into_native(self, scaling: &ChannelScaling) -> Result<NativeTrigger, CaptureConfigError> {
        let threshold = scaling
            .to_adc(self.volts)
            .ok_or(CaptureConfigError::VoltageOutOfRange)?;
        let auto_trigger_us = self
            .auto_trigger
            .map_or(0, |d| u32::try_from(d.as_micros()).unwrap_or(u32::MAX));
        Ok(NativeTrigger {
            source: self.source,
            threshold,
            direction: self.direction,
            delay: self.delay,
            auto_trigger_us,
        })
    }
}
