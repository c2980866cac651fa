use std::sync::Arc;

use crate::channel_config::{Coupling, Resolution, VoltageRange};
use crate::native::{NativeSdk, RawHandle, UnitInfo};
use crate::status::{check, OpContext, PicoStatus, Result, ScopeError};

/// One open connection to a physical instrument.
///
/// Closing is idempotent and also happens on drop. Every accessor that needs
/// the native handle goes through [`DeviceHandle::raw`], so no call reaches
/// the library once the handle is closed.
#[derive(Debug)]
pub struct DeviceHandle<S: NativeSdk> {
    sdk: Arc<S>,
    raw: RawHandle,
    serial: String,
    resolution: Resolution,
    open: bool,
}

impl<S: NativeSdk> DeviceHandle<S> {
    /// Open the unit with `serial`, or the first unit found.
    pub fn open(sdk: Arc<S>, serial: Option<&str>, resolution: Resolution) -> Result<Self> {
        log::debug!("Opening unit {} at {resolution}", serial.unwrap_or("<first found>"));
        let (status, raw) = sdk.open_unit(serial, resolution);
        check(status, || OpContext::new("open_unit"))?;
        match raw {
            0 => {
                return Err(ScopeError::DeviceNotResponding {
                    context: OpContext::new("open_unit"),
                    reason: format!("no unit {} found", serial.unwrap_or("")),
                })
            }
            r if r < 0 => {
                return Err(ScopeError::HardwareFault {
                    context: OpContext::on("open_unit", r),
                    status: PicoStatus::OPERATION_FAILED,
                })
            }
            _ => {}
        }

        let (status, serial) = sdk.get_unit_info(raw, UnitInfo::BatchAndSerial);
        if let Err(e) = check(status, || OpContext::on("get_unit_info", raw)) {
            let cleanup = check(sdk.close_unit(raw), || OpContext::on("close_unit", raw));
            return Err(e.with_cleanup(cleanup));
        }
        log::debug!("Opened unit {serial} as handle {raw}");

        Ok(Self {
            sdk,
            raw,
            serial,
            resolution,
            open: true,
        })
    }

    /// The native handle, or `InvalidArgument` once closed.
    pub fn raw(&self, operation: &'static str) -> Result<RawHandle> {
        if self.open {
            Ok(self.raw)
        } else {
            Err(ScopeError::invalid(
                OpContext::on(operation, self.raw),
                "device handle is closed",
            ))
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub(crate) fn sdk(&self) -> &S {
        &self.sdk
    }

    pub(crate) fn shared_sdk(&self) -> &Arc<S> {
        &self.sdk
    }

    /// Change the ADC resolution. Callers make sure no capture is running.
    pub(crate) fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        let handle = self.raw("set_device_resolution")?;
        log::debug!("Switching {} to {resolution}", self.serial);
        check(self.sdk.set_device_resolution(handle, resolution), || {
            OpContext::on("set_device_resolution", handle)
        })?;
        self.resolution = resolution;
        Ok(())
    }

    /// Minimum and maximum ADC counts at the current resolution.
    pub fn adc_limits(&self) -> Result<(i16, i16)> {
        let handle = self.raw("get_adc_limits")?;
        let (status, min, max) = self.sdk.get_adc_limits(handle, self.resolution);
        check(status, || OpContext::on("get_adc_limits", handle))?;
        Ok((min, max))
    }

    pub fn unit_info(&self, info: UnitInfo) -> Result<String> {
        let handle = self.raw("get_unit_info")?;
        let (status, value) = self.sdk.get_unit_info(handle, info);
        check(status, || OpContext::on("get_unit_info", handle))?;
        Ok(value)
    }

    pub fn ping(&self) -> Result<()> {
        let handle = self.raw("ping_unit")?;
        check(self.sdk.ping_unit(handle), || OpContext::on("ping_unit", handle))
    }

    pub fn analog_offset_limits(&self, range: VoltageRange, coupling: Coupling) -> Result<(f64, f64)> {
        let handle = self.raw("get_analogue_offset_limits")?;
        let (status, min, max) = self.sdk.get_analogue_offset_limits(handle, range, coupling);
        check(status, || OpContext::on("get_analogue_offset_limits", handle))?;
        Ok((min, max))
    }

    /// Release the native handle. A no-op on a closed handle.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        log::debug!("Closing unit {} (handle {})", self.serial, self.raw);
        self.open = false;
        check(self.sdk.close_unit(self.raw), || OpContext::on("close_unit", self.raw))
    }
}

impl<S: NativeSdk> Drop for DeviceHandle<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close unit {}: {e}", self.serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedSdk};
    use crate::status::ErrorKind;

    #[test]
    fn test_open_and_close_is_idempotent() {
        let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
        let mut handle = DeviceHandle::open(sdk.clone(), None, Resolution::Bits8).unwrap();
        assert!(handle.is_open());
        assert_eq!(handle.serial(), "SIM0001");
        handle.close().unwrap();
        handle.close().unwrap();
        assert!(!handle.is_open());
        assert_eq!(sdk.open_units(), 0);
    }

    #[test]
    fn test_open_unknown_serial() {
        let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
        let err = DeviceHandle::open(sdk, Some("NOPE"), Resolution::Bits8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotResponding);
    }

    #[test]
    fn test_closed_handle_refuses_calls() {
        let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
        let mut handle = DeviceHandle::open(sdk, None, Resolution::Bits8).unwrap();
        handle.close().unwrap();
        let err = handle.ping().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_drop_closes_unit() {
        let sdk = Arc::new(SimulatedSdk::new(SimConfig::default()));
        {
            let _handle = DeviceHandle::open(sdk.clone(), None, Resolution::Bits8).unwrap();
            assert_eq!(sdk.open_units(), 1);
        }
        assert_eq!(sdk.open_units(), 0);
    }
}
