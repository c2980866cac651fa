use std::collections::BTreeMap;
use std::sync::Arc;

use crate::channel_config::Resolution;
use crate::native::NativeSdk;
use crate::pico_scope::PicoScope;
use crate::status::{check, OpContext, Result, ScopeError};

pub struct ScopeConnector;

impl ScopeConnector {
    /// Connect to the unit with `serial`, or to the first one attached.
    pub fn connect<S: NativeSdk>(
        sdk: Arc<S>,
        serial: Option<&str>,
        resolution: Resolution,
    ) -> Result<PicoScope<S>> {
        if let Some(serial) = serial {
            log::debug!("Connecting to unit {serial}");
            let available = Self::get_available_devices(sdk.as_ref())?;
            if !available.iter().any(|s| s == serial) {
                return Err(ScopeError::DeviceNotResponding {
                    context: OpContext::new("enumerate_units"),
                    reason: format!("unit {serial} not found, attached: {available:?}"),
                });
            }
        }
        PicoScope::open_with_resolution(sdk, serial, resolution)
    }

    /// Serial numbers of every attached unit.
    pub fn get_available_devices<S: NativeSdk>(sdk: &S) -> Result<Vec<String>> {
        let (status, serials) = sdk.enumerate_units();
        check(status, || OpContext::new("enumerate_units"))?;
        log::debug!("Found {} units: {serials:?}", serials.len());
        Ok(serials)
    }
}

/// Open scopes keyed by serial number, at most one per unit.
#[derive(Debug)]
pub struct DeviceRegistry<S: NativeSdk> {
    sdk: Arc<S>,
    scopes: BTreeMap<String, PicoScope<S>>,
}

impl<S: NativeSdk> DeviceRegistry<S> {
    pub fn new(sdk: Arc<S>) -> Self {
        Self {
            sdk,
            scopes: BTreeMap::new(),
        }
    }

    /// Open and register the unit with `serial`.
    pub fn open(&mut self, serial: &str, resolution: Resolution) -> Result<&mut PicoScope<S>> {
        if self.scopes.contains_key(serial) {
            return Err(ScopeError::state(
                OpContext::new("open_unit"),
                format!("unit {serial} is already open"),
            ));
        }
        let scope = ScopeConnector::connect(self.sdk.clone(), Some(serial), resolution)?;
        Ok(self.scopes.entry(serial.to_string()).or_insert(scope))
    }

    pub fn get(&self, serial: &str) -> Option<&PicoScope<S>> {
        self.scopes.get(serial)
    }

    pub fn get_mut(&mut self, serial: &str) -> Option<&mut PicoScope<S>> {
        self.scopes.get_mut(serial)
    }

    pub fn serials(&self) -> impl Iterator<Item = &str> {
        self.scopes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Close and forget one unit. Unknown serials are a no-op.
    pub fn close(&mut self, serial: &str) -> Result<()> {
        match self.scopes.remove(serial) {
            Some(mut scope) => scope.close(),
            None => Ok(()),
        }
    }

    /// Close every unit. All are attempted; the first failure is returned
    /// with the later ones attached.
    pub fn close_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (_, mut scope) in std::mem::take(&mut self.scopes) {
            let closed = scope.close();
            result = match result {
                Ok(()) => closed,
                Err(e) => Err(e.with_cleanup(closed)),
            };
        }
        result
    }
}
