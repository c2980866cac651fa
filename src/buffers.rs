//! Host-side capture buffers and their binding to device `(channel, segment)` slots.
//!
//! The allocator is an arena: buffers are addressed by [`BufferId`], owned
//! here for their whole life, and lent to the device only for the duration of
//! a data transfer. While a capture session is active the table is locked and
//! every bind or release is refused. A slot holds one primary buffer and, for
//! aggregate downsampling, a second one receiving the bucket minima.

use std::collections::{BTreeMap, HashMap};

use crate::channel_config::{CaptureConfigError, Channel, ChannelFlags, ConfigRegistry, Resolution};
use crate::device_handle::DeviceHandle;
use crate::native::{BufferAction, BufferRole, ChannelTarget, NativeSdk};
use crate::status::{check, OpContext, Result, ScopeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Block,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    id: BufferId,
    channel: Channel,
    segment: u64,
    role: BufferRole,
    mode: CaptureMode,
    sample_width: usize,
    data: Vec<i16>,
    bound: bool,
    /// Samples the device has written since the session started.
    written: u64,
    /// Samples handed to the caller, or skipped as lost.
    read: u64,
}

impl CaptureBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn sample_width(&self) -> usize {
        self.sample_width
    }

    pub fn byte_len(&self) -> usize {
        self.capacity() * self.sample_width
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn samples(&self) -> &[i16] {
        &self.data
    }

    pub fn write_cursor(&self) -> u64 {
        self.written
    }

    pub fn read_cursor(&self) -> u64 {
        self.read
    }

    /// Samples written but not yet handed out. May exceed the capacity, in
    /// which case the oldest ones are already overwritten.
    pub fn unread(&self) -> u64 {
        self.written - self.read
    }

    pub(crate) fn reset_cursors(&mut self) {
        self.written = 0;
        self.read = 0;
    }

    pub(crate) fn advance_write(&mut self, samples: u64) {
        self.written += samples;
    }

    /// Drop samples the device has overwritten. Returns the absolute index of
    /// the first lost sample and how many were lost.
    pub(crate) fn skip_overwritten(&mut self) -> Option<(u64, u64)> {
        let capacity = self.capacity() as u64;
        let lost = self.unread().checked_sub(capacity).filter(|l| *l > 0)?;
        let first = self.read;
        self.read += lost;
        Some((first, lost))
    }

    /// Copy out every unread sample in order and advance the read cursor.
    pub(crate) fn drain_unread(&mut self) -> Vec<i16> {
        let capacity = self.capacity() as u64;
        let unread = self.unread().min(capacity);
        let out = (self.written - unread..self.written)
            .map(|i| self.data[(i % capacity) as usize])
            .collect();
        self.read = self.written;
        out
    }
}

#[derive(Debug, Default)]
pub struct BufferAllocator {
    next_id: u32,
    buffers: BTreeMap<BufferId, CaptureBuffer>,
    bindings: HashMap<(Channel, u64, BufferRole), BufferId>,
    locked: bool,
}

impl BufferAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BufferId) -> Option<&CaptureBuffer> {
        self.buffers.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaptureBuffer> {
        self.buffers.values()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Primary buffer bound to `(channel, segment)`, if any.
    pub fn bound(&self, channel: Channel, segment: u64) -> Option<&CaptureBuffer> {
        self.bound_as(channel, segment, BufferRole::Primary)
    }

    pub fn bound_as(&self, channel: Channel, segment: u64, role: BufferRole) -> Option<&CaptureBuffer> {
        self.bindings
            .get(&(channel, segment, role))
            .and_then(|id| self.buffers.get(id))
    }

    pub(crate) fn bound_mut(
        &mut self,
        channel: Channel,
        segment: u64,
        role: BufferRole,
    ) -> Option<&mut CaptureBuffer> {
        self.bindings
            .get(&(channel, segment, role))
            .and_then(|id| self.buffers.get_mut(id))
    }

    pub fn bound_channels(&self, segment: u64) -> ChannelFlags {
        self.bindings
            .keys()
            .filter(|(_, s, role)| *s == segment && *role == BufferRole::Primary)
            .map(|(c, _, _)| *c)
            .collect()
    }

    /// Reserve `capacity` samples for `channel` in `segment`.
    pub fn allocate(
        &mut self,
        registry: &ConfigRegistry,
        resolution: Resolution,
        channel: Channel,
        segment: u64,
        capacity: usize,
        mode: CaptureMode,
    ) -> Result<BufferId> {
        let slot = (channel, segment, BufferRole::Primary);
        self.allocate_slot(registry, resolution, slot, capacity, mode)
    }

    /// Reserve the buffer receiving bucket minima of an aggregate capture.
    pub fn allocate_min(
        &mut self,
        registry: &ConfigRegistry,
        resolution: Resolution,
        channel: Channel,
        segment: u64,
        capacity: usize,
        mode: CaptureMode,
    ) -> Result<BufferId> {
        let slot = (channel, segment, BufferRole::Min);
        self.allocate_slot(registry, resolution, slot, capacity, mode)
    }

    fn allocate_slot(
        &mut self,
        registry: &ConfigRegistry,
        resolution: Resolution,
        (channel, segment, role): (Channel, u64, BufferRole),
        capacity: usize,
        mode: CaptureMode,
    ) -> Result<BufferId> {
        if capacity == 0 {
            return Err(CaptureConfigError::ZeroCapacity.into());
        }
        if !registry.channel(channel).enabled {
            return Err(CaptureConfigError::ChannelDisabled(channel).into());
        }
        registry.check_segment(segment)?;

        let id = BufferId(self.next_id);
        self.next_id += 1;
        log::debug!(
            "Allocated {role:?} buffer {id} for channel {channel} segment {segment}: {capacity} samples of {} bytes",
            resolution.sample_width()
        );
        self.buffers.insert(
            id,
            CaptureBuffer {
                id,
                channel,
                segment,
                role,
                mode,
                sample_width: resolution.sample_width(),
                data: vec![0; capacity],
                bound: false,
                written: 0,
                read: 0,
            },
        );
        Ok(id)
    }

    /// Register a buffer with the device for its `(channel, segment)`. A
    /// buffer already bound there is unbound but stays allocated.
    pub fn bind<S: NativeSdk>(&mut self, device: &DeviceHandle<S>, id: BufferId) -> Result<()> {
        let handle = device.raw("set_data_buffer")?;
        if self.locked {
            return Err(ScopeError::state(
                OpContext::on("set_data_buffer", handle),
                "buffers cannot be bound while a capture is active",
            ));
        }
        let buffer = self.buffers.get(&id).ok_or_else(|| {
            ScopeError::invalid(OpContext::on("set_data_buffer", handle), format!("unknown buffer {id}"))
        })?;
        let (channel, segment, role) = (buffer.channel, buffer.segment, buffer.role);
        let status = device.sdk().set_data_buffer(
            handle,
            channel,
            segment,
            role,
            buffer.capacity(),
            buffer.sample_width,
            BufferAction::Add,
        );
        check(status, || OpContext::on("set_data_buffer", handle).with_channel(channel))?;

        if let Some(previous) = self.bindings.insert((channel, segment, role), id) {
            if previous != id {
                log::debug!("Buffer {previous} replaced by {id} on channel {channel}");
                if let Some(old) = self.buffers.get_mut(&previous) {
                    old.bound = false;
                }
            }
        }
        if let Some(buffer) = self.buffers.get_mut(&id) {
            buffer.bound = true;
        }
        Ok(())
    }

    /// Unbind and free a buffer. Releasing an unknown or already released
    /// buffer is a no-op.
    pub fn release<S: NativeSdk>(&mut self, device: &DeviceHandle<S>, id: BufferId) -> Result<()> {
        if !self.buffers.contains_key(&id) {
            return Ok(());
        }
        if self.locked {
            return Err(ScopeError::state(
                OpContext::new("release_buffer"),
                "buffers cannot be released while a capture is active",
            ));
        }
        self.unbind(device, id)?;
        self.buffers.remove(&id);
        log::debug!("Released buffer {id}");
        Ok(())
    }

    /// Release every buffer. A failure does not stop the rest from being
    /// released; all failures are reported, the first one as the error.
    pub fn release_all<S: NativeSdk>(&mut self, device: &DeviceHandle<S>) -> Result<()> {
        let ids: Vec<BufferId> = self.buffers.keys().copied().collect();
        let mut result = Ok(());
        for id in ids {
            let step = self.release(device, id);
            if let Err(e) = &step {
                log::warn!("Failed to release buffer {id}: {e}");
            }
            result = match result {
                Ok(()) => step,
                Err(e) => Err(e.with_cleanup(step)),
            };
        }
        result
    }

    fn unbind<S: NativeSdk>(&mut self, device: &DeviceHandle<S>, id: BufferId) -> Result<()> {
        let Some(buffer) = self.buffers.get_mut(&id) else {
            return Ok(());
        };
        if !buffer.bound {
            return Ok(());
        }
        let (channel, segment, role) = (buffer.channel, buffer.segment, buffer.role);
        buffer.bound = false;
        self.bindings.remove(&(channel, segment, role));
        // A closed handle has already dropped every registration.
        if let Ok(handle) = device.raw("set_data_buffer") {
            let status = device.sdk().set_data_buffer(
                handle,
                channel,
                segment,
                role,
                0,
                buffer.sample_width,
                BufferAction::Clear,
            );
            check(status, || OpContext::on("set_data_buffer", handle).with_channel(channel))?;
        }
        Ok(())
    }

    /// Hand every buffer bound in `segment` back to the device so it
    /// continues writing from index 0.
    pub(crate) fn reload<S: NativeSdk>(&mut self, device: &DeviceHandle<S>, segment: u64) -> Result<()> {
        let handle = device.raw("set_data_buffer")?;
        for buffer in self.buffers.values().filter(|b| b.bound && b.segment == segment) {
            let status = device.sdk().set_data_buffer(
                handle,
                buffer.channel,
                segment,
                buffer.role,
                buffer.capacity(),
                buffer.sample_width,
                BufferAction::Add,
            );
            check(status, || {
                OpContext::on("set_data_buffer", handle).with_channel(buffer.channel)
            })?;
        }
        Ok(())
    }

    /// Lend the buffers of `channels` bound in `segment` to a native call.
    /// `Min` buffers are only lent when the call fills them.
    pub(crate) fn targets(
        &mut self,
        segment: u64,
        channels: ChannelFlags,
        with_min: bool,
    ) -> Vec<ChannelTarget<'_>> {
        self.buffers
            .values_mut()
            .filter(|b| b.bound && b.segment == segment && channels.contains(b.channel))
            .filter(|b| with_min || b.role == BufferRole::Primary)
            .map(|b| ChannelTarget {
                channel: b.channel,
                role: b.role,
                samples: &mut b.data,
            })
            .collect()
    }

    pub(crate) fn lock(&mut self, segment: u64) {
        self.locked = true;
        for buffer in self.buffers.values_mut().filter(|b| b.bound && b.segment == segment) {
            buffer.reset_cursors();
        }
    }

    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }

    /// Unread samples still held for `segment`, summed over channels.
    pub(crate) fn unread_in(&self, segment: u64) -> u64 {
        self.buffers
            .values()
            .filter(|b| b.bound && b.segment == segment && b.role == BufferRole::Primary)
            .map(|b| b.unread().min(b.capacity() as u64))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_config::ChannelConfig;
    use crate::sim::{SimConfig, SimFault, SimulatedSdk};
    use crate::status::ErrorKind;
    use std::sync::Arc;

    fn setup(config: SimConfig) -> (Arc<SimulatedSdk>, DeviceHandle<SimulatedSdk>, ConfigRegistry) {
        let sdk = Arc::new(SimulatedSdk::new(config));
        let device = DeviceHandle::open(sdk.clone(), None, Resolution::Bits8).unwrap();
        let mut registry = ConfigRegistry::new();
        registry
            .set_channel(&device, ChannelConfig::new(Channel::A))
            .unwrap();
        (sdk, device, registry)
    }

    #[test]
    fn test_allocate_rejects_zero_and_disabled() {
        let (_sdk, _device, registry) = setup(SimConfig::default());
        let mut alloc = BufferAllocator::new();
        let err = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 0, CaptureMode::Block)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = alloc
            .allocate(&registry, Resolution::Bits8, Channel::B, 0, 10, CaptureMode::Block)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 1, 10, CaptureMode::Block)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(alloc.is_empty());
    }

    #[test]
    fn test_bind_rejected_by_device_is_hardware_fault() {
        let (_sdk, device, registry) = setup(SimConfig::default().max_buffer_bytes(16));
        let mut alloc = BufferAllocator::new();
        let id = alloc
            .allocate(&registry, Resolution::Bits10, Channel::A, 0, 9, CaptureMode::Block)
            .unwrap();
        assert_eq!(alloc.get(id).unwrap().byte_len(), 18);
        let err = alloc.bind(&device, id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(!alloc.get(id).unwrap().is_bound());
    }

    #[test]
    fn test_rebind_replaces_previous() {
        let (sdk, device, registry) = setup(SimConfig::default());
        let mut alloc = BufferAllocator::new();
        let first = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 10, CaptureMode::Block)
            .unwrap();
        let second = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 20, CaptureMode::Block)
            .unwrap();
        alloc.bind(&device, first).unwrap();
        alloc.bind(&device, second).unwrap();
        assert!(!alloc.get(first).unwrap().is_bound());
        assert_eq!(alloc.bound(Channel::A, 0).unwrap().id(), second);
        assert_eq!(sdk.bound_buffers("SIM0001"), 1);
    }

    #[test]
    fn test_locked_table_refuses_changes() {
        let (_sdk, device, registry) = setup(SimConfig::default());
        let mut alloc = BufferAllocator::new();
        let id = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 10, CaptureMode::Streaming)
            .unwrap();
        alloc.bind(&device, id).unwrap();
        alloc.lock(0);
        assert_eq!(alloc.bind(&device, id).unwrap_err().kind(), ErrorKind::StateViolation);
        assert_eq!(alloc.release(&device, id).unwrap_err().kind(), ErrorKind::StateViolation);
        alloc.unlock();
        alloc.release(&device, id).unwrap();
    }

    #[test]
    fn test_release_is_idempotent() {
        let (sdk, device, registry) = setup(SimConfig::default());
        let mut alloc = BufferAllocator::new();
        let id = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 10, CaptureMode::Block)
            .unwrap();
        alloc.bind(&device, id).unwrap();
        alloc.release(&device, id).unwrap();
        alloc.release(&device, id).unwrap();
        assert!(alloc.get(id).is_none());
        assert_eq!(sdk.bound_buffers("SIM0001"), 0);
    }

    #[test]
    fn test_circular_drain_and_overwrite() {
        let (_sdk, device, registry) = setup(SimConfig::default());
        let mut alloc = BufferAllocator::new();
        let id = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 4, CaptureMode::Streaming)
            .unwrap();
        alloc.bind(&device, id).unwrap();
        {
            let mut targets = alloc.targets(0, Channel::A.flag(), false);
            targets[0].samples.copy_from_slice(&[10, 11, 12, 13]);
        }
        let buffer = alloc.bound_mut(Channel::A, 0, BufferRole::Primary).unwrap();
        buffer.advance_write(3);
        assert_eq!(buffer.drain_unread(), vec![10, 11, 12]);
        buffer.advance_write(7);
        assert_eq!(buffer.skip_overwritten(), Some((3, 3)));
        assert_eq!(buffer.unread(), 4);
        assert_eq!(buffer.drain_unread(), vec![12, 13, 10, 11]);
    }

    #[test]
    fn test_min_buffer_shares_the_slot() {
        let (sdk, device, registry) = setup(SimConfig::default());
        let mut alloc = BufferAllocator::new();
        let max = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 10, CaptureMode::Block)
            .unwrap();
        let min = alloc
            .allocate_min(&registry, Resolution::Bits8, Channel::A, 0, 10, CaptureMode::Block)
            .unwrap();
        alloc.bind(&device, max).unwrap();
        alloc.bind(&device, min).unwrap();
        assert!(alloc.get(max).unwrap().is_bound());
        assert_eq!(alloc.bound(Channel::A, 0).unwrap().id(), max);
        assert_eq!(alloc.bound_as(Channel::A, 0, BufferRole::Min).unwrap().id(), min);
        assert_eq!(alloc.bound_channels(0).count(), 1);
        assert_eq!(sdk.bound_buffers("SIM0001"), 2);
        assert_eq!(alloc.targets(0, Channel::A.flag(), false).len(), 1);
        assert_eq!(alloc.targets(0, Channel::A.flag(), true).len(), 2);
    }

    #[test]
    fn test_release_all_continues_past_failures() {
        let (sdk, device, mut registry) =
            setup(SimConfig::default().fault(SimFault::ClearFails { channel: Channel::A }));
        registry
            .set_channel(&device, ChannelConfig::new(Channel::B))
            .unwrap();
        let mut alloc = BufferAllocator::new();
        let a = alloc
            .allocate(&registry, Resolution::Bits8, Channel::A, 0, 10, CaptureMode::Block)
            .unwrap();
        let b = alloc
            .allocate(&registry, Resolution::Bits8, Channel::B, 0, 10, CaptureMode::Block)
            .unwrap();
        alloc.bind(&device, a).unwrap();
        alloc.bind(&device, b).unwrap();

        let err = alloc.release_all(&device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
        assert!(alloc.get(b).is_none());
        assert!(alloc.bound(Channel::B, 0).is_none());
        // Only the registration the device refused to drop is left.
        assert_eq!(sdk.bound_buffers("SIM0001"), 1);
    }
}
