// Licensed under the Apache-2.0 license

//! Live view of the targets on the bus.
//!
//! Every operation holds the table lock for its whole duration, including the
//! insertion callback. The callback must not call back into the table.

use crate::error::{UsbI3cResult, ValidationError};
use crate::lock;
use log::debug;
use std::sync::Mutex;
use usbi3c_common::codec::{CodecError, UsbI3cCodec};
use usbi3c_common::message::capability::{I3cCapability, TargetCapabilityEntry};
use usbi3c_common::message::target_config::{TargetConfigBits, TargetConfigBuffer, TargetConfigEntry};
use usbi3c_common::message::target_table::{TargetDeviceTableBuffer, TargetTableEntry};
pub use usbi3c_common::message::target_table::TargetType;
use usbi3c_common::protocol::command::MAX_TARGET_ADDRESS;

/// BCR[7:6] value of a device that can take over the controller role.
const BCR_ROLE_CONTROLLER: u8 = 0b01;

pub type InsertCallback = Box<dyn FnMut(u8) + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetCapability {
    pub handoff_controller_role: bool,
    /// 0 when the target has no static address.
    pub static_address: u8,
    pub ibi_prioritization: u8,
    pub disco_version: u16,
    pub max_ibi_pending_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetConfig {
    pub target_interrupt_request: bool,
    pub controller_role_request: bool,
    pub ibi_timestamp: bool,
}

impl From<TargetConfigBits> for TargetConfig {
    fn from(bits: TargetConfigBits) -> Self {
        TargetConfig {
            target_interrupt_request: bits.target_interrupt_request(),
            controller_role_request: bits.controller_role_request(),
            ibi_timestamp: bits.ibi_timestamp(),
        }
    }
}

impl From<TargetConfig> for TargetConfigBits {
    fn from(config: TargetConfig) -> Self {
        let mut bits = TargetConfigBits(0);
        bits.set_target_interrupt_request(config.target_interrupt_request);
        bits.set_controller_role_request(config.controller_role_request);
        bits.set_ibi_timestamp(config.ibi_timestamp);
        bits
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDevice {
    /// Dynamic address; 0 until one is assigned.
    pub target_address: u8,
    pub pid_hi: u16,
    pub pid_lo: u32,
    pub target_type: TargetType,
    pub dcr: u8,
    pub bcr: u8,
    pub capability: TargetCapability,
    pub config: TargetConfig,
    pub max_ibi_payload_size: u32,
    /// Set only when a non-zero provisioned ID is known.
    pub valid_pid: bool,
}

impl TargetDevice {
    pub fn new(target_address: u8, pid: u64) -> Self {
        let mut device = TargetDevice {
            target_address,
            ..Default::default()
        };
        device.set_pid(pid);
        device
    }

    /// An I2C device reachable at its fixed address.
    pub fn i2c(address: u8) -> Self {
        TargetDevice {
            target_address: address,
            target_type: TargetType::I2c,
            capability: TargetCapability {
                static_address: address,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn pid(&self) -> u64 {
        ((self.pid_hi as u64) << 32) | self.pid_lo as u64
    }

    pub fn set_pid(&mut self, pid: u64) {
        self.pid_hi = (pid >> 32) as u16;
        self.pid_lo = pid as u32;
        self.valid_pid = pid != 0;
    }

    fn matches_pid(&self, pid: u64) -> bool {
        self.valid_pid && pid != 0 && self.pid() == pid
    }

    /// An I3C device nobody can address: no dynamic address yet, no static
    /// address and no PID to run dynamic address assignment against.
    fn is_unreachable(&self) -> bool {
        self.target_type == TargetType::I3c
            && self.target_address == 0
            && self.capability.static_address == 0
            && !self.valid_pid
    }

    fn from_capability_entry(entry: &TargetCapabilityEntry) -> Self {
        let mut device = TargetDevice::default();
        device.apply_capability_entry(entry);
        device
    }

    fn apply_capability_entry(&mut self, entry: &TargetCapabilityEntry) {
        let pid = ((entry.pid_hi.get() as u64) << 32) | entry.pid_lo.get() as u64;
        if pid != 0 {
            self.set_pid(pid);
        }
        self.capability.static_address = entry.static_address;
        self.capability.ibi_prioritization = entry.ibi_prioritization;
        self.capability.disco_version = entry.disco_version.get();
        self.capability.max_ibi_pending_size = entry.max_ibi_pending_size.get();
    }

    fn apply_table_entry(&mut self, entry: &TargetTableEntry) -> Result<(), CodecError> {
        self.target_address = entry.address;
        if entry.pid() != 0 {
            self.set_pid(entry.pid());
        }
        self.target_type = TargetType::try_from(entry.target_type)?;
        self.dcr = entry.dcr;
        self.bcr = entry.bcr;
        self.capability.handoff_controller_role = entry.bcr >> 6 == BCR_ROLE_CONTROLLER;
        self.config = entry.config.into();
        self.max_ibi_payload_size = entry.max_ibi_payload_size.get();
        Ok(())
    }

    fn to_table_entry(&self) -> TargetTableEntry {
        TargetTableEntry::new(
            self.target_address,
            self.target_type,
            self.pid(),
            self.dcr,
            self.bcr,
            self.config.into(),
            self.max_ibi_payload_size,
        )
    }
}

/// Result of [`TargetDeviceTable::identify_devices`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCensus {
    /// I3C devices that can be addressed through their static address (SETDASA).
    pub static_count: usize,
    /// I3C devices that need ENTDAA.
    pub dynamic_count: usize,
}

struct TableInner {
    devices: Vec<TargetDevice>,
    events_enabled: bool,
    on_insert: Option<InsertCallback>,
}

impl TableInner {
    fn position(&self, address: u8) -> Option<usize> {
        if address == 0 {
            return None;
        }
        self.devices.iter().position(|d| d.target_address == address)
    }

    fn position_by_pid(&self, pid: u64) -> Option<usize> {
        self.devices.iter().position(|d| d.matches_pid(pid))
    }

    fn insert(&mut self, device: TargetDevice) -> UsbI3cResult<()> {
        if device.target_address > MAX_TARGET_ADDRESS {
            return Err(ValidationError::AddressOutOfRange(device.target_address).into());
        }
        if self.position(device.target_address).is_some() {
            return Err(ValidationError::AddressInUse(device.target_address).into());
        }
        if device.is_unreachable() {
            return Err(ValidationError::UnidentifiableDevice.into());
        }
        let address = device.target_address;
        self.devices.push(device);
        if self.events_enabled && address != 0 {
            if let Some(callback) = self.on_insert.as_mut() {
                callback(address);
            }
        }
        Ok(())
    }
}

pub struct TargetDeviceTable {
    inner: Mutex<TableInner>,
}

impl Default for TargetDeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetDeviceTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                devices: Vec::new(),
                events_enabled: false,
                on_insert: None,
            }),
        }
    }

    /// Adds `device`. A non-zero address must not already be in use.
    pub fn insert(&self, device: TargetDevice) -> UsbI3cResult<()> {
        lock(&self.inner).insert(device)
    }

    pub fn remove(&self, address: u8) -> Option<TargetDevice> {
        let mut inner = lock(&self.inner);
        let index = inner.position(address)?;
        Some(inner.devices.remove(index))
    }

    pub fn get(&self, address: u8) -> Option<TargetDevice> {
        let inner = lock(&self.inner);
        inner.position(address).map(|i| inner.devices[i].clone())
    }

    /// Non-zero addresses currently in the table, in insertion order.
    pub fn address_list(&self) -> Vec<u8> {
        lock(&self.inner)
            .devices
            .iter()
            .map(|d| d.target_address)
            .filter(|&a| a != 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every device.
    pub fn devices(&self) -> Vec<TargetDevice> {
        lock(&self.inner).devices.clone()
    }

    pub fn change_address(&self, old_address: u8, new_address: u8) -> UsbI3cResult<()> {
        if new_address == 0 || new_address > MAX_TARGET_ADDRESS {
            return Err(ValidationError::AddressOutOfRange(new_address).into());
        }
        let mut inner = lock(&self.inner);
        let index = inner
            .position(old_address)
            .ok_or(ValidationError::UnknownTarget(old_address))?;
        match inner.position(new_address) {
            Some(other) if other != index => {
                return Err(ValidationError::AddressInUse(new_address).into())
            }
            _ => {}
        }
        inner.devices[index].target_address = new_address;
        Ok(())
    }

    /// Replaces the behaviour flags of the device at `address`.
    pub fn update_config(
        &self,
        address: u8,
        config: TargetConfig,
        max_ibi_payload_size: u32,
    ) -> UsbI3cResult<()> {
        let mut inner = lock(&self.inner);
        let index = inner
            .position(address)
            .ok_or(ValidationError::UnknownTarget(address))?;
        let device = &mut inner.devices[index];
        device.config = config;
        device.max_ibi_payload_size = max_ibi_payload_size;
        Ok(())
    }

    /// Merges the static target entries of a GET_I3C_CAPABILITY buffer.
    ///
    /// Entries are matched to existing devices by static address, then by PID.
    /// Returns the number of devices added.
    pub fn fill_from_capability_buffer(&self, buffer: &[u8]) -> UsbI3cResult<usize> {
        let capability = I3cCapability::decode(buffer)?;
        if capability
            .targets
            .iter()
            .any(|entry| TargetDevice::from_capability_entry(entry).is_unreachable())
        {
            return Err(ValidationError::UnidentifiableDevice.into());
        }

        let mut inner = lock(&self.inner);
        let mut added = 0;
        for entry in &capability.targets {
            let pid = ((entry.pid_hi.get() as u64) << 32) | entry.pid_lo.get() as u64;
            let existing = inner
                .devices
                .iter()
                .position(|d| {
                    entry.static_address != 0 && d.capability.static_address == entry.static_address
                })
                .or_else(|| inner.position_by_pid(pid));
            match existing {
                Some(index) => inner.devices[index].apply_capability_entry(entry),
                None => {
                    inner.insert(TargetDevice::from_capability_entry(entry))?;
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Merges a GET_TARGET_DEVICE_TABLE buffer.
    ///
    /// Entries are matched by address, then by PID; unmatched entries are
    /// inserted, which fires the insertion callback when events are enabled.
    /// Returns the number of devices added.
    pub fn fill_from_device_table_buffer(&self, buffer: &[u8]) -> UsbI3cResult<usize> {
        let table = TargetDeviceTableBuffer::decode(buffer)?;
        for entry in &table.entries {
            if entry.address > MAX_TARGET_ADDRESS || (entry.address == 0 && entry.pid() == 0) {
                return Err(CodecError::InvalidField {
                    field: "target address",
                    value: entry.address as u32,
                }
                .into());
            }
        }

        let mut inner = lock(&self.inner);
        let mut added = 0;
        for entry in &table.entries {
            let existing = inner
                .position(entry.address)
                .or_else(|| inner.position_by_pid(entry.pid()));
            match existing {
                Some(index) => inner.devices[index].apply_table_entry(entry)?,
                None => {
                    let mut device = TargetDevice::default();
                    device.apply_table_entry(entry)?;
                    inner.insert(device)?;
                    added += 1;
                }
            }
        }
        debug!(
            "Device table merged: {} entries, {} new, {} total",
            table.entries.len(),
            added,
            inner.devices.len()
        );
        Ok(added)
    }

    /// Splits the I3C devices into those with a static address and those that
    /// need dynamic address assignment. Fails if any I3C device has neither a
    /// static address nor a valid PID.
    pub fn identify_devices(&self) -> UsbI3cResult<DeviceCensus> {
        let inner = lock(&self.inner);
        let mut census = DeviceCensus::default();
        for device in inner
            .devices
            .iter()
            .filter(|d| d.target_type == TargetType::I3c)
        {
            if device.capability.static_address != 0 {
                census.static_count += 1;
            } else if device.valid_pid {
                census.dynamic_count += 1;
            } else {
                return Err(ValidationError::UnidentifiableDevice.into());
            }
        }
        Ok(census)
    }

    pub fn create_device_table_buffer(&self) -> UsbI3cResult<Vec<u8>> {
        let entries = lock(&self.inner)
            .devices
            .iter()
            .map(TargetDevice::to_table_entry)
            .collect();
        Ok(TargetDeviceTableBuffer { entries }.to_bytes()?)
    }

    /// Builds a SET_TARGET_DEVICE_CONFIG buffer applying `config` and
    /// `max_ibi_payload_size` to every addressed device.
    pub fn create_target_config_buffer(
        &self,
        config: TargetConfig,
        max_ibi_payload_size: u32,
    ) -> UsbI3cResult<Vec<u8>> {
        let entries = lock(&self.inner)
            .devices
            .iter()
            .filter(|d| d.target_address != 0)
            .map(|d| TargetConfigEntry::new(d.target_address, config.into(), max_ibi_payload_size))
            .collect();
        Ok(TargetConfigBuffer { entries }.to_bytes()?)
    }

    pub fn set_insert_callback(&self, callback: Option<InsertCallback>) {
        lock(&self.inner).on_insert = callback;
    }

    pub fn set_events_enabled(&self, enabled: bool) {
        lock(&self.inner).events_enabled = enabled;
    }

    pub fn events_enabled(&self) -> bool {
        lock(&self.inner).events_enabled
    }
}
