// Licensed under the Apache-2.0 license

use core::time::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use usbi3c::transport::{InputHandler, TransferCompletion, TransportError, UsbTransport};
use usbi3c_common::codec::UsbI3cCodec;
use usbi3c_common::message::address_change::{
    AddressChangeRequest, AddressChangeResult, AddressChangeResultEntry, AddressChangeStatus,
};
use usbi3c_common::message::bulk::{BulkRequest, BulkResponse, CommandResponse};
use usbi3c_common::message::capability::{CapabilityFlags, DeviceRole, I3cCapability};
use usbi3c_common::message::target_config::TargetConfigBuffer;
use usbi3c_common::message::target_table::{TargetDeviceTableBuffer, TargetTableEntry, TargetType};
use usbi3c_common::protocol::command::CommandErrorStatus;
use usbi3c_common::protocol::notification::{AddressChangeCode, BusInitCode, Notification};
use usbi3c_common::protocol::requests::{BusInitMode, ClassRequest};

pub const MAX_PACKET_SIZE: usize = 512;
pub const DEFAULT_BUFFER_AVAILABLE: u32 = 4096;

/// First dynamic address handed out, following the allocator of an I3C controller.
const FIRST_DYNAMIC_ADDRESS: u8 = 0x08;

/// Next valid dynamic address; skips the addresses reserved next to the
/// broadcast address and ends after 0x75.
fn next_dynamic_address(address: u8) -> Option<u8> {
    match address {
        0x3d => Some(0x3f),
        0x6d => Some(0x6f),
        0x08..=0x74 => Some(address + 1),
        _ => None,
    }
}

/// A completion waiting to be delivered by `wait_for_next_event`.
pub enum DeviceEvent {
    ControlIn(TransferCompletion, Result<Vec<u8>, TransportError>),
    BulkIn(Result<Vec<u8>, TransportError>),
    Interrupt(Result<Vec<u8>, TransportError>),
}

/// A target on the emulated bus.
#[derive(Debug, Clone, Copy)]
pub struct BusTarget {
    pub static_address: u8,
    pub entry: TargetTableEntry,
}

struct DeviceState {
    capability: Vec<u8>,
    targets: Vec<BusTarget>,
    next_address: Option<u8>,
    bus_init_code: BusInitCode,
    buffer_available: u32,
    stalled: Vec<ClassRequest>,
    bulk_out_error: Option<TransportError>,
    respond_to_bulk: bool,
    read_status: CommandErrorStatus,
    address_change_results: Vec<AddressChangeResultEntry>,
    // Replacement entries for the nth GET_TARGET_DEVICE_TABLE, counted from 1
    table_replies: Vec<(usize, Vec<TargetTableEntry>)>,
    control_outs: Vec<(ClassRequest, u16, Vec<u8>)>,
    control_ins: Vec<ClassRequest>,
    bulk_outs: Vec<Vec<u8>>,
    disconnected: bool,
}

impl DeviceState {
    fn allocate_address(&mut self) -> Option<u8> {
        loop {
            let address = self.next_address?;
            self.next_address = next_dynamic_address(address);
            if !self.targets.iter().any(|t| t.entry.address == address) {
                return Some(address);
            }
        }
    }

    fn control_in_data(&mut self, request: ClassRequest) -> Result<Vec<u8>, TransportError> {
        self.control_ins.push(request);
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        if self.stalled.contains(&request) {
            return Err(TransportError::Stall);
        }
        match request {
            ClassRequest::GetI3cCapability => Ok(self.capability.clone()),
            ClassRequest::GetTargetDeviceTable => {
                let fetch = self
                    .control_ins
                    .iter()
                    .filter(|r| **r == ClassRequest::GetTargetDeviceTable)
                    .count();
                let entries = match self.table_replies.iter().position(|(n, _)| *n == fetch) {
                    Some(index) => self.table_replies.remove(index).1,
                    None => self
                        .targets
                        .iter()
                        .filter(|t| t.entry.address != 0)
                        .map(|t| t.entry)
                        .collect(),
                };
                Ok(TargetDeviceTableBuffer { entries }.to_bytes().unwrap())
            }
            ClassRequest::GetAddressChangeResult => Ok(AddressChangeResult {
                entries: std::mem::take(&mut self.address_change_results),
            }
            .to_bytes()
            .unwrap()),
            ClassRequest::GetBufferAvailable => Ok(self.buffer_available.to_le_bytes().to_vec()),
            _ => Err(TransportError::Stall),
        }
    }

    fn initialize_bus(&mut self, mode: u16) -> Vec<u8> {
        if self.bus_init_code == BusInitCode::Success {
            for index in 0..self.targets.len() {
                if self.targets[index].entry.address != 0 {
                    continue;
                }
                let static_address = self.targets[index].static_address;
                let address = if mode == BusInitMode::StaticThenDynamic as u16 && static_address != 0
                {
                    Some(static_address)
                } else {
                    self.allocate_address()
                };
                if let Some(address) = address {
                    self.targets[index].entry.address = address;
                }
            }
        }
        Notification::bus_initialization(self.bus_init_code)
            .to_bytes()
            .unwrap()
    }

    fn change_addresses(&mut self, data: &[u8]) -> Vec<u8> {
        let request = AddressChangeRequest::decode(data).unwrap();
        let mut all_succeeded = true;
        for entry in &request.entries {
            let in_use = self
                .targets
                .iter()
                .any(|t| t.entry.address == entry.new_address);
            let target = self
                .targets
                .iter_mut()
                .find(|t| t.entry.address == entry.current_address);
            let status = match target {
                Some(target) if !in_use => {
                    target.entry.address = entry.new_address;
                    AddressChangeStatus::Success
                }
                _ => {
                    all_succeeded = false;
                    AddressChangeStatus::Failure
                }
            };
            self.address_change_results.push(AddressChangeResultEntry::new(
                entry.current_address,
                entry.new_address,
                status,
            ));
        }
        let code = if all_succeeded {
            AddressChangeCode::AllAddressChangesSucceeded
        } else {
            AddressChangeCode::SomeAddressChangesFailed
        };
        Notification::address_change(code).to_bytes().unwrap()
    }

    fn apply_target_config(&mut self, data: &[u8]) {
        let config = TargetConfigBuffer::decode(data).unwrap();
        for entry in &config.entries {
            if let Some(target) = self
                .targets
                .iter_mut()
                .find(|t| t.entry.address == entry.address)
            {
                target.entry.config = entry.config;
                target.entry.max_ibi_payload_size = entry.max_ibi_payload_size;
            }
        }
    }

    fn respond(&self, request: &BulkRequest) -> Option<Vec<u8>> {
        if !self.respond_to_bulk {
            return None;
        }
        let response = match request {
            BulkRequest::Regular(blocks) => BulkResponse::Regular(
                blocks
                    .iter()
                    .map(|block| {
                        let read = block.descriptor.is_read();
                        let length = block.descriptor.data_length.get() as usize;
                        CommandResponse {
                            request_id: block.request_id,
                            attempted: true,
                            error_status: if read {
                                self.read_status
                            } else {
                                CommandErrorStatus::Success
                            },
                            has_data: read && length > 0,
                            data: if read {
                                (0..length).map(|i| i as u8).collect()
                            } else {
                                Vec::new()
                            },
                        }
                    })
                    .collect(),
            ),
            BulkRequest::VendorSpecific(data) => BulkResponse::VendorSpecific(data.clone()),
        };
        Some(response.to_bytes().unwrap())
    }
}

/// An emulated USB I3C function acting as primary controller.
///
/// Completions are queued and delivered from `wait_for_next_event`, on the
/// session's event thread, the way a real USB stack delivers them.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
    events: Arc<(Mutex<VecDeque<DeviceEvent>>, Condvar)>,
    bulk_in: Arc<Mutex<Option<InputHandler>>>,
    interrupt_in: Arc<Mutex<Option<InputHandler>>>,
    bulk_in_buffer_size: Arc<Mutex<usize>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let mut flags = CapabilityFlags([0; 2]);
        flags.set_hot_join(true);
        flags.set_in_band_interrupt(true);
        let capability = I3cCapability::new(DeviceRole::PrimaryController, flags, 32, vec![]);
        Self::with_capability(capability.to_bytes().unwrap())
    }

    pub fn with_capability(capability: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                capability,
                targets: Vec::new(),
                next_address: Some(FIRST_DYNAMIC_ADDRESS),
                bus_init_code: BusInitCode::Success,
                buffer_available: DEFAULT_BUFFER_AVAILABLE,
                stalled: Vec::new(),
                bulk_out_error: None,
                respond_to_bulk: true,
                read_status: CommandErrorStatus::Success,
                address_change_results: Vec::new(),
                table_replies: Vec::new(),
                control_outs: Vec::new(),
                control_ins: Vec::new(),
                bulk_outs: Vec::new(),
                disconnected: false,
            })),
            events: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            bulk_in: Arc::new(Mutex::new(None)),
            interrupt_in: Arc::new(Mutex::new(None)),
            bulk_in_buffer_size: Arc::new(Mutex::new(0)),
        }
    }

    /// Puts an unaddressed I3C target on the bus.
    pub fn add_target(&self, pid: u64, static_address: u8, dcr: u8, bcr: u8) {
        let entry = TargetTableEntry::new(0, TargetType::I3c, pid, dcr, bcr, Default::default(), 0);
        self.state.lock().unwrap().targets.push(BusTarget {
            static_address,
            entry,
        });
    }

    /// A target joins the running bus and receives the next dynamic address.
    pub fn hot_join(&self, pid: u64) -> u8 {
        let address = {
            let mut state = self.state.lock().unwrap();
            let address = state.allocate_address().unwrap();
            let entry =
                TargetTableEntry::new(address, TargetType::I3c, pid, 0, 0, Default::default(), 0);
            state.targets.push(BusTarget {
                static_address: 0,
                entry,
            });
            address
        };
        self.deliver_notification(
            Notification::address_change(AddressChangeCode::HotJoinAddressAssignmentSucceeded)
                .to_bytes()
                .unwrap(),
        );
        address
    }

    pub fn deliver_notification(&self, data: Vec<u8>) {
        self.push_event(DeviceEvent::Interrupt(Ok(data)));
    }

    pub fn deliver_bulk_in(&self, result: Result<Vec<u8>, TransportError>) {
        self.push_event(DeviceEvent::BulkIn(result));
    }

    /// Answers the `fetch`th GET_TARGET_DEVICE_TABLE with `entries` instead of
    /// the bus contents.
    pub fn reply_to_table_fetch(&self, fetch: usize, entries: Vec<TargetTableEntry>) {
        self.state.lock().unwrap().table_replies.push((fetch, entries));
    }

    pub fn set_bus_init_code(&self, code: BusInitCode) {
        self.state.lock().unwrap().bus_init_code = code;
    }

    pub fn set_buffer_available(&self, available: u32) {
        self.state.lock().unwrap().buffer_available = available;
    }

    pub fn stall(&self, request: ClassRequest) {
        self.state.lock().unwrap().stalled.push(request);
    }

    pub fn fail_bulk_out(&self, error: Option<TransportError>) {
        self.state.lock().unwrap().bulk_out_error = error;
    }

    /// When disabled, bulk requests are accepted but never answered.
    pub fn set_respond_to_bulk(&self, respond: bool) {
        self.state.lock().unwrap().respond_to_bulk = respond;
    }

    pub fn set_read_status(&self, status: CommandErrorStatus) {
        self.state.lock().unwrap().read_status = status;
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().disconnected = true;
        self.events.1.notify_all();
    }

    pub fn control_outs(&self) -> Vec<(ClassRequest, u16, Vec<u8>)> {
        self.state.lock().unwrap().control_outs.clone()
    }

    pub fn control_out_count(&self, request: ClassRequest) -> usize {
        self.control_outs()
            .iter()
            .filter(|(r, _, _)| *r == request)
            .count()
    }

    pub fn control_in_count(&self, request: ClassRequest) -> usize {
        self.state
            .lock()
            .unwrap()
            .control_ins
            .iter()
            .filter(|r| **r == request)
            .count()
    }

    pub fn bulk_outs(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().bulk_outs.clone()
    }

    pub fn bulk_in_buffer_size(&self) -> usize {
        *self.bulk_in_buffer_size.lock().unwrap()
    }

    pub fn device_table(&self) -> Vec<TargetTableEntry> {
        self.state
            .lock()
            .unwrap()
            .targets
            .iter()
            .map(|t| t.entry)
            .collect()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.0.lock().unwrap().is_empty()
    }

    fn push_event(&self, event: DeviceEvent) {
        let (queue, cvar) = &*self.events;
        queue.lock().unwrap().push_back(event);
        cvar.notify_all();
    }

    fn dispatch(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::ControlIn(completion, result) => completion(result),
            DeviceEvent::BulkIn(result) => {
                if let Some(handler) = self.bulk_in.lock().unwrap().as_mut() {
                    handler(result.as_deref().map_err(Clone::clone));
                }
            }
            DeviceEvent::Interrupt(result) => {
                if let Some(handler) = self.interrupt_in.lock().unwrap().as_mut() {
                    handler(result.as_deref().map_err(Clone::clone));
                }
            }
        }
    }
}

impl UsbTransport for MockDevice {
    fn control_in(
        &self,
        request: ClassRequest,
        _value: u16,
        max_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut data = self.state.lock().unwrap().control_in_data(request)?;
        data.truncate(max_len);
        Ok(data)
    }

    fn control_out(
        &self,
        request: ClassRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let notification = {
            let mut state = self.state.lock().unwrap();
            state.control_outs.push((request, value, data.to_vec()));
            if state.disconnected {
                return Err(TransportError::Disconnected);
            }
            if state.stalled.contains(&request) {
                return Err(TransportError::Stall);
            }
            match request {
                ClassRequest::InitializeI3cBus => Some(state.initialize_bus(value)),
                ClassRequest::ChangeDynamicAddress => Some(state.change_addresses(data)),
                ClassRequest::SetTargetDeviceConfig => {
                    state.apply_target_config(data);
                    None
                }
                _ => None,
            }
        };
        if let Some(notification) = notification {
            self.deliver_notification(notification);
        }
        Ok(())
    }

    fn submit_control_in(
        &self,
        request: ClassRequest,
        _value: u16,
        max_len: usize,
        completion: TransferCompletion,
    ) -> Result<(), TransportError> {
        let result = self
            .state
            .lock()
            .unwrap()
            .control_in_data(request)
            .map(|mut data| {
                data.truncate(max_len);
                data
            });
        self.push_event(DeviceEvent::ControlIn(completion, result));
        Ok(())
    }

    fn bulk_out(&self, data: &[u8]) -> Result<usize, TransportError> {
        let response = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.bulk_out_error.clone() {
                return Err(err);
            }
            state.bulk_outs.push(data.to_vec());
            state.respond(&BulkRequest::decode(data).unwrap())
        };
        if let Some(response) = response {
            self.deliver_bulk_in(Ok(response));
        }
        Ok(data.len())
    }

    fn start_bulk_in(
        &self,
        buffer_size: usize,
        handler: InputHandler,
    ) -> Result<(), TransportError> {
        *self.bulk_in_buffer_size.lock().unwrap() = buffer_size;
        *self.bulk_in.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn start_interrupt_in(&self, handler: InputHandler) -> Result<(), TransportError> {
        *self.interrupt_in.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn max_bulk_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    fn wait_for_next_event(&self, timeout: Duration) -> Result<(), TransportError> {
        let events: Vec<DeviceEvent> = {
            let (queue, cvar) = &*self.events;
            let mut queue = queue.lock().unwrap();
            if queue.is_empty() {
                queue = cvar.wait_timeout(queue, timeout).unwrap().0;
            }
            queue.drain(..).collect()
        };
        let disconnected = self.state.lock().unwrap().disconnected;
        if events.is_empty() {
            return Err(if disconnected {
                TransportError::Disconnected
            } else {
                TransportError::Timeout
            });
        }
        for event in events {
            self.dispatch(event);
        }
        Ok(())
    }
}

#[cfg(test)]
#[test]
fn test_dynamic_address_allocation_skips_reserved() {
    assert_eq!(next_dynamic_address(0x08), Some(0x09));
    assert_eq!(next_dynamic_address(0x3d), Some(0x3f));
    assert_eq!(next_dynamic_address(0x6d), Some(0x6f));
    assert_eq!(next_dynamic_address(0x74), Some(0x75));
    assert_eq!(next_dynamic_address(0x75), None);
}
