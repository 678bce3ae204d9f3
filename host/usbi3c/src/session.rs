// Licensed under the Apache-2.0 license

use crate::command_queue::{
    ensure_buffer_available, write_bulk_request, Command, CommandKind, CommandQueue, Dependency,
    Transfer,
};
use crate::device_info::DeviceInfo;
use crate::error::{StateError, UsbI3cResult, ValidationError};
use crate::init_sm;
use crate::lock;
use crate::notification::NotificationDispatcher;
use crate::request_tracker::{RequestRecord, RequestTracker, ResponseCallback, VendorCallback};
use crate::target_table::{InsertCallback, TargetConfig, TargetDevice, TargetDeviceTable};
use crate::transport::{TransportError, UsbTransport};
use core::time::Duration;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use usbi3c_common::codec::UsbI3cCodec;
use usbi3c_common::message::address_change::{AddressChangeEntry, AddressChangeRequest};
use usbi3c_common::message::bulk::{BulkRequest, CommandResponse};
use usbi3c_common::message::target_config::{TargetConfigBuffer, TargetConfigEntry};
use usbi3c_common::protocol::command::{ErrorHandling, I3cMode, MAX_TARGET_ADDRESS};
use usbi3c_common::protocol::requests::{BulkRequestControl, ClassRequest, FeatureSelector};

/// `UsbI3cSession` drives one USB I3C function.
///
/// It owns the device state, the target device table and the request
/// tracker, and runs the event thread that pumps transport completions.
pub struct UsbI3cSession<
    T: UsbTransport,
    A: init_sm::StateMachineActions = init_sm::DefaultActions,
> {
    transport: Arc<T>,
    device: Arc<Mutex<DeviceInfo>>,
    table: Arc<TargetDeviceTable>,
    tracker: Arc<RequestTracker>,
    queue: Mutex<CommandQueue>,
    i3c_mode: Mutex<I3cMode>,
    init_sm: Mutex<init_sm::StateMachine<init_sm::Context<A, T>>>,
    init_events: Mutex<Receiver<init_sm::Events>>,
    init_step_timeout: Duration,
    running: Arc<AtomicBool>,
    event_loop_handle: Option<JoinHandle<()>>,
}

impl<T: UsbTransport, A: init_sm::StateMachineActions> UsbI3cSession<T, A> {
    /// Opens a session over `transport` and starts its event thread.
    ///
    /// # Arguments
    ///
    /// * `transport` - An opened USB I3C function.
    /// * `opts` - Session options.
    ///
    /// # Returns
    ///
    /// The session, not yet initialized. Call [`Self::initialize`] next.
    pub fn open(transport: T, opts: Options<A>) -> UsbI3cResult<Self> {
        let transport = Arc::new(transport);
        let device = Arc::new(Mutex::new(DeviceInfo::default()));
        let table = Arc::new(TargetDeviceTable::new());
        let tracker = Arc::new(RequestTracker::new());

        for target in opts.known_targets {
            table.insert(target)?;
        }

        let (event_queue_tx, event_queue_rx) = mpsc::channel();
        let dispatcher = Arc::new(NotificationDispatcher::new(
            &transport,
            table.clone(),
            event_queue_tx.clone(),
        ));
        let init_sm = init_sm::StateMachine::new(init_sm::Context::new(
            opts.init_sm_actions,
            transport.clone(),
            device.clone(),
            table.clone(),
            tracker.clone(),
            dispatcher,
            event_queue_tx,
            opts.bulk_in_packets,
        ));

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let transport_clone = transport.clone();
        let event_wait_interval = opts.event_wait_interval;
        let event_handle = std::thread::spawn(move || {
            event_loop(transport_clone, running_clone, event_wait_interval);
        });
        info!("USB I3C session opened");

        Ok(Self {
            transport,
            device,
            table,
            tracker,
            queue: Mutex::new(CommandQueue::new()),
            i3c_mode: Mutex::new(opts.i3c_mode),
            init_sm: Mutex::new(init_sm),
            init_events: Mutex::new(event_queue_rx),
            init_step_timeout: opts.init_step_timeout,
            running,
            event_loop_handle: Some(event_handle),
        })
    }

    /// Stops the event thread. Pending requests stay tracked.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.event_loop_handle.take() {
            if handle.join().is_err() {
                error!("Event loop thread panicked");
            }
            info!("USB I3C session closed");
        }
    }

    /// Runs the initialization sequence to completion.
    ///
    /// Returns once the device is ready as active controller, or is known to
    /// be unable to take that role. A failed run can be retried by calling
    /// this again.
    pub fn initialize(&self) -> UsbI3cResult<()> {
        let mut sm = lock(&self.init_sm);
        let events = lock(&self.init_events);
        while let Ok(stale) = events.try_recv() {
            debug!("Discarding stale initialization event: {:?}", stale);
        }
        self.table.set_events_enabled(false);

        if sm.process_event(init_sm::Events::Start).is_err() {
            return Err(StateError::UnexpectedInitEvent("Start").into());
        }
        loop {
            debug!("Initialization state: {:?}", sm.state());
            match sm.state() {
                init_sm::States::Ready | init_sm::States::Standby => return Ok(()),
                init_sm::States::Failed => {
                    return Err(sm
                        .context()
                        .failure()
                        .cloned()
                        .unwrap_or(StateError::UnexpectedInitEvent("Fail").into()))
                }
                _ => {}
            }
            let event = match events.recv_timeout(self.init_step_timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    init_sm::Events::Fail(TransportError::Timeout.into())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    init_sm::Events::Fail(TransportError::Disconnected.into())
                }
            };
            if sm.process_event(event).is_err() {
                warn!("Initialization event ignored in state {:?}", sm.state());
            }
        }
    }

    pub fn init_state(&self) -> init_sm::States {
        lock(&self.init_sm).state().clone()
    }

    pub fn device_info(&self) -> DeviceInfo {
        lock(&self.device).clone()
    }

    pub fn i3c_mode(&self) -> I3cMode {
        *lock(&self.i3c_mode)
    }

    /// Sets the transfer mode used by commands enqueued from now on.
    pub fn set_i3c_mode(&self, mode: I3cMode) {
        *lock(&self.i3c_mode) = mode;
    }

    /// Validates `command` and appends it to the queue. The current
    /// [`I3cMode`] is applied to it.
    pub fn enqueue(&self, command: Command) -> UsbI3cResult<()> {
        let mode = self.i3c_mode();
        lock(&self.queue).push(command.with_mode(mode))
    }

    pub fn enqueue_command(
        &self,
        target_address: u8,
        transfer: Transfer,
        error_handling: ErrorHandling,
        callback: ResponseCallback,
    ) -> UsbI3cResult<()> {
        self.enqueue(
            Command::new(CommandKind::Regular, target_address, transfer, error_handling)
                .with_callback(callback),
        )
    }

    pub fn enqueue_ccc(
        &self,
        target_address: u8,
        ccc: u8,
        transfer: Transfer,
        error_handling: ErrorHandling,
        callback: ResponseCallback,
    ) -> UsbI3cResult<()> {
        self.enqueue(
            Command::new(CommandKind::Ccc(ccc), target_address, transfer, error_handling)
                .with_callback(callback),
        )
    }

    pub fn enqueue_ccc_with_defining_byte(
        &self,
        target_address: u8,
        ccc: u8,
        defining_byte: u8,
        transfer: Transfer,
        error_handling: ErrorHandling,
        callback: ResponseCallback,
    ) -> UsbI3cResult<()> {
        self.enqueue(
            Command::new(
                CommandKind::CccWithDefiningByte { ccc, defining_byte },
                target_address,
                transfer,
                error_handling,
            )
            .with_callback(callback),
        )
    }

    pub fn enqueue_target_reset_pattern(&self, callback: ResponseCallback) -> UsbI3cResult<()> {
        self.enqueue(Command::target_reset_pattern().with_callback(callback))
    }

    pub fn pending_command_count(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn clear_commands(&self) {
        lock(&self.queue).clear();
    }

    /// Sends every queued command as one bulk request.
    ///
    /// Returns the request identifiers in queue order. On error the queue is
    /// left intact. Fails with `StateError::ResponsesNotReceived` until
    /// initialization has started polling for responses.
    pub fn submit_commands(&self, dependency: Dependency) -> UsbI3cResult<Vec<u16>> {
        lock(&self.queue).submit(&*self.transport, &self.tracker, dependency)
    }

    /// Acknowledges a retained response, forgetting its request.
    pub fn take_retained_response(&self, request_id: u16) -> Option<CommandResponse> {
        self.tracker.take_retained(request_id)
    }

    pub fn retained_response(&self, request_id: u16) -> Option<CommandResponse> {
        self.tracker.retained_response(request_id)
    }

    pub fn tracked_request_count(&self) -> usize {
        self.tracker.tracked_count()
    }

    /// Requests submitted and not yet released, in submission order.
    pub fn tracked_requests(&self) -> Vec<RequestRecord> {
        self.tracker.records()
    }

    /// Registers the callback for vendor-specific responses. Payloads arrive
    /// padded to a dword boundary; the vendor protocol has to carry its own
    /// length if it needs one.
    pub fn on_vendor_specific_response(&self, callback: Option<VendorCallback>) {
        self.tracker.set_vendor_callback(callback);
    }

    pub fn submit_vendor_specific_request(&self, data: &[u8]) -> UsbI3cResult<()> {
        // Shares the bulk OUT pipe with command submission.
        let _queue = lock(&self.queue);
        self.tracker.ensure_receiving()?;
        let bytes = BulkRequest::VendorSpecific(data.to_vec()).to_bytes()?;
        ensure_buffer_available(&*self.transport, bytes.len())?;
        write_bulk_request(&*self.transport, &bytes)?;
        debug!("Vendor specific request of {} bytes sent", data.len());
        Ok(())
    }

    /// Registers the callback run with the address of every target that
    /// joins the bus once the session is ready. It runs with the table
    /// locked and must not call back into the session's table accessors.
    pub fn on_hotjoin(&self, callback: Option<InsertCallback>) {
        self.table.set_insert_callback(callback);
    }

    pub fn target_devices(&self) -> Vec<TargetDevice> {
        self.table.devices()
    }

    pub fn target_device_addresses(&self) -> Vec<u8> {
        self.table.address_list()
    }

    pub fn target_device(&self, address: u8) -> Option<TargetDevice> {
        self.table.get(address)
    }

    pub fn target_device_config(&self, address: u8) -> Option<TargetConfig> {
        self.table.get(address).map(|device| device.config)
    }

    pub fn set_target_device_config(&self, address: u8, config: TargetConfig) -> UsbI3cResult<()> {
        lock(&self.device).check_active_controller()?;
        let device = self
            .table
            .get(address)
            .ok_or(ValidationError::UnknownTarget(address))?;
        self.send_target_config(address, config, device.max_ibi_payload_size)
    }

    pub fn set_target_device_max_ibi_payload(
        &self,
        address: u8,
        max_ibi_payload_size: u32,
    ) -> UsbI3cResult<()> {
        lock(&self.device).check_active_controller()?;
        let device = self
            .table
            .get(address)
            .ok_or(ValidationError::UnknownTarget(address))?;
        self.send_target_config(address, device.config, max_ibi_payload_size)
    }

    fn send_target_config(
        &self,
        address: u8,
        config: TargetConfig,
        max_ibi_payload_size: u32,
    ) -> UsbI3cResult<()> {
        let buffer = TargetConfigBuffer {
            entries: vec![TargetConfigEntry::new(
                address,
                config.into(),
                max_ibi_payload_size,
            )],
        }
        .to_bytes()?;
        self.transport
            .control_out(ClassRequest::SetTargetDeviceConfig, 0, &buffer)?;
        self.table
            .update_config(address, config, max_ibi_payload_size)
    }

    /// Asks the device to move a target to `new_address`.
    ///
    /// The table changes only once the device reports the result through an
    /// address change notification.
    pub fn change_target_address(&self, current_address: u8, new_address: u8) -> UsbI3cResult<()> {
        lock(&self.device).check_active_controller()?;
        if new_address == 0 || new_address > MAX_TARGET_ADDRESS {
            return Err(ValidationError::AddressOutOfRange(new_address).into());
        }
        let device = self
            .table
            .get(current_address)
            .ok_or(ValidationError::UnknownTarget(current_address))?;
        if self.table.get(new_address).is_some() {
            return Err(ValidationError::AddressInUse(new_address).into());
        }
        let request = AddressChangeRequest {
            entries: vec![AddressChangeEntry::new(
                current_address,
                new_address,
                device.pid(),
            )],
        }
        .to_bytes()?;
        self.transport
            .control_out(ClassRequest::ChangeDynamicAddress, 0, &request)?;
        debug!(
            "Requested address change {:#04x} -> {:#04x}",
            current_address, new_address
        );
        Ok(())
    }

    pub fn enable_feature(&self, feature: FeatureSelector) -> UsbI3cResult<()> {
        lock(&self.device).check_feature(feature)?;
        self.transport
            .control_out(ClassRequest::SetFeature, feature as u16, &[])?;
        lock(&self.device).state.set_feature(feature, true);
        debug!("Enabled {:?}", feature);
        Ok(())
    }

    pub fn disable_feature(&self, feature: FeatureSelector) -> UsbI3cResult<()> {
        if feature == FeatureSelector::HdrModeExitRecovery {
            return Err(ValidationError::FeatureCannotBeCleared(feature).into());
        }
        lock(&self.device).check_feature(feature)?;
        self.transport
            .control_out(ClassRequest::ClearFeature, feature as u16, &[])?;
        lock(&self.device).state.set_feature(feature, false);
        debug!("Disabled {:?}", feature);
        Ok(())
    }

    /// Forces the bus out of HDR mode so a stuck target can be recovered.
    pub fn exit_hdr_mode_for_recovery(&self) -> UsbI3cResult<()> {
        self.enable_feature(FeatureSelector::HdrModeExitRecovery)
    }

    pub fn cancel_or_resume_bulk_request(&self, control: BulkRequestControl) -> UsbI3cResult<()> {
        self.transport
            .control_out(ClassRequest::CancelOrResumeBulkRequest, control as u16, &[])?;
        Ok(())
    }
}

/// This thread runs every transport completion: control transfers, bulk
/// responses and notifications.
fn event_loop<T: UsbTransport>(transport: Arc<T>, running: Arc<AtomicBool>, interval: Duration) {
    while running.load(Ordering::Relaxed) {
        match transport.wait_for_next_event(interval) {
            Ok(()) | Err(TransportError::Timeout) => {}
            Err(TransportError::Disconnected) => {
                warn!("Device disconnected, event loop exiting");
                break;
            }
            Err(err) => error!("Error waiting for transport events: {}", err),
        }
    }
    debug!("Event loop stopped");
}

impl<T: UsbTransport, A: init_sm::StateMachineActions> Drop for UsbI3cSession<T, A> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct Options<A: init_sm::StateMachineActions> {
    // Actions for the initialization state machine that can be customized as needed
    // Otherwise, the default actions will be used
    pub init_sm_actions: A,

    // Transfer settings applied to every enqueued command
    pub i3c_mode: I3cMode,
    // Longest wait for any single asynchronous initialization step
    pub init_step_timeout: Duration,
    // Timeout of each blocking wait on the event thread
    pub event_wait_interval: Duration,
    // Targets known before the bus is initialized
    pub known_targets: Vec<TargetDevice>,
    // Bulk IN buffers hold this many max-size packets
    pub bulk_in_packets: usize,
}

impl Default for Options<init_sm::DefaultActions> {
    fn default() -> Self {
        Self {
            init_sm_actions: init_sm::DefaultActions {},
            i3c_mode: I3cMode::default(),
            init_step_timeout: Duration::from_secs(5),
            event_wait_interval: Duration::from_millis(100),
            known_targets: Vec::new(),
            bulk_in_packets: 16,
        }
    }
}
