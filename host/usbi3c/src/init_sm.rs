// Licensed under the Apache-2.0 license

use crate::device_info::{DeviceCapability, DeviceInfo};
use crate::error::{StateError, UsbI3cError, UsbI3cResult};
use crate::lock;
use crate::notification::NotificationDispatcher;
use crate::request_tracker::RequestTracker;
use crate::target_table::{TargetConfig, TargetDeviceTable};
use crate::transport::UsbTransport;
use log::{debug, error, info, warn};
use smlang::statemachine;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use usbi3c_common::codec::UsbI3cCodec;
use usbi3c_common::message::capability::I3cCapability;
use usbi3c_common::protocol::notification::BusInitCode;
use usbi3c_common::protocol::requests::{BusInitMode, ClassRequest, MAX_CONTROL_IN_LENGTH};

// Device initialization sequence.
//
// Every step either issues a synchronous control request and posts the next
// event itself, or submits an asynchronous one whose completion posts the
// event from the transport's event thread. Errors are posted as `Fail`.
statemachine! {
    derive_states: [Debug, Clone],
    derive_events: [Clone, Debug],
    transitions: {
        *Idle + Start / on_start = CapabilityRequested,
        Failed + Start / on_start = CapabilityRequested,
        Standby + Start / on_start = CapabilityRequested,
        Ready + Start / on_start = CapabilityRequested,

        CapabilityRequested + CapabilityReceived(Vec<u8>) / on_capability_received = PipelineStarting,

        PipelineStarting + PipelineStarted [is_controller_capable] / on_initialize_bus = BusInitRequested,
        PipelineStarting + PipelineStarted [!is_controller_capable] / on_controller_not_capable = Standby,

        BusInitRequested + BusInitStatus(BusInitCode) [is_bus_init_successful] / on_bus_initialized = TableRequested,
        BusInitRequested + BusInitStatus(BusInitCode) [!is_bus_init_successful] / on_bus_init_failed = Failed,

        TableRequested + TableReceived(Vec<u8>) / on_table_received = ConfigRequested,
        ConfigRequested + ConfigApplied / on_config_applied = TableRefreshRequested,
        TableRefreshRequested + TableReceived(Vec<u8>) / on_table_refreshed = Finalizing,
        Finalizing + TableMerged / on_ready = Ready,

        _ + Fail(UsbI3cError) / on_failure = Failed
    }
}

fn post<T: UsbTransport>(ctx: &InnerContext<T>, event: Events) -> Result<(), ()> {
    ctx.event_queue.send(event).map_err(|_| ())
}

/// Posts `Fail` for an error raised inside an action.
fn post_result<T: UsbTransport>(ctx: &InnerContext<T>, result: UsbI3cResult<()>) -> Result<(), ()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => post(ctx, Events::Fail(err)),
    }
}

/// Submits an asynchronous control IN whose data becomes the next event.
fn request_async<T: UsbTransport>(
    ctx: &InnerContext<T>,
    request: ClassRequest,
    to_event: fn(Vec<u8>) -> Events,
) -> UsbI3cResult<()> {
    let event_queue = ctx.event_queue.clone();
    ctx.transport.submit_control_in(
        request,
        0,
        MAX_CONTROL_IN_LENGTH,
        Box::new(move |result| {
            let event = match result {
                Ok(data) => to_event(data),
                Err(err) => Events::Fail(err.into()),
            };
            if event_queue.send(event).is_err() {
                warn!("Completion of {:?} arrived after initialization ended", request);
            }
        }),
    )?;
    debug!("Requested {:?}", request);
    Ok(())
}

pub trait StateMachineActions {
    // Actions
    fn on_start(&mut self, ctx: &mut InnerContext<impl UsbTransport>) -> Result<(), ()> {
        ctx.failure = None;
        let result = request_async(ctx, ClassRequest::GetI3cCapability, Events::CapabilityReceived);
        post_result(ctx, result)
    }

    fn on_capability_received(
        &mut self,
        ctx: &mut InnerContext<impl UsbTransport>,
        buffer: Vec<u8>,
    ) -> Result<(), ()> {
        match ctx.apply_capability(&buffer).and_then(|_| ctx.start_bulk_in()) {
            Ok(()) => post(ctx, Events::PipelineStarted),
            Err(err) => post(ctx, Events::Fail(err)),
        }
    }

    fn on_initialize_bus(&mut self, ctx: &mut InnerContext<impl UsbTransport>) -> Result<(), ()> {
        let result = ctx.start_interrupt_in().and_then(|_| ctx.initialize_bus());
        post_result(ctx, result)
    }

    fn on_controller_not_capable(&mut self, ctx: &mut InnerContext<impl UsbTransport>) -> Result<(), ()> {
        lock(&ctx.device).state.active_i3c_controller = false;
        info!("Device cannot act as primary controller, staying in standby");
        Ok(())
    }

    fn on_bus_initialized(
        &mut self,
        ctx: &mut InnerContext<impl UsbTransport>,
        _code: BusInitCode,
    ) -> Result<(), ()> {
        {
            let mut device = lock(&ctx.device);
            device.state.active_i3c_controller = true;
            device.state.i3c_bus = true;
        }
        info!("I3C bus initialized");
        let result = request_async(ctx, ClassRequest::GetTargetDeviceTable, Events::TableReceived);
        post_result(ctx, result)
    }

    fn on_bus_init_failed(
        &mut self,
        ctx: &mut InnerContext<impl UsbTransport>,
        code: BusInitCode,
    ) -> Result<(), ()> {
        lock(&ctx.device).state.active_i3c_controller = false;
        error!("I3C bus initialization failed: {:?}", code);
        ctx.failure = Some(StateError::BusInitializationFailed(code).into());
        Ok(())
    }

    fn on_table_received(
        &mut self,
        ctx: &mut InnerContext<impl UsbTransport>,
        buffer: Vec<u8>,
    ) -> Result<(), ()> {
        let result = ctx
            .table
            .fill_from_device_table_buffer(&buffer)
            .and_then(|_| ctx.configure_targets());
        match result {
            Ok(()) => post(ctx, Events::ConfigApplied),
            Err(err) => post(ctx, Events::Fail(err)),
        }
    }

    fn on_config_applied(&mut self, ctx: &mut InnerContext<impl UsbTransport>) -> Result<(), ()> {
        let result = request_async(ctx, ClassRequest::GetTargetDeviceTable, Events::TableReceived);
        post_result(ctx, result)
    }

    fn on_table_refreshed(
        &mut self,
        ctx: &mut InnerContext<impl UsbTransport>,
        buffer: Vec<u8>,
    ) -> Result<(), ()> {
        match ctx.table.fill_from_device_table_buffer(&buffer) {
            Ok(_) => post(ctx, Events::TableMerged),
            Err(err) => post(ctx, Events::Fail(err)),
        }
    }

    fn on_ready(&mut self, ctx: &mut InnerContext<impl UsbTransport>) -> Result<(), ()> {
        ctx.table.set_events_enabled(true);
        info!("Device ready, {} target(s)", ctx.table.len());
        Ok(())
    }

    fn on_failure(&mut self, ctx: &mut InnerContext<impl UsbTransport>, err: UsbI3cError) -> Result<(), ()> {
        error!("Initialization failed: {}", err);
        ctx.failure = Some(err);
        Ok(())
    }

    // Guards
    fn is_controller_capable(&self, ctx: &InnerContext<impl UsbTransport>) -> Result<bool, ()> {
        Ok(lock(&ctx.device)
            .capability
            .as_ref()
            .is_some_and(DeviceCapability::is_controller_capable))
    }

    fn is_bus_init_successful(
        &self,
        _ctx: &InnerContext<impl UsbTransport>,
        code: &BusInitCode,
    ) -> Result<bool, ()> {
        Ok(*code == BusInitCode::Success)
    }
}

// Implement the context struct
pub struct DefaultActions;
impl StateMachineActions for DefaultActions {}

pub struct InnerContext<T: UsbTransport> {
    pub transport: Arc<T>,
    pub device: Arc<Mutex<DeviceInfo>>,
    pub table: Arc<TargetDeviceTable>,
    pub tracker: Arc<RequestTracker>,
    pub event_queue: Sender<Events>,
    dispatcher: Arc<NotificationDispatcher<T>>,
    bulk_in_packets: usize,
    interrupt_in_started: bool,
    // Why the last run ended in `Failed`
    pub failure: Option<UsbI3cError>,
}

impl<T: UsbTransport> InnerContext<T> {
    /// Records the device capability and seeds the table with its static targets.
    pub fn apply_capability(&mut self, buffer: &[u8]) -> UsbI3cResult<()> {
        let capability = I3cCapability::decode(buffer)?;
        let device_capability = DeviceCapability::from(&capability);
        info!(
            "Device role {:?}, hot-join {}, IBI {}, handoff {}",
            device_capability.device_role,
            device_capability.hot_join,
            device_capability.in_band_interrupt,
            device_capability.handoff_controller_role
        );
        lock(&self.device).capability = Some(device_capability);
        if !capability.targets.is_empty() {
            let added = self.table.fill_from_capability_buffer(buffer)?;
            debug!("{} static target(s) known from capability", added);
        }
        Ok(())
    }

    /// Issues INITIALIZE_I3C_BUS. Static assignment is requested only when
    /// some known target has a static address.
    pub fn initialize_bus(&mut self) -> UsbI3cResult<()> {
        let census = self.table.identify_devices()?;
        let mode = if census.static_count > 0 {
            BusInitMode::StaticThenDynamic
        } else {
            BusInitMode::DynamicOnly
        };
        debug!("Initializing bus: {:?} ({:?})", mode, census);
        self.transport
            .control_out(ClassRequest::InitializeI3cBus, mode as u16, &[])?;
        Ok(())
    }

    /// Applies the controller's IBI and handoff support to every addressed target.
    pub fn configure_targets(&mut self) -> UsbI3cResult<()> {
        let capability = lock(&self.device)
            .capability
            .clone()
            .ok_or(StateError::CapabilitiesUnknown)?;
        let config = TargetConfig {
            target_interrupt_request: capability.in_band_interrupt,
            controller_role_request: capability.handoff_controller_role,
            ibi_timestamp: false,
        };
        let addresses = self.table.address_list();
        if addresses.is_empty() {
            return Ok(());
        }
        let buffer = self
            .table
            .create_target_config_buffer(config, capability.max_ibi_payload_size)?;
        self.transport
            .control_out(ClassRequest::SetTargetDeviceConfig, 0, &buffer)?;
        for address in addresses {
            self.table
                .update_config(address, config, capability.max_ibi_payload_size)?;
        }
        Ok(())
    }

    /// Starts polling for bulk responses, unless it is already running.
    /// Polling that ended with the response stream is started again.
    pub fn start_bulk_in(&mut self) -> UsbI3cResult<()> {
        if self.tracker.is_receiving() {
            return Ok(());
        }
        let buffer_size = self.transport.max_bulk_packet_size() * self.bulk_in_packets;
        let tracker = self.tracker.clone();
        // Set first so a stream end reported during the call is not overwritten.
        self.tracker.set_receiving(true);
        if let Err(err) = self
            .transport
            .start_bulk_in(buffer_size, Box::new(move |result| tracker.handle_bulk_in(result)))
        {
            self.tracker.set_receiving(false);
            return Err(err.into());
        }
        debug!("Bulk IN polling started, {} byte buffers", buffer_size);
        Ok(())
    }

    /// Starts polling for notifications. Done once per session.
    pub fn start_interrupt_in(&mut self) -> UsbI3cResult<()> {
        if self.interrupt_in_started {
            return Ok(());
        }
        let dispatcher = Arc::downgrade(&self.dispatcher);
        self.transport.start_interrupt_in(Box::new(move |result| {
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.handle_interrupt(result);
            }
        }))?;
        self.interrupt_in_started = true;
        debug!("Interrupt IN polling started");
        Ok(())
    }
}

pub struct Context<A: StateMachineActions, T: UsbTransport> {
    inner: A,
    pub inner_ctx: InnerContext<T>,
}

impl<A: StateMachineActions, T: UsbTransport> Context<A, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actions: A,
        transport: Arc<T>,
        device: Arc<Mutex<DeviceInfo>>,
        table: Arc<TargetDeviceTable>,
        tracker: Arc<RequestTracker>,
        dispatcher: Arc<NotificationDispatcher<T>>,
        event_queue: Sender<Events>,
        bulk_in_packets: usize,
    ) -> Self {
        Self {
            inner: actions,
            inner_ctx: InnerContext {
                transport,
                device,
                table,
                tracker,
                event_queue,
                dispatcher,
                bulk_in_packets,
                interrupt_in_started: false,
                failure: None,
            },
        }
    }

    pub fn failure(&self) -> Option<&UsbI3cError> {
        self.inner_ctx.failure.as_ref()
    }
}

// Macros to delegate the state machine actions to the custom StateMachineActions passed to the state machine
// This allows overriding the implementation of the actions and guards
macro_rules! delegate_to_inner_action {
    ($($fn_name:ident ($($arg:ident : $arg_ty:ty),*) -> $ret:ty),* $(,)?) => {
        $(
            fn $fn_name(&mut self, $($arg: $arg_ty),*) -> $ret {
                debug!("Init Action: {}", stringify!($fn_name));
                self.inner.$fn_name(&mut self.inner_ctx, $($arg),*)
            }
        )*
    };
}

macro_rules! delegate_to_inner_guard {
    ($($fn_name:ident ($($arg:ident : $arg_ty:ty),*) -> $ret:ty),* $(,)?) => {
        $(
            fn $fn_name(&self, $($arg: $arg_ty),*) -> $ret {
                debug!("Init Guard: {}", stringify!($fn_name));
                self.inner.$fn_name(&self.inner_ctx, $($arg),*)
            }
        )*
    };
}

impl<A: StateMachineActions, T: UsbTransport> StateMachineContext for Context<A, T> {
    delegate_to_inner_action! {
        on_start() -> Result<(), ()>,
        on_capability_received(buffer: Vec<u8>) -> Result<(), ()>,
        on_initialize_bus() -> Result<(), ()>,
        on_controller_not_capable() -> Result<(), ()>,
        on_bus_initialized(code: BusInitCode) -> Result<(), ()>,
        on_bus_init_failed(code: BusInitCode) -> Result<(), ()>,
        on_table_received(buffer: Vec<u8>) -> Result<(), ()>,
        on_config_applied() -> Result<(), ()>,
        on_table_refreshed(buffer: Vec<u8>) -> Result<(), ()>,
        on_ready() -> Result<(), ()>,
        on_failure(err: UsbI3cError) -> Result<(), ()>,
    }

    delegate_to_inner_guard! {
        is_controller_capable() -> Result<bool, ()>,
        is_bus_init_successful(code: &BusInitCode) -> Result<bool, ()>,
    }
}
