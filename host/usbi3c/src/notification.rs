// Licensed under the Apache-2.0 license

use crate::error::UsbI3cResult;
use crate::init_sm::Events;
use crate::target_table::TargetDeviceTable;
use crate::transport::{TransportError, UsbTransport};
use log::{debug, error, info, warn};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use usbi3c_common::codec::UsbI3cCodec;
use usbi3c_common::message::address_change::AddressChangeResult;
use usbi3c_common::protocol::notification::{AddressChangeCode, Notification, NotificationKind};
use usbi3c_common::protocol::requests::{ClassRequest, MAX_CONTROL_IN_LENGTH};

/// Reacts to records arriving on the interrupt endpoint.
///
/// Runs on the transport's event thread. Follow-up control transfers are
/// always asynchronous so the event thread never blocks on itself.
pub struct NotificationDispatcher<T: UsbTransport> {
    // Weak: the transport owns the interrupt handler that owns this dispatcher.
    transport: Weak<T>,
    table: Arc<TargetDeviceTable>,
    init_events: Sender<Events>,
}

impl<T: UsbTransport> NotificationDispatcher<T> {
    pub fn new(transport: &Arc<T>, table: Arc<TargetDeviceTable>, init_events: Sender<Events>) -> Self {
        Self {
            transport: Arc::downgrade(transport),
            table,
            init_events,
        }
    }

    /// Handles one completion of the interrupt endpoint.
    pub fn handle_interrupt(&self, result: Result<&[u8], TransportError>) {
        match result {
            Ok(data) => {
                if let Err(err) = self.handle_notification(data) {
                    error!("Dropping notification {:02x?}: {}", data, err);
                }
            }
            Err(TransportError::Timeout) => {}
            Err(err) => warn!("Interrupt transfer failed: {}", err),
        }
    }

    pub fn handle_notification(&self, data: &[u8]) -> UsbI3cResult<()> {
        let notification = Notification::decode(data)?;
        match notification.kind()? {
            NotificationKind::BusInitialization(code) => {
                debug!("Bus initialization status: {:?}", code);
                if self.init_events.send(Events::BusInitStatus(code)).is_err() {
                    warn!("Bus initialization status {:?} arrived with no listener", code);
                }
            }
            NotificationKind::AddressChange(AddressChangeCode::HotJoinAddressAssignmentFailed) => {
                info!("A target tried to hot-join but got no address");
            }
            NotificationKind::AddressChange(AddressChangeCode::HotJoinAddressAssignmentSucceeded) => {
                self.fetch_target_device_table()?;
            }
            NotificationKind::AddressChange(
                code @ (AddressChangeCode::AllAddressChangesSucceeded
                | AddressChangeCode::SomeAddressChangesFailed),
            ) => {
                debug!("Address change status: {:?}", code);
                self.fetch_address_change_result()?;
            }
        }
        Ok(())
    }

    fn transport(&self) -> UsbI3cResult<Arc<T>> {
        self.transport
            .upgrade()
            .ok_or(TransportError::Disconnected.into())
    }

    fn fetch_target_device_table(&self) -> UsbI3cResult<()> {
        let table = self.table.clone();
        self.transport()?.submit_control_in(
            ClassRequest::GetTargetDeviceTable,
            0,
            MAX_CONTROL_IN_LENGTH,
            Box::new(move |result| match result {
                Ok(buffer) => match table.fill_from_device_table_buffer(&buffer) {
                    Ok(added) => info!("Hot-join: {} new target(s)", added),
                    Err(err) => error!("Hot-join table rejected: {}", err),
                },
                Err(err) => warn!("Hot-join table fetch failed: {}", err),
            }),
        )?;
        Ok(())
    }

    fn fetch_address_change_result(&self) -> UsbI3cResult<()> {
        let table = self.table.clone();
        self.transport()?.submit_control_in(
            ClassRequest::GetAddressChangeResult,
            0,
            MAX_CONTROL_IN_LENGTH,
            Box::new(move |result| match result {
                Ok(buffer) => {
                    if let Err(err) = apply_address_change_result(&table, &buffer) {
                        error!("Address change result rejected: {}", err);
                    }
                }
                Err(err) => warn!("Address change result fetch failed: {}", err),
            }),
        )?;
        Ok(())
    }
}

/// Moves table entries according to a GET_ADDRESS_CHANGE_RESULT buffer.
///
/// Failed and no-op entries are skipped. A move the table refuses leaves the
/// device at its old address. Returns the number of devices moved.
pub fn apply_address_change_result(table: &TargetDeviceTable, buffer: &[u8]) -> UsbI3cResult<usize> {
    let result = AddressChangeResult::decode(buffer)?;
    let mut moved = 0;
    for entry in &result.entries {
        if !entry.succeeded() || entry.old_address == entry.new_address {
            continue;
        }
        match table.change_address(entry.old_address, entry.new_address) {
            Ok(()) => moved += 1,
            Err(err) => warn!(
                "Target {:#04x} kept its address, move to {:#04x} refused: {}",
                entry.old_address, entry.new_address, err
            ),
        }
    }
    Ok(moved)
}
