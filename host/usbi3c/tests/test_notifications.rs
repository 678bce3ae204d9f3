// Licensed under the Apache-2.0 license

#[cfg(test)]
mod common;

use std::sync::{Arc, Mutex};
use usbi3c::error::{UsbI3cError, ValidationError};
use usbi3c_common::codec::UsbI3cCodec;
use usbi3c_common::protocol::notification::{AddressChangeCode, Notification};
use usbi3c_common::protocol::requests::ClassRequest;

const HOT_JOIN_PID: u64 = 0x0456_0000_0001;

fn record_hotjoins(session: &usbi3c::session::UsbI3cSession<common::MockDevice>) -> Arc<Mutex<Vec<u8>>> {
    let joined = Arc::new(Mutex::new(Vec::new()));
    let sink = joined.clone();
    session.on_hotjoin(Some(Box::new(move |address| {
        sink.lock().unwrap().push(address);
    })));
    joined
}

#[test]
fn test_hotjoin_reports_new_target() {
    let (device, session) = common::setup();
    let joined = record_hotjoins(&session);

    let address = device.hot_join(HOT_JOIN_PID);
    assert_eq!(address, 0x0a);
    assert!(common::wait_for(|| !joined.lock().unwrap().is_empty()));

    assert_eq!(*joined.lock().unwrap(), vec![0x0a]);
    assert_eq!(session.target_device(0x0a).unwrap().pid(), HOT_JOIN_PID);
    assert_eq!(session.target_device_addresses(), vec![0x08, 0x09, 0x0a]);
}

#[test]
fn test_repeated_hotjoin_notification_reports_once() {
    let (device, session) = common::setup();
    let joined = record_hotjoins(&session);

    device.hot_join(HOT_JOIN_PID);
    assert!(common::wait_for(|| !joined.lock().unwrap().is_empty()));
    device.deliver_notification(
        Notification::address_change(AddressChangeCode::HotJoinAddressAssignmentSucceeded)
            .to_bytes()
            .unwrap(),
    );
    assert!(common::wait_for(|| {
        device.control_in_count(ClassRequest::GetTargetDeviceTable) == 4
    }));
    common::settle(&device);

    assert_eq!(*joined.lock().unwrap(), vec![0x0a]);
    assert_eq!(session.target_devices().len(), 3);
}

#[test]
fn test_failed_hotjoin_fetches_nothing() {
    let (device, session) = common::setup();
    let joined = record_hotjoins(&session);
    let fetches = device.control_in_count(ClassRequest::GetTargetDeviceTable);

    device.deliver_notification(
        Notification::address_change(AddressChangeCode::HotJoinAddressAssignmentFailed)
            .to_bytes()
            .unwrap(),
    );
    common::settle(&device);

    assert_eq!(device.control_in_count(ClassRequest::GetTargetDeviceTable), fetches);
    assert!(joined.lock().unwrap().is_empty());
}

#[test]
fn test_change_target_address() {
    let (device, session) = common::setup();

    session.change_target_address(0x08, 0x20).unwrap();
    assert!(common::wait_for(|| session.target_device(0x20).is_some()));

    assert!(session.target_device(0x08).is_none());
    assert_eq!(session.target_device(0x20).unwrap().pid(), common::TARGET_PIDS[0]);
    assert!(device.device_table().iter().any(|e| e.address == 0x20));
    assert_eq!(device.control_in_count(ClassRequest::GetAddressChangeResult), 1);
}

#[test]
fn test_change_target_address_rejected_locally() {
    let (device, session) = common::setup();

    assert_eq!(
        session.change_target_address(0x08, 0x09),
        Err(UsbI3cError::Validation(ValidationError::AddressInUse(0x09)))
    );
    assert_eq!(
        session.change_target_address(0x30, 0x31),
        Err(UsbI3cError::Validation(ValidationError::UnknownTarget(0x30)))
    );
    assert_eq!(
        session.change_target_address(0x08, 0x80),
        Err(UsbI3cError::Validation(ValidationError::AddressOutOfRange(0x80)))
    );
    assert_eq!(
        session.change_target_address(0x08, 0),
        Err(UsbI3cError::Validation(ValidationError::AddressOutOfRange(0)))
    );
    assert_eq!(device.control_out_count(ClassRequest::ChangeDynamicAddress), 0);
}

#[test]
fn test_malformed_notification_is_dropped() {
    let (device, session) = common::setup();
    let joined = record_hotjoins(&session);

    // Unknown notification type, then a truncated record.
    device.deliver_notification(vec![0x7f, 0x00, 0x00, 0x00]);
    device.deliver_notification(vec![0x02]);
    common::settle(&device);
    assert_eq!(session.target_device_addresses(), vec![0x08, 0x09]);

    let address = device.hot_join(HOT_JOIN_PID);
    assert!(common::wait_for(|| joined.lock().unwrap().contains(&address)));
}

#[test]
fn test_table_fetch_failure_leaves_table_unchanged() {
    let (device, session) = common::setup();
    let joined = record_hotjoins(&session);
    device.stall(ClassRequest::GetTargetDeviceTable);

    device.hot_join(HOT_JOIN_PID);
    assert!(common::wait_for(|| {
        device.control_in_count(ClassRequest::GetTargetDeviceTable) == 3
    }));
    common::settle(&device);

    assert_eq!(session.target_device_addresses(), vec![0x08, 0x09]);
    assert!(joined.lock().unwrap().is_empty());
}

#[test]
fn test_no_hotjoin_callback_during_initialization() {
    common::setup_logger();
    let device = common::MockDevice::new();
    device.add_target(common::TARGET_PIDS[0], 0, 0, 0);
    let session = common::open(&device);
    let joined = record_hotjoins(&session);

    session.initialize().unwrap();
    assert_eq!(session.target_device_addresses(), vec![0x08]);
    assert!(joined.lock().unwrap().is_empty());
}
