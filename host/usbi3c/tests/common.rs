// Licensed under the Apache-2.0 license
#![allow(dead_code)]

#[path = "mock_device.rs"]
pub mod mock_device;

use core::time::Duration;
use log::LevelFilter;
pub use mock_device::MockDevice;
use simple_logger::SimpleLogger;
use std::sync::{Arc, Mutex};
use usbi3c::init_sm::DefaultActions;
use usbi3c::request_tracker::{ResponseAction, ResponseCallback};
use usbi3c::session::{Options, UsbI3cSession};
use usbi3c_common::message::bulk::CommandResponse;

pub const TARGET_PIDS: [u64; 2] = [0x0123_4567_89ab, 0x0123_4567_89ac];

pub fn setup_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

/// Options with short waits so failing paths finish quickly.
pub fn test_options() -> Options<DefaultActions> {
    Options {
        init_step_timeout: Duration::from_secs(2),
        event_wait_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn open(device: &MockDevice) -> UsbI3cSession<MockDevice> {
    setup_logger();
    UsbI3cSession::open(device.clone(), test_options()).unwrap()
}

/// A device with two unaddressed targets and a session initialized on it.
pub fn setup() -> (MockDevice, UsbI3cSession<MockDevice>) {
    let device = MockDevice::new();
    for pid in TARGET_PIDS {
        device.add_target(pid, 0, 0, 0);
    }
    let session = open(&device);
    session.initialize().unwrap();
    (device, session)
}

/// Polls `condition` for up to five seconds.
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let timeout = Duration::from_secs(5);
    let start_time = std::time::Instant::now();
    while start_time.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Gives the event thread time to run anything already queued.
pub fn settle(device: &MockDevice) {
    assert!(wait_for(|| !device.has_pending_events()));
    std::thread::sleep(Duration::from_millis(100));
}

pub type Responses = Arc<Mutex<Vec<CommandResponse>>>;

/// A response callback recording every response it sees.
pub fn recording_callback(action: ResponseAction) -> (ResponseCallback, Responses) {
    let responses: Responses = Arc::new(Mutex::new(Vec::new()));
    let sink = responses.clone();
    let callback: ResponseCallback = Box::new(move |response: &CommandResponse| {
        sink.lock().unwrap().push(response.clone());
        action
    });
    (callback, responses)
}
