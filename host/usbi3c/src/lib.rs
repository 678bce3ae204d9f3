// Licensed under the Apache-2.0 license

//! Host-side protocol engine for I3C over USB.
//!
//! A [`session::UsbI3cSession`] owns the device state, the target device
//! table, the request tracker and the initialization state machine. USB
//! completions are delivered by the transport on a dedicated event thread and
//! routed to the tracker (bulk IN) or the notification dispatcher (interrupt IN).

pub mod command_queue;
pub mod device_info;
pub mod error;
pub mod init_sm;
pub mod notification;
pub mod request_tracker;
pub mod session;
pub mod target_table;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
