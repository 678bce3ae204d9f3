// Licensed under the Apache-2.0 license

use crate::error::{StateError, UsbI3cResult};
use crate::lock;
use crate::transport::TransportError;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use usbi3c_common::codec::UsbI3cCodec;
use usbi3c_common::message::bulk::{BulkResponse, CommandResponse};

/// What happens to a request once its callback has seen the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Forget the request.
    Release,
    /// Keep the request, with the response attached, until
    /// [`RequestTracker::take_retained`] removes it.
    Retain,
}

pub type ResponseCallback = Box<dyn FnMut(&CommandResponse) -> ResponseAction + Send>;
/// Receives a vendor-specific response payload, zero-padded to a whole
/// number of dwords.
pub type VendorCallback = Box<dyn FnMut(&[u8]) + Send>;

/// A submitted command waiting for, or holding, its response.
pub struct RegularRequest {
    pub request_id: u16,
    pub dependent_on_previous: bool,
    pub(crate) callback: ResponseCallback,
    pub response: Option<CommandResponse>,
}

impl RegularRequest {
    pub fn new(request_id: u16, dependent_on_previous: bool, callback: ResponseCallback) -> Self {
        Self {
            request_id,
            dependent_on_previous,
            callback,
            response: None,
        }
    }
}

impl core::fmt::Debug for RegularRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegularRequest")
            .field("request_id", &self.request_id)
            .field("dependent_on_previous", &self.dependent_on_previous)
            .field("response", &self.response)
            .finish()
    }
}

/// Callback-free view of a tracked request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub request_id: u16,
    pub dependent_on_previous: bool,
    pub response: Option<CommandResponse>,
}

struct TrackerState {
    next_request_id: u16,
    regular: Vec<RegularRequest>,
}

/// Correlates bulk responses with the requests that produced them.
///
/// Callbacks always run without the tracker lock held, so they may submit
/// new commands or take retained responses.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    vendor: Mutex<Option<VendorCallback>>,
    // Set while bulk IN polling delivers responses here
    receiving: AtomicBool,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_request_id: 0,
                regular: Vec::new(),
            }),
            vendor: Mutex::new(None),
            receiving: AtomicBool::new(false),
        }
    }

    /// Whether responses can currently arrive. Nothing sent before this is
    /// true would ever be answered.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    pub(crate) fn set_receiving(&self, receiving: bool) {
        self.receiving.store(receiving, Ordering::SeqCst);
    }

    /// Rejects submissions while no bulk IN polling is running.
    pub(crate) fn ensure_receiving(&self) -> UsbI3cResult<()> {
        if self.is_receiving() {
            Ok(())
        } else {
            Err(StateError::ResponsesNotReceived.into())
        }
    }

    /// Identifier the next submitted command will get.
    pub fn next_request_id(&self) -> u16 {
        lock(&self.state).next_request_id
    }

    /// Consumes `count` identifiers after a successful submission.
    pub(crate) fn advance_request_id(&self, count: usize) {
        let mut state = lock(&self.state);
        state.next_request_id = state.next_request_id.wrapping_add(count as u16);
    }

    pub(crate) fn track(&self, requests: Vec<RegularRequest>) {
        lock(&self.state).regular.extend(requests);
    }

    /// Removes requests whose transfer never reached the device.
    pub(crate) fn withdraw(&self, request_ids: &[u16]) -> Vec<RegularRequest> {
        let mut state = lock(&self.state);
        let (withdrawn, kept) = state
            .regular
            .drain(..)
            .partition(|r| r.response.is_none() && request_ids.contains(&r.request_id));
        state.regular = kept;
        withdrawn
    }

    pub fn set_vendor_callback(&self, callback: Option<VendorCallback>) {
        *lock(&self.vendor) = callback;
    }

    /// Handles one completion of the bulk IN endpoint.
    pub fn handle_bulk_in(&self, result: Result<&[u8], TransportError>) {
        match result {
            Ok(data) => {
                if let Err(err) = self.handle_bulk_response(data) {
                    error!("Dropping bulk response: {}", err);
                }
            }
            Err(TransportError::Timeout) => {}
            Err(err @ (TransportError::Disconnected | TransportError::Cancelled)) => {
                warn!("Bulk response stream ended: {}", err);
                self.set_receiving(false);
                self.fail_all();
            }
            Err(err) => warn!("Bulk IN transfer failed: {}", err),
        }
    }

    pub fn handle_bulk_response(&self, data: &[u8]) -> UsbI3cResult<()> {
        match BulkResponse::decode(data)? {
            BulkResponse::Regular(responses) => {
                for response in responses {
                    self.resolve(response);
                }
            }
            BulkResponse::VendorSpecific(payload) => self.resolve_vendor(&payload),
            BulkResponse::Ibi(payload) => {
                debug!("No IBI consumer, dropping {} bytes", payload.len());
            }
        }
        Ok(())
    }

    fn resolve(&self, response: CommandResponse) {
        let request = {
            let mut state = lock(&self.state);
            let index = state
                .regular
                .iter()
                .position(|r| r.request_id == response.request_id && r.response.is_none());
            match index {
                Some(index) => state.regular.remove(index),
                None => {
                    warn!(
                        "Response for untracked request {} dropped",
                        response.request_id
                    );
                    return;
                }
            }
        };

        let mut request = request;
        match (request.callback)(&response) {
            ResponseAction::Release => {}
            ResponseAction::Retain => {
                request.response = Some(response);
                lock(&self.state).regular.push(request);
            }
        }
    }

    fn resolve_vendor(&self, payload: &[u8]) {
        let callback = lock(&self.vendor).take();
        match callback {
            Some(mut callback) => {
                callback(payload);
                let mut slot = lock(&self.vendor);
                // A callback registered while this one ran takes precedence.
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
            None => warn!("Vendor response dropped, no callback registered"),
        }
    }

    /// Resolves every request still waiting for a response with a
    /// `TransportFailure` status. Retained requests are left alone.
    pub fn fail_all(&self) {
        let pending: Vec<RegularRequest> = {
            let mut state = lock(&self.state);
            let (pending, retained) = state.regular.drain(..).partition(|r| r.response.is_none());
            state.regular = retained;
            pending
        };
        for mut request in pending {
            let response = CommandResponse::transport_failure(request.request_id);
            if (request.callback)(&response) == ResponseAction::Retain {
                request.response = Some(response);
                lock(&self.state).regular.push(request);
            }
        }
    }

    /// Removes a retained request and returns its response. Requests still
    /// waiting for a response are not touched.
    pub fn take_retained(&self, request_id: u16) -> Option<CommandResponse> {
        let mut state = lock(&self.state);
        let index = state
            .regular
            .iter()
            .position(|r| r.request_id == request_id && r.response.is_some())?;
        state.regular.remove(index).response
    }

    pub fn retained_response(&self, request_id: u16) -> Option<CommandResponse> {
        lock(&self.state)
            .regular
            .iter()
            .find(|r| r.request_id == request_id)
            .and_then(|r| r.response.clone())
    }

    /// Requests submitted but not answered yet.
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .regular
            .iter()
            .filter(|r| r.response.is_none())
            .count()
    }

    /// Pending plus retained requests.
    pub fn tracked_count(&self) -> usize {
        lock(&self.state).regular.len()
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        lock(&self.state)
            .regular
            .iter()
            .map(|r| RequestRecord {
                request_id: r.request_id,
                dependent_on_previous: r.dependent_on_previous,
                response: r.response.clone(),
            })
            .collect()
    }
}
