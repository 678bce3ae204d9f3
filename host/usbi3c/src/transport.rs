// Licensed under the Apache-2.0 license

use core::time::Duration;
use thiserror::Error;
use usbi3c_common::protocol::requests::ClassRequest;

// The USB function is reached through three kinds of endpoints:
//
//   control (EP0)     class-specific requests, synchronous or asynchronous
//   bulk OUT / IN     command batches and their responses
//   interrupt IN      notifications (bus init status, address changes)
//
// Enumeration, interface claiming and the transfer machinery itself belong to
// the transport. Asynchronous completions are only ever delivered from inside
// `wait_for_next_event`, which the session calls in a loop on its event thread.

/// Completion of an asynchronous control IN transfer.
pub type TransferCompletion = Box<dyn FnOnce(Result<Vec<u8>, TransportError>) + Send>;

/// Handler for a continuously polled IN endpoint. It is called once per
/// completed transfer with the received bytes, or with the error that ended it.
pub type InputHandler = Box<dyn FnMut(Result<&[u8], TransportError>) + Send>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer cancelled")]
    Cancelled,
    /// Error code of the underlying USB stack, passed through unchanged.
    #[error("native transport error {0}")]
    Native(i32),
}

pub trait UsbTransport: Send + Sync + 'static {
    /// Issues a class-specific control IN request and waits for its data stage.
    ///
    /// # Arguments
    ///
    /// * `request` - bRequest.
    /// * `value` - wValue.
    /// * `max_len` - wLength, the most bytes the device may return.
    fn control_in(
        &self,
        request: ClassRequest,
        value: u16,
        max_len: usize,
    ) -> Result<Vec<u8>, TransportError>;

    /// Issues a class-specific control OUT request carrying `data`.
    fn control_out(
        &self,
        request: ClassRequest,
        value: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Queues a control IN request; `completion` runs on the event thread.
    fn submit_control_in(
        &self,
        request: ClassRequest,
        value: u16,
        max_len: usize,
        completion: TransferCompletion,
    ) -> Result<(), TransportError>;

    /// Writes one transfer to the bulk OUT endpoint, returning the bytes written.
    fn bulk_out(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Starts polling the bulk IN endpoint with transfers of `buffer_size` bytes.
    fn start_bulk_in(&self, buffer_size: usize, handler: InputHandler)
        -> Result<(), TransportError>;

    /// Starts polling the interrupt IN endpoint.
    fn start_interrupt_in(&self, handler: InputHandler) -> Result<(), TransportError>;

    /// wMaxPacketSize of the bulk IN endpoint.
    fn max_bulk_packet_size(&self) -> usize;

    /// Blocks until at least one transfer completes or `timeout` expires, then
    /// runs the handlers of every completed transfer on the calling thread.
    /// Returns `TransportError::Timeout` when nothing completed.
    fn wait_for_next_event(&self, timeout: Duration) -> Result<(), TransportError>;
}
