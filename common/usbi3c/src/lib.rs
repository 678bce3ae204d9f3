// Licensed under the Apache-2.0 license

//! Wire formats of the USB I3C device class.
//!
//! Everything in this crate is a pure encode/decode step: no I/O and no
//! shared state. The host engine in the `usbi3c` crate and the device-side
//! test doubles both build on these types.

pub mod codec;
pub mod message;
pub mod protocol;
