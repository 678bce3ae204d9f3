// Licensed under the Apache-2.0 license

pub mod command;
pub mod notification;
pub mod requests;
