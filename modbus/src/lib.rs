#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate implements a small Modbus/TCP client, enough to drive and read
//! back the coils of a relay bank.
//!
//! Addresses at this layer are always the 0-based addresses that go on the
//! wire. Translating from the 1-based numbering printed on a device's
//! terminal block is the caller's job.

mod client;
mod error;
pub mod frame;

pub use client::Client;
pub use error::{Error, Result};
pub use frame::{ExceptionCode, FunctionCode, Request, Response};

/// Default Modbus/TCP port.
pub const DEFAULT_PORT: u16 = 502;
