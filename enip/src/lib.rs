#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate implements just enough of EtherNet/IP explicit messaging to
//! read assembly data from a sensor: session registration, unconnected
//! `SendRRData` requests carrying a CIP `Get_Attribute_Single`, and session
//! teardown.

pub mod cip;
pub mod cpf;
pub mod encap;
mod error;
mod session;

pub use encap::{Command, Header};
pub use error::{Error, Result};
pub use session::Session;

/// Default EtherNet/IP explicit messaging port.
pub const DEFAULT_PORT: u16 = 44818;
