#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate measures parts from camera frames and distance sensors,
//! sorts them into size groups, and drives the relay bank that routes each
//! part to its bin.

pub mod calibration;
pub mod classify;
pub mod coil;
pub mod config;
pub mod counters;
mod error;
pub mod frame;
pub mod gate;
pub mod history;
pub mod laser;
pub mod measure;
mod net;
pub mod orchestrator;
pub mod retry;
pub mod targets;
pub mod watcher;

pub use error::{Error, Result};

use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

/// Set of three values describing the extent of a measured part.
///
/// All measurements are in millimeters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Dimensions {
    /// Longest extent seen from above, along the belt (X).
    pub length: f64,

    /// Extent seen from above, across the belt (Y).
    pub width: f64,

    /// Extent seen from the side (Z).
    pub height: f64,
}

impl Dimensions {
    /// Build from explicit values.
    pub fn new(length: f64, width: f64, height: f64) -> Self {
        Self { length, width, height }
    }

    /// Value along `axis`.
    pub fn along(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.length,
            Axis::Y => self.width,
            Axis::Z => self.height,
        }
    }

    /// Replace the value along `axis`.
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.length = value,
            Axis::Y => self.width = value,
            Axis::Z => self.height = value,
        }
    }
}

/// One of the three measurement axes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, Display, FromStr)]
pub enum Axis {
    /// Length, from the top camera.
    X,
    /// Width, from the top camera.
    Y,
    /// Height, from the side camera.
    Z,
}

impl Axis {
    /// All axes, in order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}
