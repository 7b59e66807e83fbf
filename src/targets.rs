//! Actuation targets: the relay channels parts are routed with.

use std::time::Duration;

use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_port() -> u16 {
    modbus::DEFAULT_PORT
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1500
}

/// A 1-based coil address as printed on the relay board.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[display("{0}")]
pub struct CoilAddress(u16);

impl CoilAddress {
    /// Build from the 1-based address; 0 is rejected.
    pub fn new(one_based: u16) -> Result<Self> {
        if one_based == 0 {
            return Err(Error::InvalidCoilAddress(one_based));
        }
        Ok(Self(one_based))
    }

    /// The configured, 1-based address.
    pub fn one_based(self) -> u16 {
        self.0
    }

    /// The 0-based address that goes on the wire.
    pub fn wire(self) -> u16 {
        self.0 - 1
    }
}

impl TryFrom<u16> for CoilAddress {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CoilAddress> for u16 {
    fn from(value: CoilAddress) -> Self {
        value.0
    }
}

/// A relay channel on a networked relay board ("robot group").
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActuationTarget {
    /// Identifier rules refer to.
    pub id: u32,

    /// Operator-facing name.
    #[serde(default)]
    pub name: String,

    /// Relay board host name or address.
    #[serde(default)]
    pub host: String,

    /// Modbus/TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Modbus unit id.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Coil driven by this target.
    #[serde(default)]
    pub coil: Option<CoilAddress>,

    /// How long to hold the relay closed. Absent or 0 holds it closed.
    #[serde(default)]
    pub pulse_seconds: Option<u32>,
}

impl ActuationTarget {
    /// Whether this target has enough configuration to be driven.
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && self.coil.is_some()
    }

    /// The configured pulse length, if it is a real pulse.
    pub fn pulse(&self) -> Option<u32> {
        self.pulse_seconds.filter(|s| *s > 0)
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The device and coil this target writes to.
    ///
    /// # Errors
    ///
    /// Returns [Error::NoCoil] if the target has no coil address.
    pub fn coil_target(&self) -> Result<CoilTarget> {
        let coil = self.coil.ok_or(Error::NoCoil(self.id))?;
        Ok(CoilTarget {
            host: self.host.clone(),
            port: self.port,
            unit_id: self.unit_id,
            coil,
            timeout: self.timeout(),
        })
    }
}

/// Fully resolved address of a single coil, carried in errors and logs.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{host}:{port} unit {unit_id} coil {coil}")]
pub struct CoilTarget {
    /// Relay board host.
    pub host: String,
    /// Modbus/TCP port.
    pub port: u16,
    /// Modbus unit id.
    pub unit_id: u8,
    /// 1-based coil address.
    pub coil: CoilAddress,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// The configured set of actuation targets.
#[derive(Debug, Clone, Default)]
pub struct ActuationTargets {
    targets: Vec<ActuationTarget>,
}

impl ActuationTargets {
    /// Wrap a list of targets.
    pub fn new(targets: Vec<ActuationTarget>) -> Self {
        Self { targets }
    }

    /// Look up a target by id.
    pub fn get(&self, id: u32) -> Option<&ActuationTarget> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Look up a target by id, failing if it is absent or has no coil.
    pub fn coil_target(&self, id: u32) -> Result<CoilTarget> {
        self.get(id).ok_or(Error::UnknownTarget(id))?.coil_target()
    }

    /// All targets.
    pub fn iter(&self) -> impl Iterator<Item = &ActuationTarget> {
        self.targets.iter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_coil_address_wire_mapping() {
        assert_eq!(CoilAddress::new(1).unwrap().wire(), 0);
        assert_eq!(CoilAddress::new(30).unwrap().wire(), 29);
        assert_eq!(CoilAddress::new(3).unwrap().wire(), 2);
    }

    #[test]
    fn test_coil_address_zero_rejected() {
        assert!(matches!(CoilAddress::new(0), Err(Error::InvalidCoilAddress(0))));
    }

    #[test]
    fn test_target_from_toml() {
        let target: ActuationTarget = toml::from_str(
            r#"
            id = 4
            name = "Bin 4"
            host = "10.0.0.5"
            coil = 3
            pulse_seconds = 2
        "#,
        )
        .unwrap();

        assert_eq!(target.port, 502);
        assert_eq!(target.unit_id, 1);
        assert_eq!(target.timeout(), Duration::from_millis(1500));
        assert_eq!(target.pulse(), Some(2));
        assert!(target.is_configured());
        assert_eq!(
            target.coil_target().unwrap().to_string(),
            "10.0.0.5:502 unit 1 coil 3"
        );
    }

    #[test]
    fn test_target_with_coil_zero_fails_to_parse() {
        let target: Result<ActuationTarget, _> = toml::from_str(
            r#"
            id = 4
            host = "10.0.0.5"
            coil = 0
        "#,
        );
        assert!(target.is_err());
    }

    #[test]
    fn test_unconfigured_target() {
        let target = ActuationTarget {
            id: 16,
            name: "Release".to_string(),
            host: String::new(),
            port: 502,
            unit_id: 1,
            timeout_ms: 1500,
            coil: None,
            pulse_seconds: Some(0),
        };
        assert!(!target.is_configured());
        assert_eq!(target.pulse(), None);

        let targets = ActuationTargets::new(vec![target]);
        assert!(matches!(targets.coil_target(16), Err(Error::NoCoil(16))));
        assert!(matches!(targets.coil_target(3), Err(Error::UnknownTarget(3))));
    }
}
