use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

use crate::{
    error::{DatsError, Result},
    DATS_CHAR_UUID, DATS_SERVICE_UUID,
};

/// Maximum number of primary services kept from discovery
pub const MAX_PRIMARY_SERVICES: usize = 20;

/// LE address type of the peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Public device address
    #[default]
    Public,
    /// Random device address
    Random,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Random => write!(f, "random"),
        }
    }
}

/// Link security level requested for the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No encryption
    #[default]
    Low,
    /// Unauthenticated encryption
    Medium,
    /// Authenticated encryption
    High,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Connection is open, event listener not registered yet
    Connecting,
    /// Looking up the service and characteristic
    Discovering,
    /// Enabling notifications on the characteristic
    Subscribing,
    /// Requesting samples
    Polling,
    /// A fatal error occurred
    Error,
    /// Shut down on request
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Polling => write!(f, "Polling"),
            Self::Error => write!(f, "Error"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Inclusive range of attribute handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRange {
    /// First handle
    pub start: u16,
    /// Last handle
    pub end: u16,
}

impl HandleRange {
    /// Create a new handle range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if the handle lies within the range
    #[must_use]
    pub const fn contains(&self, handle: u16) -> bool {
        handle >= self.start && handle <= self.end
    }
}

impl fmt::Display for HandleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}-0x{:04x}", self.start, self.end)
    }
}

/// Primary service found by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryService {
    /// Service UUID
    pub uuid: Uuid,
    /// Handles covered by the service
    pub range: HandleRange,
}

/// Attribute found by descriptor discovery within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    /// Attribute handle
    pub handle: u16,
    /// Attribute type
    pub uuid: Uuid,
}

/// Primary services of the connected peer, filled once after connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    services: Vec<PrimaryService>,
}

impl ServiceTable {
    /// Build the table from discovery results
    ///
    /// # Errors
    ///
    /// Returns [`DatsError::ServiceTableFull`] if more than `capacity`
    /// services were discovered.
    pub fn from_discovered(services: Vec<PrimaryService>, capacity: usize) -> Result<Self> {
        if services.len() > capacity {
            return Err(DatsError::ServiceTableFull {
                capacity,
                found: services.len(),
            });
        }
        Ok(Self { services })
    }

    /// Find a service by UUID
    #[must_use]
    pub fn find(&self, uuid: &Uuid) -> Option<&PrimaryService> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    /// Number of services in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Iterate over the services in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &PrimaryService> {
        self.services.iter()
    }
}

/// Connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Local adapter interface, e.g. `hci0`
    pub adapter: Option<String>,
    /// Remote device address
    pub device: String,
    /// LE address type of the remote device
    pub addr_type: AddressType,
    /// Security level
    pub sec_level: SecurityLevel,
    /// Requested ATT MTU, `None` or 0 keeps the default
    pub mtu: Option<u16>,
    /// PSM for GATT over BR/EDR
    pub psm: Option<u16>,
}

impl ConnectionParams {
    /// Create parameters for the given device address
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Check the parameters before connecting
    ///
    /// # Errors
    ///
    /// Returns [`DatsError::InvalidParameters`] if the device address is
    /// missing or malformed.
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(DatsError::InvalidParameters(
                "Remote Bluetooth address required".to_string(),
            ));
        }
        btleplug::api::BDAddr::from_str(&self.device).map_err(|e| {
            DatsError::InvalidParameters(format!("Invalid Bluetooth address {}: {e}", self.device))
        })?;
        Ok(())
    }
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// How long to scan for the peer in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long to wait for a sample after a request, `None` waits forever
    pub response_timeout_ms: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            response_timeout_ms: None,
        }
    }
}

/// What the session looks for and how it polls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Primary service holding the sample characteristic
    pub service_uuid: Uuid,
    /// Sample characteristic
    pub characteristic_uuid: Uuid,
    /// Maximum number of primary services accepted from discovery
    pub max_primary_services: usize,
    /// How long to wait for a sample after a request
    pub response_timeout: Option<Duration>,
    /// Delay between two requests
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: DATS_SERVICE_UUID,
            characteristic_uuid: DATS_CHAR_UUID,
            max_primary_services: MAX_PRIMARY_SERVICES,
            response_timeout: None,
            poll_interval: Duration::ZERO,
        }
    }
}

impl SessionConfig {
    /// Build a session configuration from the timeout settings
    #[must_use]
    pub fn with_timeouts(timeouts: &TimeoutConfig) -> Self {
        Self {
            response_timeout: timeouts.response_timeout_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(uuid: Uuid, start: u16, end: u16) -> PrimaryService {
        PrimaryService {
            uuid,
            range: HandleRange::new(start, end),
        }
    }

    #[test]
    fn test_service_table_lookup() {
        let table = ServiceTable::from_discovered(
            vec![
                service(Uuid::from_u128(0x1800), 0x01, 0x07),
                service(DATS_SERVICE_UUID, 0x10, 0x20),
            ],
            MAX_PRIMARY_SERVICES,
        )
        .unwrap();

        assert_eq!(table.len(), 2);
        let found = table.find(&DATS_SERVICE_UUID).unwrap();
        assert_eq!(found.range, HandleRange::new(0x10, 0x20));
        assert!(table.find(&DATS_CHAR_UUID).is_none());

        let order: Vec<_> = table.iter().map(|s| s.range.start).collect();
        assert_eq!(order, vec![0x01, 0x10]);
    }

    #[test]
    fn test_service_table_capacity() {
        let services: Vec<_> = (0..=20u16)
            .map(|i| service(Uuid::from_u128(u128::from(i)), i * 10, i * 10 + 9))
            .collect();

        let full = ServiceTable::from_discovered(services[..20].to_vec(), MAX_PRIMARY_SERVICES);
        assert_eq!(full.unwrap().len(), 20);

        match ServiceTable::from_discovered(services, MAX_PRIMARY_SERVICES) {
            Err(DatsError::ServiceTableFull { capacity, found }) => {
                assert_eq!(capacity, 20);
                assert_eq!(found, 21);
            }
            other => panic!("expected capacity error, got {other:?}"),
        }
    }

    #[test]
    fn test_handle_range() {
        let range = HandleRange::new(0x10, 0x20);
        assert!(range.contains(0x10));
        assert!(range.contains(0x20));
        assert!(!range.contains(0x21));
        assert_eq!(range.to_string(), "0x0010-0x0020");
    }

    #[test]
    fn test_connection_params_validation() {
        assert!(ConnectionParams::new("C0:98:E5:49:00:01").validate().is_ok());

        let missing = ConnectionParams::default().validate();
        assert!(matches!(missing, Err(DatsError::InvalidParameters(_))));

        let malformed = ConnectionParams::new("C0:98:E5").validate();
        assert!(matches!(malformed, Err(DatsError::InvalidParameters(_))));

        let params = ConnectionParams {
            mtu: Some(0),
            ..ConnectionParams::new("C0:98:E5:49:00:01")
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.addr_type, AddressType::Public);
        assert_eq!(params.sec_level, SecurityLevel::Low);
        assert!(params.adapter.is_none());
        assert!(params.mtu.is_none());
        assert!(params.psm.is_none());
    }

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.connect_timeout_ms, 30_000);
        assert!(config.response_timeout_ms.is_none());

        let session = SessionConfig::with_timeouts(&TimeoutConfig {
            response_timeout_ms: Some(250),
            ..Default::default()
        });
        assert_eq!(session.response_timeout, Some(Duration::from_millis(250)));
        assert_eq!(session.service_uuid, DATS_SERVICE_UUID);
        assert_eq!(session.max_primary_services, MAX_PRIMARY_SERVICES);
    }

    #[test]
    fn test_display() {
        assert_eq!(AddressType::Random.to_string(), "random");
        assert_eq!(SecurityLevel::Medium.to_string(), "medium");
        assert_eq!(SessionState::Polling.to_string(), "Polling");
    }
}
