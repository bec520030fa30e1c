#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # dats-accel
//!
//! Poll accelerometer samples from an Ambiq "Dats" Bluetooth Low Energy
//! peripheral.
//!
//! The peripheral exposes one vendor characteristic inside a vendor primary
//! service. Writing a single zero byte to that characteristic asks for a
//! sample, which arrives as a 12 byte notification holding three big-endian
//! `f32` values. The values are either a raw `x,y,z` acceleration, a gesture
//! detection (`0.0, index, score`) or the "no data" sentinel `0.9375`.
//!
//! A session walks through a small state machine:
//!
//! 1. **Connecting**: register the notification listener on the link
//! 2. **Discovering**: enumerate primary services and find the Dats service
//! 3. **Subscribing**: locate the sample characteristic and enable notifications
//! 4. **Polling**: request a sample, wait for the notification, report it
//!
//! ## Quick Start
//!
//! ```no_run
//! use dats_accel::{BtleplugClient, ConnectionParams, DatsSession, PollOutcome, SessionConfig,
//!     Step, TimeoutConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = ConnectionParams::new("C0:98:E5:49:00:01");
//!     let client = BtleplugClient::connect(&params, &TimeoutConfig::default()).await?;
//!
//!     let mut session = DatsSession::new(client, SessionConfig::default());
//!     session.start().await?;
//!
//!     loop {
//!         if let Step::Polled(PollOutcome::Reading(reading)) = session.advance().await? {
//!             println!("{reading}");
//!         }
//!     }
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Command line handling
pub mod cli;
/// Error types and handling
pub mod error;
/// Reading output formatting
pub mod output;
/// Sample decoding and ATT framing
pub mod protocol;
/// Polling session state machine
pub mod session;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod mock;

use uuid::Uuid;

pub use ble::{BtleplugClient, GattClient};
pub use error::{DatsError, Result};
pub use output::OutputFormat;
pub use protocol::{AttEvent, Reading, Sample};
pub use session::{DatsSession, PollOutcome, Step};
pub use types::{
    AddressType, ConnectionParams, HandleRange, PrimaryService, SecurityLevel, SessionConfig,
    SessionState, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dats primary service UUID
pub const DATS_SERVICE_UUID: Uuid = Uuid::from_u128(0xe026_2760_08c2_11e1_9073_0e8a_c72e_1001);

/// Dats sample characteristic UUID
///
/// Used both for sample requests (write) and for sample delivery
/// (notification). The client characteristic configuration descriptor sits
/// at the handle right after the value.
pub const DATS_CHAR_UUID: Uuid = Uuid::from_u128(0xe026_2760_08c2_11e1_9073_0e8a_c72e_0001);
