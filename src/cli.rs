use clap::Parser;
use std::{ffi::OsString, time::Duration};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::{
    error::{DatsError, Result},
    output::OutputFormat,
    types::{AddressType, ConnectionParams, SecurityLevel, SessionConfig, TimeoutConfig},
    DATS_CHAR_UUID, DATS_SERVICE_UUID,
};

/// Command line of the `dats-accel` binary
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dats-accel",
    version,
    about = "Poll accelerometer samples from an Ambiq Dats peripheral over BLE"
)]
pub struct Args {
    /// Specify local adapter interface
    #[arg(short = 'i', long, value_name = "hciX")]
    pub adapter: Option<String>,

    /// Specify remote Bluetooth address
    #[arg(short = 'b', long, value_name = "MAC")]
    pub device: Option<String>,

    /// Set LE address type
    #[arg(short = 't', long = "addr-type", value_enum, default_value_t)]
    pub addr_type: AddressType,

    /// Specify the MTU size, 0 keeps the default
    #[arg(short = 'm', long, value_name = "MTU")]
    pub mtu: Option<u16>,

    /// Specify the PSM for GATT/ATT over BR/EDR
    #[arg(short = 'p', long, value_name = "PSM")]
    pub psm: Option<u16>,

    /// Set security level
    #[arg(short = 'l', long = "sec-level", value_enum, default_value_t)]
    pub sec_level: SecurityLevel,

    /// Enable diagnostic tracing
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Output format for readings
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Delay between two sample requests in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub interval: u64,

    /// Give up when a sample does not arrive within this many milliseconds, 0 waits forever
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub timeout: u64,

    /// How long to scan for the device in milliseconds
    #[arg(long = "scan-timeout", value_name = "MS", default_value_t = 10_000)]
    pub scan_timeout: u64,

    /// Primary service holding the sample characteristic
    #[arg(long = "service-uuid", value_name = "UUID", default_value_t = DATS_SERVICE_UUID)]
    pub service_uuid: Uuid,

    /// Sample characteristic
    #[arg(long = "char-uuid", value_name = "UUID", default_value_t = DATS_CHAR_UUID)]
    pub char_uuid: Uuid,
}

impl Args {
    /// Connection parameters from the command line
    ///
    /// # Errors
    ///
    /// Returns [`DatsError::InvalidParameters`] if no device address was
    /// given or the parameters are invalid.
    pub fn connection_params(&self) -> Result<ConnectionParams> {
        let device = self.device.clone().ok_or_else(|| {
            DatsError::InvalidParameters("Remote Bluetooth address required".to_string())
        })?;

        let params = ConnectionParams {
            adapter: self.adapter.clone(),
            device,
            addr_type: self.addr_type,
            sec_level: self.sec_level,
            mtu: self.mtu.filter(|mtu| *mtu != 0),
            psm: self.psm,
        };
        params.validate()?;
        Ok(params)
    }

    /// Timeouts from the command line
    #[must_use]
    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            scan_timeout_ms: self.scan_timeout,
            response_timeout_ms: (self.timeout > 0).then_some(self.timeout),
            ..Default::default()
        }
    }

    /// Session configuration from the command line
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service_uuid: self.service_uuid,
            characteristic_uuid: self.char_uuid,
            poll_interval: Duration::from_millis(self.interval),
            ..SessionConfig::with_timeouts(&self.timeouts())
        }
    }
}

/// Parse the command line
///
/// Usage errors, help and version output are printed here.
///
/// # Errors
///
/// Returns the exit status to stop with, see [`usage_exit_code`].
pub fn parse_args<I, T>(args: I) -> std::result::Result<Args, u8>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(args).map_err(|e| {
        let _ = e.print();
        usage_exit_code(&e)
    })
}

/// Exit status for a command line that did not parse
///
/// Help and version requests exit with 0, anything else is a
/// configuration error and exits with 1.
#[must_use]
pub fn usage_exit_code(error: &clap::Error) -> u8 {
    u8::from(error.use_stderr())
}

/// Install the stderr log subscriber
///
/// `RUST_LOG` is honoured unless `verbose` is set, which turns on debug
/// output for this crate.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,dats_accel=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}
