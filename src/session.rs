use std::{future::Future, io::Write, time::Duration};
use tokio::{
    select,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    ble::GattClient,
    error::{DatsError, Result},
    output::{write_reading, OutputFormat},
    protocol::{
        hexdump, AttEvent, Reading, Sample, ATT_ECODE_INVALID_HANDLE, CCCD_ENABLE_NOTIFICATIONS,
        POLL_TRIGGER,
    },
    types::{ServiceTable, SessionConfig, SessionState},
};

/// Result of one request/notification round trip
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    /// The peripheral sent a sample worth reporting
    Reading(Reading),
    /// The sample was a sentinel or an out-of-range gesture
    Discarded,
    /// The payload did not have the sample size and was dropped
    Malformed {
        /// Received payload length
        len: usize,
    },
    /// The event was not a notification for the sample characteristic
    Ignored,
}

/// What a call to [`DatsSession::advance`] did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// The session moved to a new state
    Advanced(SessionState),
    /// One polling round completed
    Polled(PollOutcome),
}

/// Polling session with a Dats peripheral
///
/// The session is a state machine driven by [`DatsSession::advance`]:
///
/// ```text
/// Connecting -> Discovering -> Subscribing -> Polling -> Polling -> ...
///      \______________\______________\____________\-> Error
/// ```
///
/// Each call performs one step and returns. Any error other than a
/// malformed payload moves the session to [`SessionState::Error`], after
/// which it refuses to advance.
///
/// # Examples
///
/// ```no_run
/// use dats_accel::{
///     BtleplugClient, ConnectionParams, DatsSession, OutputFormat, SessionConfig, TimeoutConfig,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let params = ConnectionParams::new("C0:98:E5:49:00:01");
///     let client = BtleplugClient::connect(&params, &TimeoutConfig::default()).await?;
///     let mut session = DatsSession::new(client, SessionConfig::default());
///
///     let stop = async {
///         let _ = tokio::signal::ctrl_c().await;
///     };
///     session.run(&mut std::io::stdout(), OutputFormat::Text, stop).await?;
///     Ok(())
/// }
/// ```
pub struct DatsSession<C: GattClient> {
    client: C,
    config: SessionConfig,
    state: SessionState,
    services: ServiceTable,
    handle: Option<u16>,
    polls: u64,
}

impl<C: GattClient> DatsSession<C> {
    /// Create a session on an open connection
    pub fn new(client: C, config: SessionConfig) -> Self {
        Self {
            client,
            config,
            state: SessionState::Connecting,
            services: ServiceTable::default(),
            handle: None,
            polls: 0,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Resolved sample characteristic handle
    #[must_use]
    pub const fn handle(&self) -> Option<u16> {
        self.handle
    }

    /// Primary services found during discovery
    #[must_use]
    pub const fn services(&self) -> &ServiceTable {
        &self.services
    }

    /// Number of completed polling rounds
    #[must_use]
    pub const fn polls(&self) -> u64 {
        self.polls
    }

    /// Underlying GATT client
    pub const fn client(&self) -> &C {
        &self.client
    }

    /// Perform the next step of the session
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session, or
    /// [`DatsError::InvalidState`] if the session already ended.
    pub async fn advance(&mut self) -> Result<Step> {
        let result = match self.state {
            SessionState::Connecting => self
                .register_listener()
                .await
                .map(|()| SessionState::Discovering)
                .map(Step::Advanced),
            SessionState::Discovering => self
                .discover()
                .await
                .map(|()| SessionState::Subscribing)
                .map(Step::Advanced),
            SessionState::Subscribing => self
                .subscribe()
                .await
                .map(|()| SessionState::Polling)
                .map(Step::Advanced),
            SessionState::Polling => self.poll().await.map(Step::Polled),
            SessionState::Error | SessionState::Terminated => {
                return Err(DatsError::InvalidState {
                    state: self.state.to_string(),
                });
            }
        };

        match result {
            Ok(Step::Advanced(next)) => {
                debug!("{} -> {}", self.state, next);
                self.state = next;
                Ok(Step::Advanced(next))
            }
            Ok(step) => Ok(step),
            Err(e) => {
                error!("Session failed while {}: {}", self.state, e);
                self.state = SessionState::Error;
                Err(e)
            }
        }
    }

    /// Advance until the session is ready to poll
    ///
    /// # Errors
    ///
    /// Returns the first error raised during setup.
    pub async fn start(&mut self) -> Result<()> {
        while self.state != SessionState::Polling {
            self.advance().await?;
        }
        Ok(())
    }

    /// Drive the session and print readings until it fails or `stop` completes
    ///
    /// The connection is closed on every way out.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session, including failures to
    /// write a reading to `out`.
    pub async fn run<W: Write>(
        &mut self,
        out: &mut W,
        format: OutputFormat,
        stop: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(stop);

        let result = loop {
            select! {
                step = self.advance() => {
                    match step.and_then(|step| report(out, &step, format)) {
                        Ok(()) => {}
                        Err(e) => {
                            self.state = SessionState::Error;
                            break Err(e);
                        }
                    }
                }
                () = &mut stop => {
                    info!("Interrupted after {} polls", self.polls);
                    break Ok(());
                }
            }
        };

        if let Err(e) = self.shutdown().await {
            warn!("Disconnect failed: {e}");
        }
        result
    }

    /// Close the connection
    ///
    /// The session ends in [`SessionState::Terminated`] unless it already
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the client while disconnecting.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state != SessionState::Error {
            self.state = SessionState::Terminated;
        }
        self.client.disconnect().await
    }

    async fn register_listener(&mut self) -> Result<()> {
        debug!("Registering event listener, MTU {}", self.client.mtu());
        self.client.enable_events().await
    }

    /// Fill the service table and resolve the sample characteristic
    async fn discover(&mut self) -> Result<()> {
        let services = self
            .client
            .discover_primary_services()
            .await
            .map_err(|e| e.context("Discover all primary services"))?;

        self.services =
            ServiceTable::from_discovered(services, self.config.max_primary_services)?;
        debug!("Found {} primary services", self.services.len());
        for service in self.services.iter() {
            debug!("  {} {}", service.range, service.uuid);
        }

        let handle = self.resolve_characteristic().await?;
        self.handle = Some(handle);
        Ok(())
    }

    async fn resolve_characteristic(&mut self) -> Result<u16> {
        let target = self.config.service_uuid;
        debug!("Search for uuid {target}");

        let service = *self
            .services
            .find(&target)
            .ok_or(DatsError::ServiceNotFound(target))?;
        debug!("FOUND service {} range {}", service.uuid, service.range);

        let descriptors = self
            .client
            .discover_descriptors(service.range)
            .await
            .map_err(|e| e.context("Discover characteristics"))?;

        let wanted = self.config.characteristic_uuid;
        let descriptor = descriptors
            .iter()
            .find(|d| d.uuid == wanted)
            .ok_or(DatsError::CharacteristicNotFound(wanted))?;

        debug!("FOUND: handle = 0x{:04x}, uuid = {}", descriptor.handle, descriptor.uuid);
        Ok(descriptor.handle)
    }

    /// Enable notifications through the CCCD right after the value handle
    async fn subscribe(&mut self) -> Result<()> {
        let handle = self.resolved_handle()?;
        let cccd = handle.checked_add(1).ok_or(DatsError::Att {
            code: ATT_ECODE_INVALID_HANDLE,
        })?;

        self.client
            .write_characteristic(cccd, &CCCD_ENABLE_NOTIFICATIONS)
            .await
            .map_err(|e| e.context("Notification write request"))?;

        info!("Notifications enabled on handle 0x{handle:04x}");
        Ok(())
    }

    /// Request one sample and handle the event that answers it
    async fn poll(&mut self) -> Result<PollOutcome> {
        let handle = self.resolved_handle()?;

        if self.polls > 0 && !self.config.poll_interval.is_zero() {
            sleep(self.config.poll_interval).await;
        }

        debug!("Requesting sample on handle 0x{handle:04x}");
        self.client
            .write_characteristic(handle, &POLL_TRIGGER)
            .await
            .map_err(|e| e.context("Sending request"))?;

        let pdu = self.wait_for_event().await?;
        let outcome = self.handle_event(handle, &pdu).await?;
        self.polls += 1;
        Ok(outcome)
    }

    async fn wait_for_event(&mut self) -> Result<Vec<u8>> {
        match self.config.response_timeout {
            Some(limit) => timeout(limit, self.client.next_event())
                .await
                .map_err(|_| DatsError::Timeout {
                    timeout_ms: millis(limit),
                })?,
            None => self.client.next_event().await,
        }
    }

    async fn handle_event(&mut self, handle: u16, pdu: &[u8]) -> Result<PollOutcome> {
        match AttEvent::parse(pdu) {
            AttEvent::Notification { handle: h, value } if h == handle => {
                debug!("Received data: {}", hexdump(&value));
                Ok(decode_sample(&value))
            }
            AttEvent::Notification { handle: h, value } => {
                debug!("Notification on handle 0x{h:04X}: {} ignored", hexdump(&value));
                Ok(PollOutcome::Ignored)
            }
            AttEvent::Indication { handle: h, value } => {
                info!("Indication on handle 0x{h:04X}: {} ignored", hexdump(&value));
                self.client.send_confirmation().await?;
                Ok(PollOutcome::Ignored)
            }
            AttEvent::Invalid { opcode, handle: h } => {
                warn!("Invalid event (opcode {opcode:02X?}) on handle {h:04X?}");
                Ok(PollOutcome::Ignored)
            }
        }
    }

    fn resolved_handle(&self) -> Result<u16> {
        self.handle.ok_or_else(|| DatsError::InvalidState {
            state: format!("{} without a resolved handle", self.state),
        })
    }
}

fn report<W: Write>(out: &mut W, step: &Step, format: OutputFormat) -> Result<()> {
    match step {
        Step::Advanced(state) => info!("Session {state}"),
        Step::Polled(PollOutcome::Reading(reading)) => write_reading(out, reading, format)?,
        Step::Polled(_) => {}
    }
    Ok(())
}

fn decode_sample(payload: &[u8]) -> PollOutcome {
    match Sample::decode(payload) {
        Ok(sample) => sample
            .classify()
            .map_or(PollOutcome::Discarded, PollOutcome::Reading),
        Err(e) => {
            warn!("{e}");
            PollOutcome::Malformed { len: payload.len() }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
