use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        Service, ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, future::Future, pin::Pin, str::FromStr, time::Duration};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{DatsError, Result},
    protocol::{
        effective_mtu, encode_notification, ATT_CID, ATT_ECODE_ATTR_NOT_FOUND,
        ATT_ECODE_INVALID_HANDLE, ATT_ECODE_WRITE_NOT_PERM,
    },
    types::{
        AddressType, AttributeDescriptor, ConnectionParams, HandleRange, PrimaryService,
        SecurityLevel, TimeoutConfig,
    },
};

/// Primary service declaration attribute type
pub const PRIMARY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_2800_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic declaration attribute type
pub const CHARACTERISTIC_DECL_UUID: Uuid =
    Uuid::from_u128(0x0000_2803_0000_1000_8000_0080_5f9b_34fb);

/// Client characteristic configuration descriptor attribute type
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// GATT client operations a session needs from the BLE stack
///
/// Every call is a single request/response exchange with the peer; errors
/// reported by the peer surface as [`DatsError::Att`].
#[async_trait]
pub trait GattClient: Send {
    /// Start delivering notifications and indications to [`GattClient::next_event`]
    async fn enable_events(&mut self) -> Result<()>;

    /// Discover all primary services of the peer
    async fn discover_primary_services(&mut self) -> Result<Vec<PrimaryService>>;

    /// Discover all attributes within a handle range
    async fn discover_descriptors(&mut self, range: HandleRange)
        -> Result<Vec<AttributeDescriptor>>;

    /// Write an attribute value and wait for the write response
    async fn write_characteristic(&mut self, handle: u16, value: &[u8]) -> Result<()>;

    /// Wait for the next notification or indication PDU
    async fn next_event(&mut self) -> Result<Vec<u8>>;

    /// Confirm a received indication
    async fn send_confirmation(&mut self) -> Result<()>;

    /// ATT MTU of the channel
    fn mtu(&self) -> u16;

    /// Close the connection
    async fn disconnect(&mut self) -> Result<()>;
}

/// What an attribute handle refers to in the btleplug service model
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttributeKind {
    Service,
    Declaration,
    Value(Characteristic),
    Cccd {
        characteristic: Characteristic,
        value_handle: u16,
    },
    Descriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    handle: u16,
    uuid: Uuid,
    kind: AttributeKind,
}

/// Handle table laid out like a GATT server database
///
/// btleplug hides attribute handles, so they are assigned in the usual
/// server order: service declaration, then for each characteristic its
/// declaration, its value, its CCCD and any other descriptors.
#[derive(Debug, Clone, Default)]
struct AttributeTable {
    attributes: Vec<Attribute>,
    services: Vec<PrimaryService>,
}

impl AttributeTable {
    fn build<'a>(services: impl IntoIterator<Item = &'a Service>) -> Self {
        let mut table = Self::default();
        let mut handle: u16 = 0;
        let mut next = || {
            handle = handle.saturating_add(1);
            handle
        };

        for service in services.into_iter().filter(|s| s.primary) {
            let start = next();
            table.push(start, PRIMARY_SERVICE_UUID, AttributeKind::Service);
            let mut end = start;

            for characteristic in &service.characteristics {
                table.push(next(), CHARACTERISTIC_DECL_UUID, AttributeKind::Declaration);
                let value_handle = next();
                table.push(
                    value_handle,
                    characteristic.uuid,
                    AttributeKind::Value(characteristic.clone()),
                );
                end = value_handle;

                let notifies = characteristic
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE);
                if notifies {
                    table.push(
                        next(),
                        CCCD_UUID,
                        AttributeKind::Cccd {
                            characteristic: characteristic.clone(),
                            value_handle,
                        },
                    );
                    end = table.last_handle();
                }

                for descriptor in characteristic
                    .descriptors
                    .iter()
                    .filter(|d| !(notifies && d.uuid == CCCD_UUID))
                {
                    table.push(next(), descriptor.uuid, AttributeKind::Descriptor);
                    end = table.last_handle();
                }
            }

            table.services.push(PrimaryService {
                uuid: service.uuid,
                range: HandleRange::new(start, end),
            });
        }

        table
    }

    fn push(&mut self, handle: u16, uuid: Uuid, kind: AttributeKind) {
        self.attributes.push(Attribute { handle, uuid, kind });
    }

    fn last_handle(&self) -> u16 {
        self.attributes.last().map_or(0, |a| a.handle)
    }

    fn get(&self, handle: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.handle == handle)
    }

    fn descriptors(&self, range: HandleRange) -> Vec<AttributeDescriptor> {
        self.attributes
            .iter()
            .filter(|a| range.contains(a.handle))
            .map(|a| AttributeDescriptor {
                handle: a.handle,
                uuid: a.uuid,
            })
            .collect()
    }

    /// Characteristic and value handle configured by the CCCD at `handle`
    fn cccd_target(&self, handle: u16) -> Option<(&Characteristic, u16)> {
        match self.get(handle).map(|a| &a.kind) {
            Some(AttributeKind::Cccd {
                characteristic,
                value_handle,
            }) => Some((characteristic, *value_handle)),
            _ => None,
        }
    }
}

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// [`GattClient`] running on top of [`btleplug`]
pub struct BtleplugClient {
    peripheral: Peripheral,
    table: AttributeTable,
    notifications: Option<NotificationStream>,
    subscriptions: HashMap<Uuid, u16>,
    mtu: u16,
}

impl BtleplugClient {
    /// Find the peer on the requested adapter and connect to it
    ///
    /// # Errors
    ///
    /// Returns [`DatsError::AdapterNotFound`] if no adapter matches,
    /// [`DatsError::DeviceNotFound`] if the peer does not show up within the
    /// scan timeout, [`DatsError::Timeout`] if connecting takes too long,
    /// or [`DatsError::ConnectionFailed`] if the connection is refused.
    pub async fn connect(params: &ConnectionParams, timeouts: &TimeoutConfig) -> Result<Self> {
        params.validate()?;
        let address = BDAddr::from_str(&params.device)
            .map_err(|e| DatsError::InvalidParameters(e.to_string()))?;

        log_unsupported_options(params);

        let manager = Manager::new().await?;
        let adapter = select_adapter(&manager, params.adapter.as_deref()).await?;
        let peripheral = find_peripheral(&adapter, address, timeouts.scan_timeout_ms).await?;

        info!("Connecting to {address}");
        timeout(
            Duration::from_millis(timeouts.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| DatsError::Timeout {
            timeout_ms: timeouts.connect_timeout_ms,
        })?
        .map_err(|e| DatsError::ConnectionFailed(e.to_string()))?;

        if let Err(e) = peripheral.discover_services().await {
            return with_cleanup(Err(e.into()), peripheral.disconnect()).await;
        }
        let table = AttributeTable::build(&peripheral.services());
        debug!(
            "Attribute table has {} entries in {} primary services",
            table.attributes.len(),
            table.services.len()
        );

        // btleplug only exposes LE links, which carry ATT on the fixed channel
        let mtu = effective_mtu(params.mtu, ATT_CID);
        info!("Connected to {address}, MTU {mtu}");

        Ok(Self {
            peripheral,
            table,
            notifications: None,
            subscriptions: HashMap::new(),
            mtu,
        })
    }

    fn value_characteristic(&self, handle: u16) -> Result<&Characteristic> {
        match self.table.get(handle).map(|a| &a.kind) {
            Some(AttributeKind::Value(c)) => Ok(c),
            Some(_) => Err(DatsError::Att {
                code: ATT_ECODE_WRITE_NOT_PERM,
            }),
            None => Err(DatsError::Att {
                code: ATT_ECODE_INVALID_HANDLE,
            }),
        }
    }
}

#[async_trait]
impl GattClient for BtleplugClient {
    async fn enable_events(&mut self) -> Result<()> {
        debug!("Registering notification listener");
        self.notifications = Some(self.peripheral.notifications().await?);
        Ok(())
    }

    async fn discover_primary_services(&mut self) -> Result<Vec<PrimaryService>> {
        Ok(self.table.services.clone())
    }

    async fn discover_descriptors(
        &mut self,
        range: HandleRange,
    ) -> Result<Vec<AttributeDescriptor>> {
        let descriptors = self.table.descriptors(range);
        if descriptors.is_empty() {
            return Err(DatsError::Att {
                code: ATT_ECODE_ATTR_NOT_FOUND,
            });
        }
        Ok(descriptors)
    }

    async fn write_characteristic(&mut self, handle: u16, value: &[u8]) -> Result<()> {
        if let Some((characteristic, value_handle)) = self.table.cccd_target(handle) {
            debug!("CCCD write 0x{handle:04x} {value:02X?}");
            let uuid = characteristic.uuid;
            if value.iter().any(|b| *b != 0) {
                self.peripheral.subscribe(characteristic).await?;
                // Notifications only carry the characteristic UUID
                let previous = self.subscriptions.insert(uuid, value_handle);
                if let Some(previous) = previous.filter(|h| *h != value_handle) {
                    warn!("Notifications for {uuid} moved from 0x{previous:04x}");
                }
            } else {
                self.peripheral.unsubscribe(characteristic).await?;
                self.subscriptions.remove(&uuid);
            }
            return Ok(());
        }

        let characteristic = self.value_characteristic(handle)?;
        self.peripheral
            .write(characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .notifications
            .as_mut()
            .ok_or_else(|| DatsError::Protocol("Event listener not registered".to_string()))?;

        loop {
            let notification = stream.next().await.ok_or(DatsError::Disconnected)?;
            if let Some(handle) = self.subscriptions.get(&notification.uuid) {
                return Ok(encode_notification(*handle, &notification.value).to_vec());
            }
            debug!("Notification for unsubscribed characteristic {}", notification.uuid);
        }
    }

    async fn send_confirmation(&mut self) -> Result<()> {
        // The platform stack confirms indications before handing them over
        debug!("Indication already confirmed by the platform stack");
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.notifications = None;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

fn log_unsupported_options(params: &ConnectionParams) {
    if params.addr_type != AddressType::Public {
        warn!(
            "Address type {} cannot be selected on this platform, using the stack default",
            params.addr_type
        );
    }
    if params.sec_level != SecurityLevel::Low {
        warn!(
            "Security level {} cannot be selected on this platform, using the stack default",
            params.sec_level
        );
    }
    if let Some(psm) = params.psm {
        warn!("GATT over BR/EDR (PSM {psm}) is not supported, using LE");
    }
}

/// Pick the adapter whose description starts with the interface name
async fn select_adapter(manager: &Manager, interface: Option<&str>) -> Result<Adapter> {
    let adapters = manager.adapters().await?;

    for adapter in adapters {
        let info = adapter.adapter_info().await?;
        debug!("Found adapter {info}");
        match interface {
            Some(name) if !info.starts_with(name) => continue,
            _ => return Ok(adapter),
        }
    }

    Err(DatsError::AdapterNotFound(
        interface.unwrap_or("default").to_string(),
    ))
}

/// Scan until a peripheral with the given address shows up
async fn find_peripheral(
    adapter: &Adapter,
    address: BDAddr,
    scan_timeout_ms: u64,
) -> Result<Peripheral> {
    info!("Scanning for {address}...");
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = Instant::now() + Duration::from_millis(scan_timeout_ms);
    let found = poll_peripherals(adapter, address, deadline).await;

    with_cleanup(found, adapter.stop_scan()).await
}

async fn poll_peripherals(
    adapter: &Adapter,
    address: BDAddr,
    deadline: Instant,
) -> Result<Peripheral> {
    loop {
        let peripherals = adapter.peripherals().await?;
        if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == address) {
            return Ok(peripheral);
        }
        if Instant::now() >= deadline {
            return Err(DatsError::DeviceNotFound);
        }
        sleep(SCAN_POLL_INTERVAL).await;
    }
}

/// Run `cleanup` whatever `result` is
///
/// The first error wins; a cleanup failure after an earlier error is only
/// logged.
async fn with_cleanup<T>(
    result: Result<T>,
    cleanup: impl Future<Output = btleplug::Result<()>>,
) -> Result<T> {
    match (result, cleanup.await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_error)) => {
            warn!("Cleanup after failure failed: {cleanup_error}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::Descriptor;
    use std::collections::BTreeSet;

    const SERVICE: Uuid = crate::DATS_SERVICE_UUID;
    const VALUE: Uuid = crate::DATS_CHAR_UUID;
    const OTHER: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb);
    const GAP: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);

    fn characteristic(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: service,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn services() -> Vec<Service> {
        let mut gap_chars = BTreeSet::new();
        gap_chars.insert(characteristic(GAP, OTHER, CharPropFlags::READ));

        let mut dats_value = characteristic(
            SERVICE,
            VALUE,
            CharPropFlags::WRITE | CharPropFlags::NOTIFY,
        );
        dats_value.descriptors.insert(Descriptor {
            uuid: CCCD_UUID,
            service_uuid: SERVICE,
            characteristic_uuid: VALUE,
        });
        let mut dats_chars = BTreeSet::new();
        dats_chars.insert(dats_value);

        vec![
            Service {
                uuid: GAP,
                primary: true,
                characteristics: gap_chars,
            },
            Service {
                uuid: SERVICE,
                primary: true,
                characteristics: dats_chars,
            },
        ]
    }

    #[test]
    fn test_attribute_table_layout() {
        let table = AttributeTable::build(&services());

        assert_eq!(
            table.services,
            vec![
                PrimaryService {
                    uuid: GAP,
                    range: HandleRange::new(1, 3),
                },
                PrimaryService {
                    uuid: SERVICE,
                    range: HandleRange::new(4, 7),
                },
            ]
        );

        let handle = 6;
        assert!(matches!(
            table.get(handle).map(|a| &a.kind),
            Some(AttributeKind::Value(c)) if c.uuid == VALUE
        ));
        let (characteristic, value_handle) = table.cccd_target(handle + 1).unwrap();
        assert_eq!(characteristic.uuid, VALUE);
        assert_eq!(value_handle, handle);
        assert_eq!(table.get(handle - 1).unwrap().uuid, CHARACTERISTIC_DECL_UUID);
        assert!(table.cccd_target(handle).is_none());
    }

    #[test]
    fn test_cccd_targets_its_own_service() {
        const MIRROR: Uuid = Uuid::from_u128(0xe026_2760_08c2_11e1_9073_0e8a_c72e_2001);

        let mirror_value =
            characteristic(MIRROR, VALUE, CharPropFlags::WRITE | CharPropFlags::NOTIFY);
        let mut mirror_chars = BTreeSet::new();
        mirror_chars.insert(mirror_value);

        let mut services = services();
        services.insert(
            1,
            Service {
                uuid: MIRROR,
                primary: true,
                characteristics: mirror_chars,
            },
        );

        // GAP 1-3, mirror 4-7, Dats 8-11
        let table = AttributeTable::build(&services);
        assert_eq!(table.services[2].range, HandleRange::new(8, 11));

        let (characteristic, value_handle) = table.cccd_target(11).unwrap();
        assert_eq!(characteristic.service_uuid, SERVICE);
        assert_eq!(value_handle, 10);

        let (characteristic, value_handle) = table.cccd_target(7).unwrap();
        assert_eq!(characteristic.service_uuid, MIRROR);
        assert_eq!(value_handle, 6);
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_failure() {
        let mut cleaned = false;
        let result: Result<u8> = with_cleanup(Err(DatsError::DeviceNotFound), async {
            cleaned = true;
            Ok::<(), btleplug::Error>(())
        })
        .await;

        assert!(matches!(result, Err(DatsError::DeviceNotFound)));
        assert!(cleaned);
    }

    #[tokio::test]
    async fn test_cleanup_error_handling() {
        let result = with_cleanup(Err::<u8, _>(DatsError::Disconnected), async {
            Err::<(), _>(btleplug::Error::NotConnected)
        })
        .await;
        assert!(matches!(result, Err(DatsError::Disconnected)));

        let failing = async { Err::<(), _>(btleplug::Error::NotConnected) };
        let result = with_cleanup(Ok(7u8), failing).await;
        assert!(matches!(result, Err(DatsError::Ble(_))));

        let result = with_cleanup(Ok(7u8), async { Ok::<(), btleplug::Error>(()) }).await;
        assert_eq!(tokio_test::assert_ok!(result), 7);
    }

    #[test]
    fn test_attribute_table_descriptors() {
        let table = AttributeTable::build(&services());
        let descriptors = table.descriptors(HandleRange::new(4, 7));

        let uuids: Vec<_> = descriptors.iter().map(|d| d.uuid).collect();
        assert_eq!(
            uuids,
            vec![PRIMARY_SERVICE_UUID, CHARACTERISTIC_DECL_UUID, VALUE, CCCD_UUID]
        );
        assert!(table.descriptors(HandleRange::new(20, 30)).is_empty());
    }

    #[test]
    fn test_secondary_services_are_skipped() {
        let mut services = services();
        services[0].primary = false;

        let table = AttributeTable::build(&services);
        assert_eq!(table.services.len(), 1);
        assert_eq!(table.services[0].range, HandleRange::new(1, 4));
    }
}
