use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::{
    ble::{GattClient, CCCD_UUID, CHARACTERISTIC_DECL_UUID},
    error::{DatsError, Result},
    protocol::{encode_confirmation, ATT_DEFAULT_LE_MTU},
    types::{AttributeDescriptor, HandleRange, PrimaryService},
    DATS_CHAR_UUID, DATS_SERVICE_UUID,
};

const GAP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);

/// Scripted peer for session tests
#[derive(Debug, Default)]
pub struct MockGattClient {
    pub services: Vec<PrimaryService>,
    pub descriptors: Vec<AttributeDescriptor>,
    pub discover_status: Option<u8>,
    pub descriptor_status: Option<u8>,
    pub write_status: HashMap<u16, u8>,
    pub events: VecDeque<Vec<u8>>,
    pub hang_when_idle: bool,

    pub listening: bool,
    pub connected: bool,
    pub writes: Vec<(u16, Vec<u8>)>,
    pub descriptor_requests: Vec<HandleRange>,
    pub sent: Vec<Bytes>,
}

impl MockGattClient {
    /// Peer exposing GAP and the Dats service, sample value at 0x15
    pub fn with_dats_device() -> Self {
        Self {
            services: vec![
                PrimaryService {
                    uuid: GAP_SERVICE_UUID,
                    range: HandleRange::new(0x01, 0x07),
                },
                PrimaryService {
                    uuid: DATS_SERVICE_UUID,
                    range: HandleRange::new(0x10, 0x20),
                },
            ],
            descriptors: vec![
                AttributeDescriptor {
                    handle: 0x14,
                    uuid: CHARACTERISTIC_DECL_UUID,
                },
                AttributeDescriptor {
                    handle: 0x15,
                    uuid: DATS_CHAR_UUID,
                },
                AttributeDescriptor {
                    handle: 0x16,
                    uuid: CCCD_UUID,
                },
            ],
            connected: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl GattClient for MockGattClient {
    async fn enable_events(&mut self) -> Result<()> {
        self.listening = true;
        Ok(())
    }

    async fn discover_primary_services(&mut self) -> Result<Vec<PrimaryService>> {
        if let Some(code) = self.discover_status {
            return Err(DatsError::Att { code });
        }
        Ok(self.services.clone())
    }

    async fn discover_descriptors(
        &mut self,
        range: HandleRange,
    ) -> Result<Vec<AttributeDescriptor>> {
        self.descriptor_requests.push(range);
        if let Some(code) = self.descriptor_status {
            return Err(DatsError::Att { code });
        }
        Ok(self
            .descriptors
            .iter()
            .filter(|d| range.contains(d.handle))
            .copied()
            .collect())
    }

    async fn write_characteristic(&mut self, handle: u16, value: &[u8]) -> Result<()> {
        if let Some(code) = self.write_status.get(&handle) {
            return Err(DatsError::Att { code: *code });
        }
        self.writes.push((handle, value.to_vec()));
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Vec<u8>> {
        if let Some(pdu) = self.events.pop_front() {
            return Ok(pdu);
        }
        if self.hang_when_idle {
            std::future::pending::<()>().await;
        }
        Err(DatsError::Disconnected)
    }

    async fn send_confirmation(&mut self) -> Result<()> {
        self.sent.push(encode_confirmation());
        Ok(())
    }

    fn mtu(&self) -> u16 {
        ATT_DEFAULT_LE_MTU
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.listening = false;
        Ok(())
    }
}
