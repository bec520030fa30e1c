use crate::error::{DatsError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a sample payload in bytes
pub const SAMPLE_SIZE: usize = 12;

/// Size of the opcode + handle header in front of a notification value
pub const EVENT_HEADER_SIZE: usize = 3;

/// ATT opcode of a handle value notification
pub const ATT_OP_HANDLE_NOTIFY: u8 = 0x1B;

/// ATT opcode of a handle value indication
pub const ATT_OP_HANDLE_IND: u8 = 0x1D;

/// ATT opcode of a handle value confirmation
pub const ATT_OP_HANDLE_CNF: u8 = 0x1E;

/// Fixed L2CAP channel carrying ATT on LE links
pub const ATT_CID: u16 = 4;

/// Default ATT MTU on LE links
pub const ATT_DEFAULT_LE_MTU: u16 = 23;

/// ATT error code for a handle outside the attribute table
pub const ATT_ECODE_INVALID_HANDLE: u8 = 0x01;

/// ATT error code for a write to a handle that does not accept writes
pub const ATT_ECODE_WRITE_NOT_PERM: u8 = 0x03;

/// ATT error code for an empty discovery range
pub const ATT_ECODE_ATTR_NOT_FOUND: u8 = 0x0A;

/// CCCD value enabling notifications
pub const CCCD_ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Value written to the sample characteristic to request a new sample.
/// The peripheral only looks at the write itself, not its content.
pub const POLL_TRIGGER: [u8; 1] = [0x00];

/// First decoded value of a sample the peripheral uses as a no-op marker
pub const SENTINEL_VALUE: f32 = 0.9375;

/// First decoded value announcing a gesture sample
pub const GESTURE_MARKER: f32 = 0.0;

/// Highest valid gesture index
pub const GESTURE_INDEX_MAX: f32 = 5.0;

/// Highest valid gesture score
pub const GESTURE_SCORE_MAX: f32 = 1.0;

/// Three floats decoded from a notification payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Values in payload order
    pub values: [f32; 3],
}

impl Sample {
    /// Decode a notification payload
    ///
    /// Each value is a big-endian IEEE-754 single precision float; the
    /// peripheral sends the bytes of its native float reversed.
    ///
    /// # Errors
    ///
    /// Returns [`DatsError::PayloadLength`] when the payload is not exactly
    /// [`SAMPLE_SIZE`] bytes long.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != SAMPLE_SIZE {
            return Err(DatsError::PayloadLength { len: payload.len() });
        }

        let mut buf = payload;
        let values = [buf.get_f32(), buf.get_f32(), buf.get_f32()];

        Ok(Self { values })
    }

    /// Encode the sample the way the peripheral does
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SAMPLE_SIZE);
        for value in self.values {
            buf.put_f32(value);
        }
        buf.freeze()
    }

    /// Classify the sample
    ///
    /// Returns `None` for the sentinel sample and for gesture samples whose
    /// index or score are out of range. Comparisons are exact: the
    /// peripheral encodes its markers as exact float values.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn classify(&self) -> Option<Reading> {
        let [v0, v1, v2] = self.values;

        if v0 == SENTINEL_VALUE {
            return None;
        }

        if v0 == GESTURE_MARKER {
            if !(0.0..=GESTURE_INDEX_MAX).contains(&v1) || !(0.0..=GESTURE_SCORE_MAX).contains(&v2)
            {
                return None;
            }
            return Some(Reading::Gesture {
                index: v1,
                score: v2,
            });
        }

        Some(Reading::Raw {
            x: v0,
            y: v1,
            z: v2,
        })
    }
}

/// Something worth reporting from a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    /// Three-axis accelerometer sample
    Raw {
        /// First axis
        x: f32,
        /// Second axis
        y: f32,
        /// Third axis
        z: f32,
    },
    /// Gesture reported by the peripheral's classifier
    Gesture {
        /// Gesture index, 0 to 5
        index: f32,
        /// Classifier score, 0 to 1
        score: f32,
    },
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw { x, y, z } => write!(f, "{x:04.2},{y:04.2},{z:04.2}"),
            Self::Gesture { index, score } => {
                write!(f, "Gesture detected index {index:04.2} score {score:04.2}")
            }
        }
    }
}

/// Server-initiated ATT event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttEvent {
    /// Handle value notification
    Notification {
        /// Attribute handle
        handle: u16,
        /// Attribute value
        value: Vec<u8>,
    },
    /// Handle value indication, must be confirmed
    Indication {
        /// Attribute handle
        handle: u16,
        /// Attribute value
        value: Vec<u8>,
    },
    /// Any other PDU
    Invalid {
        /// Opcode, if the PDU had one
        opcode: Option<u8>,
        /// Handle, if the PDU was long enough to carry one
        handle: Option<u16>,
    },
}

impl AttEvent {
    /// Split an event PDU into opcode, handle and value
    ///
    /// Layout: opcode (1 byte), handle (2 bytes little-endian), value.
    #[must_use]
    pub fn parse(pdu: &[u8]) -> Self {
        if pdu.len() < EVENT_HEADER_SIZE {
            return Self::Invalid {
                opcode: pdu.first().copied(),
                handle: None,
            };
        }

        let mut buf = pdu;
        let opcode = buf.get_u8();
        let handle = buf.get_u16_le();
        let value = buf.to_vec();

        match opcode {
            ATT_OP_HANDLE_NOTIFY => Self::Notification { handle, value },
            ATT_OP_HANDLE_IND => Self::Indication { handle, value },
            _ => Self::Invalid {
                opcode: Some(opcode),
                handle: Some(handle),
            },
        }
    }
}

/// Build a handle value notification PDU
#[must_use]
pub fn encode_notification(handle: u16, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EVENT_HEADER_SIZE + value.len());
    buf.put_u8(ATT_OP_HANDLE_NOTIFY);
    buf.put_u16_le(handle);
    buf.extend_from_slice(value);
    buf.freeze()
}

/// Build a handle value confirmation PDU
#[must_use]
pub fn encode_confirmation() -> Bytes {
    Bytes::from_static(&[ATT_OP_HANDLE_CNF])
}

/// Space separated hex dump
#[must_use]
pub fn hexdump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// MTU to use for an opened ATT channel
///
/// On the fixed LE channel the MTU starts at the LE default; a larger
/// value must be negotiated with an exchange MTU request first.
#[must_use]
pub fn effective_mtu(negotiated: Option<u16>, cid: u16) -> u16 {
    if cid == ATT_CID {
        return ATT_DEFAULT_LE_MTU;
    }
    negotiated
        .filter(|mtu| *mtu != 0)
        .unwrap_or(ATT_DEFAULT_LE_MTU)
}

/// Human readable text for an ATT error code
#[must_use]
pub const fn att_error_description(code: u8) -> &'static str {
    match code {
        0x01 => "Invalid handle",
        0x02 => "Attribute can't be read",
        0x03 => "Attribute can't be written",
        0x04 => "Attribute PDU was invalid",
        0x05 => "Attribute requires authentication before read/write",
        0x06 => "Server doesn't support the request received",
        0x07 => "Offset past the end of the attribute",
        0x08 => "Attribute requires authorization before read/write",
        0x09 => "Too many prepare writes have been queued",
        0x0A => "No attribute found within the given range",
        0x0B => "Attribute can't be read/written using Read Blob Req",
        0x0C => "Encryption Key Size is insufficient",
        0x0D => "Attribute value length is invalid",
        0x0E => "Request attribute has encountered an unlikely error",
        0x0F => "Encryption required before read/write",
        0x10 => "Attribute type is not a supported grouping attribute",
        0x11 => "Insufficient Resources to complete the request",
        0x80 => "Internal application error: I/O",
        0x81 => "A timeout occured",
        0x82 => "The operation was aborted",
        _ => "Unexpected error code",
    }
}
