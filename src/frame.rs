/// CAN data frame and its canonical on-wire bit layout
///
/// Frames are built programmatically and never parsed back from a bit
/// stream. The encoding exists for fidelity checks and for observers that
/// want to render what a transmission looks like on the wire.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Highest 11-bit standard identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// Maximum payload of a classic CAN data frame
pub const MAX_PAYLOAD_LEN: usize = 8;

/// Fixed 15-bit pattern standing in for the CRC sequence
pub const CRC_PLACEHOLDER: u16 = 0x5555;

const SOF_BITS: usize = 1;
const ID_BITS: usize = 11;
const RTR_BITS: usize = 1;
const DLC_BITS: usize = 4;
const CRC_BITS: usize = 15;
const ACK_BITS: usize = 2;
const EOF_BITS: usize = 7;

/// Logical bus level. Dominant overrides recessive when both are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bit {
    Dominant,
    Recessive,
}

impl Bit {
    fn from_flag(set: bool) -> Self {
        if set { Bit::Recessive } else { Bit::Dominant }
    }

    pub fn as_char(&self) -> char {
        match self {
            Bit::Dominant => '0',
            Bit::Recessive => '1',
        }
    }
}

/// Fields of a standard data frame, in transmission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameField {
    StartOfFrame,
    Identifier,
    Rtr,
    Dlc,
    Data,
    Crc,
    Ack,
    EndOfFrame,
}

/// Whether a frame carries regular traffic or is the synchronization frame
/// sent one identifier below a contested id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Data,
    Preceding,
}

/// Frame construction errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Identifier does not fit in 11 bits
    IdOutOfRange(u16),
    /// More than 8 payload bytes
    PayloadTooLong(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::IdOutOfRange(id) => {
                write!(f, "CAN id 0x{:X} exceeds 11-bit range (max 0x{:03X})", id, MAX_STANDARD_ID)
            }
            FrameError::PayloadTooLong(len) => {
                write!(f, "payload of {} bytes exceeds {} byte limit", len, MAX_PAYLOAD_LEN)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// One transmission attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    id: u16,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(id: u16, payload: Vec<u8>) -> Result<Self, FrameError> {
        if id > MAX_STANDARD_ID {
            return Err(FrameError::IdOutOfRange(id));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self { id, payload })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Data length code (0-8)
    pub fn dlc(&self) -> u8 {
        self.payload.len() as u8
    }

    /// Total number of bits on the wire: 41 fixed bits plus 8 per payload byte
    pub fn bit_len(&self) -> usize {
        SOF_BITS + ID_BITS + RTR_BITS + DLC_BITS + self.payload.len() * 8 + CRC_BITS + ACK_BITS + EOF_BITS
    }

    /// Bit ranges occupied by each field within `encode()`
    pub fn field_layout(&self) -> Vec<(FrameField, Range<usize>)> {
        let widths = [
            (FrameField::StartOfFrame, SOF_BITS),
            (FrameField::Identifier, ID_BITS),
            (FrameField::Rtr, RTR_BITS),
            (FrameField::Dlc, DLC_BITS),
            (FrameField::Data, self.payload.len() * 8),
            (FrameField::Crc, CRC_BITS),
            (FrameField::Ack, ACK_BITS),
            (FrameField::EndOfFrame, EOF_BITS),
        ];

        let mut offset = 0;
        widths
            .iter()
            .map(|&(field, width)| {
                let range = offset..offset + width;
                offset += width;
                (field, range)
            })
            .collect()
    }

    /// Canonical bit sequence, MSB first for every multi-bit field
    pub fn encode(&self) -> Vec<Bit> {
        let mut bits = Vec::with_capacity(self.bit_len());

        bits.push(Bit::Dominant);
        push_msb_first(&mut bits, self.id as u32, ID_BITS);
        bits.push(Bit::Dominant); // data frame
        push_msb_first(&mut bits, self.dlc() as u32, DLC_BITS);
        for byte in &self.payload {
            push_msb_first(&mut bits, *byte as u32, 8);
        }
        push_msb_first(&mut bits, CRC_PLACEHOLDER as u32, CRC_BITS);
        bits.extend(std::iter::repeat(Bit::Recessive).take(ACK_BITS + EOF_BITS));

        debug_assert_eq!(bits.len(), self.bit_len());
        bits
    }

    /// Encoded frame rendered as '0'/'1' characters
    pub fn bit_string(&self) -> String {
        self.encode().iter().map(Bit::as_char).collect()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self
            .payload
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "ID=0x{:03X} DLC={} [{}]", self.id, self.dlc(), data)
    }
}

fn push_msb_first(bits: &mut Vec<Bit>, value: u32, width: usize) {
    for shift in (0..width).rev() {
        bits.push(Bit::from_flag((value >> shift) & 1 == 1));
    }
}
