//! Types shared by the master and slave halves of the library

use crate::common::frame::constants::MAX_ADU_LENGTH;
use crate::error::FrameParseError;

/// Modbus unit identifier, identifying the addressed device on a shared line
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId {
    value: u8,
}

pub(crate) mod constants {
    pub(crate) const BROADCAST: u8 = 0;
}

impl UnitId {
    /// Create a new `UnitId`
    pub const fn new(value: u8) -> Self {
        UnitId { value }
    }

    /// The broadcast unit id (0). Slaves process broadcast requests but never
    /// reply to them.
    pub const fn broadcast() -> Self {
        UnitId::new(constants::BROADCAST)
    }

    /// Underlying value
    pub const fn value(self) -> u8 {
        self.value
    }

    /// True if this is the broadcast address
    pub const fn is_broadcast(self) -> bool {
        self.value == constants::BROADCAST
    }
}

impl From<u8> for UnitId {
    fn from(value: u8) -> Self {
        UnitId::new(value)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#04X}", self.value)
    }
}

/// A headless protocol data unit: function code plus payload bytes, shared
/// across every framing. Addressing and checksums are added by the codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdu {
    function: u8,
    data: Vec<u8>,
}

impl Pdu {
    /// Create a PDU from a function code and payload bytes
    pub fn new(function: u8, data: Vec<u8>) -> Self {
        Pdu { function, data }
    }

    /// Function code
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Payload bytes, excluding the function code
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True if the function code has the exception bit set
    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }

    /// Number of bytes the PDU occupies before framing
    pub fn wire_size(&self) -> usize {
        1 + self.data.len()
    }

    /// Reassemble a PDU from a decoded frame payload
    pub(crate) fn parse(payload: &[u8]) -> Result<Self, FrameParseError> {
        match payload.split_first() {
            Some((function, data)) if payload.len() <= MAX_ADU_LENGTH => {
                Ok(Pdu::new(*function, data.to_vec()))
            }
            Some(_) => Err(FrameParseError::FrameTooBig(payload.len(), MAX_ADU_LENGTH)),
            None => Err(FrameParseError::FrameTooShort(0)),
        }
    }
}

impl std::fmt::Display for Pdu {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "function: {:#04X} (payload len = {})",
            self.function,
            self.data.len()
        )
    }
}
