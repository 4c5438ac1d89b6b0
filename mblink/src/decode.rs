/// Controls the decoding of transmitted and received data at the frame and physical layer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct DecodeLevel {
    /// Controls the frame (ADU) decoding: headers, checksums, payloads
    pub frame: FrameDecodeLevel,
    /// Controls the logging of physical layer reads/writes
    pub physical: PhysDecodeLevel,
}

/// Controls how transmitted and received frames are decoded at the INFO log level
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum FrameDecodeLevel {
    /// Decode nothing
    #[default]
    Nothing,
    /// Decode the frame header (unit id, transaction id, checksum)
    Header,
    /// Decode the header and the raw payload as hexadecimal
    Payload,
}

/// Controls how data transmitted at the physical layer (TCP, UDP, serial) is logged
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum PhysDecodeLevel {
    /// Log nothing
    #[default]
    Nothing,
    /// Log only the length of data that is sent and received
    Length,
    /// Log the length and the actual data that is sent and received
    Data,
}

impl DecodeLevel {
    /// construct a `DecodeLevel` with nothing enabled
    pub fn nothing() -> Self {
        Self::default()
    }

    /// construct a `DecodeLevel` from its fields
    pub fn new(frame: FrameDecodeLevel, physical: PhysDecodeLevel) -> Self {
        DecodeLevel { frame, physical }
    }
}

impl From<FrameDecodeLevel> for DecodeLevel {
    fn from(frame: FrameDecodeLevel) -> Self {
        Self {
            frame,
            physical: PhysDecodeLevel::Nothing,
        }
    }
}

impl FrameDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        !matches!(self, FrameDecodeLevel::Nothing)
    }

    pub(crate) fn payload_enabled(&self) -> bool {
        matches!(self, FrameDecodeLevel::Payload)
    }
}

impl PhysDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        !matches!(self, PhysDecodeLevel::Nothing)
    }

    pub(crate) fn data_enabled(&self) -> bool {
        matches!(self, PhysDecodeLevel::Data)
    }
}
