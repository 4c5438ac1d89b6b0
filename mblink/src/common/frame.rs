use crate::common::buffer::ReadBuffer;
use crate::common::cursor::WriteCursor;
use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::{FrameParseError, RequestError};
use crate::serial::ascii::AsciiParser;
use crate::serial::bin::BinParser;
use crate::serial::rtu::RtuParser;
use crate::tcp::frame::MbapParser;
use crate::types::{Pdu, UnitId};

pub(crate) mod constants {
    /// maximum size of a headless PDU (function code + data)
    pub(crate) const MAX_ADU_LENGTH: usize = 253;
    /// largest frame any framing produces: an ASCII frame at maximum payload
    /// (start token + hex digits + checksum digits + CRLF)
    pub(crate) const MAX_FRAME_LENGTH: usize = 1 + 2 * (1 + MAX_ADU_LENGTH + 1) + 2;
    /// discarded corrupt frames tolerated per read before giving up
    pub(crate) const DEFAULT_MAX_DISCARDS: usize = 8;
}

/// Transaction identifier carried by the MBAP header, assigned by the master
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct TxId {
    value: u16,
}

impl TxId {
    /// Create a transaction id from a raw value
    pub fn new(value: u16) -> Self {
        TxId { value }
    }

    /// The raw value as written into the MBAP header
    pub fn to_u16(self) -> u16 {
        self.value
    }

    pub(crate) fn next(&mut self) -> TxId {
        let ret = self.value;
        self.value = self.value.wrapping_add(1);
        TxId::new(ret)
    }
}

impl Default for TxId {
    fn default() -> Self {
        TxId::new(0)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.value)
    }
}

/// Addressing information attached to a frame. `tx_id` is present only for
/// MBAP (TCP/UDP) framing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// the addressed unit
    pub unit_id: UnitId,
    /// transaction id, assigned per request on MBAP framings
    pub tx_id: Option<TxId>,
}

impl FrameHeader {
    pub(crate) fn new_tcp_header(unit_id: UnitId, tx_id: TxId) -> Self {
        FrameHeader {
            unit_id,
            tx_id: Some(tx_id),
        }
    }

    pub(crate) fn new_serial_header(unit_id: UnitId) -> Self {
        FrameHeader {
            unit_id,
            tx_id: None,
        }
    }
}

/// A decoded frame: header plus the headless PDU bytes (function + data)
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) header: FrameHeader,
    length: usize,
    adu: [u8; constants::MAX_ADU_LENGTH],
}

impl Frame {
    pub(crate) fn new(header: FrameHeader) -> Frame {
        Frame {
            header,
            length: 0,
            adu: [0; constants::MAX_ADU_LENGTH],
        }
    }

    pub(crate) fn set(&mut self, src: &[u8]) -> Result<(), FrameParseError> {
        match self.adu.get_mut(..src.len()) {
            Some(dest) => {
                dest.copy_from_slice(src);
                self.length = src.len();
                Ok(())
            }
            None => Err(FrameParseError::FrameTooBig(
                src.len(),
                constants::MAX_ADU_LENGTH,
            )),
        }
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.adu[0..self.length]
    }

    pub(crate) fn pdu(&self) -> Result<Pdu, FrameParseError> {
        Pdu::parse(self.payload())
    }
}

/// The framing variants available to masters and slaves
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum FramingMode {
    /// MBAP header framing used on TCP and UDP
    Tcp,
    /// binary serial framing delimited by inter-frame silence, CRC-16 protected
    Rtu,
    /// ASCII framing (':' ... CRLF), hexadecimal on the wire, LRC protected
    Ascii,
    /// binary framing delimited by '{' and '}' tokens, CRC-16 protected
    Bin,
}

impl std::fmt::Display for FramingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FramingMode::Tcp => f.write_str("tcp"),
            FramingMode::Rtu => f.write_str("rtu"),
            FramingMode::Ascii => f.write_str("ascii"),
            FramingMode::Bin => f.write_str("bin"),
        }
    }
}

/// Serializes PDUs into on-wire frames. One variant per framing, selected at
/// construction.
pub(crate) struct FrameWriter {
    mode: FramingMode,
    buffer: [u8; constants::MAX_FRAME_LENGTH],
}

impl FrameWriter {
    pub(crate) fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            buffer: [0; constants::MAX_FRAME_LENGTH],
        }
    }

    pub(crate) fn tcp() -> Self {
        Self::new(FramingMode::Tcp)
    }

    pub(crate) fn format(
        &mut self,
        header: FrameHeader,
        pdu: &Pdu,
        decode: DecodeLevel,
    ) -> Result<&[u8], RequestError> {
        if pdu.wire_size() > constants::MAX_ADU_LENGTH {
            return Err(FrameParseError::FrameTooBig(
                pdu.wire_size(),
                constants::MAX_ADU_LENGTH,
            )
            .into());
        }

        let mut cursor = WriteCursor::new(self.buffer.as_mut());
        let length = match self.mode {
            FramingMode::Tcp => crate::tcp::frame::format_mbap(&mut cursor, header, pdu)?,
            FramingMode::Rtu => crate::serial::rtu::format_rtu(&mut cursor, header, pdu)?,
            FramingMode::Ascii => crate::serial::ascii::format_ascii(&mut cursor, header, pdu)?,
            FramingMode::Bin => crate::serial::bin::format_bin(&mut cursor, header, pdu)?,
        };

        let bytes = &self.buffer[..length];

        if decode.frame.enabled() {
            tracing::info!("FRAME TX - {}", FrameDisplay::new(decode.frame, header, bytes));
        }

        Ok(bytes)
    }
}

enum ParserImpl {
    Mbap(MbapParser),
    Rtu(RtuParser),
    Ascii(AsciiParser),
    Bin(BinParser),
}

impl ParserImpl {
    fn parse(&mut self, buffer: &mut ReadBuffer) -> Result<Option<Frame>, RequestError> {
        match self {
            ParserImpl::Mbap(x) => x.parse(buffer),
            ParserImpl::Rtu(x) => x.parse(buffer),
            ParserImpl::Ascii(x) => x.parse(buffer),
            ParserImpl::Bin(x) => x.parse(buffer),
        }
    }

    fn reset(&mut self) {
        match self {
            ParserImpl::Mbap(x) => x.reset(),
            ParserImpl::Rtu(x) => x.reset(),
            ParserImpl::Ascii(x) => x.reset(),
            ParserImpl::Bin(x) => x.reset(),
        }
    }
}

/// Reads frames off a physical layer, discarding corrupt frames up to a
/// configurable bound instead of looping forever on a noisy line
pub(crate) struct FramedReader {
    parser: ParserImpl,
    buffer: ReadBuffer,
    max_discards: usize,
}

impl FramedReader {
    fn new(parser: ParserImpl, max_discards: usize) -> Self {
        Self {
            parser,
            buffer: ReadBuffer::new(constants::MAX_FRAME_LENGTH),
            max_discards,
        }
    }

    pub(crate) fn tcp(max_discards: usize) -> Self {
        Self::new(ParserImpl::Mbap(MbapParser::new()), max_discards)
    }

    pub(crate) fn rtu_request(max_discards: usize) -> Self {
        Self::new(ParserImpl::Rtu(RtuParser::new_request_parser()), max_discards)
    }

    pub(crate) fn rtu_response(max_discards: usize) -> Self {
        Self::new(
            ParserImpl::Rtu(RtuParser::new_response_parser()),
            max_discards,
        )
    }

    pub(crate) fn ascii(max_discards: usize) -> Self {
        Self::new(ParserImpl::Ascii(AsciiParser::new()), max_discards)
    }

    pub(crate) fn bin(max_discards: usize) -> Self {
        Self::new(ParserImpl::Bin(BinParser::new()), max_discards)
    }

    /// discard any partial state, used when a connection is re-established
    pub(crate) fn reset(&mut self) {
        self.parser.reset();
        self.buffer.discard_all();
    }

    pub(crate) async fn next_frame(
        &mut self,
        io: &mut PhysLayer,
        decode: DecodeLevel,
    ) -> Result<Frame, RequestError> {
        let mut discarded = 0;
        loop {
            match self.parser.parse(&mut self.buffer) {
                Ok(Some(frame)) => {
                    if decode.frame.enabled() {
                        tracing::info!(
                            "FRAME RX - {}",
                            FrameDisplay::new(decode.frame, frame.header, frame.payload())
                        );
                    }
                    return Ok(frame);
                }
                Ok(None) => {
                    self.buffer.read_some(io, decode.physical).await?;
                }
                Err(RequestError::BadFrame(err)) if err.is_recoverable() => {
                    if discarded < self.max_discards {
                        discarded += 1;
                        tracing::warn!("discarding corrupt frame ({discarded}): {err}");
                        self.parser.reset();
                    } else {
                        tracing::warn!("too many corrupt frames, last error: {err}");
                        return Err(FrameParseError::DiscardLimit(self.max_discards).into());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) struct FrameDisplay<'a> {
    level: crate::decode::FrameDecodeLevel,
    header: FrameHeader,
    payload: &'a [u8],
}

impl<'a> FrameDisplay<'a> {
    pub(crate) fn new(
        level: crate::decode::FrameDecodeLevel,
        header: FrameHeader,
        payload: &'a [u8],
    ) -> Self {
        FrameDisplay {
            level,
            header,
            payload,
        }
    }
}

impl std::fmt::Display for FrameDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "unit: {}", self.header.unit_id)?;
        if let Some(tx_id) = self.header.tx_id {
            write!(f, " tx id: {tx_id}")?;
        }
        write!(f, " (len = {})", self.payload.len())?;
        if self.level.payload_enabled() {
            crate::common::phys::format_bytes(f, self.payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeLevel;
    use tokio_test::block_on;
    use tokio_test::io::Builder;

    const UNIT_ID: u8 = 0x2A;

    // read coils request with a valid CRC
    const GOOD_RTU_FRAME: &[u8] = &[UNIT_ID, 0x01, 0x00, 0x10, 0x00, 0x13, 0x7A, 0x19];
    // same frame with the CRC corrupted
    const BAD_RTU_FRAME: &[u8] = &[UNIT_ID, 0x01, 0x00, 0x10, 0x00, 0x13, 0xFF, 0xFF];

    #[test]
    fn tx_id_wraps_around() {
        let mut tx_id = TxId::new(u16::MAX);
        assert_eq!(tx_id.next(), TxId::new(u16::MAX));
        assert_eq!(tx_id.next(), TxId::new(0));
        assert_eq!(tx_id.next(), TxId::new(1));
    }

    #[test]
    fn skips_corrupt_frame_within_discard_budget() {
        let io = Builder::new()
            .read(BAD_RTU_FRAME)
            .read(GOOD_RTU_FRAME)
            .build();
        let mut phys = PhysLayer::new_mock(io);
        let mut reader = FramedReader::rtu_request(constants::DEFAULT_MAX_DISCARDS);
        let frame = block_on(reader.next_frame(&mut phys, DecodeLevel::nothing())).unwrap();
        assert_eq!(frame.header.unit_id, UnitId::new(UNIT_ID));
        assert_eq!(frame.payload(), &GOOD_RTU_FRAME[1..6]);
    }

    #[test]
    fn fails_with_discard_limit_when_budget_exhausted() {
        let io = Builder::new()
            .read(BAD_RTU_FRAME)
            .read(BAD_RTU_FRAME)
            .read(BAD_RTU_FRAME)
            .build();
        let mut phys = PhysLayer::new_mock(io);
        let mut reader = FramedReader::rtu_request(2);
        let err = block_on(reader.next_frame(&mut phys, DecodeLevel::nothing())).unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::DiscardLimit(2))
        );
    }
}
