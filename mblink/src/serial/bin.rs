use crate::common::buffer::ReadBuffer;
use crate::common::cursor::WriteCursor;
use crate::common::frame::{Frame, FrameHeader};
use crate::error::{FrameParseError, RequestError};
use crate::types::{Pdu, UnitId};

pub(crate) mod constants {
    pub(crate) const START: u8 = b'{';
    pub(crate) const END: u8 = b'}';
    pub(crate) const CRC_LENGTH: usize = 2;
    /// unit id, function code and CRC are the minimum frame content
    pub(crate) const MIN_BINARY_LENGTH: usize = 4;
    /// unit id, PDU and CRC at maximum PDU size
    pub(crate) const MAX_BINARY_LENGTH: usize =
        1 + crate::common::frame::constants::MAX_ADU_LENGTH + CRC_LENGTH;
}

const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

#[derive(Clone, Copy)]
enum ParseState {
    /// scanning for the start token, discarding line noise
    Start,
    /// accumulating binary bytes until the end token
    ReadBody,
}

/// BIN frames carry raw binary between a '{' start token and a '}' end token.
/// A data byte that happens to equal the end token truncates the frame, which
/// the CRC then rejects, so corruption is detected rather than prevented.
pub(crate) struct BinParser {
    state: ParseState,
    body: [u8; constants::MAX_BINARY_LENGTH],
    count: usize,
}

impl BinParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Start,
            body: [0; constants::MAX_BINARY_LENGTH],
            count: 0,
        }
    }

    pub(crate) fn parse(&mut self, cursor: &mut ReadBuffer) -> Result<Option<Frame>, RequestError> {
        loop {
            match self.state {
                ParseState::Start => loop {
                    if cursor.is_empty() {
                        return Ok(None);
                    }
                    if cursor.read_u8()? == constants::START {
                        self.state = ParseState::ReadBody;
                        self.count = 0;
                        break;
                    }
                },
                ParseState::ReadBody => {
                    if cursor.is_empty() {
                        return Ok(None);
                    }
                    let byte = cursor.read_u8()?;
                    if byte == constants::END {
                        self.state = ParseState::Start;
                        return self.decode().map(Some);
                    }
                    match self.body.get_mut(self.count) {
                        Some(slot) => {
                            *slot = byte;
                            self.count += 1;
                        }
                        None => {
                            self.state = ParseState::Start;
                            return Err(RequestError::BadFrame(FrameParseError::FrameTooBig(
                                self.count + 1,
                                constants::MAX_BINARY_LENGTH,
                            )));
                        }
                    }
                }
            }
        }
    }

    fn decode(&mut self) -> Result<Frame, RequestError> {
        if self.count < constants::MIN_BINARY_LENGTH {
            return Err(RequestError::BadFrame(FrameParseError::FrameTooShort(
                self.count,
            )));
        }

        let (body, crc_bytes) = self.body[..self.count].split_at(self.count - constants::CRC_LENGTH);
        // low byte first
        let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let expected_crc = CRC.checksum(body);
        if received_crc != expected_crc {
            return Err(RequestError::BadFrame(FrameParseError::CrcMismatch(
                received_crc,
                expected_crc,
            )));
        }

        let unit_id = UnitId::new(body[0]);
        let mut frame = Frame::new(FrameHeader::new_serial_header(unit_id));
        frame.set(&body[1..])?;
        Ok(frame)
    }

    pub(crate) fn reset(&mut self) {
        self.state = ParseState::Start;
        self.count = 0;
    }
}

pub(crate) fn format_bin(
    cursor: &mut WriteCursor,
    header: FrameHeader,
    pdu: &Pdu,
) -> Result<usize, RequestError> {
    let start = cursor.position();
    cursor.write_u8(constants::START)?;
    let body_start = cursor.position();
    cursor.write_u8(header.unit_id.value())?;
    cursor.write_u8(pdu.function())?;
    cursor.write_bytes(pdu.data())?;
    let body_end = cursor.position();
    let crc = match cursor.get(body_start..body_end) {
        Some(body) => CRC.checksum(body),
        None => return Err(crate::error::InternalError::BadSeekOperation.into()),
    };
    cursor.write_u16_le(crc)?;
    cursor.write_u8(constants::END)?;
    Ok(cursor.position() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::frame::{FrameWriter, FramingMode};
    use crate::decode::DecodeLevel;

    // read holding registers: unit 0x01, fc 0x03, addr 0x0000, qty 0x0001
    // CRC-16/MODBUS over the body is 0x0A84, transmitted low byte first
    const READ_REGISTERS_FRAME: &[u8] = &[
        b'{', 0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A, b'}',
    ];

    fn parse_sync(parser: &mut BinParser, frame: &[u8]) -> Result<Option<Frame>, RequestError> {
        let mut buffer = ReadBuffer::new(512);
        buffer.push(frame).unwrap();
        parser.parse(&mut buffer)
    }

    #[test]
    fn parses_reference_frame() {
        let mut parser = BinParser::new();
        let frame = parse_sync(&mut parser, READ_REGISTERS_FRAME).unwrap().unwrap();
        assert_eq!(frame.header.unit_id, UnitId::new(0x01));
        assert_eq!(frame.header.tx_id, None);
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn skips_noise_before_start_token() {
        let mut parser = BinParser::new();
        let mut noisy = vec![0x00, 0xFF, b'}'];
        noisy.extend_from_slice(READ_REGISTERS_FRAME);
        let frame = parse_sync(&mut parser, &noisy).unwrap().unwrap();
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn fails_on_bad_crc() {
        let mut parser = BinParser::new();
        let mut corrupt = READ_REGISTERS_FRAME.to_vec();
        corrupt[7] = 0x85;
        let err = parse_sync(&mut parser, &corrupt).unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::CrcMismatch(0x0A85, 0x0A84))
        );
    }

    #[test]
    fn fails_on_truncated_body() {
        let mut parser = BinParser::new();
        let err = parse_sync(&mut parser, &[b'{', 0x01, 0x03, b'}']).unwrap_err();
        assert_eq!(err, RequestError::BadFrame(FrameParseError::FrameTooShort(2)));
    }

    #[test]
    fn parses_frame_split_across_reads() {
        let mut parser = BinParser::new();
        let mut buffer = ReadBuffer::new(512);
        buffer.push(&READ_REGISTERS_FRAME[..4]).unwrap();
        assert!(parser.parse(&mut buffer).unwrap().is_none());
        buffer.push(&READ_REGISTERS_FRAME[4..]).unwrap();
        let frame = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn formats_reference_frame() {
        let mut writer = FrameWriter::new(FramingMode::Bin);
        let pdu = Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]);
        let header = FrameHeader::new_serial_header(UnitId::new(0x01));
        let bytes = writer.format(header, &pdu, DecodeLevel::nothing()).unwrap();
        assert_eq!(bytes, READ_REGISTERS_FRAME);
    }

    #[test]
    fn round_trips_pdu_for_broadcast_unit() {
        let mut writer = FrameWriter::new(FramingMode::Bin);
        let pdu = Pdu::new(0x06, vec![0x00, 0x05, 0x12, 0x34]);
        let header = FrameHeader::new_serial_header(UnitId::broadcast());
        let bytes = writer
            .format(header, &pdu, DecodeLevel::nothing())
            .unwrap()
            .to_vec();

        let mut parser = BinParser::new();
        let frame = parse_sync(&mut parser, &bytes).unwrap().unwrap();
        assert!(frame.header.unit_id.is_broadcast());
        assert_eq!(frame.pdu().unwrap(), pdu);
    }
}
