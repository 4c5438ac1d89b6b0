use crate::common::buffer::ReadBuffer;
use crate::common::cursor::WriteCursor;
use crate::common::frame::{Frame, FrameHeader};
use crate::error::{FrameParseError, RequestError};
use crate::types::{Pdu, UnitId};

pub(crate) mod constants {
    pub(crate) const START: u8 = b':';
    pub(crate) const CR: u8 = b'\r';
    pub(crate) const LF: u8 = b'\n';
    /// hex digits for unit id, PDU and LRC at maximum PDU size
    pub(crate) const MAX_HEX_CHARS: usize =
        2 * (1 + crate::common::frame::constants::MAX_ADU_LENGTH + 1);
    /// unit id, function code and LRC are the minimum frame content
    pub(crate) const MIN_BINARY_LENGTH: usize = 3;
}

/// longitudinal redundancy check: the two's complement of the byte sum
pub(crate) fn lrc(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

fn hex_value(char: u8) -> Result<u8, FrameParseError> {
    match char {
        b'0'..=b'9' => Ok(char - b'0'),
        b'A'..=b'F' => Ok(char - b'A' + 10),
        b'a'..=b'f' => Ok(char - b'a' + 10),
        _ => Err(FrameParseError::BadHexDigit(char)),
    }
}

#[derive(Clone, Copy)]
enum ParseState {
    /// scanning for the start token, discarding line noise
    Start,
    /// accumulating hex characters until CR
    ReadChars,
    /// CR received, expecting LF
    AwaitLineFeed,
}

/// ASCII frames are delimited by a ':' start token and a CRLF trailer, with
/// every binary byte transmitted as two hexadecimal characters
pub(crate) struct AsciiParser {
    state: ParseState,
    chars: [u8; constants::MAX_HEX_CHARS],
    count: usize,
}

impl AsciiParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Start,
            chars: [0; constants::MAX_HEX_CHARS],
            count: 0,
        }
    }

    pub(crate) fn parse(&mut self, cursor: &mut ReadBuffer) -> Result<Option<Frame>, RequestError> {
        loop {
            match self.state {
                ParseState::Start => {
                    // bytes before the start token are line noise
                    loop {
                        if cursor.is_empty() {
                            return Ok(None);
                        }
                        if cursor.read_u8()? == constants::START {
                            self.state = ParseState::ReadChars;
                            self.count = 0;
                            break;
                        }
                    }
                }
                ParseState::ReadChars => {
                    if cursor.is_empty() {
                        return Ok(None);
                    }
                    let byte = cursor.read_u8()?;
                    if byte == constants::CR {
                        self.state = ParseState::AwaitLineFeed;
                        continue;
                    }
                    match self.chars.get_mut(self.count) {
                        Some(slot) => {
                            *slot = byte;
                            self.count += 1;
                        }
                        None => {
                            self.state = ParseState::Start;
                            return Err(RequestError::BadFrame(FrameParseError::FrameTooBig(
                                self.count + 1,
                                constants::MAX_HEX_CHARS,
                            )));
                        }
                    }
                }
                ParseState::AwaitLineFeed => {
                    if cursor.is_empty() {
                        return Ok(None);
                    }
                    let byte = cursor.read_u8()?;
                    self.state = ParseState::Start;
                    if byte != constants::LF {
                        return Err(RequestError::BadFrame(FrameParseError::MissingLineFeed(
                            byte,
                        )));
                    }
                    return self.decode().map(Some);
                }
            }
        }
    }

    /// convert the accumulated hex characters into a frame and verify the LRC
    fn decode(&mut self) -> Result<Frame, RequestError> {
        if self.count % 2 != 0 {
            return Err(RequestError::BadFrame(FrameParseError::OddHexCount(
                self.count,
            )));
        }

        let mut binary = [0u8; constants::MAX_HEX_CHARS / 2];
        let length = self.count / 2;
        for (i, slot) in binary[..length].iter_mut().enumerate() {
            let high = hex_value(self.chars[2 * i]).map_err(RequestError::BadFrame)?;
            let low = hex_value(self.chars[2 * i + 1]).map_err(RequestError::BadFrame)?;
            *slot = (high << 4) | low;
        }

        if length < constants::MIN_BINARY_LENGTH {
            return Err(RequestError::BadFrame(FrameParseError::FrameTooShort(
                length,
            )));
        }

        let (received_lrc, body) = match binary[..length].split_last() {
            Some(x) => x,
            None => return Err(RequestError::BadFrame(FrameParseError::FrameTooShort(0))),
        };
        let expected_lrc = lrc(body);
        if *received_lrc != expected_lrc {
            return Err(RequestError::BadFrame(FrameParseError::LrcMismatch(
                *received_lrc,
                expected_lrc,
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

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

fn write_hex(cursor: &mut WriteCursor, byte: u8) -> Result<(), crate::error::InternalError> {
    cursor.write_u8(HEX_CHARS[(byte >> 4) as usize])?;
    cursor.write_u8(HEX_CHARS[(byte & 0x0F) as usize])
}

pub(crate) fn format_ascii(
    cursor: &mut WriteCursor,
    header: FrameHeader,
    pdu: &Pdu,
) -> Result<usize, RequestError> {
    let start = cursor.position();
    let sum = pdu
        .data()
        .iter()
        .fold(
            header.unit_id.value().wrapping_add(pdu.function()),
            |acc, b| acc.wrapping_add(*b),
        );
    let check = sum.wrapping_neg();

    cursor.write_u8(constants::START)?;
    write_hex(cursor, header.unit_id.value())?;
    write_hex(cursor, pdu.function())?;
    for byte in pdu.data() {
        write_hex(cursor, *byte)?;
    }
    write_hex(cursor, check)?;
    cursor.write_u8(constants::CR)?;
    cursor.write_u8(constants::LF)?;
    Ok(cursor.position() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::frame::{FrameWriter, FramingMode};
    use crate::decode::DecodeLevel;

    const UNIT_ID: u8 = 0x2A;

    // read holding registers: unit 0x01, fc 0x03, addr 0x0000, qty 0x0001, lrc 0xFB
    const READ_REGISTERS_FRAME: &[u8] = b":010300000001FB\r\n";

    fn parse_sync(parser: &mut AsciiParser, frame: &[u8]) -> Result<Option<Frame>, RequestError> {
        let mut buffer = ReadBuffer::new(1024);
        buffer.push(frame).unwrap();
        parser.parse(&mut buffer)
    }

    #[test]
    fn lrc_of_reference_bytes() {
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0xFB);
    }

    #[test]
    fn parses_reference_frame() {
        let mut parser = AsciiParser::new();
        let frame = parse_sync(&mut parser, READ_REGISTERS_FRAME).unwrap().unwrap();
        assert_eq!(frame.header.unit_id, UnitId::new(0x01));
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn accepts_lowercase_hex() {
        let mut parser = AsciiParser::new();
        let frame = parse_sync(&mut parser, b":010300000001fb\r\n").unwrap().unwrap();
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn skips_noise_before_start_token() {
        let mut parser = AsciiParser::new();
        let mut noisy = vec![0xDE, 0xAD, b'x'];
        noisy.extend_from_slice(READ_REGISTERS_FRAME);
        let frame = parse_sync(&mut parser, &noisy).unwrap().unwrap();
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn fails_on_bad_lrc() {
        let mut parser = AsciiParser::new();
        let err = parse_sync(&mut parser, b":010300000001FC\r\n").unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::LrcMismatch(0xFC, 0xFB))
        );
    }

    #[test]
    fn fails_on_non_hex_character() {
        let mut parser = AsciiParser::new();
        let err = parse_sync(&mut parser, b":01030000000G\r\n").unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::BadHexDigit(b'G'))
        );
    }

    #[test]
    fn fails_on_odd_digit_count() {
        let mut parser = AsciiParser::new();
        let err = parse_sync(&mut parser, b":010300000001F\r\n").unwrap_err();
        assert_eq!(err, RequestError::BadFrame(FrameParseError::OddHexCount(13)));
    }

    #[test]
    fn fails_on_missing_line_feed() {
        let mut parser = AsciiParser::new();
        let err = parse_sync(&mut parser, b":010300000001FB\rX").unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::MissingLineFeed(b'X'))
        );
    }

    #[test]
    fn parses_frame_split_across_reads() {
        let mut parser = AsciiParser::new();
        let mut buffer = ReadBuffer::new(1024);
        buffer.push(b":0103000").unwrap();
        assert!(parser.parse(&mut buffer).unwrap().is_none());
        buffer.push(b"00001FB\r\n").unwrap();
        let frame = parser.parse(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.payload(), &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn formats_reference_frame() {
        let mut writer = FrameWriter::new(FramingMode::Ascii);
        let pdu = Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]);
        let header = FrameHeader::new_serial_header(UnitId::new(0x01));
        let bytes = writer.format(header, &pdu, DecodeLevel::nothing()).unwrap();
        assert_eq!(bytes, READ_REGISTERS_FRAME);
    }

    #[test]
    fn round_trips_arbitrary_pdu() {
        let mut writer = FrameWriter::new(FramingMode::Ascii);
        let pdu = Pdu::new(0x10, vec![0x00, 0x01, 0x00, 0x02, 0x04, 0xCA, 0xFE, 0xBA, 0xBE]);
        let header = FrameHeader::new_serial_header(UnitId::new(UNIT_ID));
        let bytes = writer
            .format(header, &pdu, DecodeLevel::nothing())
            .unwrap()
            .to_vec();

        let mut parser = AsciiParser::new();
        let frame = parse_sync(&mut parser, &bytes).unwrap().unwrap();
        assert_eq!(frame.header.unit_id, UnitId::new(UNIT_ID));
        assert_eq!(frame.pdu().unwrap(), pdu);
    }
}
