use crate::common::buffer::ReadBuffer;
use crate::common::cursor::WriteCursor;
use crate::common::frame::{Frame, FrameHeader};
use crate::common::function::FunctionCode;
use crate::error::{FrameParseError, RequestError};
use crate::types::{Pdu, UnitId};

pub(crate) mod constants {
    pub(crate) const FUNCTION_CODE_LENGTH: usize = 1;
    pub(crate) const CRC_LENGTH: usize = 2;
}

/// precomputes the CRC table as a constant!
const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

#[derive(Clone, Copy)]
enum ParserType {
    Request,
    Response,
}

#[derive(Clone, Copy)]
enum ParseState {
    Start,
    ReadFullBody(UnitId, usize), // unit id, length of rest
    ReadToOffsetForLength(UnitId, usize), // unit id, length to length
}

#[derive(Clone, Copy)]
enum LengthMode {
    /// The length is always the same (without function code)
    Fixed(usize),
    /// You need to read X more bytes. The last byte contains the number of extra bytes to read after that
    Offset(usize),
    /// Unknown function code, can't determine the size
    Unknown,
}

/// RTU frames carry no length field, so the parser infers the body length
/// from the function code. Request and response bodies differ, which is why
/// each direction gets its own parser.
pub(crate) struct RtuParser {
    state: ParseState,
    parser_type: ParserType,
}

impl RtuParser {
    pub(crate) fn new_request_parser() -> Self {
        Self {
            state: ParseState::Start,
            parser_type: ParserType::Request,
        }
    }

    pub(crate) fn new_response_parser() -> Self {
        Self {
            state: ParseState::Start,
            parser_type: ParserType::Response,
        }
    }

    // Returns how to calculate the length of the body
    fn length_mode(&self, function_code: u8) -> LengthMode {
        // Check exception (only valid for responses)
        if matches!(self.parser_type, ParserType::Response) && function_code & 0x80 != 0 {
            return LengthMode::Fixed(1);
        }

        let function_code = match FunctionCode::get(function_code) {
            Some(code) => code,
            None => return LengthMode::Unknown,
        };

        match self.parser_type {
            ParserType::Request => match function_code {
                FunctionCode::ReadCoils => LengthMode::Fixed(4),
                FunctionCode::ReadDiscreteInputs => LengthMode::Fixed(4),
                FunctionCode::ReadHoldingRegisters => LengthMode::Fixed(4),
                FunctionCode::ReadInputRegisters => LengthMode::Fixed(4),
                FunctionCode::WriteSingleCoil => LengthMode::Fixed(4),
                FunctionCode::WriteSingleRegister => LengthMode::Fixed(4),
                FunctionCode::WriteMultipleCoils => LengthMode::Offset(5),
                FunctionCode::WriteMultipleRegisters => LengthMode::Offset(5),
            },
            ParserType::Response => match function_code {
                FunctionCode::ReadCoils => LengthMode::Offset(1),
                FunctionCode::ReadDiscreteInputs => LengthMode::Offset(1),
                FunctionCode::ReadHoldingRegisters => LengthMode::Offset(1),
                FunctionCode::ReadInputRegisters => LengthMode::Offset(1),
                FunctionCode::WriteSingleCoil => LengthMode::Fixed(4),
                FunctionCode::WriteSingleRegister => LengthMode::Fixed(4),
                FunctionCode::WriteMultipleCoils => LengthMode::Fixed(4),
                FunctionCode::WriteMultipleRegisters => LengthMode::Fixed(4),
            },
        }
    }

    pub(crate) fn parse(&mut self, cursor: &mut ReadBuffer) -> Result<Option<Frame>, RequestError> {
        match self.state {
            ParseState::Start => {
                if cursor.len() < 2 {
                    return Ok(None);
                }

                let unit_id = UnitId::new(cursor.read_u8()?);

                // We don't consume the function code to avoid an unnecessary copy of the receive buffer later on
                let raw_function_code = cursor.peek_at(0)?;

                self.state = match self.length_mode(raw_function_code) {
                    LengthMode::Fixed(length) => ParseState::ReadFullBody(unit_id, length),
                    LengthMode::Offset(offset) => ParseState::ReadToOffsetForLength(unit_id, offset),
                    LengthMode::Unknown => {
                        return Err(RequestError::BadFrame(
                            FrameParseError::UnknownFunctionCode(raw_function_code),
                        ))
                    }
                };

                self.parse(cursor)
            }
            ParseState::ReadToOffsetForLength(unit_id, offset) => {
                if cursor.len() < constants::FUNCTION_CODE_LENGTH + offset {
                    return Ok(None);
                }

                // Get the complete size
                let extra_bytes_to_read =
                    cursor.peek_at(constants::FUNCTION_CODE_LENGTH + offset - 1)? as usize;
                self.state = ParseState::ReadFullBody(unit_id, offset + extra_bytes_to_read);

                self.parse(cursor)
            }
            ParseState::ReadFullBody(unit_id, length) => {
                if constants::FUNCTION_CODE_LENGTH + length
                    > crate::common::frame::constants::MAX_ADU_LENGTH
                {
                    return Err(RequestError::BadFrame(FrameParseError::FrameTooBig(
                        constants::FUNCTION_CODE_LENGTH + length,
                        crate::common::frame::constants::MAX_ADU_LENGTH,
                    )));
                }

                if cursor.len() < constants::FUNCTION_CODE_LENGTH + length + constants::CRC_LENGTH {
                    return Ok(None);
                }

                let frame = {
                    let data = cursor.read(constants::FUNCTION_CODE_LENGTH + length)?;
                    let mut frame = Frame::new(FrameHeader::new_serial_header(unit_id));
                    frame.set(data)?;
                    frame
                };
                let received_crc = cursor.read_u16_le()?;

                let expected_crc = {
                    let mut digest = CRC.digest();
                    digest.update(&[unit_id.value()]);
                    digest.update(frame.payload());
                    digest.finalize()
                };

                if received_crc != expected_crc {
                    self.state = ParseState::Start;
                    return Err(RequestError::BadFrame(FrameParseError::CrcMismatch(
                        received_crc,
                        expected_crc,
                    )));
                }

                self.state = ParseState::Start;
                Ok(Some(frame))
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = ParseState::Start;
    }
}

pub(crate) fn format_rtu(
    cursor: &mut WriteCursor,
    header: FrameHeader,
    pdu: &Pdu,
) -> Result<usize, RequestError> {
    let start = cursor.position();
    cursor.write_u8(header.unit_id.value())?;
    cursor.write_u8(pdu.function())?;
    cursor.write_bytes(pdu.data())?;
    let end = cursor.position();
    let crc = match cursor.get(start..end) {
        Some(frame) => CRC.checksum(frame),
        None => return Err(crate::error::InternalError::BadSeekOperation.into()),
    };
    cursor.write_u16_le(crc)?;
    Ok(cursor.position() - start)
}

#[cfg(test)]
mod tests {
    use std::task::Poll;

    use super::*;
    use crate::common::frame::{FrameWriter, FramedReader, FramingMode};
    use crate::common::phys::PhysLayer;
    use crate::decode::DecodeLevel;

    const UNIT_ID: u8 = 0x2A;
    const MAX_DISCARDS: usize = 8;

    const READ_COILS_REQUEST: &[u8] = &[
        UNIT_ID, // unit id
        0x01,    // function code
        0x00, 0x10, // starting address
        0x00, 0x13, // qty of outputs
        0x7A, 0x19, // crc
    ];

    const READ_COILS_RESPONSE: &[u8] = &[
        UNIT_ID, // unit id
        0x01,    // function code
        0x03,    // byte count
        0xCD, 0x6B, 0x05, // output status
        0x44, 0x99, // crc
    ];

    const WRITE_MULTIPLE_COILS_REQUEST: &[u8] = &[
        UNIT_ID, // unit id
        0x0F,    // function code
        0x00, 0x10, // starting address
        0x00, 0x0A, // qty of outputs
        0x02, // byte count
        0x12, 0x34, // output values
        0x00, 0x2E, // crc
    ];

    const EXCEPTION_RESPONSE: &[u8] = &[
        UNIT_ID, // unit id
        0x81,    // exception function code
        0x02,    // exception code
        0xB1, 0x99, // crc
    ];

    fn parse_sync(parser: &mut RtuParser, frame: &[u8]) -> Result<Option<Frame>, RequestError> {
        let mut buffer = ReadBuffer::new(512);
        buffer.push(frame).unwrap();
        parser.parse(&mut buffer)
    }

    #[test]
    fn parses_request_with_fixed_length() {
        let mut parser = RtuParser::new_request_parser();
        let frame = parse_sync(&mut parser, READ_COILS_REQUEST).unwrap().unwrap();
        assert_eq!(frame.header.unit_id, UnitId::new(UNIT_ID));
        assert_eq!(frame.header.tx_id, None);
        assert_eq!(frame.payload(), &READ_COILS_REQUEST[1..6]);
    }

    #[test]
    fn parses_request_with_length_offset() {
        let mut parser = RtuParser::new_request_parser();
        let frame = parse_sync(&mut parser, WRITE_MULTIPLE_COILS_REQUEST)
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload(), &WRITE_MULTIPLE_COILS_REQUEST[1..9]);
    }

    #[test]
    fn parses_response_with_length_offset() {
        let mut parser = RtuParser::new_response_parser();
        let frame = parse_sync(&mut parser, READ_COILS_RESPONSE).unwrap().unwrap();
        assert_eq!(frame.payload(), &READ_COILS_RESPONSE[1..6]);
    }

    #[test]
    fn parses_exception_response() {
        let mut parser = RtuParser::new_response_parser();
        let frame = parse_sync(&mut parser, EXCEPTION_RESPONSE).unwrap().unwrap();
        assert_eq!(frame.payload(), &EXCEPTION_RESPONSE[1..3]);
        let pdu = frame.pdu().unwrap();
        assert!(pdu.is_exception());
    }

    #[test]
    fn fails_on_wrong_crc() {
        let mut parser = RtuParser::new_request_parser();
        let mut corrupt = READ_COILS_REQUEST.to_vec();
        corrupt[6] = 0xFF;
        corrupt[7] = 0xFF;
        let err = parse_sync(&mut parser, &corrupt).unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::CrcMismatch(0xFFFF, 0x197A))
        );
    }

    #[test]
    fn fails_on_unknown_function_code() {
        let mut parser = RtuParser::new_request_parser();
        let err = parse_sync(&mut parser, &[UNIT_ID, 0x49, 0x00, 0x00]).unwrap_err();
        assert_eq!(
            err,
            RequestError::BadFrame(FrameParseError::UnknownFunctionCode(0x49))
        );
    }

    #[test]
    fn parses_frame_received_byte_by_byte() {
        let mut builder = tokio_test::io::Builder::new();
        for byte in READ_COILS_REQUEST {
            builder.read(std::slice::from_ref(byte));
        }
        let mut phys = PhysLayer::new_mock(builder.build());
        let mut reader = FramedReader::rtu_request(MAX_DISCARDS);
        let mut task =
            tokio_test::task::spawn(reader.next_frame(&mut phys, DecodeLevel::nothing()));
        match task.poll() {
            Poll::Ready(received) => {
                let frame = received.unwrap();
                assert_eq!(frame.payload(), &READ_COILS_REQUEST[1..6]);
            }
            Poll::Pending => panic!("parser did not complete"),
        }
    }

    #[test]
    fn formats_request_matching_reference_bytes() {
        let mut writer = FrameWriter::new(FramingMode::Rtu);
        let pdu = Pdu::new(0x01, vec![0x00, 0x10, 0x00, 0x13]);
        let header = FrameHeader::new_serial_header(UnitId::new(UNIT_ID));
        let bytes = writer.format(header, &pdu, DecodeLevel::nothing()).unwrap();
        assert_eq!(bytes, READ_COILS_REQUEST);
    }
}
