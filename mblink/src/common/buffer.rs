use crate::common::phys::PhysLayer;
use crate::decode::PhysDecodeLevel;
use crate::error::InternalError;

/// accumulation buffer that frame parsers consume from
pub(crate) struct ReadBuffer {
    buffer: Vec<u8>,
    begin: usize,
    end: usize,
}

impl ReadBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        ReadBuffer {
            buffer: vec![0; capacity],
            begin: 0,
            end: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.end - self.begin
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub(crate) fn read(&mut self, count: usize) -> Result<&[u8], InternalError> {
        if self.len() < count {
            return Err(InternalError::InsufficientBytesForRead(count, self.len()));
        }

        match self.buffer.get(self.begin..(self.begin + count)) {
            Some(ret) => {
                self.begin += count;
                Ok(ret)
            }
            None => Err(InternalError::InsufficientBytesForRead(count, self.len())),
        }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, InternalError> {
        if self.is_empty() {
            return Err(InternalError::InsufficientBytesForRead(1, 0));
        }
        match self.buffer.get(self.begin) {
            Some(ret) => {
                self.begin += 1;
                Ok(*ret)
            }
            None => Err(InternalError::InsufficientBytesForRead(1, 0)),
        }
    }

    pub(crate) fn read_u16_be(&mut self) -> Result<u16, InternalError> {
        let b1 = self.read_u8()? as u16;
        let b2 = self.read_u8()? as u16;
        Ok((b1 << 8) | b2)
    }

    pub(crate) fn read_u16_le(&mut self) -> Result<u16, InternalError> {
        let b1 = self.read_u8()? as u16;
        let b2 = self.read_u8()? as u16;
        Ok((b2 << 8) | b1)
    }

    pub(crate) fn peek_at(&self, pos: usize) -> Result<u8, InternalError> {
        if self.len() <= pos {
            return Err(InternalError::InsufficientBytesForRead(pos + 1, self.len()));
        }
        match self.buffer.get(self.begin + pos) {
            Some(ret) => Ok(*ret),
            None => Err(InternalError::InsufficientBytesForRead(pos + 1, self.len())),
        }
    }

    /// discard everything currently buffered, used when resynchronizing after
    /// a corrupt frame
    pub(crate) fn discard_all(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    pub(crate) async fn read_some(
        &mut self,
        io: &mut PhysLayer,
        decode_level: PhysDecodeLevel,
    ) -> Result<usize, std::io::Error> {
        // before we read any data, check to see if the buffer is empty and adjust
        // the indices. this allows us to make the biggest read possible, and avoids
        // subsequent buffer shifting later
        if self.is_empty() {
            self.begin = 0;
            self.end = 0;
        }

        // if we've reached capacity, but still need more data, we have to shift
        if self.end == self.buffer.capacity() {
            let length = self.len();
            self.buffer.copy_within(self.begin..self.end, 0);
            self.begin = 0;
            self.end = length;
        }

        let count = io.read(&mut self.buffer[self.end..], decode_level).await?;

        if count == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        self.end += count;
        Ok(count)
    }

    /// preload bytes without touching the physical layer, used by the UDP
    /// dispatch path where a datagram arrives as a unit
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<(), InternalError> {
        match self.buffer.get_mut(self.end..self.end + bytes.len()) {
            Some(dest) => {
                dest.copy_from_slice(bytes);
                self.end += bytes.len();
                Ok(())
            }
            None => Err(InternalError::InsufficientWriteSpace(
                bytes.len(),
                self.buffer.len() - self.end,
            )),
        }
    }
}
