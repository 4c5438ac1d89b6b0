use crate::error::InternalError;

/// panic-free write cursor over a caller-owned buffer
pub(crate) struct WriteCursor<'a> {
    dest: &'a mut [u8],
    pos: usize,
}

impl<'a> WriteCursor<'a> {
    pub(crate) fn new(dest: &'a mut [u8]) -> WriteCursor<'a> {
        WriteCursor { dest, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.dest.len() - self.pos
    }

    pub(crate) fn seek_from_current(&mut self, count: usize) -> Result<(), InternalError> {
        if self.remaining() < count {
            return Err(InternalError::BadSeekOperation);
        }
        self.pos += count;
        Ok(())
    }

    pub(crate) fn seek_from_start(&mut self, count: usize) -> Result<(), InternalError> {
        if self.dest.len() < count {
            return Err(InternalError::BadSeekOperation);
        }
        self.pos = count;
        Ok(())
    }

    pub(crate) fn get(&self, range: std::ops::Range<usize>) -> Option<&[u8]> {
        self.dest.get(range)
    }

    pub(crate) fn write_u8(&mut self, value: u8) -> Result<(), InternalError> {
        match self.dest.get_mut(self.pos) {
            Some(x) => {
                *x = value;
                self.pos += 1;
                Ok(())
            }
            None => Err(InternalError::InsufficientWriteSpace(1, 0)),
        }
    }

    pub(crate) fn write_u16_be(&mut self, value: u16) -> Result<(), InternalError> {
        if self.remaining() < 2 {
            // don't write any bytes if there isn't space for the whole thing
            return Err(InternalError::InsufficientWriteSpace(2, self.remaining()));
        }
        self.write_u8((value >> 8) as u8)?;
        self.write_u8((value & 0xFF) as u8)
    }

    pub(crate) fn write_u16_le(&mut self, value: u16) -> Result<(), InternalError> {
        if self.remaining() < 2 {
            return Err(InternalError::InsufficientWriteSpace(2, self.remaining()));
        }
        self.write_u8((value & 0xFF) as u8)?;
        self.write_u8((value >> 8) as u8)
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), InternalError> {
        match self.dest.get_mut(self.pos..self.pos + bytes.len()) {
            Some(x) => {
                x.copy_from_slice(bytes);
                self.pos += bytes.len();
                Ok(())
            }
            None => Err(InternalError::InsufficientWriteSpace(
                bytes.len(),
                self.remaining(),
            )),
        }
    }
}
