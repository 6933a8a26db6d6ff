use serde::{Deserialize, Serialize};

use crate::{AccessContext, SimCore, SimDriver, SimError};

/// Location of a field inside a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Byte offset from the start of the structure.
    pub offset: u64,

    /// Size of the field in bytes.
    pub size: u64,
}

impl Field {
    /// Creates a new field descriptor.
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Returns the offset one past the end of the field.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A snapshot of a guest structure.
///
/// Reads the whole structure once so that a set of fields is taken from a
/// single point in simulated time.
///
/// # Examples
///
/// ```no_run
/// # use simi_core::{AccessContext, Field, SimCore, SimDriver, SimError, StructReader};
/// # fn example<Driver: SimDriver>(
/// #     vmi: &SimCore<Driver>,
/// #     ctx: AccessContext,
/// # ) -> Result<(), SimError> {
/// let pid = Field::new(0xa8, 4);
/// let tgid = Field::new(0xac, 4);
///
/// let task = StructReader::new_in(vmi, ctx, tgid.end() as usize)?;
/// let pid = task.read(pid)?;
/// let tgid = task.read(tgid)?;
/// # Ok(())
/// # }
/// ```
pub struct StructReader(Vec<u8>);

impl StructReader {
    /// Reads `len` bytes from guest memory at `ctx`.
    pub fn new_in<Driver>(
        vmi: &SimCore<Driver>,
        ctx: impl Into<AccessContext>,
        len: usize,
    ) -> Result<Self, SimError>
    where
        Driver: SimDriver,
    {
        let mut buffer = vec![0u8; len];
        vmi.read(ctx.into(), &mut buffer)?;
        Ok(Self(buffer))
    }

    /// Wraps bytes that were already read.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reads a field value from the data buffer.
    ///
    /// The value is interpreted as a little-endian integer of 1, 2, 4 or 8
    /// bytes and returned zero-extended.
    pub fn read(&self, field: Field) -> Result<u64, SimError> {
        let data = self.slice(field)?;

        match data.len() {
            1 => Ok(data[0] as u64),
            2 => Ok(u16::from_le_bytes([data[0], data[1]]) as u64),
            4 => Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64),
            8 => Ok(u64::from_le_bytes([
                data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
            ])),
            _ => Err(SimError::OutOfBounds),
        }
    }

    /// Reads a fixed-width, NUL-padded string field.
    ///
    /// Bytes after the first NUL are ignored; invalid UTF-8 is replaced.
    pub fn read_str(&self, field: Field) -> Result<String, SimError> {
        let data = self.slice(field)?;
        let end = nul_position(data);
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    fn slice(&self, field: Field) -> Result<&[u8], SimError> {
        let offset = field.offset as usize;
        let size = field.size as usize;

        let offset_end = match offset.checked_add(size) {
            Some(offset_end) => offset_end,
            None => return Err(SimError::OutOfBounds),
        };

        if offset_end > self.0.len() {
            return Err(SimError::OutOfBounds);
        }

        Ok(&self.0[offset..offset_end])
    }
}

fn nul_position(data: &[u8]) -> usize {
    data.iter().position(|&b| b == 0).unwrap_or(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() -> Result<(), SimError> {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        data[8..12].copy_from_slice(b"init");

        let reader = StructReader::from_bytes(data);
        assert_eq!(reader.read(Field::new(0, 4))?, 0x1234_5678);
        assert_eq!(reader.read(Field::new(0, 2))?, 0x5678);
        assert_eq!(reader.read_str(Field::new(8, 16))?, "init");
        assert!(matches!(
            reader.read(Field::new(30, 4)),
            Err(SimError::OutOfBounds)
        ));
        assert!(matches!(
            reader.read(Field::new(0, 3)),
            Err(SimError::OutOfBounds)
        ));

        Ok(())
    }
}
