//! NativeFormat primitives.
//!
//! R2R tables are stored with the runtime's NativeFormat encoding: a
//! variable-length integer scheme plus two lookup structures built on it,
//! a sparse array (`NativeArray`) and a bucketed hashtable
//! (`NativeHashtable`). All offsets here are offsets into the image file.

use crate::binary::{read_u16, read_u32, read_u8};
use crate::error::{R2rError, Result};

const BLOCK_SIZE: u32 = 16;

/// Decodes a NativeFormat unsigned integer at `*pos`, advancing it.
pub fn decode_unsigned(data: &[u8], pos: &mut usize) -> Result<u32> {
    let start = *pos;
    let b = |i: usize| read_u8(data, start + i).map(u32::from);

    let first = b(0)?;
    let (value, len) = if first & 1 == 0 {
        (first >> 1, 1)
    } else if first & 2 == 0 {
        ((first >> 2) | (b(1)? << 6), 2)
    } else if first & 4 == 0 {
        ((first >> 3) | (b(1)? << 5) | (b(2)? << 13), 3)
    } else if first & 8 == 0 {
        ((first >> 4) | (b(1)? << 4) | (b(2)? << 12) | (b(3)? << 20), 4)
    } else if first & 16 == 0 {
        (read_u32(data, start + 1)?, 5)
    } else {
        return Err(R2rError::malformed(start, "invalid NativeFormat integer"));
    };

    *pos = start + len;
    Ok(value)
}

/// Decodes a NativeFormat signed integer at `*pos`, advancing it.
pub fn decode_signed(data: &[u8], pos: &mut usize) -> Result<i32> {
    let start = *pos;
    let b = |i: usize| read_u8(data, start + i).map(i32::from);

    let first = b(0)?;
    let (value, len) = if first & 1 == 0 {
        ((first as i8 as i32) >> 1, 1)
    } else if first & 2 == 0 {
        ((first >> 2) | ((b(1)? as i8 as i32) << 6), 2)
    } else if first & 4 == 0 {
        ((first >> 3) | (b(1)? << 5) | ((b(2)? as i8 as i32) << 13), 3)
    } else if first & 8 == 0 {
        (
            (first >> 4) | (b(1)? << 4) | (b(2)? << 12) | ((b(3)? as i8 as i32) << 20),
            4,
        )
    } else if first & 16 == 0 {
        (read_u32(data, start + 1)? as i32, 5)
    } else {
        return Err(R2rError::malformed(start, "invalid NativeFormat integer"));
    };

    *pos = start + len;
    Ok(value)
}

/// A sparse array of offsets, stored as a 16-ary tree of blocks.
#[derive(Debug, Clone, Copy)]
pub struct NativeArray {
    base_offset: usize,
    len: u32,
    entry_index_size: u8,
}

impl NativeArray {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let mut pos = offset;
        let header = decode_unsigned(data, &mut pos)?;
        Ok(Self {
            base_offset: pos,
            len: header >> 2,
            entry_index_size: (header & 3) as u8,
        })
    }

    /// Number of slots, present or not.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the offset of the element at `index`, or `None` for an empty slot.
    pub fn get(&self, data: &[u8], index: u32) -> Result<Option<usize>> {
        if index >= self.len {
            return Ok(None);
        }

        let block = (index / BLOCK_SIZE) as usize;
        let mut offset = self.base_offset
            + match self.entry_index_size {
                0 => read_u8(data, self.base_offset + block)? as usize,
                1 => read_u16(data, self.base_offset + 2 * block)? as usize,
                _ => read_u32(data, self.base_offset + 4 * block)? as usize,
            };

        let mut bit = BLOCK_SIZE >> 1;
        while bit > 0 {
            let mut next = offset;
            let val = decode_unsigned(data, &mut next)?;
            if index & bit != 0 {
                if val & 2 != 0 {
                    offset += (val >> 2) as usize;
                    bit >>= 1;
                    continue;
                }
            } else if val & 1 != 0 {
                offset = next;
                bit >>= 1;
                continue;
            }

            // Leaf for a single element in this subtree.
            if val & 3 == 0 && (val >> 2) == (index & (BLOCK_SIZE - 1)) {
                return Ok(Some(next));
            }
            return Ok(None);
        }

        Ok(Some(offset))
    }
}

/// A hashtable keyed by a hashcode byte, enumerated in bucket order.
#[derive(Debug, Clone, Copy)]
pub struct NativeHashtable {
    base_offset: usize,
    bucket_mask: u32,
    entry_index_size: u8,
}

impl NativeHashtable {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let header = u32::from(read_u8(data, offset)?);
        let shift = header >> 2;
        if shift > 31 {
            return Err(R2rError::malformed(offset, "hashtable bucket count out of range"));
        }
        Ok(Self {
            base_offset: offset + 1,
            bucket_mask: (1u32 << shift) - 1,
            entry_index_size: (header & 3) as u8,
        })
    }

    fn bucket_bounds(&self, data: &[u8], bucket: u32) -> Result<(usize, usize)> {
        let b = bucket as usize;
        let (start, end) = match self.entry_index_size {
            0 => (
                read_u8(data, self.base_offset + b)? as usize,
                read_u8(data, self.base_offset + b + 1)? as usize,
            ),
            1 => (
                read_u16(data, self.base_offset + 2 * b)? as usize,
                read_u16(data, self.base_offset + 2 * b + 2)? as usize,
            ),
            _ => (
                read_u32(data, self.base_offset + 4 * b)? as usize,
                read_u32(data, self.base_offset + 4 * b + 4)? as usize,
            ),
        };
        Ok((self.base_offset + start, self.base_offset + end))
    }

    /// Offsets of every entry, bucket by bucket.
    pub fn entries(&self, data: &[u8]) -> Result<Vec<usize>> {
        let mut entries = Vec::new();
        for bucket in 0..=self.bucket_mask {
            let (mut pos, end) = self.bucket_bounds(data, bucket)?;
            while pos < end {
                // Low byte of the hashcode.
                read_u8(data, pos)?;
                pos += 1;

                let origin = pos;
                let delta = decode_signed(data, &mut pos)?;
                let target = origin as i64 + i64::from(delta);
                if target < 0 || target as usize >= data.len() {
                    return Err(R2rError::malformed(origin, "hashtable entry out of bounds"));
                }
                entries.push(target as usize);
            }
        }
        Ok(entries)
    }
}

/// Reads nibble-encoded integers, low nibble first.
pub struct NibbleReader<'a> {
    data: &'a [u8],
    pos: usize,
    pending: Option<u8>,
}

impl<'a> NibbleReader<'a> {
    pub fn new(data: &'a [u8], offset: usize) -> Self {
        Self {
            data,
            pos: offset,
            pending: None,
        }
    }

    fn read_nibble(&mut self) -> Result<u8> {
        if let Some(high) = self.pending.take() {
            return Ok(high);
        }
        let byte = read_u8(self.data, self.pos)?;
        self.pos += 1;
        self.pending = Some(byte >> 4);
        Ok(byte & 0x0F)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        loop {
            let nibble = self.read_nibble()?;
            value = value
                .checked_mul(8)
                .and_then(|v| v.checked_add(u32::from(nibble & 7)))
                .ok_or_else(|| R2rError::malformed(self.pos, "nibble integer overflow"))?;
            if nibble & 8 == 0 {
                return Ok(value);
            }
        }
    }
}

/// One import cell a method needs resolved before its code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FixupCell {
    pub import_section: u32,
    pub slot: u32,
}

/// Decodes the fixup list of a method entry point.
pub fn read_fixups(data: &[u8], offset: usize) -> Result<Vec<FixupCell>> {
    let mut reader = NibbleReader::new(data, offset);
    let mut cells = Vec::new();

    let mut import_section = reader.read_u32()?;
    loop {
        let mut slot = reader.read_u32()?;
        loop {
            cells.push(FixupCell { import_section, slot });
            let delta = reader.read_u32()?;
            if delta == 0 {
                break;
            }
            slot = slot.wrapping_add(delta);
        }

        let delta = reader.read_u32()?;
        if delta == 0 {
            break;
        }
        import_section = import_section.wrapping_add(delta);
    }

    Ok(cells)
}

/// Decodes an entry point record: the runtime function index and the
/// offset of its fixup list, if any.
pub fn read_entry_point(data: &[u8], offset: usize) -> Result<(u32, Option<usize>)> {
    let mut pos = offset;
    let id = decode_unsigned(data, &mut pos)?;
    if id & 1 == 0 {
        return Ok((id >> 1, None));
    }

    if id & 2 != 0 {
        let mut lookahead = pos;
        let back = decode_unsigned(data, &mut lookahead)? as usize;
        pos = pos
            .checked_sub(back)
            .ok_or_else(|| R2rError::malformed(offset, "fixup offset underflow"))?;
    }
    Ok((id >> 2, Some(pos)))
}
