//! RIFF chunk writing primitives.
//!
//! A chunk is a 4-byte ASCII id, a 4-byte little-endian payload size and the
//! payload, padded to an even length. Lists are chunks with id `LIST` (or
//! `RIFF` at the root) whose payload starts with a 4-byte list type.

use std::io::{Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{ArStageError, Result};

/// Writes a chunk id followed by a zero size and returns the position of the
/// size field, to be patched with [`fill_size`].
pub fn begin_chunk<W: Write + Seek>(writer: &mut W, id: &[u8; 4]) -> Result<u64> {
    writer.write_all(id)?;
    let size_pos = writer.stream_position()?;
    writer.write_u32::<LittleEndian>(0)?;
    Ok(size_pos)
}

/// Starts a `LIST` (or `RIFF`) chunk of the given list type.
pub fn begin_list<W: Write + Seek>(writer: &mut W, id: &[u8; 4], list_type: &[u8; 4]) -> Result<u64> {
    let size_pos = begin_chunk(writer, id)?;
    writer.write_all(list_type)?;
    Ok(size_pos)
}

/// Patches the size field at `size_pos` with the number of bytes written
/// after it, then pads the chunk to an even length.
pub fn fill_size<W: Write + Seek>(writer: &mut W, size_pos: u64) -> Result<()> {
    let current = writer.stream_position()?;
    let size = current - size_pos - 4;
    if size > u32::MAX as u64 {
        return Err(ArStageError::unavailable(format!(
            "chunk of {size} bytes exceeds the RIFF 32-bit limit"
        )));
    }
    patch_u32(writer, size_pos, size as u32)?;
    if size % 2 == 1 {
        writer.write_u8(0)?;
    }
    Ok(())
}

/// Writes a complete chunk with a known payload.
pub fn write_chunk<W: Write>(writer: &mut W, id: &[u8; 4], payload: &[u8]) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(ArStageError::unavailable("chunk payload too large"));
    }
    writer.write_all(id)?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    if payload.len() % 2 == 1 {
        writer.write_u8(0)?;
    }
    Ok(())
}

/// Overwrites a u32 at `pos` and returns to the current end.
pub fn patch_u32<W: Write + Seek>(writer: &mut W, pos: u64, value: u32) -> Result<()> {
    let current = writer.stream_position()?;
    writer.seek(SeekFrom::Start(pos))?;
    writer.write_u32::<LittleEndian>(value)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Overwrites the `u16` at `pos` and returns to the end of the stream.
pub fn patch_u16<W: Write + Seek>(writer: &mut W, pos: u64, value: u16) -> Result<()> {
    let current = writer.stream_position()?;
    writer.seek(SeekFrom::Start(pos))?;
    writer.write_u16::<LittleEndian>(value)?;
    writer.seek(SeekFrom::Start(current))?;
    Ok(())
}

/// Writes a u32 placeholder and returns its position.
pub fn u32_slot<W: Write + Seek>(writer: &mut W) -> Result<u64> {
    let pos = writer.stream_position()?;
    writer.write_u32::<LittleEndian>(0)?;
    Ok(pos)
}

/// Writes a zero `u16` placeholder and returns its position.
pub fn u16_slot<W: Write + Seek>(writer: &mut W) -> Result<u64> {
    let pos = writer.stream_position()?;
    writer.write_u16::<LittleEndian>(0)?;
    Ok(pos)
}
