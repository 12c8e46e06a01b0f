//! AVI container with uncompressed 24-bit video and 16-bit PCM audio.
//!
//! Layout written by [`AviWriter`]:
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'
//!     avih
//!     LIST 'strl' (strh 'vids', strf BITMAPINFOHEADER)
//!     LIST 'strl' (strh 'auds', strf WAVEFORMAT)      optional
//!   LIST 'movi'
//!     00db / 00dc / 01wb chunks
//!   idx1
//! ```

use std::{
    fs::{self, File},
    io::{BufWriter, Seek, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use byteorder::{LittleEndian, WriteBytesExt};

use super::{
    riff::{begin_chunk, begin_list, fill_size, patch_u16, patch_u32, u16_slot, u32_slot, write_chunk},
    MediaWriter, MuxSummary, TrackLayout,
};
use crate::{
    audio::{AudioBuffer, AudioFormat},
    capture::{FrameSize, VideoFrame},
    timeline::frame_slot,
    ArStageError, Result,
};

const AVIF_HASINDEX: u32 = 0x10;
const AVIF_ISINTERLEAVED: u32 = 0x100;
const AVIIF_KEYFRAME: u32 = 0x10;

const VIDEO_DATA: &[u8; 4] = b"00db";
const VIDEO_REPEAT: &[u8; 4] = b"00dc";
const AUDIO_DATA: &[u8; 4] = b"01wb";

/// Audio gaps shorter than this are absorbed rather than padded with silence.
const AUDIO_GAP_TOLERANCE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: [u8; 4],
    flags: u32,
    offset: u32,
    size: u32,
}

/// Header fields only known once the recording ends.
#[derive(Debug, Default)]
struct HeaderSlots {
    total_frames: u64,
    suggested_buffer: u64,
    width: u64,
    height: u64,
    video_length: u64,
    video_suggested: u64,
    frame_right: u64,
    frame_bottom: u64,
    bitmap_width: u64,
    bitmap_height: u64,
    bitmap_size: u64,
    audio_length: Option<u64>,
}

/// Progressive AVI writer. Chunks go to disk as they arrive; sizes, counts
/// and the index are written by [`MediaWriter::finalize`].
pub struct AviWriter {
    path: PathBuf,
    out: BufWriter<File>,
    fps: u32,
    audio: Option<AudioFormat>,
    frame_size: Option<FrameSize>,
    slots: HeaderSlots,
    riff_size_pos: u64,
    movi_size_pos: u64,
    movi_fourcc_pos: u64,
    index: Vec<IndexEntry>,
    max_chunk: u32,
    next_frame: u64,
    video_frames: u64,
    repeated_frames: u64,
    skipped_frames: u64,
    audio_chunks: u64,
    audio_bytes: u64,
    audio_frames: u64,
}

impl std::fmt::Debug for AviWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AviWriter")
            .field("path", &self.path)
            .field("fps", &self.fps)
            .field("frame_size", &self.frame_size)
            .field("next_frame", &self.next_frame)
            .finish()
    }
}

impl AviWriter {
    /// Creates `path` and writes the header. A failure leaves no file behind.
    pub fn create(path: &Path, layout: TrackLayout) -> Result<Self> {
        if layout.fps == 0 {
            return Err(ArStageError::invalid("frame rate must be positive"));
        }
        let file = File::create(path).map_err(|err| {
            ArStageError::unavailable(format!("cannot create {}: {err}", path.display()))
        })?;

        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            fps: layout.fps,
            audio: layout.audio,
            frame_size: layout.frame_size,
            slots: HeaderSlots::default(),
            riff_size_pos: 0,
            movi_size_pos: 0,
            movi_fourcc_pos: 0,
            index: Vec::new(),
            max_chunk: 0,
            next_frame: 0,
            video_frames: 0,
            repeated_frames: 0,
            skipped_frames: 0,
            audio_chunks: 0,
            audio_bytes: 0,
            audio_frames: 0,
        };

        if let Err(err) = writer.write_header() {
            drop(writer.out);
            let _ = fs::remove_file(&writer.path);
            return Err(err);
        }
        tracing::debug!(path = %writer.path.display(), fps = writer.fps, audio = writer.audio.is_some(), "opened avi container");
        Ok(writer)
    }

    fn write_header(&mut self) -> Result<()> {
        let out = &mut self.out;
        let slots = &mut self.slots;

        self.riff_size_pos = begin_list(out, b"RIFF", b"AVI ")?;
        let hdrl = begin_list(out, b"LIST", b"hdrl")?;

        let avih = begin_chunk(out, b"avih")?;
        out.write_u32::<LittleEndian>(1_000_000 / self.fps)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(AVIF_HASINDEX | AVIF_ISINTERLEAVED)?;
        slots.total_frames = u32_slot(out)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(if self.audio.is_some() { 2 } else { 1 })?;
        slots.suggested_buffer = u32_slot(out)?;
        slots.width = u32_slot(out)?;
        slots.height = u32_slot(out)?;
        for _ in 0..4 {
            out.write_u32::<LittleEndian>(0)?;
        }
        fill_size(out, avih)?;

        let strl = begin_list(out, b"LIST", b"strl")?;
        let strh = begin_chunk(out, b"strh")?;
        out.write_all(b"vids")?;
        out.write_all(b"DIB ")?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(1)?;
        out.write_u32::<LittleEndian>(self.fps)?;
        out.write_u32::<LittleEndian>(0)?;
        slots.video_length = u32_slot(out)?;
        slots.video_suggested = u32_slot(out)?;
        out.write_u32::<LittleEndian>(u32::MAX)?;
        out.write_u32::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u16::<LittleEndian>(0)?;
        slots.frame_right = u16_slot(out)?;
        slots.frame_bottom = u16_slot(out)?;
        fill_size(out, strh)?;

        let strf = begin_chunk(out, b"strf")?;
        out.write_u32::<LittleEndian>(40)?;
        slots.bitmap_width = u32_slot(out)?;
        slots.bitmap_height = u32_slot(out)?;
        out.write_u16::<LittleEndian>(1)?;
        out.write_u16::<LittleEndian>(24)?;
        out.write_u32::<LittleEndian>(0)?;
        slots.bitmap_size = u32_slot(out)?;
        for _ in 0..4 {
            out.write_u32::<LittleEndian>(0)?;
        }
        fill_size(out, strf)?;
        fill_size(out, strl)?;

        if let Some(format) = self.audio {
            let strl = begin_list(out, b"LIST", b"strl")?;
            let strh = begin_chunk(out, b"strh")?;
            out.write_all(b"auds")?;
            out.write_u32::<LittleEndian>(0)?;
            out.write_u32::<LittleEndian>(0)?;
            out.write_u16::<LittleEndian>(0)?;
            out.write_u16::<LittleEndian>(0)?;
            out.write_u32::<LittleEndian>(0)?;
            out.write_u32::<LittleEndian>(format.block_align())?;
            out.write_u32::<LittleEndian>(format.byte_rate())?;
            out.write_u32::<LittleEndian>(0)?;
            slots.audio_length = Some(u32_slot(out)?);
            out.write_u32::<LittleEndian>(format.byte_rate())?;
            out.write_u32::<LittleEndian>(u32::MAX)?;
            out.write_u32::<LittleEndian>(format.block_align())?;
            for _ in 0..4 {
                out.write_u16::<LittleEndian>(0)?;
            }
            fill_size(out, strh)?;

            let strf = begin_chunk(out, b"strf")?;
            out.write_u16::<LittleEndian>(1)?;
            out.write_u16::<LittleEndian>(format.channels)?;
            out.write_u32::<LittleEndian>(format.sample_rate)?;
            out.write_u32::<LittleEndian>(format.byte_rate())?;
            out.write_u16::<LittleEndian>(format.block_align() as u16)?;
            out.write_u16::<LittleEndian>(16)?;
            fill_size(out, strf)?;
            fill_size(out, strl)?;
        }

        fill_size(out, hdrl)?;

        self.movi_size_pos = begin_chunk(out, b"LIST")?;
        self.movi_fourcc_pos = self.movi_size_pos + 4;
        out.write_all(b"movi")?;
        Ok(())
    }

    fn push_chunk(&mut self, id: &[u8; 4], flags: u32, payload: &[u8]) -> Result<()> {
        let pos = self.out.stream_position()?;
        let offset = u32::try_from(pos - self.movi_fourcc_pos)
            .map_err(|_| ArStageError::unavailable("recording exceeds the AVI size limit"))?;
        write_chunk(&mut self.out, id, payload)?;
        let size = payload.len() as u32;
        self.max_chunk = self.max_chunk.max(size);
        self.index.push(IndexEntry {
            id: *id,
            flags,
            offset,
            size,
        });
        Ok(())
    }

    fn frame_index(&self, timestamp: Duration) -> u64 {
        frame_slot(timestamp, self.fps)
    }

    fn media_duration(&self) -> Duration {
        let video = span(self.next_frame, self.fps);
        let audio = self
            .audio
            .map(|format| span(self.audio_frames, format.sample_rate))
            .unwrap_or_default();
        video.max(audio)
    }
}

impl MediaWriter for AviWriter {
    fn write_video(&mut self, timestamp: Duration, frame: &VideoFrame) -> Result<()> {
        let size = *self.frame_size.get_or_insert(frame.size());
        if size.is_empty() {
            return Err(ArStageError::invalid("video frames must not be empty"));
        }

        let index = self.frame_index(timestamp);
        if index < self.next_frame {
            self.skipped_frames += 1;
            tracing::trace!(?timestamp, index, next = self.next_frame, "frame earlier than its slot");
            return Ok(());
        }
        let payload = if frame.size() == size {
            dib_rows(frame)
        } else {
            dib_rows(&frame.scaled(size))
        };
        while self.next_frame < index {
            // A repeat chunk needs an earlier frame; lead-in slots carry this one.
            if self.video_frames == 0 {
                self.push_chunk(VIDEO_DATA, AVIIF_KEYFRAME, &payload)?;
            } else {
                self.push_chunk(VIDEO_REPEAT, 0, &[])?;
            }
            self.repeated_frames += 1;
            self.next_frame += 1;
        }
        self.push_chunk(VIDEO_DATA, AVIIF_KEYFRAME, &payload)?;
        self.video_frames += 1;
        self.next_frame += 1;
        Ok(())
    }

    fn write_audio(&mut self, timestamp: Duration, buffer: &AudioBuffer) -> Result<()> {
        let format = self
            .audio
            .ok_or_else(|| ArStageError::invalid("container was opened without an audio track"))?;
        if buffer.format != format {
            return Err(ArStageError::invalid(format!(
                "audio format {:?} does not match the track format {:?}",
                buffer.format, format
            )));
        }

        let expected = (timestamp.as_secs_f64() * format.sample_rate as f64).round() as u64;
        let tolerance = (AUDIO_GAP_TOLERANCE.as_secs_f64() * format.sample_rate as f64) as u64;
        if expected > self.audio_frames + tolerance {
            let gap = (expected - self.audio_frames) as usize;
            let silence = AudioBuffer::silence(format, gap);
            self.push_chunk(AUDIO_DATA, AVIIF_KEYFRAME, &silence.to_le_bytes())?;
            self.audio_frames += gap as u64;
            self.audio_bytes += gap as u64 * format.block_align() as u64;
            tracing::debug!(?timestamp, gap_frames = gap, "padded audio gap with silence");
        }

        let bytes = buffer.to_le_bytes();
        self.push_chunk(AUDIO_DATA, AVIIF_KEYFRAME, &bytes)?;
        self.audio_chunks += 1;
        self.audio_bytes += bytes.len() as u64;
        self.audio_frames += buffer.frames() as u64;
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<MuxSummary> {
        fill_size(&mut self.out, self.movi_size_pos)?;

        let idx1 = begin_chunk(&mut self.out, b"idx1")?;
        for entry in &self.index {
            self.out.write_all(&entry.id)?;
            self.out.write_u32::<LittleEndian>(entry.flags)?;
            self.out.write_u32::<LittleEndian>(entry.offset)?;
            self.out.write_u32::<LittleEndian>(entry.size)?;
        }
        fill_size(&mut self.out, idx1)?;
        fill_size(&mut self.out, self.riff_size_pos)?;

        let size = self.frame_size.unwrap_or(FrameSize::new(0, 0));
        let image_bytes = stride(size.width) as u32 * size.height;
        let frames = u32::try_from(self.next_frame).unwrap_or(u32::MAX);
        let slots = &self.slots;
        let out = &mut self.out;
        patch_u32(out, slots.total_frames, frames)?;
        patch_u32(out, slots.suggested_buffer, self.max_chunk)?;
        patch_u32(out, slots.width, size.width)?;
        patch_u32(out, slots.height, size.height)?;
        patch_u32(out, slots.video_length, frames)?;
        patch_u32(out, slots.video_suggested, image_bytes)?;
        patch_u16(out, slots.frame_right, size.width.min(u16::MAX as u32) as u16)?;
        patch_u16(out, slots.frame_bottom, size.height.min(u16::MAX as u32) as u16)?;
        patch_u32(out, slots.bitmap_width, size.width)?;
        patch_u32(out, slots.bitmap_height, size.height)?;
        patch_u32(out, slots.bitmap_size, image_bytes)?;
        if let Some(pos) = slots.audio_length {
            patch_u32(out, pos, u32::try_from(self.audio_frames).unwrap_or(u32::MAX))?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;

        let summary = MuxSummary {
            path: self.path.clone(),
            video_frames: self.video_frames,
            repeated_frames: self.repeated_frames,
            skipped_frames: self.skipped_frames,
            audio_chunks: self.audio_chunks,
            audio_bytes: self.audio_bytes,
            duration: self.media_duration(),
        };
        tracing::info!(
            path = %summary.path.display(),
            frames = summary.video_frames,
            repeated = summary.repeated_frames,
            skipped = summary.skipped_frames,
            audio_chunks = summary.audio_chunks,
            "finalized avi container"
        );
        Ok(summary)
    }

    fn abort(self: Box<Self>) {
        let path = self.path.clone();
        drop(self);
        if let Err(err) = fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), %err, "could not remove aborted recording");
        }
    }
}

/// Duration of `count` units at `rate` per second.
fn span(count: u64, rate: u32) -> Duration {
    let nanos = count as u128 * 1_000_000_000 / rate.max(1) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Row stride of a 24-bit DIB, padded to four bytes.
fn stride(width: u32) -> usize {
    (width as usize * 3 + 3) & !3
}

/// RGBA rows top-down to BGR rows bottom-up.
fn dib_rows(frame: &VideoFrame) -> Vec<u8> {
    let size = frame.size();
    let row_len = stride(size.width);
    let src_stride = size.width as usize * 4;
    let mut out = Vec::with_capacity(row_len * size.height as usize);
    for row in frame.pixels().chunks_exact(src_stride).rev() {
        let start = out.len();
        for px in row.chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        out.resize(start + row_len, 0);
    }
    out
}
