//! Randomly addressable in-memory output.
//!
//! Muxers write payload sequentially but come back to patch headers, so the
//! sink accepts writes at any offset. Storage is split into fixed-size
//! segments; interior segments that fill up are frozen into immutable
//! [`Bytes`] so only the edges keep growable `Vec<u8>` buffers around.

use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{BusError, BusResult};

pub const SEGMENT_SIZE: usize = 32 * 1024 * 1024;

enum Segment {
    Open(Vec<u8>),
    Frozen(Bytes),
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Segment::Open(v) => v.len(),
            Segment::Frozen(b) => b.len(),
        }
    }
}

pub struct ChunkedSink {
    segment_size: usize,
    segments: Vec<Segment>,
}

impl ChunkedSink {
    pub fn new() -> Self {
        Self::with_segment_size(SEGMENT_SIZE)
    }

    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            segment_size: segment_size.max(1),
            segments: Vec::new(),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn frozen_segments(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Frozen(_)))
            .count()
    }

    /// Logical size: everything up to the end of the furthest write.
    pub fn len(&self) -> u64 {
        match self.segments.last() {
            Some(last) => {
                (self.segments.len() as u64 - 1) * self.segment_size as u64 + last.len() as u64
            }
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> BusResult<()> {
        let mut offset = offset;
        let mut data = data;
        while !data.is_empty() {
            let index = (offset / self.segment_size as u64) as usize;
            let pos = (offset % self.segment_size as u64) as usize;
            let len = (self.segment_size - pos).min(data.len());

            self.ensure_segments(index + 1);
            let segment = self.thaw(index);
            if segment.len() < pos + len {
                let additional = pos + len - segment.len();
                segment
                    .try_reserve(additional)
                    .map_err(|e| io::Error::new(ErrorKind::OutOfMemory, e.to_string()))?;
                segment.resize(pos + len, 0);
            }
            segment[pos..pos + len].copy_from_slice(&data[..len]);
            self.freeze_if_full(index);

            offset += len as u64;
            data = &data[len..];
        }
        Ok(())
    }

    /// Concatenates every segment in order. Interior segments are zero-padded
    /// to full size so offsets survive; the last one keeps its used length.
    pub fn finalize(self) -> BusResult<Bytes> {
        let total = self.len() as usize;
        let mut out: Vec<u8> = Vec::new();
        out.try_reserve_exact(total)
            .map_err(|e| io::Error::new(ErrorKind::OutOfMemory, e.to_string()))?;

        let last = self.segments.len().saturating_sub(1);
        for (i, segment) in self.segments.into_iter().enumerate() {
            let used = segment.len();
            match segment {
                Segment::Open(mut v) => {
                    v.shrink_to_fit();
                    out.extend_from_slice(&v);
                }
                Segment::Frozen(b) => out.extend_from_slice(&b),
            }
            if i < last && used < self.segment_size {
                out.resize(out.len() + self.segment_size - used, 0);
            }
        }
        log::debug!("sink finalized: {} bytes", out.len());
        Ok(Bytes::from(out))
    }

    fn ensure_segments(&mut self, count: usize) {
        while self.segments.len() < count {
            let previous_last = self.segments.len().checked_sub(1);
            self.segments.push(Segment::Open(Vec::new()));
            if let Some(i) = previous_last {
                self.freeze_if_full(i);
            }
        }
    }

    fn thaw(&mut self, index: usize) -> &mut Vec<u8> {
        let reopened = match &self.segments[index] {
            Segment::Frozen(b) => Some(b.to_vec()),
            Segment::Open(_) => None,
        };
        if let Some(v) = reopened {
            log::trace!("sink segment {} reopened for patch write", index);
            self.segments[index] = Segment::Open(v);
        }
        match &mut self.segments[index] {
            Segment::Open(v) => v,
            Segment::Frozen(_) => unreachable!("segment was just reopened"),
        }
    }

    fn freeze_if_full(&mut self, index: usize) {
        let interior = index > 0 && index + 1 < self.segments.len();
        if !interior {
            return;
        }
        let full = match &mut self.segments[index] {
            Segment::Open(v) if v.len() == self.segment_size => std::mem::take(v),
            _ => return,
        };
        self.segments[index] = Segment::Frozen(Bytes::from(full));
    }
}

impl Default for ChunkedSink {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedSink = Arc<Mutex<ChunkedSink>>;

pub fn shared(sink: ChunkedSink) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

/// `Write + Seek` cursor over a shared sink, the shape muxer byte callbacks
/// expect.
pub struct SinkWriter {
    sink: SharedSink,
    position: u64,
}

impl SinkWriter {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Bytes written so far, regardless of the cursor.
    pub fn len(&self) -> u64 {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, ChunkedSink> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let position = self.position;
        self.lock().write(position, buf).map_err(|e| match e {
            BusError::Io(io) => io,
            other => io::Error::other(other.to_string()),
        })?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SinkWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.lock().len().checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "seek before start of sink",
            )),
        }
    }
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
