use bytes::Bytes;

use crate::stream::TimeBase;

/// Compressed payload travelling between demuxer, decoder, encoder and muxer.
#[derive(Debug, Clone)]
pub struct Packet {
    stream_index: usize,
    data: Bytes,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    is_key: bool,
    time_base: TimeBase,
}

impl Packet {
    pub fn new(stream_index: usize, data: impl Into<Bytes>, time_base: TimeBase) -> Self {
        Self {
            stream_index,
            data: data.into(),
            pts: None,
            dts: None,
            duration: 0,
            is_key: false,
            time_base,
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self.dts.get_or_insert(pts);
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn index(&self) -> usize {
        self.stream_index
    }

    pub fn set_index(&mut self, stream_index: usize) {
        self.stream_index = stream_index;
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn pts_us(&self) -> Option<i64> {
        self.pts.map(|pts| self.time_base.to_us(pts))
    }

    pub fn end_us(&self) -> Option<i64> {
        self.pts
            .map(|pts| self.time_base.to_us(pts + self.duration))
    }

    /// Moves pts/dts back by `offset` time-base units.
    pub fn shift(&mut self, offset: i64) {
        self.pts = self.pts.map(|v| v - offset);
        self.dts = self.dts.map(|v| v - offset);
    }
}
