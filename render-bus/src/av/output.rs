use std::ffi::{CString, c_int, c_void};
use std::io::{Seek, SeekFrom, Write};
use std::ptr;

use ffmpeg_next::ffi;
use ffmpeg_next::Rational;
use ffmpeg_next::packet::Flags as PacketFlags;

use crate::error::{BusError, BusResult};
use crate::packet::Packet;
use crate::sink::{SharedSink, SinkWriter};
use crate::source::{MuxPlan, Muxer};

use super::av_error;

const IO_BUFFER_SIZE: usize = 64 * 1024;

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size < 0 {
        return ffi::AVERROR_EXTERNAL;
    }
    let writer = unsafe { &mut *(opaque as *mut SinkWriter) };
    let data = unsafe { std::slice::from_raw_parts(buf, buf_size as usize) };
    match writer.write_all(data) {
        Ok(()) => buf_size,
        Err(e) => {
            log::error!("sink write failed: {:#?}", e);
            ffi::AVERROR_EXTERNAL
        }
    }
}

unsafe extern "C" fn seek_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    if opaque.is_null() {
        return -1;
    }
    let writer = unsafe { &mut *(opaque as *mut SinkWriter) };
    if whence & ffi::AVSEEK_SIZE as c_int != 0 {
        return writer.len() as i64;
    }
    let pos = match whence & !(ffi::AVSEEK_FORCE as c_int) {
        0 if offset >= 0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return -1,
    };
    match writer.seek(pos) {
        Ok(p) => p as i64,
        Err(_) => -1,
    }
}

/// FFmpeg muxer writing through a custom AVIO context into a chunked sink.
///
/// The output context never opens a file: every byte lands in the sink via
/// [`SinkWriter`], including the seek-back rewrites MP4 needs for its index.
pub struct AvMuxer {
    inner: Option<ffmpeg_next::format::context::Output>,
    avio: *mut ffi::AVIOContext,
    writer: *mut SinkWriter,
    time_bases: Vec<Rational>,
    have_written_header: bool,
    have_written_trailer: bool,
}

// the output context and its io callbacks are only used from the owning task
unsafe impl Send for AvMuxer {}

impl AvMuxer {
    pub fn new(
        plan: &MuxPlan,
        video: ffmpeg_next::codec::Parameters,
        audio: Option<ffmpeg_next::codec::Parameters>,
        sink: SharedSink,
    ) -> BusResult<Self> {
        let format_name = CString::new(plan.container.format_name())
            .map_err(|e| BusError::Mux(e.to_string()))?;
        let file_name =
            CString::new(plan.file_name.as_str()).map_err(|e| BusError::Mux(e.to_string()))?;

        let writer = Box::into_raw(Box::new(SinkWriter::new(sink)));
        let avio = unsafe {
            let buffer = ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(writer));
                return Err(BusError::Mux("io buffer allocation failed".to_string()));
            }
            let avio = ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                1,
                writer as *mut c_void,
                None,
                Some(write_packet),
                Some(seek_packet),
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(writer));
                return Err(BusError::Mux("io context allocation failed".to_string()));
            }
            avio
        };

        let mut muxer = Self {
            inner: None,
            avio,
            writer,
            time_bases: Vec::new(),
            have_written_header: false,
            have_written_trailer: false,
        };

        let mut ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        let ret = unsafe {
            ffi::avformat_alloc_output_context2(
                &mut ctx,
                ptr::null(),
                format_name.as_ptr(),
                file_name.as_ptr(),
            )
        };
        if ret < 0 || ctx.is_null() {
            return Err(BusError::Mux(format!(
                "no muxer for {}: {}",
                plan.container,
                ffmpeg_next::Error::from(ret)
            )));
        }
        unsafe {
            (*ctx).pb = muxer.avio;
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
        }
        let output = muxer
            .inner
            .insert(unsafe { ffmpeg_next::format::context::Output::wrap(ctx) });

        let mut add = |params: ffmpeg_next::codec::Parameters, time_base: Rational| -> BusResult<()> {
            let mut stream = output
                .add_stream(ffmpeg_next::encoder::find(params.id()))
                .map_err(|e| av_error(BusError::Mux, e))?;
            stream.set_parameters(params);
            stream.set_time_base(time_base);
            // let the container pick its own tag
            unsafe {
                (*(*stream.as_mut_ptr()).codecpar).codec_tag = 0;
            }
            Ok(())
        };
        let video_tb = Rational(plan.video_time_base.num, plan.video_time_base.den);
        add(video, video_tb)?;
        if let (Some(params), Some(info)) = (audio, plan.audio.as_ref()) {
            add(params, Rational(info.time_base.num, info.time_base.den))?;
        }

        log::info!(
            "muxer ready: {} ({}), {} stream(s)",
            plan.file_name,
            plan.container,
            output.nb_streams()
        );
        Ok(muxer)
    }

    fn output(&mut self) -> BusResult<&mut ffmpeg_next::format::context::Output> {
        self.inner
            .as_mut()
            .ok_or_else(|| BusError::Mux("muxer already closed".to_string()))
    }
}

impl Muxer for AvMuxer {
    fn write_header(&mut self) -> BusResult<()> {
        if self.have_written_header {
            return Ok(());
        }
        let output = self.output()?;
        output
            .write_header()
            .map_err(|e| av_error(BusError::Mux, e))?;
        // the muxer may have replaced the stream time bases
        let time_bases = output.streams().map(|s| s.time_base()).collect();
        self.time_bases = time_bases;
        self.have_written_header = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet, stream: usize) -> BusResult<()> {
        if !self.have_written_header {
            self.write_header()?;
        }
        let out_time_base = *self
            .time_bases
            .get(stream)
            .ok_or_else(|| BusError::Mux(format!("stream {} not found", stream)))?;
        let in_time_base = Rational(packet.time_base().num, packet.time_base().den);

        let mut p = ffmpeg_next::Packet::copy(packet.data());
        p.set_pts(packet.pts());
        p.set_dts(packet.dts());
        p.set_duration(packet.duration());
        if packet.is_key() {
            p.set_flags(PacketFlags::KEY);
        }
        p.set_stream(stream);
        p.set_position(-1);
        p.rescale_ts(in_time_base, out_time_base);
        let output = self.output()?;
        p.write_interleaved(output)
            .map_err(|e| av_error(BusError::Mux, e))
    }

    fn finish(&mut self) -> BusResult<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.output()?
                .write_trailer()
                .map_err(|e| av_error(BusError::Mux, e))?;
            unsafe { ffi::avio_flush(self.avio) };
        }
        Ok(())
    }
}

impl Drop for AvMuxer {
    fn drop(&mut self) {
        if let Some(mut output) = self.inner.take() {
            // detach the custom io so the context does not try to close it
            unsafe { (*output.as_mut_ptr()).pb = ptr::null_mut() };
            drop(output);
        }
        unsafe {
            if !self.avio.is_null() {
                ffi::av_freep(&mut (*self.avio).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.avio);
            }
            if !self.writer.is_null() {
                drop(Box::from_raw(self.writer));
                self.writer = ptr::null_mut();
            }
        }
    }
}
