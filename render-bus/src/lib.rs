//! Order-preserving parallel render pipeline for rotating-view video.
//!
//! Decoded frames are handed to a pool of render workers, come back in
//! submission order and feed the encoder. Calibration estimators learn the
//! crop, corner block size and orientation field from the input before an
//! encode.

pub mod calibrate;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod memory;
pub mod output;
pub mod packet;
pub mod reader;
pub mod scheduler;
pub mod seek;
pub mod session;
pub mod sink;
pub mod source;
pub mod stream;
pub mod transform;
pub mod worker;

#[cfg(feature = "ffmpeg")]
pub mod av;

pub use config::{PipelineConfig, RenderConfig, pipeline_config};
pub use driver::{EncodeDriver, EncodeOutput, EncodeSummary};
pub use error::{BusError, BusResult};
pub use frame::{Frame, RenderedFrame, RotationCode};
pub use scheduler::{RenderHandle, RenderScheduler};
pub use session::{Calibration, MediaSession, PreviewFrame};
pub use sink::ChunkedSink;
pub use source::MediaBackend;
pub use transform::CpuTransform;
