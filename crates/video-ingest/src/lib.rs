//! Video capture layer: RTSP readers with reconnect, plus test sources.

mod rtsp;
mod synthetic;
mod types;

pub use rtsp::RtspReader;
pub use synthetic::SyntheticSource;
pub use types::{CaptureError, Frame, FrameSource, SourceEvent, StreamInfo, sanitize_fps};
