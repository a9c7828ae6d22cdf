//! Clip writer construction with codec fallback.

use opencv::{
    core::Size,
    prelude::*,
    videoio::VideoWriter,
};
use tracing::{debug, warn};

/// Preferred fourcc order; first codec that opens wins.
const CODECS: [[char; 4]; 3] = [
    ['a', 'v', 'c', '1'],
    ['H', '2', '6', '4'],
    ['m', 'p', '4', 'v'],
];

/// Open a colour video writer for `path`, trying each codec in turn.
///
/// Returns `None` when no codec is available on this platform; the caller
/// records the detection anyway and skips the clip.
pub fn open_clip_writer(path: &str, fps: f64, size: Size) -> Option<VideoWriter> {
    for codec in CODECS {
        let fourcc = match VideoWriter::fourcc(codec[0], codec[1], codec[2], codec[3]) {
            Ok(fourcc) => fourcc,
            Err(_) => continue,
        };
        match VideoWriter::new(path, fourcc, fps, size, true) {
            Ok(writer) => match writer.is_opened() {
                Ok(true) => {
                    debug!(path, codec = %codec.iter().collect::<String>(), "clip writer opened");
                    return Some(writer);
                }
                _ => drop(writer),
            },
            Err(err) => {
                debug!(path, "codec {:?} failed: {err}", codec);
            }
        }
    }
    warn!(path, "no usable video codec; clip will be skipped");
    None
}
