//! Core meteor-detection algorithms: frame differencing, track
//! association, event acceptance, and the supporting buffers and masks.

mod detector;
mod event;
mod fps;
mod mask;
mod math;
mod merger;
mod params;
mod ring;
mod tracker;
mod writer;

pub use detector::{Candidate, FrameDetector};
pub use event::{DetectionRecord, MeteorEvent};
pub use fps::estimate_fps;
pub use mask::{
    MaskSet, contour_overlap_ratio, dilate, line_overlap_ratio, load_mask, mask_from_frame,
    prepare_mask, save_mask,
};
pub use math::{confidence, linearity, stationary_ratio};
pub use merger::EventMerger;
pub use params::{DetectionParams, Sensitivity};
pub use ring::RingBuffer;
pub use tracker::{RejectReason, TrackPoint, Tracker};
pub use writer::open_clip_writer;
