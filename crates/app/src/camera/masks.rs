//! Mask management for one camera: loading configured masks at the
//! resolutions each consumer needs, and regenerating the exclusion mask
//! from a live frame.

use std::fs;
use std::path::Path;

use detect_core::{MaskSet, load_mask, mask_from_frame, prepare_mask, save_mask};
use opencv::{
    core::{AlgorithmHint, Mat, Size},
    imgproc,
    prelude::*,
};
use tracing::info;

use crate::camera::settings::Settings;

/// Pixels brighter than this in the reference frame become masked.
const MASK_BRIGHTNESS_THRESHOLD: f64 = 200.0;

/// Masks prepared for the two consumers: the detector works at processing
/// resolution, the tracker's path check at full resolution.
#[derive(Default)]
pub struct PreparedMasks {
    pub detector: MaskSet,
    pub nuisance_full: Option<Mat>,
}

/// Load whatever masks the settings point at.
pub fn load_masks(settings: &Settings, proc_size: Size, full_size: Size) -> PreparedMasks {
    let exclusion = settings
        .mask_path
        .as_deref()
        .and_then(|path| load_mask(path, proc_size, settings.mask_dilate));
    let nuisance = settings
        .nuisance_mask_path
        .as_deref()
        .and_then(|path| load_mask(path, proc_size, settings.nuisance_dilate));
    let nuisance_full = settings
        .nuisance_mask_path
        .as_deref()
        .and_then(|path| load_mask(path, full_size, settings.nuisance_dilate));

    PreparedMasks {
        detector: MaskSet {
            exclusion,
            nuisance,
        },
        nuisance_full,
    }
}

/// Build a fresh exclusion mask from the latest raw frame, persist it,
/// and return both the full-resolution mask and its processing-scale
/// version for the detector.
pub fn regenerate_exclusion(
    frame_bgr: &Mat,
    dilate_px: i32,
    proc_size: Size,
    save_path: &Path,
) -> opencv::Result<(Mat, Mat)> {
    let mut gray = Mat::default();
    imgproc::cvt_color(
        frame_bgr,
        &mut gray,
        imgproc::COLOR_BGR2GRAY,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    let full = mask_from_frame(&gray, MASK_BRIGHTNESS_THRESHOLD, dilate_px)?;

    if let Some(parent) = save_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    save_mask(&save_path.to_string_lossy(), &full)?;
    info!(path = %save_path.display(), "exclusion mask regenerated");

    let proc = prepare_mask(&full, proc_size, 0)?;
    Ok((full, proc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{self, Rect, Scalar};
    use tempfile::TempDir;

    #[test]
    fn regenerated_mask_covers_bright_regions() {
        let mut frame = Mat::new_rows_cols_with_default(
            120,
            160,
            core::CV_8UC3,
            Scalar::new(10.0, 10.0, 10.0, 0.0),
        )
        .unwrap();
        imgproc::rectangle(
            &mut frame,
            Rect::new(40, 40, 20, 20),
            Scalar::new(250.0, 250.0, 250.0, 0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("masks/cam_mask.png");
        let (full, proc) =
            regenerate_exclusion(&frame, 2, Size::new(80, 60), &path).unwrap();

        assert!(path.exists());
        assert_eq!(full.size().unwrap(), Size::new(160, 120));
        assert_eq!(proc.size().unwrap(), Size::new(80, 60));
        // The bright block plus dilation margin is masked.
        let on = core::count_non_zero(&full).unwrap();
        assert!(on >= 400, "mask covers {on} px");
    }
}
