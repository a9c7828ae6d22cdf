//! Exclusion / nuisance mask handling.
//!
//! Both mask kinds are binary, full-frame, 8-bit matrices. Exclusion masks
//! zero out regions of the difference image before contour extraction;
//! nuisance masks only gate candidates and finished tracks by overlap.

use opencv::{
    core::{self, Mat, Point, Scalar, Size, Vector, no_array},
    imgcodecs, imgproc,
    prelude::*,
};
use tracing::warn;

/// Pair of optional masks the detector consults, swapped atomically.
#[derive(Default)]
pub struct MaskSet {
    pub exclusion: Option<Mat>,
    pub nuisance: Option<Mat>,
}

/// Load a mask image, normalise it to `size`, binarise, and dilate.
///
/// Returns `None` (with a warning) when the file cannot be read, so a
/// missing mask never takes the camera down.
pub fn load_mask(path: &str, size: Size, dilate_px: i32) -> Option<Mat> {
    let raw = match imgcodecs::imread(path, imgcodecs::IMREAD_GRAYSCALE) {
        Ok(mat) if !mat.empty() => mat,
        Ok(_) => {
            warn!(path, "mask image is empty or unreadable");
            return None;
        }
        Err(err) => {
            warn!(path, "failed to read mask image: {err}");
            return None;
        }
    };
    match prepare_mask(&raw, size, dilate_px) {
        Ok(mask) => Some(mask),
        Err(err) => {
            warn!(path, "failed to prepare mask: {err}");
            None
        }
    }
}

/// Resize to `size` (nearest neighbour), binarise at 1, dilate by `dilate_px`.
pub fn prepare_mask(raw: &Mat, size: Size, dilate_px: i32) -> opencv::Result<Mat> {
    let resized = if raw.size()? != size {
        let mut out = Mat::default();
        imgproc::resize(raw, &mut out, size, 0.0, 0.0, imgproc::INTER_NEAREST)?;
        out
    } else {
        raw.clone()
    };

    let mut binary = Mat::default();
    imgproc::threshold(&resized, &mut binary, 1.0, 255.0, imgproc::THRESH_BINARY)?;

    if dilate_px > 0 {
        Ok(dilate(&binary, dilate_px)?)
    } else {
        Ok(binary)
    }
}

/// Grow mask regions by `px` using an elliptical kernel.
pub fn dilate(mask: &Mat, px: i32) -> opencv::Result<Mat> {
    let k = 2 * px + 1;
    let kernel = imgproc::get_structuring_element(
        imgproc::MORPH_ELLIPSE,
        Size::new(k, k),
        Point::new(-1, -1),
    )?;
    let mut out = Mat::default();
    imgproc::dilate(
        mask,
        &mut out,
        &kernel,
        Point::new(-1, -1),
        1,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;
    Ok(out)
}

/// Build an exclusion mask from a single frame: everything brighter than
/// `threshold` (rooftops, lit signage, the horizon glow) plus a safety
/// margin of `dilate_px`.
pub fn mask_from_frame(gray: &Mat, threshold: f64, dilate_px: i32) -> opencv::Result<Mat> {
    let mut binary = Mat::default();
    imgproc::threshold(gray, &mut binary, threshold, 255.0, imgproc::THRESH_BINARY)?;
    if dilate_px > 0 {
        dilate(&binary, dilate_px)
    } else {
        Ok(binary)
    }
}

/// Persist a mask as PNG.
pub fn save_mask(path: &str, mask: &Mat) -> opencv::Result<bool> {
    imgcodecs::imwrite(path, mask, &Vector::new())
}

/// Fraction of `candidate` pixels that also lie on `nuisance`.
pub fn contour_overlap_ratio(candidate: &Mat, nuisance: &Mat) -> opencv::Result<f64> {
    let candidate_area = core::count_non_zero(candidate)?;
    if candidate_area == 0 {
        return Ok(0.0);
    }
    let mut intersection = Mat::default();
    core::bitwise_and(candidate, nuisance, &mut intersection, &no_array())?;
    let overlap = core::count_non_zero(&intersection)?;
    Ok(overlap as f64 / candidate_area as f64)
}

/// Fraction of the start→end line (2 px, anti-aliased) covered by `nuisance`.
pub fn line_overlap_ratio(
    nuisance: &Mat,
    start: (i32, i32),
    end: (i32, i32),
) -> opencv::Result<f64> {
    let mut line = Mat::zeros_size(nuisance.size()?, core::CV_8UC1)?.to_mat()?;
    imgproc::line(
        &mut line,
        Point::new(start.0, start.1),
        Point::new(end.0, end.1),
        Scalar::all(255.0),
        2,
        imgproc::LINE_AA,
        0,
    )?;
    let line_pixels = core::count_non_zero(&line)?;
    if line_pixels == 0 {
        return Ok(0.0);
    }
    let mut intersection = Mat::default();
    core::bitwise_and(&line, nuisance, &mut intersection, &no_array())?;
    let overlap = core::count_non_zero(&intersection)?;
    Ok(overlap as f64 / line_pixels as f64)
}
