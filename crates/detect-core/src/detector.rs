//! Per-frame candidate extraction by frame differencing.

use std::sync::Mutex;

use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size, Vector, no_array},
    imgproc,
    prelude::*,
};
use tracing::debug;

use crate::mask::{MaskSet, contour_overlap_ratio};
use crate::params::DetectionParams;

/// Threshold relaxation while extending an existing track: continuing a
/// trajectory must be easier than starting one.
const TRACKING_THRESHOLD_SCALE: f64 = 0.7;

/// A bright moving region surviving the per-frame gates.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// Centroid in full-resolution pixel coordinates.
    pub centroid: (i32, i32),
    /// Contour area in (processing-scale) px².
    pub area: f64,
    /// Mean brightness of the contour on the current frame, 0-255.
    pub brightness: f64,
    /// Bounding box in full-resolution pixel coordinates.
    pub bbox: Rect,
    pub frame_ts: f64,
}

/// Stateless-per-frame extractor holding the hot-swappable mask pair.
pub struct FrameDetector {
    masks: Mutex<MaskSet>,
}

impl FrameDetector {
    pub fn new(masks: MaskSet) -> Self {
        Self {
            masks: Mutex::new(masks),
        }
    }

    /// Replace the exclusion mask without interrupting detection.
    pub fn set_exclusion_mask(&self, mask: Option<Mat>) {
        self.masks.lock().expect("mask set poisoned").exclusion = mask;
    }

    /// Replace the nuisance mask without interrupting detection.
    pub fn set_nuisance_mask(&self, mask: Option<Mat>) {
        self.masks.lock().expect("mask set poisoned").nuisance = mask;
    }

    /// Extract candidates from a pair of consecutive grayscale frames.
    ///
    /// `inv_scale` converts processing-resolution coordinates back to full
    /// resolution (1.0 when no downscaling is applied). `tracking_mode`
    /// relaxes the threshold and brightness gates while any track is open.
    pub fn detect(
        &self,
        curr: &Mat,
        prev: &Mat,
        params: &DetectionParams,
        tracking_mode: bool,
        inv_scale: f64,
        frame_ts: f64,
    ) -> opencv::Result<Vec<Candidate>> {
        let size = curr.size()?;
        let (width, height) = (size.width, size.height);
        let max_y = (height as f64 * (1.0 - params.exclude_bottom_ratio)) as i32;

        let mut diff = Mat::default();
        core::absdiff(curr, prev, &mut diff)?;

        let threshold = if tracking_mode {
            params.diff_threshold as f64 * TRACKING_THRESHOLD_SCALE
        } else {
            params.diff_threshold as f64
        };
        let mut thresh = Mat::default();
        imgproc::threshold(&diff, &mut thresh, threshold, 255.0, imgproc::THRESH_BINARY)?;

        // Bottom strip (camera timestamps, ground clutter).
        if max_y < height {
            fill_zero(&mut thresh, Rect::new(0, max_y, width, height - max_y))?;
        }
        // Fixed noise along the borders.
        let edge = ((width.min(height) as f64) * params.exclude_edge_ratio).max(0.0) as i32;
        if edge > 0 {
            fill_zero(&mut thresh, Rect::new(0, 0, width, edge))?;
            fill_zero(&mut thresh, Rect::new(0, height - edge, width, edge))?;
            fill_zero(&mut thresh, Rect::new(0, 0, edge, height))?;
            fill_zero(&mut thresh, Rect::new(width - edge, 0, edge, height))?;
        }

        // Held for the rest of the step; swaps only happen from the
        // settings/mask endpoints and are rare.
        let masks = self.masks.lock().expect("mask set poisoned");
        if let Some(mask) = &masks.exclusion {
            thresh.set_to(&Scalar::all(0.0), mask)?;
        }

        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            Size::new(3, 3),
            Point::new(-1, -1),
        )?;
        let mut opened = Mat::default();
        imgproc::morphology_ex(
            &thresh,
            &mut opened,
            imgproc::MORPH_OPEN,
            &kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        let mut cleaned = Mat::default();
        imgproc::morphology_ex(
            &opened,
            &mut cleaned,
            imgproc::MORPH_CLOSE,
            &kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours(
            &cleaned,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        let min_brightness = if tracking_mode {
            params.min_brightness_tracking
        } else {
            params.min_brightness
        };

        let mut candidates = Vec::new();
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if !(params.min_area..=params.max_area).contains(&area) {
                continue;
            }

            let moments = imgproc::moments(&contour, false)?;
            if moments.m00 == 0.0 {
                continue;
            }
            let cx = (moments.m10 / moments.m00) as i32;
            let cy = (moments.m01 / moments.m00) as i32;
            if cy >= max_y {
                continue;
            }
            if edge > 0
                && (cx < edge || cy < edge || cx >= width - edge || cy >= height - edge)
            {
                continue;
            }

            let mut contour_mask = Mat::zeros(height, width, core::CV_8UC1)?.to_mat()?;
            let wrapped: Vector<Vector<Point>> = Vector::from_iter([contour.clone()]);
            imgproc::draw_contours(
                &mut contour_mask,
                &wrapped,
                -1,
                Scalar::all(255.0),
                imgproc::FILLED,
                imgproc::LINE_8,
                &no_array(),
                i32::MAX,
                Point::new(0, 0),
            )?;
            let brightness = core::mean(curr, &contour_mask)?[0];

            if let Some(nuisance) = &masks.nuisance {
                if area <= params.small_area_threshold {
                    let ratio = contour_overlap_ratio(&contour_mask, nuisance)?;
                    if ratio >= params.nuisance_overlap_threshold {
                        debug!(area, ratio, "candidate dropped: nuisance overlap");
                        metrics::counter!("detect_candidates_nuisance_dropped_total")
                            .increment(1);
                        continue;
                    }
                }
            }

            if brightness < min_brightness {
                continue;
            }

            let bbox = imgproc::bounding_rect(&contour)?;
            candidates.push(Candidate {
                centroid: (
                    (cx as f64 * inv_scale) as i32,
                    (cy as f64 * inv_scale) as i32,
                ),
                area,
                brightness,
                bbox: Rect::new(
                    (bbox.x as f64 * inv_scale) as i32,
                    (bbox.y as f64 * inv_scale) as i32,
                    (bbox.width as f64 * inv_scale) as i32,
                    (bbox.height as f64 * inv_scale) as i32,
                ),
                frame_ts,
            });
        }

        Ok(candidates)
    }
}

fn fill_zero(mat: &mut Mat, rect: Rect) -> opencv::Result<()> {
    imgproc::rectangle(
        mat,
        rect,
        Scalar::all(0.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )
}
