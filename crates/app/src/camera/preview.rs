//! Preview frame annotation and JPEG encoding.

use detect_core::Candidate;
use opencv::{
    core::{Mat, Point, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
};

const JPEG_QUALITY: i32 = 70;

const GREEN: (f64, f64, f64) = (0.0, 255.0, 0.0);
const YELLOW: (f64, f64, f64) = (0.0, 255.0, 255.0);
const WHITE: (f64, f64, f64) = (255.0, 255.0, 255.0);

fn bgr(color: (f64, f64, f64)) -> Scalar {
    Scalar::new(color.0, color.1, color.2, 0.0)
}

/// Draw candidates (green circles), open tracks (yellow polylines) and the
/// status header onto a copy of `frame`, returning the encoded JPEG.
pub fn render_preview(
    frame: &Mat,
    candidates: &[Candidate],
    tracks: &[Vec<(i32, i32)>],
    header: &str,
) -> opencv::Result<Vec<u8>> {
    let mut display = frame.try_clone()?;

    for candidate in candidates {
        imgproc::circle(
            &mut display,
            Point::new(candidate.centroid.0, candidate.centroid.1),
            5,
            bgr(GREEN),
            2,
            imgproc::LINE_8,
            0,
        )?;
    }

    for track in tracks {
        for pair in track.windows(2) {
            imgproc::line(
                &mut display,
                Point::new(pair[0].0, pair[0].1),
                Point::new(pair[1].0, pair[1].1),
                bgr(YELLOW),
                2,
                imgproc::LINE_8,
                0,
            )?;
        }
    }

    imgproc::put_text(
        &mut display,
        header,
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        bgr(WHITE),
        2,
        imgproc::LINE_8,
        false,
    )?;

    encode_jpeg(&display)
}

/// Encode any BGR frame as preview-quality JPEG.
pub fn encode_jpeg(frame: &Mat) -> opencv::Result<Vec<u8>> {
    let mut buffer: Vector<u8> = Vector::new();
    let mut flags: Vector<i32> = Vector::new();
    flags.push(imgcodecs::IMWRITE_JPEG_QUALITY);
    flags.push(JPEG_QUALITY);
    imgcodecs::imencode(".jpg", frame, &mut buffer, &flags)?;
    Ok(buffer.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{self, Rect};

    #[test]
    fn preview_encodes_to_jpeg() {
        let frame = Mat::new_rows_cols_with_default(
            120,
            160,
            core::CV_8UC3,
            Scalar::new(20.0, 20.0, 20.0, 0.0),
        )
        .unwrap();
        let candidate = Candidate {
            centroid: (80, 60),
            area: 12.0,
            brightness: 230.0,
            bbox: Rect::new(76, 56, 8, 8),
            frame_ts: 1.0,
        };
        let tracks = vec![vec![(10, 10), (40, 30), (70, 50)]];

        let jpeg = render_preview(&frame, &[candidate], &tracks, "cam | 12s | 3").unwrap();
        // JPEG magic bytes.
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
        assert!(jpeg.len() > 100);
    }
}
