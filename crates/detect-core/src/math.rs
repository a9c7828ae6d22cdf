//! Track geometry scoring: linearity, confidence, stationarity.

use nalgebra::Matrix2;

/// Consecutive points closer than this are considered stationary.
const STATIONARY_PX: f64 = 1.0;

const CONF_LENGTH_NORM: f64 = 100.0;
const CONF_SPEED_NORM: f64 = 20.0;
const CONF_DURATION_BONUS_PER_SEC: f64 = 0.002;
const CONF_DURATION_BONUS_MAX: f64 = 0.2;

/// PCA linearity of a point chain: the major eigenvalue's share of the
/// total variance. 1.0 is a perfect line; fewer than three points are
/// trivially linear.
pub fn linearity(points: &[(f64, f64)]) -> f64 {
    if points.len() < 3 {
        return 1.0;
    }

    let n = points.len() as f64;
    let (mx, my) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
    let (mx, my) = (mx / n, my / n);

    let (mut cxx, mut cxy, mut cyy) = (0.0, 0.0, 0.0);
    for (x, y) in points {
        let dx = x - mx;
        let dy = y - my;
        cxx += dx * dx;
        cxy += dx * dy;
        cyy += dy * dy;
    }
    let denom = n - 1.0;
    let cov = Matrix2::new(cxx / denom, cxy / denom, cxy / denom, cyy / denom);

    let eigen = cov.symmetric_eigenvalues();
    let major = eigen[0].max(eigen[1]);
    let minor = eigen[0].min(eigen[1]);
    if major <= 0.0 {
        return 0.0;
    }
    major / (major + minor.max(0.0) + 1e-10)
}

/// Fraction of consecutive point pairs that barely moved.
pub fn stationary_ratio(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 1.0;
    }
    let steps = points.len() - 1;
    let stationary = points
        .windows(2)
        .filter(|pair| {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            (x1 - x0).hypot(y1 - y0) < STATIONARY_PX
        })
        .count();
    stationary as f64 / steps as f64
}

/// Blend of length, speed, linearity, brightness and a small duration
/// bonus, clamped to [0, 1].
pub fn confidence(
    length: f64,
    speed: f64,
    linearity: f64,
    peak_brightness: f64,
    duration: f64,
) -> f64 {
    let length_score = (length / CONF_LENGTH_NORM).min(1.0);
    let speed_score = (speed / CONF_SPEED_NORM).min(1.0);
    let brightness_score = (peak_brightness / 255.0).min(1.0);
    let duration_bonus = (duration * CONF_DURATION_BONUS_PER_SEC).min(CONF_DURATION_BONUS_MAX);

    (0.25 * length_score
        + 0.20 * speed_score
        + 0.25 * linearity
        + 0.20 * brightness_score
        + duration_bonus)
        .min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn perfect_line_scores_one() {
        let points: Vec<(f64, f64)> = (0..10).map(|i| (i as f64 * 3.0, i as f64 * 2.0)).collect();
        assert_relative_eq!(linearity(&points), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn scattered_points_score_low() {
        let points = [
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (0.0, 10.0),
            (5.0, 5.0),
        ];
        assert!(linearity(&points) < 0.7);
    }

    #[test]
    fn two_points_are_trivially_linear() {
        assert_eq!(linearity(&[(0.0, 0.0), (5.0, 5.0)]), 1.0);
    }

    #[test]
    fn stationary_ratio_counts_sub_pixel_steps() {
        let points = [(0.0, 0.0), (0.5, 0.0), (0.9, 0.0), (10.0, 0.0)];
        assert_relative_eq!(stationary_ratio(&points), 2.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn single_point_is_fully_stationary() {
        assert_eq!(stationary_ratio(&[(3.0, 4.0)]), 1.0);
    }

    #[test]
    fn confidence_saturates_at_one() {
        let c = confidence(1000.0, 1000.0, 1.0, 255.0, 100.0);
        assert_relative_eq!(c, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn confidence_matches_component_sum() {
        // 50 px, 10 px/s, linearity 0.8, brightness 127.5, 1 s.
        let c = confidence(50.0, 10.0, 0.8, 127.5, 1.0);
        let expected = 0.25 * 0.5 + 0.20 * 0.5 + 0.25 * 0.8 + 0.20 * 0.5 + 0.002;
        assert_relative_eq!(c, expected, epsilon = 1e-9);
    }
}
