//! Detection time-window gate.
//!
//! Detection only makes sense in darkness, so the gate tracks the interval
//! from the previous sunset to the next sunrise at the observer's
//! location. Frames outside the window still feed the buffer and preview;
//! only detection is suspended.

use std::f64::consts::PI;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

/// Official zenith for sunrise/sunset (degrees), includes refraction.
const ZENITH_DEG: f64 = 90.833;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SunEvent {
    Rise,
    Set,
}

/// UTC moment of sunrise/sunset on `date` at the given position.
/// `None` in polar conditions where the sun never crosses the zenith.
fn sun_event_utc(date: NaiveDate, latitude: f64, longitude: f64, event: SunEvent) -> Option<DateTime<Utc>> {
    let n = date.ordinal() as f64;
    let lng_hour = longitude / 15.0;

    let t = match event {
        SunEvent::Rise => n + (6.0 - lng_hour) / 24.0,
        SunEvent::Set => n + (18.0 - lng_hour) / 24.0,
    };

    // Solar mean anomaly and true longitude.
    let m = 0.9856 * t - 3.289;
    let l = normalize_deg(
        m + 1.916 * deg_sin(m) + 0.020 * deg_sin(2.0 * m) + 282.634,
    );

    // Right ascension, pulled into the same quadrant as L.
    let mut ra = normalize_deg(deg_atan(0.91764 * deg_tan(l)));
    let l_quadrant = (l / 90.0).floor() * 90.0;
    let ra_quadrant = (ra / 90.0).floor() * 90.0;
    ra = (ra + (l_quadrant - ra_quadrant)) / 15.0;

    let sin_dec = 0.39782 * deg_sin(l);
    let cos_dec = deg_cos(deg_asin(sin_dec));

    let cos_h = (deg_cos(ZENITH_DEG) - sin_dec * deg_sin(latitude))
        / (cos_dec * deg_cos(latitude));
    if !(-1.0..=1.0).contains(&cos_h) {
        return None;
    }

    let h = match event {
        SunEvent::Rise => 360.0 - deg_acos(cos_h),
        SunEvent::Set => deg_acos(cos_h),
    } / 15.0;

    // Local mean time of the event, then back to UTC. The UTC moment may
    // fall on the neighbouring day; keeping the sign preserves that.
    let local_mean = (h + ra - 0.06571 * t - 6.622).rem_euclid(24.0);
    let ut_hours = local_mean - lng_hour;

    let seconds = (ut_hours * 3600.0).round() as i64;
    let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    Some(midnight + Duration::seconds(seconds))
}

/// The active detection interval containing or following `now`:
/// the most recent sunset through the next sunrise.
pub fn twilight_window(
    latitude: f64,
    longitude: f64,
    tz: Tz,
    now: DateTime<Tz>,
) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
    let today = now.date_naive();
    let sunrise_today =
        sun_event_utc(today, latitude, longitude, SunEvent::Rise)?.with_timezone(&tz);

    let (start, end) = if now < sunrise_today {
        let yesterday = today.pred_opt()?;
        let sunset =
            sun_event_utc(yesterday, latitude, longitude, SunEvent::Set)?.with_timezone(&tz);
        (sunset, sunrise_today)
    } else {
        let tomorrow = today.succ_opt()?;
        let sunset = sun_event_utc(today, latitude, longitude, SunEvent::Set)?.with_timezone(&tz);
        let sunrise =
            sun_event_utc(tomorrow, latitude, longitude, SunEvent::Rise)?.with_timezone(&tz);
        (sunset, sunrise)
    };
    Some((start, end))
}

/// Gate evaluated once per frame by the detection loop.
pub struct TwilightGate {
    enabled: bool,
    latitude: f64,
    longitude: f64,
    tz: Tz,
    window: Mutex<Option<(DateTime<Tz>, DateTime<Tz>)>>,
}

impl TwilightGate {
    pub fn new(enabled: bool, latitude: f64, longitude: f64, tz: Tz) -> Self {
        Self {
            enabled,
            latitude,
            longitude,
            tz,
            window: Mutex::new(None),
        }
    }

    /// Whether detection should run at `now`. Disabled gates are always
    /// active; an undefined window (polar day/night) fails open.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return true;
        }
        let local = now.with_timezone(&self.tz);
        let mut cache = self.window.lock().expect("twilight cache poisoned");

        let needs_refresh = match *cache {
            Some((_, end)) => local > end,
            None => true,
        };
        if needs_refresh {
            *cache = twilight_window(self.latitude, self.longitude, self.tz, local);
            if let Some((start, end)) = *cache {
                debug!(%start, %end, "twilight window refreshed");
            }
        }

        match *cache {
            Some((start, end)) => start <= local && local <= end,
            None => true,
        }
    }

    /// The current window, for the UI.
    pub fn window_now(&self, now: DateTime<Utc>) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        twilight_window(
            self.latitude,
            self.longitude,
            self.tz,
            now.with_timezone(&self.tz),
        )
    }
}

fn normalize_deg(value: f64) -> f64 {
    value.rem_euclid(360.0)
}

fn deg_sin(deg: f64) -> f64 {
    (deg * PI / 180.0).sin()
}

fn deg_cos(deg: f64) -> f64 {
    (deg * PI / 180.0).cos()
}

fn deg_tan(deg: f64) -> f64 {
    (deg * PI / 180.0).tan()
}

fn deg_asin(value: f64) -> f64 {
    value.asin() * 180.0 / PI
}

fn deg_acos(value: f64) -> f64 {
    value.acos() * 180.0 / PI
}

fn deg_atan(value: f64) -> f64 {
    value.atan() * 180.0 / PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::Asia::Tokyo;

    const FUJI_LAT: f64 = 35.3606;
    const FUJI_LON: f64 = 138.7274;

    #[test]
    fn winter_sunrise_near_seven_local() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let sunrise = sun_event_utc(date, FUJI_LAT, FUJI_LON, SunEvent::Rise)
            .unwrap()
            .with_timezone(&Tokyo);
        assert_eq!(sunrise.date_naive(), date);
        assert!((6..=7).contains(&sunrise.hour()), "sunrise at {sunrise}");
    }

    #[test]
    fn winter_sunset_near_five_local() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let sunset = sun_event_utc(date, FUJI_LAT, FUJI_LON, SunEvent::Set)
            .unwrap()
            .with_timezone(&Tokyo);
        assert!((16..=17).contains(&sunset.hour()), "sunset at {sunset}");
    }

    #[test]
    fn window_spans_local_midnight() {
        let midnight = Tokyo.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        let (start, end) = twilight_window(FUJI_LAT, FUJI_LON, Tokyo, midnight).unwrap();
        assert!(start < midnight && midnight < end);
        assert_eq!(start.date_naive(), NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
        assert_eq!(end.date_naive(), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
    }

    #[test]
    fn gate_is_inactive_at_noon() {
        let gate = TwilightGate::new(true, FUJI_LAT, FUJI_LON, Tokyo);
        let noon = Tokyo
            .with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(!gate.is_active(noon));
    }

    #[test]
    fn gate_is_active_at_night_and_when_disabled() {
        let gate = TwilightGate::new(true, FUJI_LAT, FUJI_LON, Tokyo);
        let night = Tokyo
            .with_ymd_and_hms(2026, 1, 1, 23, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(gate.is_active(night));

        let disabled = TwilightGate::new(false, FUJI_LAT, FUJI_LON, Tokyo);
        let noon = Tokyo
            .with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(disabled.is_active(noon));
    }

    #[test]
    fn polar_night_fails_open() {
        // Longyearbyen in January: the sun never rises.
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert!(sun_event_utc(date, 78.22, 15.65, SunEvent::Rise).is_none());
    }
}
