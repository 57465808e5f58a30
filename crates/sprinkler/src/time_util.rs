//! Human-readable delta formatting and the simulated-clock wrapper.
//!
//! Every component except the schedule evaluator reads true wall time;
//! the schedule evaluator reads through [`SimClock`] so that `-sim-speed`/
//! `-sim-delta` CLI flags can accelerate or offset its notion of "now"
//! without perturbing anything else (control-plane deadlines, index
//! freshness, etc. all stay anchored to the real clock).

use time::{Duration, OffsetDateTime};

/// Format a delta in seconds as a short human string, e.g. "2h 14m 3s".
/// Used in status JSON (`remaining_s` is numeric) and in log lines where a
/// human needs to eyeball a rain-delay or deadline at a glance.
pub fn format_delta(mut seconds: i64) -> String {
    let negative = seconds < 0;
    if negative {
        seconds = -seconds;
    }
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    seconds %= 3_600;
    let minutes = seconds / 60;
    seconds %= 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 || days > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if minutes > 0 || hours > 0 || days > 0 {
        out.push_str(&format!("{minutes}m "));
    }
    out.push_str(&format!("{seconds}s"));
    if negative {
        format!("-{out}")
    } else {
        out
    }
}

/// Format a period (same rendering as [`format_delta`], kept as a distinct
/// name because the call sites read differently: a delta is "how long
/// until", a period is "how long this lasted").
pub fn format_period(seconds: i64) -> String {
    format_delta(seconds)
}

/// A wall-clock wrapper that can run faster than real time and/or be
/// shifted by a constant offset, per §5's "Simulated time" design.
///
/// `speed` must be a divisor of 60 (1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60)
/// so that once-per-minute logic (the schedule evaluator) still aligns on
/// sane boundaries; values outside that set are clamped to 1 by
/// [`SimClock::new`].
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    speed: i64,
    anchor_real: OffsetDateTime,
    anchor_sim: OffsetDateTime,
}

const VALID_SPEEDS: &[i64] = &[1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60];

impl SimClock {
    pub fn new(speed: i64, offset_seconds: i64) -> Self {
        let speed = if VALID_SPEEDS.contains(&speed) { speed } else { 1 };
        let now = OffsetDateTime::now_utc();
        Self {
            speed,
            anchor_real: now,
            anchor_sim: now + Duration::seconds(offset_seconds),
        }
    }

    pub fn real() -> Self {
        Self::new(1, 0)
    }

    pub fn speed(&self) -> i64 {
        self.speed
    }

    pub fn now(&self) -> OffsetDateTime {
        let real_elapsed = OffsetDateTime::now_utc() - self.anchor_real;
        self.anchor_sim + real_elapsed * self.speed as i32
    }

    pub fn now_unix(&self) -> i64 {
        self.now().unix_timestamp()
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::real()
    }
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_delta_seconds_only() {
        assert_eq!(format_delta(42), "42s");
    }

    #[test]
    fn format_delta_minutes_and_seconds() {
        assert_eq!(format_delta(125), "2m 5s");
    }

    #[test]
    fn format_delta_hours_minutes_seconds() {
        assert_eq!(format_delta(3725), "1h 2m 5s");
    }

    #[test]
    fn format_delta_days() {
        assert_eq!(format_delta(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn format_delta_negative() {
        assert_eq!(format_delta(-5), "-5s");
    }

    #[test]
    fn sim_clock_default_speed_one_tracks_real_time() {
        let clock = SimClock::new(1, 0);
        let a = clock.now_unix();
        let b = now_unix();
        assert!((a - b).abs() <= 1);
    }

    #[test]
    fn sim_clock_rejects_non_divisor_speed() {
        let clock = SimClock::new(7, 0);
        assert_eq!(clock.speed(), 1);
    }

    #[test]
    fn sim_clock_accepts_valid_speed() {
        let clock = SimClock::new(30, 0);
        assert_eq!(clock.speed(), 30);
    }

    #[test]
    fn sim_clock_applies_constant_offset() {
        let clock = SimClock::new(1, 3600);
        let a = clock.now_unix();
        let b = now_unix();
        assert!((a - b - 3600).abs() <= 1);
    }
}
