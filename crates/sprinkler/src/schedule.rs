//! Schedule module: evaluates recurring and one-time launch windows once
//! per minute, and owns the sprinkler on/off switch and rain-delay state
//! that gate them.

use crate::config::Config;
use crate::index::Index;
use crate::program::Program;
use crate::season::SeasonTable;
use crate::zone::ZoneQueue;
use time::{OffsetDateTime, Time};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ScheduleEntry {
    id: Uuid,
    program: String,
    disabled: bool,
    begin: i64,
    until: i64,
    start_hour: u8,
    start_minute: u8,
    days: [bool; 7],
    interval: i64,
    lastlaunch: i64,
}

impl ScheduleEntry {
    fn from_config(cfg: crate::config::ScheduleConfig) -> Self {
        let id = cfg
            .id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let (start_hour, start_minute) = cfg.start.as_deref().and_then(parse_hm).unwrap_or((0, 0));
        let mut days = [true; 7];
        if cfg.days.len() == 7 {
            days.copy_from_slice(&cfg.days);
        }
        let begin = cfg.begin.as_deref().and_then(parse_date).unwrap_or(0);
        let until = cfg.until.as_deref().and_then(parse_date).unwrap_or(0);
        Self {
            id,
            program: cfg.program,
            disabled: cfg.disabled,
            begin,
            until,
            start_hour,
            start_minute,
            days,
            interval: cfg.interval.max(0),
            lastlaunch: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct OneTimeEntry {
    program: String,
    start: i64,
}

pub struct Schedule {
    entries: Vec<ScheduleEntry>,
    onetime: Vec<OneTimeEntry>,
    sprinkler_on: bool,
    rain_until: i64,
    rain_enabled: bool,
    last_minute_evaluated: i64,
    dirty: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            onetime: Vec::new(),
            sprinkler_on: true,
            rain_until: 0,
            rain_enabled: true,
            last_minute_evaluated: -1,
            dirty: false,
        }
    }
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-id `lastlaunch` survives a reload; a schedule whose id changed
    /// (or which was newly added/removed) starts fresh.
    pub fn refresh(&mut self, config: &Config) -> anyhow::Result<()> {
        let previous: std::collections::HashMap<Uuid, i64> =
            self.entries.iter().map(|e| (e.id, e.lastlaunch)).collect();
        let mut entries = Vec::new();
        for cfg in config.schedules()? {
            let mut e = ScheduleEntry::from_config(cfg);
            if let Some(&last) = previous.get(&e.id) {
                e.lastlaunch = last;
            }
            entries.push(e);
        }
        self.entries = entries;
        Ok(())
    }

    pub fn switch(&mut self) -> bool {
        self.sprinkler_on = !self.sprinkler_on;
        self.dirty = true;
        self.sprinkler_on
    }

    pub fn is_on(&self) -> bool {
        self.sprinkler_on
    }

    /// `delta > 0` starts a new rain delay, or extends one already in
    /// effect; `delta == 0` cancels the current delay outright.
    pub fn set_rain(&mut self, delta: i64, now: i64) {
        if delta <= 0 {
            if self.rain_until != 0 {
                info!("rain delay cancelled");
            }
            self.rain_until = 0;
        } else if self.rain_until > now {
            self.rain_until += delta;
            info!(until = self.rain_until, "rain delay extended");
        } else {
            self.rain_until = now + delta;
            info!(until = self.rain_until, "rain delay started");
        }
        self.dirty = true;
    }

    /// Disabling zeroes the current delay; re-enabling leaves it at zero
    /// until the next `set_rain` call sets a fresh one.
    pub fn enable_rain(&mut self, enabled: bool) {
        self.rain_enabled = enabled;
        if !enabled {
            self.rain_until = 0;
        }
        self.dirty = true;
    }

    pub fn rain_remaining(&self, now: i64) -> i64 {
        if self.rain_until > now {
            self.rain_until - now
        } else {
            0
        }
    }

    /// Queue a one-shot launch. Rejected if `start` is already past, or
    /// more than three days out.
    pub fn once(&mut self, program: &str, start: i64, now: i64) -> bool {
        if start < now || start > now + 3 * 86_400 {
            return false;
        }
        self.onetime.push(OneTimeEntry { program: program.to_string(), start });
        self.dirty = true;
        true
    }

    /// Re-queue a recurring schedule's program for its next daily
    /// occurrence (today if its start time is still at least 70s away,
    /// tomorrow otherwise).
    pub fn again(&mut self, id: Uuid, now: i64) -> bool {
        let Some(entry) = self.entries.iter().find(|e| e.id == id) else {
            return false;
        };
        let today_start =
            day_start(now) + entry.start_hour as i64 * 3600 + entry.start_minute as i64 * 60;
        let start = if today_start - now >= 70 { today_start } else { today_start + 86_400 };
        let program = entry.program.clone();
        self.onetime.push(OneTimeEntry { program, start });
        self.dirty = true;
        true
    }

    pub fn cancel(&mut self, program: &str) -> bool {
        if let Some(pos) = self.onetime.iter().position(|e| e.program == program) {
            self.onetime.remove(pos);
            self.dirty = true;
            true
        } else {
            false
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn periodic(
        &mut self,
        now: i64,
        program: &mut Program,
        seasons: &SeasonTable,
        index: &Index,
        zones: &mut ZoneQueue,
        use_index: bool,
    ) {
        let minute = now - now.rem_euclid(60);
        if minute == self.last_minute_evaluated {
            return;
        }
        self.last_minute_evaluated = minute;

        if self.rain_until > 0 && self.rain_until <= now {
            info!("rain delay expired");
            self.rain_until = 0;
            // natural expiry doesn't dirty state: the value already on
            // disk is this same expired deadline.
        }

        if !self.sprinkler_on || self.rain_until > now {
            return;
        }

        let mut remaining = Vec::new();
        for ot in self.onetime.drain(..) {
            if ot.start <= now {
                let launched =
                    program.start_scheduled(&ot.program, false, seasons, index, zones, use_index, now);
                if launched == 0 {
                    remaining.push(ot);
                }
            } else {
                remaining.push(ot);
            }
        }
        self.onetime = remaining;

        let Some(now_dt) = OffsetDateTime::from_unix_timestamp(now).ok() else { return };
        let weekday = now_dt.weekday().number_days_from_sunday() as usize;
        let hour = now_dt.hour();
        let minute_of_hour = now_dt.minute();

        for entry in &mut self.entries {
            if entry.disabled {
                continue;
            }
            if program.running(&entry.program) {
                continue;
            }
            if entry.start_hour != hour || entry.start_minute != minute_of_hour {
                continue;
            }
            if entry.begin > 0 && now < entry.begin {
                continue;
            }
            if entry.until > 0 && now > entry.until {
                continue;
            }
            if !entry.days[weekday] {
                continue;
            }

            let effective_interval = entry.interval;
            if effective_interval > 1 {
                let reference = entry.lastlaunch.max(program.lastscheduled(&entry.program));
                let elapsed_days = (now - reference + 21_600) / 86_400;
                if elapsed_days < effective_interval {
                    continue;
                }
            }

            let launched =
                program.start_scheduled(&entry.program, false, seasons, index, zones, use_index, now);
            if launched != 0 {
                entry.lastlaunch = launched;
                self.dirty = true;
            }
        }
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn to_fragment(&self, host: &str) -> serde_json::Value {
        serde_json::json!({
            "host": host,
            "on": self.sprinkler_on,
            "rain_until": self.rain_until,
            "rain_enabled": self.rain_enabled,
            "schedules": self.entries.iter().map(|e| serde_json::json!({
                "id": e.id.to_string(),
                "launched": e.lastlaunch,
            })).collect::<Vec<_>>(),
            "onetime": self.onetime.iter().map(|e| serde_json::json!({
                "program": e.program,
                "start": e.start,
            })).collect::<Vec<_>>(),
        })
    }

    /// `startup` governs whether a depot copy last written by a different
    /// host forces `sprinkler_on` off (so two instances sharing one depot
    /// don't both come up active); subsequent depot updates during normal
    /// operation always win outright regardless of origin host.
    pub fn restore_fragment(&mut self, doc: &serde_json::Value, local_host: &str, startup: bool) {
        let remote_host = doc.get("host").and_then(|v| v.as_str()).unwrap_or_default();
        if let Some(on) = doc.get("on").and_then(|v| v.as_bool()) {
            self.sprinkler_on = on;
        }
        if startup && !remote_host.is_empty() && remote_host != local_host {
            self.sprinkler_on = false;
        }
        if let Some(ru) = doc.get("rain_until").and_then(|v| v.as_i64()) {
            self.rain_until = ru;
        }
        if let Some(re) = doc.get("rain_enabled").and_then(|v| v.as_bool()) {
            self.rain_enabled = re;
        }
        if let Some(arr) = doc.get("schedules").and_then(|v| v.as_array()) {
            for item in arr {
                let id = item.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok());
                let launched = item.get("launched").and_then(|v| v.as_i64());
                if let (Some(id), Some(launched)) = (id, launched) {
                    if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
                        e.lastlaunch = launched;
                    }
                }
            }
        }
        if let Some(arr) = doc.get("onetime").and_then(|v| v.as_array()) {
            self.onetime = arr
                .iter()
                .filter_map(|item| {
                    let program = item.get("program")?.as_str()?.to_string();
                    let start = item.get("start")?.as_i64()?;
                    Some(OneTimeEntry { program, start })
                })
                .collect();
        }
    }

    pub fn status(&self, now: i64) -> serde_json::Value {
        serde_json::json!({
            "on": self.sprinkler_on,
            "rain_remaining_s": self.rain_remaining(now),
            "rain_enabled": self.rain_enabled,
            "entries": self.entries.iter().map(|e| serde_json::json!({
                "id": e.id.to_string(),
                "program": e.program,
                "disabled": e.disabled,
                "hour": e.start_hour,
                "minute": e.start_minute,
                "lastlaunch": e.lastlaunch,
            })).collect::<Vec<_>>(),
            "onetime": self.onetime.iter().map(|e| serde_json::json!({
                "program": e.program,
                "start": e.start,
            })).collect::<Vec<_>>(),
        })
    }
}

fn parse_hm(s: &str) -> Option<(u8, u8)> {
    let mut it = s.splitn(2, ':');
    let h: u8 = it.next()?.trim().parse().ok()?;
    let m: u8 = it.next()?.trim().parse().ok()?;
    Some((h, m))
}

fn parse_date(s: &str) -> Option<i64> {
    use time::macros::format_description;
    let fmt = format_description!("[year]-[month]-[day]");
    let date = time::Date::parse(s, &fmt).ok()?;
    Some(date.with_hms(0, 0, 0).ok()?.assume_utc().unix_timestamp())
}

fn day_start(now: i64) -> i64 {
    OffsetDateTime::from_unix_timestamp(now)
        .map(|dt| dt.replace_time(Time::MIDNIGHT).unix_timestamp())
        .unwrap_or(now - now.rem_euclid(86_400))
}
