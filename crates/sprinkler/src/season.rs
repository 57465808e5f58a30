//! Season module: maps (season-name, now) to a scaling percentage and a
//! priority used to arbitrate against online watering indices.

use crate::config::Config;
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Debug, Clone)]
enum Vector {
    Weekly([i32; 52]),
    Monthly([i32; 12]),
    Invalid,
}

#[derive(Debug, Clone)]
struct Season {
    priority: i32,
    vector: Vector,
}

#[derive(Debug, Default)]
pub struct SeasonTable {
    seasons: HashMap<String, Season>,
}

impl SeasonTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&mut self, config: &Config) -> anyhow::Result<()> {
        self.seasons.clear();
        for entry in config.seasons()? {
            let vector = match (entry.weekly, entry.monthly) {
                (Some(w), _) if w.len() == 52 => {
                    let mut arr = [0i32; 52];
                    arr.copy_from_slice(&w);
                    Vector::Weekly(arr)
                }
                (_, Some(m)) if m.len() == 12 => {
                    let mut arr = [0i32; 12];
                    arr.copy_from_slice(&m);
                    Vector::Monthly(arr)
                }
                _ => {
                    warn!(season = %entry.name, "INVALID season entry (bad or missing vector length)");
                    Vector::Invalid
                }
            };
            self.seasons.insert(
                entry.name,
                Season {
                    priority: entry.priority.max(0),
                    vector,
                },
            );
        }
        Ok(())
    }

    /// Lowest priority (0) for an unknown season — it never outranks a
    /// real online index.
    pub fn priority(&self, name: &str) -> i32 {
        self.seasons.get(name).map(|s| s.priority).unwrap_or(0)
    }

    /// 100 (full watering) for an unknown season.
    pub fn index(&self, name: &str, now: OffsetDateTime) -> i32 {
        let Some(season) = self.seasons.get(name) else {
            return 100;
        };
        match &season.vector {
            Vector::Weekly(v) => v[week_of_year(now) as usize],
            Vector::Monthly(v) => v[u8::from(now.month()) as usize - 1],
            Vector::Invalid => 100,
        }
    }
}

/// Approximate week-of-year, matching the original's deliberately loose
/// `(yday - wday + 4) / 7` calculation: exact ISO week boundaries don't
/// matter here, only that the 52-slot vector lines up with the actual
/// time of year.
fn week_of_year(now: OffsetDateTime) -> u32 {
    let yday = now.ordinal() as i64 - 1;
    let wday = now.weekday().number_days_from_sunday() as i64;
    let mut week = (yday - wday + 4) / 7;
    if week < 0 {
        week = 51;
    } else if week >= 52 {
        week -= 52;
    }
    week as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn table_with(json: &str) -> SeasonTable {
        let cfg = Config::parse(json).unwrap();
        let mut table = SeasonTable::new();
        table.refresh(&cfg).unwrap();
        table
    }

    #[test]
    fn unknown_season_is_full_index_and_zero_priority() {
        let table = SeasonTable::new();
        assert_eq!(table.index("nope", OffsetDateTime::now_utc()), 100);
        assert_eq!(table.priority("nope"), 0);
    }

    #[test]
    fn monthly_vector_selects_by_month() {
        let monthly: Vec<i32> = (1..=12).collect();
        let json = serde_json::json!({
            "seasons": [{"name": "s", "priority": 10, "monthly": monthly}]
        })
        .to_string();
        let table = table_with(&json);
        let july = datetime!(2026-07-28 12:00 UTC);
        assert_eq!(table.index("s", july), 7);
        assert_eq!(table.priority("s"), 10);
    }

    #[test]
    fn weekly_vector_selects_by_week() {
        let weekly: Vec<i32> = std::iter::repeat(50).take(52).collect();
        let json = serde_json::json!({
            "seasons": [{"name": "s", "priority": 1, "weekly": weekly}]
        })
        .to_string();
        let table = table_with(&json);
        assert_eq!(table.index("s", OffsetDateTime::now_utc()), 50);
    }

    #[test]
    fn bad_vector_length_marks_invalid_and_defaults_full() {
        let json = serde_json::json!({
            "seasons": [{"name": "s", "priority": 1, "weekly": [1, 2, 3]}]
        })
        .to_string();
        let table = table_with(&json);
        assert_eq!(table.index("s", OffsetDateTime::now_utc()), 100);
    }
}
