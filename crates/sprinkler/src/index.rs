//! Index module: discovers watering-index providers, polls each one's
//! `/status` endpoint, and arbitrates down to a single current value.

use crate::config::{Config, IndexProviderConfig};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::{info, warn};

/// A value older than this is still usable but no longer "fresh" for
/// arbitration against clock-skewed or replayed reports.
pub const VALID_WINDOW_SECS: i64 = 24 * 3600;
/// A value older than this is discarded outright regardless of priority.
pub const DISCARD_AGE_SECS: i64 = 3 * 24 * 3600;

const POLL_FLOOR_FIRST: i64 = 60;
const POLL_FLOOR_STEADY: i64 = 3600;

#[derive(Debug, Clone, Copy)]
struct WateringIndex {
    value: i32,
    priority: i32,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct StatusStatus {
    received: i64,
    priority: i32,
    index: i32,
    name: String,
    origin: String,
}

#[derive(Debug, Deserialize)]
struct WaterIndexField {
    status: Option<StatusStatus>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    host: String,
    waterindex: Option<WaterIndexField>,
}

pub struct Index {
    client: Client,
    providers: Vec<IndexProviderConfig>,
    last_poll_at: HashMap<String, i64>,
    current: Option<WateringIndex>,
    origin: String,
}

impl Index {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            providers: Vec::new(),
            last_poll_at: HashMap::new(),
            current: None,
            origin: String::new(),
        }
    }

    pub fn refresh(&mut self, config: &Config) -> anyhow::Result<()> {
        self.providers = config
            .index_providers()?
            .into_iter()
            .filter(|p| p.enable)
            .collect();
        Ok(())
    }

    /// The current value and its origin label, or `None` if there is no
    /// value or it has aged past the discard window.
    pub fn current(&self, now: i64) -> Option<(i32, String)> {
        let idx = self.current?;
        if now - idx.timestamp > DISCARD_AGE_SECS {
            return None;
        }
        Some((idx.value, self.origin.clone()))
    }

    pub fn is_valid(&self, now: i64) -> bool {
        self.current
            .map(|i| now - i.timestamp <= VALID_WINDOW_SECS)
            .unwrap_or(false)
    }

    pub fn priority(&self) -> i32 {
        self.current.map(|i| i.priority).unwrap_or(0)
    }

    /// Discard a stale current value, then poll every provider whose
    /// cadence (hourly-table-gated, 60s until first acquisition, 1h
    /// thereafter) is due.
    pub async fn periodic(&mut self, now: i64) {
        if let Some(idx) = self.current {
            if now - idx.timestamp > DISCARD_AGE_SECS {
                warn!("index: current value discarded, older than 3 days");
                self.current = None;
            }
        }

        let floor = if self.current.is_some() {
            POLL_FLOOR_STEADY
        } else {
            POLL_FLOOR_FIRST
        };
        let hour = hour_of_day(now);

        let due: Vec<IndexProviderConfig> = self
            .providers
            .iter()
            .filter(|p| {
                let last = self.last_poll_at.get(&p.name).copied().unwrap_or(0);
                if now - last < floor {
                    return false;
                }
                p.refresh_hours.is_empty() || p.refresh_hours.contains(&hour)
            })
            .cloned()
            .collect();

        for p in due {
            self.last_poll_at.insert(p.name.clone(), now);
            self.poll_one(&p).await;
        }
    }

    async fn poll_one(&mut self, provider: &IndexProviderConfig) {
        let url = format!("{}/status", provider.url.trim_end_matches('/'));
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(provider = %provider.name, "index: transport error: {e}");
                return;
            }
        };
        if !resp.status().is_success() {
            warn!(provider = %provider.name, status = %resp.status(), "index: non-200 response");
            return;
        }
        let body: StatusBody = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(provider = %provider.name, "index: malformed json: {e}");
                return;
            }
        };
        let host = body.host;
        let Some(status) = body.waterindex.and_then(|w| w.status) else {
            warn!(provider = %provider.name, %host, "index: missing waterindex.status fields");
            return;
        };

        let clamped = status.index.clamp(provider.adjust_min, provider.adjust_max);
        let label = if status.origin.is_empty() {
            status.name.clone()
        } else {
            status.origin.clone()
        };
        tracing::trace!(provider = %provider.name, %host, value = clamped, "index: polled");
        self.apply(
            WateringIndex {
                value: clamped,
                priority: status.priority,
                timestamp: status.received,
            },
            label,
        );
    }

    /// Accept `incoming` only if it outranks the current value: higher
    /// priority wins outright; equal priority wins on a newer timestamp;
    /// either way a report older than the current value by more than the
    /// valid window is rejected as stale/replayed.
    fn apply(&mut self, incoming: WateringIndex, origin: String) {
        if let Some(cur) = self.current {
            if incoming.priority < cur.priority {
                return;
            }
            if incoming.priority == cur.priority && incoming.timestamp <= cur.timestamp {
                return;
            }
            if incoming.timestamp < cur.timestamp - VALID_WINDOW_SECS {
                return;
            }
        }
        info!(provider = %origin, value = incoming.value, priority = incoming.priority, "APPLY");
        self.current = Some(incoming);
        self.origin = origin;
    }

    pub fn status(&self, now: i64) -> serde_json::Value {
        serde_json::json!({
            "value": self.current.map(|i| i.value),
            "priority": self.current.map(|i| i.priority),
            "origin": self.origin,
            "valid": self.is_valid(now),
        })
    }
}

fn hour_of_day(now: i64) -> i32 {
    OffsetDateTime::from_unix_timestamp(now)
        .map(|t| t.hour() as i32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx() -> Index {
        Index::new(Client::new())
    }

    #[test]
    fn first_value_always_applies() {
        let mut i = idx();
        i.apply(WateringIndex { value: 80, priority: 1, timestamp: 1000 }, "a".into());
        assert_eq!(i.current(2000), Some((80, "a".to_string())));
    }

    #[test]
    fn lower_priority_is_rejected() {
        let mut i = idx();
        i.apply(WateringIndex { value: 80, priority: 5, timestamp: 1000 }, "a".into());
        i.apply(WateringIndex { value: 10, priority: 1, timestamp: 2000 }, "b".into());
        assert_eq!(i.current(2000), Some((80, "a".to_string())));
    }

    #[test]
    fn equal_priority_newer_timestamp_wins() {
        let mut i = idx();
        i.apply(WateringIndex { value: 80, priority: 1, timestamp: 1000 }, "a".into());
        i.apply(WateringIndex { value: 30, priority: 1, timestamp: 2000 }, "b".into());
        assert_eq!(i.current(2000), Some((30, "b".to_string())));
    }

    #[test]
    fn equal_priority_older_timestamp_rejected() {
        let mut i = idx();
        i.apply(WateringIndex { value: 80, priority: 1, timestamp: 2000 }, "a".into());
        i.apply(WateringIndex { value: 30, priority: 1, timestamp: 1000 }, "b".into());
        assert_eq!(i.current(2000), Some((80, "a".to_string())));
    }

    #[test]
    fn discarded_after_three_days() {
        let mut i = idx();
        i.apply(WateringIndex { value: 80, priority: 1, timestamp: 0 }, "a".into());
        assert_eq!(i.current(DISCARD_AGE_SECS - 1), Some((80, "a".to_string())));
        assert_eq!(i.current(DISCARD_AGE_SECS + 1), None);
    }

    #[test]
    fn validity_window_is_24_hours() {
        let mut i = idx();
        i.apply(WateringIndex { value: 80, priority: 1, timestamp: 0 }, "a".into());
        assert!(i.is_valid(VALID_WINDOW_SECS));
        assert!(!i.is_valid(VALID_WINDOW_SECS + 1));
    }
}
