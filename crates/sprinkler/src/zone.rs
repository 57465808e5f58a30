//! Zone module: the activation queue. Every requested watering run — a
//! manual single-zone test, a program's expanded zone list — lands here as
//! a queue entry; at most one entry per zone, runtime accumulates rather
//! than replacing. Each scheduling pass dispatches at most one pulse
//! system-wide, cycling pulse/pause for zones that need it and breaking
//! ties between equally-ready zones by whichever has watered least so far
//! this cycle.

use crate::config::Config;
use crate::control::{Control, PointType};
use crate::feed::Feed;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct ZoneDef {
    feed: Option<String>,
    hydrate: i64,
    pulse: i64,
    pause: i64,
    manual: bool,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    zone: String,
    runtime: i64,
    hydrate: i64,
    nexton: i64,
    context: String,
}

#[derive(Debug, Default)]
pub struct ZoneQueue {
    zones: HashMap<String, ZoneDef>,
    order: Vec<String>,
    queue: Vec<QueueEntry>,
    busy_until: i64,
    active: Option<String>,
}

impl ZoneQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&mut self, config: &Config, control: &mut Control) -> anyhow::Result<()> {
        self.zones.clear();
        self.order.clear();
        for z in config.zones()? {
            control.declare(&z.name, PointType::Zone);
            self.order.push(z.name.clone());
            self.zones.insert(
                z.name.clone(),
                ZoneDef {
                    feed: z.feed,
                    hydrate: z.hydrate.max(0),
                    pulse: z.pulse.max(0),
                    pause: z.pause.max(0),
                    manual: z.manual,
                },
            );
        }
        self.queue.clear();
        self.active = None;
        self.busy_until = 0;
        Ok(())
    }

    /// Queue `runtime` seconds of watering for `name`. A zone flagged
    /// `manual` rejects any non-empty (scheduled/program) context — it can
    /// only be run by direct operator action. A re-activation of an
    /// already-queued zone adds to its remaining runtime rather than
    /// replacing it; if the entry had gone fully idle (`nexton` cleared to
    /// zero while it waits out its pause), the new activation makes it
    /// eligible again immediately.
    pub fn activate(&mut self, name: &str, runtime: i64, context: &str, now: i64) -> bool {
        if runtime <= 0 {
            return false;
        }
        let Some(def) = self.zones.get(name) else {
            return false;
        };
        if def.manual && !context.is_empty() {
            return false;
        }
        if let Some(entry) = self.queue.iter_mut().find(|e| e.zone == name) {
            entry.runtime += runtime;
            if entry.nexton == 0 {
                entry.nexton = now;
            }
        } else {
            self.queue.push(QueueEntry {
                zone: name.to_string(),
                runtime,
                hydrate: def.hydrate,
                nexton: now,
                context: context.to_string(),
            });
        }
        true
    }

    /// Clear every queued zone and the busy marker immediately.
    pub fn stop(&mut self) {
        self.queue.clear();
        self.busy_until = 0;
    }

    /// True once nothing is running and nothing queued still has runtime
    /// left to dispatch (entries soaking out a pause don't count).
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.iter().all(|e| e.runtime <= 0)
    }

    fn elapsed(&self, e: &QueueEntry) -> i64 {
        let Some(def) = self.zones.get(&e.zone) else {
            return e.runtime;
        };
        if def.pulse <= 0 {
            return e.runtime;
        }
        let soaks = e.runtime / def.pulse - if e.runtime % def.pulse == 0 { 1 } else { 0 };
        e.runtime + def.pause * soaks.max(0)
    }

    pub async fn periodic(&mut self, now: i64, control: &mut Control, feed: &Feed) {
        self.queue
            .retain(|e| !(e.runtime <= 0 && e.nexton > 0 && e.nexton < now));

        if self.busy_until > 0 && now <= self.busy_until {
            return;
        }

        if let Some(name) = self.active.take() {
            if self.busy_until == 0 {
                // busy marker was cleared out from under us by an external
                // stop; the remote side hasn't necessarily heard about it.
                control.cancel(&name).await;
            }
        }
        self.busy_until = 0;

        let minute_window = now % 60 <= 1;
        let mut best: Option<usize> = None;
        for (i, e) in self.queue.iter().enumerate() {
            if e.runtime <= 0 {
                continue;
            }
            if !e.context.is_empty() && !minute_window {
                continue;
            }
            best = Some(match best {
                None => i,
                Some(bi) => {
                    let b = &self.queue[bi];
                    if e.nexton < b.nexton {
                        i
                    } else if e.nexton == b.nexton && self.elapsed(e) > self.elapsed(b) {
                        i
                    } else {
                        bi
                    }
                }
            });
        }

        let Some(idx) = best else { return };
        if self.queue[idx].nexton > now {
            return;
        }

        let name = self.queue[idx].zone.clone();
        let Some(def) = self.zones.get(&name).cloned() else {
            return;
        };
        let context = self.queue[idx].context.clone();

        let pulse = if context.is_empty() {
            let p = self.queue[idx].runtime;
            self.queue[idx].runtime = 0;
            self.queue[idx].hydrate = 0;
            self.queue[idx].nexton = now + p;
            p
        } else {
            let mut p = if self.queue[idx].hydrate > 0 {
                self.queue[idx].hydrate
            } else {
                def.pulse
            };
            self.queue[idx].hydrate = 0;
            if p <= 0 || p >= self.queue[idx].runtime {
                p = self.queue[idx].runtime;
                self.queue[idx].runtime = 0;
            } else {
                self.queue[idx].runtime -= p;
            }
            self.queue[idx].nexton = now + p + def.pause;
            p
        };

        if pulse <= 0 {
            return;
        }

        if let Some(feed_name) = &def.feed {
            feed.activate(feed_name, pulse, &context, control).await;
        }

        if control.start(&name, pulse, &context).await {
            control.set_deadline(&name, now + pulse);
            self.busy_until = now + pulse + 1;
            self.active = Some(name);
        }
    }

    pub fn status(&self, control: &Control) -> serde_json::Value {
        let zones: Vec<_> = self
            .order
            .iter()
            .map(|n| serde_json::json!([n, control.status_char(n)]))
            .collect();
        let queue: Vec<_> = self
            .queue
            .iter()
            .map(|e| serde_json::json!([e.zone, e.runtime]))
            .collect();
        serde_json::json!({"zones": zones, "queue": queue, "active": self.active})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use reqwest::Client;

    fn queue_with(json: &str) -> (ZoneQueue, Control, Feed) {
        let cfg = Config::parse(json).unwrap();
        let mut control = Control::new(Client::new());
        let mut zones = ZoneQueue::new();
        zones.refresh(&cfg, &mut control).unwrap();
        let feed = Feed::new();
        (zones, control, feed)
    }

    #[test]
    fn activate_unknown_zone_fails() {
        let (mut zones, _, _) = queue_with(&serde_json::json!({"zones": []}).to_string());
        assert!(!zones.activate("ghost", 60, "PROGRAM lawn", 0));
    }

    #[test]
    fn manual_zone_rejects_scheduled_context() {
        let (mut zones, _, _) = queue_with(
            &serde_json::json!({"zones": [{"name": "valve", "manual": true}]}).to_string(),
        );
        assert!(!zones.activate("valve", 60, "PROGRAM lawn", 0));
        assert!(zones.activate("valve", 60, "", 0));
    }

    #[test]
    fn reactivation_accumulates_runtime() {
        let (mut zones, _, _) =
            queue_with(&serde_json::json!({"zones": [{"name": "lawn"}]}).to_string());
        zones.activate("lawn", 60, "PROGRAM p", 100);
        zones.activate("lawn", 30, "PROGRAM p", 100);
        assert_eq!(zones.queue[0].runtime, 90);
        assert_eq!(zones.queue.len(), 1);
    }

    #[test]
    fn idle_when_queue_empty() {
        let (zones, _, _) = queue_with(&serde_json::json!({"zones": []}).to_string());
        assert!(zones.is_idle());
    }

    #[test]
    fn not_idle_while_runtime_remains() {
        let (mut zones, _, _) =
            queue_with(&serde_json::json!({"zones": [{"name": "lawn"}]}).to_string());
        zones.activate("lawn", 60, "PROGRAM p", 0);
        assert!(!zones.is_idle());
    }

    #[tokio::test]
    async fn periodic_dispatches_ready_entry_without_a_url() {
        let (mut zones, mut control, feed) =
            queue_with(&serde_json::json!({"zones": [{"name": "lawn"}]}).to_string());
        zones.activate("lawn", 60, "", 0);
        // no control URL is wired, so start() fails and nothing goes busy.
        zones.periodic(0, &mut control, &feed).await;
        assert!(zones.active.is_none());
    }

    /// A throwaway HTTP server that accepts anything and answers 200, so
    /// `control.start`/`stop` have a real point to round-trip through
    /// instead of failing fast on an unbound URL.
    async fn spawn_mock_control_server() -> String {
        use axum::http::StatusCode;
        async fn ok() -> StatusCode {
            StatusCode::OK
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().fallback(ok);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    /// End-to-end scenario 2: a single cycling zone with `pulse=300,
    /// pause=600` watering for 900s dispatches exactly three 300s pulses,
    /// 900s apart (one pulse, one full pause, repeat) — driven entirely
    /// through `nexton`/`runtime` bookkeeping, not a real 2100s sleep.
    #[tokio::test]
    async fn pulse_pause_cycle_dispatches_three_pulses_900s_apart() {
        let url = spawn_mock_control_server().await;
        let (mut zones, mut control, feed) = queue_with(
            &serde_json::json!({"zones": [{"name": "slope", "pulse": 300, "pause": 600}]})
                .to_string(),
        );
        control.bind_for_test("slope", &url);
        zones.activate("slope", 900, "PROGRAM p", 0);

        let mut dispatch_starts = Vec::new();
        let mut was_active = false;
        for now in 0..2200i64 {
            zones.periodic(now, &mut control, &feed).await;
            let is_active = zones.active.is_some();
            if is_active && !was_active {
                dispatch_starts.push(now);
            }
            was_active = is_active;
        }
        assert_eq!(dispatch_starts, vec![0, 900, 1800]);
        assert!(zones.is_idle());
    }

    #[test]
    fn stop_clears_queue_and_busy_marker() {
        let (mut zones, _, _) =
            queue_with(&serde_json::json!({"zones": [{"name": "lawn"}]}).to_string());
        zones.activate("lawn", 60, "", 0);
        zones.busy_until = 500;
        zones.stop();
        assert!(zones.queue.is_empty());
        assert_eq!(zones.busy_until, 0);
    }
}
