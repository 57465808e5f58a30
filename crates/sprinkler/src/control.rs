//! Control-plane client: dispatches on/off/pulse commands to discovered
//! control servers and tracks each point's last-known status and deadline.

use crate::discovery::ServiceDiscovery;
use reqwest::Client;
use std::collections::HashMap;
use tracing::{info, warn};

const DISCOVERY_FLOOR_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointType {
    Zone,
    Feed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointStatus {
    Unknown,
    Idle,
    Active,
    Error,
}

struct ControlPoint {
    kind: PointType,
    url: String,
    status: PointStatus,
    deadline: i64,
    event: bool,
    once: bool,
}

pub struct Control {
    client: Client,
    points: HashMap<String, ControlPoint>,
    providers: Vec<String>,
    last_discovery_at: i64,
}

impl Control {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            points: HashMap::new(),
            providers: Vec::new(),
            last_discovery_at: 0,
        }
    }

    /// Drop every declared point and provider, in preparation for a
    /// configuration reload.
    pub fn reset(&mut self) {
        self.points.clear();
        self.providers.clear();
        self.last_discovery_at = 0;
    }

    /// Idempotent: declaring an already-known point is a no-op. Zones emit
    /// an event on every start by default; feeds stay silent unless a
    /// caller opts a single activation in via [`Control::enable_event_once`].
    pub fn declare(&mut self, name: &str, kind: PointType) {
        self.points.entry(name.to_string()).or_insert(ControlPoint {
            kind,
            url: String::new(),
            status: PointStatus::Unknown,
            deadline: 0,
            event: kind == PointType::Zone,
            once: false,
        });
    }

    pub fn enable_event_once(&mut self, name: &str) {
        if let Some(p) = self.points.get_mut(name) {
            p.event = true;
            p.once = true;
        }
    }

    pub fn status_char(&self, name: &str) -> &'static str {
        match self.points.get(name).map(|p| p.status) {
            Some(PointStatus::Idle) => "i",
            Some(PointStatus::Active) => "a",
            Some(PointStatus::Error) => "e",
            _ => "u",
        }
    }

    /// Issue the on/pulse command for `name`. Returns whether the command
    /// was accepted (2xx response); the caller owns what "accepted" means
    /// for its own bookkeeping (deadlines, queue state, etc).
    pub async fn start(&mut self, name: &str, pulse: i64, context: &str) -> bool {
        let Some(url) = self.points.get(name).map(|p| p.url.clone()) else {
            return false;
        };
        if url.is_empty() {
            return false;
        }
        let cause = if context.is_empty() { "MANUAL" } else { context };
        let escaped_cause = urlencoding::encode(cause);
        let full = format!(
            "{url}/set?point={name}&state=on&pulse={pulse}&cause=SPRINKLER%20{escaped_cause}"
        );

        let accepted = match self.client.get(&full).send().await {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                self.note_error(name, &format!("non-200 response: {}", r.status()));
                false
            }
            Err(e) => {
                self.note_error(name, &format!("transport error: {e}"));
                false
            }
        };

        if let Some(p) = self.points.get_mut(name) {
            if accepted {
                p.status = PointStatus::Active;
                if p.event {
                    info!(point = %name, pulse, cause = %cause, "ON");
                    if p.once {
                        p.event = false;
                        p.once = false;
                    }
                }
            }
        }
        accepted
    }

    async fn stop(&mut self, name: &str) {
        let Some(url) = self.points.get(name).map(|p| p.url.clone()) else {
            return;
        };
        if url.is_empty() {
            return;
        }
        let full = format!("{url}/set?point={name}&state=off");
        match self.client.get(&full).send().await {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => self.note_error(name, &format!("non-200 response on stop: {}", r.status())),
            Err(e) => self.note_error(name, &format!("transport error on stop: {e}")),
        }
        if let Some(p) = self.points.get_mut(name) {
            p.status = PointStatus::Idle;
            p.deadline = 0;
        }
    }

    fn note_error(&mut self, name: &str, msg: &str) {
        let already_error = self
            .points
            .get(name)
            .map(|p| p.status == PointStatus::Error)
            .unwrap_or(false);
        if !already_error {
            warn!(point = %name, "control: {msg}");
        }
        if let Some(p) = self.points.get_mut(name) {
            p.status = PointStatus::Error;
        }
    }

    /// Stop one active point, or every active point when `target == "*"`.
    /// Cancelling `"*"` additionally zeroes every deadline and clears every
    /// active flag, even for points that weren't active.
    pub async fn cancel(&mut self, target: &str) {
        if target == "*" {
            let active: Vec<String> = self
                .points
                .iter()
                .filter(|(_, p)| p.status == PointStatus::Active)
                .map(|(n, _)| n.clone())
                .collect();
            for name in active {
                self.stop(&name).await;
            }
            for p in self.points.values_mut() {
                p.deadline = 0;
                if p.status == PointStatus::Active {
                    p.status = PointStatus::Idle;
                }
            }
            return;
        }

        let is_active = self
            .points
            .get(target)
            .map(|p| p.status == PointStatus::Active)
            .unwrap_or(false);
        if is_active {
            self.stop(target).await;
        }
    }

    /// Mark a pulse-deadline for later natural expiry. Called by the
    /// activating module right after a successful `start`.
    pub fn set_deadline(&mut self, name: &str, deadline: i64) {
        if let Some(p) = self.points.get_mut(name) {
            p.deadline = deadline;
        }
    }

    /// Binds a declared point straight to `url`, bypassing discovery.
    /// Test-only seam used by other modules' integration tests that need a
    /// reachable control point without standing up a discovery mock too.
    #[cfg(test)]
    pub(crate) fn bind_for_test(&mut self, name: &str, url: &str) {
        if let Some(p) = self.points.get_mut(name) {
            p.url = url.to_string();
        }
    }

    /// Transition every point whose pulse has naturally elapsed from
    /// active to idle, without issuing a stop command (the remote side is
    /// expected to have turned itself off at the same deadline).
    pub async fn periodic(&mut self, now: i64, discovery: &dyn ServiceDiscovery) {
        for p in self.points.values_mut() {
            if p.status == PointStatus::Active && p.deadline > 0 && now >= p.deadline {
                p.status = PointStatus::Idle;
                p.deadline = 0;
            }
        }
        self.discover(now, discovery).await;
    }

    async fn discover(&mut self, now: i64, discovery: &dyn ServiceDiscovery) {
        let changed = discovery.changed_since_last_check("control");
        if !changed && now - self.last_discovery_at < DISCOVERY_FLOOR_SECS {
            return;
        }
        self.last_discovery_at = now;

        let mut providers = Vec::new();
        discovery.for_each_provider("control", &mut |url| providers.push(url.to_string()));
        self.providers = providers;

        for url in self.providers.clone() {
            let status_url = format!("{}/status", url.trim_end_matches('/'));
            let resp = match self.client.get(&status_url).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    warn!(provider = %url, status = %r.status(), "control: discovery non-200");
                    continue;
                }
                Err(e) => {
                    warn!(provider = %url, "control: discovery transport error: {e}");
                    continue;
                }
            };
            let body: serde_json::Value = match resp.json().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(provider = %url, "control: malformed discovery json: {e}");
                    continue;
                }
            };
            let Some(status_obj) = body.pointer("/control/status").and_then(|v| v.as_object())
            else {
                continue;
            };
            for name in status_obj.keys() {
                if let Some(point) = self.points.get_mut(name) {
                    if point.url != url {
                        info!(point = %name, url = %url, "ROUTE");
                        point.url = url.clone();
                    }
                }
            }
        }
    }

    pub fn status(&self, now: i64) -> serde_json::Value {
        let controls: Vec<_> = self
            .points
            .iter()
            .map(|(name, p)| {
                let remaining = if p.deadline > now { p.deadline - now } else { 0 };
                serde_json::json!([
                    name,
                    kind_str(p.kind),
                    self.status_char(name),
                    p.url,
                    remaining
                ])
            })
            .collect();
        serde_json::json!({"servers": self.providers, "controls": controls})
    }
}

fn kind_str(kind: PointType) -> &'static str {
    match kind {
        PointType::Zone => "zone",
        PointType::Feed => "feed",
    }
}
