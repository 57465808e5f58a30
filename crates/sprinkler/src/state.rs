//! Persistent operational state: the small JSON document recording
//! on/off, rain-delay, per-schedule last-launch, and the one-time queue —
//! everything that must survive a restart and be visible to a depot peer.
//! Local file and depot copies are both best-effort; the depot copy, when
//! present, is treated as authoritative over the local file at startup.

use crate::discovery::DepotClient;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const DEFAULT_STATE_PATH: &str = "/etc/house/sprinklerbkp.json";
pub const FACTORY_STATE_PATH: &str = "/usr/local/share/house/public/sprinkler/backup.json";
const SAVE_RETRY_BUDGET_SECS: i64 = 10;

pub struct PersistentState {
    local_path: String,
    host: String,
    depot: Arc<dyn DepotClient>,
    inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    dirty_at: Option<i64>,
    first_failure_at: Option<i64>,
}

impl PersistentState {
    pub fn new(local_path: impl Into<String>, host: impl Into<String>, depot: Arc<dyn DepotClient>) -> Self {
        let inbox: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::new(Mutex::new(VecDeque::new()));
        let sink_inbox = inbox.clone();
        depot.subscribe(
            "state",
            "sprinkler.json",
            Box::new(move |bytes: &[u8]| {
                sink_inbox.lock().unwrap().push_back(bytes.to_vec());
            }),
        );
        Self {
            local_path: local_path.into(),
            host: host.into(),
            depot,
            inbox,
            dirty_at: None,
            first_failure_at: None,
        }
    }

    /// The document to restore from at startup: the local file if present,
    /// otherwise a bare `{"host": ...}` skeleton. A depot copy that
    /// arrives shortly after startup (see [`PersistentState::poll_depot_update`])
    /// supersedes this.
    pub fn load_local(&self) -> serde_json::Value {
        fs::read_to_string(&self.local_path)
            .ok()
            .or_else(|| fs::read_to_string(FACTORY_STATE_PATH).ok())
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_else(|| serde_json::json!({"host": self.host}))
    }

    /// Drain every depot publication received since the last call,
    /// returning only the most recent one (older publications in the same
    /// batch are superseded and dropped without being applied).
    pub fn poll_depot_update(&self) -> Option<serde_json::Value> {
        let mut inbox = self.inbox.lock().unwrap();
        let mut latest = None;
        while let Some(bytes) = inbox.pop_front() {
            match serde_json::from_slice(&bytes) {
                Ok(v) => latest = Some(v),
                Err(e) => warn!("state: malformed depot publication: {e}"),
            }
        }
        latest
    }

    pub fn mark_dirty(&mut self, now: i64) {
        if self.dirty_at.is_none() {
            self.dirty_at = Some(now);
        }
    }

    /// Save `doc` if dirty and the one-second debounce window has elapsed.
    /// A failing save is retried every subsequent tick until
    /// [`SAVE_RETRY_BUDGET_SECS`] has passed since the first failure, at
    /// which point the dirty flag is dropped rather than retried forever.
    pub fn periodic(&mut self, now: i64, doc: &serde_json::Value) {
        let Some(dirty_at) = self.dirty_at else { return };
        if dirty_at >= now {
            return;
        }
        match self.save(doc) {
            Ok(()) => {
                self.dirty_at = None;
                self.first_failure_at = None;
            }
            Err(e) => {
                warn!("state: save failed: {e}");
                let first = *self.first_failure_at.get_or_insert(now);
                if now - first >= SAVE_RETRY_BUDGET_SECS {
                    warn!("state: save retry window exceeded, dropping dirty flag");
                    self.dirty_at = None;
                    self.first_failure_at = None;
                }
            }
        }
    }

    fn save(&self, doc: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(doc)?;
        let tmp_path = format!("{}.tmp", self.local_path);
        fs::write(&tmp_path, &text).with_context(|| format!("state: write {tmp_path}"))?;
        fs::rename(&tmp_path, &self.local_path)
            .with_context(|| format!("state: rename into {}", self.local_path))?;
        self.depot.put("state", "sprinkler.json", text.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NullDepot;

    fn temp_path(name: &str) -> String {
        format!("{}/sprinkler-state-test-{}.json", std::env::temp_dir().display(), name)
    }

    #[test]
    fn load_local_defaults_when_file_missing() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);
        let ps = PersistentState::new(path, "hosta", Arc::new(NullDepot::new()));
        let doc = ps.load_local();
        assert_eq!(doc["host"], "hosta");
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip");
        let _ = fs::remove_file(&path);
        let mut ps = PersistentState::new(path.clone(), "hosta", Arc::new(NullDepot::new()));
        ps.mark_dirty(0);
        ps.periodic(2, &serde_json::json!({"host": "hosta", "on": false}));
        let doc = ps.load_local();
        assert_eq!(doc["on"], false);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(format!("{path}.tmp"));
    }

    #[test]
    fn debounce_skips_save_within_the_same_second() {
        let path = temp_path("debounce");
        let _ = fs::remove_file(&path);
        let mut ps = PersistentState::new(path.clone(), "hosta", Arc::new(NullDepot::new()));
        ps.mark_dirty(5);
        ps.periodic(5, &serde_json::json!({"host": "hosta"}));
        assert!(fs::read_to_string(&path).is_err());
    }

    #[test]
    fn poll_depot_update_drains_to_latest_only() {
        let path = temp_path("depot");
        let depot = Arc::new(NullDepot::new());
        let ps = PersistentState::new(path, "hosta", depot);
        ps.inbox.lock().unwrap().push_back(br#"{"on": false}"#.to_vec());
        ps.inbox.lock().unwrap().push_back(br#"{"on": true}"#.to_vec());
        let latest = ps.poll_depot_update().unwrap();
        assert_eq!(latest["on"], true);
        assert!(ps.poll_depot_update().is_none());
    }
}
