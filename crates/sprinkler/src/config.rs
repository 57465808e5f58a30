//! Typed read access to the configuration tree.
//!
//! The tree is a parsed JSON document ([`serde_json::Value`]), immutable
//! between reloads — every call to [`Config::load`]/[`Config::parse`]
//! produces a brand-new tree, and every dependent table is rebuilt from
//! it wholesale, never patched in place. Per-entity structs own their own
//! `String`s (deserialized out of the tree, not borrowed from it), which
//! sidesteps the "string lifetime" open design note: there is nothing to
//! keep alive once `Config::zones()` et al. have returned.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/house/sprinkler.json";
pub const FACTORY_CONFIG_PATH: &str = "/usr/local/share/house/public/sprinkler/defaults.json";

pub const MAX_PROGRAM_ZONES: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn empty() -> Self {
        Self {
            root: Value::Object(Default::default()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text).context("config: invalid JSON")?;
        Ok(Self { root })
    }

    pub fn load(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .or_else(|_| fs::read_to_string(FACTORY_CONFIG_PATH))
            .with_context(|| format!("config: cannot read {path} or factory fallback"))?;
        Self::parse(&text)
    }

    pub fn raw(&self) -> &Value {
        &self.root
    }

    /// Dotted-path lookup, e.g. `"control.status"` or `".control.status"`.
    /// Leading/empty/trailing dots are tolerated and ignored.
    pub fn path<'a>(&'a self, path: &str) -> Option<&'a Value> {
        let mut cur = &self.root;
        for seg in path.split('.').filter(|s| !s.is_empty()) {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn path_str(&self, path: &str) -> Option<&str> {
        self.path(path)?.as_str()
    }

    pub fn path_i64(&self, path: &str) -> Option<i64> {
        self.path(path)?.as_i64()
    }

    pub fn path_bool(&self, path: &str) -> Option<bool> {
        self.path(path)?.as_bool()
    }

    fn array(&self, key: &str) -> Vec<Value> {
        self.root
            .get(key)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    pub fn zones(&self) -> Result<Vec<ZoneConfig>> {
        parse_all(self.array("zones"))
    }

    pub fn feeds(&self) -> Result<Vec<FeedConfig>> {
        parse_all(self.array("feeds"))
    }

    pub fn programs(&self) -> Result<Vec<ProgramConfig>> {
        let mut programs: Vec<ProgramConfig> = parse_all(self.array("programs"))?;
        for p in &mut programs {
            if p.zones.len() > MAX_PROGRAM_ZONES {
                tracing::warn!(
                    program = %p.name,
                    count = p.zones.len(),
                    "PROGRAM TRUNCATED: too many zones"
                );
                p.zones.truncate(MAX_PROGRAM_ZONES);
            }
        }
        Ok(programs)
    }

    pub fn seasons(&self) -> Result<Vec<SeasonConfig>> {
        parse_all(self.array("seasons"))
    }

    pub fn intervals(&self) -> Result<Vec<IntervalScaleConfig>> {
        parse_all(self.array("intervals"))
    }

    pub fn index_providers(&self) -> Result<Vec<IndexProviderConfig>> {
        parse_all(self.array("wateringindex"))
    }

    /// `schedules[]`, falling back to `programs[]` (legacy shape, using
    /// `.name` in place of `.program`) when `schedules` is absent or empty.
    pub fn schedules(&self) -> Result<Vec<ScheduleConfig>> {
        let primary = self.array("schedules");
        if !primary.is_empty() {
            return parse_all(primary);
        }
        let legacy: Vec<Value> = self
            .array("programs")
            .into_iter()
            .map(|mut v| {
                if let Some(obj) = v.as_object_mut() {
                    if !obj.contains_key("program") {
                        if let Some(name) = obj.get("name").cloned() {
                            obj.insert("program".to_string(), name);
                        }
                    }
                }
                v
            })
            .collect();
        parse_all(legacy)
    }
}

fn parse_all<T: for<'de> Deserialize<'de>>(items: Vec<Value>) -> Result<Vec<T>> {
    items
        .into_iter()
        .map(|v| serde_json::from_value(v).context("config: malformed entry"))
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default)]
    pub hydrate: i64,
    #[serde(default)]
    pub pulse: i64,
    #[serde(default)]
    pub pause: i64,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub linger: i64,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramZoneEntry {
    pub name: String,
    pub runtime: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub zones: Vec<ProgramZoneEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub weekly: Option<Vec<i32>>,
    #[serde(default)]
    pub monthly: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalScaleConfig {
    pub name: String,
    pub scale: Vec<i64>,
}

fn default_true() -> bool {
    true
}

fn default_adjust_max() -> i32 {
    150
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub adjust_min: i32,
    #[serde(default = "default_adjust_max")]
    pub adjust_max: i32,
    #[serde(default)]
    pub refresh_hours: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub begin: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub days: Vec<bool>,
    #[serde(default)]
    pub interval: i64,
}
