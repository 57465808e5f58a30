//! Program module: expands a named program into its constituent zone
//! activations, applying watering-index scaling, and tracks which
//! programs are currently running.

use crate::config::Config;
use crate::index::Index;
use crate::season::SeasonTable;
use crate::zone::ZoneQueue;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone)]
struct ZoneRuntime {
    name: String,
    runtime: i64,
}

#[derive(Debug, Clone)]
struct ProgramEntry {
    season: Option<String>,
    zones: Vec<ZoneRuntime>,
    running: bool,
    scheduled: i64,
}

#[derive(Debug, Default)]
pub struct Program {
    programs: HashMap<String, ProgramEntry>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// `running`/`scheduled` survive a reload for any program whose name is
    /// unchanged; a renamed or deleted program loses its in-flight state.
    pub fn refresh(&mut self, config: &Config) -> anyhow::Result<()> {
        let mut programs = HashMap::new();
        for p in config.programs()? {
            let zones = p
                .zones
                .into_iter()
                .map(|z| ZoneRuntime { name: z.name, runtime: z.runtime })
                .collect();
            let (running, scheduled) = self
                .programs
                .get(&p.name)
                .map(|e| (e.running, e.scheduled))
                .unwrap_or((false, 0));
            programs.insert(p.name, ProgramEntry { season: p.season, zones, running, scheduled });
        }
        self.programs = programs;
        Ok(())
    }

    /// Unknown program names report "running" rather than erroring, so a
    /// schedule referencing a program that was since removed from the
    /// configuration simply stops firing instead of raising on every tick.
    pub fn running(&self, name: &str) -> bool {
        self.programs.get(name).map(|p| p.running).unwrap_or(true)
    }

    pub fn lastscheduled(&self, name: &str) -> i64 {
        self.programs.get(name).map(|p| p.scheduled).unwrap_or(0)
    }

    /// The watering-index percentage and its origin label that would apply
    /// to a launch of `name` right now.
    pub fn current_index(
        &self,
        name: &str,
        manual: bool,
        seasons: &SeasonTable,
        index: &Index,
        use_index: bool,
        now: i64,
    ) -> (i32, String) {
        if !use_index {
            return (100, String::new());
        }
        let Some(def) = self.programs.get(name) else {
            return (100, String::new());
        };

        let (mut value, mut priority, mut origin) = (100i32, 0i32, String::new());

        if let Some(season_name) = &def.season {
            let now_dt = time::OffsetDateTime::from_unix_timestamp(now)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
            let season_value = seasons.index(season_name, now_dt);
            if season_value == 0 {
                if !manual {
                    return (0, String::new());
                }
                return (100, String::new());
            }
            value = season_value;
            priority = seasons.priority(season_name);
            origin = season_name.clone();
        }

        if index.is_valid(now) {
            if let Some((idx_value, idx_origin)) = index.current(now) {
                if index.priority() > priority {
                    value = idx_value;
                    origin = idx_origin;
                }
            }
        }

        if value == 0 && manual {
            return (100, String::new());
        }

        (value, origin)
    }

    #[allow(clippy::too_many_arguments)]
    fn activate(
        &mut self,
        name: &str,
        manual: bool,
        full: bool,
        seasons: &SeasonTable,
        index: &Index,
        zones: &mut ZoneQueue,
        use_index: bool,
        now: i64,
    ) -> i64 {
        if !self.programs.contains_key(name) {
            return 0;
        }
        if self.running(name) {
            info!(program = %name, "IGNORED ALREADY RUNNING");
            return 0;
        }

        let applied_index = if full {
            100
        } else {
            let (value, _origin) = self.current_index(name, manual, seasons, index, use_index, now);
            if value == 0 && !manual {
                info!(program = %name, "IGNORED NOT IN SEASON");
                return 0;
            }
            value
        };

        let zone_list = self.programs.get(name).unwrap().zones.clone();
        for z in &zone_list {
            let runtime = (z.runtime * applied_index as i64) / 100;
            zones.activate(&z.name, runtime, &format!("PROGRAM {name}"), now);
        }

        info!(program = %name, index = applied_index, "START");
        if let Some(entry) = self.programs.get_mut(name) {
            entry.running = true;
            entry.scheduled = now;
        }
        now
    }

    /// An operator-triggered full-runtime launch, ignoring index scaling.
    pub fn start_manual(
        &mut self,
        name: &str,
        seasons: &SeasonTable,
        index: &Index,
        zones: &mut ZoneQueue,
        use_index: bool,
        now: i64,
    ) -> i64 {
        self.activate(name, true, true, seasons, index, zones, use_index, now)
    }

    /// A schedule-triggered launch; `full` bypasses index scaling the same
    /// way a manual launch does, for one-time "water anyway" requests.
    #[allow(clippy::too_many_arguments)]
    pub fn start_scheduled(
        &mut self,
        name: &str,
        full: bool,
        seasons: &SeasonTable,
        index: &Index,
        zones: &mut ZoneQueue,
        use_index: bool,
        now: i64,
    ) -> i64 {
        self.activate(name, false, full, seasons, index, zones, use_index, now)
    }

    /// Clear `running` on every program once the zone queue goes idle.
    pub fn periodic(&mut self, zone_idle: bool) {
        if !zone_idle {
            return;
        }
        for (name, entry) in self.programs.iter_mut() {
            if entry.running {
                entry.running = false;
                info!(program = %name, "STOP");
            }
        }
    }

    pub fn status(&self, use_index: bool) -> serde_json::Value {
        let active: Vec<&str> = self
            .programs
            .iter()
            .filter(|(_, p)| p.running)
            .map(|(n, _)| n.as_str())
            .collect();
        serde_json::json!({"useindex": use_index, "active": active})
    }
}
