//! Snapshot persistence: two JSON files under the configured database
//! directory, written atomically (temp file + rename). `state.json` holds
//! the keyed events, chat log, image directory, and indices; `presets.json`
//! holds the per-user die-roll presets. Missing files mean a fresh server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use mapwire::event::Event;
use mapwire::preset::RollPreset;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::MapState;

#[derive(Debug, Serialize, Deserialize)]
struct SavedEvent {
    raw: String,
    sequence: u64,
    key: String,
    class: String,
    id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extra: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedChat {
    raw: String,
    message_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedImage {
    name: String,
    size: String,
    location: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedState {
    events: Vec<SavedEvent>,
    chats: Vec<SavedChat>,
    images: Vec<SavedImage>,
    id_by_name: HashMap<String, String>,
    class_by_id: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedPreset {
    name: String,
    description: String,
    roll_spec: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedPresets {
    by_user: HashMap<String, Vec<SavedPreset>>,
}

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn open(dir: &Path) -> anyhow::Result<Storage> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
        Ok(Storage {
            dir: dir.to_path_buf(),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn presets_path(&self) -> PathBuf {
        self.dir.join("presets.json")
    }

    /// Restore game state into `state`. Events or chat rows that no longer
    /// parse are skipped with a warning rather than failing the whole load.
    pub fn load_state(&self, state: &mut MapState) -> anyhow::Result<()> {
        let path = self.state_path();
        let saved: SavedState = match std::fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        for row in saved.events {
            let mut ev = match Event::parse(&row.raw, &row.id, &row.class) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(raw = %row.raw, err = %e, "skipping unparseable saved event");
                    continue;
                }
            };
            if ev.key != row.key {
                warn!(
                    saved = %row.key,
                    derived = %ev.key,
                    "saved event key does not match derived key"
                );
            }
            ev.sequence = row.sequence;
            ev.multi_raw_data = row.extra;
            state.insert_loaded(ev);
        }

        for row in saved.chats {
            let ev = match Event::parse(&row.raw, "", "") {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(raw = %row.raw, err = %e, "skipping unparseable saved chat row");
                    continue;
                }
            };
            match ev.message_id() {
                Some(id) => {
                    if id != row.message_id {
                        warn!(
                            raw = %row.raw,
                            saved = row.message_id,
                            "saved chat row disagrees about its message id"
                        );
                    }
                    state.push_loaded_chat(ev, id);
                }
                None => warn!(raw = %row.raw, "skipping saved chat row with no message id"),
            }
        }

        for img in saved.images {
            state.record_image(&img.name, &img.size, &img.location);
        }
        for (name, id) in saved.id_by_name {
            state.bind_name(&name, &id);
        }
        for (id, class) in saved.class_by_id {
            state.bind_class(&id, &class);
        }
        state.save_needed = false;
        Ok(())
    }

    pub fn save_state(&self, state: &MapState) -> anyhow::Result<()> {
        let mut saved = SavedState::default();
        for ev in state.snapshot() {
            saved.events.push(SavedEvent {
                raw: ev.raw_text(),
                sequence: ev.sequence,
                key: ev.key.clone(),
                class: ev.class.clone(),
                id: ev.id.clone(),
                extra: ev.multi_raw_data.clone(),
            });
        }
        for ev in &state.chat {
            let Some(message_id) = ev.message_id() else {
                warn!(raw = %ev.raw_text(), "not saving chat row with no message id");
                continue;
            };
            saved.chats.push(SavedChat {
                raw: ev.raw_text(),
                message_id,
            });
        }
        for ((name, size), location) in &state.images {
            saved.images.push(SavedImage {
                name: name.clone(),
                size: size.clone(),
                location: location.clone(),
            });
        }
        saved.id_by_name = state.id_by_name.clone();
        saved.class_by_id = state.class_by_id.clone();

        write_atomically(&self.state_path(), &saved)
    }

    pub fn load_presets(&self) -> anyhow::Result<HashMap<String, Vec<RollPreset>>> {
        let path = self.presets_path();
        let saved: SavedPresets = match std::fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SavedPresets::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(saved
            .by_user
            .into_iter()
            .map(|(user, list)| {
                let list = list
                    .into_iter()
                    .map(|p| RollPreset {
                        name: p.name,
                        description: p.description,
                        roll_spec: p.roll_spec,
                    })
                    .collect();
                (user, list)
            })
            .collect())
    }

    pub fn save_presets(&self, all: &HashMap<String, Vec<RollPreset>>) -> anyhow::Result<()> {
        let saved = SavedPresets {
            by_user: all
                .iter()
                .map(|(user, list)| {
                    let list = list
                        .iter()
                        .map(|p| SavedPreset {
                            name: p.name.clone(),
                            description: p.description.clone(),
                            roll_spec: p.roll_spec.clone(),
                        })
                        .collect();
                    (user.clone(), list)
                })
                .collect(),
        };
        write_atomically(&self.presets_path(), &saved)
    }

    /// Replace one user's preset list on disk without touching the others.
    pub fn update_presets(&self, user: &str, list: &[RollPreset]) -> anyhow::Result<()> {
        let mut all = self.load_presets()?;
        all.insert(user.to_string(), list.to_vec());
        self.save_presets(&all)
    }
}

fn write_atomically<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(value).context("serializing snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, s).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}
