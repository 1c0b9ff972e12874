//! Durable incident ledger.
//!
//! Layout under the data directory:
//!
//! ```text
//! data/
//!   incidents.json      newest-first array, capped
//!   images/<id>.jpg     one artifact per incident
//! ```
//!
//! The ledger is rewritten whole on every mutation through a temp file that
//! is synced and then renamed over the old one, so a reader (or a crash)
//! only ever sees the old or the new collection. All mutations go through
//! one async mutex; the in-memory copy behind it is the persisted state.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::SentinelError;
use crate::logging::{log, log_fault, log_incident, obj, v_str, Domain, Level};
use crate::types::{Incident, Note};

pub const DEFAULT_INCIDENT_CAP: usize = 1000;
const LEDGER_FILE: &str = "incidents.json";
const IMAGE_DIR: &str = "images";

pub struct IncidentStore {
    ledger_path: PathBuf,
    image_dir: PathBuf,
    cap: usize,
    incidents: Mutex<Vec<Incident>>,
}

impl IncidentStore {
    /// Open (or create) the store. A malformed ledger is treated as empty.
    pub async fn open(dir: impl AsRef<Path>, cap: usize) -> Result<Self, SentinelError> {
        let dir = dir.as_ref();
        let image_dir = dir.join(IMAGE_DIR);
        fs::create_dir_all(&image_dir).await?;
        let ledger_path = dir.join(LEDGER_FILE);

        let incidents = load_ledger(&ledger_path).await;
        let store = Self {
            ledger_path,
            image_dir,
            cap: cap.max(1),
            incidents: Mutex::new(incidents),
        };
        if fs::metadata(&store.ledger_path).await.is_err() {
            write_atomic(&store.ledger_path, b"[]").await?;
        }
        Ok(store)
    }

    /// Artifact path for `id`; `None` if the id could escape the image
    /// directory.
    pub fn image_path(&self, id: &str) -> Option<PathBuf> {
        if !is_safe_id(id) {
            return None;
        }
        Some(self.image_dir.join(format!("{}.jpg", id)))
    }

    /// Store the image artifact, then insert the incident at the front and
    /// persist. Incidents pushed past the cap lose their artifacts too.
    pub async fn append(&self, mut incident: Incident, image: &[u8]) -> Result<Incident, SentinelError> {
        let mut guard = self.incidents.lock().await;

        let image_path = self
            .image_path(&incident.id)
            .ok_or_else(|| SentinelError::InvalidIncidentId(incident.id.clone()))?;
        incident.image_digest = Some(hex::encode(Sha256::digest(image)));
        write_atomic(&image_path, image).await?;

        let mut next = guard.clone();
        next.insert(0, incident.clone());
        let evicted: Vec<Incident> = if next.len() > self.cap {
            next.split_off(self.cap)
        } else {
            Vec::new()
        };
        if let Err(err) = self.persist(&next).await {
            self.remove_image(&incident.id).await;
            return Err(err);
        }
        *guard = next;
        drop(guard);

        for old in &evicted {
            self.remove_image(&old.id).await;
        }
        log_incident(
            &incident.id,
            &incident.worker_id,
            incident.kind.as_str(),
            &format!("{:?}", incident.severity),
        );
        Ok(incident)
    }

    /// All incidents, newest first.
    pub async fn get_all(&self) -> Vec<Incident> {
        self.incidents.lock().await.clone()
    }

    pub async fn recent(&self, k: usize) -> Vec<Incident> {
        self.incidents.lock().await.iter().take(k).cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<Incident> {
        self.incidents.lock().await.iter().find(|i| i.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.incidents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns whether anything was removed; unknown ids are a no-op.
    pub async fn delete(&self, id: &str) -> Result<bool, SentinelError> {
        let removed = self
            .mutate(id, "delete", |incidents, idx| {
                incidents.remove(idx);
            })
            .await?;
        if removed {
            self.remove_image(id).await;
        }
        Ok(removed)
    }

    pub async fn resolve(&self, id: &str) -> Result<bool, SentinelError> {
        self.mutate(id, "resolve", |incidents, idx| {
            incidents[idx].acknowledged = true;
        })
        .await
    }

    pub async fn add_note(&self, id: &str, text: &str) -> Result<bool, SentinelError> {
        let note = Note {
            timestamp: Utc::now(),
            content: text.to_string(),
        };
        self.mutate(id, "add_note", move |incidents, idx| {
            incidents[idx].notes.push(note);
        })
        .await
    }

    async fn mutate<F>(&self, id: &str, op: &str, apply: F) -> Result<bool, SentinelError>
    where
        F: FnOnce(&mut Vec<Incident>, usize),
    {
        let mut guard = self.incidents.lock().await;
        let Some(idx) = guard.iter().position(|i| i.id == id) else {
            return Ok(false);
        };
        let mut next = guard.clone();
        apply(&mut next, idx);
        self.persist(&next).await?;
        *guard = next;
        log(
            Level::Info,
            Domain::Incident,
            op,
            obj(&[("incident_id", v_str(id))]),
        );
        Ok(true)
    }

    async fn persist(&self, incidents: &[Incident]) -> Result<(), SentinelError> {
        let body = serde_json::to_vec_pretty(incidents)?;
        write_atomic(&self.ledger_path, &body).await?;
        Ok(())
    }

    async fn remove_image(&self, id: &str) {
        let Some(path) = self.image_path(id) else {
            return;
        };
        if let Err(err) = fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                log_fault(Domain::Incident, "remove_image", &err.to_string());
            }
        }
    }
}

async fn load_ledger(path: &Path) -> Vec<Incident> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_slice::<Vec<Incident>>(&raw) {
        Ok(incidents) => incidents,
        Err(err) => {
            log(
                Level::Warn,
                Domain::Incident,
                "ledger_malformed",
                obj(&[
                    ("path", v_str(&path.to_string_lossy())),
                    ("error", v_str(&err.to_string())),
                    ("recovery", json!("treated_as_empty")),
                ]),
            );
            Vec::new()
        }
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

/// Write to a sibling temp file, fsync, then rename over `path`. The temp
/// file is removed if any step fails.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let outcome = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;
    if outcome.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    outcome
}
