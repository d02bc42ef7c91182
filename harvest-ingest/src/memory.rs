//! In-memory store with optional JSON snapshot persistence
//!
//! All state lives behind one mutex, which makes every trait call atomic. When
//! opened with a path, each mutation rewrites the snapshot (temp file + rename).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use harvest_core::{
    Identifier, Publication, PublicationId, QueueItem, QueueStatus, Run, RunId, RunPlanKind, SafetyCounters,
    Scholar, StorageError, TriggerKind,
};

use crate::{
    InsertOutcome, PublicationStore, QueueStore, RunStore, SafetyStore, ScholarStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ScholarLink {
    scholar_id: String,
    publication_id: PublicationId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MemoryState {
    runs: Vec<Run>,
    scholars: Vec<Scholar>,
    queue: Vec<QueueItem>,
    safety: Vec<SafetyCounters>,
    publications: Vec<Publication>,
    links: Vec<ScholarLink>,
}

/// Store keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store (tests, dry runs)
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) a store backed by a JSON snapshot at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                MemoryState::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            MemoryState::default()
        };
        debug!(
            "Opened state {} ({} scholars, {} publications)",
            path.display(),
            state.scholars.len(),
            state.publications.len()
        );
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Write the snapshot now
    pub fn persist(&self) -> Result<(), StorageError> {
        let state = self.state.lock();
        self.save(&state)
    }

    fn save(&self, state: &MemoryState) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&MemoryState) -> R) -> R {
        f(&self.state.lock())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> Result<R, StorageError> {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.save(&state)?;
        Ok(result)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &Run) -> Result<(), StorageError> {
        self.mutate(|state| {
            if state.runs.iter().any(|r| r.id == run.id) {
                return Err(StorageError::Conflict(format!("run {} already exists", run.id)));
            }
            state.runs.push(run.clone());
            Ok(())
        })?
    }

    async fn update_run(&self, run: &Run) -> Result<(), StorageError> {
        self.mutate(|state| match state.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                entity: "run",
                id: run.id.to_string(),
            }),
        })?
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StorageError> {
        Ok(self.read(|state| state.runs.iter().find(|r| r.id == id).cloned()))
    }

    async fn find_run_by_key(&self, scope: &str, key: &str) -> Result<Option<Run>, StorageError> {
        Ok(self.read(|state| {
            state
                .runs
                .iter()
                .rev()
                .find(|r| r.scope == scope && r.idempotency_key.as_deref() == Some(key))
                .cloned()
        }))
    }

    async fn latest_run(
        &self,
        scope: &str,
        trigger: Option<TriggerKind>,
        plan: Option<RunPlanKind>,
    ) -> Result<Option<Run>, StorageError> {
        Ok(self.read(|state| {
            state
                .runs
                .iter()
                .filter(|r| r.scope == scope)
                .filter(|r| trigger.map_or(true, |t| r.trigger == t))
                .filter(|r| plan.map_or(true, |p| r.plan == p))
                .max_by_key(|r| r.created_at)
                .cloned()
        }))
    }

    async fn list_runs(&self, scope: &str, limit: usize) -> Result<Vec<Run>, StorageError> {
        Ok(self.read(|state| {
            let mut runs: Vec<Run> = state.runs.iter().filter(|r| r.scope == scope).cloned().collect();
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            runs.truncate(limit);
            runs
        }))
    }
}

#[async_trait]
impl ScholarStore for MemoryStore {
    async fn upsert_scholar(&self, scholar: &Scholar) -> Result<(), StorageError> {
        self.mutate(|state| match state.scholars.iter_mut().find(|s| s.id == scholar.id) {
            Some(existing) => *existing = scholar.clone(),
            None => state.scholars.push(scholar.clone()),
        })
    }

    async fn get_scholar(&self, id: &str) -> Result<Option<Scholar>, StorageError> {
        Ok(self.read(|state| state.scholars.iter().find(|s| s.id == id).cloned()))
    }

    async fn list_scholars(&self, scope: &str) -> Result<Vec<Scholar>, StorageError> {
        Ok(self.read(|state| state.scholars.iter().filter(|s| s.scope == scope).cloned().collect()))
    }

    async fn list_scopes(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.read(|state| {
            let mut scopes: Vec<String> = Vec::new();
            for scholar in &state.scholars {
                if !scopes.contains(&scholar.scope) {
                    scopes.push(scholar.scope.clone());
                }
            }
            scopes
        }))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn get_queue_item(&self, scholar_id: &str) -> Result<Option<QueueItem>, StorageError> {
        Ok(self.read(|state| state.queue.iter().find(|q| q.scholar_id == scholar_id).cloned()))
    }

    async fn put_queue_item(&self, item: &QueueItem) -> Result<(), StorageError> {
        self.mutate(|state| match state.queue.iter_mut().find(|q| q.scholar_id == item.scholar_id) {
            Some(existing) => *existing = item.clone(),
            None => state.queue.push(item.clone()),
        })
    }

    async fn delete_queue_item(&self, scholar_id: &str) -> Result<(), StorageError> {
        self.mutate(|state| state.queue.retain(|q| q.scholar_id != scholar_id))
    }

    async fn list_queue_items(&self, scope: Option<&str>) -> Result<Vec<QueueItem>, StorageError> {
        Ok(self.read(|state| {
            let mut items: Vec<QueueItem> = state
                .queue
                .iter()
                .filter(|q| scope.map_or(true, |s| q.scope == s))
                .cloned()
                .collect();
            items.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
            items
        }))
    }

    async fn claim_due(
        &self,
        scope: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StorageError> {
        self.mutate(|state| {
            let mut due: Vec<usize> = state
                .queue
                .iter()
                .enumerate()
                .filter(|(_, q)| q.scope == scope && q.is_due(now))
                .map(|(idx, _)| idx)
                .collect();
            due.sort_by_key(|idx| state.queue[*idx].next_attempt_at);
            due.truncate(limit);

            due.into_iter()
                .map(|idx| {
                    let item = &mut state.queue[idx];
                    item.status = QueueStatus::Retrying;
                    item.updated_at = now;
                    item.clone()
                })
                .collect()
        })
    }
}

#[async_trait]
impl SafetyStore for MemoryStore {
    async fn get_safety(&self, scope: &str) -> Result<Option<SafetyCounters>, StorageError> {
        Ok(self.read(|state| state.safety.iter().find(|s| s.scope == scope).cloned()))
    }

    async fn put_safety(&self, counters: &SafetyCounters) -> Result<(), StorageError> {
        self.mutate(|state| match state.safety.iter_mut().find(|s| s.scope == counters.scope) {
            Some(existing) => *existing = counters.clone(),
            None => state.safety.push(counters.clone()),
        })
    }
}

#[async_trait]
impl PublicationStore for MemoryStore {
    async fn get_publication(&self, id: PublicationId) -> Result<Option<Publication>, StorageError> {
        Ok(self.read(|state| state.publications.iter().find(|p| p.id == id).cloned()))
    }

    async fn find_by_cluster(&self, cluster_id: &str) -> Result<Option<Publication>, StorageError> {
        Ok(self.read(|state| {
            state
                .publications
                .iter()
                .find(|p| p.cluster_id.as_deref() == Some(cluster_id))
                .cloned()
        }))
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Publication>, StorageError> {
        Ok(self.read(|state| state.publications.iter().find(|p| p.fingerprint == fingerprint).cloned()))
    }

    async fn insert_if_absent(&self, publication: Publication) -> Result<InsertOutcome, StorageError> {
        self.mutate(|state| {
            if let Some(existing) = state
                .publications
                .iter()
                .find(|p| p.fingerprint == publication.fingerprint)
            {
                return InsertOutcome::Existing(existing.clone());
            }
            let id = publication.id;
            state.publications.push(publication);
            InsertOutcome::Inserted(id)
        })
    }

    async fn update_publication(&self, publication: &Publication) -> Result<(), StorageError> {
        self.mutate(|state| match state.publications.iter_mut().find(|p| p.id == publication.id) {
            Some(existing) => {
                *existing = publication.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                entity: "publication",
                id: publication.id.to_string(),
            }),
        })?
    }

    async fn add_identifiers(
        &self,
        id: PublicationId,
        identifiers: Vec<Identifier>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.mutate(|state| {
            let publication = state
                .publications
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| StorageError::NotFound {
                    entity: "publication",
                    id: id.to_string(),
                })?;
            let mut changed = false;
            for identifier in identifiers {
                changed |= publication.add_identifier(identifier);
            }
            if changed {
                publication.updated_at = now;
            }
            Ok(changed)
        })?
    }

    async fn list_publications(&self) -> Result<Vec<Publication>, StorageError> {
        Ok(self.read(|state| state.publications.clone()))
    }

    async fn link_scholar_publication(
        &self,
        scholar_id: &str,
        publication: PublicationId,
    ) -> Result<bool, StorageError> {
        self.mutate(|state| {
            let link = ScholarLink {
                scholar_id: scholar_id.to_string(),
                publication_id: publication,
            };
            if state.links.contains(&link) {
                false
            } else {
                state.links.push(link);
                true
            }
        })
    }

    async fn scholar_publications(&self, scholar_id: &str) -> Result<Vec<PublicationId>, StorageError> {
        Ok(self.read(|state| {
            state
                .links
                .iter()
                .filter(|l| l.scholar_id == scholar_id)
                .map(|l| l.publication_id)
                .collect()
        }))
    }

    async fn move_links(&self, from: PublicationId, to: PublicationId) -> Result<(), StorageError> {
        self.mutate(|state| {
            let moved: Vec<String> = state
                .links
                .iter()
                .filter(|l| l.publication_id == from)
                .map(|l| l.scholar_id.clone())
                .collect();
            state.links.retain(|l| l.publication_id != from);
            for scholar_id in moved {
                let link = ScholarLink {
                    scholar_id,
                    publication_id: to,
                };
                if !state.links.contains(&link) {
                    state.links.push(link);
                }
            }
        })
    }
}
