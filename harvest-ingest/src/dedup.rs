//! Publication deduplication
//!
//! Records resolve to a stored publication by cluster id first, then by
//! content fingerprint. Near-duplicates that neither key catches (typos,
//! reworded titles) are only reported; merging them is an operator decision.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use harvest_core::{
    token_similarity, Clock, EnrichmentConfig, Publication, PublicationId, PublicationRecord,
    StorageError,
};

use crate::{HarvestStore, InsertOutcome};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Publication not found: {0}")]
    NotFound(PublicationId),

    #[error("Cannot merge publication {0} into itself")]
    SelfMerge(PublicationId),

    #[error("Publication {0} is already merged")]
    AlreadyMerged(PublicationId),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How a record was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(PublicationId),
    Merged(PublicationId),
}

impl UpsertOutcome {
    pub fn id(&self) -> PublicationId {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Merged(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

/// Totals for one ingested page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageIngest {
    pub created: u64,
    pub merged: u64,
    /// Publications newly linked to the page's scholar
    pub new_for_scholar: u64,
    pub touched: Vec<PublicationId>,
}

/// Pair of likely duplicates awaiting review
#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicate {
    pub primary: PublicationId,
    pub duplicate: PublicationId,
    pub similarity: f64,
}

pub struct DedupEngine {
    store: Arc<dyn HarvestStore>,
    clock: Arc<dyn Clock>,
    near_duplicate_threshold: f64,
    year_window: i32,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn HarvestStore>, clock: Arc<dyn Clock>, config: &EnrichmentConfig) -> Self {
        Self {
            store,
            clock,
            near_duplicate_threshold: config.near_duplicate_threshold,
            year_window: config.near_duplicate_year_window,
        }
    }

    /// Follow `merged_into` to the surviving publication
    async fn canonical(&self, mut publication: Publication) -> Result<Publication, StorageError> {
        // merge chains are short; the bound only guards against cycles
        for _ in 0..8 {
            let Some(target) = publication.merged_into else {
                break;
            };
            match self.store.get_publication(target).await? {
                Some(next) => publication = next,
                None => break,
            }
        }
        Ok(publication)
    }

    async fn merge_into(
        &self,
        existing: Publication,
        record: &PublicationRecord,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut existing = self.canonical(existing).await?;
        if existing.merge_record(record, self.clock.now()) {
            self.store.update_publication(&existing).await?;
        }
        Ok(UpsertOutcome::Merged(existing.id))
    }

    /// Store a record or merge it into its existing publication
    pub async fn upsert(&self, record: &PublicationRecord) -> Result<UpsertOutcome, StorageError> {
        if let Some(cluster_id) = record.cluster_id.as_deref() {
            if let Some(existing) = self.store.find_by_cluster(cluster_id).await? {
                return self.merge_into(existing, record).await;
            }
        }

        let candidate = Publication::from_record(record, self.clock.now());
        match self.store.insert_if_absent(candidate).await? {
            InsertOutcome::Inserted(id) => {
                debug!(%id, title = %record.title, "New publication");
                Ok(UpsertOutcome::Created(id))
            }
            InsertOutcome::Existing(existing) => self.merge_into(existing, record).await,
        }
    }

    /// Upsert every record of a page and link them to `scholar_id`
    pub async fn ingest_page(
        &self,
        scholar_id: &str,
        records: &[PublicationRecord],
    ) -> Result<PageIngest, StorageError> {
        let mut totals = PageIngest::default();
        for record in records {
            let outcome = self.upsert(record).await?;
            if outcome.is_created() {
                totals.created += 1;
            } else {
                totals.merged += 1;
            }
            if self.store.link_scholar_publication(scholar_id, outcome.id()).await? {
                totals.new_for_scholar += 1;
            }
            if !totals.touched.contains(&outcome.id()) {
                totals.touched.push(outcome.id());
            }
        }
        Ok(totals)
    }

    /// Report likely duplicates among live publications
    pub async fn sweep_near_duplicates(&self) -> Result<Vec<NearDuplicate>, StorageError> {
        let mut live: Vec<Publication> = self
            .store
            .list_publications()
            .await?
            .into_iter()
            .filter(|p| p.merged_into.is_none())
            .collect();
        live.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at).then(a.id.cmp(&b.id)));

        let mut found = Vec::new();
        for (i, primary) in live.iter().enumerate() {
            for duplicate in &live[i + 1..] {
                if let (Some(a), Some(b)) = (primary.year, duplicate.year) {
                    if (a - b).abs() > self.year_window {
                        continue;
                    }
                }
                let similarity = token_similarity(&primary.title, &duplicate.title);
                if similarity >= self.near_duplicate_threshold {
                    found.push(NearDuplicate {
                        primary: primary.id,
                        duplicate: duplicate.id,
                        similarity,
                    });
                }
            }
        }

        info!("Near-duplicate sweep found {} candidate pairs", found.len());
        Ok(found)
    }

    /// Fold `duplicate` into `primary`; nothing is deleted
    pub async fn merge_near_duplicate(
        &self,
        primary: PublicationId,
        duplicate: PublicationId,
    ) -> Result<Publication, DedupError> {
        if primary == duplicate {
            return Err(DedupError::SelfMerge(primary));
        }
        let mut target = self
            .store
            .get_publication(primary)
            .await?
            .ok_or(DedupError::NotFound(primary))?;
        let mut source = self
            .store
            .get_publication(duplicate)
            .await?
            .ok_or(DedupError::NotFound(duplicate))?;
        if target.merged_into.is_some() {
            return Err(DedupError::AlreadyMerged(primary));
        }
        if source.merged_into.is_some() {
            return Err(DedupError::AlreadyMerged(duplicate));
        }

        let now = self.clock.now();
        let record = PublicationRecord {
            title: source.title.clone(),
            authors: source.authors.clone(),
            venue: source.venue.clone(),
            year: source.year,
            cluster_id: None,
            citation_count: source.citation_count,
            source_url: source.source_url.clone(),
            identifiers: source.identifiers.clone(),
        };
        target.merge_record(&record, now);
        self.store.update_publication(&target).await?;

        source.merged_into = Some(primary);
        source.updated_at = now;
        self.store.update_publication(&source).await?;
        self.store.move_links(duplicate, primary).await?;

        info!(%primary, %duplicate, "Merged near-duplicate publication");
        Ok(target)
    }
}
