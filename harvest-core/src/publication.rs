//! Publications, identifiers and content fingerprints
//!
//! A fingerprint is the SHA-256 of the normalized title, the first author's
//! surname and the year. Normalization folds diacritics (NFKD, combining marks
//! removed), lower-cases, turns punctuation into spaces and collapses
//! whitespace, so re-scrapes with trivial formatting differences collide.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Unique identifier of a stored publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicationId(pub Uuid);

impl PublicationId {
    pub fn new() -> Self {
        PublicationId(Uuid::new_v4())
    }
}

impl Default for PublicationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PublicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PublicationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PublicationId(Uuid::parse_str(s)?))
    }
}

/// Kind of cross-referencing identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Doi,
    Arxiv,
    Pmid,
    Url,
}

/// An identifier attached to a publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    /// Normalized value (DOIs lower-cased, arXiv ids without version)
    pub value: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,
    /// Where the identifier came from (`profile`, `crossref`, `arxiv`, ...)
    pub source: String,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, value: &str, confidence: f64, source: &str) -> Self {
        Self {
            kind,
            value: normalize_identifier(kind, value),
            confidence: confidence.clamp(0.0, 1.0),
            source: source.to_string(),
        }
    }

    fn same_target(&self, other: &Identifier) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

/// Normalize an identifier value for comparison
pub fn normalize_identifier(kind: IdentifierKind, value: &str) -> String {
    let trimmed = value.trim();
    match kind {
        IdentifierKind::Doi => {
            let lower = trimmed.to_lowercase();
            lower
                .trim_start_matches("https://doi.org/")
                .trim_start_matches("http://dx.doi.org/")
                .trim_start_matches("doi:")
                .trim_end_matches(['.', ',', ';'])
                .to_string()
        }
        IdentifierKind::Arxiv => {
            let lower = trimmed.to_lowercase();
            let bare = lower.trim_start_matches("arxiv:");
            match bare.rfind('v') {
                Some(pos)
                    if pos > 0
                        && bare[pos + 1..].chars().all(|c| c.is_ascii_digit())
                        && !bare[pos + 1..].is_empty() =>
                {
                    bare[..pos].to_string()
                }
                _ => bare.to_string(),
            }
        }
        IdentifierKind::Pmid => trimmed.to_string(),
        IdentifierKind::Url => trimmed.trim_end_matches('/').to_string(),
    }
}

/// A record as parsed from one upstream page, before deduplication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    /// Cluster id assigned by the primary source, when known
    pub cluster_id: Option<String>,
    pub citation_count: Option<u32>,
    pub source_url: Option<String>,
    pub identifiers: Vec<Identifier>,
}

impl PublicationRecord {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            authors: Vec::new(),
            venue: None,
            year: None,
            cluster_id: None,
            citation_count: None,
            source_url: None,
            identifiers: Vec::new(),
        }
    }

    pub fn with_authors(mut self, authors: &[&str]) -> Self {
        self.authors = authors.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_venue(mut self, venue: &str) -> Self {
        self.venue = Some(venue.to_string());
        self
    }

    pub fn with_cluster_id(mut self, cluster_id: &str) -> Self {
        self.cluster_id = Some(cluster_id.to_string());
        self
    }

    pub fn first_author(&self) -> Option<&str> {
        self.authors.first().map(String::as_str)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.title, self.first_author(), self.year)
    }
}

/// A globally deduplicated publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub id: PublicationId,
    pub fingerprint: String,
    pub cluster_id: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub citation_count: Option<u32>,
    pub source_url: Option<String>,
    /// Append-only identifier set
    pub identifiers: Vec<Identifier>,
    /// Set when an operator merged this record into another one
    pub merged_into: Option<PublicationId>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Publication {
    pub fn from_record(record: &PublicationRecord, now: DateTime<Utc>) -> Self {
        let mut publication = Self {
            id: PublicationId::new(),
            fingerprint: record.fingerprint(),
            cluster_id: record.cluster_id.clone(),
            title: record.title.trim().to_string(),
            authors: record.authors.clone(),
            venue: record.venue.clone(),
            year: record.year,
            citation_count: record.citation_count,
            source_url: record.source_url.clone(),
            identifiers: Vec::new(),
            merged_into: None,
            first_seen_at: now,
            updated_at: now,
        };
        for identifier in &record.identifiers {
            publication.add_identifier(identifier.clone());
        }
        publication
    }

    /// Add an identifier; an existing kind+value only ever gains confidence.
    /// Returns whether anything changed.
    pub fn add_identifier(&mut self, identifier: Identifier) -> bool {
        if let Some(existing) = self.identifiers.iter_mut().find(|i| i.same_target(&identifier)) {
            if identifier.confidence > existing.confidence {
                existing.confidence = identifier.confidence;
                existing.source = identifier.source;
                return true;
            }
            return false;
        }
        self.identifiers.push(identifier);
        true
    }

    /// Highest-confidence identifier (earliest wins ties)
    pub fn display_identifier(&self) -> Option<&Identifier> {
        let mut best: Option<&Identifier> = None;
        for identifier in &self.identifiers {
            match best {
                Some(current) if identifier.confidence <= current.confidence => {}
                _ => best = Some(identifier),
            }
        }
        best
    }

    /// Merge newly observed metadata and identifiers. Returns whether anything changed.
    pub fn merge_record(&mut self, record: &PublicationRecord, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if self.cluster_id.is_none() && record.cluster_id.is_some() {
            self.cluster_id = record.cluster_id.clone();
            changed = true;
        }
        if self.venue.is_none() && record.venue.is_some() {
            self.venue = record.venue.clone();
            changed = true;
        }
        if self.year.is_none() && record.year.is_some() {
            self.year = record.year;
            changed = true;
        }
        if self.source_url.is_none() && record.source_url.is_some() {
            self.source_url = record.source_url.clone();
            changed = true;
        }
        if self.authors.is_empty() && !record.authors.is_empty() {
            self.authors = record.authors.clone();
            changed = true;
        }
        if let Some(count) = record.citation_count {
            if self.citation_count.map_or(true, |current| count > current) {
                self.citation_count = Some(count);
                changed = true;
            }
        }
        for identifier in &record.identifiers {
            changed |= self.add_identifier(identifier.clone());
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }
}

/// Fold diacritics, lower-case, strip punctuation and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized surname of an author name ("J. Doe" -> "doe")
pub fn author_key(name: &str) -> String {
    normalize_text(name)
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .to_string()
}

/// Stable content fingerprint of a publication
pub fn fingerprint(title: &str, first_author: Option<&str>, year: Option<i32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(title).as_bytes());
    hasher.update(b"|");
    hasher.update(first_author.map(author_key).unwrap_or_default().as_bytes());
    hasher.update(b"|");
    if let Some(year) = year {
        hasher.update(year.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Distinct normalized tokens of a title
pub fn title_tokens(title: &str) -> HashSet<String> {
    normalize_text(title)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of two titles' token sets (0.0 - 1.0)
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let left = title_tokens(a);
    let right = title_tokens(b);
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count() as f64;
    let union = left.union(&right).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_folds_diacritics() {
        assert_eq!(
            normalize_text("  Über   die  Théorie:  Ein\tÜberblick! "),
            "uber die theorie ein uberblick"
        );
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = fingerprint("Deep Learning for Señales", Some("José García"), Some(2021));
        let b = fingerprint("deep  learning FOR senales.", Some("J. Garcia"), Some(2021));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_year() {
        let a = fingerprint("A Survey", Some("Smith"), Some(2020));
        let b = fingerprint("A Survey", Some("Smith"), Some(2021));
        assert_ne!(a, b);
    }

    #[test]
    fn test_identifier_confidence_only_rises() {
        let now = Utc::now();
        let mut publication = Publication::from_record(&PublicationRecord::new("Title"), now);

        assert!(publication.add_identifier(Identifier::new(IdentifierKind::Doi, "10.1000/ABC", 0.6, "crossref")));
        assert!(!publication.add_identifier(Identifier::new(IdentifierKind::Doi, "https://doi.org/10.1000/abc", 0.5, "crossref")));
        assert!(publication.add_identifier(Identifier::new(IdentifierKind::Doi, "10.1000/abc", 0.95, "profile")));

        assert_eq!(publication.identifiers.len(), 1);
        assert_eq!(publication.identifiers[0].confidence, 0.95);
    }

    #[test]
    fn test_display_identifier_highest_confidence() {
        let now = Utc::now();
        let mut publication = Publication::from_record(&PublicationRecord::new("Title"), now);
        publication.add_identifier(Identifier::new(IdentifierKind::Arxiv, "2101.00001v2", 0.8, "arxiv"));
        publication.add_identifier(Identifier::new(IdentifierKind::Doi, "10.1/x", 0.9, "crossref"));
        publication.add_identifier(Identifier::new(IdentifierKind::Url, "https://x.org/p", 0.9, "profile"));

        let display = publication.display_identifier().unwrap();
        assert_eq!(display.kind, IdentifierKind::Doi);
        assert_eq!(publication.identifiers[0].value, "2101.00001");
    }

    #[test]
    fn test_merge_record_fills_gaps() {
        let now = Utc::now();
        let mut publication =
            Publication::from_record(&PublicationRecord::new("Title").with_authors(&["A. Author"]), now);
        let mut update = PublicationRecord::new("Title").with_year(2019).with_venue("Nature");
        update.citation_count = Some(12);

        assert!(publication.merge_record(&update, now));
        assert_eq!(publication.year, Some(2019));
        assert_eq!(publication.venue.as_deref(), Some("Nature"));
        assert_eq!(publication.citation_count, Some(12));
        assert!(!publication.merge_record(&update, now));
    }

    #[test]
    fn test_token_similarity() {
        assert!((token_similarity("Graph neural networks", "graph Neural Networks!") - 1.0).abs() < 1e-9);
        let partial = token_similarity("graph neural networks survey", "graph neural networks");
        assert!((partial - 0.75).abs() < 1e-9);
        assert_eq!(token_similarity("", ""), 0.0);
    }
}
