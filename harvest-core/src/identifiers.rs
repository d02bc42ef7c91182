//! Identifier extraction from scraped links and text
//!
//! Profile rows and lookup responses frequently embed a DOI or an arXiv id in a
//! link. Extracting them at parse time lets the enrichment stage skip lookups
//! for publications that already carry strong evidence.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::{Identifier, IdentifierKind};

static DOI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b10\.\d{4,9}/[^\s"'<>&?#]+"#).unwrap()
});

static ARXIV_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"arxiv\.org/(?:abs|pdf)/(\d{4}\.\d{4,5}(?:v\d+)?)").unwrap()
});

static ARXIV_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\barxiv:\s*(\d{4}\.\d{4,5}(?:v\d+)?)").unwrap()
});

static PMID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:pubmed\.ncbi\.nlm\.nih\.gov/|PMID:\s*)(\d{5,9})").unwrap()
});

/// Confidence of an identifier found verbatim in upstream content
const EMBEDDED_CONFIDENCE: f64 = 0.95;

fn try_add_identifier(
    found: &mut Vec<Identifier>,
    seen: &mut HashSet<String>,
    kind: IdentifierKind,
    value: &str,
    source: &str,
) {
    let identifier = Identifier::new(kind, value, EMBEDDED_CONFIDENCE, source);
    let key = format!("{:?}:{}", identifier.kind, identifier.value);
    if seen.insert(key) {
        found.push(identifier);
    }
}

/// Extract DOIs, arXiv ids and PubMed ids from text or a URL
pub fn extract_identifiers(text: &str, source: &str) -> Vec<Identifier> {
    let mut found = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for cap in DOI_REGEX.find_iter(text) {
        try_add_identifier(&mut found, &mut seen, IdentifierKind::Doi, cap.as_str(), source);
    }

    for caps in ARXIV_URL_REGEX.captures_iter(text).chain(ARXIV_TAG_REGEX.captures_iter(text)) {
        if let Some(id) = caps.get(1) {
            try_add_identifier(&mut found, &mut seen, IdentifierKind::Arxiv, id.as_str(), source);
        }
    }

    for caps in PMID_REGEX.captures_iter(text) {
        if let Some(id) = caps.get(1) {
            try_add_identifier(&mut found, &mut seen, IdentifierKind::Pmid, id.as_str(), source);
        }
    }

    found
}
