//! Profile page parsing
//!
//! Turns a fetched page into publication records plus a [`ParseState`] that
//! tells the iteration engine whether to continue, stop, or back off.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::{debug, warn};

use harvest_core::{extract_identifiers, FetchError, PublicationRecord, SCHOLAR_SERVICE};

use crate::FetchedPage;

/// What a page turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Publication rows were found
    Ok,
    /// A valid profile page with no (further) publications
    NoResults,
    /// A captcha or block page; `rate_limited` when it signals throttling
    BlockedOrCaptcha { rate_limited: bool },
    /// The expected page structure is missing
    LayoutChanged,
    /// Upstream server error
    NetworkError,
}

/// Result of parsing one page
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub records: Vec<PublicationRecord>,
    pub state: ParseState,
    /// Whether the upstream offers another page after this one
    pub has_more: bool,
    pub status: u16,
}

impl ParsedPage {
    fn empty(state: ParseState, status: u16) -> Self {
        Self {
            records: Vec::new(),
            state,
            has_more: false,
            status,
        }
    }

    /// Pages that carry data (or a clean end of feed) pass through; everything
    /// else becomes the matching [`FetchError`].
    pub fn into_result(self) -> Result<ParsedPage, FetchError> {
        match self.state {
            ParseState::Ok | ParseState::NoResults => Ok(self),
            ParseState::BlockedOrCaptcha { rate_limited: true } => Err(FetchError::RateLimited {
                service: SCHOLAR_SERVICE.to_string(),
            }),
            ParseState::BlockedOrCaptcha { rate_limited: false } => Err(
                FetchError::UpstreamBlocked(format!("captcha or block page (HTTP {})", self.status)),
            ),
            ParseState::LayoutChanged => Err(FetchError::LayoutChanged(
                "publication table not found".to_string(),
            )),
            ParseState::NetworkError => Err(FetchError::TransientNetwork(format!(
                "upstream returned HTTP {}",
                self.status
            ))),
        }
    }
}

/// Parses fetched pages into records
pub trait PageParser: Send + Sync {
    fn parse_page(&self, page: &FetchedPage) -> ParsedPage;
}

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("#gsc_a_b").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr.gsc_a_tr").unwrap());
static EMPTY_ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td.gsc_a_e").unwrap());
static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.gsc_a_at").unwrap());
static GRAY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.gs_gray").unwrap());
static YEAR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span.gsc_a_h").unwrap());
static CITED_BY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.gsc_a_ac").unwrap());
static MORE_BUTTON: LazyLock<Selector> = LazyLock::new(|| Selector::parse("#gsc_bpf_more").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

static CITES_PARAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[?&]cites=([0-9,]+)").unwrap());
static CITATION_FOR_VIEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"citation_for_view=([A-Za-z0-9_\-:]+)").unwrap());
static YEAR_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap());

/// Markers of a throttling interstitial
const RATE_LIMIT_MARKERS: &[&str] = &["unusual traffic", "too many requests"];
/// Markers of a captcha or hard block
const BLOCK_MARKERS: &[&str] = &["gs_captcha_f", "recaptcha", "not a robot", "/sorry/index"];

/// Parser for the primary source's profile listing
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilePageParser;

impl ProfilePageParser {
    pub fn new() -> Self {
        Self
    }
}

impl PageParser for ProfilePageParser {
    fn parse_page(&self, page: &FetchedPage) -> ParsedPage {
        match page.status {
            429 => return ParsedPage::empty(ParseState::BlockedOrCaptcha { rate_limited: true }, page.status),
            500..=599 => return ParsedPage::empty(ParseState::NetworkError, page.status),
            _ => {}
        }

        let lowered = page.payload.to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m)) {
            warn!(scholar_id = %page.scholar_id, "Rate-limit interstitial detected");
            return ParsedPage::empty(ParseState::BlockedOrCaptcha { rate_limited: true }, page.status);
        }
        if page.status == 403 || BLOCK_MARKERS.iter().any(|m| lowered.contains(m)) {
            warn!(scholar_id = %page.scholar_id, "Captcha or block page detected");
            return ParsedPage::empty(ParseState::BlockedOrCaptcha { rate_limited: false }, page.status);
        }

        let document = Html::parse_document(&page.payload);
        let Some(table) = document.select(&TABLE).next() else {
            return ParsedPage::empty(ParseState::LayoutChanged, page.status);
        };

        if table.select(&EMPTY_ROW).next().is_some() {
            return ParsedPage::empty(ParseState::NoResults, page.status);
        }

        let records: Vec<PublicationRecord> = table.select(&ROW).filter_map(parse_row).collect();
        if records.is_empty() {
            return ParsedPage::empty(ParseState::NoResults, page.status);
        }

        let has_more = document
            .select(&MORE_BUTTON)
            .next()
            .is_some_and(|button| button.value().attr("disabled").is_none());

        debug!(
            scholar_id = %page.scholar_id,
            cstart = page.cstart,
            records = records.len(),
            has_more,
            "Parsed profile page"
        );

        ParsedPage {
            records,
            state: ParseState::Ok,
            has_more,
            status: page.status,
        }
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_row(row: ElementRef<'_>) -> Option<PublicationRecord> {
    let title_link = row.select(&TITLE).next()?;
    let title = element_text(title_link);
    if title.is_empty() {
        return None;
    }

    let mut record = PublicationRecord::new(&title);
    let title_href = title_link.value().attr("href").unwrap_or_default();

    let mut gray = row.select(&GRAY).map(element_text);
    if let Some(authors) = gray.next() {
        record.authors = authors
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty() && *a != "...")
            .map(str::to_string)
            .collect();
    }
    if let Some(venue) = gray.next().filter(|v| !v.is_empty()) {
        record.venue = Some(venue);
    }

    record.year = row
        .select(&YEAR)
        .next()
        .and_then(|y| element_text(y).parse::<i32>().ok())
        .or_else(|| {
            record
                .venue
                .as_deref()
                .and_then(|v| YEAR_IN_TEXT.find(v))
                .and_then(|m| m.as_str().parse().ok())
        });

    if let Some(cited) = row.select(&CITED_BY).next() {
        record.citation_count = element_text(cited).parse::<u32>().ok();
        if let Some(caps) = cited.value().attr("href").and_then(|h| CITES_PARAM.captures(h)) {
            record.cluster_id = Some(caps[1].to_string());
        }
    }
    if record.cluster_id.is_none() {
        record.cluster_id = CITATION_FOR_VIEW
            .captures(title_href)
            .map(|caps| caps[1].to_string());
    }

    if !title_href.is_empty() {
        record.source_url = Some(title_href.to_string());
    }

    for link in row.select(&LINK) {
        if let Some(href) = link.value().attr("href") {
            for identifier in extract_identifiers(href, "profile") {
                if !record.identifiers.iter().any(|i| i.kind == identifier.kind && i.value == identifier.value) {
                    record.identifiers.push(identifier);
                }
            }
        }
    }

    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::IdentifierKind;

    fn page(status: u16, body: &str) -> FetchedPage {
        FetchedPage::new("scholar-1", 0, 100, status, body.to_string())
    }

    const PROFILE: &str = r#"
        <html><body>
        <table id="gsc_a_t"><tbody id="gsc_a_b">
          <tr class="gsc_a_tr">
            <td class="gsc_a_t">
              <a href="/citations?view_op=view_citation&amp;citation_for_view=XyZ:abc123" class="gsc_a_at">Attention Is All You Need</a>
              <div class="gs_gray">A Vaswani, N Shazeer, N Parmar</div>
              <div class="gs_gray">Advances in neural information processing systems 30, 2017</div>
            </td>
            <td class="gsc_a_c"><a href="https://scholar.google.com/scholar?oi=bibs&amp;hl=en&amp;cites=2960712678066186980" class="gsc_a_ac gs_ibl">120000</a></td>
            <td class="gsc_a_y"><span class="gsc_a_h gsc_a_hc gs_ibl">2017</span></td>
          </tr>
          <tr class="gsc_a_tr">
            <td class="gsc_a_t">
              <a href="/citations?view_op=view_citation&amp;citation_for_view=XyZ:def456" class="gsc_a_at">LoRA: Low-Rank Adaptation</a>
              <div class="gs_gray">EJ Hu, Y Shen</div>
              <div class="gs_gray">arXiv preprint <a href="https://arxiv.org/abs/2106.09685v2">arXiv:2106.09685</a></div>
            </td>
            <td class="gsc_a_c"><a href="" class="gsc_a_ac gs_ibl"></a></td>
            <td class="gsc_a_y"><span class="gsc_a_h gsc_a_hc gs_ibl">2021</span></td>
          </tr>
        </tbody></table>
        <button id="gsc_bpf_more" type="button">Show more</button>
        </body></html>
    "#;

    #[test]
    fn test_parse_rows() {
        let parsed = ProfilePageParser.parse_page(&page(200, PROFILE));
        assert_eq!(parsed.state, ParseState::Ok);
        assert!(parsed.has_more);
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0];
        assert_eq!(first.title, "Attention Is All You Need");
        assert_eq!(first.authors, vec!["A Vaswani", "N Shazeer", "N Parmar"]);
        assert_eq!(first.year, Some(2017));
        assert_eq!(first.citation_count, Some(120000));
        assert_eq!(first.cluster_id.as_deref(), Some("2960712678066186980"));

        let second = &parsed.records[1];
        assert_eq!(second.cluster_id.as_deref(), Some("XyZ:def456"));
        assert_eq!(second.citation_count, None);
        assert!(second
            .identifiers
            .iter()
            .any(|i| i.kind == IdentifierKind::Arxiv && i.value == "2106.09685"));
    }

    #[test]
    fn test_disabled_more_button_ends_feed() {
        let body = PROFILE.replace(r#"type="button">"#, r#"type="button" disabled>"#);
        let parsed = ProfilePageParser.parse_page(&page(200, &body));
        assert_eq!(parsed.state, ParseState::Ok);
        assert!(!parsed.has_more);
    }

    #[test]
    fn test_empty_profile() {
        let body = r#"<table><tbody id="gsc_a_b"><tr><td class="gsc_a_e">There are no articles in this profile.</td></tr></tbody></table>"#;
        let parsed = ProfilePageParser.parse_page(&page(200, body));
        assert_eq!(parsed.state, ParseState::NoResults);
        assert!(parsed.clone().into_result().is_ok());
    }

    #[test]
    fn test_layout_changed() {
        let parsed = ProfilePageParser.parse_page(&page(200, "<html><body><div>new design</div></body></html>"));
        assert_eq!(parsed.state, ParseState::LayoutChanged);
        assert!(matches!(parsed.into_result(), Err(FetchError::LayoutChanged(_))));
    }

    #[test]
    fn test_captcha_detection() {
        let blocked = ProfilePageParser.parse_page(&page(200, r#"<form id="gs_captcha_f"></form>"#));
        assert_eq!(blocked.state, ParseState::BlockedOrCaptcha { rate_limited: false });
        assert!(matches!(blocked.into_result(), Err(FetchError::UpstreamBlocked(_))));

        let throttled = ProfilePageParser.parse_page(&page(
            200,
            "Our systems have detected unusual traffic from your computer network.",
        ));
        assert_eq!(throttled.state, ParseState::BlockedOrCaptcha { rate_limited: true });
        assert!(matches!(throttled.into_result(), Err(FetchError::RateLimited { .. })));
    }

    #[test]
    fn test_status_mapping() {
        let limited = ProfilePageParser.parse_page(&page(429, ""));
        assert!(matches!(limited.into_result(), Err(FetchError::RateLimited { .. })));

        let server = ProfilePageParser.parse_page(&page(503, ""));
        assert_eq!(server.state, ParseState::NetworkError);
        assert!(matches!(server.into_result(), Err(FetchError::TransientNetwork(_))));
    }
}
