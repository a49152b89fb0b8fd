//! Federal Reserve publications: listing pages scanned for document links.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use regex::Regex;
use scrapesync_core::ScrapedCandidate;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::{collapse_whitespace, truncate_chars, PageFetcher, SourceError, SourceKind, SourceScraper};

const DEFAULT_BASE_URL: &str = "https://www.federalreserve.gov";

const CONTENT_SELECTORS: [&str; 6] = ["#content", "main", "article", "div.content", "#article", "body"];

const SKIPPED_TAGS: [&str; 5] = ["script", "style", "nav", "header", "footer"];

const FED_TERMS: [&str; 11] = [
    "federal reserve",
    "fomc",
    "monetary policy",
    "interest rate",
    "economic outlook",
    "inflation",
    "employment",
    "federal funds",
    "committee",
    "board of governors",
    "financial stability",
];

static URL_DATE_8: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{8})").expect("valid regex"));
static URL_DATE_6: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{6})").expect("valid regex"));
static TITLE_MONTH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(?:\d{1,2}\s*[-–]\s*)?(\d{1,2}),?\s+(\d{4})",
    )
    .expect("valid regex")
});
static TITLE_SLASH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("valid regex"));
static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)Skip to main content.*?Menu",
        r"(?im)^Board of Governors of the Federal Reserve System$",
        r"(?is)Back to Home.*?flexible",
        r"(?is)Main Menu.*?Search",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

/// One listing page and the href pattern of the documents it links to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FedListing {
    pub name: String,
    pub url: String,
    pub doc_type: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FedReserveSettings {
    pub listings: Vec<FedListing>,
    pub max_links_per_listing: usize,
    pub min_title_chars: usize,
    pub min_content_chars: usize,
    pub max_content_chars: usize,
    pub min_fed_terms: usize,
}

impl Default for FedReserveSettings {
    fn default() -> Self {
        Self {
            listings: default_listings(Utc::now().year()),
            max_links_per_listing: 20,
            min_title_chars: 6,
            min_content_chars: 200,
            max_content_chars: 15_000,
            min_fed_terms: 2,
        }
    }
}

pub fn default_listings(year: i32) -> Vec<FedListing> {
    let listing = |name: &str, path: String, doc_type: &str, pattern: &str| FedListing {
        name: name.to_string(),
        url: format!("{DEFAULT_BASE_URL}{path}"),
        doc_type: doc_type.to_string(),
        pattern: pattern.to_string(),
    };
    vec![
        listing(
            "fomc_minutes",
            "/monetarypolicy/fomccalendars.htm".into(),
            "FOMC Minutes",
            r"/monetarypolicy/fomcminutes\d+\.htm",
        ),
        listing(
            "fomc_statements",
            "/monetarypolicy/fomccalendars.htm".into(),
            "FOMC Statement",
            r"/newsevents/pressreleases/monetary\d+[a-z]?\.htm",
        ),
        listing(
            "press_releases",
            format!("/newsevents/pressreleases/{year}-press.htm"),
            "Press Release",
            r"/newsevents/pressreleases/\w+\d+[a-z]?\.htm",
        ),
        listing(
            "speeches",
            format!("/newsevents/speech/{year}-speeches.htm"),
            "Speech",
            r"/newsevents/speech/\w+\d+[a-z]?\.htm",
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentLink {
    pub url: String,
    pub title: String,
}

/// Anchors on a listing page whose href matches `pattern`, resolved against `base_url`.
pub fn extract_document_links(
    html: &str,
    base_url: &str,
    pattern: &Regex,
    min_title_chars: usize,
    limit: usize,
) -> Vec<DocumentLink> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Ok(anchors) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !pattern.is_match(href) {
            continue;
        }
        let Ok(resolved) = base.join(href.trim()) else {
            continue;
        };
        let title = collapse_whitespace(&anchor.text().collect::<String>());
        if title.chars().count() < min_title_chars {
            continue;
        }
        let url = resolved.to_string();
        if seen.insert(url.clone()) {
            links.push(DocumentLink { url, title });
        }
        if links.len() >= limit {
            break;
        }
    }
    links
}

/// Publication date from the URL (`YYYYMMDD`, then `YYMMDD`) or the link title.
pub fn extract_date(url: &str, title: &str) -> Option<DateTime<Utc>> {
    date_from_url(url)
        .or_else(|| date_from_title(title))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn date_from_url(url: &str) -> Option<NaiveDate> {
    if let Some(found) = URL_DATE_8.captures(url).and_then(|c| c.get(1)) {
        if let Ok(date) = NaiveDate::parse_from_str(found.as_str(), "%Y%m%d") {
            return Some(date);
        }
    }
    let digits = URL_DATE_6.captures(url)?.get(1)?.as_str();
    let year: i32 = digits.get(0..2)?.parse().ok()?;
    let month: u32 = digits.get(2..4)?.parse().ok()?;
    let day: u32 = digits.get(4..6)?.parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
}

fn date_from_title(title: &str) -> Option<NaiveDate> {
    if let Some(caps) = TITLE_MONTH_DATE.captures(title) {
        let month = month_number(&caps[1])?;
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    let caps = TITLE_SLASH_DATE.captures(title)?;
    let month: u32 = caps[1].parse().ok()?;
    let day: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
}

/// Main text of a document page with scripts, styles and navigation removed.
pub fn extract_main_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();
    for selector in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(selector) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let mut lines = Vec::new();
            collect_text(element, &mut lines);
            text = lines.join("\n");
            if !text.is_empty() {
                break;
            }
        }
    }
    for pattern in BOILERPLATE.iter() {
        text = pattern.replace_all(&text, "").into_owned();
    }
    truncate_chars(text.trim(), max_chars)
}

fn collect_text(element: ElementRef<'_>, lines: &mut Vec<String>) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            let line = collapse_whitespace(text);
            if !line.is_empty() {
                lines.push(line);
            }
        } else if let Some(child) = ElementRef::wrap(child) {
            if !SKIPPED_TAGS.contains(&child.value().name()) {
                collect_text(child, lines);
            }
        }
    }
}

pub fn count_fed_terms(text: &str) -> usize {
    let lower = text.to_lowercase();
    FED_TERMS.iter().filter(|term| lower.contains(*term)).count()
}

pub struct FedReserveScraper {
    source_id: String,
    settings: FedReserveSettings,
    patterns: Vec<Regex>,
    fetcher: Arc<dyn PageFetcher>,
}

impl std::fmt::Debug for FedReserveScraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FedReserveScraper")
            .field("source_id", &self.source_id)
            .field("listings", &self.settings.listings.len())
            .finish()
    }
}

impl FedReserveScraper {
    pub fn new(
        source_id: &str,
        settings: FedReserveSettings,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<Self, SourceError> {
        let patterns = settings
            .listings
            .iter()
            .map(|listing| {
                Regex::new(&listing.pattern).map_err(|err| SourceError::InvalidSettings {
                    source_id: source_id.to_string(),
                    message: format!("listing {}: {err}", listing.name),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source_id: source_id.to_string(),
            settings,
            patterns,
            fetcher,
        })
    }

    async fn fetch_document(
        &self,
        listing: &FedListing,
        link: &DocumentLink,
        published: Option<DateTime<Utc>>,
    ) -> Result<Option<ScrapedCandidate>, SourceError> {
        let html = self
            .fetcher
            .fetch_text(&self.source_id, &link.url)
            .await
            .map_err(|err| SourceError::Item {
                item: link.url.clone(),
                message: err.to_string(),
            })?;
        let content = extract_main_text(&html, self.settings.max_content_chars);
        if content.chars().count() < self.settings.min_content_chars {
            debug!(url = %link.url, "document too short");
            return Ok(None);
        }
        let terms = count_fed_terms(&content);
        if terms < self.settings.min_fed_terms {
            debug!(url = %link.url, terms, "document not relevant");
            return Ok(None);
        }

        let candidate = ScrapedCandidate::new(
            &self.source_id,
            None,
            link.title.clone(),
            content,
            link.url.clone(),
            published.unwrap_or_else(Utc::now),
        )
        .with_metadata("doc_type", listing.doc_type.as_str())
        .with_metadata("listing", listing.name.as_str())
        .with_metadata("content_type", "fed_document")
        .with_metadata("date_inferred", published.is_none())
        .with_metadata("fed_terms", terms);
        Ok(Some(candidate))
    }
}

#[async_trait]
impl SourceScraper for FedReserveScraper {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::FedReserve
    }

    async fn fetch_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScrapedCandidate>, SourceError> {
        let mut candidates = Vec::new();
        let mut visited = HashSet::new();
        let mut reachable = 0usize;
        let mut last_error = None;

        for (listing, pattern) in self.settings.listings.iter().zip(&self.patterns) {
            let span = info_span!("fed_listing", listing = %listing.name);
            let html = match self
                .fetcher
                .fetch_text(&self.source_id, &listing.url)
                .instrument(span.clone())
                .await
            {
                Ok(html) => html,
                Err(err) => {
                    warn!(listing = %listing.name, error = %err, "listing page failed");
                    last_error = Some(err.to_string());
                    continue;
                }
            };
            reachable += 1;

            let links = extract_document_links(
                &html,
                &listing.url,
                pattern,
                self.settings.min_title_chars,
                self.settings.max_links_per_listing,
            );
            debug!(listing = %listing.name, links = links.len(), "document links found");

            let mut found = 0usize;
            for link in links {
                if !visited.insert(link.url.clone()) {
                    continue;
                }
                let published = extract_date(&link.url, &link.title);
                if published.is_some_and(|date| date.date_naive() < cutoff.date_naive()) {
                    continue;
                }
                match self
                    .fetch_document(listing, &link, published)
                    .instrument(span.clone())
                    .await
                {
                    Ok(Some(candidate)) => {
                        found += 1;
                        candidates.push(candidate);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "skipping document"),
                }
            }
            info!(listing = %listing.name, found, "listing scanned");
        }

        if reachable == 0 && !self.settings.listings.is_empty() {
            return Err(SourceError::unreachable(
                &self.source_id,
                last_error.unwrap_or_else(|| "no listing page reachable".into()),
            ));
        }

        candidates.sort_by(|a, b| b.published_date.cmp(&a.published_date));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFetcher;
    use chrono::TimeZone;

    const LISTING_URL: &str = "https://www.federalreserve.gov/newsevents/speech/2026-speeches.htm";

    const LISTING_HTML: &str = r#"
        <html><body>
          <a href="/newsevents/speech/powell20260301a.htm">Chair Powell on the economic outlook</a>
          <a href="https://www.federalreserve.gov/newsevents/speech/waller20251103a.htm">Governor Waller on payments</a>
          <a href="/newsevents/speech/cook20260210a.htm">More</a>
          <a href="/newsevents/speech/powell20260301a.htm">Chair Powell on the economic outlook</a>
          <a href="/aboutthefed.htm">About the Fed</a>
        </body></html>"#;

    fn document_html(body: &str) -> String {
        format!(
            r#"<html><head><style>.x {{ color: red }}</style><script>var tracking = 1;</script></head>
               <body><nav>Main navigation Federal Reserve links</nav>
               <div id="content"><h3>Speech</h3><p>{body}</p><script>alert("x")</script></div>
               <footer>Federal Reserve footer</footer></body></html>"#
        )
    }

    fn relevant_body() -> String {
        "The Federal Open Market Committee discussed monetary policy and the path of inflation. \
         Participants noted that employment remained strong and that the federal funds rate \
         would be adjusted as needed to keep inflation on course toward two percent over time."
            .repeat(2)
    }

    fn speeches_only() -> FedReserveSettings {
        FedReserveSettings {
            listings: vec![FedListing {
                name: "speeches".into(),
                url: LISTING_URL.into(),
                doc_type: "Speech".into(),
                pattern: r"/newsevents/speech/\w+\d+[a-z]?\.htm".into(),
            }],
            ..FedReserveSettings::default()
        }
    }

    #[test]
    fn links_are_resolved_filtered_and_deduplicated() {
        let pattern = Regex::new(r"/newsevents/speech/\w+\d+[a-z]?\.htm").unwrap();
        let links = extract_document_links(LISTING_HTML, LISTING_URL, &pattern, 6, 20);
        let urls: Vec<_> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.federalreserve.gov/newsevents/speech/powell20260301a.htm",
                "https://www.federalreserve.gov/newsevents/speech/waller20251103a.htm",
            ]
        );
        assert_eq!(links[0].title, "Chair Powell on the economic outlook");

        let capped = extract_document_links(LISTING_HTML, LISTING_URL, &pattern, 6, 1);
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn dates_come_from_url_then_title() {
        let midnight = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single();
        assert_eq!(extract_date("/fomcminutes20250507.htm", ""), midnight(2025, 5, 7));
        assert_eq!(extract_date("/monetary250129a.htm", ""), midnight(2025, 1, 29));
        assert_eq!(extract_date("/x.htm", "Meeting of May 6-7, 2025"), midnight(2025, 5, 7));
        assert_eq!(extract_date("/x.htm", "Released June 18, 2025"), midnight(2025, 6, 18));
        assert_eq!(extract_date("/x.htm", "Posted 5/7/2025"), midnight(2025, 5, 7));
        assert_eq!(extract_date("/x.htm", "Undated remarks"), None);
    }

    #[test]
    fn main_text_drops_scripts_navigation_and_is_truncated() {
        let text = extract_main_text(&document_html("Inflation   remains\n elevated."), 15_000);
        assert!(text.contains("Inflation remains elevated."));
        assert!(!text.contains("alert"));
        assert!(!text.contains("navigation"));
        assert!(!text.contains("footer"));

        let short = extract_main_text(&document_html(&"a".repeat(100)), 10);
        assert_eq!(short.chars().count(), 10);
    }

    #[test]
    fn main_text_falls_back_to_body() {
        let text = extract_main_text("<html><body><p>Plain page</p><script>x()</script></body></html>", 100);
        assert_eq!(text, "Plain page");
    }

    #[test]
    fn fed_terms_are_counted_once_each() {
        assert_eq!(count_fed_terms("Inflation, inflation and the FOMC"), 2);
        assert_eq!(count_fed_terms("weather report"), 0);
    }

    #[tokio::test]
    async fn fetch_since_keeps_recent_relevant_documents() {
        let fetcher = StaticFetcher::default()
            .with(LISTING_URL, LISTING_HTML)
            .with(
                "https://www.federalreserve.gov/newsevents/speech/powell20260301a.htm",
                &document_html(&relevant_body()),
            )
            .with(
                "https://www.federalreserve.gov/newsevents/speech/waller20251103a.htm",
                &document_html(&relevant_body()),
            );
        let scraper = FedReserveScraper::new("fed_reserve", speeches_only(), Arc::new(fetcher)).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();

        let candidates = scraper.fetch_since(cutoff).await.unwrap();
        assert_eq!(candidates.len(), 1);
        let speech = &candidates[0];
        assert!(speech.id.starts_with(scrapesync_core::SYNTHESIZED_ID_PREFIX));
        assert_eq!(speech.source, "fed_reserve");
        assert_eq!(speech.published_date, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap());
        assert_eq!(speech.metadata["doc_type"], "Speech");
        assert_eq!(speech.metadata["date_inferred"], false);
    }

    #[tokio::test]
    async fn irrelevant_or_failing_documents_are_skipped() {
        let fetcher = StaticFetcher::default().with(LISTING_URL, LISTING_HTML).with(
            "https://www.federalreserve.gov/newsevents/speech/powell20260301a.htm",
            &document_html(&"Sports scores and the weather forecast for the weekend. ".repeat(10)),
        );
        let scraper = FedReserveScraper::new("fed_reserve", speeches_only(), Arc::new(fetcher)).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();

        assert!(scraper.fetch_since(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_when_every_listing_fails() {
        let scraper =
            FedReserveScraper::new("fed_reserve", speeches_only(), Arc::new(StaticFetcher::default())).unwrap();
        let err = scraper.fetch_since(Utc::now()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unreachable { .. }));
    }
}
