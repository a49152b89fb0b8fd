//! Subreddit listings through the public `.json` endpoints.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scrapesync_core::{content_hash, ScrapedCandidate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{truncate_chars, PageFetcher, SourceError, SourceKind, SourceScraper};

const FLAIR_BONUSES: [(&str, f64); 6] = [
    ("dd", 50.0),
    ("discussion", 20.0),
    ("technical analysis", 30.0),
    ("fundamentals", 25.0),
    ("news", 15.0),
    ("earnings thread", 20.0),
];
const HIGH_VALUE_KEYWORDS: [&str; 5] = ["fed", "powell", "earnings", "rate", "inflation"];
const MEDIUM_VALUE_KEYWORDS: [&str; 5] = ["options", "calls", "puts", "volatility", "analysis"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditSettings {
    pub subreddit: String,
    pub base_url: String,
    pub id_prefix: String,
    pub sort_methods: Vec<String>,
    pub limit: u32,
    pub min_upvotes: i64,
    pub min_comments: i64,
    pub relevant_flairs: Vec<String>,
    pub trading_keywords: Vec<String>,
    pub min_keyword_matches: usize,
    pub spam_indicators: Vec<String>,
    pub max_spam_indicators: usize,
    pub min_title_words: usize,
    pub pause_between_sorts_ms: u64,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for RedditSettings {
    fn default() -> Self {
        Self {
            subreddit: "wallstreetbets".into(),
            base_url: "https://www.reddit.com".into(),
            id_prefix: "wsb".into(),
            sort_methods: strings(&["hot", "new", "rising"]),
            limit: 100,
            min_upvotes: 100,
            min_comments: 10,
            relevant_flairs: strings(&[
                "DD",
                "Discussion",
                "News",
                "Earnings Thread",
                "Technical Analysis",
                "Fundamentals",
                "Loss",
                "Gain",
            ]),
            trading_keywords: strings(&[
                "earnings", "fed", "powell", "rate", "inflation", "gdp", "yolo", "calls", "puts",
                "options", "strike", "expiry", "bull", "bear", "moon", "rocket", "diamond", "hands",
                "squeeze", "short", "gamma", "volatility",
            ]),
            min_keyword_matches: 2,
            spam_indicators: strings(&[
                "subscribe", "follow me", "join my", "discord", "telegram", "crypto", "bitcoin",
                "ethereum", "coin", "nft",
            ]),
            max_spam_indicators: 2,
            min_title_words: 3,
            pause_between_sorts_ms: 1_000,
        }
    }
}

fn deleted_author() -> String {
    "[deleted]".into()
}

/// The fields of a listing child's `data` object that the filter and content use.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedditPost {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default = "deleted_author")]
    pub author: String,
    #[serde(default)]
    pub subreddit: String,
    pub created_utc: f64,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub downs: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub upvote_ratio: f64,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub permalink: String,
}

impl RedditPost {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_utc.trunc() as i64, 0)
    }

    pub fn flair(&self) -> &str {
        self.link_flair_text.as_deref().unwrap_or("")
    }

    fn full_text(&self) -> String {
        format!("{} {}", self.title, self.selftext).to_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    data: JsonValue,
}

/// Decodes a listing body. Children that do not decode as posts are skipped.
pub fn parse_listing(body: &str) -> Result<Vec<RedditPost>, serde_json::Error> {
    let listing: Listing = serde_json::from_str(body)?;
    Ok(listing
        .data
        .children
        .into_iter()
        .filter_map(|child| match serde_json::from_value::<RedditPost>(child.data) {
            Ok(post) => Some(post),
            Err(err) => {
                debug!(error = %err, "skipping undecodable post");
                None
            }
        })
        .collect())
}

pub fn is_relevant(post: &RedditPost, settings: &RedditSettings) -> bool {
    if post.ups < settings.min_upvotes || post.num_comments < settings.min_comments {
        return false;
    }

    let flair = post.flair().to_lowercase();
    if !settings.relevant_flairs.is_empty()
        && !flair.is_empty()
        && !settings
            .relevant_flairs
            .iter()
            .any(|allowed| flair.contains(&allowed.to_lowercase()))
    {
        return false;
    }

    let text = post.full_text();
    let keyword_matches = settings
        .trading_keywords
        .iter()
        .filter(|keyword| text.contains(&keyword.to_lowercase()))
        .count();
    if keyword_matches < settings.min_keyword_matches {
        return false;
    }

    let spam = settings
        .spam_indicators
        .iter()
        .filter(|indicator| text.contains(&indicator.to_lowercase()))
        .count();
    if spam > settings.max_spam_indicators {
        return false;
    }

    let title_words = post
        .title
        .split_whitespace()
        .filter(|word| word.chars().count() > 2 && word.chars().all(char::is_alphabetic))
        .count();
    title_words >= settings.min_title_words
}

pub fn relevance_score(post: &RedditPost) -> f64 {
    let mut score = post.ups as f64 * 0.1 + post.num_comments as f64 * 0.5;

    let flair = post.flair().to_lowercase();
    if !flair.is_empty() {
        if let Some((_, bonus)) = FLAIR_BONUSES.iter().find(|(name, _)| flair.contains(name)) {
            score += bonus;
        }
    }

    let text = post.full_text();
    score += 10.0 * HIGH_VALUE_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as f64;
    score += 5.0 * MEDIUM_VALUE_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as f64;

    if post.title.split_whitespace().count() > 5 {
        score += 5.0;
    }
    score
}

/// Change fingerprint over what the author wrote. Vote and comment counts are
/// left out so engagement alone never marks a stored post as changed.
pub fn post_fingerprint(post: &RedditPost) -> String {
    content_hash(&format!("{}\n{}\n{}", post.title, post.flair(), post.selftext))
}

/// Structured text stored as the record's raw content.
pub fn build_post_content(post: &RedditPost, fallback_subreddit: &str) -> String {
    let subreddit = if post.subreddit.is_empty() {
        fallback_subreddit
    } else {
        post.subreddit.as_str()
    };
    let mut parts = vec![
        format!("Title: {}", post.title),
        format!("Author: u/{}", post.author),
        format!("Subreddit: r/{subreddit}"),
    ];
    if let Some(flair) = post.link_flair_text.as_deref().filter(|f| !f.is_empty()) {
        parts.push(format!("Flair: {flair}"));
    }
    parts.push(format!("Upvotes: {}", post.ups));
    parts.push(format!("Comments: {}", post.num_comments));
    parts.push(format!("Upvote Ratio: {:.2}", post.upvote_ratio));
    if !post.selftext.trim().is_empty() {
        parts.push(format!("\nContent:\n{}", truncate_chars(&post.selftext, 2_000)));
    }
    if !post.permalink.is_empty() {
        parts.push(format!("\nReddit URL: https://reddit.com{}", post.permalink));
    }
    if let Some(created) = post.created_at().filter(|_| post.created_utc > 0.0) {
        parts.push(format!("Posted: {}", created.format("%Y-%m-%d %H:%M UTC")));
    }
    parts.join("\n")
}

pub struct RedditScraper {
    source_id: String,
    settings: RedditSettings,
    fetcher: Arc<dyn PageFetcher>,
}

impl std::fmt::Debug for RedditScraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditScraper")
            .field("source_id", &self.source_id)
            .field("subreddit", &self.settings.subreddit)
            .finish()
    }
}

impl RedditScraper {
    pub fn new(source_id: &str, settings: RedditSettings, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            source_id: source_id.to_string(),
            settings,
            fetcher,
        }
    }

    pub fn listing_url(&self, sort_method: &str) -> String {
        format!(
            "{}/r/{}/{}.json?limit={}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.subreddit,
            sort_method,
            self.settings.limit
        )
    }

    fn to_candidate(&self, post: &RedditPost, cutoff: DateTime<Utc>, sort_method: &str) -> Option<ScrapedCandidate> {
        if post.id.is_empty() {
            return None;
        }
        let published = post.created_at()?;
        if published < cutoff || !is_relevant(post, &self.settings) {
            return None;
        }

        let content = build_post_content(post, &self.settings.subreddit);
        let external_id = format!("{}_{}", self.settings.id_prefix, post.id);
        let mut candidate = ScrapedCandidate::new(
            &self.source_id,
            Some(&external_id),
            truncate_chars(&post.title, 200),
            content,
            format!("https://reddit.com{}", post.permalink),
            published,
        )
        .with_metadata("author", post.author.as_str())
        .with_metadata("subreddit", post.subreddit.as_str())
        .with_metadata("flair", post.flair())
        .with_metadata("upvotes", post.ups)
        .with_metadata("downvotes", post.downs)
        .with_metadata("num_comments", post.num_comments)
        .with_metadata("score", post.score)
        .with_metadata("upvote_ratio", post.upvote_ratio)
        .with_metadata("relevance_score", relevance_score(post))
        .with_metadata("content_type", "reddit_post")
        .with_metadata("sort_method", sort_method);
        candidate.content_hash = post_fingerprint(post);
        Some(candidate)
    }
}

fn relevance_of(candidate: &ScrapedCandidate) -> f64 {
    candidate
        .metadata
        .get("relevance_score")
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0)
}

#[async_trait]
impl SourceScraper for RedditScraper {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Reddit
    }

    async fn fetch_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScrapedCandidate>, SourceError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut reachable = 0usize;
        let mut last_error = None;

        for (idx, sort_method) in self.settings.sort_methods.iter().enumerate() {
            if idx > 0 && self.settings.pause_between_sorts_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.settings.pause_between_sorts_ms)).await;
            }

            let url = self.listing_url(sort_method);
            let posts = match self.fetcher.fetch_text(&self.source_id, &url).await {
                Ok(body) => match parse_listing(&body) {
                    Ok(posts) => posts,
                    Err(err) => {
                        warn!(sort_method = %sort_method, error = %err, "unexpected listing payload");
                        last_error = Some(format!("{sort_method}: {err}"));
                        continue;
                    }
                },
                Err(err) => {
                    warn!(sort_method = %sort_method, error = %err, "listing request failed");
                    last_error = Some(format!("{sort_method}: {err}"));
                    continue;
                }
            };
            reachable += 1;

            let mut relevant = 0usize;
            for post in &posts {
                if let Some(candidate) = self.to_candidate(post, cutoff, sort_method) {
                    if seen.insert(candidate.id.clone()) {
                        relevant += 1;
                        candidates.push(candidate);
                    }
                }
            }
            info!(sort_method = %sort_method, posts = posts.len(), relevant, "listing scanned");
        }

        if reachable == 0 && !self.settings.sort_methods.is_empty() {
            return Err(SourceError::unreachable(
                &self.source_id,
                last_error.unwrap_or_else(|| "no listing reachable".into()),
            ));
        }

        candidates.sort_by(|a, b| relevance_of(b).total_cmp(&relevance_of(a)));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFetcher;
    use serde_json::json;

    fn post(id: &str, title: &str, body: &str, flair: Option<&str>) -> JsonValue {
        json!({
            "id": id,
            "title": title,
            "selftext": body,
            "author": "trader42",
            "subreddit": "wallstreetbets",
            "created_utc": 1_772_445_600.0,
            "ups": 1500,
            "downs": 0,
            "num_comments": 240,
            "score": 1500,
            "upvote_ratio": 0.93,
            "link_flair_text": flair,
            "permalink": format!("/r/wallstreetbets/comments/{id}/x/"),
        })
    }

    fn listing(children: Vec<JsonValue>) -> String {
        let children: Vec<_> = children.into_iter().map(|data| json!({"kind": "t3", "data": data})).collect();
        json!({"kind": "Listing", "data": {"children": children}}).to_string()
    }

    fn decoded(value: JsonValue) -> RedditPost {
        serde_json::from_value(value).unwrap()
    }

    fn settings() -> RedditSettings {
        RedditSettings {
            pause_between_sorts_ms: 0,
            ..RedditSettings::default()
        }
    }

    const GOOD_TITLE: &str = "Powell signals rate cuts ahead of earnings season";
    const GOOD_BODY: &str = "Loading up on calls before the fed meeting, inflation data looks soft.";

    #[test]
    fn relevant_post_passes_every_filter() {
        let p = decoded(post("a1", GOOD_TITLE, GOOD_BODY, Some("DD")));
        assert!(is_relevant(&p, &settings()));
    }

    #[test]
    fn low_engagement_and_foreign_flairs_are_rejected() {
        let mut p = decoded(post("a1", GOOD_TITLE, GOOD_BODY, Some("DD")));
        p.ups = 99;
        assert!(!is_relevant(&p, &settings()));

        let meme = decoded(post("a2", GOOD_TITLE, GOOD_BODY, Some("Meme")));
        assert!(!is_relevant(&meme, &settings()));

        let no_flair = decoded(post("a3", GOOD_TITLE, GOOD_BODY, None));
        assert!(is_relevant(&no_flair, &settings()));
    }

    #[test]
    fn keyword_spam_and_title_quality_filters() {
        let few_keywords = decoded(post("b1", "Thoughts about this company today", "nothing", None));
        assert!(!is_relevant(&few_keywords, &settings()));

        let spammy = decoded(post(
            "b2",
            GOOD_TITLE,
            "calls on crypto, bitcoin and ethereum, join my discord",
            None,
        ));
        assert!(!is_relevant(&spammy, &settings()));

        let emoji_title = decoded(post("b3", "🚀🚀 TSLA 🚀🚀 to the 🌙", GOOD_BODY, None));
        assert!(!is_relevant(&emoji_title, &settings()));
    }

    #[test]
    fn score_adds_engagement_flair_and_keywords() {
        let p = decoded(post("c1", GOOD_TITLE, GOOD_BODY, Some("DD")));
        // 150 + 120 engagement, 50 flair, fed/powell/earnings/rate/inflation, calls, long title
        let expected = 150.0 + 120.0 + 50.0 + 50.0 + 5.0 + 5.0;
        assert!((relevance_score(&p) - expected).abs() < 1e-9);
    }

    #[test]
    fn post_content_is_structured() {
        let p = decoded(post("d1", GOOD_TITLE, GOOD_BODY, Some("DD")));
        let content = build_post_content(&p, "wallstreetbets");
        assert!(content.starts_with(&format!("Title: {GOOD_TITLE}\nAuthor: u/trader42")));
        assert!(content.contains("Flair: DD"));
        assert!(content.contains("Upvote Ratio: 0.93"));
        assert!(content.contains(&format!("\nContent:\n{GOOD_BODY}")));
        assert!(content.contains("Reddit URL: https://reddit.com/r/wallstreetbets/comments/d1/x/"));
        assert!(content.ends_with("Posted: 2026-03-02 10:00 UTC"));
    }

    #[test]
    fn undecodable_children_are_skipped() {
        let body = listing(vec![post("e1", GOOD_TITLE, GOOD_BODY, None), json!({"title": "no id"})]);
        let posts = parse_listing(&body).unwrap();
        assert_eq!(posts.len(), 1);
        assert!(parse_listing("<html>blocked</html>").is_err());
    }

    #[test]
    fn engagement_changes_keep_the_fingerprint() {
        let scraper = RedditScraper::new("reddit_wsb", settings(), Arc::new(StaticFetcher::default()));
        let cutoff = DateTime::<Utc>::MIN_UTC;
        let fresh = decoded(post("e1", GOOD_TITLE, GOOD_BODY, Some("DD")));
        let mut popular = fresh.clone();
        popular.ups += 900;
        popular.num_comments += 75;

        let before = scraper.to_candidate(&fresh, cutoff, "hot").unwrap();
        let after = scraper.to_candidate(&popular, cutoff, "hot").unwrap();
        assert_ne!(before.content, after.content, "stored text still shows the counts");
        assert_eq!(before.content_hash, after.content_hash);

        let mut edited = fresh.clone();
        edited.selftext.push_str(" Edit: closed the position.");
        let edited = scraper.to_candidate(&edited, cutoff, "hot").unwrap();
        assert_ne!(before.content_hash, edited.content_hash);
    }

    #[tokio::test]
    async fn sorts_are_merged_without_duplicates() {
        let scraper_settings = settings();
        let urls = RedditScraper::new("reddit_wsb", scraper_settings.clone(), Arc::new(StaticFetcher::default()));
        let shared = post("f1", GOOD_TITLE, GOOD_BODY, Some("DD"));
        let fetcher = StaticFetcher::default()
            .with(&urls.listing_url("hot"), &listing(vec![shared.clone()]))
            .with(
                &urls.listing_url("new"),
                &listing(vec![shared, post("f2", GOOD_TITLE, GOOD_BODY, Some("News"))]),
            );
        let scraper = RedditScraper::new("reddit_wsb", scraper_settings, Arc::new(fetcher));

        let cutoff = DateTime::from_timestamp(1_772_000_000, 0).unwrap();
        let candidates = scraper.fetch_since(cutoff).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["wsb_f1", "wsb_f2"]);
        assert_eq!(candidates[0].metadata["sort_method"], "hot");
        assert_eq!(candidates[0].url, "https://reddit.com/r/wallstreetbets/comments/f1/x/");
    }

    #[tokio::test]
    async fn posts_older_than_cutoff_are_dropped() {
        let urls = RedditScraper::new("reddit_wsb", settings(), Arc::new(StaticFetcher::default()));
        let fetcher = StaticFetcher::default().with(
            &urls.listing_url("hot"),
            &listing(vec![post("g1", GOOD_TITLE, GOOD_BODY, None)]),
        );
        let scraper = RedditScraper::new("reddit_wsb", settings(), Arc::new(fetcher));
        let cutoff = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        assert!(scraper.fetch_since(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_when_every_sort_fails() {
        let scraper = RedditScraper::new("reddit_wsb", settings(), Arc::new(StaticFetcher::default()));
        let err = scraper.fetch_since(Utc::now()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unreachable { .. }));
    }
}
