//! Website scraping stage: fetch the facility's site and keep the readable
//! text as the artifact. Deduped by normalized URL, so franchises sharing a
//! site are fetched once per run history.

use crate::artifact::ArtifactStore;
use crate::fingerprint::normalize_website_url;
use crate::http;
use async_trait::async_trait;
use recordflow_orchestration::{ExecutorError, StageExecutor, StageInput, StageOutput};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Pages past this size are boilerplate-heavy; the tail adds nothing for
/// the research prompt.
const MAX_TEXT_CHARS: usize = 20_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapeArtifact {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

pub struct ScrapeStage {
    client: reqwest::Client,
    artifacts: ArtifactStore,
}

impl ScrapeStage {
    pub fn new(artifacts: ArtifactStore) -> Result<Self, ExecutorError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(30))?,
            artifacts,
        })
    }

    /// Dedup fingerprint for this stage: the normalized website URL.
    pub fn fingerprint(record: &recordflow_orchestration::Record) -> Option<String> {
        record.website().and_then(normalize_website_url)
    }
}

#[async_trait]
impl StageExecutor for ScrapeStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, ExecutorError> {
        // Prefer the record's own website; fall back to the one the
        // directory lookup verified.
        let url = match Self::fingerprint(&input.record) {
            Some(url) => url,
            None => {
                let place: crate::places::PlacesArtifact =
                    self.artifacts.read(input.upstream_ref("places")?).await?;
                normalize_website_url(&place.website).ok_or_else(|| {
                    ExecutorError::permanent("verified website does not normalize to a URL")
                })?
            }
        };
        debug!(record_id = %input.record.record_id, %url, "fetching website");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(http::classify_transport)?;
        http::classify_status(response.status())?;
        let body = response.text().await.map_err(http::classify_transport)?;

        let (title, text) = extract_text(&body);
        if text.is_empty() {
            return Err(ExecutorError::permanent("page contains no readable text"));
        }

        let artifact = ScrapeArtifact {
            url: url.clone(),
            title,
            text,
        };
        let output_ref = self.artifacts.write("scrape", &url, &artifact).await?;
        Ok(StageOutput::new(output_ref).with_fingerprint(url))
    }
}

/// Pull the title and visible text out of an HTML document. Synchronous on
/// purpose: `Html` is not `Send`, so it must never live across an await.
fn extract_text(html: &str) -> (Option<String>, String) {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    // Parsing the selector from a literal cannot fail.
    let Ok(selector) = Selector::parse("p, h1, h2, h3, li") else {
        return (title, String::new());
    };

    let mut text = String::new();
    for element in document.select(&selector) {
        let fragment = element.text().collect::<String>();
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(fragment);
        if text.len() >= MAX_TEXT_CHARS {
            truncate_at_char_boundary(&mut text, MAX_TEXT_CHARS);
            break;
        }
    }

    (title, text)
}

pub(crate) fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
