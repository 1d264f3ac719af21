//! Finalization stage: merge the directory entry, the research summary and
//! the scraped site text into one enriched profile. The model output is
//! requested as JSON and validated before it becomes the artifact.

use crate::artifact::ArtifactStore;
use crate::genai::GenAiClient;
use crate::places::PlacesArtifact;
use crate::research::ResearchArtifact;
use crate::scrape::ScrapeArtifact;
use async_trait::async_trait;
use recordflow_orchestration::{ExecutorError, StageExecutor, StageInput, StageOutput};
use serde::{Deserialize, Serialize};

/// How much scraped text goes into the prompt.
const SITE_TEXT_BUDGET: usize = 8_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrichedProfile {
    pub name: String,
    pub website: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub programs: Vec<String>,
    #[serde(default)]
    pub age_range: Option<String>,
}

pub struct FinalizeStage {
    client: GenAiClient,
    artifacts: ArtifactStore,
}

impl FinalizeStage {
    pub fn new(client: GenAiClient, artifacts: ArtifactStore) -> Self {
        Self { client, artifacts }
    }

    fn prompt(place: &PlacesArtifact, research: &ResearchArtifact, site: &ScrapeArtifact) -> String {
        let mut site_text = site.text.clone();
        crate::scrape::truncate_at_char_boundary(&mut site_text, SITE_TEXT_BUDGET);

        format!(
            "Combine the sources below into one JSON object with the keys \
             name, website, address, phone, summary, programs (array of \
             strings), age_range. Use null for unknown fields. Output only \
             the JSON object.\n\n\
             Directory entry:\nname: {}\naddress: {}\nphone: {}\nwebsite: {}\n\n\
             Research summary:\n{}\n\n\
             Website text:\n{}",
            place.name,
            place.address.as_deref().unwrap_or("unknown"),
            place.phone.as_deref().unwrap_or("unknown"),
            place.website,
            research.summary,
            site_text,
        )
    }

    /// The model wraps JSON in code fences often enough to strip them here.
    fn parse_profile(text: &str) -> Result<EnrichedProfile, ExecutorError> {
        let trimmed = text.trim();
        let trimmed = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .unwrap_or(trimmed);
        let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();

        let profile: EnrichedProfile = serde_json::from_str(trimmed)
            .map_err(|e| ExecutorError::transient(format!("unparseable model output: {e}")))?;
        if profile.name.is_empty() || profile.website.is_empty() {
            return Err(ExecutorError::transient(
                "model output missing required fields",
            ));
        }
        Ok(profile)
    }
}

#[async_trait]
impl StageExecutor for FinalizeStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, ExecutorError> {
        let place: PlacesArtifact = self.artifacts.read(input.upstream_ref("places")?).await?;
        let research: ResearchArtifact =
            self.artifacts.read(input.upstream_ref("research")?).await?;
        let site: ScrapeArtifact = self.artifacts.read(input.upstream_ref("scrape")?).await?;

        let (text, usage) = self
            .client
            .generate(&Self::prompt(&place, &research, &site))
            .await?;
        let profile = Self::parse_profile(&text)?;

        let output_ref = self
            .artifacts
            .write("finalize", &input.record.record_id, &profile)
            .await?;
        Ok(StageOutput::new(output_ref).with_usage(usage))
    }
}
