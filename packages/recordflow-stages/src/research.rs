//! Model-backed research stage: turn the verified directory entry into a
//! structured profile of the facility (programs, age ranges, tuition hints).
//! Billed per token; the orchestrator rolls the usage into the run report.

use crate::artifact::ArtifactStore;
use crate::genai::GenAiClient;
use crate::places::PlacesArtifact;
use async_trait::async_trait;
use recordflow_orchestration::{ExecutorError, StageExecutor, StageInput, StageOutput};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ResearchArtifact {
    pub summary: String,
}

pub struct ResearchStage {
    client: GenAiClient,
    artifacts: ArtifactStore,
}

impl ResearchStage {
    pub fn new(client: GenAiClient, artifacts: ArtifactStore) -> Self {
        Self { client, artifacts }
    }

    fn prompt(place: &PlacesArtifact) -> String {
        let mut prompt = format!(
            "Research the childcare facility \"{}\"",
            place.name
        );
        if let Some(address) = &place.address {
            prompt.push_str(&format!(" at {address}"));
        }
        prompt.push_str(&format!(
            " (website: {}). Summarize its programs, age ranges, opening hours \
             and anything notable about tuition or capacity. \
             Answer in plain prose, no markdown.",
            place.website
        ));
        prompt
    }
}

#[async_trait]
impl StageExecutor for ResearchStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, ExecutorError> {
        let places_ref = input.upstream_ref("places")?;
        let place: PlacesArtifact = self.artifacts.read(places_ref).await?;

        let (summary, usage) = self.client.generate(&Self::prompt(&place)).await?;

        let output_ref = self
            .artifacts
            .write(
                "research",
                &input.record.record_id,
                &ResearchArtifact { summary },
            )
            .await?;
        Ok(StageOutput::new(output_ref).with_usage(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_identity_fields() {
        let place = PlacesArtifact {
            place_id: "plc-1".to_string(),
            name: "Sunny Days".to_string(),
            address: Some("12 Elm St".to_string()),
            website: "https://sunnydays.example".to_string(),
            phone: None,
            rating: None,
        };

        let prompt = ResearchStage::prompt(&place);
        assert!(prompt.contains("Sunny Days"));
        assert!(prompt.contains("12 Elm St"));
        assert!(prompt.contains("https://sunnydays.example"));
    }
}
