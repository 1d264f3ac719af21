//! Directory lookup stage: resolve a facility record to a places entry and
//! persist the verified contact details as the stage artifact.
//!
//! Three outcomes drop a record permanently here: no directory match,
//! a permanently-closed business, and a match without a website (nothing
//! downstream can enrich).

use crate::artifact::ArtifactStore;
use crate::http;
use async_trait::async_trait;
use recordflow_orchestration::{ExecutorError, StageExecutor, StageInput, StageOutput};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,\
places.businessStatus,places.websiteUri,places.nationalPhoneNumber,places.rating";

#[derive(Debug, Clone)]
pub struct PlacesConfig {
    pub api_key: String,
    pub base_url: String,
}

impl PlacesConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://places.googleapis.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    places: Vec<Place>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Place {
    id: String,
    #[serde(default)]
    display_name: Option<DisplayName>,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    business_status: Option<String>,
    #[serde(default)]
    website_uri: Option<String>,
    #[serde(default)]
    national_phone_number: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DisplayName {
    #[serde(default)]
    text: String,
}

/// Artifact written on success; downstream stages read it by `output_ref`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlacesArtifact {
    pub place_id: String,
    pub name: String,
    pub address: Option<String>,
    pub website: String,
    pub phone: Option<String>,
    pub rating: Option<f64>,
}

pub struct PlacesStage {
    client: reqwest::Client,
    config: PlacesConfig,
    artifacts: ArtifactStore,
}

impl PlacesStage {
    pub fn new(config: PlacesConfig, artifacts: ArtifactStore) -> Result<Self, ExecutorError> {
        Ok(Self {
            client: http::build_client(Duration::from_secs(30))?,
            config,
            artifacts,
        })
    }

    fn search_query(input: &StageInput) -> Result<String, ExecutorError> {
        let name = input
            .record
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ExecutorError::permanent("record has no name to search for"))?;

        let address = input
            .record
            .payload
            .get("address")
            .and_then(|v| v.as_str())
            .filter(|a| !a.trim().is_empty());

        Ok(match address {
            Some(address) => format!("{name}, {address}"),
            None => name.to_string(),
        })
    }
}

#[async_trait]
impl StageExecutor for PlacesStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, ExecutorError> {
        let query = Self::search_query(&input)?;
        debug!(record_id = %input.record.record_id, %query, "places search");

        let response = self
            .client
            .post(format!("{}/places:searchText", self.config.base_url))
            .header("X-Goog-Api-Key", &self.config.api_key)
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&json!({ "textQuery": query }))
            .send()
            .await
            .map_err(http::classify_transport)?;
        http::classify_status(response.status())?;

        let body: SearchResponse = response.json().await.map_err(http::classify_transport)?;
        let Some(place) = body.places.into_iter().next() else {
            return Err(ExecutorError::permanent("no matching place found"));
        };

        if place.business_status.as_deref() == Some("CLOSED_PERMANENTLY") {
            return Err(ExecutorError::permanent("facility is permanently closed"));
        }
        let Some(website) = place.website_uri.clone().filter(|w| !w.is_empty()) else {
            return Err(ExecutorError::permanent("place listing has no website"));
        };

        let artifact = PlacesArtifact {
            place_id: place.id,
            name: place
                .display_name
                .map(|d| d.text)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| query.clone()),
            address: place.formatted_address,
            website,
            phone: place.national_phone_number,
            rating: place.rating,
        };

        let output_ref = self
            .artifacts
            .write("places", &input.record.record_id, &artifact)
            .await?;
        Ok(StageOutput::new(output_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordflow_orchestration::Record;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn input(record: Record) -> StageInput {
        StageInput {
            record: Arc::new(record),
            upstream: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_query_includes_address_when_present() {
        let mut record = Record::new("d-1").with_payload(serde_json::json!({
            "address": "12 Elm St, Springfield"
        }));
        record.name = Some("Sunny Days".to_string());

        let query = PlacesStage::search_query(&input(record)).unwrap();
        assert_eq!(query, "Sunny Days, 12 Elm St, Springfield");
    }

    #[test]
    fn test_nameless_record_is_permanent() {
        let record = Record::new("d-1");
        let err = PlacesStage::search_query(&input(record)).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_search_response_parsing() {
        let body = r#"{
            "places": [{
                "id": "plc-1",
                "displayName": { "text": "Sunny Days Daycare" },
                "formattedAddress": "12 Elm St",
                "businessStatus": "OPERATIONAL",
                "websiteUri": "https://sunnydays.example",
                "rating": 4.6
            }]
        }"#;

        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        let place = &parsed.places[0];
        assert_eq!(place.id, "plc-1");
        assert_eq!(place.website_uri.as_deref(), Some("https://sunnydays.example"));
        assert_eq!(place.business_status.as_deref(), Some("OPERATIONAL"));
    }
}
