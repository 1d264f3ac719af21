use serde::{Deserialize, Serialize};

/// One source facility record flowing through the pipeline.
///
/// Created once during ingestion and immutable afterward: the orchestrator
/// only reads identity and dedup keys, stage executors interpret the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Stable external identifier, unique across the input set.
    #[serde(alias = "id")]
    pub record_id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Arbitrary upstream payload fields, opaque to the orchestrator.
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            name: None,
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Website URL as ingested, checked under `contact.website` then
    /// top-level `website` (both shapes occur in the source data).
    pub fn website(&self) -> Option<&str> {
        self.payload
            .get("contact")
            .and_then(|c| c.get("website"))
            .or_else(|| self.payload.get("website"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_website_from_contact() {
        let record = Record::new("d-1").with_payload(json!({
            "contact": { "website": "https://example.com" }
        }));
        assert_eq!(record.website(), Some("https://example.com"));
    }

    #[test]
    fn test_website_top_level_fallback() {
        let record = Record::new("d-2").with_payload(json!({
            "website": "https://other.example"
        }));
        assert_eq!(record.website(), Some("https://other.example"));
    }

    #[test]
    fn test_website_absent_or_empty() {
        let record = Record::new("d-3").with_payload(json!({ "contact": {} }));
        assert_eq!(record.website(), None);

        let record = Record::new("d-4").with_payload(json!({ "website": "" }));
        assert_eq!(record.website(), None);
    }

    #[test]
    fn test_record_id_alias() {
        let record: Record =
            serde_json::from_value(json!({ "id": "d-5", "name": "Sunny Days" })).unwrap();
        assert_eq!(record.record_id, "d-5");
        assert_eq!(record.name.as_deref(), Some("Sunny Days"));
    }
}
