use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const DEFAULT_DATASOURCE_TYPE: &str = "table";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub id: i64,
    pub uuid: Uuid,
    pub slice_name: String,
    pub description: Option<String>,
    pub viz_type: String,
    /// Form data as JSON text
    pub params: Option<String>,
    pub datasource_id: i64,
    pub datasource_type: String,
    pub cache_timeout: Option<u64>,
    pub owners: Vec<String>,
    pub changed_on: DateTime<Utc>,
}

impl Chart {
    /// Changes whenever anything that affects the rendered chart changes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.viz_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.params.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.changed_on.timestamp_millis().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owners.iter().any(|o| o == user_id)
    }

    pub fn url(&self) -> String {
        format!("/chart/{}/?standalone=true", self.id)
    }
}

fn validate_params(params: &str) -> Result<(), ValidationError> {
    serde_json::from_str::<serde_json::Value>(params)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_json").with_message("Params must be valid JSON.".into()))
}

fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("Field may not be blank.".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ChartPost {
    #[validate(length(min = 1, max = 250, message = "Length must be between 1 and 250."))]
    pub slice_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[validate(custom(function = "validate_not_blank"))]
    pub viz_type: String,
    #[serde(default)]
    #[validate(custom(function = "validate_params"))]
    pub params: Option<String>,
    pub datasource_id: i64,
    #[serde(default)]
    pub datasource_type: Option<String>,
    #[serde(default)]
    pub cache_timeout: Option<u64>,
    #[serde(default)]
    pub owners: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ChartPut {
    #[serde(default)]
    #[validate(length(min = 1, max = 250, message = "Length must be between 1 and 250."))]
    pub slice_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    #[validate(custom(function = "validate_not_blank"))]
    pub viz_type: Option<String>,
    #[serde(default)]
    #[validate(custom(function = "validate_params"))]
    pub params: Option<String>,
    #[serde(default)]
    pub datasource_id: Option<i64>,
    #[serde(default)]
    pub datasource_type: Option<String>,
    #[serde(default)]
    pub cache_timeout: Option<u64>,
    #[serde(default)]
    pub owners: Option<Vec<String>>,
}
