//! Generation request submitted by callers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ModelError, ModelResult};
use crate::provider::ProviderProfile;

/// Minimum target duration in seconds.
pub const MIN_DURATION_SECS: u32 = 5;
/// Maximum target duration in seconds.
pub const MAX_DURATION_SECS: u32 = 1800;

/// A request to generate one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct GenerationRequest {
    /// Topic or brief the script is written from
    #[validate(length(min = 3, max = 4000))]
    pub brief: String,

    /// Target video duration in seconds
    #[validate(range(min = 5, max = 1800))]
    pub target_duration_secs: u32,

    /// Provider ordering preference
    #[serde(default)]
    pub profile: ProviderProfile,

    /// Caller-supplied correlation id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 128))]
    pub correlation_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(brief: impl Into<String>, target_duration_secs: u32) -> Self {
        Self {
            brief: brief.into(),
            target_duration_secs,
            profile: ProviderProfile::default(),
            correlation_id: None,
        }
    }

    pub fn with_profile(mut self, profile: ProviderProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Validate the request, flattening field errors into one message.
    pub fn ensure_valid(&self) -> ModelResult<()> {
        if self.brief.trim().is_empty() {
            return Err(ModelError::validation("brief: must not be blank"));
        }
        self.validate().map_err(|errors| {
            let mut fields: Vec<String> = errors
                .field_errors()
                .iter()
                .map(|(field, errs)| {
                    let codes: Vec<&str> = errs.iter().map(|e| e.code.as_ref()).collect();
                    format!("{}: {}", field, codes.join(","))
                })
                .collect();
            fields.sort();
            ModelError::validation(fields.join("; "))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let req = GenerationRequest::new("How volcanoes form", 60);
        assert!(req.ensure_valid().is_ok());
    }

    #[test]
    fn test_duration_out_of_range() {
        let req = GenerationRequest::new("How volcanoes form", 2);
        let err = req.ensure_valid().unwrap_err();
        assert!(err.to_string().contains("target_duration_secs"));

        let req = GenerationRequest::new("How volcanoes form", MAX_DURATION_SECS + 1);
        assert!(req.ensure_valid().is_err());
        assert_eq!(MIN_DURATION_SECS, 5);
    }

    #[test]
    fn test_blank_brief() {
        let req = GenerationRequest::new("     ", 30);
        assert!(req.ensure_valid().is_err());
    }

    #[test]
    fn test_profile_defaults_when_missing() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"brief":"Tides","target_duration_secs":30}"#).unwrap();
        assert_eq!(req.profile, ProviderProfile::OfflinePreferred);
        assert!(req.correlation_id.is_none());
    }
}
