//! Provider descriptors, tiers and profiles.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// What a provider can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Script,
    Voice,
    Visual,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Script => "script",
            Capability::Voice => "voice",
            Capability::Visual => "visual",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority class of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    /// Runs on this machine against a local model or server
    Local,
    /// Built-in fallback with no model, network or key
    Free,
    /// Remote service behind a paid API key
    Paid,
}

impl ProviderTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTier::Local => "local",
            ProviderTier::Free => "free",
            ProviderTier::Paid => "paid",
        }
    }
}

impl fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderTier {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ProviderTier::Local),
            "free" => Ok(ProviderTier::Free),
            "paid" | "pro" => Ok(ProviderTier::Paid),
            other => Err(ModelError::validation(format!("unknown provider tier: {other}"))),
        }
    }
}

/// Caller preference used to order tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderProfile {
    /// Local/offline providers first
    #[default]
    OfflinePreferred,
    /// Paid/cloud providers first
    QualityPreferred,
}

impl ProviderProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderProfile::OfflinePreferred => "offline_preferred",
            ProviderProfile::QualityPreferred => "quality_preferred",
        }
    }
}

impl fmt::Display for ProviderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one provider for one probe cycle.
///
/// Descriptors are never mutated; a re-probe produces a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderDescriptor {
    pub capability: Capability,
    pub name: String,
    pub tier: ProviderTier,
    /// Result of the most recent liveness probe
    pub available: bool,
    /// Why the provider is down (if it is)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub probed_at: DateTime<Utc>,
}

impl ProviderDescriptor {
    pub fn up(capability: Capability, name: impl Into<String>, tier: ProviderTier) -> Self {
        Self {
            capability,
            name: name.into(),
            tier,
            available: true,
            reason: None,
            probed_at: Utc::now(),
        }
    }

    pub fn down(
        capability: Capability,
        name: impl Into<String>,
        tier: ProviderTier,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            capability,
            name: name.into(),
            tier,
            available: false,
            reason: Some(reason.into()),
            probed_at: Utc::now(),
        }
    }
}

/// One candidate considered during selection, and why it was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProbeAttempt {
    pub provider: String,
    pub tier: ProviderTier,
    pub reason: String,
}

impl fmt::Display for ProbeAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.provider, self.tier, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parsing() {
        assert_eq!("Local".parse::<ProviderTier>().unwrap(), ProviderTier::Local);
        assert_eq!(" pro ".parse::<ProviderTier>().unwrap(), ProviderTier::Paid);
        assert!("gold".parse::<ProviderTier>().is_err());
    }

    #[test]
    fn test_profile_serde() {
        let json = serde_json::to_string(&ProviderProfile::QualityPreferred).unwrap();
        assert_eq!(json, "\"quality_preferred\"");
    }
}
