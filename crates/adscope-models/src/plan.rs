//! Plan catalog: tiers, quotas, prices, and capability tags.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Subscription plan tier, ordered Lite < Plus < Pro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Lite,
    Plus,
    Pro,
}

impl PlanTier {
    /// Parse from string (case-insensitive). Returns `None` for unknown tiers.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lite" => Some(PlanTier::Lite),
            "plus" => Some(PlanTier::Plus),
            "pro" => Some(PlanTier::Pro),
            _ => None,
        }
    }

    /// Get the tier name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Lite => "lite",
            PlanTier::Plus => "plus",
            PlanTier::Pro => "pro",
        }
    }

    /// Hierarchy rank used to validate upgrade direction.
    ///
    /// An upgrade target must rank strictly higher than the current tier.
    pub fn rank(&self) -> u8 {
        match self {
            PlanTier::Lite => 1,
            PlanTier::Plus => 2,
            PlanTier::Pro => 3,
        }
    }

    /// Catalog entry for this tier.
    pub fn spec(&self) -> PlanSpec {
        match self {
            PlanTier::Lite => PlanSpec {
                duration_days: 90,
                total_ads: 12,
                max_ads_per_month: 4,
                price: 50.0,
            },
            PlanTier::Plus => PlanSpec {
                duration_days: 180,
                total_ads: 30,
                max_ads_per_month: 5,
                price: 100.0,
            },
            PlanTier::Pro => PlanSpec {
                duration_days: 365,
                total_ads: 132,
                max_ads_per_month: 11,
                price: 400.0,
            },
        }
    }

    /// Full capability set granted by this tier.
    ///
    /// Every tier currently unlocks the same four capabilities; upgrades
    /// always grant the full set of the target tier.
    pub fn features(&self) -> Vec<Feature> {
        Feature::all().to_vec()
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static catalog entry for a plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanSpec {
    /// Subscription window length in days.
    pub duration_days: u32,
    /// Lifetime ad-analysis balance granted by the plan.
    pub total_ads: u32,
    /// Cap on analyses within a calendar month.
    pub max_ads_per_month: u32,
    /// Price charged for the plan.
    pub price: f64,
}

/// Capability tag enabled on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    BrandCompliance,
    ContentAnalysis,
    MetaphorAnalysis,
    ChannelCompliance,
}

impl Feature {
    /// All known capability tags.
    pub fn all() -> [Feature; 4] {
        [
            Feature::BrandCompliance,
            Feature::ContentAnalysis,
            Feature::MetaphorAnalysis,
            Feature::ChannelCompliance,
        ]
    }

    /// Get the feature tag as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::BrandCompliance => "brand_compliance",
            Feature::ContentAnalysis => "content_analysis",
            Feature::MetaphorAnalysis => "metaphor_analysis",
            Feature::ChannelCompliance => "channel_compliance",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "brand_compliance" => Some(Feature::BrandCompliance),
            "content_analysis" => Some(Feature::ContentAnalysis),
            "metaphor_analysis" => Some(Feature::MetaphorAnalysis),
            "channel_compliance" => Some(Feature::ChannelCompliance),
            _ => None,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_values() {
        let lite = PlanTier::Lite.spec();
        assert_eq!(lite.duration_days, 90);
        assert_eq!(lite.total_ads, 12);
        assert_eq!(lite.max_ads_per_month, 4);

        let plus = PlanTier::Plus.spec();
        assert_eq!(plus.duration_days, 180);
        assert_eq!(plus.total_ads, 30);
        assert_eq!(plus.max_ads_per_month, 5);

        let pro = PlanTier::Pro.spec();
        assert_eq!(pro.duration_days, 365);
        assert_eq!(pro.total_ads, 132);
        assert_eq!(pro.max_ads_per_month, 11);
    }

    #[test]
    fn test_hierarchy_is_strictly_ordered() {
        assert!(PlanTier::Lite.rank() < PlanTier::Plus.rank());
        assert!(PlanTier::Plus.rank() < PlanTier::Pro.rank());
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(PlanTier::parse("lite"), Some(PlanTier::Lite));
        assert_eq!(PlanTier::parse("Pro"), Some(PlanTier::Pro)); // Case insensitive
        assert_eq!(PlanTier::parse("enterprise"), None);
    }

    #[test]
    fn test_feature_round_trip() {
        for feature in Feature::all() {
            assert_eq!(Feature::parse(feature.as_str()), Some(feature));
        }
        assert_eq!(Feature::parse("unknown"), None);
    }

    #[test]
    fn test_every_tier_grants_full_feature_set() {
        for tier in [PlanTier::Lite, PlanTier::Plus, PlanTier::Pro] {
            assert_eq!(tier.features().len(), 4);
        }
    }
}
