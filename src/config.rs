use crate::cost::PricingTable;
use crate::llm::{GeminiConfig, RetryPolicy};
use crate::synthesis::SynthesisConfig;
use std::str::FromStr;

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| parse_bool(&v))
}

/// Everything the runner reads from the environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gemini: GeminiConfig,
    pub retry: RetryPolicy,
    /// Longest side, in pixels, of photos sent for extraction.
    pub image_max_side: u32,
    pub synthesis: SynthesisConfig,
    pub pricing: PricingTable,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            gemini: GeminiConfig::from_env(),
            retry: RetryPolicy::from_env(),
            image_max_side: env_parse::<u32>("IMAGE_MAX_SIDE")
                .filter(|v| *v >= 64)
                .unwrap_or(800),
            synthesis: SynthesisConfig::from_env(),
            pricing: PricingTable::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values() {
        for truthy in ["1", "true", "YES", " on "] {
            assert!(parse_bool(truthy), "{truthy}");
        }
        for falsy in ["0", "false", "no", ""] {
            assert!(!parse_bool(falsy), "{falsy}");
        }
    }

    #[test]
    fn unset_keys_are_none() {
        assert_eq!(env_string("VITRINE_TEST_UNSET_KEY_1F3A"), None);
        assert_eq!(env_parse::<u32>("VITRINE_TEST_UNSET_KEY_1F3A"), None);
    }
}
