//! # Strategy Skill
//!
//! One structured LLM call that turns the merged topics and clusters into a
//! monetization strategy document.

use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::prompts;
use crate::models::ModelConfig;
use crate::run_llm_function;
use crate::services::{
    CommercialPotential, MonetizationOpportunity, StrategyDocument, StrategyRequest,
};
use crate::state::AggregatedTopic;
use crate::tools::topics::commercial_score;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct OpportunityOutput {
    pub topic: String,
    /// "high", "medium" or "low"
    #[serde(default)]
    pub commercial_potential: String,
    #[serde(default)]
    pub realistic_revenue: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub first_steps: Vec<String>,
}

/// Output from the strategy skill
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct StrategyOutput {
    pub summary: String,
    #[serde(default)]
    pub transformation_key: Option<String>,
    #[serde(default)]
    pub opportunities: Vec<OpportunityOutput>,
}

impl StrategyOutput {
    /// Convert to the stored document. A missing or unknown potential is
    /// scored from the topic's keywords and share; with no opportunities at
    /// all, every topic is scored that way.
    pub fn into_document(self, topics: &[AggregatedTopic]) -> StrategyDocument {
        let opportunities = if self.opportunities.is_empty() {
            topics.iter().map(fallback_opportunity).collect()
        } else {
            self.opportunities
                .into_iter()
                .map(|o| {
                    let commercial_potential = CommercialPotential::parse(&o.commercial_potential)
                        .unwrap_or_else(|| score_named(&o.topic, topics));
                    MonetizationOpportunity {
                        topic: o.topic,
                        commercial_potential,
                        realistic_revenue: o.realistic_revenue,
                        methods: o.methods,
                        first_steps: o.first_steps,
                    }
                })
                .collect()
        };

        StrategyDocument {
            summary: self.summary,
            transformation_key: self.transformation_key.filter(|k| !k.trim().is_empty()),
            opportunities,
        }
    }
}

fn score_named(name: &str, topics: &[AggregatedTopic]) -> CommercialPotential {
    match topics.iter().find(|t| t.name.eq_ignore_ascii_case(name.trim())) {
        Some(topic) => commercial_score(&topic.name, &topic.keywords, topic.percentage),
        None => commercial_score(name, &[], 0.0),
    }
}

fn fallback_opportunity(topic: &AggregatedTopic) -> MonetizationOpportunity {
    MonetizationOpportunity {
        topic: topic.name.clone(),
        commercial_potential: commercial_score(&topic.name, &topic.keywords, topic.percentage),
        realistic_revenue: String::new(),
        methods: Vec::new(),
        first_steps: Vec::new(),
    }
}

pub struct StrategySkill;

impl StrategySkill {
    pub async fn run(
        request: &StrategyRequest,
        config: &ModelConfig,
    ) -> anyhow::Result<StrategyOutput> {
        let input = serde_json::to_string_pretty(request)?;
        run_llm_function!(config, StrategyOutput, prompts::STRATEGY, input)
    }
}
