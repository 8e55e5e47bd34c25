//! # Topic Skill
//!
//! Structured LLM call that extracts topics, sentiment and monetization hints
//! from one chunk of chat text.

use std::collections::BTreeMap;

use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::prompts;
use crate::models::ModelConfig;
use crate::run_llm_function;
use crate::services::{ChatAnalysis, Topic};
use crate::tools::topics::MAX_KEYWORDS;

/// A single topic found in the chunk
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct TopicOutput {
    /// Short topic name
    pub name: String,
    /// Keywords that signal the topic
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Share of messages about the topic, 0-100
    #[serde(default)]
    pub percentage: f32,
    /// Tone from -1.0 (negative) to 1.0 (positive)
    #[serde(default)]
    pub sentiment: f32,
    #[serde(default)]
    pub description: String,
}

/// Output from the topic skill
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct TopicAnalysisOutput {
    pub topics: Vec<TopicOutput>,
    /// Needs or requests someone could be paid to solve
    #[serde(default)]
    pub monetization_hints: Vec<String>,
}

impl TopicAnalysisOutput {
    /// Clamp model output into the ranges the pipeline relies on. Topics
    /// without a name are dropped.
    pub fn into_analysis(self) -> ChatAnalysis {
        let mut sentiment = BTreeMap::new();
        let topics = self
            .topics
            .into_iter()
            .filter(|t| !t.name.trim().is_empty())
            .map(|t| {
                let name = t.name.trim().to_string();
                let score = if t.sentiment.is_finite() {
                    t.sentiment.clamp(-1.0, 1.0)
                } else {
                    0.0
                };
                sentiment.insert(name.clone(), score);
                Topic {
                    name,
                    keywords: t
                        .keywords
                        .into_iter()
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .take(MAX_KEYWORDS)
                        .collect(),
                    percentage: if t.percentage.is_finite() {
                        t.percentage.clamp(0.0, 100.0)
                    } else {
                        0.0
                    },
                    description: t.description,
                }
            })
            .collect();

        ChatAnalysis {
            topics,
            sentiment,
            monetization_hints: self.monetization_hints,
        }
    }
}

pub struct TopicSkill;

impl TopicSkill {
    /// Analyse one chunk of `author: text` lines.
    pub async fn run(chunk: &str, config: &ModelConfig) -> anyhow::Result<TopicAnalysisOutput> {
        let prompt = format!("Messages:\n{}", chunk);
        run_llm_function!(config, TopicAnalysisOutput, prompts::TOPIC_ANALYSIS, prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_parsing_with_defaults() {
        let json = r#"{"topics": [{"name": "Cooking", "percentage": 40.5}]}"#;
        let output: TopicAnalysisOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.topics[0].name, "Cooking");
        assert!(output.topics[0].keywords.is_empty());
        assert!(output.monetization_hints.is_empty());
    }

    #[test]
    fn test_into_analysis_clamps() {
        let output = TopicAnalysisOutput {
            topics: vec![
                TopicOutput {
                    name: " Travel ".into(),
                    keywords: (0..15).map(|i| format!("k{}", i)).collect(),
                    percentage: 140.0,
                    sentiment: -3.0,
                    description: String::new(),
                },
                TopicOutput {
                    name: "  ".into(),
                    keywords: vec![],
                    percentage: 10.0,
                    sentiment: 0.0,
                    description: String::new(),
                },
            ],
            monetization_hints: vec!["guide".into()],
        };

        let analysis = output.into_analysis();
        assert_eq!(analysis.topics.len(), 1);
        let travel = &analysis.topics[0];
        assert_eq!(travel.name, "Travel");
        assert_eq!(travel.keywords.len(), MAX_KEYWORDS);
        assert_eq!(travel.percentage, 100.0);
        assert_eq!(analysis.sentiment["Travel"], -1.0);
    }
}
