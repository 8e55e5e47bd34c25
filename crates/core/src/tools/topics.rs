//! # Topic Merging
//!
//! Pure helpers behind the Adapt stage and the per-chunk merge of the LLM
//! analysis: similar topics are folded together, percentages normalized, and
//! a keyword-based commercial score is available when the model gives none.

use std::collections::{BTreeMap, BTreeSet};

use crate::services::{ChatAnalysis, CommercialPotential, Topic};
use crate::state::{AdaptPayload, AggregatedTopic, SourcedTopic, TopicCluster};

pub const MAX_KEYWORDS: usize = 10;
pub const MAX_AGGREGATED_TOPICS: usize = 7;
const KEYWORD_OVERLAP_THRESHOLD: f32 = 0.3;
const NAME_SIMILARITY_THRESHOLD: f32 = 0.7;

const COMMERCIAL_KEYWORDS: &[&str] = &[
    "money", "business", "work", "job", "sales", "marketing", "career", "invest", "earn",
    "income", "monetiz", "partner", "startup", "client", "freelance", "pricing",
];

/// Ratio of matching characters, `2 * LCS / (len a + len b)`, case-insensitive.
pub fn name_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.trim().to_lowercase().chars().collect();
    let b: Vec<char> = b.trim().to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    let lcs = prev[b.len()];

    (2 * lcs) as f32 / (a.len() + b.len()) as f32
}

/// Shared keywords over the size of the larger keyword set.
pub fn keyword_overlap(a: &[String], b: &[String]) -> f32 {
    let a: BTreeSet<String> = a.iter().map(|k| k.trim().to_lowercase()).collect();
    let b: BTreeSet<String> = b.iter().map(|k| k.trim().to_lowercase()).collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    shared as f32 / a.len().max(b.len()) as f32
}

fn is_similar(name_a: &str, keywords_a: &[String], name_b: &str, keywords_b: &[String]) -> bool {
    keyword_overlap(keywords_a, keywords_b) > KEYWORD_OVERLAP_THRESHOLD
        || name_similarity(name_a, name_b) > NAME_SIMILARITY_THRESHOLD
}

/// A topic being built up from similar contributions.
#[derive(Debug, Clone)]
struct MergedTopic {
    name: String,
    keywords: Vec<String>,
    percentage: f32,
    description: String,
    sources: BTreeSet<String>,
    sentiment_sum: f32,
    sentiment_count: u32,
}

impl MergedTopic {
    fn absorb(&mut self, topic: &Topic, source: Option<&str>, sentiment: Option<f32>) {
        self.percentage += topic.percentage;
        for keyword in &topic.keywords {
            if self.keywords.len() >= MAX_KEYWORDS {
                break;
            }
            if !self
                .keywords
                .iter()
                .any(|k| k.eq_ignore_ascii_case(keyword))
            {
                self.keywords.push(keyword.clone());
            }
        }
        if self.description.is_empty() {
            self.description = topic.description.clone();
        }
        if let Some(source) = source {
            self.sources.insert(source.to_string());
        }
        if let Some(score) = sentiment {
            self.sentiment_sum += score;
            self.sentiment_count += 1;
        }
    }

    fn sentiment(&self) -> Option<f32> {
        (self.sentiment_count > 0).then(|| self.sentiment_sum / self.sentiment_count as f32)
    }
}

/// Fold similar topics together, largest share first.
fn merge_similar<'a>(
    mut items: Vec<(&'a Topic, Option<&'a str>, Option<f32>)>,
) -> Vec<MergedTopic> {
    items.sort_by(|a, b| {
        b.0.percentage
            .total_cmp(&a.0.percentage)
            .then_with(|| a.0.name.cmp(&b.0.name))
    });

    let mut merged: Vec<MergedTopic> = Vec::new();
    for (topic, source, sentiment) in items {
        let existing = merged
            .iter_mut()
            .find(|m| is_similar(&m.name, &m.keywords, &topic.name, &topic.keywords));
        match existing {
            Some(m) => m.absorb(topic, source, sentiment),
            None => {
                let mut m = MergedTopic {
                    name: topic.name.clone(),
                    keywords: Vec::new(),
                    percentage: 0.0,
                    description: String::new(),
                    sources: BTreeSet::new(),
                    sentiment_sum: 0.0,
                    sentiment_count: 0,
                };
                m.absorb(topic, source, sentiment);
                merged.push(m);
            }
        }
    }

    merged.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));
    merged
}

fn sentiment_for(sentiment: &BTreeMap<String, f32>, topic: &str) -> Option<f32> {
    sentiment.get(topic).copied().or_else(|| {
        sentiment
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(topic))
            .map(|(_, score)| *score)
    })
}

/// Scale percentages down so they sum to 100 when they exceed it.
pub fn normalize_percentages(topics: &mut [AggregatedTopic]) {
    let total: f32 = topics.iter().map(|t| t.percentage).sum();
    if total > 100.0 {
        for topic in topics.iter_mut() {
            topic.percentage = (topic.percentage / total * 1000.0).round() / 10.0;
        }
    }
}

/// Combine the analyses of one chat's chunks. Each part is weighted by the
/// number of characters it covered.
pub fn merge_chunk_analyses(parts: Vec<(usize, ChatAnalysis)>) -> ChatAnalysis {
    let total_weight: usize = parts.iter().map(|(w, _)| *w).sum::<usize>().max(1);

    let weighted: Vec<(Topic, Option<f32>)> = parts
        .iter()
        .flat_map(|(weight, analysis)| {
            let share = *weight as f32 / total_weight as f32;
            analysis.topics.iter().map(move |topic| {
                let sentiment = sentiment_for(&analysis.sentiment, &topic.name);
                let mut topic = topic.clone();
                topic.percentage *= share;
                (topic, sentiment)
            })
        })
        .collect();

    let merged = merge_similar(
        weighted
            .iter()
            .map(|(topic, sentiment)| (topic, None, *sentiment))
            .collect(),
    );

    let mut sentiment = BTreeMap::new();
    let topics = merged
        .into_iter()
        .map(|m| {
            if let Some(score) = m.sentiment() {
                sentiment.insert(m.name.clone(), score);
            }
            Topic {
                name: m.name,
                keywords: m.keywords,
                percentage: (m.percentage * 10.0).round() / 10.0,
                description: m.description,
            }
        })
        .collect();

    ChatAnalysis {
        topics,
        sentiment,
        monetization_hints: dedup_hints(parts.iter().flat_map(|(_, a)| a.monetization_hints.iter())),
    }
}

/// Case-insensitive de-duplication, first occurrence wins.
pub fn dedup_hints<'a>(hints: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    hints
        .filter(|hint| !hint.trim().is_empty())
        .filter(|hint| seen.insert(hint.trim().to_lowercase()))
        .map(|hint| hint.trim().to_string())
        .collect()
}

/// Merge per-chat analyses into the Adapt payload. The map is keyed by chat
/// id, so the result does not depend on the order chats finished in.
pub fn build_adapt(analyses: &BTreeMap<String, ChatAnalysis>) -> AdaptPayload {
    let topics: Vec<SourcedTopic> = analyses
        .iter()
        .flat_map(|(chat_id, analysis)| {
            analysis.topics.iter().map(move |topic| SourcedTopic {
                source_chat: chat_id.clone(),
                topic: topic.clone(),
            })
        })
        .collect();

    let merged = merge_similar(
        topics
            .iter()
            .map(|sourced| {
                let sentiment = analyses
                    .get(&sourced.source_chat)
                    .and_then(|a| sentiment_for(&a.sentiment, &sourced.topic.name));
                (&sourced.topic, Some(sourced.source_chat.as_str()), sentiment)
            })
            .collect(),
    );

    let mut aggregated: Vec<AggregatedTopic> = merged
        .into_iter()
        .take(MAX_AGGREGATED_TOPICS)
        .map(|m| AggregatedTopic {
            sentiment: m.sentiment(),
            name: m.name,
            keywords: m.keywords,
            percentage: m.percentage,
            description: m.description,
            source_chats: m.sources,
        })
        .collect();
    normalize_percentages(&mut aggregated);

    let sentiment = aggregated
        .iter()
        .filter_map(|t| t.sentiment.map(|s| (t.name.clone(), s)))
        .collect();

    AdaptPayload {
        chat_ids: analyses.keys().cloned().collect(),
        total_topics: topics.len(),
        total_chats: analyses.len(),
        monetization_hints: dedup_hints(analyses.values().flat_map(|a| a.monetization_hints.iter())),
        topics,
        aggregated,
        sentiment,
    }
}

/// Distinct topic names, case-insensitive, in first-seen order.
pub fn distinct_topic_names(topics: &[SourcedTopic]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    topics
        .iter()
        .map(|t| t.topic.name.trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Group clustered topic names, largest cluster first. Each cluster is
/// labelled with its member that has the largest summed share across chats.
pub fn group_clusters(
    names: &[String],
    assignments: &[usize],
    topics: &[SourcedTopic],
) -> Vec<TopicCluster> {
    let mut weight: BTreeMap<String, f32> = BTreeMap::new();
    for sourced in topics {
        *weight
            .entry(sourced.topic.name.trim().to_lowercase())
            .or_default() += sourced.topic.percentage;
    }

    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (name, &cluster) in names.iter().zip(assignments) {
        groups.entry(cluster).or_default().push(name.clone());
    }

    let mut groups: Vec<Vec<String>> = groups.into_values().collect();
    groups.sort_by(|a, b| b.len().cmp(&a.len()));

    groups
        .into_iter()
        .enumerate()
        .map(|(id, members)| {
            let label = members
                .iter()
                .fold(None::<(&String, f32)>, |best, name| {
                    let w = weight
                        .get(&name.to_lowercase())
                        .copied()
                        .unwrap_or_default();
                    match best {
                        Some((_, best_w)) if best_w >= w => best,
                        _ => Some((name, w)),
                    }
                })
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            TopicCluster {
                id,
                label,
                topics: members,
            }
        })
        .collect()
}

/// Keyword heuristic: one point per commercial keyword hit, one more for a
/// share above 5 %, half a point above 2 %.
pub fn commercial_score(name: &str, keywords: &[String], percentage: f32) -> CommercialPotential {
    let mut score = 0.0f32;
    for term in std::iter::once(name).chain(keywords.iter().map(String::as_str)) {
        let term = term.to_lowercase();
        if COMMERCIAL_KEYWORDS.iter().any(|k| term.contains(k)) {
            score += 1.0;
        }
    }
    if percentage > 5.0 {
        score += 1.0;
    } else if percentage > 2.0 {
        score += 0.5;
    }

    if score >= 2.0 {
        CommercialPotential::High
    } else if score >= 1.0 {
        CommercialPotential::Medium
    } else {
        CommercialPotential::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str, keywords: &[&str], percentage: f32) -> Topic {
        Topic {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            percentage,
            description: String::new(),
        }
    }

    fn analysis(topics: Vec<Topic>) -> ChatAnalysis {
        ChatAnalysis {
            topics,
            ..Default::default()
        }
    }

    #[test]
    fn test_name_similarity() {
        assert_eq!(name_similarity("Cooking", "cooking"), 1.0);
        assert!(name_similarity("Home cooking", "Home cookery") > 0.7);
        assert!(name_similarity("Cooking", "Crypto trading") < 0.7);
    }

    #[test]
    fn test_keyword_overlap() {
        let a = vec!["pasta".to_string(), "recipes".to_string()];
        let b = vec!["Pasta".to_string(), "sauce".to_string(), "wine".to_string()];
        assert!((keyword_overlap(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(keyword_overlap(&a, &[]), 0.0);
    }

    #[test]
    fn test_build_adapt_merges_across_chats() {
        let mut analyses = BTreeMap::new();
        analyses.insert(
            "b".to_string(),
            analysis(vec![topic("Cooking", &["pasta", "recipes"], 40.0)]),
        );
        analyses.insert(
            "a".to_string(),
            analysis(vec![
                topic("cooking", &["baking"], 30.0),
                topic("Travel", &["flights"], 20.0),
            ]),
        );

        let adapt = build_adapt(&analyses);

        assert_eq!(adapt.total_chats, 2);
        assert_eq!(adapt.total_topics, 3);
        assert_eq!(adapt.topics[0].source_chat, "a");
        assert_eq!(adapt.aggregated.len(), 2);

        let cooking = &adapt.aggregated[0];
        assert_eq!(cooking.name, "Cooking");
        assert_eq!(cooking.percentage, 70.0);
        assert_eq!(cooking.source_chats.len(), 2);
        assert!(cooking.keywords.contains(&"baking".to_string()));
    }

    #[test]
    fn test_normalization_caps_total() {
        let mut analyses = BTreeMap::new();
        analyses.insert("a".into(), analysis(vec![topic("Music", &["guitar"], 80.0)]));
        analyses.insert("b".into(), analysis(vec![topic("Sports", &["football"], 80.0)]));

        let adapt = build_adapt(&analyses);
        let total: f32 = adapt.aggregated.iter().map(|t| t.percentage).sum();
        assert!((total - 100.0).abs() < 0.2);
    }

    #[test]
    fn test_aggregated_topics_capped() {
        let names = [
            "Astronomy", "Baking", "Chess", "Diving", "Economics", "Fishing", "Gardening",
            "Hiking", "Investing", "Jazz", "Knitting", "Linguistics",
        ];
        let topics = names.iter().map(|n| topic(n, &[], 5.0)).collect();
        let mut analyses = BTreeMap::new();
        analyses.insert("a".into(), analysis(topics));

        let adapt = build_adapt(&analyses);
        assert_eq!(adapt.aggregated.len(), MAX_AGGREGATED_TOPICS);
        assert_eq!(adapt.total_topics, names.len());
    }

    #[test]
    fn test_merge_chunks_weights_percentages() {
        let mut first = analysis(vec![topic("Gardening", &["tomatoes"], 100.0)]);
        first.sentiment.insert("Gardening".into(), 1.0);
        first.monetization_hints.push("Sell seedlings".into());
        let mut second = analysis(vec![topic("gardening", &["soil"], 50.0)]);
        second.sentiment.insert("gardening".into(), 0.0);
        second.monetization_hints.push("sell seedlings".into());

        let merged = merge_chunk_analyses(vec![(300, first), (100, second)]);

        assert_eq!(merged.topics.len(), 1);
        assert_eq!(merged.topics[0].percentage, 87.5);
        assert_eq!(merged.sentiment.get("Gardening"), Some(&0.5));
        assert_eq!(merged.monetization_hints, vec!["Sell seedlings".to_string()]);
    }

    #[test]
    fn test_distinct_topic_names() {
        let topics = vec![
            SourcedTopic {
                source_chat: "a".into(),
                topic: topic("Cooking", &[], 10.0),
            },
            SourcedTopic {
                source_chat: "b".into(),
                topic: topic("cooking", &[], 10.0),
            },
            SourcedTopic {
                source_chat: "b".into(),
                topic: topic("Travel", &[], 10.0),
            },
        ];
        assert_eq!(distinct_topic_names(&topics), vec!["Cooking", "Travel"]);
    }

    #[test]
    fn test_group_clusters() {
        let names: Vec<String> = ["Cooking", "Travel", "Baking", "Flights"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let topics = vec![
            SourcedTopic {
                source_chat: "a".into(),
                topic: topic("Baking", &[], 30.0),
            },
            SourcedTopic {
                source_chat: "a".into(),
                topic: topic("Cooking", &[], 10.0),
            },
            SourcedTopic {
                source_chat: "b".into(),
                topic: topic("cooking", &[], 25.0),
            },
        ];

        let clusters = group_clusters(&names, &[1, 0, 1, 2], &topics);

        assert_eq!(clusters.len(), 3);
        assert_eq!(clusters[0].id, 0);
        assert_eq!(clusters[0].topics, vec!["Cooking", "Baking"]);
        assert_eq!(clusters[0].label, "Cooking");
    }

    #[test]
    fn test_commercial_score() {
        let keywords = vec!["freelance clients".to_string(), "pricing".to_string()];
        assert_eq!(commercial_score("Design", &keywords, 1.0), CommercialPotential::High);
        assert_eq!(commercial_score("Design", &[], 6.0), CommercialPotential::Medium);
        assert_eq!(commercial_score("Cats", &[], 3.0), CommercialPotential::Low);
    }
}
