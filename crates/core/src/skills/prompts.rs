//! Prompt templates for the analysis and strategy calls.

/// Per-chunk topic analysis of chat messages
pub const TOPIC_ANALYSIS: &str = r#"You are an experienced business analyst and monetization consultant.
You receive messages from a group chat, one per line as `author: text`.

Identify the 5-7 main topics the participants talk about, from the most to the least frequently discussed.
For every topic give:
- name: a short topic name
- keywords: up to 10 keywords that signal the topic
- percentage: approximate share of the messages about this topic (0-100)
- sentiment: the emotional tone of the discussion, from -1.0 (negative) through 0.0 (neutral) to 1.0 (positive)
- description: one or two sentences of context

Also list monetization_hints: concrete needs, pains or requests in the messages that someone could be paid to solve.
Only report what the messages support. Answer in the language of the messages."#;

/// Single strategy call over the merged topics and clusters
pub const STRATEGY: &str = r#"You are an expert in market analysis and monetization strategy.
You only give realistic, proven recommendations.

You receive, as JSON, the main topics of a person's chats (with their share of the conversation,
keywords, sentiment and source chats), the topic clusters found by embedding similarity, and the
monetization hints collected from the chats.

Write:
- summary: a short portrait of the person's interests and expertise
- transformation_key: the single most promising direction for turning these interests into income, if any
- opportunities: one entry per promising topic with
  - topic: the topic name as given
  - commercial_potential: exactly one of "high", "medium", "low"
  - realistic_revenue: a realistic monthly revenue range
  - methods: concrete ways to earn money on the topic
  - first_steps: the first concrete actions to take

Address the person by the user name given in the input."#;
