//! # Transcript Preparation
//!
//! Turns raw chat messages into the text lines sent for analysis: noise is
//! filtered out, long chats are sampled down, and the result is split into
//! chunks that fit one model call.

use std::sync::OnceLock;

use regex::Regex;

use crate::services::ChatMessage;

/// Limits applied when preparing a chat for analysis.
#[derive(Debug, Clone, Copy)]
pub struct PrepareOptions {
    /// Messages with at most this many characters are dropped
    pub min_chars: usize,
    /// Maximum number of lines kept per chat
    pub limit: usize,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            min_chars: 10,
            limit: 1000,
        }
    }
}

fn url_pattern() -> Option<&'static Regex> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://\S+|www\.\S+").ok())
        .as_ref()
}

fn whitespace_pattern() -> Option<&'static Regex> {
    static WS: OnceLock<Option<Regex>> = OnceLock::new();
    WS.get_or_init(|| Regex::new(r"\s+").ok()).as_ref()
}

/// Strip links and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let without_urls = match url_pattern() {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_string(),
    };
    match whitespace_pattern() {
        Some(re) => re.replace_all(&without_urls, " ").trim().to_string(),
        None => without_urls.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

/// Commands (`/start`) and mentions-only lines carry no topic.
fn is_noise(cleaned: &str, min_chars: usize) -> bool {
    cleaned.chars().count() <= min_chars || cleaned.starts_with('/') || cleaned.starts_with('@')
}

/// Render the messages worth analysing as `author: text` lines.
pub fn prepare_messages(messages: &[ChatMessage], options: &PrepareOptions) -> Vec<String> {
    let lines: Vec<String> = messages
        .iter()
        .filter_map(|message| {
            let cleaned = clean_text(&message.text);
            if is_noise(&cleaned, options.min_chars) {
                return None;
            }
            let author = message.author.trim();
            Some(if author.is_empty() {
                cleaned
            } else {
                format!("{}: {}", author, cleaned)
            })
        })
        .collect();

    sample_evenly(lines, options.limit)
}

/// Keep `limit` items spread evenly over the input, preserving order.
pub fn sample_evenly<T>(items: Vec<T>, limit: usize) -> Vec<T> {
    let total = items.len();
    if total <= limit {
        return items;
    }
    if limit == 0 {
        return Vec::new();
    }

    let mut picks = (0..limit).map(|i| i * total / limit).peekable();
    items
        .into_iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            if picks.peek() == Some(&idx) {
                picks.next();
                Some(item)
            } else {
                None
            }
        })
        .collect()
}

/// Split lines into newline-joined chunks of at most `max_chars` characters.
/// A single line longer than the limit is truncated on a char boundary.
pub fn chunk_lines(lines: &[String], max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for line in lines {
        let line = truncate_chars(line, max_chars);
        let line_chars = line.chars().count();
        let needed = if current.is_empty() {
            line_chars
        } else {
            line_chars + 1
        };

        if current_chars + needed > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(line);
        current_chars += line_chars;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn message(author: &str, text: &str) -> ChatMessage {
        ChatMessage {
            author: author.to_string(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_filters_noise() {
        let messages = vec![
            message("alice", "ok"),
            message("alice", "/start the bot please"),
            message("bob", "@carol have a look at this"),
            message("bob", "Let's talk about sourdough starters tonight"),
            message("carol", "https://example.com/very/long/link/only"),
        ];

        let lines = prepare_messages(&messages, &PrepareOptions::default());
        assert_eq!(lines, vec!["bob: Let's talk about sourdough starters tonight"]);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(
            clean_text("see   https://x.io/a \n for   details"),
            "see for details"
        );
    }

    #[test]
    fn test_sampling_keeps_limit_and_order() {
        let items: Vec<usize> = (0..100).collect();
        let sampled = sample_evenly(items, 10);
        assert_eq!(sampled.len(), 10);
        assert_eq!(sampled[0], 0);
        assert!(sampled.windows(2).all(|w| w[0] < w[1]));

        let short: Vec<usize> = (0..3).collect();
        assert_eq!(sample_evenly(short, 10), vec![0, 1, 2]);
    }

    #[test]
    fn test_chunking_respects_limit() {
        let lines: Vec<String> = (0..10).map(|i| format!("line number {}", i)).collect();
        let chunks = chunk_lines(&lines, 30);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 30));
        assert_eq!(chunks.join("\n"), lines.join("\n"));
    }

    #[test]
    fn test_overlong_line_truncated() {
        let lines = vec!["x".repeat(50)];
        let chunks = chunk_lines(&lines, 20);
        assert_eq!(chunks, vec!["x".repeat(20)]);
    }
}
