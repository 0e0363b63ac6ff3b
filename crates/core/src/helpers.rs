//! Helper functions for record filtering and turn text.

use regex::RegexSet;
use std::sync::LazyLock;

use crate::{Result, DEFAULT_TAPBACKS};

static DEFAULT_TAPBACK_SET: LazyLock<RegexSet> =
    LazyLock::new(|| RegexSet::new(DEFAULT_TAPBACKS.iter().map(|p| regex::escape(p))).unwrap());

/// Prefix the message store gives to group conversation identifiers.
const GROUP_CHAT_PREFIX: &str = "chat";

/// Substring denylist for tapback reactions.
///
/// A message is a tapback when its trimmed text contains any pattern,
/// case-sensitively. This is a blunt policy: a genuine message that happens
/// to contain "Liked" is dropped too.
#[derive(Debug, Clone)]
pub struct TapbackFilter {
    patterns: Vec<String>,
    set: RegexSet,
}

impl TapbackFilter {
    /// Build a filter from literal substrings.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let set = RegexSet::new(patterns.iter().map(|p| regex::escape(p)))?;
        Ok(Self { patterns, set })
    }

    /// A filter that lets every message through.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: RegexSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `text` is a reaction rather than real content.
    pub fn is_tapback(&self, text: &str) -> bool {
        self.set.is_match(text.trim())
    }
}

impl Default for TapbackFilter {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_TAPBACKS.iter().map(|p| p.to_string()).collect(),
            set: DEFAULT_TAPBACK_SET.clone(),
        }
    }
}

/// Group conversations carry identifiers like `chat123456789`.
pub fn is_group_conversation(conversation_id: &str) -> bool {
    conversation_id.starts_with(GROUP_CHAT_PREFIX)
}

/// Join the buffered texts of one turn, in arrival order.
pub fn join_turn_text<S: AsRef<str>>(texts: &[S], separator: &str) -> String {
    let mut out = String::new();
    for (i, text) in texts.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        out.push_str(text.as_ref());
    }
    out
}
