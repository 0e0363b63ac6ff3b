//! Conversation segmenter for turning ordered message records into training examples.

use serde::{Deserialize, Serialize};

use crate::helpers::join_turn_text;
use crate::{default_system_prompt, DEFAULT_OWNER_NAME, MESSAGE_SEPARATOR, OWNER_SENTINEL};

/// Speaker label for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn in a training example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One row from a record source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender: String,
    pub text: String,
    pub conversation_id: String,
    pub timestamp: i64,
}

impl MessageRecord {
    pub fn new(
        sender: impl Into<String>,
        text: impl Into<String>,
        conversation_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            conversation_id: conversation_id.into(),
            timestamp,
        }
    }
}

/// A complete conversation in chat fine-tuning format.
///
/// `messages[0]` is always the system turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub messages: Vec<Turn>,
}

impl TrainingExample {
    /// The turns after the system turn.
    pub fn turns(&self) -> &[Turn] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }
}

/// Configuration for assembling examples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Content of the leading system turn.
    pub system_prompt: String,
    /// Token placed between consecutive same-speaker messages.
    pub separator: String,
    /// Sender value attributed to the assistant.
    pub owner_sentinel: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self::for_owner(DEFAULT_OWNER_NAME)
    }
}

impl AssemblerConfig {
    /// Config whose system prompt asks the model to answer as `owner_name`.
    pub fn for_owner(owner_name: &str) -> Self {
        Self {
            system_prompt: default_system_prompt(owner_name),
            separator: MESSAGE_SEPARATOR.to_string(),
            owner_sentinel: OWNER_SENTINEL.to_string(),
        }
    }

    /// Map a sender to the role its messages train.
    pub fn role_for(&self, sender: &str) -> Role {
        if sender == self.owner_sentinel {
            Role::Assistant
        } else {
            Role::User
        }
    }
}

/// Prepend the system turn to an already validity-trimmed turn list.
pub fn assemble_example(turns: &[Turn], config: &AssemblerConfig) -> TrainingExample {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    messages.push(Turn::system(config.system_prompt.clone()));
    messages.extend_from_slice(turns);
    TrainingExample { messages }
}

/// Collapses consecutive same-speaker messages into turns.
///
/// A new turn starts exactly when the role changes, so sealed turns always
/// alternate.
#[derive(Debug, Clone)]
pub struct TurnAggregator {
    separator: String,
    pending_role: Option<Role>,
    pending_texts: Vec<String>,
    sealed: Vec<Turn>,
}

impl TurnAggregator {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            pending_role: None,
            pending_texts: Vec::new(),
            sealed: Vec::new(),
        }
    }

    /// Add one message, flushing the buffered run first if the speaker changed.
    pub fn push(&mut self, role: Role, text: &str) {
        if self.pending_role != Some(role) {
            self.flush();
            self.pending_role = Some(role);
        }
        self.pending_texts.push(text.to_string());
    }

    /// Seal the buffered run as a turn. No-op when nothing is buffered.
    pub fn flush(&mut self) {
        let Some(role) = self.pending_role.take() else {
            return;
        };
        if self.pending_texts.is_empty() {
            return;
        }
        let content = join_turn_text(&self.pending_texts, &self.separator);
        self.pending_texts.clear();
        self.sealed.push(Turn { role, content });
    }

    /// Role of the run currently being buffered, if any.
    pub fn pending_role(&self) -> Option<Role> {
        self.pending_role
    }

    /// Turns sealed so far (excludes the pending run).
    pub fn sealed_turns(&self) -> &[Turn] {
        &self.sealed
    }

    /// Flush and hand back every turn, leaving the aggregator empty.
    pub fn take_turns(&mut self) -> Vec<Turn> {
        self.flush();
        std::mem::take(&mut self.sealed)
    }

    pub fn is_empty(&self) -> bool {
        self.pending_role.is_none() && self.sealed.is_empty()
    }
}

/// Splits an ordered record stream into one training example per conversation.
///
/// State is `{active conversation, pending run, sealed turns}`; it is reset
/// every time the conversation id changes.
pub struct ConversationSegmenter {
    config: AssemblerConfig,
    active_conversation: Option<String>,
    aggregator: TurnAggregator,
    examples: Vec<TrainingExample>,
    discarded: usize,
}

impl ConversationSegmenter {
    pub fn new(config: AssemblerConfig) -> Self {
        let aggregator = TurnAggregator::new(config.separator.clone());
        Self {
            config,
            active_conversation: None,
            aggregator,
            examples: Vec::new(),
            discarded: 0,
        }
    }

    /// Reset all state.
    pub fn reset(&mut self) {
        self.active_conversation = None;
        self.aggregator = TurnAggregator::new(self.config.separator.clone());
        self.examples.clear();
        self.discarded = 0;
    }

    /// Feed the next record. Records must arrive ordered by conversation, then time.
    pub fn push(&mut self, record: &MessageRecord) {
        if self.active_conversation.as_deref() != Some(record.conversation_id.as_str()) {
            self.finalize_current_conversation();
            self.active_conversation = Some(record.conversation_id.clone());
        }
        let role = self.config.role_for(&record.sender);
        self.aggregator.push(role, &record.text);
    }

    /// Conversation currently being accumulated.
    pub fn active_conversation(&self) -> Option<&str> {
        self.active_conversation.as_deref()
    }

    /// Number of conversations dropped for having no answered turn.
    pub fn discarded_count(&self) -> usize {
        self.discarded
    }

    /// Seal the open conversation and return every emitted example.
    /// Call this after the last record.
    pub fn finish(&mut self) -> Vec<TrainingExample> {
        self.finalize_current_conversation();
        self.active_conversation = None;
        std::mem::take(&mut self.examples)
    }

    fn finalize_current_conversation(&mut self) {
        if self.aggregator.is_empty() {
            return;
        }
        let turns = trim_to_answered(self.aggregator.take_turns());

        if turns.is_empty() {
            tracing::debug!(
                conversation_id = self.active_conversation.as_deref().unwrap_or_default(),
                "discarding conversation with no answered turn"
            );
            self.discarded += 1;
            return;
        }

        self.examples.push(assemble_example(&turns, &self.config));
    }
}

/// Apply the validity rule to a conversation's turns.
///
/// A trailing user turn has no reply to train on and is dropped. If no user
/// turn remains, nothing was ever answered and the whole list is discarded.
fn trim_to_answered(mut turns: Vec<Turn>) -> Vec<Turn> {
    if turns.last().is_some_and(|t| t.role == Role::User) {
        turns.pop();
    }
    if !turns.iter().any(|t| t.role == Role::User) {
        turns.clear();
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sender: &str, text: &str, conversation_id: &str, timestamp: i64) -> MessageRecord {
        MessageRecord::new(sender, text, conversation_id, timestamp)
    }

    fn run(records: &[MessageRecord]) -> Vec<TrainingExample> {
        let mut segmenter = ConversationSegmenter::new(AssemblerConfig::default());
        for r in records {
            segmenter.push(r);
        }
        segmenter.finish()
    }

    #[test]
    fn test_aggregator_joins_same_speaker_run() {
        let mut agg = TurnAggregator::new(MESSAGE_SEPARATOR);
        agg.push(Role::User, "a");
        agg.push(Role::User, "b");
        assert!(agg.sealed_turns().is_empty());
        assert_eq!(agg.pending_role(), Some(Role::User));

        agg.push(Role::Assistant, "c");
        assert_eq!(agg.sealed_turns(), &[Turn::user("a<NEWMESSAGE>b")]);

        let turns = agg.take_turns();
        assert_eq!(turns, vec![Turn::user("a<NEWMESSAGE>b"), Turn::assistant("c")]);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_aggregator_flush_when_empty_is_noop() {
        let mut agg = TurnAggregator::new(MESSAGE_SEPARATOR);
        agg.flush();
        agg.flush();
        assert!(agg.take_turns().is_empty());
    }

    #[test]
    fn test_role_mapping() {
        let config = AssemblerConfig::default();
        assert_eq!(config.role_for("Me"), Role::Assistant);
        assert_eq!(config.role_for("+15551234567"), Role::User);
        assert_eq!(config.role_for("me"), Role::User);
    }

    #[test]
    fn test_trailing_user_turn_dropped() {
        let examples = run(&[
            record("+1555", "hi", "C1", 1),
            record("Me", "hey", "C1", 2),
            record("+1555", "bye", "C1", 3),
        ]);
        assert_eq!(examples.len(), 1);
        assert_eq!(
            examples[0].turns(),
            &[Turn::user("hi"), Turn::assistant("hey")]
        );
        assert_eq!(examples[0].messages[0].role, Role::System);
    }

    #[test]
    fn test_unprompted_conversation_discarded() {
        let mut segmenter = ConversationSegmenter::new(AssemblerConfig::default());
        segmenter.push(&record("Me", "hi", "C1", 1));
        segmenter.push(&record("+1555", "hey", "C1", 2));
        let examples = segmenter.finish();
        assert!(examples.is_empty());
        assert_eq!(segmenter.discarded_count(), 1);
    }

    #[test]
    fn test_user_only_conversation_discarded() {
        let examples = run(&[
            record("+1555", "anyone there?", "C1", 1),
            record("+1555", "hello?", "C1", 2),
        ]);
        assert!(examples.is_empty());
    }

    #[test]
    fn test_leading_owner_turn_kept_when_answered_later() {
        let examples = run(&[
            record("Me", "you up?", "C1", 1),
            record("+1555", "yeah", "C1", 2),
            record("Me", "cool", "C1", 3),
        ]);
        assert_eq!(examples.len(), 1);
        assert_eq!(
            examples[0].turns(),
            &[
                Turn::assistant("you up?"),
                Turn::user("yeah"),
                Turn::assistant("cool"),
            ]
        );
    }

    #[test]
    fn test_owner_only_conversation_discarded() {
        let mut segmenter = ConversationSegmenter::new(AssemblerConfig::default());
        segmenter.push(&record("Me", "happy birthday!", "C1", 1));
        segmenter.push(&record("Me", "hope it's a good one", "C1", 2));
        assert!(segmenter.finish().is_empty());
        assert_eq!(segmenter.discarded_count(), 1);
    }

    #[test]
    fn test_boundary_resets_state() {
        let examples = run(&[
            record("+1555", "q1", "C1", 1),
            record("Me", "a1", "C1", 2),
            record("Me", "a1b", "C2", 1),
            record("+1666", "q2", "C2", 2),
            record("Me", "a2", "C2", 3),
        ]);
        assert_eq!(examples.len(), 2);
        assert_eq!(
            examples[0].turns(),
            &[Turn::user("q1"), Turn::assistant("a1")]
        );
        // The C2 owner message must not join C1's trailing assistant run
        assert_eq!(
            examples[1].turns(),
            &[Turn::user("q2"), Turn::assistant("a2")]
        );
    }

    #[test]
    fn test_custom_config_flows_into_example() {
        let config = AssemblerConfig {
            system_prompt: "Reply as Sam.".to_string(),
            separator: " / ".to_string(),
            owner_sentinel: "sam".to_string(),
        };
        let mut segmenter = ConversationSegmenter::new(config);
        for r in [
            record("alex", "one", "C1", 1),
            record("alex", "two", "C1", 2),
            record("sam", "three", "C1", 3),
        ] {
            segmenter.push(&r);
        }
        let examples = segmenter.finish();
        assert_eq!(
            examples[0].messages,
            vec![
                Turn::system("Reply as Sam."),
                Turn::user("one / two"),
                Turn::assistant("three"),
            ]
        );
    }

    #[test]
    fn test_assemble_example_is_pure() {
        let config = AssemblerConfig::for_owner("Ray");
        let turns = vec![Turn::user("hi"), Turn::assistant("hello")];
        let a = assemble_example(&turns, &config);
        let b = assemble_example(&turns, &config);
        assert_eq!(a, b);
        assert_eq!(turns.len(), 2);
        assert_eq!(
            a.messages[0],
            Turn::system("You are to respond to text messages as Ray.")
        );
        assert_eq!(a.turns(), turns.as_slice());
    }

    #[test]
    fn test_reset() {
        let mut segmenter = ConversationSegmenter::new(AssemblerConfig::default());
        segmenter.push(&record("+1555", "hi", "C1", 1));
        assert_eq!(segmenter.active_conversation(), Some("C1"));
        segmenter.reset();
        assert_eq!(segmenter.active_conversation(), None);
        assert!(segmenter.finish().is_empty());
        assert_eq!(segmenter.discarded_count(), 0);
    }

    #[test]
    fn test_serializes_lowercase_roles() {
        let example = assemble_example(&[Turn::user("a"), Turn::assistant("b")], &AssemblerConfig::for_owner("Ray"));
        let json = serde_json::to_string(&example).unwrap();
        assert_eq!(
            json,
            r#"{"messages":[{"role":"system","content":"You are to respond to text messages as Ray."},{"role":"user","content":"a"},{"role":"assistant","content":"b"}]}"#
        );
    }
}
