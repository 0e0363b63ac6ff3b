//! Core logic for turning a direct-message archive into fine-tuning data.
//!
//! The `ConversationSegmenter` consumes time-ordered message records
//! (sender, text, conversation id) and seals them into multi-turn
//! `TrainingExample`s with alternating user/assistant turns, suitable for
//! supervised fine-tuning of a chat model.

/// Trait for anything that can supply ordered message records.
///
/// Implementors must return records ordered by conversation id, then by
/// timestamp within a conversation. The segmenter never re-sorts.
pub trait RecordSource {
    /// Materialize every record in scope.
    fn records(&self) -> Result<Vec<MessageRecord>>;
}

// Blanket implementation for references to RecordSources
impl<T: RecordSource + ?Sized> RecordSource for &T {
    fn records(&self) -> Result<Vec<MessageRecord>> {
        (*self).records()
    }
}

mod conversation;
mod error;
mod helpers;
pub mod fine_tune;
pub mod pipeline;
pub mod store;

pub use conversation::{
    assemble_example, AssemblerConfig, ConversationSegmenter, MessageRecord, Role,
    TrainingExample, Turn, TurnAggregator,
};
pub use error::{Error, Result};
pub use fine_tune::{ChatMessage, FineTuneClient, JobStatus};
pub use helpers::{is_group_conversation, join_turn_text, TapbackFilter};
pub use pipeline::{
    build_examples, process_source, read_csv_records, write_jsonl_output, BuildOutput,
    CsvExport, PipelineConfig, PipelineResult,
};
pub use store::{
    copy_message_store, describe_schema, open_read_only, read_records, ColumnInfo, MessageStore,
    RecordQuery, RecordScope, StoreConfig,
};

/// Sender value the record source uses for messages written by the archive owner.
pub const OWNER_SENTINEL: &str = "Me";

/// Literal token joining consecutive same-speaker messages into one turn.
pub const MESSAGE_SEPARATOR: &str = "<NEWMESSAGE>";

/// Default display name used in the system prompt.
pub const DEFAULT_OWNER_NAME: &str = "the archive owner";

/// Default base model for fine-tuning jobs.
pub const DEFAULT_BASE_MODEL: &str = "gpt-4o";

/// Default output file for the assembled dataset.
pub const TUNE_FILE: &str = "finetune.jsonl";

/// Tapback reactions rendered as synthetic message text.
pub const DEFAULT_TAPBACKS: &[&str] = &[
    "Liked",
    "Loved",
    "Emphasized",
    "Disliked",
    "Laughed at",
    "Questioned",
];

/// Generate the system prompt for the given owner name.
pub fn default_system_prompt(owner_name: &str) -> String {
    format!("You are to respond to text messages as {owner_name}.")
}
