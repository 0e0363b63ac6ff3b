//! Pipeline for turning message records into JSONL fine-tuning data.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conversation::{AssemblerConfig, ConversationSegmenter, MessageRecord, TrainingExample};
use crate::helpers::{is_group_conversation, TapbackFilter};
use crate::{RecordSource, Result};

/// A row from a CSV record export.
#[derive(Debug, Deserialize)]
struct CsvRow {
    sender: String,
    text: Option<String>,
    conversation_id: String,
    timestamp: i64,
}

/// Configuration for the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub assembler: AssemblerConfig,
    pub tapbacks: TapbackFilter,
}

/// Examples produced from one record set.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub examples: Vec<TrainingExample>,
    pub total_records: usize,
    pub skipped_records: usize,
    pub discarded_conversations: usize,
}

/// Result of writing a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub total_examples: usize,
    pub total_turns: usize,
    pub output_path: PathBuf,
}

/// Group records into training examples in a single forward pass.
///
/// Records with blank text or a tapback match are skipped before they reach
/// the segmenter.
pub fn build_examples(records: &[MessageRecord], config: &PipelineConfig) -> BuildOutput {
    let mut segmenter = ConversationSegmenter::new(config.assembler.clone());
    let mut skipped = 0;

    for record in records {
        if record.text.trim().is_empty() || config.tapbacks.is_tapback(&record.text) {
            skipped += 1;
            continue;
        }
        segmenter.push(record);
    }

    let examples = segmenter.finish();
    tracing::info!(
        records = records.len(),
        skipped,
        examples = examples.len(),
        discarded = segmenter.discarded_count(),
        "built training examples"
    );

    BuildOutput {
        examples,
        total_records: records.len(),
        skipped_records: skipped,
        discarded_conversations: segmenter.discarded_count(),
    }
}

/// Materialize every record from `source`, then build examples.
pub fn process_source<S>(source: &S, config: &PipelineConfig) -> Result<BuildOutput>
where
    S: RecordSource,
{
    let records = source.records()?;
    Ok(build_examples(&records, config))
}

/// Read records from a CSV export with a `sender,text,conversation_id,timestamp` header.
///
/// Rows must already be ordered by conversation, then timestamp. Group
/// conversations are dropped; a missing text becomes empty and is skipped
/// later by the pipeline.
pub fn read_csv_records(csv_path: &Path) -> Result<Vec<MessageRecord>> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut records = Vec::new();

    for result in reader.deserialize() {
        let row: CsvRow = result?;
        if is_group_conversation(&row.conversation_id) {
            tracing::warn!(
                conversation_id = %row.conversation_id,
                "skipping group conversation row in {:?}",
                csv_path
            );
            continue;
        }
        records.push(MessageRecord {
            sender: row.sender,
            text: row.text.unwrap_or_default(),
            conversation_id: row.conversation_id,
            timestamp: row.timestamp,
        });
    }

    Ok(records)
}

/// A CSV file used as a record source.
#[derive(Debug, Clone)]
pub struct CsvExport {
    pub path: PathBuf,
}

impl CsvExport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for CsvExport {
    fn records(&self) -> Result<Vec<MessageRecord>> {
        read_csv_records(&self.path)
    }
}

/// Write examples as one JSON object per line.
pub fn write_jsonl_output(
    examples: &[TrainingExample],
    output_path: &Path,
) -> Result<PipelineResult> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = BufWriter::new(File::create(output_path)?);
    let mut total_turns = 0;

    for example in examples {
        let json_line = serde_json::to_string(example)?;
        writeln!(file, "{}", json_line)?;
        total_turns += example.turns().len();
    }

    file.flush()?;
    tracing::info!(examples = examples.len(), "fine-tuning data saved to {:?}", output_path);

    Ok(PipelineResult {
        total_examples: examples.len(),
        total_turns,
        output_path: output_path.to_path_buf(),
    })
}
