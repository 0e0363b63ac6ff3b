//! CLI tool for turning a direct-message archive into fine-tuning data.
//!
//! Copies the local message store, extracts non-group conversations, writes
//! them as chat-format JSONL, and optionally submits the file for
//! fine-tuning.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};

use imessage_tune_core::{
    copy_message_store, default_system_prompt, describe_schema, open_read_only, process_source,
    write_jsonl_output, AssemblerConfig, BuildOutput, ChatMessage, CsvExport, FineTuneClient,
    MessageStore, PipelineConfig, RecordQuery, RecordScope, StoreConfig, TapbackFilter,
    DEFAULT_BASE_MODEL, DEFAULT_OWNER_NAME, MESSAGE_SEPARATOR, OWNER_SENTINEL, TUNE_FILE,
};

/// Build a personal fine-tuning dataset from your direct messages.
#[derive(Parser, Debug)]
#[command(name = "imessage-tune")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy the message store into a local working file and verify it.
    CopyStore(StoreArgs),

    /// Print the tables and columns of a message store as JSON.
    Schema {
        /// Store to inspect
        #[arg(long, default_value = "imessages.db")]
        db: PathBuf,
    },

    /// Extract conversations and write the JSONL dataset.
    Build(BuildArgs),

    /// Upload a dataset file; prints the remote file id.
    Upload {
        #[arg(long, default_value = TUNE_FILE)]
        file: PathBuf,
    },

    /// Start a fine-tuning job on an uploaded file.
    CreateJob {
        /// Remote file id returned by `upload`
        file_id: String,

        #[arg(long, default_value = DEFAULT_BASE_MODEL)]
        model: String,
    },

    /// Check the status of a fine-tuning job.
    Status { job_id: String },

    /// Upload, create a job and report its first status.
    Tune {
        #[arg(long, default_value = TUNE_FILE)]
        file: PathBuf,

        #[arg(long, default_value = DEFAULT_BASE_MODEL)]
        model: String,
    },

    /// Ask a (fine-tuned) model to answer a message.
    Chat {
        /// Model id, e.g. the fine-tuned model name
        #[arg(long)]
        model: String,

        /// Name the system prompt asks the model to answer as
        #[arg(long, default_value = DEFAULT_OWNER_NAME)]
        owner_name: String,

        /// Incoming message to answer
        message: String,
    },
}

#[derive(ClapArgs, Debug)]
struct StoreArgs {
    /// Message store to copy (defaults to ~/Library/Messages/chat.db)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Destination of the working copy
    #[arg(long, default_value = "imessages.db")]
    destination: PathBuf,
}

#[derive(ClapArgs, Debug)]
struct BuildArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Read an existing store snapshot instead of copying the live one
    #[arg(long, conflicts_with = "csv")]
    db: Option<PathBuf>,

    /// Read ordered records from a CSV export (sender,text,conversation_id,timestamp)
    #[arg(long, conflicts_with_all = ["test_mode", "source", "destination"])]
    csv: Option<PathBuf>,

    /// Output JSONL file
    #[arg(long, default_value = TUNE_FILE)]
    output: PathBuf,

    /// Name the system prompt asks the model to answer as
    #[arg(long, default_value = DEFAULT_OWNER_NAME)]
    owner_name: String,

    /// Custom system prompt, used instead of the one built from --owner-name
    #[arg(long, conflicts_with = "owner_name")]
    system_prompt: Option<String>,

    /// Only process the first non-group conversation
    #[arg(long)]
    test_mode: bool,

    /// Tapback substring to exclude; repeat to replace the default list
    #[arg(long = "tapback")]
    tapbacks: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CopyStore(args) => {
            let path = run_copy_store(&args)?;
            println!("Successfully copied message store to {:?}", path);
            Ok(())
        }
        Commands::Schema { db } => run_schema(&db),
        Commands::Build(args) => run_build(args),
        Commands::Upload { file } => {
            let client = FineTuneClient::from_env()?;
            let file_id = client
                .upload_training_file(&file)
                .with_context(|| format!("upload {:?}", file))?;
            println!("File uploaded with ID: {}", file_id);
            Ok(())
        }
        Commands::CreateJob { file_id, model } => {
            let client = FineTuneClient::from_env()?;
            let job_id = client
                .create_job(&file_id, &model)
                .context("create fine-tuning job")?;
            println!("Fine-tuning job created with ID: {}", job_id);
            Ok(())
        }
        Commands::Status { job_id } => {
            let client = FineTuneClient::from_env()?;
            let status = client.job_status(&job_id).context("check job status")?;
            println!("Fine-tuning job {} status: {}", job_id, status);
            Ok(())
        }
        Commands::Tune { file, model } => run_tune(&file, &model),
        Commands::Chat {
            model,
            owner_name,
            message,
        } => {
            let client = FineTuneClient::from_env()?;
            let messages: Vec<ChatMessage> = vec![
                ChatMessage::system(default_system_prompt(&owner_name)),
                ChatMessage::user(message),
            ];
            let reply = client.complete(&model, &messages).context("chat completion")?;
            println!("{}", reply);
            Ok(())
        }
    }
}

fn run_copy_store(args: &StoreArgs) -> Result<PathBuf> {
    let mut config = StoreConfig {
        destination_path: args.destination.clone(),
        ..Default::default()
    };
    if let Some(source) = &args.source {
        config.source_path = source.clone();
    }
    copy_message_store(&config).context("copy message store")
}

fn run_schema(db: &Path) -> Result<()> {
    let conn = open_read_only(db).with_context(|| format!("open {:?}", db))?;
    let structure = describe_schema(&conn).context("read database structure")?;
    println!("{}", serde_json::to_string_pretty(&structure)?);
    Ok(())
}

fn run_build(args: BuildArgs) -> Result<()> {
    let tapbacks = if args.tapbacks.is_empty() {
        TapbackFilter::default()
    } else {
        TapbackFilter::new(args.tapbacks.iter().cloned()).context("compile tapback list")?
    };

    let system_prompt = args
        .system_prompt
        .clone()
        .unwrap_or_else(|| default_system_prompt(&args.owner_name));
    let config = PipelineConfig {
        assembler: AssemblerConfig {
            system_prompt,
            separator: MESSAGE_SEPARATOR.to_string(),
            owner_sentinel: OWNER_SENTINEL.to_string(),
        },
        tapbacks: tapbacks.clone(),
    };
    let scope = if args.test_mode {
        RecordScope::FirstConversation
    } else {
        RecordScope::All
    };
    tracing::debug!(?scope, tapbacks = config.tapbacks.patterns().len(), "build settings");

    let (source_label, output): (PathBuf, BuildOutput) = if let Some(csv) = &args.csv {
        let output = process_source(&CsvExport::new(csv), &config)
            .with_context(|| format!("read {:?}", csv))?;
        (csv.clone(), output)
    } else {
        let db = match &args.db {
            Some(db) => db.clone(),
            None => run_copy_store(&args.store)?,
        };
        let query = RecordQuery {
            scope,
            tapbacks,
            owner_sentinel: OWNER_SENTINEL.to_string(),
        };
        let output = process_source(&MessageStore::new(&db, query), &config)
            .with_context(|| format!("query message records from {:?}", db))?;
        (db, output)
    };

    println!("Processed {} records from {:?}", output.total_records, source_label);

    let result = write_jsonl_output(&output.examples, &args.output)
        .with_context(|| format!("write {:?}", args.output))?;

    let metadata_path = args
        .output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.join("metadata.json"))
        .unwrap_or_else(|| PathBuf::from("metadata.json"));
    let metadata = serde_json::json!({
        "config": {
            "source": source_label.to_string_lossy(),
            "output": args.output.to_string_lossy(),
            "owner_name": prompt_owner_name(&args),
            "system_prompt": config.assembler.system_prompt,
            "test_mode": args.test_mode,
            "tapbacks": config.tapbacks.patterns(),
        },
        "counts": {
            "total_records": output.total_records,
            "skipped_records": output.skipped_records,
            "discarded_conversations": output.discarded_conversations,
            "total_examples": result.total_examples,
            "total_turns": result.total_turns,
        },
        "stats": {
            "avg_turns_per_example": if result.total_examples > 0 {
                result.total_turns as f64 / result.total_examples as f64
            } else {
                0.0
            },
        },
    });
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    println!("\n[summary]");
    println!("  Records read: {}", output.total_records);
    println!("  Records skipped: {}", output.skipped_records);
    println!("  Conversations discarded: {}", output.discarded_conversations);
    println!("  Examples written: {}", result.total_examples);
    println!("  Total turns: {}", result.total_turns);
    println!("  Output: {:?}", result.output_path);
    println!("  Metadata: {:?}", metadata_path);
    if !args.tapbacks.is_empty() {
        println!("  Tapback list: custom ({} entries)", config.tapbacks.patterns().len());
    }

    Ok(())
}

/// The owner name only shapes the prompt when no custom prompt replaces it.
fn prompt_owner_name(args: &BuildArgs) -> Option<&str> {
    match args.system_prompt {
        Some(_) => None,
        None => Some(args.owner_name.as_str()),
    }
}

fn run_tune(file: &Path, model: &str) -> Result<()> {
    let client = FineTuneClient::from_env()?;

    let file_id = client
        .upload_training_file(file)
        .with_context(|| format!("upload {:?}", file))?;
    println!("File uploaded with ID: {}", file_id);

    let job_id = client
        .create_job(&file_id, model)
        .context("create fine-tuning job")?;
    println!("Fine-tuning job created with ID: {}", job_id);

    let status = client.job_status(&job_id).context("check job status")?;
    println!("Fine-tuning job {} status: {}", job_id, status);
    Ok(())
}
