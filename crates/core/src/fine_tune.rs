//! Client for the remote fine-tuning and chat completion service.

use std::fmt;
use std::fs;
use std::path::Path;

use reqwest::blocking::{multipart, Client, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::conversation::Turn;
use crate::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Key files checked when `OPENAI_API_KEY` is unset, relative to home.
const KEY_FILES_REL: &[&str] = &[".config/openai/api_key", ".config/openai/key", ".openai/api_key"];

/// Chat completion messages share the training turn shape.
pub type ChatMessage = Turn;

/// Lifecycle states of a fine-tuning job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    ValidatingFiles,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Unknown(String),
}

impl JobStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "validating_files" => Self::ValidatingFiles,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ValidatingFiles => "validating_files",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// Whether the job will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
}

/// Blocking client for file upload, job management and chat completion.
#[derive(Clone)]
pub struct FineTuneClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl FineTuneClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build from `OPENAI_API_KEY` (or a key file) and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(k) if !k.trim().is_empty() => k.trim().to_string(),
            _ => read_key_file().ok_or(Error::MissingApiKey)?,
        };
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(api_key, base_url))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Upload a JSONL dataset; returns the remote file id.
    pub fn upload_training_file(&self, file_path: &Path) -> Result<String> {
        let form = multipart::Form::new()
            .text("purpose", "fine-tune")
            .file("file", file_path)?;

        let res = self
            .http
            .post(self.url("files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()?;

        let parsed: IdResponse = check_status(res)?.json()?;
        tracing::info!(file_id = %parsed.id, "uploaded training file {:?}", file_path);
        Ok(parsed.id)
    }

    /// Start a fine-tuning job on an uploaded file; returns the job id.
    pub fn create_job(&self, file_id: &str, model: &str) -> Result<String> {
        let res = self
            .http
            .post(self.url("fine_tuning/jobs"))
            .bearer_auth(&self.api_key)
            .json(&job_request_body(file_id, model))
            .send()?;

        let parsed: IdResponse = check_status(res)?.json()?;
        tracing::info!(job_id = %parsed.id, model, "created fine-tuning job");
        Ok(parsed.id)
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let res = self
            .http
            .get(self.url(&format!("fine_tuning/jobs/{job_id}")))
            .bearer_auth(&self.api_key)
            .send()?;

        let parsed: JobResponse = check_status(res)?.json()?;
        Ok(JobStatus::parse(&parsed.status))
    }

    /// Generate a reply from `model`; returns the first choice's text.
    pub fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let res = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&chat_request_body(model, messages))
            .send()?;

        let json: Value = check_status(res)?.json()?;
        Ok(first_choice_content(&json))
    }
}

fn check_status(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().unwrap_or_default();
    Err(Error::Api {
        status: status.as_u16(),
        body,
    })
}

fn job_request_body(file_id: &str, model: &str) -> Value {
    serde_json::json!({
        "training_file": file_id,
        "model": model,
    })
}

fn chat_request_body(model: &str, messages: &[ChatMessage]) -> Value {
    serde_json::json!({
        "model": model,
        "messages": messages,
    })
}

fn first_choice_content(response: &Value) -> String {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn read_key_file() -> Option<String> {
    let home = dirs::home_dir()?;
    KEY_FILES_REL.iter().find_map(|rel| {
        let content = fs::read_to_string(home.join(rel)).ok()?;
        let trimmed = content.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
