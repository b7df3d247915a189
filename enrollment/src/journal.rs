use crate::config::DiagnosticLogConfig;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum JournalError {
    #[error("failed to open diagnostic log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write diagnostic log entry: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode diagnostic log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Entry<'a> {
    timestamp: String,
    stage: &'a str,
    request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
}

/// Append-only JSON-lines record of the CRM calls made per request.
///
/// Only bodies are written, never headers, so credentials stay out of the file.
pub struct Journal {
    file: Mutex<File>,
    max_body_chars: usize,
}

impl Journal {
    pub async fn open(config: &DiagnosticLogConfig) -> Result<Self, JournalError> {
        let file = open_append(&config.path)
            .await
            .map_err(|source| JournalError::Open {
                path: config.path.clone(),
                source,
            })?;

        Ok(Journal {
            file: Mutex::new(file),
            max_body_chars: config.max_body_chars,
        })
    }

    /// Writes one entry. Failures are logged and swallowed.
    pub async fn append(
        &self,
        stage: &str,
        request: Option<&JsonValue>,
        status: Option<u16>,
        response: Option<&JsonValue>,
    ) {
        if let Err(e) = self.try_append(stage, request, status, response).await {
            tracing::warn!(stage, error = %e, "Failed to append diagnostic log entry");
        }
    }

    async fn try_append(
        &self,
        stage: &str,
        request: Option<&JsonValue>,
        status: Option<u16>,
        response: Option<&JsonValue>,
    ) -> Result<(), JournalError> {
        let entry = Entry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            stage,
            request: request.map(|body| self.truncate(body)),
            status,
            response: response.map(|body| self.truncate(body)),
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn truncate(&self, body: &JsonValue) -> String {
        let text = match body {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        match text.char_indices().nth(self.max_body_chars) {
            Some((cut, _)) => text[..cut].to_string(),
            None => text,
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}
