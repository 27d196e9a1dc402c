//! Batch lines and work units

use serde_json::json;
use upstream::CompletionRequest;
use upstream::http::BATCH_ENDPOINT;

use crate::error::{Error, Result};

/// One serialized upstream call, tagged with a stable correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLine {
    pub correlation_id: String,
    /// Estimated token cost of the call
    pub tokens: u64,
    /// Serialized JSON, without the trailing newline
    pub body: String,
}

impl BatchLine {
    pub fn new(correlation_id: impl Into<String>, tokens: u64, body: String) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            tokens,
            body,
        }
    }

    /// Build a chat completion batch line for `request`.
    ///
    /// The token cost is the prompt estimate plus the response cap.
    pub fn chat(correlation_id: impl Into<String>, request: &CompletionRequest) -> Result<Self> {
        let correlation_id = correlation_id.into();
        let mut body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.instructions},
                {"role": "user", "content": request.payload},
            ],
            "max_completion_tokens": request.max_response_tokens,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        let line = json!({
            "custom_id": correlation_id,
            "method": "POST",
            "url": BATCH_ENDPOINT,
            "body": body,
        });
        let serialized =
            serde_json::to_string(&line).map_err(|e| Error::Serialize(e.to_string()))?;
        let tokens = upstream::estimate_tokens(&request.instructions)
            + upstream::estimate_tokens(&request.payload)
            + u64::from(request.max_response_tokens);
        Ok(Self::new(correlation_id, tokens, serialized))
    }

    /// Bytes this line occupies on disk, newline included.
    pub fn size(&self) -> u64 {
        self.body.len() as u64 + 1
    }
}

/// All lines of one caller-defined task. Written to a single file or not at all.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: String,
    pub lines: Vec<BatchLine>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, lines: Vec<BatchLine>) -> Self {
        Self {
            id: id.into(),
            lines,
        }
    }

    pub fn tokens(&self) -> u64 {
        self.lines.iter().map(|l| l.tokens).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.lines.iter().map(BatchLine::size).sum()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
