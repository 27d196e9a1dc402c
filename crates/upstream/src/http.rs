//! HTTP adapter for an OpenAI-compatible upstream
//!
//! Maps the `Upstream` operations onto the chat completions, files, and
//! batches endpoints. Transport failures (timeouts, refused connections) are
//! transient; non-success statuses go through `classify_status` with the
//! `Retry-After` header as a fallback hint. Completion responses are read
//! under a hard byte cap.

use std::collections::BTreeMap;
use std::time::Duration;

use common::BoxFuture;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::classify::{classify_status, parse_retry_after_header};
use crate::error::{Error, Result};
use crate::types::{Completion, CompletionRequest, RemoteBatch, Usage};
use crate::Upstream;

/// Endpoint the batch lines target.
pub const BATCH_ENDPOINT: &str = "/v1/chat/completions";

/// Completion window requested for every batch.
pub const COMPLETION_WINDOW: &str = "24h";

/// Upstream client over HTTP.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    max_response_bytes: usize,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Deserialize)]
struct BatchList {
    data: Vec<RemoteBatch>,
}

impl HttpUpstream {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        request_timeout: Duration,
        max_response_bytes: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            max_response_bytes,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and turn non-success statuses into classified errors.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header_hint = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_header);
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        warn!(status = status.as_u16(), "upstream returned error status");

        Err(match classify_status(status.as_u16(), &body) {
            Error::RateLimited {
                retry_after: None,
                message,
            } => Error::RateLimited {
                retry_after: header_hint,
                message,
            },
            other => other,
        })
    }

    async fn json_capped(&self, response: reqwest::Response) -> Result<serde_json::Value> {
        let bytes = read_capped(response, self.max_response_bytes).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidResponse(format!("decoding response body: {e}")))
    }

    async fn remote_batch(&self, response: reqwest::Response) -> Result<RemoteBatch> {
        response
            .json::<RemoteBatch>()
            .await
            .map_err(|e| Error::InvalidResponse(format!("decoding batch object: {e}")))
    }
}

impl Upstream for HttpUpstream {
    fn id(&self) -> &str {
        "openai"
    }

    fn complete<'a>(
        &'a self,
        secret: &'a str,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<Completion>> {
        Box::pin(async move {
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

            let response = self
                .send(
                    self.client
                        .post(self.url(BATCH_ENDPOINT))
                        .bearer_auth(secret)
                        .timeout(self.request_timeout)
                        .json(&body),
                )
                .await?;
            let value = self.json_capped(response).await?;
            parse_completion(&value)
        })
    }

    fn upload_file<'a>(
        &'a self,
        secret: &'a str,
        file_name: &'a str,
        contents: Vec<u8>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let size = contents.len();
            let part = Part::bytes(contents)
                .file_name(file_name.to_string())
                .mime_str("application/jsonl")
                .map_err(|e| Error::InvalidResponse(format!("building upload part: {e}")))?;
            let form = Form::new().text("purpose", "batch").part("file", part);

            let response = self
                .send(
                    self.client
                        .post(self.url("/v1/files"))
                        .bearer_auth(secret)
                        .multipart(form),
                )
                .await?;
            let file: FileObject = response
                .json()
                .await
                .map_err(|e| Error::InvalidResponse(format!("decoding file object: {e}")))?;
            debug!(file_id = %file.id, file_name, size, "uploaded batch input file");
            Ok(file.id)
        })
    }

    fn create_batch<'a>(
        &'a self,
        secret: &'a str,
        input_file_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<RemoteBatch>> {
        Box::pin(async move {
            let body = json!({
                "input_file_id": input_file_id,
                "endpoint": BATCH_ENDPOINT,
                "completion_window": COMPLETION_WINDOW,
                "metadata": metadata,
            });
            let response = self
                .send(
                    self.client
                        .post(self.url("/v1/batches"))
                        .bearer_auth(secret)
                        .timeout(self.request_timeout)
                        .json(&body),
                )
                .await?;
            self.remote_batch(response).await
        })
    }

    fn retrieve_batch<'a>(
        &'a self,
        secret: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteBatch>> {
        Box::pin(async move {
            let response = self
                .send(
                    self.client
                        .get(self.url(&format!("/v1/batches/{batch_id}")))
                        .bearer_auth(secret)
                        .timeout(self.request_timeout),
                )
                .await?;
            self.remote_batch(response).await
        })
    }

    fn latest_batch<'a>(&'a self, secret: &'a str) -> BoxFuture<'a, Result<Option<RemoteBatch>>> {
        Box::pin(async move {
            let response = self
                .send(
                    self.client
                        .get(self.url("/v1/batches?limit=1"))
                        .bearer_auth(secret)
                        .timeout(self.request_timeout),
                )
                .await?;
            let list: BatchList = response
                .json()
                .await
                .map_err(|e| Error::InvalidResponse(format!("decoding batch list: {e}")))?;
            Ok(list.data.into_iter().next())
        })
    }

    fn cancel_batch<'a>(
        &'a self,
        secret: &'a str,
        batch_id: &'a str,
    ) -> BoxFuture<'a, Result<RemoteBatch>> {
        Box::pin(async move {
            let response = self
                .send(
                    self.client
                        .post(self.url(&format!("/v1/batches/{batch_id}/cancel")))
                        .bearer_auth(secret)
                        .timeout(self.request_timeout),
                )
                .await?;
            self.remote_batch(response).await
        })
    }

    fn download_file<'a>(
        &'a self,
        secret: &'a str,
        file_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let response = self
                .send(
                    self.client
                        .get(self.url(&format!("/v1/files/{file_id}/content")))
                        .bearer_auth(secret),
                )
                .await?;
            let bytes = response.bytes().await.map_err(transport_error)?;
            Ok(bytes.to_vec())
        })
    }

    fn delete_file<'a>(&'a self, secret: &'a str, file_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.send(
                self.client
                    .delete(self.url(&format!("/v1/files/{file_id}")))
                    .bearer_auth(secret)
                    .timeout(self.request_timeout),
            )
            .await?;
            Ok(())
        })
    }
}

/// Extract content and usage from a chat completion body.
pub fn parse_completion(value: &serde_json::Value) -> Result<Completion> {
    let content = value
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::InvalidResponse("completion has no message content".into()))?
        .to_string();
    let usage = value
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
    Ok(Completion { content, usage })
}

/// Read a response body, failing once it grows past `cap` bytes.
async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        if buf.len() + chunk.len() > cap {
            return Err(Error::InvalidResponse(format!(
                "response body exceeded {cap} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_decode() {
        Error::InvalidResponse(e.to_string())
    } else {
        Error::Transient(e.to_string())
    }
}
