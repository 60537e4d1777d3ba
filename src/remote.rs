//! Remote importer collaborator — the content-processing service.
//!
//! Two operations: submit a file by URL and poll the processing status of a
//! prior submission. Failures carry an HTTP-like status code used for retry
//! classification.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed remote errors enabling retry classification.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The service answered with a non-success status.
    #[error("Remote service returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never produced a response (DNS, connect, read timeout).
    #[error("Remote request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body could not be decoded.
    #[error("Unexpected response from remote service: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether this error is transient and worth retrying.
    ///
    /// Rate-limit responses and server errors are transient; other 4xx
    /// responses are permanent and abort immediately. Network failures are
    /// treated as transient. Decode failures are permanent — the call
    /// reached the service and retrying won't change the answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Network(_) => true,
            RemoteError::Decode(_) => false,
        }
    }

    /// The HTTP status code, when the service answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            RemoteError::Network(e) => e.status().map(|s| s.as_u16()),
            RemoteError::Decode(_) => None,
        }
    }
}

/// Receipt returned by a successful upload submission.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    /// Identifier assigned by the remote service.
    #[serde(rename = "id")]
    pub destination_id: String,
}

/// Processing status reported by the remote service.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Operations the core invokes on the remote service.
#[async_trait]
pub trait RemoteImporter: Send + Sync {
    /// Submit a file by source URL for import into the given folder.
    async fn upload(
        &self,
        url: &str,
        destination_folder_id: Option<&str>,
    ) -> Result<UploadReceipt, RemoteError>;

    /// Poll the processing status of a prior submission.
    async fn get_status(&self, destination_id: &str) -> Result<RemoteStatus, RemoteError>;
}

#[derive(Serialize)]
struct ImportRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    folder_id: Option<&'a str>,
}

/// HTTP client for the remote importer API.
///
/// `POST {base}/imports` submits a file; `GET {base}/imports/{id}` returns
/// its processing status.
pub struct HttpRemoteImporter {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRemoteImporter {
    pub fn new(base_url: String, token: String) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            // Body is best-effort context; many APIs return JSON error docs.
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteImporter for HttpRemoteImporter {
    async fn upload(
        &self,
        url: &str,
        destination_folder_id: Option<&str>,
    ) -> Result<UploadReceipt, RemoteError> {
        let body = ImportRequest {
            url,
            folder_id: destination_folder_id,
        };
        let response = self
            .client
            .post(format!("{}/imports", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn get_status(&self, destination_id: &str) -> Result<RemoteStatus, RemoteError> {
        let response = self
            .client
            .get(format!("{}/imports/{}", self.base_url, destination_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response).await
    }
}

/// Scripted importer for tests: each external URL maps to a queue of
/// responses consumed in order.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type UploadResult = Result<UploadReceipt, RemoteError>;
    type StatusResult = Result<RemoteStatus, RemoteError>;

    #[derive(Default)]
    pub struct ScriptedImporter {
        uploads: Mutex<HashMap<String, Vec<UploadResult>>>,
        statuses: Mutex<HashMap<String, Vec<StatusResult>>>,
        pub upload_calls: Mutex<Vec<String>>,
        pub status_calls: Mutex<Vec<String>>,
    }

    impl ScriptedImporter {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue responses for an upload URL, consumed first-to-last. The
        /// final entry is repeated if the URL is called again.
        pub fn script_upload(&self, url: &str, mut responses: Vec<UploadResult>) {
            responses.reverse(); // pop() consumes from the front
            self.uploads
                .lock()
                .unwrap()
                .insert(url.to_string(), responses);
        }

        pub fn script_status(&self, destination_id: &str, mut responses: Vec<StatusResult>) {
            responses.reverse();
            self.statuses
                .lock()
                .unwrap()
                .insert(destination_id.to_string(), responses);
        }

        fn take<T>(queue: &mut Vec<Result<T, RemoteError>>) -> Result<T, RemoteError>
        where
            T: Clone,
        {
            if queue.len() > 1 {
                queue.pop().expect("non-empty")
            } else {
                match queue.last() {
                    Some(Ok(v)) => Ok(v.clone()),
                    Some(Err(RemoteError::Status { status, message })) => Err(RemoteError::Status {
                        status: *status,
                        message: message.clone(),
                    }),
                    Some(Err(_)) | None => Err(RemoteError::Status {
                        status: 500,
                        message: "unscripted".into(),
                    }),
                }
            }
        }
    }

    #[async_trait]
    impl RemoteImporter for ScriptedImporter {
        async fn upload(
            &self,
            url: &str,
            _destination_folder_id: Option<&str>,
        ) -> Result<UploadReceipt, RemoteError> {
            self.upload_calls.lock().unwrap().push(url.to_string());
            let mut uploads = self.uploads.lock().unwrap();
            let queue = uploads.entry(url.to_string()).or_default();
            Self::take(queue)
        }

        async fn get_status(&self, destination_id: &str) -> Result<RemoteStatus, RemoteError> {
            self.status_calls
                .lock()
                .unwrap()
                .push(destination_id.to_string());
            let mut statuses = self.statuses.lock().unwrap();
            let queue = statuses.entry(destination_id.to_string()).or_default();
            Self::take(queue)
        }
    }
}
