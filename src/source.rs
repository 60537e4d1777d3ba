//! Source lister collaborator — the external content source.
//!
//! Produces a lazy, finite sequence of discovered file descriptors for a
//! container, optionally recursing into nested containers and optionally
//! capped at a maximum item count. A listing failure surfaces as a single
//! stream error; the consumer keeps whatever was listed before it.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from a listing attempt.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Source request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected response from source: {0}")]
    Decode(String),
}

/// A file descriptor as reported by the source system.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredFile {
    #[serde(rename = "id")]
    pub external_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Operations the core invokes on the source system.
pub trait SourceLister: Send + Sync {
    /// List files under `container`, page by page.
    ///
    /// When `recursive` is true, nested containers are walked breadth-first.
    /// When `max_items` is set, the stream ends after that many descriptors.
    fn list(
        &self,
        container: &str,
        recursive: bool,
        max_items: Option<usize>,
    ) -> BoxStream<'static, Result<DiscoveredFile, SourceError>>;
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    files: Vec<DiscoveredFile>,
    #[serde(default)]
    folders: Vec<FolderRef>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderRef {
    id: String,
}

/// HTTP client for the source listing API.
///
/// `GET {base}/containers/{id}/items[?page_token=...]` returns one page of
/// files, child folders, and an optional continuation token.
pub struct HttpSourceLister {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSourceLister {
    pub fn new(base_url: String, token: String) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn fetch_page(
        client: &reqwest::Client,
        base_url: &str,
        token: &str,
        container: &str,
        page_token: Option<&str>,
    ) -> Result<ListingPage, SourceError> {
        let mut request = client
            .get(format!("{base_url}/containers/{container}/items"))
            .bearer_auth(token);
        if let Some(page_token) = page_token {
            request = request.query(&[("page_token", page_token)]);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<ListingPage>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

impl SourceLister for HttpSourceLister {
    fn list(
        &self,
        container: &str,
        recursive: bool,
        max_items: Option<usize>,
    ) -> BoxStream<'static, Result<DiscoveredFile, SourceError>> {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let container = container.to_string();

        // Channel-backed stream: the walker task prefetches the next page
        // while the consumer processes the current one.
        let (tx, rx) = mpsc::channel::<Result<DiscoveredFile, SourceError>>(64);

        tokio::spawn(async move {
            let mut sent = 0usize;
            let mut containers: VecDeque<String> = VecDeque::from([container]);

            'walk: while let Some(current) = containers.pop_front() {
                let mut page_token: Option<String> = None;
                loop {
                    let page = match Self::fetch_page(
                        &client,
                        &base_url,
                        &token,
                        &current,
                        page_token.as_deref(),
                    )
                    .await
                    {
                        Ok(page) => page,
                        Err(e) => {
                            // One error per listing attempt; no per-page retry.
                            let _ = tx.send(Err(e)).await;
                            break 'walk;
                        }
                    };

                    for file in page.files {
                        if let Some(max) = max_items {
                            if sent >= max {
                                break 'walk;
                            }
                        }
                        if tx.send(Ok(file)).await.is_err() {
                            break 'walk; // consumer dropped
                        }
                        sent += 1;
                    }

                    if recursive {
                        containers.extend(page.folders.into_iter().map(|f| f.id));
                    }

                    match page.next_page_token {
                        Some(next) => page_token = Some(next),
                        None => break,
                    }
                }
            }
        });

        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn static_lister_yields_files_in_order() {
        let lister = StaticLister::new(vec![
            file("A", "a.pdf", Some(1), None),
            file("B", "b.pdf", Some(2), None),
        ]);
        let items: Vec<_> = lister.list("root", false, None).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().external_id, "A");
        assert_eq!(items[1].as_ref().unwrap().external_id, "B");
    }

    #[tokio::test]
    async fn max_items_caps_the_stream() {
        let lister = StaticLister::new(vec![
            file("A", "a.pdf", Some(1), None),
            file("B", "b.pdf", Some(2), None),
            file("C", "c.pdf", Some(3), None),
        ]);
        let items: Vec<_> = lister.list("root", false, Some(2)).collect().await;
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn listing_page_decodes_with_defaults() {
        let page: ListingPage = serde_json::from_str(r#"{"files": []}"#).unwrap();
        assert!(page.files.is_empty());
        assert!(page.folders.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn discovered_file_decodes_optional_fields() {
        let f: DiscoveredFile = serde_json::from_str(
            r#"{"id": "F1", "name": "doc.pdf", "url": "https://s/f1", "size": 42}"#,
        )
        .unwrap();
        assert_eq!(f.external_id, "F1");
        assert_eq!(f.size, Some(42));
        assert!(f.mime_type.is_none());
    }
}
