use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tracing::{debug, info};
use url::Url;

use crate::config::DeliverySection;

use super::error::HostError;
use super::{DeliveryMetadata, RemoteId};

/// Boundary to the remote video host.
#[async_trait]
pub trait VideoHost: Send + Sync {
    async fn submit(
        &self,
        artifact: &Path,
        title: &str,
        metadata: &DeliveryMetadata,
    ) -> Result<RemoteId, HostError>;

    async fn attach_to_collection(
        &self,
        id: &RemoteId,
        collection_id: &str,
    ) -> Result<(), HostError>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StoredToken {
    #[serde(alias = "access_token")]
    token: String,
}

/// Resumable-upload client for a YouTube-compatible Data API.
#[derive(Debug, Clone)]
pub struct HttpVideoHost {
    client: Client,
    videos_endpoint: Url,
    collection_endpoint: Url,
    token_path: PathBuf,
}

impl HttpVideoHost {
    pub fn new(section: &DeliverySection) -> Result<Self, HostError> {
        let client = Client::builder()
            .user_agent("vodsync/0.1")
            .timeout(Duration::from_secs(section.request_timeout_seconds.max(1)))
            .build()
            .map_err(|err| HostError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            videos_endpoint: endpoint(&section.upload_base, "videos")?,
            collection_endpoint: endpoint(&section.api_base, "playlistItems")?,
            token_path: section.token_path.clone(),
        })
    }

    pub fn videos_endpoint(&self) -> &Url {
        &self.videos_endpoint
    }

    pub fn collection_endpoint(&self) -> &Url {
        &self.collection_endpoint
    }

    /// Re-read on every call so an external refresher can rotate the token.
    async fn load_token(&self) -> Result<String, HostError> {
        load_token(&self.token_path).await
    }
}

fn endpoint(base: &str, resource: &str) -> Result<Url, HostError> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), resource);
    Url::parse(&joined).map_err(|err| HostError::InvalidEndpoint(format!("{joined}: {err}")))
}

pub async fn load_token(path: &Path) -> Result<String, HostError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|_| HostError::MissingCredentials(path.to_path_buf()))?;
    let token = match serde_json::from_str::<StoredToken>(&content) {
        Ok(stored) => stored.token,
        Err(_) => content.trim().to_string(),
    };
    if token.trim().is_empty() {
        return Err(HostError::MissingCredentials(path.to_path_buf()));
    }
    Ok(token.trim().to_string())
}

async fn ensure_success(response: Response) -> Result<Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HostError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl VideoHost for HttpVideoHost {
    async fn submit(
        &self,
        artifact: &Path,
        title: &str,
        metadata: &DeliveryMetadata,
    ) -> Result<RemoteId, HostError> {
        let token = self.load_token().await?;
        let file = fs::File::open(artifact).await.map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                HostError::ArtifactMissing(artifact.to_path_buf())
            } else {
                HostError::Io {
                    source,
                    path: artifact.to_path_buf(),
                }
            }
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|source| HostError::Io {
                source,
                path: artifact.to_path_buf(),
            })?
            .len();

        let resource = json!({
            "snippet": {
                "title": title,
                "description": metadata.description,
                "tags": metadata.tags,
                "categoryId": metadata.category_id,
            },
            "status": {
                "privacyStatus": metadata.visibility.as_str(),
            }
        });
        let session = self
            .client
            .post(self.videos_endpoint.clone())
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "video/*")
            .header("X-Upload-Content-Length", size)
            .json(&resource)
            .send()
            .await?;
        let session = ensure_success(session).await?;
        let upload_url = session
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| HostError::Response("upload session without Location header".into()))?
            .to_string();
        debug!(artifact = %artifact.display(), bytes = size, "upload session opened");

        let response = self
            .client
            .put(upload_url)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "video/*")
            .header(CONTENT_LENGTH, size)
            .body(Body::from(file))
            .send()
            .await?;
        let created: UploadResponse = ensure_success(response).await?.json().await?;
        info!(artifact = %artifact.display(), remote_id = %created.id, "upload complete");
        Ok(RemoteId::new(created.id))
    }

    async fn attach_to_collection(
        &self,
        id: &RemoteId,
        collection_id: &str,
    ) -> Result<(), HostError> {
        let token = self.load_token().await?;
        let payload = json!({
            "snippet": {
                "playlistId": collection_id,
                "resourceId": { "kind": "youtube#video", "videoId": id.as_str() }
            }
        });
        let response = self
            .client
            .post(self.collection_endpoint.clone())
            .query(&[("part", "snippet")])
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
