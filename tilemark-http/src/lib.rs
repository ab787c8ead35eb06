use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tilemark_core::{
    Page, Polygon, PolygonUpdate, TileImage, TileKey, TileSource, WorkspaceId, WorkspaceSource,
    WorkspaceSummary,
};
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid base url {input:?}")]
    BaseUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request to {url} failed")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: Url, status: StatusCode },

    #[error("failed to decode image from {url}")]
    Decode {
        url: Url,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/".to_string(),
            timeout_secs: 30,
            user_agent: format!("tilemark/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Parses `input` as a base URL that relative paths extend instead of replace.
pub fn parse_base_url(input: &str) -> Result<Url, SourceError> {
    let mut normalized = input.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|source| SourceError::BaseUrl {
        input: input.to_string(),
        source,
    })
}

pub fn decode_tile(data: &[u8]) -> Result<TileImage, image::ImageError> {
    let rgba = image::load_from_memory(data)?.to_rgba8();
    Ok(TileImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}

pub struct HttpClient {
    http: Client,
    base: Url,
}

impl HttpClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base = parse_base_url(&config.base_url)?;
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|source| SourceError::BaseUrl {
                input: format!("{}{}", self.base, path),
                source,
            })
    }

    pub fn tile_url(&self, key: &TileKey) -> Result<Url, SourceError> {
        self.endpoint(&key.media_path())
    }

    async fn send(&self, url: &Url, request: reqwest::RequestBuilder) -> Result<Response, SourceError> {
        let response = request.send().await.map_err(|source| SourceError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.clone(),
                status,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        let response = self.send(&url, self.http.get(url.clone())).await?;
        let body = response
            .json::<T>()
            .await
            .map_err(|source| SourceError::Transport {
                url: url.clone(),
                source,
            })
            .with_context(|| format!("unexpected response body from {url}"))?;
        Ok(body)
    }

    async fn get_bytes(&self, url: &Url) -> Result<Option<Bytes>, SourceError> {
        let response = match self.send(url, self.http.get(url.clone())).await {
            Ok(response) => response,
            Err(SourceError::Status { status, .. }) if status == StatusCode::NOT_FOUND => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let body = response.bytes().await.map_err(|source| SourceError::Transport {
            url: url.clone(),
            source,
        })?;
        Ok(Some(body))
    }
}

#[async_trait]
impl WorkspaceSource for HttpClient {
    #[instrument(skip(self))]
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        self.get_json("workspaces").await
    }

    #[instrument(skip(self))]
    async fn fetch_pages(&self, workspace: WorkspaceId) -> Result<Vec<Page>> {
        let pages: Option<Vec<Page>> = self
            .get_json(&format!("workspaces/{workspace}/pages"))
            .await?;
        Ok(pages.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn fetch_polygons(&self, workspace: WorkspaceId) -> Result<Vec<Polygon>> {
        let polygons: Option<Vec<Polygon>> = self
            .get_json(&format!("workspaces/{workspace}/polygons"))
            .await?;
        Ok(polygons.unwrap_or_default())
    }

    #[instrument(skip(self, update), fields(polygon = update.polygon, vertices = update.vertices.len()))]
    async fn save_polygon(&self, update: &PolygonUpdate) -> Result<()> {
        let url = self.endpoint(&format!("polygons/{}/", update.polygon))?;
        self.send(&url, self.http.patch(url.clone()).json(update))
            .await?;
        debug!(%url, "polygon saved");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn export_analysis(&self, workspace: WorkspaceId) -> Result<serde_json::Value> {
        self.get_json(&format!("workspaces/{workspace}/export-analysis/"))
            .await
    }
}

#[async_trait]
impl TileSource for HttpClient {
    async fn resolve_tile(&self, key: &TileKey) -> Result<Option<TileImage>> {
        let url = self.tile_url(key)?;
        let Some(body) = self.get_bytes(&url).await? else {
            debug!(%key, "tile does not exist");
            return Ok(None);
        };
        let image = decode_tile(&body).map_err(|source| SourceError::Decode { url, source })?;
        Ok(Some(image))
    }
}
