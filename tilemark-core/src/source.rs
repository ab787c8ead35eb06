use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Page, Polygon, PolygonUpdate, WorkspaceId, WorkspaceSummary};
use crate::tiles::{TileImage, TileKey};

#[async_trait]
pub trait WorkspaceSource: Send + Sync {
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>>;
    async fn fetch_pages(&self, workspace: WorkspaceId) -> Result<Vec<Page>>;
    async fn fetch_polygons(&self, workspace: WorkspaceId) -> Result<Vec<Polygon>>;
    async fn save_polygon(&self, update: &PolygonUpdate) -> Result<()>;
    async fn export_analysis(&self, workspace: WorkspaceId) -> Result<serde_json::Value>;
}

/// Resolves tile keys to decoded images. `Ok(None)` means the tile does not exist.
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn resolve_tile(&self, key: &TileKey) -> Result<Option<TileImage>>;
}

pub fn analysis_file_name(workspace: WorkspaceId) -> String {
    format!("workspace_{workspace}_analysis.json")
}
