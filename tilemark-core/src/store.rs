use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::WorkspaceId;
use crate::transform::Transform;
use crate::viewer::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ViewState {
    #[serde(flatten)]
    pub transform: Transform,
    #[serde(default)]
    pub tool: Tool,
}

impl ViewState {
    pub fn is_usable(&self) -> bool {
        let Transform { scale, position } = self.transform;
        scale.is_finite() && scale > 0.0 && position.x.is_finite() && position.y.is_finite()
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, workspace: WorkspaceId) -> Result<Option<ViewState>>;
    fn save(&self, workspace: WorkspaceId, state: &ViewState) -> Result<()>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, workspace: WorkspaceId) -> PathBuf {
        self.root.join(format!("workspace_{workspace}.json"))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, workspace: WorkspaceId) -> Result<Option<ViewState>> {
        let path = self.state_path(workspace);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open state file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let state = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(Some(state))
    }

    fn save(&self, workspace: WorkspaceId, state: &ViewState) -> Result<()> {
        let path = self.state_path(workspace);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<WorkspaceId, ViewState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, workspace: WorkspaceId) -> Result<Option<ViewState>> {
        Ok(self.inner.lock().get(&workspace).copied())
    }

    fn save(&self, workspace: WorkspaceId, state: &ViewState) -> Result<()> {
        self.inner.lock().insert(workspace, *state);
        Ok(())
    }
}
