use thiserror::Error;

use crate::model::{PolygonId, WorkspaceId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewerError {
    #[error("no workspace is loaded")]
    NoWorkspace,

    #[error("polygon {0} is not part of workspace {1}")]
    UnknownPolygon(PolygonId, WorkspaceId),
}
