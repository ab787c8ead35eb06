pub mod config;
pub mod editor;
pub mod error;
pub mod input;
pub mod layout;
pub mod model;
pub mod source;
pub mod spatial;
pub mod store;
pub mod tiles;
pub mod transform;
pub mod viewer;

pub use config::ViewerConfig;
pub use editor::{Decision, EditPhase, PendingDecision, SaveOutcome, VertexRef};
pub use error::ViewerError;
pub use input::{Hit, InputEvent, Key};
pub use model::{
    Page, Point, Polygon, PolygonCollection, PolygonId, PolygonUpdate, Rect, WorkspaceId,
    WorkspaceSummary,
};
pub use source::{analysis_file_name, TileSource, WorkspaceSource};
pub use store::{FileStateStore, MemoryStateStore, StateStore, ViewState};
pub use tiles::{TileImage, TileKey, TileStore, VisibleTile, TILE_SIZE};
pub use transform::{StageSize, Transform, ZoomLevel};
pub use viewer::{
    Command, Frame, HandleState, HandleView, LoadTicket, SaveRequest, ShapeView, Status,
    TileView, Tool, Viewer, ViewerEvent,
};
