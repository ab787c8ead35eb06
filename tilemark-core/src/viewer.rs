use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ViewerConfig;
use crate::editor::{
    Decision, DecisionOutcome, DeselectOutcome, EditPhase, Editor, PendingDecision, SaveOutcome,
    SelectOutcome, VertexRef,
};
use crate::error::ViewerError;
use crate::input::{Action, Hit, InputController, InputEvent, Key};
use crate::layout::PageLayout;
use crate::model::{
    Page, Point, Polygon, PolygonCollection, PolygonId, PolygonUpdate, Rect, WorkspaceId,
    WorkspaceSummary,
};
use crate::source::WorkspaceSource;
use crate::spatial::{Bounds, IndexedPolygon, PolygonIndex};
use crate::store::{StateStore, ViewState};
use crate::tiles::{visible_tiles, VisibleTile};
use crate::transform::{StageSize, Transform, ZoomLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    #[default]
    Select,
    Pan,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Select => f.write_str("select"),
            Tool::Pan => f.write_str("pan"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SelectPolygon(PolygonId),
    SelectVertex(VertexRef),
    HoverVertex(Option<VertexRef>),
    InsertVertex,
    RemoveVertex,
    RequestDeselect,
    Decide(Decision),
    SetTool(Tool),
    ZoomAt { pointer: Point, delta: f64 },
    ZoomBy { factor: f64 },
    PanBy { dx: f64, dy: f64 },
    ResetView,
    Resize(StageSize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    RedrawNeeded,
    SelectionChanged(Option<PolygonId>),
    DecisionRequired(PendingDecision),
    SaveRequested(SaveRequest),
    Saved(PolygonId),
    SaveFailed { polygon: PolygonId, message: String },
    WorkspaceLoaded(WorkspaceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub workspace: WorkspaceId,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest {
    pub workspace: WorkspaceId,
    pub update: PolygonUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Normal,
    Hovered,
    Selected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandleView {
    pub vertex: VertexRef,
    pub center: Point,
    pub radius: f64,
    pub state: HandleState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeView {
    pub id: PolygonId,
    pub polygon_id: u64,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileView {
    pub tile: VisibleTile,
    pub screen: Rect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stage: StageSize,
    pub transform: Transform,
    pub zoom_level: ZoomLevel,
    pub visual_scale: f64,
    pub viewport: Rect,
    pub tiles: Vec<TileView>,
    pub selected: Option<ShapeView>,
    pub others: Vec<ShapeView>,
    pub handles: Vec<HandleView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub workspace: Option<WorkspaceId>,
    pub page: Option<usize>,
    pub page_count: usize,
    pub zoom_level: ZoomLevel,
    pub scale: f64,
    pub tool: Tool,
    pub phase: EditPhase,
    pub unsaved: bool,
    pub error: Option<String>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.workspace {
            Some(id) => write!(f, "workspace {id}")?,
            None => f.write_str("no workspace")?,
        }
        if let Some(page) = self.page {
            write!(f, " | page {}/{}", page, self.page_count)?;
        }
        write!(
            f,
            " | zoom {} ({:.0}%) | {}",
            self.zoom_level,
            self.scale * 100.0,
            self.tool
        )?;
        match self.phase {
            EditPhase::AwaitingDecision => f.write_str(" | unsaved changes: save, discard or cancel?")?,
            EditPhase::Saving => f.write_str(" | saving...")?,
            _ if self.unsaved => f.write_str(" | unsaved")?,
            _ => {}
        }
        if let Some(error) = &self.error {
            write!(f, " | error: {error}")?;
        }
        Ok(())
    }
}

/// Owned state of one viewer: the open workspace, its polygons, the view
/// transform and the editing session.
pub struct Viewer {
    config: ViewerConfig,
    store: Arc<dyn StateStore>,
    events: Mutex<Vec<ViewerEvent>>,
    workspaces: Vec<WorkspaceSummary>,
    workspace: Option<WorkspaceId>,
    generation: u64,
    loading: Option<LoadTicket>,
    fit_on_load: bool,
    pages: Vec<Page>,
    polygons: PolygonCollection,
    transform: Transform,
    stage: StageSize,
    tool: Tool,
    editor: Editor,
    input: InputController,
    layout: PageLayout,
    index: PolygonIndex,
    index_stale: bool,
    last_error: Option<String>,
}

impl Viewer {
    pub fn new(config: ViewerConfig, store: Arc<dyn StateStore>) -> Self {
        let config = config.sanitized();
        let transform = Transform::default();
        Self {
            input: InputController::new(config.click_threshold),
            config,
            store,
            events: Mutex::new(Vec::new()),
            workspaces: Vec::new(),
            workspace: None,
            generation: 0,
            loading: None,
            fit_on_load: false,
            pages: Vec::new(),
            polygons: PolygonCollection::default(),
            transform,
            stage: StageSize::default(),
            tool: Tool::Select,
            editor: Editor::new(),
            layout: PageLayout::new(&[], transform.zoom_level()),
            index: PolygonIndex::default(),
            index_stale: true,
            last_error: None,
        }
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn emit(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }

    pub fn workspace(&self) -> Option<WorkspaceId> {
        self.workspace
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn polygons(&self) -> &PolygonCollection {
        &self.polygons
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn scale(&self) -> f64 {
        self.transform.scale
    }

    pub fn position(&self) -> Point {
        self.transform.position
    }

    pub fn zoom_level(&self) -> ZoomLevel {
        self.transform.zoom_level()
    }

    pub fn visual_scale(&self) -> f64 {
        self.transform.visual_scale()
    }

    pub fn stage(&self) -> StageSize {
        self.stage
    }

    pub fn viewport(&self) -> Rect {
        self.transform.viewport(self.stage)
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn phase(&self) -> EditPhase {
        self.editor.phase()
    }

    pub fn selected_polygon(&self) -> Option<PolygonId> {
        self.editor.selected_polygon()
    }

    pub fn selected_vertex(&self) -> Option<VertexRef> {
        self.editor.selected_vertex()
    }

    pub fn hovered_vertex(&self) -> Option<VertexRef> {
        self.editor.hovered_vertex()
    }

    pub fn pending_decision(&self) -> Option<&PendingDecision> {
        self.editor.pending_decision()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.editor.is_dirty(&self.polygons)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn current_page(&self) -> Option<usize> {
        let level = self.zoom_level();
        let centre = self.viewport().center();
        if self.layout.level() == level {
            self.layout.page_at(centre.y)
        } else {
            PageLayout::new(&self.pages, level).page_at(centre.y)
        }
    }

    pub fn status(&self) -> Status {
        Status {
            workspace: self.workspace,
            page: self.current_page(),
            page_count: self.pages.len(),
            zoom_level: self.zoom_level(),
            scale: self.scale(),
            tool: self.tool,
            phase: self.phase(),
            unsaved: self.has_unsaved_changes(),
            error: self
                .editor
                .save_error()
                .map(|message| format!("save failed: {message}"))
                .or_else(|| self.last_error.clone()),
        }
    }

    pub fn set_workspaces(&mut self, workspaces: Vec<WorkspaceSummary>) {
        self.workspaces = workspaces;
    }

    pub fn workspaces(&self) -> &[WorkspaceSummary] {
        &self.workspaces
    }

    pub fn adjacent_workspace(&self, step: isize) -> Option<WorkspaceId> {
        let len = self.workspaces.len();
        if len == 0 {
            return None;
        }
        let current = self
            .workspace
            .and_then(|id| self.workspaces.iter().position(|ws| ws.id == id));
        let next = match current {
            Some(index) => (index as isize + step).rem_euclid(len as isize) as usize,
            None => 0,
        };
        Some(self.workspaces[next].id)
    }

    pub fn switch_workspace(&mut self, workspace: WorkspaceId) {
        if let Err(err) = self.persist_view() {
            if self.workspace.is_some() {
                warn!(?err, "failed to persist view state");
            }
        }

        self.workspace = Some(workspace);
        self.loading = None;
        self.pages.clear();
        self.polygons = PolygonCollection::default();
        self.editor.clear();
        self.input.cancel();
        self.index_stale = true;
        self.last_error = None;

        match self.store.load(workspace) {
            Ok(Some(state)) if state.is_usable() => {
                self.transform = state.transform;
                self.tool = state.tool;
                self.fit_on_load = false;
            }
            Ok(Some(state)) => {
                warn!(workspace, scale = state.transform.scale, "ignoring unusable view state");
                self.tool = state.tool;
                self.fit_on_load = true;
            }
            Ok(None) => self.fit_on_load = true,
            Err(err) => {
                warn!(?err, workspace, "failed to restore view state");
                self.fit_on_load = true;
            }
        }
        self.emit(ViewerEvent::SelectionChanged(None));
        self.emit(ViewerEvent::RedrawNeeded);
    }

    pub fn begin_load(&mut self, workspace: WorkspaceId) -> LoadTicket {
        self.switch_workspace(workspace);
        self.generation += 1;
        let ticket = LoadTicket {
            workspace,
            generation: self.generation,
        };
        self.loading = Some(ticket);
        ticket
    }

    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        pages: Result<Vec<Page>>,
        polygons: Result<Vec<Polygon>>,
    ) -> bool {
        if self.loading != Some(ticket) {
            debug!(workspace = ticket.workspace, "dropping stale workspace load");
            return false;
        }
        self.loading = None;

        let mut failures = Vec::new();
        self.pages = pages.unwrap_or_else(|err| {
            warn!(?err, workspace = ticket.workspace, "failed to fetch pages");
            failures.push("pages");
            Vec::new()
        });
        let polygons = polygons.unwrap_or_else(|err| {
            warn!(?err, workspace = ticket.workspace, "failed to fetch polygons");
            failures.push("polygons");
            Vec::new()
        });
        self.polygons = PolygonCollection::new(polygons);
        self.index_stale = true;
        if !failures.is_empty() {
            self.last_error = Some(format!("failed to load {}", failures.join(" and ")));
        }
        self.fit_if_pending();

        info!(
            workspace = ticket.workspace,
            pages = self.pages.len(),
            polygons = self.polygons.len(),
            "workspace loaded"
        );
        self.emit(ViewerEvent::WorkspaceLoaded(ticket.workspace));
        self.emit(ViewerEvent::RedrawNeeded);
        true
    }

    #[instrument(skip(self, source))]
    pub async fn open_with<S>(&mut self, source: &S, workspace: WorkspaceId) -> Result<()>
    where
        S: WorkspaceSource + ?Sized,
    {
        let ticket = self.begin_load(workspace);
        let pages = source.fetch_pages(workspace).await;
        let polygons = source.fetch_polygons(workspace).await;
        self.finish_load(ticket, pages, polygons);
        Ok(())
    }

    pub fn persist_view(&self) -> Result<()> {
        let Some(workspace) = self.workspace else {
            bail!(ViewerError::NoWorkspace);
        };
        let state = ViewState {
            transform: self.transform,
            tool: self.tool,
        };
        self.store.save(workspace, &state)
    }

    pub fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SelectPolygon(id) => {
                let Some(workspace) = self.workspace else {
                    bail!(ViewerError::NoWorkspace);
                };
                if self.polygons.get(id).is_none() {
                    bail!(ViewerError::UnknownPolygon(id, workspace));
                }
                self.select_polygon(id);
            }
            Command::SelectVertex(vertex) => {
                if self.editor.select_vertex(&self.polygons, vertex) {
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
            Command::HoverVertex(vertex) => {
                if self.editor.hover_vertex(vertex) {
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
            Command::InsertVertex => {
                if self.editor.insert_vertex_after_selected(&mut self.polygons) {
                    self.polygons_changed();
                }
            }
            Command::RemoveVertex => {
                if self.editor.remove_selected_vertex(&mut self.polygons) {
                    self.polygons_changed();
                }
            }
            Command::RequestDeselect => self.request_deselect(),
            Command::Decide(decision) => {
                if let Some(request) = self.decide(decision) {
                    self.emit(ViewerEvent::SaveRequested(request));
                }
            }
            Command::SetTool(tool) => {
                self.tool = if self.tool == tool { Tool::Select } else { tool };
                self.emit(ViewerEvent::RedrawNeeded);
            }
            Command::ZoomAt { pointer, delta } => {
                self.perform(Action::Zoom { pointer, delta });
            }
            Command::ZoomBy { factor } => {
                let centre = Point::new(self.stage.width / 2.0, self.stage.height / 2.0);
                let before = self.transform;
                self.transform.rescale_around(centre, self.transform.scale * factor);
                if self.transform != before {
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
            Command::PanBy { dx, dy } => self.perform(Action::Pan { dx, dy }),
            Command::ResetView => self.reset_view(),
            Command::Resize(stage) => {
                if stage != self.stage {
                    self.stage = stage;
                    self.fit_if_pending();
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
        }
        Ok(())
    }

    pub fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::PointerDown {
                position,
                pan_modifier,
            } => {
                let abandoned = self.input.cancel();
                self.perform(abandoned);
                let hit = if self.editor.is_locked() {
                    Hit::Background
                } else {
                    self.hit_test(position)
                };
                let pan_mode = pan_modifier || self.tool == Tool::Pan;
                let action = self.input.pointer_down(position, hit, pan_mode);
                self.perform(action);
            }
            InputEvent::PointerMove { position } => {
                if self.input.is_idle() {
                    let hovered = match self.hit_test(position) {
                        Hit::Vertex(vertex) => Some(vertex),
                        _ => None,
                    };
                    if self.editor.hover_vertex(hovered) {
                        self.emit(ViewerEvent::RedrawNeeded);
                    }
                } else {
                    let action = self.input.pointer_move(position);
                    self.perform(action);
                }
            }
            InputEvent::PointerUp { position } => {
                let action = self.input.pointer_up(position);
                self.perform(action);
            }
            InputEvent::Wheel { position, delta } => {
                let action = self.input.wheel(position, delta);
                self.perform(action);
            }
            InputEvent::Key(Key::Delete) => {
                if self.editor.remove_selected_vertex(&mut self.polygons) {
                    self.polygons_changed();
                }
            }
            InputEvent::Key(Key::Insert) => {
                if self.editor.insert_vertex_after_selected(&mut self.polygons) {
                    self.polygons_changed();
                }
            }
            InputEvent::Key(Key::Escape) => {
                if self.editor.pending_decision().is_some() {
                    self.decide(Decision::Cancel);
                } else {
                    self.request_deselect();
                }
            }
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::None => {}
            Action::Pan { dx, dy } => {
                self.transform.pan_by(dx, dy);
                self.emit(ViewerEvent::RedrawNeeded);
            }
            Action::Zoom { pointer, delta } => {
                let before = self.transform;
                self.transform.zoom_at(pointer, delta, self.config.zoom_step);
                if self.transform != before {
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
            Action::SelectPolygon(id) => self.select_polygon(id),
            Action::BeginVertexDrag(vertex) => {
                if self.editor.begin_drag(&self.polygons, vertex) {
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
            Action::DragVertex { vertex, screen } => {
                let Some(page_number) = self.polygons.get(vertex.polygon).map(|p| p.page_number)
                else {
                    return;
                };
                self.refresh();
                let level = self.transform.screen_to_level(screen);
                let native = self.layout.to_page(page_number, level);
                if self.editor.drag_to(&mut self.polygons, native) {
                    self.polygons_changed();
                }
            }
            Action::EndVertexDrag(_) => {
                if self.editor.end_drag() {
                    self.emit(ViewerEvent::RedrawNeeded);
                }
            }
            Action::BackgroundClick => self.request_deselect(),
        }
    }

    fn select_polygon(&mut self, id: PolygonId) {
        match self.editor.select_polygon(&self.polygons, id) {
            SelectOutcome::Selected(id) | SelectOutcome::Reselected(id) => {
                self.emit(ViewerEvent::SelectionChanged(Some(id)));
                self.emit(ViewerEvent::RedrawNeeded);
            }
            SelectOutcome::DecisionRequired => self.decision_opened(),
            SelectOutcome::Ignored => {}
        }
    }

    fn request_deselect(&mut self) {
        match self.editor.request_deselect(&self.polygons) {
            DeselectOutcome::Deselected => {
                self.emit(ViewerEvent::SelectionChanged(None));
                self.emit(ViewerEvent::RedrawNeeded);
            }
            DeselectOutcome::DecisionRequired => self.decision_opened(),
            DeselectOutcome::Ignored => {}
        }
    }

    fn decision_opened(&mut self) {
        let abandoned = self.input.cancel();
        self.perform(abandoned);
        if let Some(pending) = self.editor.pending_decision().cloned() {
            self.emit(ViewerEvent::DecisionRequired(pending));
            self.emit(ViewerEvent::RedrawNeeded);
        }
    }

    fn decide(&mut self, decision: Decision) -> Option<SaveRequest> {
        let workspace = self.workspace?;
        match self.editor.decide(&mut self.polygons, decision) {
            DecisionOutcome::Save(update) => {
                self.emit(ViewerEvent::RedrawNeeded);
                Some(SaveRequest { workspace, update })
            }
            DecisionOutcome::Discarded(next) => {
                self.polygons_changed();
                self.emit(ViewerEvent::SelectionChanged(next));
                None
            }
            DecisionOutcome::Cancelled => {
                self.emit(ViewerEvent::RedrawNeeded);
                None
            }
            DecisionOutcome::Ignored => None,
        }
    }

    /// Applies the result of a save. Results for a workspace or polygon that
    /// is no longer being saved are dropped.
    pub fn finish_save(&mut self, request: &SaveRequest, result: Result<()>) -> SaveOutcome {
        if self.workspace != Some(request.workspace) {
            debug!(polygon = request.update.polygon, "dropping save result for inactive workspace");
            return SaveOutcome::Stale;
        }
        let polygon = request.update.polygon;
        let outcome = self.editor.finish_save(
            &self.polygons,
            polygon,
            result.map_err(|err| format!("{err:#}")),
        );
        match &outcome {
            SaveOutcome::Saved(next) => {
                info!(polygon, "polygon saved");
                self.last_error = None;
                self.emit(ViewerEvent::Saved(polygon));
                self.emit(ViewerEvent::SelectionChanged(*next));
                self.emit(ViewerEvent::RedrawNeeded);
            }
            SaveOutcome::Failed(message) => {
                warn!(polygon, %message, "polygon save failed");
                self.emit(ViewerEvent::SaveFailed {
                    polygon,
                    message: message.clone(),
                });
                self.emit(ViewerEvent::RedrawNeeded);
            }
            SaveOutcome::Stale => {
                debug!(polygon, "dropping stale save result");
            }
        }
        outcome
    }

    #[instrument(skip(self, source))]
    pub async fn save_with<S>(&mut self, source: &S) -> Result<SaveOutcome>
    where
        S: WorkspaceSource + ?Sized,
    {
        let Some(request) = self.decide(Decision::Save) else {
            return Ok(SaveOutcome::Stale);
        };
        let result = source.save_polygon(&request.update).await;
        Ok(self.finish_save(&request, result))
    }

    fn reset_view(&mut self) {
        let widest = self.pages.iter().map(|page| page.width).fold(0.0, f64::max);
        let scale = if widest > 0.0 && self.stage.width > 0.0 {
            self.stage.width / widest
        } else {
            1.0
        };
        self.transform = Transform {
            scale,
            position: Point::ORIGIN,
        };
        self.emit(ViewerEvent::RedrawNeeded);
    }

    fn fit_if_pending(&mut self) {
        if self.fit_on_load && self.loading.is_none() && self.stage.width > 0.0 {
            self.fit_on_load = false;
            self.reset_view();
        }
    }

    fn polygons_changed(&mut self) {
        self.index_stale = true;
        self.emit(ViewerEvent::RedrawNeeded);
    }

    fn refresh(&mut self) {
        let level = self.transform.zoom_level();
        if self.layout.level() != level || self.index_stale {
            self.layout = PageLayout::new(&self.pages, level);
            self.index = PolygonIndex::build(&self.polygons, &self.layout);
            self.index_stale = false;
        }
    }

    pub fn hit_test(&mut self, screen: Point) -> Hit {
        self.refresh();

        if let Some(vertex) = self.handle_at(screen) {
            return Hit::Vertex(vertex);
        }

        let visual = self.transform.visual_scale();
        let level = self.transform.screen_to_level(screen);
        let tolerance = self.config.edge_hit_tolerance / visual;
        let around = Bounds {
            min_x: level.x - tolerance,
            min_y: level.y - tolerance,
            max_x: level.x + tolerance,
            max_y: level.y + tolerance,
        };
        let selected = self.editor.selected_polygon();
        self.index
            .search_bounds(&around)
            .into_iter()
            .filter(|entry| {
                entry.contains(level) || entry.distance_to_outline(level) <= tolerance
            })
            .min_by(|a, b| {
                let rank = |entry: &IndexedPolygon| {
                    let area = (entry.bounds.max_x - entry.bounds.min_x)
                        * (entry.bounds.max_y - entry.bounds.min_y);
                    (Some(entry.id) != selected, area)
                };
                let (a_rank, a_area) = rank(a);
                let (b_rank, b_area) = rank(b);
                a_rank.cmp(&b_rank).then(a_area.total_cmp(&b_area))
            })
            .map_or(Hit::Background, |entry| Hit::Polygon(entry.id))
    }

    fn handle_at(&self, screen: Point) -> Option<VertexRef> {
        let entry = self.index.get(self.editor.selected_polygon()?)?;
        let selected = self.editor.selected_vertex();
        entry
            .scaled
            .iter()
            .enumerate()
            .filter_map(|(index, &vertex)| {
                let vertex_ref = VertexRef::new(entry.id, index);
                let radius = if Some(vertex_ref) == selected {
                    self.config.selected_handle_radius
                } else {
                    self.config.handle_radius
                };
                let distance = self.transform.level_to_screen(vertex).distance_to(screen);
                (distance <= radius).then_some((vertex_ref, distance))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(vertex_ref, _)| vertex_ref)
    }

    pub fn frame(&mut self) -> Frame {
        self.refresh();

        let transform = self.transform;
        let viewport = self.viewport();
        let tiles = match self.workspace {
            Some(workspace) => visible_tiles(workspace, &self.pages, &self.layout, &viewport),
            None => Vec::new(),
        };
        let tiles = tiles
            .into_iter()
            .map(|tile| {
                let origin = transform.level_to_screen(Point::new(tile.rect.x, tile.rect.y));
                let visual = transform.visual_scale();
                TileView {
                    tile,
                    screen: Rect::new(
                        origin.x,
                        origin.y,
                        tile.rect.width * visual,
                        tile.rect.height * visual,
                    ),
                }
            })
            .collect();

        let visible = self.index.partition(&viewport, self.editor.selected_polygon());
        let shape = |entry: &IndexedPolygon| ShapeView {
            id: entry.id,
            polygon_id: entry.polygon_id,
            points: entry
                .scaled
                .iter()
                .map(|&vertex| transform.level_to_screen(vertex))
                .collect(),
        };
        let selected = visible.selected.map(&shape);
        let others = visible.others.into_iter().map(&shape).collect();

        let handles = selected
            .as_ref()
            .map(|shape: &ShapeView| {
                let chosen = self.editor.selected_vertex();
                let hovered = self.editor.hovered_vertex();
                shape
                    .points
                    .iter()
                    .enumerate()
                    .map(|(index, &center)| {
                        let vertex = VertexRef::new(shape.id, index);
                        let state = if Some(vertex) == chosen {
                            HandleState::Selected
                        } else if Some(vertex) == hovered {
                            HandleState::Hovered
                        } else {
                            HandleState::Normal
                        };
                        let radius = if state == HandleState::Selected {
                            self.config.selected_handle_radius
                        } else {
                            self.config.handle_radius
                        };
                        HandleView {
                            vertex,
                            center,
                            radius,
                            state,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Frame {
            stage: self.stage,
            transform,
            zoom_level: transform.zoom_level(),
            visual_scale: transform.visual_scale(),
            viewport,
            tiles,
            selected,
            others,
            handles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use crate::tiles::TileKey;

    use anyhow::anyhow;

    struct FakeSource {
        polygons: Vec<Polygon>,
        fail_polygons: bool,
        fail_saves: bool,
        saved: Mutex<Vec<PolygonUpdate>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                polygons: vec![
                    square(1, 1, 100.0, 100.0, 200.0),
                    square(2, 1, 500.0, 100.0, 200.0),
                    square(3, 2, 100.0, 100.0, 50.0),
                ],
                fail_polygons: false,
                fail_saves: false,
                saved: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl WorkspaceSource for FakeSource {
        async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
            Ok(vec![
                WorkspaceSummary {
                    id: 1,
                    name: "first".into(),
                },
                WorkspaceSummary {
                    id: 2,
                    name: "second".into(),
                },
            ])
        }

        async fn fetch_pages(&self, _workspace: WorkspaceId) -> Result<Vec<Page>> {
            Ok(vec![
                Page {
                    width: 1000.0,
                    height: 800.0,
                },
                Page {
                    width: 1000.0,
                    height: 800.0,
                },
            ])
        }

        async fn fetch_polygons(&self, _workspace: WorkspaceId) -> Result<Vec<Polygon>> {
            if self.fail_polygons {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.polygons.clone())
        }

        async fn save_polygon(&self, update: &PolygonUpdate) -> Result<()> {
            if self.fail_saves {
                return Err(anyhow!("HTTP 500"));
            }
            self.saved.lock().push(update.clone());
            Ok(())
        }

        async fn export_analysis(&self, workspace: WorkspaceId) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "workspace": workspace }))
        }
    }

    fn square(id: PolygonId, page_number: usize, x: f64, y: f64, size: f64) -> Polygon {
        Polygon {
            id,
            polygon_id: id + 100,
            page_number,
            ring: vec![
                Point::new(x, y),
                Point::new(x + size, y),
                Point::new(x + size, y + size),
                Point::new(x, y + size),
            ],
        }
    }

    fn viewer() -> (Viewer, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        store.save(1, &ViewState::default()).unwrap();
        store.save(2, &ViewState::default()).unwrap();
        let mut viewer = Viewer::new(ViewerConfig::default(), store.clone());
        viewer
            .apply(Command::Resize(StageSize::new(800.0, 600.0)))
            .unwrap();
        (viewer, store)
    }

    #[tokio::test]
    async fn fit_waits_for_the_stage_size() {
        let store = Arc::new(MemoryStateStore::new());
        let mut viewer = Viewer::new(ViewerConfig::default(), store);
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        assert_eq!(viewer.scale(), 1.0);

        viewer
            .apply(Command::Resize(StageSize::new(800.0, 600.0)))
            .unwrap();
        assert_eq!(viewer.scale(), 0.8);
        assert_eq!(viewer.position(), Point::ORIGIN);

        viewer.apply(Command::PanBy { dx: -10.0, dy: -20.0 }).unwrap();
        viewer
            .apply(Command::Resize(StageSize::new(400.0, 300.0)))
            .unwrap();
        assert_eq!(viewer.scale(), 0.8);
    }

    #[tokio::test]
    async fn unusable_stored_view_is_replaced_by_a_fit() {
        let (mut viewer, store) = viewer();
        let broken = ViewState {
            transform: Transform {
                scale: 0.0,
                position: Point::new(5.0, 5.0),
            },
            tool: Tool::Pan,
        };
        store.save(1, &broken).unwrap();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        assert_eq!(viewer.scale(), 0.8);
        assert_eq!(viewer.position(), Point::ORIGIN);
        assert_eq!(viewer.tool(), Tool::Pan);

        let nan = ViewState {
            transform: Transform {
                scale: f64::NAN,
                position: Point::ORIGIN,
            },
            tool: Tool::Select,
        };
        store.save(2, &nan).unwrap();
        viewer.open_with(&FakeSource::new(), 2).await.unwrap();
        assert!(viewer.scale().is_finite() && viewer.scale() > 0.0);
        assert!(!viewer.viewport().width.is_nan());
    }

    fn click(viewer: &mut Viewer, x: f64, y: f64) {
        let position = Point::new(x, y);
        viewer.handle_input(InputEvent::PointerDown {
            position,
            pan_modifier: false,
        });
        viewer.handle_input(InputEvent::PointerUp { position });
    }

    fn drag(viewer: &mut Viewer, from: Point, to: Point) {
        viewer.handle_input(InputEvent::PointerDown {
            position: from,
            pan_modifier: false,
        });
        viewer.handle_input(InputEvent::PointerMove { position: to });
        viewer.handle_input(InputEvent::PointerUp { position: to });
    }

    #[tokio::test]
    async fn open_loads_content_and_culls_it() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();

        assert_eq!(viewer.pages().len(), 2);
        assert_eq!(viewer.polygons().len(), 3);
        assert!(viewer
            .drain_events()
            .contains(&ViewerEvent::WorkspaceLoaded(1)));

        let frame = viewer.frame();
        assert_eq!(frame.zoom_level, ZoomLevel::MAX);
        // 800x600 of page one: cols 0..=3, rows 0..=2
        assert_eq!(frame.tiles.len(), 12);
        assert!(frame.tiles.iter().all(|view| view.tile.key.page_index == 0));
        assert_eq!(
            frame.tiles[0].tile.key,
            TileKey {
                workspace: 1,
                page_index: 0,
                level: ZoomLevel::MAX,
                col: 0,
                row: 0,
            }
        );
        let mut ids: Vec<_> = frame.others.iter().map(|shape| shape.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(frame.selected.is_none());
        assert!(frame.handles.is_empty());
        assert_eq!(viewer.current_page(), Some(1));
    }

    #[tokio::test]
    async fn failed_polygon_fetch_leaves_empty_collection() {
        let (mut viewer, _) = viewer();
        let mut source = FakeSource::new();
        source.fail_polygons = true;
        viewer.open_with(&source, 1).await.unwrap();

        assert_eq!(viewer.pages().len(), 2);
        assert!(viewer.polygons().is_empty());
        assert_eq!(viewer.last_error(), Some("failed to load polygons"));
        assert!(viewer.frame().others.is_empty());
    }

    #[test]
    fn stale_load_is_dropped() {
        let (mut viewer, _) = viewer();
        let first = viewer.begin_load(1);
        let second = viewer.begin_load(2);
        assert!(!viewer.finish_load(first, Ok(vec![]), Ok(vec![square(1, 1, 0.0, 0.0, 5.0)])));
        assert!(viewer.polygons().is_empty());
        assert!(viewer.finish_load(second, Ok(vec![]), Ok(vec![])));
        assert!(!viewer.finish_load(second, Ok(vec![]), Ok(vec![])));
        assert_eq!(viewer.workspace(), Some(2));
    }

    #[tokio::test]
    async fn clicking_selects_and_hit_test_prefers_handles() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();

        assert_eq!(viewer.hit_test(Point::new(200.0, 200.0)), Hit::Polygon(1));
        assert_eq!(viewer.hit_test(Point::new(302.0, 200.0)), Hit::Polygon(1));
        assert_eq!(viewer.hit_test(Point::new(400.0, 200.0)), Hit::Background);

        click(&mut viewer, 200.0, 200.0);
        assert_eq!(viewer.selected_polygon(), Some(1));
        assert_eq!(viewer.phase(), EditPhase::PolygonSelected);
        assert_eq!(
            viewer.hit_test(Point::new(303.0, 102.0)),
            Hit::Vertex(VertexRef::new(1, 1))
        );

        let frame = viewer.frame();
        assert_eq!(frame.selected.as_ref().map(|shape| shape.id), Some(1));
        assert_eq!(frame.others.len(), 1);
        assert_eq!(frame.handles.len(), 4);
        assert!(frame.handles.iter().all(|h| h.radius == 6.0));
    }

    #[tokio::test]
    async fn hover_follows_pointer_over_handles() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        click(&mut viewer, 200.0, 200.0);

        viewer.handle_input(InputEvent::PointerMove {
            position: Point::new(101.0, 299.0),
        });
        assert_eq!(viewer.hovered_vertex(), Some(VertexRef::new(1, 3)));
        assert_eq!(viewer.phase(), EditPhase::PolygonSelected);
        let frame = viewer.frame();
        assert_eq!(frame.handles[3].state, HandleState::Hovered);

        viewer.handle_input(InputEvent::PointerMove {
            position: Point::new(200.0, 200.0),
        });
        assert_eq!(viewer.hovered_vertex(), None);
    }

    #[tokio::test]
    async fn vertex_drag_inverts_zoom_and_page_offset() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();

        // Zoom to 0.5 (level 5) and scroll page two into view.
        viewer.apply(Command::ZoomBy { factor: 0.5 }).unwrap();
        let origin = viewer.position();
        viewer
            .apply(Command::PanBy {
                dx: -origin.x,
                dy: -origin.y - 400.0,
            })
            .unwrap();
        assert_eq!(viewer.zoom_level(), ZoomLevel::new(5));

        // Polygon 3 sits on page two at (100, 100); level (50, 400 + 50), screen (50, 50).
        click(&mut viewer, 60.0, 60.0);
        assert_eq!(viewer.selected_polygon(), Some(3));
        drag(&mut viewer, Point::new(50.0, 50.0), Point::new(40.0, 30.0));

        assert_eq!(viewer.phase(), EditPhase::VertexSelected);
        assert_eq!(viewer.selected_vertex(), Some(VertexRef::new(3, 0)));
        let ring = viewer.polygons().ring(3).unwrap();
        assert_eq!(ring[0], Point::new(80.0, 60.0));
        assert_eq!(ring.len(), 4);
        assert!(viewer.has_unsaved_changes());
    }

    #[tokio::test]
    async fn background_click_on_dirty_polygon_saves() {
        let (mut viewer, _) = viewer();
        let source = FakeSource::new();
        viewer.open_with(&source, 1).await.unwrap();
        click(&mut viewer, 200.0, 200.0);
        drag(&mut viewer, Point::new(300.0, 100.0), Point::new(320.0, 90.0));
        viewer.drain_events();

        click(&mut viewer, 400.0, 500.0);
        assert_eq!(viewer.phase(), EditPhase::AwaitingDecision);
        assert!(viewer
            .drain_events()
            .iter()
            .any(|event| matches!(event, ViewerEvent::DecisionRequired(_))));

        // Interaction is blocked while the prompt is open.
        drag(&mut viewer, Point::new(100.0, 100.0), Point::new(0.0, 0.0));
        assert_eq!(viewer.polygons().ring(1).unwrap()[0], Point::new(100.0, 100.0));

        let outcome = viewer.save_with(&source).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Saved(None));
        assert_eq!(viewer.phase(), EditPhase::Idle);
        let saved = source.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].polygon, 1);
        assert_eq!(saved[0].vertices[1], Point::new(320.0, 90.0));
        assert!(viewer.drain_events().contains(&ViewerEvent::Saved(1)));
    }

    #[tokio::test]
    async fn failed_save_keeps_selection() {
        let (mut viewer, _) = viewer();
        let mut source = FakeSource::new();
        source.fail_saves = true;
        viewer.open_with(&source, 1).await.unwrap();
        click(&mut viewer, 200.0, 200.0);
        drag(&mut viewer, Point::new(300.0, 100.0), Point::new(320.0, 90.0));
        viewer.apply(Command::RequestDeselect).unwrap();

        let outcome = viewer.save_with(&source).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Failed(_)));
        assert_eq!(viewer.selected_polygon(), Some(1));
        assert_eq!(viewer.phase(), EditPhase::VertexSelected);
        assert_eq!(viewer.polygons().ring(1).unwrap()[1], Point::new(320.0, 90.0));
        assert!(viewer.status().to_string().contains("save failed: "));
        assert!(viewer
            .drain_events()
            .iter()
            .any(|event| matches!(event, ViewerEvent::SaveFailed { polygon: 1, .. })));

        viewer.apply(Command::RequestDeselect).unwrap();
        assert!(viewer.pending_decision().unwrap().last_error.is_some());
        viewer.apply(Command::Decide(Decision::Discard)).unwrap();
        assert_eq!(viewer.selected_polygon(), None);
        assert!(!viewer.status().to_string().contains("save failed"));
    }

    #[tokio::test]
    async fn discard_through_commands_restores_ring() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        viewer.apply(Command::SelectPolygon(2)).unwrap();
        viewer
            .apply(Command::SelectVertex(VertexRef::new(2, 0)))
            .unwrap();
        viewer.apply(Command::InsertVertex).unwrap();
        assert_eq!(viewer.polygons().ring(2).unwrap().len(), 5);

        viewer.apply(Command::RequestDeselect).unwrap();
        viewer.apply(Command::Decide(Decision::Discard)).unwrap();
        assert_eq!(viewer.polygons().ring(2).unwrap(), square(2, 1, 500.0, 100.0, 200.0).ring.as_slice());
        assert_eq!(viewer.selected_polygon(), None);
    }

    #[tokio::test]
    async fn save_decision_emits_request_and_stale_results_are_dropped() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        viewer.apply(Command::SelectPolygon(1)).unwrap();
        viewer
            .apply(Command::SelectVertex(VertexRef::new(1, 0)))
            .unwrap();
        viewer.apply(Command::RemoveVertex).unwrap();
        viewer.apply(Command::RequestDeselect).unwrap();
        viewer.drain_events();
        viewer.apply(Command::Decide(Decision::Save)).unwrap();

        let request = viewer
            .drain_events()
            .into_iter()
            .find_map(|event| match event {
                ViewerEvent::SaveRequested(request) => Some(request),
                _ => None,
            })
            .unwrap();
        assert_eq!(request.workspace, 1);
        assert_eq!(request.update.vertices.len(), 3);
        assert_eq!(viewer.phase(), EditPhase::Saving);

        viewer.open_with(&FakeSource::new(), 2).await.unwrap();
        assert_eq!(viewer.finish_save(&request, Ok(())), SaveOutcome::Stale);
        assert_eq!(viewer.selected_polygon(), None);
    }

    #[tokio::test]
    async fn escape_cancels_decision_then_deselects() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        click(&mut viewer, 200.0, 200.0);
        drag(&mut viewer, Point::new(100.0, 100.0), Point::new(90.0, 90.0));

        viewer.handle_input(InputEvent::Key(Key::Escape));
        assert_eq!(viewer.phase(), EditPhase::AwaitingDecision);
        viewer.handle_input(InputEvent::Key(Key::Escape));
        assert_eq!(viewer.phase(), EditPhase::VertexSelected);

        viewer.handle_input(InputEvent::Key(Key::Delete));
        assert_eq!(viewer.polygons().ring(1).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn pan_tool_and_modifier_pan_instead_of_selecting() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();

        viewer.apply(Command::SetTool(Tool::Pan)).unwrap();
        assert_eq!(viewer.tool(), Tool::Pan);
        drag(&mut viewer, Point::new(200.0, 200.0), Point::new(150.0, 180.0));
        assert_eq!(viewer.position(), Point::new(-50.0, -20.0));
        assert_eq!(viewer.selected_polygon(), None);

        viewer.apply(Command::SetTool(Tool::Pan)).unwrap();
        assert_eq!(viewer.tool(), Tool::Select);

        viewer.handle_input(InputEvent::PointerDown {
            position: Point::new(200.0, 200.0),
            pan_modifier: true,
        });
        viewer.handle_input(InputEvent::PointerUp {
            position: Point::new(200.0, 200.0),
        });
        assert_eq!(viewer.selected_polygon(), None);
    }

    #[tokio::test]
    async fn small_background_drag_deselects_but_pan_does_not() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        click(&mut viewer, 200.0, 200.0);

        drag(&mut viewer, Point::new(400.0, 500.0), Point::new(440.0, 520.0));
        assert_eq!(viewer.selected_polygon(), Some(1));

        drag(&mut viewer, Point::new(400.0, 500.0), Point::new(401.0, 500.0));
        assert_eq!(viewer.selected_polygon(), None);
    }

    #[tokio::test]
    async fn wheel_zoom_keeps_content_under_pointer() {
        let (mut viewer, _) = viewer();
        viewer.open_with(&FakeSource::new(), 1).await.unwrap();
        viewer.drain_events();

        let pointer = Point::new(300.0, 200.0);
        let before = viewer.transform().screen_to_native(pointer);
        for _ in 0..20 {
            viewer.handle_input(InputEvent::Wheel {
                position: pointer,
                delta: 1.0,
            });
        }
        let after = viewer.transform().screen_to_native(pointer);
        assert!((before.x - after.x).abs() < 1e-6);
        assert!((before.y - after.y).abs() < 1e-6);
        assert_eq!(viewer.zoom_level(), ZoomLevel::new(5));
        assert!(viewer.drain_events().contains(&ViewerEvent::RedrawNeeded));
    }

    #[tokio::test]
    async fn view_state_is_persisted_per_workspace() {
        let (mut viewer, store) = viewer();
        let source = FakeSource::new();
        viewer.open_with(&source, 1).await.unwrap();
        viewer.apply(Command::PanBy { dx: -30.0, dy: -70.0 }).unwrap();
        viewer.apply(Command::SetTool(Tool::Pan)).unwrap();

        viewer.open_with(&source, 2).await.unwrap();
        let stored = store.load(1).unwrap().unwrap();
        assert_eq!(stored.transform.position, Point::new(-30.0, -70.0));
        assert_eq!(stored.tool, Tool::Pan);
        assert_eq!(viewer.tool(), Tool::Select);

        viewer.open_with(&source, 1).await.unwrap();
        assert_eq!(viewer.position(), Point::new(-30.0, -70.0));
    }

    #[tokio::test]
    async fn unknown_workspace_state_fits_page_width() {
        let store = Arc::new(MemoryStateStore::new());
        let mut viewer = Viewer::new(ViewerConfig::default(), store);
        viewer
            .apply(Command::Resize(StageSize::new(500.0, 400.0)))
            .unwrap();
        viewer.open_with(&FakeSource::new(), 7).await.unwrap();
        assert_eq!(viewer.scale(), 0.5);
        assert_eq!(viewer.position(), Point::ORIGIN);
    }

    #[test]
    fn commands_that_need_content_report_errors() {
        let (mut viewer, _) = viewer();
        let err = viewer.apply(Command::SelectPolygon(1)).unwrap_err();
        assert_eq!(err.downcast_ref::<ViewerError>(), Some(&ViewerError::NoWorkspace));

        viewer.begin_load(4);
        let err = viewer.apply(Command::SelectPolygon(1)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ViewerError>(),
            Some(&ViewerError::UnknownPolygon(1, 4))
        );
        assert!(viewer.apply(Command::RemoveVertex).is_ok());
    }

    #[tokio::test]
    async fn workspaces_cycle_with_wrap_around() {
        let (mut viewer, _) = viewer();
        let source = FakeSource::new();
        viewer.set_workspaces(source.list_workspaces().await.unwrap());
        assert_eq!(viewer.adjacent_workspace(1), Some(1));
        viewer.open_with(&source, 2).await.unwrap();
        assert_eq!(viewer.adjacent_workspace(1), Some(1));
        assert_eq!(viewer.adjacent_workspace(-1), Some(1));
        viewer.open_with(&source, 1).await.unwrap();
        assert_eq!(viewer.adjacent_workspace(1), Some(2));
    }
}
