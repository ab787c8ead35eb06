use crate::model::{Point, PolygonCollection, PolygonId, PolygonUpdate, MIN_RING_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexRef {
    pub polygon: PolygonId,
    pub index: usize,
}

impl VertexRef {
    pub fn new(polygon: PolygonId, index: usize) -> Self {
        Self { polygon, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPhase {
    Idle,
    PolygonSelected,
    VertexSelected,
    Dragging,
    AwaitingDecision,
    Saving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Save,
    Discard,
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecision {
    pub polygon: PolygonId,
    pub then_select: Option<PolygonId>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    Selected(PolygonId),
    Reselected(PolygonId),
    DecisionRequired,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeselectOutcome {
    Deselected,
    DecisionRequired,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Save(PolygonUpdate),
    Discarded(Option<PolygonId>),
    Cancelled,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(Option<PolygonId>),
    Failed(String),
    Stale,
}

#[derive(Debug, Clone)]
struct Selection {
    polygon: PolygonId,
    snapshot: Vec<Point>,
    vertex: Option<usize>,
    dragging: bool,
    decision: Option<PendingDecision>,
    saving: bool,
    save_error: Option<String>,
}

impl Selection {
    fn new(polygon: PolygonId, snapshot: Vec<Point>) -> Self {
        Self {
            polygon,
            snapshot,
            vertex: None,
            dragging: false,
            decision: None,
            saving: false,
            save_error: None,
        }
    }

    fn locked(&self) -> bool {
        self.decision.is_some() || self.saving
    }
}

/// Selection, hover, drag and the deselect protocol for one workspace.
#[derive(Debug, Clone, Default)]
pub struct Editor {
    selection: Option<Selection>,
    hovered: Option<VertexRef>,
}

impl Editor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> EditPhase {
        match &self.selection {
            None => EditPhase::Idle,
            Some(sel) if sel.saving => EditPhase::Saving,
            Some(sel) if sel.decision.is_some() => EditPhase::AwaitingDecision,
            Some(sel) if sel.dragging => EditPhase::Dragging,
            Some(sel) if sel.vertex.is_some() => EditPhase::VertexSelected,
            Some(_) => EditPhase::PolygonSelected,
        }
    }

    pub fn selected_polygon(&self) -> Option<PolygonId> {
        self.selection.as_ref().map(|sel| sel.polygon)
    }

    pub fn selected_vertex(&self) -> Option<VertexRef> {
        let sel = self.selection.as_ref()?;
        sel.vertex.map(|index| VertexRef::new(sel.polygon, index))
    }

    pub fn hovered_vertex(&self) -> Option<VertexRef> {
        self.hovered
    }

    pub fn pending_decision(&self) -> Option<&PendingDecision> {
        self.selection.as_ref()?.decision.as_ref()
    }

    pub fn save_error(&self) -> Option<&str> {
        self.selection.as_ref()?.save_error.as_deref()
    }

    pub fn snapshot(&self) -> Option<&[Point]> {
        self.selection.as_ref().map(|sel| sel.snapshot.as_slice())
    }

    pub fn is_locked(&self) -> bool {
        self.selection.as_ref().is_some_and(Selection::locked)
    }

    pub fn is_dirty(&self, polygons: &PolygonCollection) -> bool {
        self.selection.as_ref().is_some_and(|sel| {
            polygons
                .ring(sel.polygon)
                .is_some_and(|ring| ring != sel.snapshot.as_slice())
        })
    }

    pub fn clear(&mut self) {
        self.selection = None;
        self.hovered = None;
    }

    pub fn select_polygon(&mut self, polygons: &PolygonCollection, id: PolygonId) -> SelectOutcome {
        let Some(ring) = polygons.ring(id) else {
            return SelectOutcome::Ignored;
        };
        if self.is_locked() {
            return SelectOutcome::Ignored;
        }
        if let Some(sel) = self.selection.as_mut() {
            if sel.polygon == id {
                sel.vertex = None;
                sel.dragging = false;
                self.hovered = None;
                return SelectOutcome::Reselected(id);
            }
        }
        if self.is_dirty(polygons) {
            self.open_decision(Some(id));
            return SelectOutcome::DecisionRequired;
        }
        self.selection = Some(Selection::new(id, ring.to_vec()));
        self.hovered = None;
        SelectOutcome::Selected(id)
    }

    pub fn select_vertex(&mut self, polygons: &PolygonCollection, vertex: VertexRef) -> bool {
        let Some(sel) = self.editable_selection(vertex.polygon) else {
            return false;
        };
        let in_ring = polygons
            .ring(vertex.polygon)
            .is_some_and(|ring| vertex.index < ring.len());
        if !in_ring {
            return false;
        }
        sel.vertex = Some(vertex.index);
        sel.dragging = false;
        true
    }

    pub fn hover_vertex(&mut self, vertex: Option<VertexRef>) -> bool {
        if self.hovered == vertex {
            return false;
        }
        self.hovered = vertex;
        true
    }

    pub fn begin_drag(&mut self, polygons: &PolygonCollection, vertex: VertexRef) -> bool {
        if !self.select_vertex(polygons, vertex) {
            return false;
        }
        if let Some(sel) = self.selection.as_mut() {
            sel.dragging = true;
        }
        true
    }

    pub fn drag_to(&mut self, polygons: &mut PolygonCollection, position: Point) -> bool {
        let Some(sel) = self.selection.as_ref() else {
            return false;
        };
        if !sel.dragging || sel.locked() {
            return false;
        }
        let Some(index) = sel.vertex else {
            return false;
        };
        match polygons
            .ring_mut(sel.polygon)
            .and_then(|ring| ring.get_mut(index))
        {
            Some(slot) => {
                *slot = position;
                true
            }
            None => false,
        }
    }

    pub fn end_drag(&mut self) -> bool {
        match self.selection.as_mut() {
            Some(sel) if sel.dragging => {
                sel.dragging = false;
                true
            }
            _ => false,
        }
    }

    pub fn insert_vertex_after_selected(&mut self, polygons: &mut PolygonCollection) -> bool {
        let Some(sel) = self.selection.as_mut() else {
            return false;
        };
        if sel.locked() || sel.dragging {
            return false;
        }
        let Some(index) = sel.vertex else {
            return false;
        };
        let Some(ring) = polygons.ring_mut(sel.polygon) else {
            return false;
        };
        let len = ring.len();
        if index >= len {
            return false;
        }
        let prev = ring[(index + len - 1) % len];
        let next = ring[(index + 1) % len];
        ring.insert(index + 1, prev.midpoint(next));
        sel.vertex = Some(index + 1);
        self.hovered = None;
        true
    }

    pub fn remove_selected_vertex(&mut self, polygons: &mut PolygonCollection) -> bool {
        let Some(sel) = self.selection.as_mut() else {
            return false;
        };
        if sel.locked() || sel.dragging {
            return false;
        }
        let Some(index) = sel.vertex else {
            return false;
        };
        let Some(ring) = polygons.ring_mut(sel.polygon) else {
            return false;
        };
        if ring.len() <= MIN_RING_LEN || index >= ring.len() {
            return false;
        }
        ring.remove(index);
        sel.vertex = None;
        self.hovered = None;
        true
    }

    pub fn request_deselect(&mut self, polygons: &PolygonCollection) -> DeselectOutcome {
        match &self.selection {
            None => return DeselectOutcome::Ignored,
            Some(sel) if sel.locked() => return DeselectOutcome::Ignored,
            Some(_) => {}
        }
        if self.is_dirty(polygons) {
            self.open_decision(None);
            DeselectOutcome::DecisionRequired
        } else {
            self.clear();
            DeselectOutcome::Deselected
        }
    }

    pub fn decide(&mut self, polygons: &mut PolygonCollection, decision: Decision) -> DecisionOutcome {
        let Some(sel) = self.selection.as_mut() else {
            return DecisionOutcome::Ignored;
        };
        if sel.saving {
            return DecisionOutcome::Ignored;
        }
        let Some(pending) = sel.decision.as_ref() else {
            return DecisionOutcome::Ignored;
        };
        match decision {
            Decision::Cancel => {
                sel.decision = None;
                DecisionOutcome::Cancelled
            }
            Decision::Save => {
                let Some(ring) = polygons.ring(sel.polygon) else {
                    return DecisionOutcome::Ignored;
                };
                sel.saving = true;
                DecisionOutcome::Save(PolygonUpdate {
                    polygon: sel.polygon,
                    vertices: ring.to_vec(),
                })
            }
            Decision::Discard => {
                let follow_up = pending.then_select;
                if let Some(ring) = polygons.ring_mut(sel.polygon) {
                    ring.clone_from(&sel.snapshot);
                }
                self.clear();
                let selected = follow_up.and_then(|id| match self.select_polygon(polygons, id) {
                    SelectOutcome::Selected(id) => Some(id),
                    _ => None,
                });
                DecisionOutcome::Discarded(selected)
            }
        }
    }

    pub fn finish_save(
        &mut self,
        polygons: &PolygonCollection,
        polygon: PolygonId,
        result: Result<(), String>,
    ) -> SaveOutcome {
        let Some(sel) = self.selection.as_mut() else {
            return SaveOutcome::Stale;
        };
        if !sel.saving || sel.polygon != polygon {
            return SaveOutcome::Stale;
        }
        match result {
            Ok(()) => {
                let follow_up = sel.decision.as_ref().and_then(|pending| pending.then_select);
                self.clear();
                let selected = follow_up.and_then(|id| match self.select_polygon(polygons, id) {
                    SelectOutcome::Selected(id) => Some(id),
                    _ => None,
                });
                SaveOutcome::Saved(selected)
            }
            Err(message) => {
                sel.saving = false;
                sel.decision = None;
                sel.save_error = Some(message.clone());
                SaveOutcome::Failed(message)
            }
        }
    }

    fn editable_selection(&mut self, polygon: PolygonId) -> Option<&mut Selection> {
        self.selection
            .as_mut()
            .filter(|sel| sel.polygon == polygon && !sel.locked())
    }

    fn open_decision(&mut self, then_select: Option<PolygonId>) {
        if let Some(sel) = self.selection.as_mut() {
            sel.dragging = false;
            sel.decision = Some(PendingDecision {
                polygon: sel.polygon,
                then_select,
                last_error: sel.save_error.clone(),
            });
        }
    }
}
