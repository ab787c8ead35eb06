use crate::editor::VertexRef;
use crate::model::{Point, PolygonId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    PointerDown { position: Point, pan_modifier: bool },
    PointerMove { position: Point },
    PointerUp { position: Point },
    Wheel { position: Point, delta: f64 },
    Key(Key),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Delete,
    Insert,
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    Vertex(VertexRef),
    Polygon(PolygonId),
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    None,
    Pan { dx: f64, dy: f64 },
    Zoom { pointer: Point, delta: f64 },
    SelectPolygon(PolygonId),
    BeginVertexDrag(VertexRef),
    DragVertex { vertex: VertexRef, screen: Point },
    EndVertexDrag(VertexRef),
    BackgroundClick,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanGesture {
    start: Point,
    last: Point,
    max_travel: f64,
    from_background: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Gesture {
    #[default]
    Idle,
    Pan(PanGesture),
    VertexDrag(VertexRef),
}

#[derive(Debug, Clone)]
pub struct InputController {
    gesture: Gesture,
    click_threshold: f64,
}

impl InputController {
    pub fn new(click_threshold: f64) -> Self {
        Self {
            gesture: Gesture::Idle,
            click_threshold,
        }
    }

    pub fn gesture(&self) -> Gesture {
        self.gesture
    }

    pub fn is_idle(&self) -> bool {
        self.gesture == Gesture::Idle
    }

    pub fn pointer_down(&mut self, position: Point, hit: Hit, pan_mode: bool) -> Action {
        match hit {
            _ if pan_mode || hit == Hit::Background => {
                self.gesture = Gesture::Pan(PanGesture {
                    start: position,
                    last: position,
                    max_travel: 0.0,
                    from_background: hit == Hit::Background,
                });
                Action::None
            }
            Hit::Vertex(vertex) => {
                self.gesture = Gesture::VertexDrag(vertex);
                Action::BeginVertexDrag(vertex)
            }
            Hit::Polygon(id) => Action::SelectPolygon(id),
            Hit::Background => Action::None,
        }
    }

    pub fn pointer_move(&mut self, position: Point) -> Action {
        match &mut self.gesture {
            Gesture::Idle => Action::None,
            Gesture::Pan(pan) => {
                let (dx, dy) = (position.x - pan.last.x, position.y - pan.last.y);
                pan.last = position;
                pan.max_travel = pan.max_travel.max(pan.start.distance_to(position));
                if dx == 0.0 && dy == 0.0 {
                    Action::None
                } else {
                    Action::Pan { dx, dy }
                }
            }
            Gesture::VertexDrag(vertex) => Action::DragVertex {
                vertex: *vertex,
                screen: position,
            },
        }
    }

    pub fn pointer_up(&mut self, position: Point) -> Action {
        match std::mem::take(&mut self.gesture) {
            Gesture::Idle => Action::None,
            Gesture::Pan(pan) => {
                let travel = pan.max_travel.max(pan.start.distance_to(position));
                if pan.from_background && travel < self.click_threshold {
                    Action::BackgroundClick
                } else {
                    Action::None
                }
            }
            Gesture::VertexDrag(vertex) => Action::EndVertexDrag(vertex),
        }
    }

    pub fn wheel(&self, position: Point, delta: f64) -> Action {
        if delta == 0.0 {
            return Action::None;
        }
        Action::Zoom {
            pointer: position,
            delta,
        }
    }

    pub fn cancel(&mut self) -> Action {
        match std::mem::take(&mut self.gesture) {
            Gesture::VertexDrag(vertex) => Action::EndVertexDrag(vertex),
            Gesture::Idle | Gesture::Pan(_) => Action::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> InputController {
        InputController::new(2.0)
    }

    #[test]
    fn background_drag_pans_by_deltas() {
        let mut input = controller();
        assert_eq!(input.pointer_down(Point::new(10.0, 10.0), Hit::Background, false), Action::None);
        assert_eq!(
            input.pointer_move(Point::new(15.0, 12.0)),
            Action::Pan { dx: 5.0, dy: 2.0 }
        );
        assert_eq!(
            input.pointer_move(Point::new(14.0, 20.0)),
            Action::Pan { dx: -1.0, dy: 8.0 }
        );
        assert_eq!(input.pointer_up(Point::new(14.0, 20.0)), Action::None);
        assert!(input.is_idle());
    }

    #[test]
    fn short_background_press_is_a_click() {
        let mut input = controller();
        input.pointer_down(Point::new(10.0, 10.0), Hit::Background, false);
        input.pointer_move(Point::new(11.0, 10.5));
        assert_eq!(input.pointer_up(Point::new(11.0, 10.5)), Action::BackgroundClick);
    }

    #[test]
    fn drag_that_returns_to_start_is_not_a_click() {
        let mut input = controller();
        input.pointer_down(Point::new(10.0, 10.0), Hit::Background, false);
        input.pointer_move(Point::new(40.0, 10.0));
        input.pointer_move(Point::new(10.0, 10.0));
        assert_eq!(input.pointer_up(Point::new(10.0, 10.0)), Action::None);
    }

    #[test]
    fn pan_mode_never_produces_clicks_or_selection() {
        let mut input = controller();
        assert_eq!(input.pointer_down(Point::ORIGIN, Hit::Polygon(3), true), Action::None);
        assert!(matches!(input.gesture(), Gesture::Pan(_)));
        assert_eq!(input.pointer_up(Point::ORIGIN), Action::None);
    }

    #[test]
    fn vertex_press_drives_a_drag() {
        let mut input = controller();
        let vertex = VertexRef::new(4, 1);
        assert_eq!(
            input.pointer_down(Point::ORIGIN, Hit::Vertex(vertex), false),
            Action::BeginVertexDrag(vertex)
        );
        assert_eq!(
            input.pointer_move(Point::new(3.0, 4.0)),
            Action::DragVertex {
                vertex,
                screen: Point::new(3.0, 4.0)
            }
        );
        assert_eq!(input.pointer_up(Point::new(3.0, 4.0)), Action::EndVertexDrag(vertex));
    }

    #[test]
    fn polygon_press_selects_without_gesture() {
        let mut input = controller();
        assert_eq!(
            input.pointer_down(Point::ORIGIN, Hit::Polygon(9), false),
            Action::SelectPolygon(9)
        );
        assert!(input.is_idle());
        assert_eq!(input.pointer_move(Point::new(5.0, 5.0)), Action::None);
    }

    #[test]
    fn cancel_ends_vertex_drag() {
        let mut input = controller();
        let vertex = VertexRef::new(1, 0);
        input.pointer_down(Point::ORIGIN, Hit::Vertex(vertex), false);
        assert_eq!(input.cancel(), Action::EndVertexDrag(vertex));
        assert!(input.is_idle());
    }

    #[test]
    fn wheel_zooms_unless_delta_is_zero() {
        let input = controller();
        assert_eq!(
            input.wheel(Point::new(1.0, 2.0), -3.0),
            Action::Zoom {
                pointer: Point::new(1.0, 2.0),
                delta: -3.0
            }
        );
        assert_eq!(input.wheel(Point::ORIGIN, 0.0), Action::None);
    }
}
