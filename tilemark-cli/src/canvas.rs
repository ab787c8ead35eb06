use tilemark_core::{Frame, HandleState, HandleView, Point, Rect, ShapeView, TileImage, TileKey};

pub const BACKGROUND: [u8; 3] = [40, 40, 40];
const PLACEHOLDER: [u8; 3] = [72, 72, 72];

const OTHER_STROKE: Stroke = Stroke {
    color: [46, 204, 64],
    width: 2,
    alpha: 0.4,
};

const SELECTED_STROKE: Stroke = Stroke {
    color: [0, 116, 217],
    width: 3,
    alpha: 0.8,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stroke {
    pub color: [u8; 3],
    pub width: u32,
    pub alpha: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    fn clip(rect: Rect, width: u32, height: u32) -> Option<Self> {
        let x0 = rect.x.floor().max(0.0);
        let y0 = rect.y.floor().max(0.0);
        let x1 = rect.right().ceil().min(f64::from(width));
        let y1 = rect.bottom().ceil().min(f64::from(height));
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(Self {
            x0: x0 as u32,
            y0: y0 as u32,
            x1: x1 as u32,
            y1: y1 as u32,
        })
    }
}

pub fn blank(width: u32, height: u32) -> TileImage {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for _ in 0..(width as usize * height as usize) {
        pixels.extend_from_slice(&[BACKGROUND[0], BACKGROUND[1], BACKGROUND[2], 255]);
    }
    TileImage {
        width,
        height,
        pixels,
    }
}

pub fn compose<'a, F>(canvas: &mut TileImage, frame: &Frame, tile_image: F)
where
    F: Fn(&TileKey) -> Option<&'a TileImage>,
{
    for view in &frame.tiles {
        match tile_image(&view.tile.key) {
            Some(image) => blit_scaled(canvas, image, view.screen),
            None => {
                if let Some(rect) = PixelRect::clip(view.screen, canvas.width, canvas.height) {
                    fill_rect(canvas, rect, PLACEHOLDER, 1.0);
                }
            }
        }
    }
    for shape in &frame.others {
        stroke_shape(canvas, shape, OTHER_STROKE);
    }
    if let Some(shape) = &frame.selected {
        stroke_shape(canvas, shape, SELECTED_STROKE);
    }
    for handle in &frame.handles {
        draw_handle(canvas, handle);
    }
}

pub fn blit_scaled(canvas: &mut TileImage, image: &TileImage, screen: Rect) {
    if image.width == 0 || image.height == 0 || screen.width <= 0.0 || screen.height <= 0.0 {
        return;
    }
    let Some(clip) = PixelRect::clip(screen, canvas.width, canvas.height) else {
        return;
    };
    let sx = f64::from(image.width) / screen.width;
    let sy = f64::from(image.height) / screen.height;
    let canvas_width = canvas.width as usize;
    let image_width = image.width as usize;

    for y in clip.y0..clip.y1 {
        let src_y = ((f64::from(y) + 0.5 - screen.y) * sy).floor();
        if src_y < 0.0 || src_y >= f64::from(image.height) {
            continue;
        }
        let src_row = src_y as usize * image_width * 4;
        let dst_row = y as usize * canvas_width * 4;
        for x in clip.x0..clip.x1 {
            let src_x = ((f64::from(x) + 0.5 - screen.x) * sx).floor();
            if src_x < 0.0 || src_x >= f64::from(image.width) {
                continue;
            }
            let src = src_row + src_x as usize * 4;
            let dst = dst_row + x as usize * 4;
            let alpha = f32::from(image.pixels[src + 3]) / 255.0;
            let color = [image.pixels[src], image.pixels[src + 1], image.pixels[src + 2]];
            blend_pixel(&mut canvas.pixels[dst..dst + 4], color, alpha);
        }
    }
}

pub fn fill_rect(canvas: &mut TileImage, rect: PixelRect, color: [u8; 3], alpha: f32) {
    let x1 = rect.x1.min(canvas.width);
    let y1 = rect.y1.min(canvas.height);
    let x0 = rect.x0.min(x1);
    let y0 = rect.y0.min(y1);
    let width = canvas.width as usize;

    for y in y0..y1 {
        let row_start = (y as usize) * width * 4;
        for x in x0..x1 {
            let idx = row_start + (x as usize) * 4;
            blend_pixel(&mut canvas.pixels[idx..idx + 4], color, alpha);
        }
    }
}

pub fn blend_pixel(pixel: &mut [u8], color: [u8; 3], alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let inv = 1.0 - alpha;
    for channel in 0..3 {
        pixel[channel] = ((pixel[channel] as f32 * inv) + (color[channel] as f32 * alpha))
            .round()
            .clamp(0.0, 255.0) as u8;
    }
    pixel[3] = 255;
}

pub fn stroke_shape(canvas: &mut TileImage, shape: &ShapeView, stroke: Stroke) {
    if shape.points.len() < 2 {
        return;
    }
    let half = f64::from(stroke.width) / 2.0;
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for point in &shape.points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    let bounds = Rect::new(
        min_x - half,
        min_y - half,
        max_x - min_x + 2.0 * half + 1.0,
        max_y - min_y + 2.0 * half + 1.0,
    );
    let Some(clip) = PixelRect::clip(bounds, canvas.width, canvas.height) else {
        return;
    };

    let mask_width = (clip.x1 - clip.x0) as usize;
    let mask_height = (clip.y1 - clip.y0) as usize;
    let mut mask = vec![false; mask_width * mask_height];
    let mut stamp = |x: f64, y: f64| {
        let left = (x - half).round() as i64;
        let top = (y - half).round() as i64;
        for py in top..top + i64::from(stroke.width) {
            for px in left..left + i64::from(stroke.width) {
                let mx = px - i64::from(clip.x0);
                let my = py - i64::from(clip.y0);
                if mx >= 0 && my >= 0 && (mx as usize) < mask_width && (my as usize) < mask_height {
                    mask[my as usize * mask_width + mx as usize] = true;
                }
            }
        }
    };

    let margin = f64::from(stroke.width);
    let window = Rect::new(
        f64::from(clip.x0) - margin,
        f64::from(clip.y0) - margin,
        f64::from(clip.x1 - clip.x0) + 2.0 * margin,
        f64::from(clip.y1 - clip.y0) + 2.0 * margin,
    );
    let count = shape.points.len();
    for index in 0..count {
        let Some((from, to)) =
            clip_segment(shape.points[index], shape.points[(index + 1) % count], window)
        else {
            continue;
        };
        let steps = (to.x - from.x).abs().max((to.y - from.y).abs()).ceil().max(1.0) as u32;
        for step in 0..=steps {
            let t = f64::from(step) / f64::from(steps);
            stamp(from.x + (to.x - from.x) * t, from.y + (to.y - from.y) * t);
        }
    }

    let width = canvas.width as usize;
    for my in 0..mask_height {
        for mx in 0..mask_width {
            if mask[my * mask_width + mx] {
                let x = clip.x0 as usize + mx;
                let y = clip.y0 as usize + my;
                let idx = (y * width + x) * 4;
                blend_pixel(&mut canvas.pixels[idx..idx + 4], stroke.color, stroke.alpha);
            }
        }
    }
}

/// Liang-Barsky clipping of the segment `from`-`to` to `window`.
fn clip_segment(from: Point, to: Point, window: Rect) -> Option<(Point, Point)> {
    if ![from.x, from.y, to.x, to.y].iter().all(|v| v.is_finite()) {
        return None;
    }
    let (dx, dy) = (to.x - from.x, to.y - from.y);
    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    for (p, q) in [
        (-dx, from.x - window.x),
        (dx, window.right() - from.x),
        (-dy, from.y - window.y),
        (dy, window.bottom() - from.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return None;
        }
    }
    Some((
        Point::new(from.x + dx * t0, from.y + dy * t0),
        Point::new(from.x + dx * t1, from.y + dy * t1),
    ))
}

pub fn handle_color(state: HandleState) -> [u8; 3] {
    match state {
        HandleState::Normal => [255, 65, 54],
        HandleState::Hovered => [255, 220, 0],
        HandleState::Selected => [0, 116, 217],
    }
}

pub fn draw_handle(canvas: &mut TileImage, handle: &HandleView) {
    fill_disc(canvas, handle.center, handle.radius, handle_color(handle.state));
}

fn fill_disc(canvas: &mut TileImage, center: Point, radius: f64, color: [u8; 3]) {
    let bounds = Rect::new(center.x - radius, center.y - radius, radius * 2.0, radius * 2.0);
    let Some(clip) = PixelRect::clip(bounds, canvas.width, canvas.height) else {
        return;
    };
    let width = canvas.width as usize;
    for y in clip.y0..clip.y1 {
        for x in clip.x0..clip.x1 {
            let pixel = Point::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
            if pixel.distance_to(center) <= radius {
                let idx = (y as usize * width + x as usize) * 4;
                blend_pixel(&mut canvas.pixels[idx..idx + 4], color, 1.0);
            }
        }
    }
}
