use super::style::Color;
use ab_glyph::{FontArc, PxScale};
use guardian_proto::BoundingBox;
use image::{Rgba, RgbaImage};
use imageproc::{
    drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut},
    rect::Rect,
};
use std::path::Path;

const DASH: f32 = 8.0;
const GAP: f32 = 6.0;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/Library/Fonts/Arial.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

/// Drawing target for overlay operations. Coordinates are display pixels.
pub trait Surface {
    fn clear(&mut self);
    fn stroke_rect(&mut self, rect: &BoundingBox, color: Color, width: u32, dashed: bool);
    fn fill_rect(&mut self, rect: &BoundingBox, color: Color);
    fn text(&mut self, origin: (f32, f32), text: &str, color: Color, size: f32);
    fn line(&mut self, from: (f32, f32), to: (f32, f32), color: Color, width: u32);
    fn joint(&mut self, center: (f32, f32), radius: f32, color: Color);
}

/// Loads the configured font, falling back to common system locations.
pub fn load_font(path: Option<&Path>) -> Option<FontArc> {
    let candidates = path
        .into_iter()
        .map(Path::to_path_buf)
        .chain(SYSTEM_FONTS.iter().map(|p| Path::new(p).to_path_buf()));

    for candidate in candidates {
        let Ok(data) = std::fs::read(&candidate) else {
            continue;
        };
        match FontArc::try_from_vec(data) {
            Ok(font) => {
                tracing::info!("Loaded overlay font {}", candidate.display());
                return Some(font);
            }
            Err(e) => tracing::warn!("Unusable font {}: {}", candidate.display(), e),
        }
    }
    tracing::warn!("No overlay font found, label text will not be drawn");
    None
}

/// Transparent RGBA buffer; untouched pixels keep alpha 0 so the overlay
/// can be blended over a video frame.
pub struct RasterSurface<'a> {
    image: RgbaImage,
    font: Option<&'a FontArc>,
}

impl<'a> RasterSurface<'a> {
    pub fn new(width: u32, height: u32, font: Option<&'a FontArc>) -> Self {
        Self {
            image: RgbaImage::new(width.max(1), height.max(1)),
            font,
        }
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Visible area plus a stroke-width margin; geometry outside it is cut
    /// away before it reaches the rasteriser.
    fn clip_bounds(&self, width: u32) -> [f64; 4] {
        let margin = width as f64 + 1.0;
        [
            -margin,
            -margin,
            self.image.width() as f64 + margin,
            self.image.height() as f64 + margin,
        ]
    }

    fn segment(&mut self, from: (f32, f32), to: (f32, f32), color: Color, width: u32) {
        let Some((t0, t1)) = clip_segment(from, to, self.clip_bounds(width)) else {
            return;
        };
        let (x0, y0) = (from.0 as f64, from.1 as f64);
        let (dx, dy) = (to.0 as f64 - x0, to.1 as f64 - y0);
        let from = ((x0 + dx * t0) as f32, (y0 + dy * t0) as f32);
        let to = ((x0 + dx * t1) as f32, (y0 + dy * t1) as f32);

        let pixel = rgba(color);
        let horizontal = dx.abs() >= dy.abs();
        let half = width as f32 / 2.0;
        for step in 0..width.max(1) {
            let offset = step as f32 - half + 0.5;
            let (start, end) = if horizontal {
                ((from.0, from.1 + offset), (to.0, to.1 + offset))
            } else {
                ((from.0 + offset, from.1), (to.0 + offset, to.1))
            };
            draw_line_segment_mut(&mut self.image, start, end, pixel);
        }
    }

    /// Dash phase is measured from `from`, so clipping never shifts the
    /// pattern.
    fn dashed_segment(&mut self, from: (f32, f32), to: (f32, f32), color: Color, width: u32) {
        let Some((t0, t1)) = clip_segment(from, to, self.clip_bounds(width)) else {
            return;
        };
        let (x0, y0) = (from.0 as f64, from.1 as f64);
        let (dx, dy) = (to.0 as f64 - x0, to.1 as f64 - y0);
        let length = (dx * dx + dy * dy).sqrt();
        if length == 0.0 {
            return;
        }
        let (ux, uy) = (dx / length, dy / length);
        let period = (DASH + GAP) as f64;
        let (visible_start, visible_end) = (t0 * length, t1 * length);

        let mut dash_start = (visible_start / period).floor() * period;
        while dash_start < visible_end {
            let start = dash_start.max(visible_start);
            let end = (dash_start + DASH as f64).min(visible_end);
            if start < end {
                self.segment(
                    ((x0 + ux * start) as f32, (y0 + uy * start) as f32),
                    ((x0 + ux * end) as f32, (y0 + uy * end) as f32),
                    color,
                    width,
                );
            }
            dash_start += period;
        }
    }
}

/// Liang-Barsky clip of `from..to` against `[min_x, min_y, max_x, max_y]`.
/// Returns the kept range of the segment parameter, or `None` when nothing
/// is inside.
fn clip_segment(from: (f32, f32), to: (f32, f32), bounds: [f64; 4]) -> Option<(f64, f64)> {
    let [min_x, min_y, max_x, max_y] = bounds;
    let (x0, y0) = (from.0 as f64, from.1 as f64);
    let (dx, dy) = (to.0 as f64 - x0, to.1 as f64 - y0);
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [
        (-dx, x0 - min_x),
        (dx, max_x - x0),
        (-dy, y0 - min_y),
        (dy, max_y - y0),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    Some((t0, t1))
}

fn rgba(color: Color) -> Rgba<u8> {
    Rgba([color.r, color.g, color.b, 255])
}

impl Surface for RasterSurface<'_> {
    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    fn stroke_rect(&mut self, rect: &BoundingBox, color: Color, width: u32, dashed: bool) {
        let [x1, y1, x2, y2] = rect.corners();
        let edges = [
            ((x1, y1), (x2, y1)),
            ((x2, y1), (x2, y2)),
            ((x2, y2), (x1, y2)),
            ((x1, y2), (x1, y1)),
        ];
        for (from, to) in edges {
            if dashed {
                self.dashed_segment(from, to, color, width);
            } else {
                self.segment(from, to, color, width);
            }
        }
    }

    fn fill_rect(&mut self, rect: &BoundingBox, color: Color) {
        let (width, height) = (self.image.width() as f32, self.image.height() as f32);
        let x1 = rect.x1.round().clamp(0.0, width);
        let y1 = rect.y1.round().clamp(0.0, height);
        let x2 = rect.x2.round().clamp(0.0, width).max(x1 + 1.0);
        let y2 = rect.y2.round().clamp(0.0, height).max(y1 + 1.0);
        if x1 >= width || y1 >= height || rect.x2 < 0.0 || rect.y2 < 0.0 {
            return;
        }
        let area = Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32);
        draw_filled_rect_mut(&mut self.image, area, rgba(color));
    }

    fn text(&mut self, origin: (f32, f32), text: &str, color: Color, size: f32) {
        let Some(font) = self.font else {
            return;
        };
        draw_text_mut(
            &mut self.image,
            rgba(color),
            origin.0.round() as i32,
            origin.1.round() as i32,
            PxScale::from(size),
            font,
            text,
        );
    }

    fn line(&mut self, from: (f32, f32), to: (f32, f32), color: Color, width: u32) {
        self.segment(from, to, color, width);
    }

    fn joint(&mut self, center: (f32, f32), radius: f32, color: Color) {
        draw_filled_circle_mut(
            &mut self.image,
            (center.0.round() as i32, center.1.round() as i32),
            radius.round().max(1.0) as i32,
            rgba(color),
        );
    }
}
