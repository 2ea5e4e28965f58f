//! Frame annotation: motion rectangle, status line, timestamp stamp.
//!
//! Text is rasterized from a TTF loaded once at startup. When no font is
//! available (headless containers without a fonts package) the text overlays
//! are skipped and only the rectangle is drawn.

use ab_glyph::{point, Font, FontVec, PxScale, ScaleFont};
use anyhow::{Context, Result};
use chrono::Local;
use std::path::Path;

use crate::frame::Frame;
use crate::motion::Rect;

pub const DEFAULT_FONT_PATH: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

const STATUS_PX: f32 = 28.0;
const TIMESTAMP_PX: f32 = 16.0;
const RECT_THICKNESS: u32 = 3;

// BGR.
const GREEN: [u8; 3] = [0, 255, 0];
const RED: [u8; 3] = [0, 0, 255];
const WHITE: [u8; 3] = [255, 255, 255];

/// Shared annotation helper. Cheap to clone behind an `Arc`.
pub struct Overlay {
    font: Option<FontVec>,
}

impl Overlay {
    /// Load the overlay font from `OPENSENTRY_FONT` or the DejaVu default.
    /// A missing font is not an error; text overlays just disappear.
    pub fn from_env() -> Self {
        let path = std::env::var("OPENSENTRY_FONT")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FONT_PATH.to_string());
        match Self::load_font(Path::new(&path)) {
            Ok(font) => {
                log::info!("overlay font loaded from {}", path);
                Self { font: Some(font) }
            }
            Err(err) => {
                log::warn!("overlay font unavailable ({}); text overlays disabled", err);
                Self { font: None }
            }
        }
    }

    pub fn without_font() -> Self {
        Self { font: None }
    }

    fn load_font(path: &Path) -> Result<FontVec> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read font file {}", path.display()))?;
        FontVec::try_from_vec(bytes).with_context(|| format!("parse font {}", path.display()))
    }

    /// Status line plus (when motion) the padded bounding rectangle.
    pub fn draw_motion(&self, frame: &mut Frame, motion: bool, bbox: Option<&Rect>) {
        if motion {
            if let Some(rect) = bbox {
                draw_rect(frame, rect, GREEN, RECT_THICKNESS);
            }
        }
        let (status, color) = if motion {
            ("MOTION DETECTED", RED)
        } else {
            ("No Motion", GREEN)
        };
        self.draw_text(frame, status, 10, 30, STATUS_PX, color);
    }

    /// `YYYY-MM-DD HH:MM:SS` near the bottom-left corner.
    pub fn stamp_timestamp(&self, frame: &mut Frame) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let baseline = frame.height.saturating_sub(10) as i32;
        self.draw_text(frame, &stamp, 10, baseline, TIMESTAMP_PX, WHITE);
    }

    fn draw_text(&self, frame: &mut Frame, text: &str, x: i32, baseline: i32, px: f32, color: [u8; 3]) {
        let Some(font) = &self.font else {
            return;
        };
        let scale = PxScale::from(px);
        let scaled = font.as_scaled(scale);
        let mut caret = x as f32;
        let mut prev = None;

        for ch in text.chars() {
            let id = scaled.glyph_id(ch);
            if let Some(prev_id) = prev {
                caret += scaled.kern(prev_id, id);
            }
            let glyph = id.with_scale_and_position(scale, point(caret, baseline as f32));
            caret += scaled.h_advance(id);
            prev = Some(id);

            if let Some(outline) = font.outline_glyph(glyph) {
                let bounds = outline.px_bounds();
                outline.draw(|gx, gy, coverage| {
                    let px_x = bounds.min.x as i32 + gx as i32;
                    let px_y = bounds.min.y as i32 + gy as i32;
                    if px_x < 0 || px_y < 0 {
                        return;
                    }
                    let (px_x, px_y) = (px_x as u32, px_y as u32);
                    if px_x >= frame.width || px_y >= frame.height {
                        return;
                    }
                    let bg = frame.pixel(px_x, px_y);
                    let blended = [
                        blend(bg[0], color[0], coverage),
                        blend(bg[1], color[1], coverage),
                        blend(bg[2], color[2], coverage),
                    ];
                    frame.put_pixel(px_x, px_y, blended);
                });
            }
        }
    }
}

#[inline]
fn blend(bg: u8, fg: u8, coverage: f32) -> u8 {
    let c = coverage.clamp(0.0, 1.0);
    (bg as f32 * (1.0 - c) + fg as f32 * c).round() as u8
}

fn draw_rect(frame: &mut Frame, rect: &Rect, color: [u8; 3], thickness: u32) {
    let x1 = rect.x.min(frame.width.saturating_sub(1));
    let y1 = rect.y.min(frame.height.saturating_sub(1));
    let x2 = (rect.x + rect.w).min(frame.width.saturating_sub(1));
    let y2 = (rect.y + rect.h).min(frame.height.saturating_sub(1));

    for t in 0..thickness {
        let ty1 = y1.saturating_add(t).min(y2);
        let ty2 = y2.saturating_sub(t).max(y1);
        for x in x1..=x2 {
            frame.put_pixel(x, ty1, color);
            frame.put_pixel(x, ty2, color);
        }
        let tx1 = x1.saturating_add(t).min(x2);
        let tx2 = x2.saturating_sub(t).max(x1);
        for y in y1..=y2 {
            frame.put_pixel(tx1, y, color);
            frame.put_pixel(tx2, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(w: u32, h: u32) -> Frame {
        Frame::new(vec![0u8; (w * h * 3) as usize], w, h)
    }

    #[test]
    fn rectangle_edges_take_the_color() {
        let mut frame = blank(100, 80);
        let rect = Rect {
            x: 10,
            y: 10,
            w: 40,
            h: 30,
        };
        draw_rect(&mut frame, &rect, GREEN, 3);
        assert_eq!(frame.pixel(10, 10), GREEN);
        assert_eq!(frame.pixel(50, 40), GREEN);
        assert_eq!(frame.pixel(30, 25), [0, 0, 0]);
    }

    #[test]
    fn rectangle_is_clamped_to_frame_bounds() {
        let mut frame = blank(50, 50);
        let rect = Rect {
            x: 40,
            y: 40,
            w: 100,
            h: 100,
        };
        draw_rect(&mut frame, &rect, RED, 3);
        assert_eq!(frame.pixel(49, 49), RED);
    }

    #[test]
    fn fontless_overlay_still_draws_rectangles() {
        let overlay = Overlay::without_font();
        let mut frame = blank(100, 80);
        let rect = Rect {
            x: 5,
            y: 5,
            w: 20,
            h: 20,
        };
        overlay.draw_motion(&mut frame, true, Some(&rect));
        assert_eq!(frame.pixel(5, 5), GREEN);
        // No text, no panic.
        overlay.stamp_timestamp(&mut frame);
    }
}
