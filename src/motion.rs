//! Motion analysis.
//!
//! Two interchangeable algorithms behind one analyzer:
//!
//! - background subtraction: a per-pixel mixture-of-Gaussians model run at
//!   half native resolution, foreground mask opened with a 3x3 ellipse;
//! - frame differencing: grayscale + 21x21 Gaussian blur of the current and
//!   previous frame, absolute difference, fixed threshold, 5x5 elliptical
//!   opening.
//!
//! Both paths extract external contours from the binary mask, discard
//! components smaller than `min_area`, and report the padded union bounding
//! box in full-resolution coordinates. Changing `var_threshold` or `history`
//! rebuilds the background model on the next iteration.

use crate::config::MotionSettings;
use crate::frame::Frame;

const DIFF_THRESHOLD: u8 = 25;
const DIFF_BLUR_KSIZE: usize = 21;
const MOG2_GAUSSIANS: usize = 3;
const MOG2_INIT_VAR: f32 = 15.0 * 15.0;
const MOG2_BACKGROUND_RATIO: f32 = 0.9;

/// Immutable per-iteration snapshot of the sensitivity parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionParams {
    pub min_area: u32,
    pub pad: u32,
    pub var_threshold: f64,
    pub history: u32,
}

impl From<&MotionSettings> for MotionParams {
    fn from(settings: &MotionSettings) -> Self {
        Self {
            min_area: settings.min_area,
            pad: settings.pad,
            var_threshold: settings.var_threshold,
            history: settings.history.max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// A surviving contour: its pixel area and bounding box, both in
/// full-resolution coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Contour {
    pub area: u64,
    pub bbox: Rect,
}

#[derive(Clone, Debug, Default)]
pub struct MotionResult {
    pub motion: bool,
    pub total_area_px: u64,
    pub contours: Vec<Contour>,
    /// Padded union of the surviving contours, full-resolution coordinates.
    pub bbox: Option<Rect>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Mog2,
    FrameDiff,
}

impl Algorithm {
    /// Unknown names fall back to background subtraction with a warning so a
    /// typo in settings degrades instead of disabling analysis.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "mog2" => Self::Mog2,
            "frame_diff" | "framediff" | "diff" => Self::FrameDiff,
            other => {
                log::warn!("unknown motion algorithm '{}'; using mog2", other);
                Self::Mog2
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Grayscale working buffers
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct GrayBuf {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

#[inline]
fn luma(b: u8, g: u8, r: u8) -> u8 {
    // Integer BT.601: 0.114 B + 0.587 G + 0.299 R.
    ((29 * b as u32 + 150 * g as u32 + 77 * r as u32) >> 8) as u8
}

fn gray_from_bgr(frame: &Frame) -> GrayBuf {
    let mut data = Vec::with_capacity((frame.width * frame.height) as usize);
    for px in frame.data.chunks_exact(3) {
        data.push(luma(px[0], px[1], px[2]));
    }
    GrayBuf {
        data,
        width: frame.width,
        height: frame.height,
    }
}

/// Grayscale at half resolution via 2x2 averaging.
fn gray_half_from_bgr(frame: &Frame) -> GrayBuf {
    let out_w = (frame.width / 2).max(1);
    let out_h = (frame.height / 2).max(1);
    let mut data = Vec::with_capacity((out_w * out_h) as usize);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let x = (ox * 2).min(frame.width - 1);
            let y = (oy * 2).min(frame.height - 1);
            let x2 = (x + 1).min(frame.width - 1);
            let y2 = (y + 1).min(frame.height - 1);
            let mut acc = 0u32;
            for &(sx, sy) in &[(x, y), (x2, y), (x, y2), (x2, y2)] {
                let px = frame.pixel(sx, sy);
                acc += luma(px[0], px[1], px[2]) as u32;
            }
            data.push((acc / 4) as u8);
        }
    }
    GrayBuf {
        data,
        width: out_w,
        height: out_h,
    }
}

fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    // Sigma derivation matches the usual convention for an unspecified sigma.
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (ksize / 2) as f32;
    let mut kernel: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - center;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

fn gaussian_blur(src: &GrayBuf, ksize: usize) -> GrayBuf {
    let kernel = gaussian_kernel(ksize);
    let half = (ksize / 2) as i64;
    let (w, h) = (src.width as i64, src.height as i64);

    // Horizontal pass.
    let mut tmp = vec![0f32; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (i, k) in kernel.iter().enumerate() {
                let sx = (x + i as i64 - half).clamp(0, w - 1);
                acc += k * src.data[(y * w + sx) as usize] as f32;
            }
            tmp[(y * w + x) as usize] = acc;
        }
    }
    // Vertical pass.
    let mut out = vec![0u8; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0f32;
            for (i, k) in kernel.iter().enumerate() {
                let sy = (y + i as i64 - half).clamp(0, h - 1);
                acc += k * tmp[(sy * w + x) as usize];
            }
            out[(y * w + x) as usize] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayBuf {
        data: out,
        width: src.width,
        height: src.height,
    }
}

// ----------------------------------------------------------------------------
// Binary masks and morphology
// ----------------------------------------------------------------------------

struct Mask {
    data: Vec<bool>,
    width: u32,
    height: u32,
}

fn diff_threshold(a: &GrayBuf, b: &GrayBuf, threshold: u8) -> Mask {
    let data = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&x, &y)| x.abs_diff(y) > threshold)
        .collect();
    Mask {
        data,
        width: a.width,
        height: a.height,
    }
}

/// Offsets of an elliptical structuring element of the given (odd) size.
fn ellipse_offsets(ksize: u32) -> Vec<(i64, i64)> {
    let r = (ksize / 2) as i64;
    let radius = r as f64 + 0.5;
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            let nx = dx as f64 / radius;
            let ny = dy as f64 / radius;
            if nx * nx + ny * ny <= 1.0 {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

fn erode(mask: &Mask, offsets: &[(i64, i64)]) -> Mask {
    let (w, h) = (mask.width as i64, mask.height as i64);
    let mut out = vec![false; mask.data.len()];
    for y in 0..h {
        for x in 0..w {
            let keep = offsets.iter().all(|&(dx, dy)| {
                let sx = x + dx;
                let sy = y + dy;
                sx >= 0 && sy >= 0 && sx < w && sy < h && mask.data[(sy * w + sx) as usize]
            });
            out[(y * w + x) as usize] = keep;
        }
    }
    Mask {
        data: out,
        width: mask.width,
        height: mask.height,
    }
}

fn dilate(mask: &Mask, offsets: &[(i64, i64)]) -> Mask {
    let (w, h) = (mask.width as i64, mask.height as i64);
    let mut out = vec![false; mask.data.len()];
    for y in 0..h {
        for x in 0..w {
            let hit = offsets.iter().any(|&(dx, dy)| {
                let sx = x + dx;
                let sy = y + dy;
                sx >= 0 && sy >= 0 && sx < w && sy < h && mask.data[(sy * w + sx) as usize]
            });
            out[(y * w + x) as usize] = hit;
        }
    }
    Mask {
        data: out,
        width: mask.width,
        height: mask.height,
    }
}

fn open_mask(mask: &Mask, ksize: u32) -> Mask {
    let offsets = ellipse_offsets(ksize);
    dilate(&erode(mask, &offsets), &offsets)
}

// ----------------------------------------------------------------------------
// Contour extraction (connected components, 8-connectivity)
// ----------------------------------------------------------------------------

struct Component {
    area: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

fn connected_components(mask: &Mask) -> Vec<Component> {
    let (w, h) = (mask.width as i64, mask.height as i64);
    let mut visited = vec![false; mask.data.len()];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.data.len() {
        if !mask.data[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let mut comp = Component {
            area: 0,
            min_x: u32::MAX,
            min_y: u32::MAX,
            max_x: 0,
            max_y: 0,
        };
        while let Some(idx) = stack.pop() {
            let x = (idx as i64) % w;
            let y = (idx as i64) / w;
            comp.area += 1;
            comp.min_x = comp.min_x.min(x as u32);
            comp.min_y = comp.min_y.min(y as u32);
            comp.max_x = comp.max_x.max(x as u32);
            comp.max_y = comp.max_y.max(y as u32);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x + dx;
                    let ny = y + dy;
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    let nidx = (ny * w + nx) as usize;
                    if mask.data[nidx] && !visited[nidx] {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }
        components.push(comp);
    }
    components
}

// ----------------------------------------------------------------------------
// Background subtraction model
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Default)]
struct Gaussian {
    weight: f32,
    mean: f32,
    var: f32,
}

struct Mog2Model {
    gaussians: Vec<Gaussian>,
    width: u32,
    height: u32,
    frames_seen: u32,
    history: u32,
    var_threshold: f32,
}

impl Mog2Model {
    fn new(width: u32, height: u32, history: u32, var_threshold: f64) -> Self {
        Self {
            gaussians: vec![Gaussian::default(); (width * height) as usize * MOG2_GAUSSIANS],
            width,
            height,
            frames_seen: 0,
            history: history.max(1),
            var_threshold: var_threshold as f32,
        }
    }

    /// Feed one grayscale frame through the model and return the foreground
    /// mask. Shadows are not modeled.
    fn apply(&mut self, gray: &GrayBuf) -> Mask {
        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = 1.0 / self.frames_seen.min(self.history) as f32;
        let mut mask = vec![false; gray.data.len()];

        for (i, &value) in gray.data.iter().enumerate() {
            let value = value as f32;
            let slot = &mut self.gaussians[i * MOG2_GAUSSIANS..(i + 1) * MOG2_GAUSSIANS];
            slot.sort_by(|a, b| b.weight.total_cmp(&a.weight));

            let mut matched: Option<usize> = None;
            for (k, g) in slot.iter().enumerate() {
                if g.weight <= 0.0 {
                    continue;
                }
                let d = value - g.mean;
                if d * d < self.var_threshold * g.var {
                    matched = Some(k);
                    break;
                }
            }

            match matched {
                Some(k) => {
                    // Background when the matched mode sits inside the
                    // cumulative-weight background set.
                    let mut cumulative = 0.0;
                    let mut background = false;
                    for (j, g) in slot.iter().enumerate() {
                        if j == k {
                            background = cumulative < MOG2_BACKGROUND_RATIO;
                            break;
                        }
                        cumulative += g.weight;
                    }
                    mask[i] = !background;

                    for (j, g) in slot.iter_mut().enumerate() {
                        g.weight += alpha * (if j == k { 1.0 } else { 0.0 } - g.weight);
                    }
                    let g = &mut slot[k];
                    let rho = alpha / g.weight.max(alpha);
                    let d = value - g.mean;
                    g.mean += rho * d;
                    g.var = (g.var + rho * (d * d - g.var)).max(4.0);
                }
                None => {
                    mask[i] = self.frames_seen > 1;
                    // Replace the weakest mode.
                    for g in slot.iter_mut() {
                        g.weight *= 1.0 - alpha;
                    }
                    let weakest = MOG2_GAUSSIANS - 1;
                    slot[weakest] = Gaussian {
                        weight: alpha,
                        mean: value,
                        var: MOG2_INIT_VAR,
                    };
                }
            }

            let total: f32 = slot.iter().map(|g| g.weight).sum();
            if total > 0.0 {
                for g in slot.iter_mut() {
                    g.weight /= total;
                }
            }
        }

        Mask {
            data: mask,
            width: gray.width,
            height: gray.height,
        }
    }
}

// ----------------------------------------------------------------------------
// Analyzer
// ----------------------------------------------------------------------------

enum AnalyzerState {
    Uninit,
    FrameDiff { prev: GrayBuf },
    Mog2 { model: Mog2Model },
}

/// Stateful motion analyzer. Owned by a single worker; parameter snapshots
/// are taken per iteration by the caller.
pub struct MotionAnalyzer {
    algorithm: Algorithm,
    state: AnalyzerState,
    model_params: Option<(f64, u32)>,
}

impl MotionAnalyzer {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            state: AnalyzerState::Uninit,
            model_params: None,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Drop all learned state; the next frame re-trains from scratch.
    pub fn reset(&mut self) {
        self.state = AnalyzerState::Uninit;
        self.model_params = None;
    }

    pub fn analyze(&mut self, frame: &Frame, params: &MotionParams) -> MotionResult {
        if let Some((vt, hist)) = self.model_params {
            if vt != params.var_threshold || hist != params.history {
                self.reset();
            }
        }

        match self.algorithm {
            Algorithm::FrameDiff => self.analyze_frame_diff(frame, params),
            Algorithm::Mog2 => self.analyze_mog2(frame, params),
        }
    }

    fn analyze_frame_diff(&mut self, frame: &Frame, params: &MotionParams) -> MotionResult {
        let gray = gaussian_blur(&gray_from_bgr(frame), DIFF_BLUR_KSIZE);
        let prev = match std::mem::replace(&mut self.state, AnalyzerState::Uninit) {
            AnalyzerState::FrameDiff { prev } => Some(prev),
            _ => None,
        };
        self.model_params = Some((params.var_threshold, params.history));

        let result = match &prev {
            None => MotionResult::default(),
            Some(prev) if prev.width != gray.width || prev.height != gray.height => {
                // Resolution changed under us (device reopen); retrain.
                MotionResult::default()
            }
            Some(prev) => {
                let mask = open_mask(&diff_threshold(prev, &gray, DIFF_THRESHOLD), 5);
                collect_result(&mask, params, 1, frame.width, frame.height)
            }
        };
        self.state = AnalyzerState::FrameDiff { prev: gray };
        result
    }

    fn analyze_mog2(&mut self, frame: &Frame, params: &MotionParams) -> MotionResult {
        let gray = gray_half_from_bgr(frame);
        let first_apply = !matches!(self.state, AnalyzerState::Mog2 { .. });
        if first_apply {
            self.state = AnalyzerState::Mog2 {
                model: Mog2Model::new(gray.width, gray.height, params.history, params.var_threshold),
            };
            self.model_params = Some((params.var_threshold, params.history));
        }
        let AnalyzerState::Mog2 { model } = &mut self.state else {
            return MotionResult::default();
        };
        if model.width != gray.width || model.height != gray.height {
            *model = Mog2Model::new(gray.width, gray.height, params.history, params.var_threshold);
            let _ = model.apply(&gray);
            return MotionResult::default();
        }

        let mask = model.apply(&gray);
        if first_apply {
            return MotionResult::default();
        }
        let mask = open_mask(&mask, 3);
        collect_result(&mask, params, 2, frame.width, frame.height)
    }
}

/// Filter components by `min_area`, build the padded union bbox, and rescale
/// everything from processing to full-resolution coordinates.
fn collect_result(
    mask: &Mask,
    params: &MotionParams,
    scale: u32,
    full_width: u32,
    full_height: u32,
) -> MotionResult {
    let mut contours = Vec::new();
    let mut total_area = 0u64;
    let mut union: Option<(u32, u32, u32, u32)> = None;

    for comp in connected_components(mask) {
        if comp.area < params.min_area as u64 {
            continue;
        }
        total_area += comp.area * (scale as u64 * scale as u64);
        contours.push(Contour {
            area: comp.area * (scale as u64 * scale as u64),
            bbox: Rect {
                x: comp.min_x * scale,
                y: comp.min_y * scale,
                w: (comp.max_x - comp.min_x + 1) * scale,
                h: (comp.max_y - comp.min_y + 1) * scale,
            },
        });
        union = Some(match union {
            None => (comp.min_x, comp.min_y, comp.max_x, comp.max_y),
            Some((x0, y0, x1, y1)) => (
                x0.min(comp.min_x),
                y0.min(comp.min_y),
                x1.max(comp.max_x),
                y1.max(comp.max_y),
            ),
        });
    }

    let bbox = union.map(|(x0, y0, x1, y1)| {
        let x0 = x0.saturating_sub(params.pad);
        let y0 = y0.saturating_sub(params.pad);
        let x1 = (x1 + params.pad).min(mask.width.saturating_sub(1));
        let y1 = (y1 + params.pad).min(mask.height.saturating_sub(1));
        Rect {
            x: (x0 * scale).min(full_width.saturating_sub(1)),
            y: (y0 * scale).min(full_height.saturating_sub(1)),
            w: ((x1 - x0 + 1) * scale).min(full_width),
            h: ((y1 - y0 + 1) * scale).min(full_height),
        }
    });

    MotionResult {
        motion: bbox.is_some(),
        total_area_px: total_area,
        contours,
        bbox,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_square(w: u32, h: u32, sq: Option<(u32, u32, u32)>) -> Frame {
        let mut data = vec![20u8; (w * h * 3) as usize];
        if let Some((sx, sy, size)) = sq {
            for y in sy..(sy + size).min(h) {
                for x in sx..(sx + size).min(w) {
                    let i = ((y * w + x) * 3) as usize;
                    data[i] = 230;
                    data[i + 1] = 230;
                    data[i + 2] = 230;
                }
            }
        }
        Frame::new(data, w, h)
    }

    fn params(min_area: u32) -> MotionParams {
        MotionParams {
            min_area,
            pad: 10,
            var_threshold: 16.0,
            history: 50,
        }
    }

    #[test]
    fn frame_diff_first_frame_reports_no_motion() {
        let mut analyzer = MotionAnalyzer::new(Algorithm::FrameDiff);
        let result = analyzer.analyze(&frame_with_square(160, 120, None), &params(50));
        assert!(!result.motion);
        assert_eq!(result.total_area_px, 0);
    }

    #[test]
    fn frame_diff_detects_appearing_square() {
        let mut analyzer = MotionAnalyzer::new(Algorithm::FrameDiff);
        analyzer.analyze(&frame_with_square(160, 120, None), &params(50));
        let result = analyzer.analyze(&frame_with_square(160, 120, Some((40, 30, 40))), &params(50));
        assert!(result.motion);
        assert!(result.total_area_px > 0);
        let bbox = result.bbox.expect("bbox");
        // The padded box covers the square.
        assert!(bbox.x <= 40 && bbox.y <= 30);
        assert!(bbox.x + bbox.w >= 80 && bbox.y + bbox.h >= 70);
    }

    #[test]
    fn frame_diff_ignores_static_scene() {
        let mut analyzer = MotionAnalyzer::new(Algorithm::FrameDiff);
        let frame = frame_with_square(160, 120, Some((40, 30, 40)));
        analyzer.analyze(&frame, &params(50));
        let result = analyzer.analyze(&frame, &params(50));
        assert!(!result.motion);
    }

    #[test]
    fn min_area_filters_small_components() {
        let mut analyzer = MotionAnalyzer::new(Algorithm::FrameDiff);
        analyzer.analyze(&frame_with_square(160, 120, None), &params(10_000));
        let result =
            analyzer.analyze(&frame_with_square(160, 120, Some((40, 30, 20))), &params(10_000));
        assert!(!result.motion);
        assert!(result.contours.is_empty());
    }

    #[test]
    fn mog2_learns_background_then_flags_motion() {
        let mut analyzer = MotionAnalyzer::new(Algorithm::Mog2);
        let p = params(20);
        for _ in 0..10 {
            analyzer.analyze(&frame_with_square(160, 120, None), &p);
        }
        let quiet = analyzer.analyze(&frame_with_square(160, 120, None), &p);
        assert!(!quiet.motion, "static scene must stay quiet after training");

        let result = analyzer.analyze(&frame_with_square(160, 120, Some((40, 30, 60))), &p);
        assert!(result.motion);
        assert!(result.bbox.is_some());
    }

    #[test]
    fn model_rebuilds_when_history_changes() {
        let mut analyzer = MotionAnalyzer::new(Algorithm::Mog2);
        let p = params(20);
        for _ in 0..5 {
            analyzer.analyze(&frame_with_square(160, 120, None), &p);
        }
        let changed = MotionParams { history: 100, ..p };
        // First frame after a rebuild reports nothing: the model retrains.
        let result = analyzer.analyze(&frame_with_square(160, 120, Some((40, 30, 60))), &changed);
        assert!(!result.motion);
    }

    #[test]
    fn ellipse_kernel_is_symmetric() {
        let offsets = ellipse_offsets(5);
        assert!(offsets.contains(&(0, 0)));
        for &(dx, dy) in &offsets {
            assert!(offsets.contains(&(-dx, -dy)));
        }
    }
}
