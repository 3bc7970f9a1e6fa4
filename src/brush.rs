// ============================================================================
// BRUSH STAMP RASTERIZER - one textured footprint per brush application
// ============================================================================
//
// A stamp is a square raster covering 2·size around (x, y), placed at
// (x − size, y − size).
// Its colour comes from a pattern tile sampled in world coordinates, so
// successive stamps continue one seamless texture; its alpha comes from the
// footprint (hard circle, rough polygon or soft radial falloff).
// ============================================================================

use image::{Rgba, RgbaImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::color::Color;

/// Number of segments in the rough footprint outline (21 vertices, the last
/// one sharing the first one's angle).
const ROUGH_SEGMENTS: usize = 20;

/// Each rough vertex radius varies by up to `roughness × 5%` of the radius.
const ROUGH_VARIATION_PER_UNIT: f32 = 0.05;

/// Line segments used to flatten one quadratic curve of a smoothed outline.
const QUAD_FLATTEN_STEPS: usize = 8;

/// Largest accepted brush diameter in pixels.
pub const MAX_BRUSH_SIZE: f32 = 2048.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrushShape {
    #[default]
    Circle,
    Rough,
}

impl BrushShape {
    pub fn label(&self) -> &'static str {
        match self {
            BrushShape::Circle => "circle",
            BrushShape::Rough => "rough",
        }
    }
}

/// What a stamp does once it has been rasterized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrushAction {
    /// Source-over onto the target layer (gated by the mask on `foreground`).
    #[default]
    Paint,
    /// Destination-out on the target layer.
    Erase,
    /// Accumulate coverage on the mask layer.
    MaskAdd,
    /// Remove coverage from the mask layer (see `MaskSubtractMode`).
    MaskSubtract,
}

impl BrushAction {
    pub fn is_mask_stroke(&self) -> bool {
        matches!(self, BrushAction::MaskAdd | BrushAction::MaskSubtract)
    }
}

/// Full description of one brush application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrushSpec {
    pub shape: BrushShape,
    /// Diameter in pixels.
    pub size: f32,
    /// 0 = hard edge, 1 = fade across the whole radius.
    pub softness: f32,
    pub roughness: f32,
    /// Join rough vertices with quadratic curves instead of straight lines.
    pub smooth: bool,
    pub opacity: f32,
    /// Procedural generator name (`solid|dots|stripes|noise`) or image reference.
    pub pattern: String,
    pub color: Option<Color>,
    pub action: BrushAction,
}

impl Default for BrushSpec {
    fn default() -> Self {
        Self {
            shape: BrushShape::Circle,
            size: 100.0,
            softness: 0.5,
            roughness: 0.5,
            smooth: false,
            opacity: 1.0,
            pattern: "solid".to_string(),
            color: None,
            action: BrushAction::Paint,
        }
    }
}

/// Reason a brush spec was refused.
#[derive(Clone, Debug, PartialEq)]
pub enum InvalidBrush {
    Size(f32),
    Opacity(f32),
    Softness(f32),
    Roughness(f32),
    EmptyPattern,
}

impl std::fmt::Display for InvalidBrush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidBrush::Size(v) => {
                write!(f, "brush size must be in (0, {}], got {}", MAX_BRUSH_SIZE, v)
            }
            InvalidBrush::Opacity(v) => write!(f, "opacity must be in (0, 1], got {}", v),
            InvalidBrush::Softness(v) => write!(f, "softness must be in [0, 1], got {}", v),
            InvalidBrush::Roughness(v) => write!(f, "roughness must be >= 0, got {}", v),
            InvalidBrush::EmptyPattern => write!(f, "pattern id is empty"),
        }
    }
}

impl BrushSpec {
    /// Solid colour brush, the common case in tests and scripts.
    pub fn solid(size: f32, color: Color) -> Self {
        Self {
            size,
            softness: 0.0,
            color: Some(color),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: BrushAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_size(mut self, size: f32) -> Self {
        self.size = size;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidBrush> {
        if !self.size.is_finite() || self.size <= 0.0 || self.size > MAX_BRUSH_SIZE {
            return Err(InvalidBrush::Size(self.size));
        }
        if !self.opacity.is_finite() || self.opacity <= 0.0 || self.opacity > 1.0 {
            return Err(InvalidBrush::Opacity(self.opacity));
        }
        if !(0.0..=1.0).contains(&self.softness) {
            return Err(InvalidBrush::Softness(self.softness));
        }
        if !self.roughness.is_finite() || self.roughness < 0.0 {
            return Err(InvalidBrush::Roughness(self.roughness));
        }
        if self.pattern.trim().is_empty() {
            return Err(InvalidBrush::EmptyPattern);
        }
        Ok(())
    }
}

// ============================================================================
// STAMP
// ============================================================================

/// Ephemeral raster produced for a single brush application.  Straight
/// (non-premultiplied) RGBA; `origin` is the world position of pixel (0, 0).
#[derive(Clone, Debug, PartialEq)]
pub struct Stamp {
    pub origin: (i32, i32),
    pub pixels: RgbaImage,
}

impl Stamp {
    /// World-space alpha at (x, y); zero outside the stamp.
    pub fn alpha_at(&self, x: i32, y: i32) -> u8 {
        let lx = x - self.origin.0;
        let ly = y - self.origin.1;
        if lx < 0 || ly < 0 || lx as u32 >= self.pixels.width() || ly as u32 >= self.pixels.height() {
            return 0;
        }
        self.pixels.get_pixel(lx as u32, ly as u32)[3]
    }

    /// True when every pixel is fully transparent.
    pub fn is_empty(&self) -> bool {
        self.pixels.pixels().all(|p| p[3] == 0)
    }

    /// Number of pixels with non-zero alpha.
    pub fn coverage(&self) -> usize {
        self.pixels.pixels().filter(|p| p[3] != 0).count()
    }
}

// ============================================================================
// FOOTPRINT
// ============================================================================

/// Alpha shape of one brush application, in stamp-local coordinates.
#[derive(Clone, Debug)]
enum Footprint {
    Circle { radius: f32 },
    Polygon { points: Vec<(f32, f32)> },
    Radial { inner: f32, outer: f32 },
}

impl Footprint {
    fn build<R: Rng + ?Sized>(spec: &BrushSpec, rng: &mut R) -> Self {
        let radius = spec.size / 2.0;
        if spec.softness > 0.0 {
            // Shape is not honoured for soft brushes.
            return Footprint::Radial {
                inner: radius * (1.0 - spec.softness),
                outer: radius,
            };
        }
        match spec.shape {
            BrushShape::Circle => Footprint::Circle { radius },
            BrushShape::Rough => {
                let outline = rough_outline(radius, spec.roughness, spec.size, rng);
                let points = if spec.smooth {
                    smooth_outline(&outline)
                } else {
                    outline
                };
                Footprint::Polygon { points }
            }
        }
    }

    /// Per-pixel coverage in 0..=1 for a `side × side` raster whose footprint
    /// centre sits at (`cx`, `cy`).  Nothing beyond `limit` from the centre is
    /// ever covered.
    fn coverage(&self, side: u32, cx: f32, cy: f32, limit: f32) -> Vec<f32> {
        let n = side as usize;
        let mut cov = vec![0.0f32; n * n];
        match self {
            Footprint::Circle { radius } => {
                for py in 0..n {
                    for px in 0..n {
                        let d = dist(px, py, cx, cy);
                        if d <= *radius {
                            cov[py * n + px] = 1.0;
                        }
                    }
                }
            }
            Footprint::Radial { inner, outer } => {
                let span = (outer - inner).max(f32::EPSILON);
                for py in 0..n {
                    for px in 0..n {
                        let d = dist(px, py, cx, cy);
                        cov[py * n + px] = if d <= *inner {
                            1.0
                        } else if d >= *outer {
                            0.0
                        } else {
                            (outer - d) / span
                        };
                    }
                }
            }
            Footprint::Polygon { points } => {
                let shifted: Vec<(f32, f32)> =
                    points.iter().map(|(x, y)| (x + cx, y + cy)).collect();
                fill_polygon_nonzero(&shifted, n, &mut cov);
            }
        }
        for py in 0..n {
            for px in 0..n {
                if dist(px, py, cx, cy) > limit {
                    cov[py * n + px] = 0.0;
                }
            }
        }
        cov
    }
}

#[inline]
fn dist(px: usize, py: usize, cx: f32, cy: f32) -> f32 {
    let dx = px as f32 + 0.5 - cx;
    let dy = py as f32 + 0.5 - cy;
    (dx * dx + dy * dy).sqrt()
}

/// 21 vertices around the centre, each radius jittered independently.
/// Radii are capped at `max_radius` so the footprint stays inside the stamp.
fn rough_outline<R: Rng + ?Sized>(
    radius: f32,
    roughness: f32,
    max_radius: f32,
    rng: &mut R,
) -> Vec<(f32, f32)> {
    let variation = roughness * ROUGH_VARIATION_PER_UNIT;
    (0..=ROUGH_SEGMENTS)
        .map(|i| {
            let angle = (i as f32 / ROUGH_SEGMENTS as f32) * std::f32::consts::TAU;
            let jitter: f32 = rng.gen_range(0.0..1.0);
            let r = (radius * (1.0 - variation / 2.0 + jitter * variation)).clamp(0.0, max_radius);
            (angle.cos() * r, angle.sin() * r)
        })
        .collect()
}

/// Quadratic-midpoint smoothing: each interior vertex becomes the control
/// point of a curve ending halfway to the next vertex; the last curve ends on
/// the final vertex.  Curves are flattened into line segments.
fn smooth_outline(points: &[(f32, f32)]) -> Vec<(f32, f32)> {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }
    let mut out = vec![points[0]];
    let mut current = points[0];
    for i in 1..n - 2 {
        let ctrl = points[i];
        let end = (
            (points[i].0 + points[i + 1].0) / 2.0,
            (points[i].1 + points[i + 1].1) / 2.0,
        );
        flatten_quad(current, ctrl, end, &mut out);
        current = end;
    }
    flatten_quad(current, points[n - 2], points[n - 1], &mut out);
    out
}

fn flatten_quad(p0: (f32, f32), c: (f32, f32), p1: (f32, f32), out: &mut Vec<(f32, f32)>) {
    for step in 1..=QUAD_FLATTEN_STEPS {
        let t = step as f32 / QUAD_FLATTEN_STEPS as f32;
        let mt = 1.0 - t;
        out.push((
            mt * mt * p0.0 + 2.0 * mt * t * c.0 + t * t * p1.0,
            mt * mt * p0.1 + 2.0 * mt * t * c.1 + t * t * p1.1,
        ));
    }
}

/// Scanline fill of a closed polygon (non-zero winding), sampling pixel
/// centres.  Writes 1.0 into `cov` for covered pixels of an `n × n` grid.
fn fill_polygon_nonzero(points: &[(f32, f32)], n: usize, cov: &mut [f32]) {
    if points.len() < 3 {
        return;
    }
    let mut crossings: Vec<(f32, i32)> = Vec::with_capacity(points.len());
    for py in 0..n {
        let yc = py as f32 + 0.5;
        crossings.clear();
        for i in 0..points.len() {
            let a = points[i];
            let b = points[(i + 1) % points.len()];
            let (dir, lo, hi) = if a.1 <= b.1 { (1, a, b) } else { (-1, b, a) };
            if yc < lo.1 || yc >= hi.1 || hi.1 == lo.1 {
                continue;
            }
            let x = lo.0 + (yc - lo.1) * (hi.0 - lo.0) / (hi.1 - lo.1);
            crossings.push((x, dir));
        }
        crossings.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut winding = 0;
        for pair in crossings.windows(2) {
            winding += pair[0].1;
            if winding == 0 {
                continue;
            }
            let start = (pair[0].0 - 0.5).ceil().max(0.0) as usize;
            let end = (pair[1].0 - 0.5).ceil().clamp(0.0, n as f32) as usize;
            for px in start..end {
                cov[py * n + px] = 1.0;
            }
        }
    }
}

// ============================================================================
// RASTERIZATION
// ============================================================================

/// Stamp placement for a footprint reaching `reach` pixels from (x, y).
///
/// The origin is floored, so a fractional centre shifts the covered span
/// by up to one pixel; the side is `ceil(2·reach) + 1` to keep that last
/// column and row.
fn placement(x: f32, y: f32, reach: f32) -> ((i32, i32), u32, f32, f32) {
    let reach = reach.clamp(0.0, MAX_BRUSH_SIZE);
    let origin = ((x - reach).floor() as i32, (y - reach).floor() as i32);
    let side = (2.0 * reach).ceil().max(1.0) as u32 + 1;
    let cx = x - origin.0 as f32;
    let cy = y - origin.1 as f32;
    (origin, side, cx, cy)
}

/// Build the stamp for one application at world position (`x`, `y`).
///
/// `tile` is sampled with its repeat phase locked to world coordinates.
/// The only impurity is the rough-outline jitter drawn from `rng`.
pub fn rasterize<R: Rng + ?Sized>(
    x: f32,
    y: f32,
    spec: &BrushSpec,
    tile: &RgbaImage,
    rng: &mut R,
) -> Stamp {
    rasterize_within(x, y, spec, tile, rng, spec.size)
}

/// [`rasterize`], with coverage cut off at `reach` pixels from the centre
/// instead of `spec.size`.  The stamp is only as large as `reach` needs.
pub fn rasterize_within<R: Rng + ?Sized>(
    x: f32,
    y: f32,
    spec: &BrushSpec,
    tile: &RgbaImage,
    rng: &mut R,
    reach: f32,
) -> Stamp {
    let reach = reach.min(spec.size);
    let (origin, side, cx, cy) = placement(x, y, reach);
    let footprint = Footprint::build(spec, rng);
    let cov = footprint.coverage(side, cx, cy, reach);
    let (tw, th) = (tile.width().max(1) as i32, tile.height().max(1) as i32);
    let tile_ok = tile.width() > 0 && tile.height() > 0;

    let pixels = RgbaImage::from_fn(side, side, |px, py| {
        let c = cov[py as usize * side as usize + px as usize] * spec.opacity;
        if c <= 0.0 || !tile_ok {
            return Rgba([0, 0, 0, 0]);
        }
        let wx = (origin.0 + px as i32).rem_euclid(tw) as u32;
        let wy = (origin.1 + py as i32).rem_euclid(th) as u32;
        let t = tile.get_pixel(wx, wy);
        let a = (t[3] as f32 * c).round().clamp(0.0, 255.0) as u8;
        if a == 0 {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([t[0], t[1], t[2], a])
        }
    });

    Stamp { origin, pixels }
}

/// Footprint-only stamp (opaque black × footprint alpha), used for erasing
/// and for mask coverage edits where the pattern colour is irrelevant.
pub fn rasterize_footprint<R: Rng + ?Sized>(x: f32, y: f32, spec: &BrushSpec, rng: &mut R) -> Stamp {
    let (origin, side, cx, cy) = placement(x, y, spec.size);
    let footprint = Footprint::build(spec, rng);
    let cov = footprint.coverage(side, cx, cy, spec.size);
    let pixels = RgbaImage::from_fn(side, side, |px, py| {
        let c = cov[py as usize * side as usize + px as usize] * spec.opacity;
        Rgba([0, 0, 0, (c * 255.0).round().clamp(0.0, 255.0) as u8])
    });
    Stamp { origin, pixels }
}
