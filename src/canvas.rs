use std::sync::Arc;
use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::brush::Stamp;

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// Largest canvas edge accepted at construction.
pub const MAX_CANVAS_DIM: u32 = 32_768;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled image backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and mutations via `get_pixel_mut` use
/// `Arc::make_mut` to clone only the touched chunk.  Pixels are straight
/// (non-premultiplied) RGBA.
#[derive(Clone)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image.
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.clamp(1, MAX_CANVAS_DIM);
        let height = height.clamp(1, MAX_CANVAS_DIM);
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        let total = (chunks_per_row * chunks_per_col) as usize;
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        }
    }

    /// Import from a flat `RgbaImage` of the same size.  Only non-transparent
    /// chunks are stored.  Chunk conversion is parallelised with rayon.
    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        let width = src.width();
        let height = src.height();
        let mut img = Self::new(width, height);
        if img.width != width || img.height != height {
            // Clamped at construction; fall back to a per-pixel copy of the overlap.
            img.draw_image(src, 0, 0);
            return img;
        }

        let chunks_x = img.chunks_per_row as usize;
        let total_chunks = img.chunks.len();
        let src_raw = src.as_raw();

        let chunk_results: Vec<(usize, Option<Arc<RgbaImage>>)> = (0..total_chunks)
            .into_par_iter()
            .map(|flat| {
                let cx = (flat % chunks_x) as u32;
                let cy = (flat / chunks_x) as u32;
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;

                let cw = CHUNK_SIZE.min(width - base_x);
                let ch = CHUNK_SIZE.min(height - base_y);
                let chunk_stride = CHUNK_SIZE as usize * 4;
                let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = ((base_y + ly) * width + base_x) as usize * 4;
                    let dst_start = ly as usize * chunk_stride;
                    let byte_len = cw as usize * 4;
                    let row = &src_raw[src_start..src_start + byte_len];
                    chunk_data[dst_start..dst_start + byte_len].copy_from_slice(row);
                    if !has_content {
                        has_content = row.chunks_exact(4).any(|px| px[3] != 0);
                    }
                }

                let chunk = if has_content {
                    RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data).map(Arc::new)
                } else {
                    None
                };
                (flat, chunk)
            })
            .collect();

        for (idx, chunk) in chunk_results {
            img.chunks[idx] = chunk;
        }
        img
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.width, self.height);
        let out_stride = self.width as usize * 4;
        let out_raw: &mut [u8] = out.as_mut();
        for (cx, cy) in self.chunk_keys() {
            if let Some(chunk) = self.get_chunk(cx, cy) {
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let cw = CHUNK_SIZE.min(self.width - base_x) as usize;
                let ch = CHUNK_SIZE.min(self.height - base_y) as usize;
                let chunk_raw = chunk.as_raw();
                let chunk_stride = CHUNK_SIZE as usize * 4;
                for ly in 0..ch {
                    let src_start = ly * chunk_stride;
                    let dst_start = (base_y as usize + ly) * out_stride + base_x as usize * 4;
                    out_raw[dst_start..dst_start + cw * 4]
                        .copy_from_slice(&chunk_raw[src_start..src_start + cw * 4]);
                }
            }
        }
        out
    }

    // ---- pixel access -------------------------------------------------------

    #[inline]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) {
        (x / CHUNK_SIZE, y / CHUNK_SIZE)
    }

    #[inline]
    fn local(x: u32, y: u32) -> (u32, u32) {
        (x % CHUNK_SIZE, y % CHUNK_SIZE)
    }

    #[inline]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks or
    /// out-of-bounds coordinates).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height {
            return &TRANSPARENT_PIXEL;
        }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        self.chunks[idx]
            .as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Alpha at a signed world coordinate; 0 outside the image.
    #[inline]
    pub fn alpha_at(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 {
            return 0;
        }
        self.get_pixel(x as u32, y as u32)[3]
    }

    /// Mutable reference to a pixel (creates the chunk on demand, COW-clones if
    /// shared).  Caller guarantees `x < width && y < height`.
    #[inline]
    pub fn get_pixel_mut(&mut self, x: u32, y: u32) -> &mut Rgba<u8> {
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).get_pixel_mut(lx, ly)
    }

    /// Write a pixel; out-of-bounds writes are ignored.
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height {
            return;
        }
        *self.get_pixel_mut(x, y) = pixel;
    }

    /// Read-only access to a chunk (if it exists).
    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        if cx >= self.chunks_per_row {
            return None;
        }
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx).and_then(|c| c.as_deref())
    }

    /// Place a fully-built chunk at the given chunk coordinate.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, chunk: RgbaImage) {
        if cx >= self.chunks_per_row {
            return;
        }
        let idx = self.flat_index(cx, cy);
        if idx < self.chunks.len() {
            self.chunks[idx] = Some(Arc::new(chunk));
        }
    }

    /// Iterator over populated chunk coordinates.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks.iter().enumerate().filter_map(move |(i, slot)| {
            slot.as_ref().map(|_| ((i as u32) % cpr, (i as u32) / cpr))
        })
    }

    /// Number of populated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    // ---- bulk operations ----------------------------------------------------

    /// Fill every pixel with `color`.
    pub fn fill(&mut self, color: Rgba<u8>) {
        if color[3] == 0 {
            self.clear();
            return;
        }
        for slot in &mut self.chunks {
            *slot = Some(Arc::new(RgbaImage::from_pixel(CHUNK_SIZE, CHUNK_SIZE, color)));
        }
    }

    /// Repeat `tile` across the whole image, phase-locked to (0, 0).
    pub fn fill_tiled(&mut self, tile: &RgbaImage) {
        let (tw, th) = (tile.width(), tile.height());
        if tw == 0 || th == 0 {
            return;
        }
        let chunks_x = self.chunks_per_row;
        let (w, h) = (self.width, self.height);
        self.chunks
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, slot)| {
                let base_x = (i as u32 % chunks_x) * CHUNK_SIZE;
                let base_y = (i as u32 / chunks_x) * CHUNK_SIZE;
                let chunk = RgbaImage::from_fn(CHUNK_SIZE, CHUNK_SIZE, |lx, ly| {
                    let (x, y) = (base_x + lx, base_y + ly);
                    if x >= w || y >= h {
                        return Rgba([0, 0, 0, 0]);
                    }
                    *tile.get_pixel(x % tw, y % th)
                });
                *slot = Some(Arc::new(chunk));
            });
    }

    /// Draw `src` with its top-left corner at (`dx`, `dy`), replacing the
    /// covered pixels.  Parts falling outside the image are clipped.
    pub fn draw_image(&mut self, src: &RgbaImage, dx: i32, dy: i32) {
        for (sx, sy, px) in src.enumerate_pixels() {
            let x = dx + sx as i32;
            let y = dy + sy as i32;
            if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
                continue;
            }
            if px[3] == 0 && self.get_pixel(x as u32, y as u32)[3] == 0 {
                continue;
            }
            *self.get_pixel_mut(x as u32, y as u32) = *px;
        }
    }

    /// Drop all chunks (make the image fully transparent).
    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    /// True when at least one pixel has non-zero alpha.
    pub fn has_coverage(&self) -> bool {
        self.chunks
            .par_iter()
            .filter_map(|c| c.as_ref())
            .any(|chunk| chunk.as_raw().chunks_exact(4).any(|px| px[3] != 0))
    }

    /// Tight bounding box `(min_x, min_y, max_x, max_y)` (inclusive) of pixels
    /// whose alpha is non-zero.
    pub fn coverage_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.get_chunk(cx, cy) else { continue };
            for (lx, ly, px) in chunk.enumerate_pixels() {
                if px[3] == 0 {
                    continue;
                }
                let x = cx * CHUNK_SIZE + lx;
                let y = cy * CHUNK_SIZE + ly;
                if x >= self.width || y >= self.height {
                    continue;
                }
                bounds = Some(match bounds {
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                    None => (x, y, x, y),
                });
            }
        }
        bounds
    }

    /// Width accessor (matches `RgbaImage::width()`).
    pub fn width(&self) -> u32 { self.width }

    /// Height accessor (matches `RgbaImage::height()`).
    pub fn height(&self) -> u32 { self.height }

    /// Approximate memory usage in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.chunk_count() * (CHUNK_SIZE * CHUNK_SIZE * 4) as usize
    }
}

// ============================================================================
// PER-PIXEL COMPOSITING
// ============================================================================

/// Porter-Duff operator used when merging a stamp into a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CompositeOp {
    /// Standard alpha blending: the stamp is drawn over the layer.
    #[default]
    SourceOver,
    /// The stamp's alpha is removed from the layer; its color is ignored.
    DestinationOut,
}

/// Blend `top` over `base` (straight alpha) with an extra opacity factor.
#[inline]
pub fn blend_source_over(base: Rgba<u8>, top: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    if opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let top_a = (top[3] as f32 / 255.0) * opacity.min(1.0);
    let base_a = base[3] as f32 / 255.0;
    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let mut out = [0u8; 4];
    for c in 0..3 {
        let v = (top[c] as f32 * top_a + base[c] as f32 * base_a * (1.0 - top_a)) / out_a;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba(out)
}

/// Remove `alpha` (0..255) worth of coverage from `base`.
#[inline]
pub fn blend_destination_out(base: Rgba<u8>, alpha: u8) -> Rgba<u8> {
    if alpha == 0 || base[3] == 0 {
        return base;
    }
    let keep = 1.0 - alpha as f32 / 255.0;
    let a = (base[3] as f32 * keep).round() as u8;
    if a == 0 {
        Rgba([0, 0, 0, 0])
    } else {
        Rgba([base[0], base[1], base[2], a])
    }
}

/// Draw `top` over `base` in place, row-parallel.  Both images must share
/// dimensions.
pub fn composite_over(base: &mut RgbaImage, top: &RgbaImage) {
    debug_assert_eq!(base.dimensions(), top.dimensions());
    let stride = base.width() as usize * 4;
    let top_raw = top.as_raw();
    let base_raw: &mut [u8] = base.as_mut();
    base_raw
        .par_chunks_mut(stride)
        .zip(top_raw.par_chunks(stride))
        .for_each(|(row_out, row_top)| {
            for (dst, src) in row_out.chunks_exact_mut(4).zip(row_top.chunks_exact(4)) {
                if src[3] == 0 {
                    continue;
                }
                let b = Rgba([dst[0], dst[1], dst[2], dst[3]]);
                let t = Rgba([src[0], src[1], src[2], src[3]]);
                dst.copy_from_slice(&blend_source_over(b, t, 1.0).0);
            }
        });
}

// ============================================================================
// LAYER STORE
// ============================================================================

/// The four fixed layers every document owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Background,
    Foreground,
    Top,
    Mask,
}

impl LayerKind {
    pub fn all() -> &'static [LayerKind] {
        &[LayerKind::Background, LayerKind::Foreground, LayerKind::Top, LayerKind::Mask]
    }

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Background => "background",
            LayerKind::Foreground => "foreground",
            LayerKind::Top => "top",
            LayerKind::Mask => "mask",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "background" | "terrain" => Some(LayerKind::Background),
            "foreground" => Some(LayerKind::Foreground),
            "top" => Some(LayerKind::Top),
            "mask" => Some(LayerKind::Mask),
            _ => None,
        }
    }

    /// Stable on-disk tag.
    pub fn to_u8(&self) -> u8 {
        match self {
            LayerKind::Background => 0,
            LayerKind::Foreground => 1,
            LayerKind::Top => 2,
            LayerKind::Mask => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LayerKind::Background),
            1 => Some(LayerKind::Foreground),
            2 => Some(LayerKind::Top),
            3 => Some(LayerKind::Mask),
            _ => None,
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct Layer {
    pub kind: LayerKind,
    pub pixels: TiledImage,
    /// Bumped every time this layer's pixels change.  The composed frame
    /// remembers the generations it was built from.
    pub generation: u64,
}

impl Layer {
    pub fn new(kind: LayerKind, width: u32, height: u32) -> Self {
        Self {
            kind,
            pixels: TiledImage::new(width, height),
            generation: 0,
        }
    }

    pub fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Owns one fixed-size buffer per [`LayerKind`].  Dimensions never change
/// after construction.
pub struct LayerStore {
    width: u32,
    height: u32,
    layers: Vec<Layer>,
}

impl LayerStore {
    pub fn new(width: u32, height: u32) -> Self {
        let probe = TiledImage::new(width, height);
        let (width, height) = (probe.width(), probe.height());
        let layers = LayerKind::all()
            .iter()
            .map(|&kind| Layer::new(kind, width, height))
            .collect();
        Self { width, height, layers }
    }

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }

    pub fn get(&self, kind: LayerKind) -> Option<&Layer> {
        self.layers.iter().find(|l| l.kind == kind)
    }

    pub fn get_mut(&mut self, kind: LayerKind) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.kind == kind)
    }

    /// Generation counters in `LayerKind::all()` order.
    pub fn generations(&self) -> [u64; 4] {
        let mut out = [0u64; 4];
        for (slot, kind) in out.iter_mut().zip(LayerKind::all()) {
            *slot = self.get(*kind).map_or(0, |l| l.generation);
        }
        out
    }

    /// Flattened copy of one layer; a missing layer reads as transparent.
    pub fn flatten(&self, kind: LayerKind) -> RgbaImage {
        match self.get(kind) {
            Some(layer) => layer.pixels.to_rgba_image(),
            None => RgbaImage::new(self.width, self.height),
        }
    }

    pub fn clear(&mut self, kind: LayerKind) {
        if let Some(layer) = self.get_mut(kind) {
            layer.pixels.clear();
            layer.touch();
        }
    }

    pub fn fill(&mut self, kind: LayerKind, color: Rgba<u8>) {
        if let Some(layer) = self.get_mut(kind) {
            layer.pixels.fill(color);
            layer.touch();
        }
    }

    pub fn fill_tiled(&mut self, kind: LayerKind, tile: &RgbaImage) {
        if let Some(layer) = self.get_mut(kind) {
            layer.pixels.fill_tiled(tile);
            layer.touch();
        }
    }

    /// Replace the top-left region of a layer with `img` (clipped).
    pub fn draw_image(&mut self, kind: LayerKind, img: &RgbaImage) {
        if let Some(layer) = self.get_mut(kind) {
            if img.dimensions() == (layer.pixels.width(), layer.pixels.height()) {
                layer.pixels = TiledImage::from_rgba_image(img);
            } else {
                layer.pixels.draw_image(img, 0, 0);
            }
            layer.touch();
        }
    }

    /// Merge a stamp into a layer in place.  Returns the number of pixels
    /// that were touched.
    pub fn apply_stamp(&mut self, kind: LayerKind, stamp: &Stamp, op: CompositeOp) -> usize {
        let Some(layer) = self.get_mut(kind) else { return 0 };
        let (w, h) = (layer.pixels.width() as i32, layer.pixels.height() as i32);
        let (ox, oy) = stamp.origin;
        let mut touched = 0usize;

        for (sx, sy, src) in stamp.pixels.enumerate_pixels() {
            if src[3] == 0 {
                continue;
            }
            let x = ox + sx as i32;
            let y = oy + sy as i32;
            if x < 0 || y < 0 || x >= w || y >= h {
                continue;
            }
            let (x, y) = (x as u32, y as u32);
            match op {
                CompositeOp::SourceOver => {
                    let dst = layer.pixels.get_pixel_mut(x, y);
                    *dst = blend_source_over(*dst, *src, 1.0);
                }
                CompositeOp::DestinationOut => {
                    if layer.pixels.get_pixel(x, y)[3] == 0 {
                        continue;
                    }
                    let dst = layer.pixels.get_pixel_mut(x, y);
                    *dst = blend_destination_out(*dst, src[3]);
                }
            }
            touched += 1;
        }

        if touched > 0 {
            layer.touch();
        }
        touched
    }
}
