// ============================================================================
// PATTERN TILE CACHE - reusable tileable rasters keyed by pattern id
// ============================================================================
//
// Two kinds of id:
//   - a procedural generator name (`solid`, `dots`, `stripes`, `noise`) plus a
//     colour, synthesized once into a small repeating tile;
//   - anything else is an image reference, decoded once on a worker thread
//     and cached.  Until the decode lands the lookup reports `Pending`.
//
// Lookups never block the caller.
// ============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use image::{Rgba, RgbaImage};
use rand::Rng;

use crate::canvas::blend_source_over;
use crate::color::Color;
use crate::{log_info, log_warn};

/// Dots and stripes repeat every 12 / 8 pixels, so procedural tiles are a
/// multiple of 24 to wrap seamlessly.
const PROCEDURAL_QUANTUM: u32 = 24;
const DOT_SPACING: u32 = 12;
const DOT_RADIUS: f32 = 3.0;
const STRIPE_PERIOD: f32 = 8.0;
const STRIPE_WIDTH: f32 = 3.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProceduralKind {
    Solid,
    Dots,
    Stripes,
    Noise,
}

impl ProceduralKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "solid" => Some(ProceduralKind::Solid),
            "dots" => Some(ProceduralKind::Dots),
            "stripes" => Some(ProceduralKind::Stripes),
            "noise" => Some(ProceduralKind::Noise),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProceduralKind::Solid => "solid",
            ProceduralKind::Dots => "dots",
            ProceduralKind::Stripes => "stripes",
            ProceduralKind::Noise => "noise",
        }
    }

    /// Whether regenerating the tile yields the same pixels.
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, ProceduralKind::Noise)
    }
}

/// Outcome of a cache lookup.
#[derive(Clone, Debug)]
pub enum TileLookup {
    Ready(Arc<RgbaImage>),
    /// The image is still being decoded; the request should be dropped.
    Pending,
    /// The image could not be loaded.  Stays failed until [`PatternTileCache::retry`].
    Failed,
}

impl TileLookup {
    pub fn ready(self) -> Option<Arc<RgbaImage>> {
        match self {
            TileLookup::Ready(tile) => Some(tile),
            _ => None,
        }
    }
}

/// Error raised while resolving an image pattern.
#[derive(Debug)]
pub enum PatternError {
    Io(std::io::Error),
    Decode(String),
    NotFound(String),
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternError::Io(e) => write!(f, "I/O error: {}", e),
            PatternError::Decode(e) => write!(f, "Decode error: {}", e),
            PatternError::NotFound(id) => write!(f, "Pattern not found: {}", id),
        }
    }
}

impl std::error::Error for PatternError {}

impl From<std::io::Error> for PatternError {
    fn from(e: std::io::Error) -> Self {
        PatternError::Io(e)
    }
}

impl From<image::ImageError> for PatternError {
    fn from(e: image::ImageError) -> Self {
        PatternError::Decode(e.to_string())
    }
}

/// Resolves an image pattern id to pixels.  Runs on a worker thread.
pub trait TileLoader: Send + Sync {
    fn load(&self, id: &str) -> Result<RgbaImage, PatternError>;
}

/// Loads image patterns from disk, resolving relative ids against `root`.
pub struct FsTileLoader {
    root: PathBuf,
}

impl FsTileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, id: &str) -> PathBuf {
        let p = Path::new(id);
        if p.is_absolute() && p.exists() {
            return p.to_path_buf();
        }
        // "/assets/grass.png" style ids are relative to the texture root.
        self.root.join(id.trim_start_matches(['/', '\\']))
    }
}

impl TileLoader for FsTileLoader {
    fn load(&self, id: &str) -> Result<RgbaImage, PatternError> {
        let path = self.resolve(id);
        if !path.exists() {
            return Err(PatternError::NotFound(path.display().to_string()));
        }
        let img = image::open(&path)?.into_rgba8();
        if img.width() == 0 || img.height() == 0 {
            return Err(PatternError::Decode(format!("{} has no pixels", path.display())));
        }
        Ok(img)
    }
}

enum ImageEntry {
    Pending,
    Ready(Arc<RgbaImage>),
    Failed(String),
}

type LoadResult = (String, Result<RgbaImage, PatternError>);

pub struct PatternTileCache {
    tile_size: u32,
    noise_dots: u32,
    procedural: HashMap<(ProceduralKind, [u8; 4]), Arc<RgbaImage>>,
    images: HashMap<String, ImageEntry>,
    loader: Arc<dyn TileLoader>,
    tx: Sender<LoadResult>,
    rx: Receiver<LoadResult>,
}

impl PatternTileCache {
    pub fn new(tile_size: u32, noise_dots: u32, loader: Arc<dyn TileLoader>) -> Self {
        let (tx, rx) = mpsc::channel();
        let tile_size = tile_size.max(1).div_ceil(PROCEDURAL_QUANTUM) * PROCEDURAL_QUANTUM;
        Self {
            tile_size,
            noise_dots,
            procedural: HashMap::new(),
            images: HashMap::new(),
            loader,
            tx,
            rx,
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Look up (or start producing) the tile for `id`.  Procedural tiles are
    /// synthesized synchronously on first use; image tiles start a background
    /// decode and report `Pending` until [`poll`](Self::poll) sees it finish.
    pub fn get_tile(&mut self, id: &str, color: Option<Color>) -> TileLookup {
        if let Some(kind) = ProceduralKind::from_name(id) {
            let color = color.unwrap_or(Color::BLACK);
            let (size, dots) = (self.tile_size, self.noise_dots);
            let tile = self
                .procedural
                .entry((kind, color.0))
                .or_insert_with(|| Arc::new(generate_tile(kind, color, size, dots)));
            return TileLookup::Ready(Arc::clone(tile));
        }

        match self.images.get(id) {
            Some(ImageEntry::Ready(tile)) => TileLookup::Ready(Arc::clone(tile)),
            Some(ImageEntry::Pending) => TileLookup::Pending,
            Some(ImageEntry::Failed(_)) => TileLookup::Failed,
            None => {
                self.start_load(id);
                TileLookup::Pending
            }
        }
    }

    fn start_load(&mut self, id: &str) {
        log_info!("Loading pattern image '{}'", id);
        self.images.insert(id.to_string(), ImageEntry::Pending);
        let loader = Arc::clone(&self.loader);
        let tx = self.tx.clone();
        let key = id.to_string();
        std::thread::spawn(move || {
            let result = loader.load(&key);
            // The cache may have been dropped meanwhile; nothing to report then.
            let _ = tx.send((key, result));
        });
    }

    /// Drain finished background loads.  Returns the ids that became ready.
    pub fn poll(&mut self) -> Vec<String> {
        let mut ready = Vec::new();
        while let Ok((id, result)) = self.rx.try_recv() {
            // A pattern inserted directly while its decode was in flight wins.
            if !matches!(self.images.get(&id), Some(ImageEntry::Pending)) {
                continue;
            }
            match result {
                Ok(img) => {
                    self.images.insert(id.clone(), ImageEntry::Ready(Arc::new(img)));
                    ready.push(id);
                }
                Err(e) => {
                    log_warn!("Failed to load pattern '{}': {}", id, e);
                    self.images.insert(id, ImageEntry::Failed(e.to_string()));
                }
            }
        }
        ready
    }

    /// Register an already-decoded image under `id` (embedded textures).
    pub fn insert_image(&mut self, id: impl Into<String>, img: RgbaImage) {
        self.images.insert(id.into(), ImageEntry::Ready(Arc::new(img)));
    }

    pub fn is_pending(&self, id: &str) -> bool {
        matches!(self.images.get(id), Some(ImageEntry::Pending))
    }

    /// Error message of a failed load, if any.
    pub fn failure(&self, id: &str) -> Option<&str> {
        match self.images.get(id) {
            Some(ImageEntry::Failed(msg)) => Some(msg.as_str()),
            _ => None,
        }
    }

    /// Forget a failed (or loaded) image so the next lookup loads it again.
    pub fn retry(&mut self, id: &str) {
        if !self.is_pending(id) {
            self.images.remove(id);
        }
    }
}

// ============================================================================
// PROCEDURAL TILES
// ============================================================================

/// Synthesize one repeating tile.  `Noise` scatters `noise_dots` single
/// pixels at random positions and opacities, so two calls differ.
pub fn generate_tile(kind: ProceduralKind, color: Color, size: u32, noise_dots: u32) -> RgbaImage {
    let ink = color.to_rgba();
    match kind {
        ProceduralKind::Solid => RgbaImage::from_pixel(size, size, ink),
        ProceduralKind::Dots => RgbaImage::from_fn(size, size, |x, y| {
            // Disc centres sit at 6, 18, 30, ... on both axes.
            let lx = (x % DOT_SPACING) as f32 + 0.5 - DOT_SPACING as f32 / 2.0;
            let ly = (y % DOT_SPACING) as f32 + 0.5 - DOT_SPACING as f32 / 2.0;
            if lx * lx + ly * ly <= DOT_RADIUS * DOT_RADIUS {
                ink
            } else {
                Rgba([0, 0, 0, 0])
            }
        }),
        ProceduralKind::Stripes => RgbaImage::from_fn(size, size, |x, y| {
            // Diagonal lines x − y ≡ 0 (mod period), measured perpendicular.
            let d = (x as f32 - y as f32).rem_euclid(STRIPE_PERIOD);
            let d = d.min(STRIPE_PERIOD - d) / std::f32::consts::SQRT_2;
            if d <= STRIPE_WIDTH / 2.0 {
                ink
            } else {
                Rgba([0, 0, 0, 0])
            }
        }),
        ProceduralKind::Noise => {
            let mut tile = RgbaImage::new(size, size);
            let mut rng = rand::thread_rng();
            for _ in 0..noise_dots {
                let x = rng.gen_range(0..size);
                let y = rng.gen_range(0..size);
                let alpha: f32 = rng.gen_range(0.3..1.0);
                let dst = tile.get_pixel_mut(x, y);
                *dst = blend_source_over(*dst, ink, alpha);
            }
            tile
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    struct MapLoader(HashMap<String, RgbaImage>);

    impl TileLoader for MapLoader {
        fn load(&self, id: &str) -> Result<RgbaImage, PatternError> {
            self.0
                .get(id)
                .cloned()
                .ok_or_else(|| PatternError::NotFound(id.to_string()))
        }
    }

    fn cache_with(entries: &[(&str, RgbaImage)]) -> PatternTileCache {
        let map = entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        PatternTileCache::new(24, 150, Arc::new(MapLoader(map)))
    }

    fn wait_for(cache: &mut PatternTileCache, id: &str) -> Vec<String> {
        let start = Instant::now();
        let mut seen = Vec::new();
        while cache.is_pending(id) && start.elapsed() < Duration::from_secs(5) {
            seen.extend(cache.poll());
            std::thread::sleep(Duration::from_millis(2));
        }
        seen
    }

    #[test]
    fn procedural_tiles_are_cached_per_color() {
        let mut cache = cache_with(&[]);
        let red = Some(Color::rgba(255, 0, 0, 255));
        let a = cache.get_tile("solid", red).ready().unwrap();
        let b = cache.get_tile("solid", red).ready().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.get_tile("solid", Some(Color::BLACK)).ready().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.dimensions(), (24, 24));
        assert_eq!(*a.get_pixel(7, 7), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn tile_size_rounds_to_seamless_multiple() {
        let cache = PatternTileCache::new(30, 10, Arc::new(FsTileLoader::new(".")));
        assert_eq!(cache.tile_size(), 48);
    }

    #[test]
    fn dots_have_four_discs() {
        let tile = generate_tile(ProceduralKind::Dots, Color::BLACK, 24, 0);
        assert_eq!(tile.get_pixel(6, 6)[3], 255);
        assert_eq!(tile.get_pixel(18, 6)[3], 255);
        assert_eq!(tile.get_pixel(6, 18)[3], 255);
        assert_eq!(tile.get_pixel(0, 0)[3], 0);
        assert_eq!(tile.get_pixel(12, 12)[3], 0);
    }

    #[test]
    fn stripes_wrap_seamlessly() {
        let tile = generate_tile(ProceduralKind::Stripes, Color::BLACK, 24, 0);
        for y in 0..24 {
            // Continuing one column past the right edge equals column 0.
            let beyond = (24i32 - y as i32).rem_euclid(8) as f32;
            let d = beyond.min(8.0 - beyond) / std::f32::consts::SQRT_2;
            let expect = if d <= 1.5 { 255 } else { 0 };
            assert_eq!(tile.get_pixel(0, y)[3], expect, "row {}", y);
        }
        assert_eq!(tile.get_pixel(5, 5)[3], 255);
        assert_eq!(tile.get_pixel(4, 0)[3], 0);
    }

    #[test]
    fn noise_is_not_deterministic_and_partially_covered() {
        let a = generate_tile(ProceduralKind::Noise, Color::BLACK, 24, 150);
        let b = generate_tile(ProceduralKind::Noise, Color::BLACK, 24, 150);
        assert_ne!(a, b);
        let covered = a.pixels().filter(|p| p[3] > 0).count();
        assert!(covered > 50 && covered <= 150, "covered {}", covered);
        assert!(a.pixels().all(|p| p[3] == 0 || p[3] >= 76));
    }

    #[test]
    fn image_patterns_load_in_background() {
        let grass = RgbaImage::from_pixel(8, 8, Rgba([0, 200, 0, 255]));
        let mut cache = cache_with(&[("/assets/grass.png", grass.clone())]);
        assert!(matches!(cache.get_tile("/assets/grass.png", None), TileLookup::Pending));
        // Asking again while pending does not start a second load.
        assert!(matches!(cache.get_tile("/assets/grass.png", None), TileLookup::Pending));
        let ready = wait_for(&mut cache, "/assets/grass.png");
        assert_eq!(ready, vec!["/assets/grass.png".to_string()]);
        let tile = cache.get_tile("/assets/grass.png", None).ready().unwrap();
        assert_eq!(*tile, grass);
    }

    #[test]
    fn failed_loads_stick_until_retry() {
        let mut cache = cache_with(&[]);
        assert!(matches!(cache.get_tile("missing.png", None), TileLookup::Pending));
        let ready = wait_for(&mut cache, "missing.png");
        assert!(ready.is_empty());
        assert!(matches!(cache.get_tile("missing.png", None), TileLookup::Failed));
        assert!(cache.failure("missing.png").is_some());
        cache.retry("missing.png");
        assert!(matches!(cache.get_tile("missing.png", None), TileLookup::Pending));
    }

    #[test]
    fn inserted_images_are_immediately_ready() {
        let mut cache = cache_with(&[]);
        cache.insert_image("embedded", RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255])));
        assert!(cache.get_tile("embedded", None).ready().is_some());
    }

    #[test]
    fn fs_loader_reports_missing_files() {
        let loader = FsTileLoader::new("/definitely/not/here");
        assert!(matches!(loader.load("/assets/none.png"), Err(PatternError::NotFound(_))));
    }
}
