// ============================================================================
// ENGINE - one document: layers, patterns, mask gate and compositor
// ============================================================================
//
// Single caller, synchronous.  The only background work is image pattern
// decoding; the host calls `poll_patterns()` and `frame_tick()` once per
// display refresh.
// ============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use image::{Rgba, RgbaImage};
use rand::SeedableRng;
use rand::rngs::StdRng;
use uuid::Uuid;

use crate::brush::{self, BrushAction, BrushShape, BrushSpec};
use crate::canvas::{CompositeOp, LayerKind, LayerStore, MAX_CANVAS_DIM};
use crate::compositor::{ComposedFrame, Compositor, compose};
use crate::effects::{EffectSettings, Quality};
use crate::mask::{MaskGate, MaskSubtractMode};
use crate::patterns::{FsTileLoader, PatternTileCache, TileLoader, TileLookup};
use crate::settings::EngineSettings;
use crate::snapshot::{self, LayerData, SnapshotError};
use crate::{log_info, log_warn};

/// A paint that arrived before its pattern image finished loading.
#[derive(Clone, Debug)]
struct PendingPaint {
    x: f32,
    y: f32,
    spec: BrushSpec,
    target: LayerKind,
}

pub struct Engine {
    id: Uuid,
    settings: EngineSettings,
    layers: LayerStore,
    patterns: PatternTileCache,
    gate: MaskGate,
    compositor: Compositor,
    effects: Option<EffectSettings>,
    rng: StdRng,
    /// At most one deferred paint per pattern id.
    pending: HashMap<String, PendingPaint>,
}

impl Engine {
    /// New document with default settings.  `background` is an encoded image
    /// for the background layer; without it a generated tile is repeated.
    pub fn new(width: u32, height: u32, background: Option<&[u8]>) -> Self {
        Self::with_settings(width, height, background, EngineSettings::default())
    }

    pub fn with_settings(width: u32, height: u32, background: Option<&[u8]>, settings: EngineSettings) -> Self {
        let loader = Arc::new(FsTileLoader::new(settings.texture_root.clone()));
        Self::with_loader(width, height, background, settings, loader)
    }

    pub fn with_loader(
        width: u32,
        height: u32,
        background: Option<&[u8]>,
        settings: EngineSettings,
        loader: Arc<dyn TileLoader>,
    ) -> Self {
        let mut engine = Self::from_store(LayerStore::new(width, height), settings, loader);
        let seeded = match background.map(|bytes| snapshot::import(&mut engine.layers, bytes)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                log_warn!("Engine {}: background image rejected ({}), using default tile", engine.id, e);
                false
            }
            None => false,
        };
        if !seeded {
            let tile = default_background_tile(engine.settings.default_tile_size);
            engine.layers.fill_tiled(LayerKind::Background, &tile);
        }
        engine.compositor.request_recompute();
        engine
    }

    fn from_store(layers: LayerStore, settings: EngineSettings, loader: Arc<dyn TileLoader>) -> Self {
        let id = Uuid::new_v4();
        log_info!(
            "Engine {}: {}x{} canvas, mask subtract '{}'",
            id,
            layers.width(),
            layers.height(),
            settings.mask_subtract.name()
        );
        Self {
            id,
            patterns: PatternTileCache::new(settings.pattern_tile_size, settings.noise_dots, loader),
            gate: MaskGate::new(settings.mask_subtract),
            compositor: Compositor::new(settings.fast_pass_opacity),
            layers,
            settings,
            effects: Some(EffectSettings::default()),
            rng: StdRng::from_entropy(),
            pending: HashMap::new(),
        }
    }

    /// Reopen a saved document.  Mask and top start empty.
    pub fn open_document(path: &Path, settings: EngineSettings) -> Result<Self, SnapshotError> {
        let layers = snapshot::load_document(path)?;
        let loader = Arc::new(FsTileLoader::new(settings.texture_root.clone()));
        let mut engine = Self::from_store(layers, settings, loader);
        engine.compositor.request_recompute();
        Ok(engine)
    }

    pub fn save_document(&self, path: &Path) -> Result<(), SnapshotError> {
        snapshot::save_document(&self.layers, path)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    pub fn patterns_mut(&mut self) -> &mut PatternTileCache {
        &mut self.patterns
    }

    /// Make rough outlines reproducible from now on.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    // ---- painting -----------------------------------------------------------

    /// Apply one brush stamp centred at (`x`, `y`).
    ///
    /// Mask actions always edit the mask layer whatever `target` says, and a
    /// plain paint aimed at the mask layer counts as a mask-add.  Foreground
    /// paint is gated by mask coverage; erasing is not, so ink left outside
    /// the mask after a subtract can still be removed.  Invalid specs
    /// (including sizes above `MAX_BRUSH_SIZE`), failed patterns and
    /// paints against a still-loading pattern are dropped.
    pub fn paint(&mut self, x: f32, y: f32, spec: &BrushSpec, target: LayerKind) {
        if let Err(e) = spec.validate() {
            log_warn!("Engine {}: ignoring brush: {}", self.id, e);
            return;
        }
        let far = (2 * MAX_CANVAS_DIM) as f32;
        if !x.is_finite() || !y.is_finite() || x.abs() > far || y.abs() > far {
            return;
        }

        let action = match (spec.action, target) {
            (BrushAction::Paint, LayerKind::Mask) => BrushAction::MaskAdd,
            (action, _) => action,
        };

        let touched = match action {
            BrushAction::Erase => {
                let stamp = brush::rasterize_footprint(x, y, spec, &mut self.rng);
                self.layers.apply_stamp(target, &stamp, CompositeOp::DestinationOut)
            }
            BrushAction::MaskSubtract => {
                let reclaim = match self.gate.subtract_mode {
                    MaskSubtractMode::Exact => None,
                    MaskSubtractMode::Reclaim => {
                        let Some(tile) = self.resolve_tile(x, y, spec, target) else { return };
                        let wide = spec.clone().with_size(spec.size * 2.0);
                        Some(brush::rasterize_within(x, y, &wide, &tile, &mut self.rng, spec.size))
                    }
                };
                let footprint = brush::rasterize_footprint(x, y, spec, &mut self.rng);
                self.gate.subtract(&mut self.layers, &footprint, reclaim.as_ref())
            }
            BrushAction::MaskAdd => {
                let Some(tile) = self.resolve_tile(x, y, spec, target) else { return };
                let stamp = brush::rasterize(x, y, spec, &tile, &mut self.rng);
                self.gate.add(&mut self.layers, &stamp)
            }
            BrushAction::Paint => {
                let Some(tile) = self.resolve_tile(x, y, spec, target) else { return };
                let stamp = brush::rasterize(x, y, spec, &tile, &mut self.rng);
                match target {
                    LayerKind::Foreground => {
                        if self.layers.get(LayerKind::Mask).is_none() {
                            log_warn!("Engine {}: no mask layer, foreground paint ignored", self.id);
                            return;
                        }
                        self.gate.paint_foreground(&mut self.layers, &stamp, CompositeOp::SourceOver)
                    }
                    _ => self.layers.apply_stamp(target, &stamp, CompositeOp::SourceOver),
                }
            }
        };

        if touched > 0 {
            self.compositor.request_recompute();
        }
    }

    /// Look up the pattern tile, parking the paint when the image is still
    /// loading.
    fn resolve_tile(&mut self, x: f32, y: f32, spec: &BrushSpec, target: LayerKind) -> Option<Arc<RgbaImage>> {
        match self.patterns.get_tile(&spec.pattern, spec.color) {
            TileLookup::Ready(tile) => Some(tile),
            TileLookup::Pending => {
                if self.pending.contains_key(&spec.pattern) {
                    log_info!("Engine {}: pattern '{}' still loading, paint dropped", self.id, spec.pattern);
                } else {
                    self.pending.insert(
                        spec.pattern.clone(),
                        PendingPaint { x, y, spec: spec.clone(), target },
                    );
                }
                None
            }
            TileLookup::Failed => {
                log_warn!("Engine {}: pattern '{}' unavailable, paint ignored", self.id, spec.pattern);
                None
            }
        }
    }

    /// Erase from the top scratch layer.
    pub fn erase(&mut self, x: f32, y: f32, size: f32, softness: f32, shape: BrushShape, roughness: f32, smooth: bool) {
        let spec = BrushSpec {
            shape,
            size,
            softness,
            roughness,
            smooth,
            opacity: 1.0,
            action: BrushAction::Erase,
            ..BrushSpec::default()
        };
        self.paint(x, y, &spec, LayerKind::Top);
    }

    /// Pick up finished pattern loads and apply the paints parked on them.
    /// Returns how many parked paints were applied.
    pub fn poll_patterns(&mut self) -> usize {
        let ready = self.patterns.poll();
        let mut applied = 0;
        for id in ready {
            if let Some(p) = self.pending.remove(&id) {
                self.paint(p.x, p.y, &p.spec, p.target);
                applied += 1;
            }
        }
        let patterns = &self.patterns;
        self.pending.retain(|id, _| patterns.is_pending(id));
        applied
    }

    /// Number of paints parked on loading patterns.
    pub fn pending_paints(&self) -> usize {
        self.pending.len()
    }

    // ---- compositing --------------------------------------------------------

    fn active_effects(&self) -> Option<&EffectSettings> {
        if self.settings.effects_enabled { self.effects.as_ref() } else { None }
    }

    pub fn effect_settings(&self) -> Option<&EffectSettings> {
        self.effects.as_ref()
    }

    /// Replace the effect settings; `None` turns the effect block off.
    pub fn set_effect_settings(&mut self, effects: Option<EffectSettings>) {
        self.effects = effects;
        self.compositor.request_recompute();
    }

    pub fn set_effects_enabled(&mut self, enabled: bool) {
        self.settings.effects_enabled = enabled;
        self.compositor.request_recompute();
    }

    /// Fast quality while dragging.  Leaving interactive mode recomputes at
    /// Full quality straight away.
    pub fn set_interactive(&mut self, interactive: bool) {
        let effects = if self.settings.effects_enabled { self.effects } else { None };
        self.compositor.set_interactive(interactive, &self.layers, effects.as_ref());
    }

    pub fn is_interactive(&self) -> bool {
        self.compositor.is_interactive()
    }

    /// Run the coalesced recompute, if one is pending.
    pub fn frame_tick(&mut self) -> bool {
        let effects = if self.settings.effects_enabled { self.effects } else { None };
        self.compositor.frame_tick(&self.layers, effects.as_ref())
    }

    /// Last composed frame (may be stale until the next tick).
    pub fn frame(&self) -> Option<&ComposedFrame> {
        self.compositor.frame()
    }

    pub fn frame_is_stale(&self) -> bool {
        self.frame()
            .is_none_or(|f| f.is_stale(&self.layers, self.active_effects()))
    }

    pub fn has_pending_recompute(&self) -> bool {
        self.compositor.pending_ticket().is_some()
    }

    pub fn recompute_count(&self) -> u64 {
        self.compositor.recompute_count()
    }

    /// Build a frame now at the given quality without touching the schedule.
    pub fn compose_now(&self, quality: Quality) -> ComposedFrame {
        compose(&self.layers, self.active_effects(), quality, self.settings.fast_pass_opacity)
    }

    // ---- persistence --------------------------------------------------------

    /// PNG of background + foreground.
    pub fn export(&self) -> Result<Vec<u8>, SnapshotError> {
        snapshot::export(&self.layers)
    }

    /// Replace the background with an encoded image; the foreground is cleared.
    pub fn import(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        snapshot::import(&mut self.layers, bytes)?;
        self.compositor.request_recompute();
        Ok(())
    }

    pub fn layer_data(&self) -> Result<LayerData, SnapshotError> {
        snapshot::layer_data(&self.layers)
    }
}

/// Parchment-like default background tile, deterministic for a given size.
pub fn default_background_tile(size: u32) -> RgbaImage {
    let size = size.max(1);
    RgbaImage::from_fn(size, size, |x, y| {
        let n = hash_u32(x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663));
        let grain = (n & 0x0f) as u8;
        Rgba([222 - grain, 208 - grain, 172 - grain, 255])
    })
}

#[inline]
fn hash_u32(mut x: u32) -> u32 {
    x = x.wrapping_mul(0x9E3779B9);
    x ^= x >> 16;
    x = x.wrapping_mul(0x85EBCA6B);
    x ^= x >> 13;
    x = x.wrapping_mul(0xC2B2AE35);
    x ^= x >> 16;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::MAX_BRUSH_SIZE;
    use crate::color::Color;
    use crate::patterns::PatternError;
    use std::time::{Duration, Instant};

    struct SlowLoader;

    impl TileLoader for SlowLoader {
        fn load(&self, id: &str) -> Result<RgbaImage, PatternError> {
            std::thread::sleep(Duration::from_millis(20));
            if id == "grass.png" {
                Ok(RgbaImage::from_pixel(8, 8, Rgba([0, 160, 0, 255])))
            } else {
                Err(PatternError::NotFound(id.to_string()))
            }
        }
    }

    fn engine() -> Engine {
        let mut e = Engine::with_loader(120, 120, None, EngineSettings::default(), Arc::new(SlowLoader));
        e.set_seed(7);
        e
    }

    fn red(size: f32) -> BrushSpec {
        BrushSpec::solid(size, Color::rgba(255, 0, 0, 255))
    }

    fn wait_for_patterns(e: &mut Engine) -> usize {
        let start = Instant::now();
        let mut applied = 0;
        while e.pending_paints() > 0 && start.elapsed() < Duration::from_secs(5) {
            applied += e.poll_patterns();
            std::thread::sleep(Duration::from_millis(2));
        }
        applied
    }

    #[test]
    fn engines_are_independent() {
        let mut a = engine();
        let b = engine();
        assert_ne!(a.id(), b.id());
        a.paint(60.0, 60.0, &red(20.0), LayerKind::Top);
        assert!(a.layers().get(LayerKind::Top).unwrap().pixels.has_coverage());
        assert!(!b.layers().get(LayerKind::Top).unwrap().pixels.has_coverage());
    }

    #[test]
    fn default_background_is_tiled_and_opaque() {
        let e = engine();
        let bg = e.layers().flatten(LayerKind::Background);
        assert!(bg.pixels().all(|p| p[3] == 255));
        assert_eq!(bg.get_pixel(3, 5), bg.get_pixel(67, 69));
    }

    #[test]
    fn undecodable_background_falls_back_to_default() {
        let e = Engine::with_loader(40, 40, Some(b"junk"), EngineSettings::default(), Arc::new(SlowLoader));
        assert_eq!(e.layers().flatten(LayerKind::Background).get_pixel(0, 0)[3], 255);
    }

    #[test]
    fn invalid_brush_is_a_no_op() {
        let mut e = engine();
        let before = e.layers().generations();
        e.paint(60.0, 60.0, &red(0.0), LayerKind::Background);
        e.paint(60.0, 60.0, &red(f32::NAN), LayerKind::Background);
        assert_eq!(e.layers().generations(), before);
    }

    #[test]
    fn oversized_brush_is_a_no_op() {
        let mut e = engine();
        e.frame_tick();
        let before = e.layers().generations();
        e.paint(10.0, 10.0, &BrushSpec::solid(3.0e9, Color::BLACK), LayerKind::Background);
        e.paint(10.0, 10.0, &red(MAX_BRUSH_SIZE + 1.0), LayerKind::Top);
        e.paint(3.0e9, 10.0, &red(20.0), LayerKind::Top);
        assert_eq!(e.layers().generations(), before);
        assert!(!e.has_pending_recompute());
    }

    #[test]
    fn foreground_erase_reaches_ink_outside_the_mask() {
        let mut e = engine();
        e.paint(60.0, 60.0, &red(40.0).with_action(BrushAction::MaskAdd), LayerKind::Mask);
        e.paint(60.0, 60.0, &red(30.0), LayerKind::Foreground);
        e.paint(60.0, 60.0, &red(40.0).with_action(BrushAction::MaskSubtract), LayerKind::Mask);
        assert!(!e.layers().get(LayerKind::Mask).unwrap().pixels.has_coverage());
        assert!(e.layers().get(LayerKind::Foreground).unwrap().pixels.has_coverage());

        e.paint(60.0, 60.0, &red(40.0).with_action(BrushAction::Erase), LayerKind::Foreground);
        assert!(!e.layers().get(LayerKind::Foreground).unwrap().pixels.has_coverage());
    }

    #[test]
    fn paint_aimed_at_mask_adds_coverage() {
        let mut e = engine();
        e.paint(60.0, 60.0, &red(30.0), LayerKind::Mask);
        assert!(e.layers().get(LayerKind::Mask).unwrap().pixels.has_coverage());
        e.paint(60.0, 60.0, &red(10.0), LayerKind::Foreground);
        assert!(e.layers().get(LayerKind::Foreground).unwrap().pixels.has_coverage());
    }

    #[test]
    fn mask_actions_ignore_target() {
        let mut e = engine();
        let spec = red(30.0).with_action(BrushAction::MaskAdd);
        e.paint(60.0, 60.0, &spec, LayerKind::Background);
        assert!(e.layers().get(LayerKind::Mask).unwrap().pixels.has_coverage());
        e.paint(60.0, 60.0, &spec.clone().with_action(BrushAction::MaskSubtract), LayerKind::Top);
        assert!(!e.layers().get(LayerKind::Mask).unwrap().pixels.has_coverage());
    }

    #[test]
    fn reclaim_subtract_repaints_background() {
        let settings = EngineSettings { mask_subtract: MaskSubtractMode::Reclaim, ..EngineSettings::default() };
        let mut e = Engine::with_loader(120, 120, None, settings, Arc::new(SlowLoader));
        let spec = red(20.0).with_action(BrushAction::MaskSubtract);
        e.paint(60.0, 60.0, &spec, LayerKind::Foreground);
        let bg = e.layers().flatten(LayerKind::Background);
        // The reclaim patch fills the brush's whole reach, past the footprint.
        assert_eq!(*bg.get_pixel(75, 60), Rgba([255, 0, 0, 255]));
        assert!(e.layers().get(LayerKind::Mask).unwrap().pixels.has_coverage());
    }

    #[test]
    fn erase_clears_top_only() {
        let mut e = engine();
        e.paint(60.0, 60.0, &red(40.0), LayerKind::Top);
        let bg_before = e.layers().flatten(LayerKind::Background);
        e.erase(60.0, 60.0, 40.0, 0.0, BrushShape::Circle, 0.0, false);
        assert!(!e.layers().get(LayerKind::Top).unwrap().pixels.has_coverage());
        assert_eq!(e.layers().flatten(LayerKind::Background), bg_before);
    }

    #[test]
    fn first_paint_on_loading_pattern_is_deferred() {
        let mut e = engine();
        let mut spec = red(20.0);
        spec.pattern = "grass.png".into();
        e.paint(40.0, 40.0, &spec, LayerKind::Background);
        e.paint(80.0, 80.0, &spec, LayerKind::Background);
        assert_eq!(e.pending_paints(), 1);
        assert_eq!(wait_for_patterns(&mut e), 1);
        let bg = e.layers().flatten(LayerKind::Background);
        assert_eq!(*bg.get_pixel(40, 40), Rgba([0, 160, 0, 255]));
        assert_ne!(*bg.get_pixel(80, 80), Rgba([0, 160, 0, 255]));
    }

    #[test]
    fn failed_pattern_drops_parked_paint() {
        let mut e = engine();
        let mut spec = red(20.0);
        spec.pattern = "missing.png".into();
        let before = e.layers().generations();
        e.paint(40.0, 40.0, &spec, LayerKind::Background);
        assert_eq!(wait_for_patterns(&mut e), 0);
        e.paint(40.0, 40.0, &spec, LayerKind::Background);
        assert_eq!(e.layers().generations(), before);
        assert_eq!(e.pending_paints(), 0);
    }

    #[test]
    fn paints_schedule_one_coalesced_recompute() {
        let mut e = engine();
        assert!(e.frame_tick());
        for i in 0..5 {
            e.paint(20.0 + i as f32 * 10.0, 20.0, &red(10.0), LayerKind::Background);
        }
        assert!(e.has_pending_recompute());
        let count = e.recompute_count();
        assert!(e.frame_tick());
        assert!(!e.frame_tick());
        assert_eq!(e.recompute_count(), count + 1);
        assert!(!e.frame_is_stale());
    }

    #[test]
    fn master_switch_hides_effects() {
        let mut e = engine();
        e.paint(60.0, 60.0, &red(30.0), LayerKind::Mask);
        let with = e.compose_now(Quality::Full);
        e.set_effects_enabled(false);
        let without = e.compose_now(Quality::Full);
        assert_ne!(with.image, without.image);
        assert_eq!(without.effects, None);
    }
}
