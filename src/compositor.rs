// ============================================================================
// COMPOSITOR - builds the displayable frame from layers + mask effects
// ============================================================================
//
// Frame order (back to front): background, mask effects, foreground, top.
// Recomputes are coalesced: every request replaces the pending one, and the
// host runs at most one per display refresh through `frame_tick`.
// ============================================================================

use image::RgbaImage;

use crate::canvas::{LayerKind, LayerStore, composite_over};
use crate::effects::{EffectSettings, Quality, plan_passes, render_effects};

/// Derived, regenerable output.  Remembers what it was built from so the host
/// can tell whether it is current.
#[derive(Clone, Debug)]
pub struct ComposedFrame {
    pub image: RgbaImage,
    pub quality: Quality,
    pub generations: [u64; 4],
    pub effects: Option<EffectSettings>,
}

impl ComposedFrame {
    pub fn is_stale(&self, store: &LayerStore, effects: Option<&EffectSettings>) -> bool {
        self.generations != store.generations() || self.effects.as_ref() != effects
    }
}

/// Compose one frame.  `effects` is `None` when mask effects are switched off.
pub fn compose(
    store: &LayerStore,
    effects: Option<&EffectSettings>,
    quality: Quality,
    fast_opacity: f32,
) -> ComposedFrame {
    let mut image = store.flatten(LayerKind::Background);

    if let Some(settings) = effects
        && settings.any_enabled()
        && let Some(mask) = store.get(LayerKind::Mask)
    {
        let passes = plan_passes(settings, quality, fast_opacity);
        if let Some(raster) = render_effects(&mask.pixels, &passes) {
            raster.draw_onto(&mut image);
        }
    }

    composite_over(&mut image, &store.flatten(LayerKind::Foreground));
    composite_over(&mut image, &store.flatten(LayerKind::Top));

    ComposedFrame {
        image,
        quality,
        generations: store.generations(),
        effects: effects.copied(),
    }
}

pub struct Compositor {
    interactive: bool,
    fast_opacity: f32,
    /// Ticket of the recompute waiting for the next tick.
    pending: Option<u64>,
    next_ticket: u64,
    frame: Option<ComposedFrame>,
    recomputes: u64,
}

impl Compositor {
    pub fn new(fast_opacity: f32) -> Self {
        Self {
            interactive: false,
            fast_opacity: fast_opacity.clamp(0.0, 1.0),
            pending: None,
            next_ticket: 1,
            frame: None,
            recomputes: 0,
        }
    }

    pub fn quality(&self) -> Quality {
        if self.interactive { Quality::Fast } else { Quality::Full }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Schedule a recompute for the next tick, replacing any pending one.
    /// Returns the new ticket.
    pub fn request_recompute(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending = Some(ticket);
        ticket
    }

    pub fn pending_ticket(&self) -> Option<u64> {
        self.pending
    }

    /// Run the pending recompute, if any.  Returns true when a frame was built.
    pub fn frame_tick(&mut self, store: &LayerStore, effects: Option<&EffectSettings>) -> bool {
        if self.pending.take().is_none() {
            return false;
        }
        self.recompute(store, effects, self.quality());
        true
    }

    /// Switch between Fast (dragging) and Full quality.  Leaving interactive
    /// mode drops any pending request and recomputes at Full immediately.
    pub fn set_interactive(&mut self, interactive: bool, store: &LayerStore, effects: Option<&EffectSettings>) {
        self.interactive = interactive;
        if !interactive {
            self.pending = None;
            self.recompute(store, effects, Quality::Full);
        }
    }

    fn recompute(&mut self, store: &LayerStore, effects: Option<&EffectSettings>, quality: Quality) {
        self.frame = Some(compose(store, effects, quality, self.fast_opacity));
        self.recomputes += 1;
    }

    pub fn frame(&self) -> Option<&ComposedFrame> {
        self.frame.as_ref()
    }

    /// Number of frames built so far.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::Stamp;
    use crate::canvas::CompositeOp;
    use image::Rgba;

    fn store_with_mask() -> LayerStore {
        let mut store = LayerStore::new(64, 64);
        store.fill(LayerKind::Background, Rgba([255, 255, 255, 255]));
        let stamp = Stamp { origin: (24, 24), pixels: RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 255])) };
        store.apply_stamp(LayerKind::Mask, &stamp, CompositeOp::SourceOver);
        store
    }

    #[test]
    fn requests_coalesce_into_one_recompute() {
        let store = store_with_mask();
        let mut comp = Compositor::new(0.6);
        let first = comp.request_recompute();
        let second = comp.request_recompute();
        assert_ne!(first, second);
        assert_eq!(comp.pending_ticket(), Some(second));
        assert!(comp.frame_tick(&store, None));
        assert!(!comp.frame_tick(&store, None));
        assert_eq!(comp.recompute_count(), 1);
    }

    #[test]
    fn leaving_interactive_forces_full_recompute() {
        let store = store_with_mask();
        let mut comp = Compositor::new(0.6);
        let fx = EffectSettings::default();
        comp.set_interactive(true, &store, Some(&fx));
        comp.request_recompute();
        comp.frame_tick(&store, Some(&fx));
        assert_eq!(comp.frame().unwrap().quality, Quality::Fast);
        comp.request_recompute();
        comp.set_interactive(false, &store, Some(&fx));
        assert_eq!(comp.pending_ticket(), None);
        assert_eq!(comp.frame().unwrap().quality, Quality::Full);
        assert_eq!(comp.recompute_count(), 2);
    }

    #[test]
    fn top_is_drawn_over_everything() {
        let mut store = store_with_mask();
        let ink = Stamp { origin: (30, 30), pixels: RgbaImage::from_pixel(2, 2, Rgba([0, 255, 0, 255])) };
        store.apply_stamp(LayerKind::Foreground, &ink, CompositeOp::SourceOver);
        let top = Stamp { origin: (30, 30), pixels: RgbaImage::from_pixel(1, 1, Rgba([0, 0, 255, 255])) };
        store.apply_stamp(LayerKind::Top, &top, CompositeOp::SourceOver);
        let frame = compose(&store, Some(&EffectSettings::default()), Quality::Full, 0.6);
        assert_eq!(*frame.image.get_pixel(30, 30), Rgba([0, 0, 255, 255]));
        assert_eq!(*frame.image.get_pixel(31, 31), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn effects_only_change_pixels_near_the_mask() {
        let store = store_with_mask();
        let plain = compose(&store, None, Quality::Full, 0.6);
        let fx = compose(&store, Some(&EffectSettings::default()), Quality::Full, 0.6);
        assert_eq!(*plain.image.get_pixel(22, 30), Rgba([255, 255, 255, 255]));
        assert_ne!(*fx.image.get_pixel(22, 30), Rgba([255, 255, 255, 255]));
        assert_eq!(plain.image.get_pixel(0, 0), fx.image.get_pixel(0, 0));
    }

    #[test]
    fn full_and_fast_differ_when_ripples_are_on() {
        let store = store_with_mask();
        let fx = EffectSettings::default();
        let full = compose(&store, Some(&fx), Quality::Full, 0.6);
        let fast = compose(&store, Some(&fx), Quality::Fast, 0.6);
        assert_ne!(full.image, fast.image);
    }

    #[test]
    fn frame_reports_staleness() {
        let mut store = store_with_mask();
        let frame = compose(&store, None, Quality::Full, 0.6);
        assert!(!frame.is_stale(&store, None));
        assert!(frame.is_stale(&store, Some(&EffectSettings::default())));
        store.clear(LayerKind::Top);
        assert!(frame.is_stale(&store, None));
    }
}
