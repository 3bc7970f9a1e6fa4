// ============================================================================
// MASK GATE - mask coverage edits and foreground gating
// ============================================================================

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::brush::Stamp;
use crate::canvas::{CompositeOp, LayerKind, LayerStore};

/// How a `mask-subtract` stroke edits coverage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskSubtractMode {
    /// Destination-out on the mask layer: coverage is really removed.
    #[default]
    Exact,
    /// Paint a double-diameter patch of the brush pattern onto the
    /// background and keep adding to the mask.  Coverage never shrinks.
    Reclaim,
}

impl MaskSubtractMode {
    pub fn name(&self) -> &'static str {
        match self {
            MaskSubtractMode::Exact => "exact",
            MaskSubtractMode::Reclaim => "reclaim",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "exact" => Some(MaskSubtractMode::Exact),
            "reclaim" => Some(MaskSubtractMode::Reclaim),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MaskGate {
    pub subtract_mode: MaskSubtractMode,
}

impl MaskGate {
    pub fn new(subtract_mode: MaskSubtractMode) -> Self {
        Self { subtract_mode }
    }

    /// Accumulate coverage from a mask-add stroke.
    pub fn add(&self, store: &mut LayerStore, stamp: &Stamp) -> usize {
        store.apply_stamp(LayerKind::Mask, stamp, CompositeOp::SourceOver)
    }

    /// Apply a mask-subtract stroke.  `footprint` is the brush footprint at
    /// the stroke position; `reclaim` is the double-size pattern stamp used
    /// only in [`MaskSubtractMode::Reclaim`].
    pub fn subtract(&self, store: &mut LayerStore, footprint: &Stamp, reclaim: Option<&Stamp>) -> usize {
        match self.subtract_mode {
            MaskSubtractMode::Exact => {
                store.apply_stamp(LayerKind::Mask, footprint, CompositeOp::DestinationOut)
            }
            MaskSubtractMode::Reclaim => {
                let mut touched = 0;
                if let Some(patch) = reclaim {
                    touched += store.apply_stamp(LayerKind::Background, patch, CompositeOp::SourceOver);
                }
                touched + store.apply_stamp(LayerKind::Mask, footprint, CompositeOp::SourceOver)
            }
        }
    }

    /// Multiply the stamp's alpha by the mask alpha underneath it.  Returns
    /// `None` when the store has no mask layer.
    pub fn gate(&self, store: &LayerStore, stamp: &Stamp) -> Option<Stamp> {
        let mask = &store.get(LayerKind::Mask)?.pixels;
        let (ox, oy) = stamp.origin;
        let (w, h) = stamp.pixels.dimensions();
        let pixels = RgbaImage::from_fn(w, h, |sx, sy| {
            let src = stamp.pixels.get_pixel(sx, sy);
            if src[3] == 0 {
                return Rgba([0, 0, 0, 0]);
            }
            let m = mask.alpha_at(ox + sx as i32, oy + sy as i32) as u32;
            let a = (src[3] as u32 * m + 127) / 255;
            if a == 0 {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([src[0], src[1], src[2], a as u8])
            }
        });
        Some(Stamp { origin: stamp.origin, pixels })
    }

    /// Gate `stamp` against the mask and merge it into the foreground.
    /// A missing mask layer makes this a no-op.
    pub fn paint_foreground(&self, store: &mut LayerStore, stamp: &Stamp, op: CompositeOp) -> usize {
        match self.gate(store, stamp) {
            Some(gated) => store.apply_stamp(LayerKind::Foreground, &gated, op),
            None => 0,
        }
    }
}
