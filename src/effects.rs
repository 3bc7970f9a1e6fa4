// ============================================================================
// MASK EFFECTS - ripples, shadows, outline and stroke derived from the mask
// ============================================================================
//
// Every effect is one or more "passes".  A pass takes the binary silhouette of
// the mask layer, blurs it (separable Gaussian, sigma = blur / 2), optionally
// dilates it, keeps only the part outside the silhouette (inside for the inner
// shadow) and composites it tinted into an effect raster.  The compositor then
// draws that raster between the background and the foreground.
// ============================================================================

use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::{TiledImage, blend_source_over};
use crate::color::Color;

/// Peak opacity of the outermost ripple ring.
const RIPPLE_ALPHA: f32 = 0.35;
/// Radius of the fixed hard stroke pass.
const HARD_STROKE_PX: u32 = 2;
/// Upper bound on any pass's blur, in pixels.
pub const MAX_EFFECT_BLUR: f32 = 256.0;
/// Upper bound on planned ripple rings.
pub const MAX_RIPPLES: u32 = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Full,
    /// Used while the user is dragging: no ripples, one pass per effect.
    Fast,
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeEffect {
    pub enabled: bool,
    pub color: Color,
    pub width: f32,
}

impl Default for EdgeEffect {
    fn default() -> Self {
        Self { enabled: false, color: Color::BLACK, width: 1.0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowEffect {
    pub enabled: bool,
    pub color: Color,
    pub blur: f32,
}

impl Default for ShadowEffect {
    fn default() -> Self {
        Self { enabled: true, color: Color::BLACK, blur: 10.0 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Shadows {
    pub outer: ShadowEffect,
    pub inner: ShadowEffect,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RippleEffect {
    pub enabled: bool,
    pub color: Color,
    pub width: f32,
    pub count: u32,
    pub gap: f32,
}

impl Default for RippleEffect {
    fn default() -> Self {
        Self { enabled: true, color: Color::BLACK, width: 1.2, count: 9, gap: 1.7 }
    }
}

/// Caller-owned effect parameters.  The compositor only reads them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectSettings {
    pub stroke: EdgeEffect,
    pub outline: EdgeEffect,
    pub shadows: Shadows,
    pub ripples: RippleEffect,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            stroke: EdgeEffect { enabled: true, color: Color::BLACK, width: 0.5 },
            outline: EdgeEffect::default(),
            shadows: Shadows::default(),
            ripples: RippleEffect::default(),
        }
    }
}

impl EffectSettings {
    /// Everything switched off.
    pub fn none() -> Self {
        let mut s = Self::default();
        s.stroke.enabled = false;
        s.outline.enabled = false;
        s.shadows.outer.enabled = false;
        s.shadows.inner.enabled = false;
        s.ripples.enabled = false;
        s
    }

    pub fn any_enabled(&self) -> bool {
        self.stroke.enabled
            || self.outline.enabled
            || self.shadows.outer.enabled
            || self.shadows.inner.enabled
            || (self.ripples.enabled && self.ripples.count > 0)
    }
}

// ============================================================================
// PASS PLANNING
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Ripple,
    OuterShadow,
    Outline,
    Stroke,
    InnerShadow,
}

/// One tinted blur pass, in back-to-front order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EffectPass {
    pub kind: PassKind,
    pub color: Color,
    pub blur: f32,
    /// Hard dilation radius applied before blurring (0 = none).
    pub dilate: u32,
    pub opacity: f32,
    /// Draw inside the silhouette instead of outside it.
    pub inside: bool,
}

impl EffectPass {
    fn new(kind: PassKind, color: Color, blur: f32, opacity: f32) -> Self {
        let blur = if blur.is_nan() { 0.0 } else { blur.clamp(0.0, MAX_EFFECT_BLUR) };
        Self { kind, color, blur, dilate: 0, opacity, inside: false }
    }

    fn sigma(&self) -> f32 {
        self.blur / 2.0
    }

    /// How far past the silhouette this pass can paint.
    fn extent(&self) -> u32 {
        ((self.sigma() * 3.0).ceil() as u32).saturating_add(self.dilate)
    }
}

/// Expand settings into the ordered list of passes for `quality`.
pub fn plan_passes(settings: &EffectSettings, quality: Quality, fast_opacity: f32) -> Vec<EffectPass> {
    let mut passes = Vec::new();
    let fast = quality == Quality::Fast;

    let rip = &settings.ripples;
    let count = rip.count.min(MAX_RIPPLES);
    if !fast && rip.enabled && count > 0 {
        for i in (1..=count).rev() {
            let blur = i as f32 * rip.gap + rip.width;
            let alpha = RIPPLE_ALPHA * i as f32 / count as f32;
            passes.push(EffectPass::new(PassKind::Ripple, rip.color, blur, alpha));
        }
    }

    let outer = &settings.shadows.outer;
    if outer.enabled {
        let opacity = if fast { fast_opacity } else { 1.0 };
        passes.push(EffectPass::new(PassKind::OuterShadow, outer.color, outer.blur, opacity));
    }

    let outline = &settings.outline;
    if outline.enabled {
        if fast {
            passes.push(EffectPass::new(PassKind::Outline, outline.color, outline.width, fast_opacity));
        } else {
            passes.push(EffectPass::new(PassKind::Outline, outline.color, outline.width, 1.0));
            passes.push(EffectPass::new(PassKind::Outline, outline.color, outline.width / 2.0, 1.0));
        }
    }

    let stroke = &settings.stroke;
    if stroke.enabled {
        if fast {
            passes.push(EffectPass::new(PassKind::Stroke, stroke.color, stroke.width, fast_opacity));
        } else {
            passes.push(EffectPass::new(PassKind::Stroke, stroke.color, stroke.width, 1.0));
            let mut hard = EffectPass::new(PassKind::Stroke, stroke.color, 0.0, 1.0);
            hard.dilate = HARD_STROKE_PX;
            passes.push(hard);
        }
    }

    let inner = &settings.shadows.inner;
    if inner.enabled {
        let opacity = if fast { fast_opacity } else { 1.0 };
        let mut pass = EffectPass::new(PassKind::InnerShadow, inner.color, inner.blur, opacity);
        pass.inside = true;
        passes.push(pass);
    }

    passes
}

// ============================================================================
// RENDERING
// ============================================================================

/// Effect pixels for the region around the mask silhouette.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectRaster {
    pub origin: (u32, u32),
    pub pixels: RgbaImage,
}

impl EffectRaster {
    /// Source-over this raster onto a full-canvas frame.
    pub fn draw_onto(&self, frame: &mut RgbaImage) {
        let (fw, fh) = frame.dimensions();
        let (ox, oy) = self.origin;
        let (w, h) = self.pixels.dimensions();
        if ox >= fw || oy >= fh {
            return;
        }
        let cols = w.min(fw - ox) as usize;
        let stride = fw as usize * 4;
        let src = &self.pixels;
        let raw: &mut [u8] = frame.as_mut();

        raw.par_chunks_mut(stride)
            .enumerate()
            .skip(oy as usize)
            .take(h as usize)
            .for_each(|(y, row)| {
                let sy = y as u32 - oy;
                for sx in 0..cols {
                    let top = *src.get_pixel(sx as u32, sy);
                    if top[3] == 0 {
                        continue;
                    }
                    let off = (ox as usize + sx) * 4;
                    let base = Rgba([row[off], row[off + 1], row[off + 2], row[off + 3]]);
                    row[off..off + 4].copy_from_slice(&blend_source_over(base, top, 1.0).0);
                }
            });
    }
}

/// Render every pass for the mask's silhouette.  Returns `None` when the mask
/// has no coverage or no pass is planned.
pub fn render_effects(mask: &TiledImage, passes: &[EffectPass]) -> Option<EffectRaster> {
    if passes.is_empty() {
        return None;
    }
    let (x0, y0, x1, y1) = mask.coverage_bounds()?;

    let margin = passes.iter().map(EffectPass::extent).max().unwrap_or(0).saturating_add(1);
    let rx0 = x0.saturating_sub(margin);
    let ry0 = y0.saturating_sub(margin);
    let rx1 = x1.saturating_add(margin).min(mask.width() - 1);
    let ry1 = y1.saturating_add(margin).min(mask.height() - 1);
    let (w, h) = ((rx1 - rx0 + 1) as usize, (ry1 - ry0 + 1) as usize);

    let silhouette: Vec<f32> = (0..w * h)
        .into_par_iter()
        .map(|i| {
            let x = rx0 + (i % w) as u32;
            let y = ry0 + (i / w) as u32;
            if mask.get_pixel(x, y)[3] > 0 { 1.0 } else { 0.0 }
        })
        .collect();
    let complement: Vec<f32> = silhouette.iter().map(|v| 1.0 - v).collect();

    let mut out = vec![0u8; w * h * 4];
    for pass in passes {
        let source = if pass.inside { &complement } else { &silhouette };
        let shape = if pass.dilate > 0 {
            dilate_alpha(source, w, h, pass.dilate)
        } else {
            source.clone()
        };
        let field = blur_alpha(&shape, w, h, pass.sigma());
        let tint = pass.color.to_rgba();
        let strength = pass.opacity * pass.color.alpha_f32();
        let sil = &silhouette;

        out.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
            for x in 0..w {
                let idx = y * w + x;
                let stencil = if pass.inside { sil[idx] } else { 1.0 - sil[idx] };
                let a = field[idx] * stencil * strength;
                if a <= 0.0 {
                    continue;
                }
                let off = x * 4;
                let base = Rgba([row[off], row[off + 1], row[off + 2], row[off + 3]]);
                let src = Rgba([tint[0], tint[1], tint[2], 255]);
                row[off..off + 4].copy_from_slice(&blend_source_over(base, src, a).0);
            }
        });
    }

    let pixels = RgbaImage::from_raw(w as u32, h as u32, out)?;
    Some(EffectRaster { origin: (rx0, ry0), pixels })
}

/// 1-D Gaussian kernel truncated at ceil(3·sigma).
fn build_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil() as usize;
    if radius == 0 || sigma <= 0.0 {
        return vec![1.0];
    }
    let len = radius * 2 + 1;
    let s2 = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..len)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / s2).exp()
        })
        .collect();
    let inv = 1.0 / kernel.iter().sum::<f32>();
    for v in &mut kernel {
        *v *= inv;
    }
    kernel
}

/// Separable Gaussian blur of a single alpha channel, parallel by row.
/// Samples past the edge clamp to the border.
pub fn blur_alpha(src: &[f32], w: usize, h: usize, sigma: f32) -> Vec<f32> {
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let kernel = build_gaussian_kernel(sigma);
    if kernel.len() == 1 {
        return src.to_vec();
    }
    let radius = (kernel.len() / 2) as isize;

    let mut horiz = vec![0.0f32; w * h];
    horiz.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let line = &src[y * w..(y + 1) * w];
        for (x, out) in row.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize + ki as isize - radius).clamp(0, w as isize - 1) as usize;
                acc += line[sx] * kv;
            }
            *out = acc;
        }
    });

    let mut vert = vec![0.0f32; w * h];
    vert.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (x, out) in row.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - radius).clamp(0, h as isize - 1) as usize;
                acc += horiz[sy * w + x] * kv;
            }
            *out = acc;
        }
    });
    vert
}

/// Max-filter over a disc of radius `r`.
pub fn dilate_alpha(src: &[f32], w: usize, h: usize, r: u32) -> Vec<f32> {
    let r = r as i32;
    (0..w * h)
        .into_par_iter()
        .map(|idx| {
            let x = (idx % w) as i32;
            let y = (idx / w) as i32;
            let mut max_a = 0.0f32;
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy > r * r {
                        continue;
                    }
                    let sx = x + dx;
                    let sy = y + dy;
                    if sx < 0 || sy < 0 || sx >= w as i32 || sy >= h as i32 {
                        continue;
                    }
                    max_a = max_a.max(src[sy as usize * w + sx as usize]);
                }
            }
            max_a
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, x0: u32, y0: u32, side: u32) -> TiledImage {
        let mut mask = TiledImage::new(size, size);
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                mask.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        mask
    }

    #[test]
    fn defaults_follow_document_defaults() {
        let s = EffectSettings::default();
        assert!(s.stroke.enabled);
        assert_eq!(s.stroke.width, 0.5);
        assert!(!s.outline.enabled);
        assert_eq!(s.shadows.outer.blur, 10.0);
        assert!(s.shadows.inner.enabled);
        assert_eq!((s.ripples.count, s.ripples.width, s.ripples.gap), (9, 1.2, 1.7));
        assert!(!EffectSettings::none().any_enabled());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let s: EffectSettings =
            serde_json::from_str(r##"{"ripples":{"enabled":true,"count":3,"width":1,"gap":1.5}}"##).unwrap();
        assert_eq!(s.ripples.count, 3);
        assert!(s.stroke.enabled);
        assert_eq!(s.shadows.outer.color, Color::BLACK);
    }

    #[test]
    fn full_plan_is_back_to_front() {
        let mut s = EffectSettings::default();
        s.outline.enabled = true;
        s.ripples.count = 3;
        let passes = plan_passes(&s, Quality::Full, 0.6);
        let kinds: Vec<PassKind> = passes.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PassKind::Ripple,
                PassKind::Ripple,
                PassKind::Ripple,
                PassKind::OuterShadow,
                PassKind::Outline,
                PassKind::Outline,
                PassKind::Stroke,
                PassKind::Stroke,
                PassKind::InnerShadow,
            ]
        );
        // Ripple i = 3, 2, 1: blur i·gap + width, fading as i shrinks.
        assert!((passes[0].blur - (3.0 * 1.7 + 1.2)).abs() < 1e-5);
        assert!(passes[0].opacity > passes[1].opacity && passes[1].opacity > passes[2].opacity);
        assert_eq!(passes[5].blur, 0.5);
        assert_eq!(passes[7].dilate, 2);
    }

    #[test]
    fn fast_plan_drops_ripples_and_collapses_passes() {
        let mut s = EffectSettings::default();
        s.outline.enabled = true;
        let passes = plan_passes(&s, Quality::Fast, 0.6);
        assert!(passes.iter().all(|p| p.kind != PassKind::Ripple));
        assert_eq!(passes.len(), 4);
        assert!(passes.iter().all(|p| (p.opacity - 0.6).abs() < 1e-6));
    }

    #[test]
    fn kernel_is_normalized_and_truncated() {
        let k = build_gaussian_kernel(2.0);
        assert_eq!(k.len(), 13);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert_eq!(build_gaussian_kernel(0.0), vec![1.0]);
    }

    #[test]
    fn blur_spreads_but_preserves_mass() {
        let mut src = vec![0.0f32; 21 * 21];
        src[10 * 21 + 10] = 1.0;
        let out = blur_alpha(&src, 21, 21, 1.5);
        assert!(out[10 * 21 + 10] < 1.0);
        assert!(out[10 * 21 + 12] > 0.0);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn dilation_grows_by_radius() {
        let mut src = vec![0.0f32; 9 * 9];
        src[4 * 9 + 4] = 1.0;
        let out = dilate_alpha(&src, 9, 9, 2);
        assert_eq!(out[4 * 9 + 6], 1.0);
        assert_eq!(out[6 * 9 + 6], 0.0);
    }

    #[test]
    fn empty_mask_renders_nothing() {
        let mask = TiledImage::new(50, 50);
        let passes = plan_passes(&EffectSettings::default(), Quality::Full, 0.6);
        assert!(render_effects(&mask, &passes).is_none());
    }

    #[test]
    fn outer_passes_stay_outside_silhouette() {
        let mask = square_mask(80, 30, 30, 20);
        let mut s = EffectSettings::none();
        s.shadows.outer.enabled = true;
        let raster = render_effects(&mask, &plan_passes(&s, Quality::Full, 0.6)).unwrap();
        let local = |x: u32, y: u32| raster.pixels.get_pixel(x - raster.origin.0, y - raster.origin.1)[3];
        assert_eq!(local(40, 40), 0);
        assert!(local(29, 40) > 0);
        assert!(local(29, 40) > local(25, 40));
    }

    #[test]
    fn inner_shadow_stays_inside_silhouette() {
        let mask = square_mask(80, 30, 30, 20);
        let mut s = EffectSettings::none();
        s.shadows.inner.enabled = true;
        let raster = render_effects(&mask, &plan_passes(&s, Quality::Full, 0.6)).unwrap();
        let local = |x: u32, y: u32| raster.pixels.get_pixel(x - raster.origin.0, y - raster.origin.1)[3];
        assert_eq!(local(29, 40), 0);
        assert!(local(30, 40) > local(40, 40));
    }

    #[test]
    fn hard_stroke_is_opaque_two_pixels_out() {
        let mask = square_mask(60, 20, 20, 10);
        let mut s = EffectSettings::none();
        s.stroke.enabled = true;
        let raster = render_effects(&mask, &plan_passes(&s, Quality::Full, 0.6)).unwrap();
        let local = |x: u32, y: u32| raster.pixels.get_pixel(x - raster.origin.0, y - raster.origin.1)[3];
        assert_eq!(local(18, 25), 255);
        assert_eq!(local(19, 25), 255);
        assert!(local(16, 25) < 255);
    }

    #[test]
    fn raster_draws_at_its_origin() {
        let raster = EffectRaster {
            origin: (3, 4),
            pixels: RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255])),
        };
        let mut frame = RgbaImage::from_pixel(6, 6, Rgba([0, 0, 255, 255]));
        raster.draw_onto(&mut frame);
        assert_eq!(*frame.get_pixel(3, 4), Rgba([255, 0, 0, 255]));
        assert_eq!(*frame.get_pixel(4, 5), Rgba([255, 0, 0, 255]));
        assert_eq!(*frame.get_pixel(2, 4), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn extreme_settings_are_bounded() {
        let mut s = EffectSettings::none();
        s.shadows.outer = ShadowEffect { enabled: true, blur: 1e10, ..ShadowEffect::default() };
        s.stroke = EdgeEffect { enabled: true, width: f32::NAN, ..EdgeEffect::default() };
        s.ripples = RippleEffect { enabled: true, count: u32::MAX, gap: f32::INFINITY, ..RippleEffect::default() };
        let passes = plan_passes(&s, Quality::Full, 0.6);
        assert_eq!(passes.iter().filter(|p| p.kind == PassKind::Ripple).count(), MAX_RIPPLES as usize);
        assert!(passes.iter().all(|p| (0.0..=MAX_EFFECT_BLUR).contains(&p.blur)));

        let mask = square_mask(64, 24, 24, 16);
        let raster = render_effects(&mask, &passes[passes.len() - 3..]).unwrap();
        assert_eq!(raster.origin, (0, 0));
        assert_eq!(raster.pixels.dimensions(), (64, 64));
    }
}
