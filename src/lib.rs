//! TerraPaint: a layered raster painting and compositing engine for map
//! terrain.  Brush stamps go onto four fixed layers (background, foreground,
//! top, mask); the mask gates foreground ink and drives border effects in the
//! composed frame.
//!
//! ```no_run
//! use terrapaint::{BrushSpec, Color, Engine, LayerKind};
//!
//! let mut engine = Engine::new(512, 512, None);
//! let land = BrushSpec::solid(80.0, Color::BLACK);
//! engine.paint(256.0, 256.0, &land, LayerKind::Mask);
//! engine.paint(256.0, 256.0, &BrushSpec::solid(40.0, Color::rgba(40, 120, 40, 255)), LayerKind::Foreground);
//! engine.frame_tick();
//! let png = engine.export().unwrap();
//! ```

#![allow(clippy::too_many_arguments)]

pub mod logger;

pub mod brush;
pub mod canvas;
pub mod cli;
pub mod color;
pub mod compositor;
pub mod effects;
pub mod engine;
pub mod mask;
pub mod patterns;
pub mod settings;
pub mod snapshot;

pub use brush::{BrushAction, BrushShape, BrushSpec, Stamp};
pub use canvas::{CompositeOp, LayerKind, LayerStore, TiledImage};
pub use color::Color;
pub use compositor::ComposedFrame;
pub use effects::{EffectSettings, Quality};
pub use engine::Engine;
pub use mask::MaskSubtractMode;
pub use patterns::{PatternError, TileLoader};
pub use settings::EngineSettings;
pub use snapshot::{LayerData, SnapshotError};
