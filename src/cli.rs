// ============================================================================
// TerraPaint CLI - replay a painting session headlessly
// ============================================================================
//
// Usage examples:
//   TerraPaint --width 800 --height 600 --session strokes.json --output map.png
//   TerraPaint -W 512 -H 512 --background parchment.png --session s.json \
//              --effects effects.json --frame preview.png --seed 42
//   TerraPaint --open map.tpd --session more.json --document map.tpd
//
// A session file is a JSON array of operations:
//   [{"op": "paint", "x": 100, "y": 100, "layer": "mask", "brush": {"size": 60}},
//    {"op": "set_interactive", "interactive": true},
//    {"op": "erase", "x": 40, "y": 40, "size": 20},
//    {"op": "poll"},
//    {"op": "tick"}]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;

use crate::brush::{BrushShape, BrushSpec};
use crate::canvas::LayerKind;
use crate::effects::{EffectSettings, Quality};
use crate::engine::Engine;
use crate::settings::EngineSettings;
use crate::snapshot;
use crate::{log_err, log_info};

/// How long `poll` waits for pattern images before giving up.
const PATTERN_WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// TerraPaint headless session runner.
#[derive(Parser, Debug)]
#[command(
    name = "TerraPaint",
    about = "TerraPaint headless map painter",
    long_about = "Replay a JSON list of paint operations against a fresh (or saved)\n\
                  document and write the exported map, the composed frame with mask\n\
                  effects, or a document file.\n\n\
                  Example:\n  \
                  TerraPaint --width 800 --height 600 --session strokes.json --output map.png"
)]
pub struct CliArgs {
    /// Canvas width in pixels (ignored with --open).
    #[arg(short = 'W', long, default_value_t = 1024)]
    pub width: u32,

    /// Canvas height in pixels (ignored with --open).
    #[arg(short = 'H', long, default_value_t = 768)]
    pub height: u32,

    /// Image used to seed the background layer.
    #[arg(short, long, value_name = "IMAGE")]
    pub background: Option<PathBuf>,

    /// Start from a saved .tpd document instead of a blank canvas.
    #[arg(long, value_name = "DOC.tpd", conflicts_with = "background")]
    pub open: Option<PathBuf>,

    /// JSON session file with the operations to replay.
    #[arg(short, long, value_name = "SESSION.json")]
    pub session: Option<PathBuf>,

    /// JSON effect settings.  Defaults apply when omitted.
    #[arg(short, long, value_name = "EFFECTS.json")]
    pub effects: Option<PathBuf>,

    /// Disable mask effects entirely.
    #[arg(long)]
    pub no_effects: bool,

    /// Engine settings file (key=value).  Uses the per-user file when omitted.
    #[arg(long, value_name = "FILE.cfg")]
    pub settings: Option<PathBuf>,

    /// Seed for rough brush outlines, for reproducible output.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Write the exported background + foreground PNG here.
    #[arg(short, long, value_name = "FILE.png")]
    pub output: Option<PathBuf>,

    /// Write the full composed frame (effects, top layer) as PNG here.
    #[arg(short, long, value_name = "FILE.png")]
    pub frame: Option<PathBuf>,

    /// Save a .tpd document here.
    #[arg(short, long, value_name = "DOC.tpd")]
    pub document: Option<PathBuf>,

    /// Echo the session log to stderr and print timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Session file format
// ============================================================================

fn default_layer() -> LayerKind {
    LayerKind::Foreground
}

fn default_erase_size() -> f32 {
    20.0
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionOp {
    Paint {
        x: f32,
        y: f32,
        #[serde(default = "default_layer")]
        layer: LayerKind,
        #[serde(default)]
        brush: BrushSpec,
    },
    Erase {
        x: f32,
        y: f32,
        #[serde(default = "default_erase_size")]
        size: f32,
        #[serde(default)]
        softness: f32,
        #[serde(default)]
        shape: BrushShape,
        #[serde(default)]
        roughness: f32,
        #[serde(default)]
        smooth: bool,
    },
    SetInteractive {
        interactive: bool,
    },
    /// Run the pending composite recompute.
    Tick,
    /// Wait for pattern images to finish loading and apply parked paints.
    Poll,
}

pub fn parse_session(json: &str) -> Result<Vec<SessionOp>, String> {
    serde_json::from_str(json).map_err(|e| format!("invalid session: {}", e))
}

/// Replay `ops` against `engine`.  Returns the number of operations applied.
pub fn replay(engine: &mut Engine, ops: &[SessionOp]) -> usize {
    for op in ops {
        match op {
            SessionOp::Paint { x, y, layer, brush } => engine.paint(*x, *y, brush, *layer),
            SessionOp::Erase { x, y, size, softness, shape, roughness, smooth } => {
                engine.erase(*x, *y, *size, *softness, *shape, *roughness, *smooth)
            }
            SessionOp::SetInteractive { interactive } => engine.set_interactive(*interactive),
            SessionOp::Tick => {
                engine.frame_tick();
            }
            SessionOp::Poll => {
                wait_for_patterns(engine, PATTERN_WAIT);
            }
        }
    }
    ops.len()
}

fn wait_for_patterns(engine: &mut Engine, limit: Duration) {
    let start = Instant::now();
    while engine.pending_paints() > 0 && start.elapsed() < limit {
        engine.poll_patterns();
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the session and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    match run_session(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_err!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_session(args: &CliArgs) -> Result<(), String> {
    let start = Instant::now();
    let settings = match &args.settings {
        Some(path) => EngineSettings::load_from(path),
        None => EngineSettings::load(),
    };

    let mut engine = match &args.open {
        Some(doc) => Engine::open_document(doc, settings)
            .map_err(|e| format!("could not open '{}': {}", doc.display(), e))?,
        None => {
            let background = match &args.background {
                Some(path) => Some(read_file(path)?),
                None => None,
            };
            Engine::with_settings(args.width, args.height, background.as_deref(), settings)
        }
    };

    if let Some(seed) = args.seed {
        engine.set_seed(seed);
    }
    if args.no_effects {
        engine.set_effect_settings(None);
    } else if let Some(path) = &args.effects {
        let text = String::from_utf8(read_file(path)?)
            .map_err(|_| format!("'{}' is not UTF-8", path.display()))?;
        let fx: EffectSettings = serde_json::from_str(&text)
            .map_err(|e| format!("invalid effects '{}': {}", path.display(), e))?;
        engine.set_effect_settings(Some(fx));
    }

    let ops = match &args.session {
        Some(path) => {
            let text = String::from_utf8(read_file(path)?)
                .map_err(|_| format!("'{}' is not UTF-8", path.display()))?;
            parse_session(&text)?
        }
        None => Vec::new(),
    };
    let applied = replay(&mut engine, &ops);
    wait_for_patterns(&mut engine, PATTERN_WAIT);
    if engine.is_interactive() {
        engine.set_interactive(false);
    }
    engine.frame_tick();
    log_info!("Replayed {} operations on engine {}", applied, engine.id());

    if let Some(path) = &args.output {
        let png = engine.export().map_err(|e| format!("export failed: {}", e))?;
        write_file(path, &png)?;
    }
    if let Some(path) = &args.frame {
        let image = match engine.frame() {
            Some(f) if !engine.frame_is_stale() => f.image.clone(),
            _ => engine.compose_now(Quality::Full).image,
        };
        let png = snapshot::encode_png(&image).map_err(|e| format!("frame encode failed: {}", e))?;
        write_file(path, &png)?;
    }
    if let Some(path) = &args.document {
        engine
            .save_document(path)
            .map_err(|e| format!("could not save '{}': {}", path.display(), e))?;
    }

    if args.verbose {
        println!(
            "{} ops on {}x{} in {:.0}ms",
            applied,
            engine.layers().width(),
            engine.layers().height(),
            start.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("could not read '{}': {}", path.display(), e))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), String> {
    std::fs::write(path, bytes).map_err(|e| format!("could not write '{}': {}", path.display(), e))
}
