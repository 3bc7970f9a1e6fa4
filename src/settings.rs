// ============================================================================
// ENGINE SETTINGS - persisted as a plain key=value file
// ============================================================================

use std::path::{Path, PathBuf};

use crate::mask::MaskSubtractMode;

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// Edge length of procedural pattern tiles (rounded up to a multiple of 24).
    pub pattern_tile_size: u32,
    /// Dots scattered into a `noise` tile.
    pub noise_dots: u32,
    /// Opacity of the single collapsed pass per effect in Fast quality.
    pub fast_pass_opacity: f32,
    pub mask_subtract: MaskSubtractMode,
    /// Directory that image pattern ids are resolved against.
    pub texture_root: PathBuf,
    /// Master switch for all mask effects.
    pub effects_enabled: bool,
    /// Edge length of the generated default background tile.
    pub default_tile_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pattern_tile_size: 24,
            noise_dots: 150,
            fast_pass_opacity: 0.6,
            mask_subtract: MaskSubtractMode::Exact,
            texture_root: PathBuf::from("."),
            effects_enabled: true,
            default_tile_size: 64,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/terrapaint/terrapaint_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\TerraPaint\terrapaint_settings.cfg
    /// On macOS:   ~/Library/Application Support/TerraPaint/terrapaint_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("terrapaint");
            return Some(config_dir.join("terrapaint_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("TerraPaint").join("terrapaint_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("TerraPaint")
                    .join("terrapaint_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("terrapaint_settings.cfg")))
        }
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "pattern_tile_size={}\n\
             noise_dots={}\n\
             fast_pass_opacity={}\n\
             mask_subtract={}\n\
             texture_root={}\n\
             effects_enabled={}\n\
             default_tile_size={}\n",
            self.pattern_tile_size,
            self.noise_dots,
            self.fast_pass_opacity,
            self.mask_subtract.name(),
            self.texture_root.display(),
            self.effects_enabled,
            self.default_tile_size,
        )
    }

    /// Parse `key=value` lines.  Unknown keys and bad values keep defaults.
    pub fn from_config_str(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "pattern_tile_size" => {
                    s.pattern_tile_size = val.parse().ok().filter(|v| *v > 0).unwrap_or(24);
                }
                "noise_dots" => {
                    s.noise_dots = val.parse().unwrap_or(150);
                }
                "fast_pass_opacity" => {
                    s.fast_pass_opacity = val
                        .parse::<f32>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map_or(0.6, |v| v.clamp(0.0, 1.0));
                }
                "mask_subtract" => {
                    s.mask_subtract = MaskSubtractMode::from_name(val).unwrap_or_default();
                }
                "texture_root" => {
                    if !val.is_empty() {
                        s.texture_root = PathBuf::from(val);
                    }
                }
                "effects_enabled" => {
                    s.effects_enabled = val != "false";
                }
                "default_tile_size" => {
                    s.default_tile_size = val.parse().ok().filter(|v| *v > 0).unwrap_or(64);
                }
                _ => {}
            }
        }
        s
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_config_str(&content),
            Err(_) => Self::default(),
        }
    }

    /// Save settings to disk.  Failures are ignored.
    pub fn save(&self) {
        if let Some(path) = Self::settings_path() {
            let _ = self.save_to(&path);
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())
    }
}
