//! Hex color strings as used by brush specs and effect settings.

use image::Rgba;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Straight-alpha RGBA color.  Serialized as `#rrggbbaa` (or `#rrggbb` when
/// fully opaque).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const BLACK: Color = Color([0, 0, 0, 255]);
    pub const WHITE: Color = Color([255, 255, 255, 255]);
    pub const TRANSPARENT: Color = Color([0, 0, 0, 0]);

    pub fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Color([r, g, b, a])
    }

    /// Parse `#rgb`, `#rgba`, `#rrggbb` or `#rrggbbaa` (leading `#` optional).
    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.trim().trim_start_matches('#');
        let nibble = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        if !hex.is_ascii() {
            return None;
        }
        match hex.len() {
            3 => Some(Color([nibble(0)?, nibble(1)?, nibble(2)?, 255])),
            4 => Some(Color([nibble(0)?, nibble(1)?, nibble(2)?, nibble(3)?])),
            6 => Some(Color([byte(0)?, byte(2)?, byte(4)?, 255])),
            8 => Some(Color([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
            _ => None,
        }
    }

    pub fn to_hex(self) -> String {
        let [r, g, b, a] = self.0;
        if a == 255 {
            format!("#{:02x}{:02x}{:02x}", r, g, b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", r, g, b, a)
        }
    }

    /// Alpha as a 0..1 fraction.
    pub fn alpha_f32(self) -> f32 {
        self.0[3] as f32 / 255.0
    }

    pub fn to_rgba(self) -> Rgba<u8> {
        Rgba(self.0)
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::BLACK
    }
}

impl From<Color> for Rgba<u8> {
    fn from(c: Color) -> Self {
        Rgba(c.0)
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Color::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid color '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_hex_forms() {
        assert_eq!(Color::from_hex("#000"), Some(Color([0, 0, 0, 255])));
        assert_eq!(Color::from_hex("#f00"), Some(Color([255, 0, 0, 255])));
        assert_eq!(Color::from_hex("#ff000080"), Some(Color([255, 0, 0, 128])));
        assert_eq!(Color::from_hex("12ab34"), Some(Color([0x12, 0xab, 0x34, 255])));
        assert_eq!(Color::from_hex("#abcd"), Some(Color([0xaa, 0xbb, 0xcc, 0xdd])));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Color::from_hex(""), None);
        assert_eq!(Color::from_hex("#12345"), None);
        assert_eq!(Color::from_hex("#gg0000"), None);
        assert_eq!(Color::from_hex("#ééé"), None);
    }

    #[test]
    fn hex_output_drops_opaque_alpha() {
        assert_eq!(Color([255, 0, 0, 255]).to_hex(), "#ff0000");
        assert_eq!(Color([255, 0, 0, 16]).to_hex(), "#ff000010");
    }

    #[test]
    fn json_uses_string_form() {
        let json = serde_json::to_string(&Color([1, 2, 3, 255])).unwrap();
        assert_eq!(json, "\"#010203\"");
        let back: Color = serde_json::from_str("\"#0102037f\"").unwrap();
        assert_eq!(back, Color([1, 2, 3, 0x7f]));
        assert!(serde_json::from_str::<Color>("\"red\"").is_err());
    }
}
