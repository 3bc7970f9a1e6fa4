// ============================================================================
// SNAPSHOT I/O - authoritative pixel state in and out
// ============================================================================
//
// Only the background and foreground layers are persisted.  The mask, the top
// scratch layer and every derived effect are transient and never exported.
// ============================================================================

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::canvas::{CHUNK_SIZE, LayerKind, LayerStore, MAX_CANVAS_DIM, TiledImage, composite_over};

const DOCUMENT_MAGIC: &str = "TPD1";

/// Error type for snapshot and document operations.
#[derive(Debug)]
pub enum SnapshotError {
    Io(std::io::Error),
    Image(String),
    Serialize(String),
    InvalidFormat(String),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Io(e) => write!(f, "I/O error: {}", e),
            SnapshotError::Image(e) => write!(f, "Image error: {}", e),
            SnapshotError::Serialize(e) => write!(f, "Serialization error: {}", e),
            SnapshotError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(e)
    }
}

impl From<image::ImageError> for SnapshotError {
    fn from(e: image::ImageError) -> Self {
        SnapshotError::Image(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for SnapshotError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        SnapshotError::Serialize(e.to_string())
    }
}

/// PNG-encoded authoritative layers, for hosts that persist them separately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerData {
    pub background: Vec<u8>,
    pub foreground: Vec<u8>,
}

// ============================================================================
// PNG EXPORT / IMPORT
// ============================================================================

/// Background with the foreground drawn over it.
pub fn authoritative_composite(store: &LayerStore) -> RgbaImage {
    let mut out = store.flatten(LayerKind::Background);
    composite_over(&mut out, &store.flatten(LayerKind::Foreground));
    out
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, SnapshotError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(img.as_raw(), img.width(), img.height(), ColorType::Rgba8)?;
    Ok(buf)
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, SnapshotError> {
    Ok(image::load_from_memory(bytes)?.into_rgba8())
}

/// PNG of background + foreground.  Independent of the mask, the top layer,
/// effect settings and compositor quality.
pub fn export(store: &LayerStore) -> Result<Vec<u8>, SnapshotError> {
    encode_png(&authoritative_composite(store))
}

/// Decode `bytes` into the background layer, anchored at (0, 0) and clipped.
/// The foreground cannot be separated out of a combined image and is cleared.
pub fn import(store: &mut LayerStore, bytes: &[u8]) -> Result<(), SnapshotError> {
    let img = decode_image(bytes)?;
    store.clear(LayerKind::Background);
    store.draw_image(LayerKind::Background, &img);
    store.clear(LayerKind::Foreground);
    Ok(())
}

pub fn layer_data(store: &LayerStore) -> Result<LayerData, SnapshotError> {
    Ok(LayerData {
        background: encode_png(&store.flatten(LayerKind::Background))?,
        foreground: encode_png(&store.flatten(LayerKind::Foreground))?,
    })
}

// ============================================================================
// DOCUMENT FILES - sparse chunks, bincode
// ============================================================================

#[derive(Serialize, Deserialize)]
struct DocumentFile {
    magic: String,
    width: u32,
    height: u32,
    layers: Vec<DocumentLayer>,
}

#[derive(Serialize, Deserialize)]
struct DocumentLayer {
    kind: u8,
    chunks: Vec<ChunkData>,
}

/// A single serialisable chunk (64×64 × 4 bytes of pixel data).
#[derive(Serialize, Deserialize)]
struct ChunkData {
    cx: u32,
    cy: u32,
    pixels: Vec<u8>,
}

fn build_document(store: &LayerStore) -> DocumentFile {
    let layers = [LayerKind::Background, LayerKind::Foreground]
        .iter()
        .filter_map(|&kind| store.get(kind))
        .map(|layer| {
            let chunks = layer
                .pixels
                .chunk_keys()
                .filter_map(|(cx, cy)| {
                    let chunk = layer.pixels.get_chunk(cx, cy)?;
                    Some(ChunkData { cx, cy, pixels: chunk.as_raw().clone() })
                })
                .collect();
            DocumentLayer { kind: layer.kind.to_u8(), chunks }
        })
        .collect();

    DocumentFile {
        magic: DOCUMENT_MAGIC.to_string(),
        width: store.width(),
        height: store.height(),
        layers,
    }
}

pub fn write_document<W: Write>(store: &LayerStore, writer: W) -> Result<(), SnapshotError> {
    bincode::serialize_into(writer, &build_document(store))?;
    Ok(())
}

/// Save background + foreground as a document file.
pub fn save_document(store: &LayerStore, path: &Path) -> Result<(), SnapshotError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_document(store, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Load a document file into a fresh store (mask and top start empty).
pub fn load_document(path: &Path) -> Result<LayerStore, SnapshotError> {
    let raw = std::fs::read(path)?;
    read_document(&raw)
}

pub fn read_document(raw: &[u8]) -> Result<LayerStore, SnapshotError> {
    // bincode encodes a String as an 8-byte length prefix + UTF-8 data.
    if raw.len() < 12 || &raw[8..12] != DOCUMENT_MAGIC.as_bytes() {
        return Err(SnapshotError::InvalidFormat("Not a TerraPaint document".into()));
    }
    let doc: DocumentFile = bincode::deserialize(raw)?;

    if doc.width == 0 || doc.height == 0 {
        return Err(SnapshotError::InvalidFormat("Canvas dimensions cannot be zero".into()));
    }
    if doc.width > MAX_CANVAS_DIM || doc.height > MAX_CANVAS_DIM {
        return Err(SnapshotError::InvalidFormat(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            doc.width, doc.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }

    let expected_chunk_bytes = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
    let (cols, rows) = (doc.width.div_ceil(CHUNK_SIZE), doc.height.div_ceil(CHUNK_SIZE));
    let mut store = LayerStore::new(doc.width, doc.height);

    for dl in doc.layers {
        let kind = match LayerKind::from_u8(dl.kind) {
            Some(k @ (LayerKind::Background | LayerKind::Foreground)) => k,
            _ => {
                return Err(SnapshotError::InvalidFormat(format!(
                    "Unexpected layer id {} in document",
                    dl.kind
                )));
            }
        };
        let mut tiled = TiledImage::new(doc.width, doc.height);
        for cd in dl.chunks {
            if cd.cx >= cols || cd.cy >= rows {
                return Err(SnapshotError::InvalidFormat(format!(
                    "Chunk ({},{}) in layer '{}' lies outside the canvas",
                    cd.cx, cd.cy, kind
                )));
            }
            if cd.pixels.len() != expected_chunk_bytes {
                return Err(SnapshotError::InvalidFormat(format!(
                    "Chunk ({},{}) in layer '{}' has {} bytes, expected {}",
                    cd.cx,
                    cd.cy,
                    kind,
                    cd.pixels.len(),
                    expected_chunk_bytes,
                )));
            }
            let chunk = RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, cd.pixels).ok_or_else(|| {
                SnapshotError::InvalidFormat(format!(
                    "Failed to reconstruct chunk ({},{}) for layer '{}'",
                    cd.cx, cd.cy, kind
                ))
            })?;
            tiled.set_chunk(cd.cx, cd.cy, chunk);
        }
        if let Some(layer) = store.get_mut(kind) {
            layer.pixels = tiled;
            layer.touch();
        }
    }

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::Stamp;
    use crate::canvas::CompositeOp;
    use image::Rgba;

    fn painted_store() -> LayerStore {
        let mut store = LayerStore::new(100, 80);
        store.fill(LayerKind::Background, Rgba([20, 40, 60, 255]));
        let ink = Stamp { origin: (70, 10), pixels: RgbaImage::from_pixel(5, 5, Rgba([200, 0, 0, 255])) };
        store.apply_stamp(LayerKind::Foreground, &ink, CompositeOp::SourceOver);
        let scratch = Stamp { origin: (0, 0), pixels: RgbaImage::from_pixel(3, 3, Rgba([0, 255, 0, 255])) };
        store.apply_stamp(LayerKind::Top, &scratch, CompositeOp::SourceOver);
        store.apply_stamp(LayerKind::Mask, &scratch, CompositeOp::SourceOver);
        store
    }

    #[test]
    fn export_ignores_mask_and_top() {
        let store = painted_store();
        let img = decode_image(&export(&store).unwrap()).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgba([20, 40, 60, 255]));
        assert_eq!(*img.get_pixel(72, 12), Rgba([200, 0, 0, 255]));
    }

    #[test]
    fn import_replaces_background_and_drops_foreground() {
        let mut store = painted_store();
        let bytes = export(&store).unwrap();
        import(&mut store, &bytes).unwrap();
        assert!(!store.get(LayerKind::Foreground).unwrap().pixels.has_coverage());
        assert_eq!(*store.flatten(LayerKind::Background).get_pixel(72, 12), Rgba([200, 0, 0, 255]));
        assert_eq!(export(&store).unwrap(), bytes);
    }

    #[test]
    fn import_clips_larger_images() {
        let mut store = LayerStore::new(10, 10);
        let big = encode_png(&RgbaImage::from_pixel(30, 5, Rgba([1, 2, 3, 255]))).unwrap();
        import(&mut store, &big).unwrap();
        let bg = store.flatten(LayerKind::Background);
        assert_eq!(*bg.get_pixel(9, 4), Rgba([1, 2, 3, 255]));
        assert_eq!(bg.get_pixel(0, 5)[3], 0);
    }

    #[test]
    fn import_rejects_garbage() {
        let mut store = LayerStore::new(10, 10);
        assert!(matches!(import(&mut store, b"not an image"), Err(SnapshotError::Image(_))));
    }

    #[test]
    fn layer_data_holds_separate_layers() {
        let store = painted_store();
        let data = layer_data(&store).unwrap();
        let fg = decode_image(&data.foreground).unwrap();
        assert_eq!(fg.get_pixel(0, 0)[3], 0);
        assert_eq!(*fg.get_pixel(70, 10), Rgba([200, 0, 0, 255]));
        let bg = decode_image(&data.background).unwrap();
        assert_eq!(*bg.get_pixel(70, 10), Rgba([20, 40, 60, 255]));
    }

    #[test]
    fn document_round_trips_authoritative_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.tpd");
        let store = painted_store();
        save_document(&store, &path).unwrap();
        let loaded = load_document(&path).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (100, 80));
        assert_eq!(loaded.flatten(LayerKind::Background), store.flatten(LayerKind::Background));
        assert_eq!(loaded.flatten(LayerKind::Foreground), store.flatten(LayerKind::Foreground));
        assert!(!loaded.get(LayerKind::Mask).unwrap().pixels.has_coverage());
        assert!(!loaded.get(LayerKind::Top).unwrap().pixels.has_coverage());
    }

    #[test]
    fn document_rejects_foreign_files() {
        assert!(matches!(read_document(b"short"), Err(SnapshotError::InvalidFormat(_))));
        let mut bytes = Vec::new();
        bincode::serialize_into(&mut bytes, &"PFE1".to_string()).unwrap();
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(read_document(&bytes), Err(SnapshotError::InvalidFormat(_))));
    }

    #[test]
    fn document_rejects_out_of_range_chunks() {
        let doc = DocumentFile {
            magic: DOCUMENT_MAGIC.to_string(),
            width: 64,
            height: 64,
            layers: vec![DocumentLayer {
                kind: LayerKind::Background.to_u8(),
                chunks: vec![ChunkData { cx: 3, cy: 0, pixels: vec![0; 64 * 64 * 4] }],
            }],
        };
        let raw = bincode::serialize(&doc).unwrap();
        assert!(matches!(read_document(&raw), Err(SnapshotError::InvalidFormat(_))));
    }
}
