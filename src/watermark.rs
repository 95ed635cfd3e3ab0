use crate::config::Config;
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use usvg::fontdb;

/// Overlay font size as a fraction of the (oriented) source width.
const FONT_SIZE_RATIO: f32 = 0.035;
const MIN_FONT_PX: f32 = 14.0;
const MAX_FONT_PX: f32 = 220.0;

/// Tried in order when the generic sans-serif family maps to nothing installed.
const SANS_SERIF_CANDIDATES: &[&str] = &[
    "DejaVu Sans",
    "Liberation Sans",
    "Noto Sans",
    "Open Sans",
    "Helvetica",
];

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("source image could not be decoded")]
    Decode(#[source] image::ImageError),
    #[error("source image reports zero width or height")]
    EmptyImage,
    #[error("source image has {pixels} pixels, limit is {limit}")]
    TooManyPixels { pixels: u64, limit: u64 },
    #[error("watermark overlay could not be built: {0}")]
    Overlay(String),
    #[error("output of {width}x{height} exceeds jpeg dimension limits")]
    OutputTooLarge { width: u32, height: u32 },
    #[error("jpeg encoding failed")]
    Encode(#[source] jpeg_encoder::EncodingError),
}

impl ComposeError {
    /// Errors caused by the source bytes rather than by this process.
    pub fn is_unsupported_image(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::EmptyImage
                | Self::TooManyPixels { .. }
                | Self::OutputTooLarge { .. }
        )
    }
}

/// Visual parameters of the watermark. Any change here must come with a
/// template version bump or stale derivatives keep being served.
#[derive(Debug, Clone)]
pub struct WatermarkTemplate {
    pub text: String,
    pub font_family: String,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct ComposedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

pub struct Compositor {
    template: WatermarkTemplate,
    fontdb: Arc<fontdb::Database>,
    max_decoded_pixels: u64,
}

impl Compositor {
    pub fn new(
        template: WatermarkTemplate,
        fontdb: Arc<fontdb::Database>,
        max_decoded_pixels: u64,
    ) -> Self {
        Self {
            template,
            fontdb,
            max_decoded_pixels,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let fontdb = load_fonts(config.watermark_font_path.as_deref())?;
        if !font_family_resolves(&fontdb, &config.watermark_font_family) {
            bail!(
                "watermark font family {:?} matches none of the {} loaded font faces",
                config.watermark_font_family,
                fontdb.len()
            );
        }
        info!(
            faces = fontdb.len(),
            family = %config.watermark_font_family,
            "watermark fonts loaded"
        );
        Ok(Self::new(
            WatermarkTemplate {
                text: config.watermark_text.clone(),
                font_family: config.watermark_font_family.clone(),
                jpeg_quality: config.jpeg_quality,
            },
            Arc::new(fontdb),
            config.max_decoded_pixels,
        ))
    }

    /// Decodes `source`, corrects its orientation, scales it down to at most
    /// `target_width` and stamps the centered text overlay. CPU bound; run it
    /// off the async executor.
    pub fn compose(&self, source: &[u8], target_width: u32) -> Result<ComposedImage, ComposeError> {
        let image = decode_upright(source, self.max_decoded_pixels)?;
        let (source_width, source_height) = (image.width(), image.height());
        let overlay = self.overlay_tree(source_width, source_height)?;

        let width = target_width.min(source_width).max(1);
        let image = if width == source_width {
            image
        } else {
            let height = ((source_height as f64 * width as f64 / source_width as f64).round()
                as u32)
                .max(1);
            image.resize_exact(width, height, FilterType::Lanczos3)
        };

        let mut canvas = flatten_on_white(image.to_rgba8());
        let (width, height) = canvas.dimensions();
        {
            let mut pixmap = tiny_skia::PixmapMut::from_bytes(&mut canvas, width, height)
                .ok_or_else(|| ComposeError::Overlay("invalid canvas size".to_string()))?;
            render_overlay(&overlay, &mut pixmap);
        }
        let bytes = encode_jpeg(&canvas, self.template.jpeg_quality)?;
        debug!(
            source_width,
            source_height,
            width,
            height,
            bytes = bytes.len(),
            "derivative composed"
        );
        Ok(ComposedImage {
            bytes: Bytes::from(bytes),
            width,
            height,
        })
    }

    fn overlay_tree(&self, width: u32, height: u32) -> Result<usvg::Tree, ComposeError> {
        let svg = overlay_svg(&self.template.text, &self.template.font_family, width, height);
        let mut options = usvg::Options::default();
        options.fontdb = self.fontdb.clone();
        options.font_family = self.template.font_family.clone();
        let tree = usvg::Tree::from_str(&svg, &options)
            .map_err(|err| ComposeError::Overlay(err.to_string()))?;
        // usvg silently drops text it cannot shape with any loaded face.
        if !self.template.text.trim().is_empty() && !tree.root().has_children() {
            return Err(ComposeError::Overlay(format!(
                "no font face renders family {:?}",
                self.template.font_family
            )));
        }
        Ok(tree)
    }
}

/// Baseline JPEG with Huffman tables optimized for the image content.
fn encode_jpeg(canvas: &RgbaImage, quality: u8) -> Result<Vec<u8>, ComposeError> {
    let (width, height) = canvas.dimensions();
    let (Ok(w), Ok(h)) = (u16::try_from(width), u16::try_from(height)) else {
        return Err(ComposeError::OutputTooLarge { width, height });
    };
    let mut bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut bytes, quality);
    encoder.set_optimized_huffman_tables(true);
    encoder
        .encode(canvas.as_raw(), w, h, jpeg_encoder::ColorType::Rgba)
        .map_err(ComposeError::Encode)?;
    Ok(bytes)
}

/// Builds the font database: the configured font file first so it becomes
/// the sans-serif fallback, then whatever the system provides. Without a
/// font file, sans-serif is pointed at an installed face.
pub fn load_fonts(font_path: Option<&Path>) -> Result<fontdb::Database> {
    let mut db = fontdb::Database::new();
    let mut sans_serif = None;
    if let Some(path) = font_path {
        db.load_font_file(path)
            .with_context(|| format!("load watermark font {}", path.display()))?;
        sans_serif = db
            .faces()
            .next()
            .and_then(|face| face.families.first())
            .map(|(name, _)| name.clone());
    }
    db.load_system_fonts();
    if sans_serif.is_none() && !has_face(&db, fontdb::Family::SansSerif) {
        sans_serif = installed_sans_serif(&db);
    }
    if let Some(family) = sans_serif {
        debug!(family = %family, "sans-serif font family selected");
        db.set_sans_serif_family(family);
    }
    Ok(db)
}

fn installed_sans_serif(db: &fontdb::Database) -> Option<String> {
    SANS_SERIF_CANDIDATES
        .iter()
        .find(|name| has_face(db, fontdb::Family::Name(**name)))
        .map(|name| name.to_string())
        .or_else(|| {
            db.faces()
                .find_map(|face| face.families.first().map(|(name, _)| name.clone()))
        })
}

/// True when any entry of a CSS `font-family` list maps to a loaded face.
pub fn font_family_resolves(db: &fontdb::Database, font_family: &str) -> bool {
    font_family
        .split(',')
        .map(|name| name.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|name| !name.is_empty())
        .any(|name| {
            let family = match name.to_ascii_lowercase().as_str() {
                "serif" => fontdb::Family::Serif,
                "sans-serif" => fontdb::Family::SansSerif,
                "cursive" => fontdb::Family::Cursive,
                "fantasy" => fontdb::Family::Fantasy,
                "monospace" => fontdb::Family::Monospace,
                _ => fontdb::Family::Name(name),
            };
            has_face(db, family)
        })
}

fn has_face(db: &fontdb::Database, family: fontdb::Family<'_>) -> bool {
    db.query(&fontdb::Query {
        families: &[family],
        ..Default::default()
    })
    .is_some()
}

pub fn overlay_font_size(source_width: u32) -> f32 {
    (source_width as f32 * FONT_SIZE_RATIO).clamp(MIN_FONT_PX, MAX_FONT_PX)
}

/// Overlay document at source resolution; it is scaled onto the resized
/// canvas at render time.
pub fn overlay_svg(text: &str, font_family: &str, width: u32, height: u32) -> String {
    let font_size = overlay_font_size(width);
    let stroke_width = (font_size * 0.04).max(1.0);
    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            r#"<text x="{cx}" y="{cy}" text-anchor="middle" dominant-baseline="central" "#,
            r#"font-family="{family}" font-size="{size:.1}" font-weight="bold" "#,
            r##"fill="#ffffff" fill-opacity="0.45" stroke="#000000" stroke-opacity="0.35" "##,
            r#"stroke-width="{stroke:.2}">{text}</text></svg>"#,
        ),
        w = width,
        h = height,
        cx = width as f32 / 2.0,
        cy = height as f32 / 2.0,
        family = escape_xml(font_family),
        size = font_size,
        stroke = stroke_width,
        text = escape_xml(text),
    )
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            ch if ch.is_control() => {}
            ch => escaped.push(ch),
        }
    }
    escaped
}

fn decode_upright(bytes: &[u8], max_pixels: u64) -> Result<DynamicImage, ComposeError> {
    let (width, height) = raster_dimensions(bytes, max_pixels)?;
    if width == 0 || height == 0 {
        return Err(ComposeError::EmptyImage);
    }
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| ComposeError::Decode(err.into()))?;
    reader.limits(raster_limits(max_pixels));
    let mut decoder = reader.into_decoder().map_err(ComposeError::Decode)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).map_err(ComposeError::Decode)?;
    image.apply_orientation(orientation);
    if image.width() == 0 || image.height() == 0 {
        return Err(ComposeError::EmptyImage);
    }
    Ok(image)
}

fn raster_dimensions(bytes: &[u8], max_pixels: u64) -> Result<(u32, u32), ComposeError> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| ComposeError::Decode(err.into()))?;
    reader.limits(raster_limits(max_pixels));
    let (width, height) = reader.into_dimensions().map_err(ComposeError::Decode)?;
    let pixels = (width as u64).saturating_mul(height as u64);
    if pixels > max_pixels {
        return Err(ComposeError::TooManyPixels {
            pixels,
            limit: max_pixels,
        });
    }
    Ok((width, height))
}

fn raster_limits(max_pixels: u64) -> image::Limits {
    let max_dim = max_pixels.min(u32::MAX as u64) as u32;
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(max_dim);
    limits.max_image_height = Some(max_dim);
    limits.max_alloc = Some(max_pixels.saturating_mul(4));
    limits
}

/// Composites onto white so the buffer is opaque, which also makes it valid
/// premultiplied data for tiny-skia.
fn flatten_on_white(mut image: RgbaImage) -> RgbaImage {
    for pixel in image.pixels_mut() {
        let alpha = pixel.0[3] as u32;
        if alpha == 255 {
            continue;
        }
        for channel in 0..3 {
            let value = pixel.0[channel] as u32;
            pixel.0[channel] = ((value * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        }
        pixel.0[3] = 255;
    }
    image
}

fn render_overlay(tree: &usvg::Tree, pixmap: &mut tiny_skia::PixmapMut<'_>) {
    let size = tree.size();
    let scale_x = if size.width() > 0.0 {
        pixmap.width() as f32 / size.width()
    } else {
        1.0
    };
    let scale_y = if size.height() > 0.0 {
        pixmap.height() as f32 / size.height()
    } else {
        1.0
    };
    resvg::render(tree, tiny_skia::Transform::from_scale(scale_x, scale_y), pixmap);
}
