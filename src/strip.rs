//! Captioned image strips.
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};

use crate::{Error, Result};

/// Caption band layout and the font used to fill it.
pub struct CaptionStyle {
    pub font: Option<FontVec>,
    pub size: f32,
    pub height: u32,
}

impl CaptionStyle {
    pub fn new(font: Option<FontVec>, size: f32, height: u32) -> Self {
        Self { font, size, height }
    }

    /// Like [`CaptionStyle::new`], reading the font from `path`. A missing or
    /// unreadable font leaves the caption band blank.
    pub fn load(path: Option<&Path>, size: f32, height: u32) -> Self {
        let font = path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontVec::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(err) => {
                    tracing::warn!("invalid font {}: {err}", path.display());
                    None
                }
            },
            Err(err) => {
                tracing::warn!("cannot read font {}: {err}", path.display());
                None
            }
        });
        if font.is_none() {
            tracing::warn!("no caption font available, captions will be left blank");
        }
        Self::new(font, size, height)
    }
}

/// Pastes `images` column by column into `rows` rows, with an optional
/// caption band on top.
pub fn captioned_strip(
    images: &[RgbImage],
    caption: Option<&str>,
    rows: usize,
    style: &CaptionStyle,
) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| Error::Strip("no images to compose".to_string()))?;
    if rows == 0 || images.len() % rows != 0 {
        return Err(Error::Strip(format!(
            "{} images do not fill {rows} rows",
            images.len()
        )));
    }
    let (w, h) = first.dimensions();
    if let Some(img) = images.iter().find(|img| img.dimensions() != (w, h)) {
        return Err(Error::Strip(format!(
            "image of size {:?} does not match {:?}",
            img.dimensions(),
            (w, h)
        )));
    }
    let extra = if caption.is_some() { style.height } else { 0 };
    let columns = (images.len() / rows) as u32;
    let mut strip = RgbImage::new(columns * w, h * rows as u32 + extra);
    for (i, img) in images.iter().enumerate() {
        let x = (i / rows) as u32 * w;
        let y = extra + (i % rows) as u32 * h;
        image::imageops::replace(&mut strip, img, x as i64, y as i64);
    }
    if let (Some(caption), Some(font)) = (caption, style.font.as_ref()) {
        imageproc::drawing::draw_text_mut(
            &mut strip,
            Rgb([255, 255, 255]),
            20,
            3,
            PxScale::from(style.size),
            font,
            caption,
        );
    }
    Ok(strip)
}
