//! Image signature sniffing for tolerant downloads.

use crate::error::{Result, VaonisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Bmp,
    Gif,
    Tiff,
    Webp,
    /// Declared by an `image/*` content type, bytes not recognized.
    Declared,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Gif => "gif",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Webp => "webp",
            ImageFormat::Declared => "img",
        }
    }
}

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Identifies `data` from its leading bytes, falling back to the declared
/// content type.
pub fn sniff(data: &[u8], content_type: Option<&str>) -> Result<ImageFormat> {
    if data.len() >= 4 {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Ok(ImageFormat::Jpeg);
        }
        if data.starts_with(PNG_MAGIC) {
            return Ok(ImageFormat::Png);
        }
        if data.starts_with(b"BM") {
            return Ok(ImageFormat::Bmp);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Ok(ImageFormat::Gif);
        }
        if data.starts_with(b"II*\x00") || data.starts_with(b"MM\x00*") {
            return Ok(ImageFormat::Tiff);
        }
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Ok(ImageFormat::Webp);
        }
    }

    match content_type {
        Some(ct) if ct.trim().to_ascii_lowercase().starts_with("image/") => Ok(ImageFormat::Declared),
        _ => Err(VaonisError::ImageSniffFailed),
    }
}

pub fn looks_like_image(data: &[u8], content_type: Option<&str>) -> bool {
    sniff(data, content_type).is_ok()
}
