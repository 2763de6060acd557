//! Artwork pipeline: bounded fetch, resize and pixel-format conversion.
//!
//! Backends hand the pipeline a URL (a Roon image endpoint, an LMS cover
//! path, a UPnP `albumArtURI`). The fetch is bounded three ways:
//!
//! 1. **Redirects**: at most five hops
//! 2. **Size**: the body is read chunk by chunk and abandoned past the ceiling
//! 3. **Time**: one timeout covers connect, headers and body
//!
//! Bodies that are not images are refused, and requested dimensions are
//! capped before anything is decoded.
//!
//! The bytes are then passed through untouched or decoded, resized and
//! re-encoded (JPEG, PNG or raw RGB565 for small LCD surfaces).

use std::io::Cursor;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use reqwest::{redirect, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ArtworkConfig;
use crate::error::{BridgeError, BridgeResult};

// ─────────────────────────────────────────────────────────────────────────────
// Error Types
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur while fetching or converting artwork.
#[derive(Debug, Error)]
pub enum ArtworkError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP error {0}")]
    HttpStatus(u16),

    /// Redirect chain exceeded the limit.
    #[error("too many redirects")]
    TooManyRedirects,

    /// Body exceeded the size ceiling (bytes).
    #[error("artwork exceeds {0} bytes")]
    TooLarge(usize),

    /// Fetch did not complete in time.
    #[error("artwork fetch timed out")]
    Timeout,

    /// Bytes could not be decoded or re-encoded.
    #[error("image conversion failed: {0}")]
    Decode(String),

    /// Requested width or height is above the configured ceiling.
    #[error("requested artwork dimension exceeds {0} pixels")]
    DimensionTooLarge(u32),

    /// Response body is not an image (carries the content type).
    #[error("artwork response is not an image: {0}")]
    NotAnImage(String),
}

impl From<reqwest::Error> for ArtworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_redirect() {
            Self::TooManyRedirects
        } else if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Output encoding requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtworkFormat {
    /// Raw 16-bit 5/6/5 pixels, little-endian, row-major.
    Rgb565,
    Jpeg,
    Png,
}

impl FromStr for ArtworkFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb565" => Ok(Self::Rgb565),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(BridgeError::InvalidRequest(format!(
                "unsupported artwork format: {}",
                other
            ))),
        }
    }
}

/// Caller's sizing and format preferences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// `None` means pass-through (unless a size is requested, then JPEG).
    pub format: Option<ArtworkFormat>,
}

impl ArtworkRequest {
    #[must_use]
    pub fn sized(width: u32, height: u32, format: Option<ArtworkFormat>) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            format,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.format.is_none() && self.width.is_none() && self.height.is_none()
    }

    /// Rejects a width or height above `max_dimension`.
    pub fn check_bounds(&self, max_dimension: u32) -> Result<(), ArtworkError> {
        let too_big = |v: Option<u32>| v.is_some_and(|v| v > max_dimension);
        if too_big(self.width) || too_big(self.height) {
            return Err(ArtworkError::DimensionTooLarge(max_dimension));
        }
        Ok(())
    }
}

/// Image bytes ready for delivery.
#[derive(Debug, Clone)]
pub struct ArtworkImage {
    pub content_type: String,
    /// Pixel width, known once the image was decoded.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bytes: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Fetcher
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded HTTP fetcher for artwork URLs.
#[derive(Clone)]
pub struct ArtworkFetcher {
    client: Client,
    max_bytes: usize,
    max_dimension: u32,
    timeout: Duration,
}

impl ArtworkFetcher {
    /// Builds a fetcher with its own redirect-limited HTTP client.
    ///
    /// # Errors
    /// Returns `Internal` if the HTTP client cannot be constructed.
    pub fn new(config: &ArtworkConfig) -> BridgeResult<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| BridgeError::Internal(format!("artwork HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
            max_dimension: config.max_dimension,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Fetches `url` and applies `request`.
    ///
    /// Oversized dimensions are refused before any network traffic.
    pub async fn fetch_and_render(
        &self,
        url: &str,
        request: &ArtworkRequest,
    ) -> BridgeResult<ArtworkImage> {
        request.check_bounds(self.max_dimension)?;
        let (bytes, content_type) = self.fetch(url).await?;
        Ok(render(bytes, content_type, *request).await?)
    }

    /// Downloads `url`, returning the body and its content type.
    ///
    /// # Errors
    /// `TooManyRedirects`, `TooLarge` or `Timeout` when a bound is hit,
    /// `NotAnImage` when the body is neither labelled nor sniffed as an image.
    pub async fn fetch(&self, url: &str) -> Result<(Bytes, String), ArtworkError> {
        log::debug!("[Artwork] GET {}", url);

        let mut response = self.client.get(url).timeout(self.timeout).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArtworkError::HttpStatus(status.as_u16()));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                log::warn!("[Artwork] {} advertises {} bytes, refusing", url, len);
                return Err(ArtworkError::TooLarge(self.max_bytes));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_bytes {
                log::warn!(
                    "[Artwork] {} exceeded {} bytes mid-stream, aborting",
                    url,
                    self.max_bytes
                );
                return Err(ArtworkError::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        let body = body.freeze();
        let content_type = image_content_type(&content_type, &body).ok_or_else(|| {
            log::warn!("[Artwork] {} returned {}, refusing", url, content_type);
            ArtworkError::NotAnImage(content_type.clone())
        })?;

        Ok((body, content_type))
    }
}

/// Keeps an `image/*` label; otherwise sniffs the bytes and labels them.
fn image_content_type(declared: &str, body: &[u8]) -> Option<String> {
    if declared.trim().to_ascii_lowercase().starts_with("image/") {
        return Some(declared.to_string());
    }
    image::guess_format(body)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Applies size and format preferences to fetched bytes.
///
/// Decoding and encoding are CPU-bound and run on the blocking pool.
pub async fn render(
    bytes: Bytes,
    content_type: String,
    request: ArtworkRequest,
) -> Result<ArtworkImage, ArtworkError> {
    if request.is_passthrough() {
        return Ok(ArtworkImage {
            content_type,
            width: None,
            height: None,
            bytes,
        });
    }

    tokio::task::spawn_blocking(move || convert(&bytes, request))
        .await
        .map_err(|e| ArtworkError::Decode(format!("conversion task failed: {}", e)))?
}

fn convert(bytes: &[u8], request: ArtworkRequest) -> Result<ArtworkImage, ArtworkError> {
    let img = image::load_from_memory(bytes).map_err(|e| ArtworkError::Decode(e.to_string()))?;
    let img = resize(img, request.width, request.height);
    let (width, height) = (img.width(), img.height());

    let format = request.format.unwrap_or(ArtworkFormat::Jpeg);
    let (content_type, out) = match format {
        ArtworkFormat::Rgb565 => {
            let rgba = img.to_rgba8();
            ("application/octet-stream", rgba_to_rgb565(rgba.as_raw()))
        }
        ArtworkFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            ("image/jpeg", encode(&rgb, ImageFormat::Jpeg)?)
        }
        ArtworkFormat::Png => ("image/png", encode(&img, ImageFormat::Png)?),
    };

    Ok(ArtworkImage {
        content_type: content_type.to_string(),
        width: Some(width),
        height: Some(height),
        bytes: Bytes::from(out),
    })
}

fn resize(img: DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => img.resize_exact(w, h, FilterType::Triangle),
        (Some(w), None) if w > 0 => img.resize(w, u32::MAX, FilterType::Triangle),
        (None, Some(h)) if h > 0 => img.resize(u32::MAX, h, FilterType::Triangle),
        _ => img,
    }
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, ArtworkError> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)
        .map_err(|e| ArtworkError::Decode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Packs RGBA8 pixels (4-byte stride) into little-endian RGB565.
///
/// Alpha is discarded. A `W*H` image yields exactly `W*H*2` bytes.
#[must_use]
pub fn rgba_to_rgb565(rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rgba.len() / 2);
    for px in rgba.chunks_exact(4) {
        let (r, g, b) = (u16::from(px[0]), u16::from(px[1]), u16::from(px[2]));
        let packed = ((r & 0xF8) << 8) | ((g & 0xFC) << 3) | (b >> 3);
        out.extend_from_slice(&packed.to_le_bytes());
    }
    out
}
