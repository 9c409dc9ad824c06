use async_trait::async_trait;
use image::RgbImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::FilteringConfig;
use crate::utils::error::{AppError, Result};

/// Returns true when the share of near-white/solid pixels reaches `max_ratio`.
///
/// A pixel is solid when every channel is `>= threshold`. An empty image is
/// never classified as background.
pub fn is_likely_background(image: &RgbImage, threshold: u8, max_ratio: f64) -> bool {
    match solid_color_ratio(image, threshold) {
        Some(ratio) => ratio >= max_ratio,
        None => false,
    }
}

/// Fraction of solid pixels, or `None` for a zero-sized image.
pub fn solid_color_ratio(image: &RgbImage, threshold: u8) -> Option<f64> {
    let total = image.width() as u64 * image.height() as u64;
    if total == 0 {
        return None;
    }

    let solid = image
        .pixels()
        .filter(|p| p.0.iter().all(|&channel| channel >= threshold))
        .count() as u64;

    Some(solid as f64 / total as f64)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAnalysis {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub solid_ratio: f64,
    pub is_background: bool,
}

/// Retrieves and decodes product images.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<RgbImage>;
}

pub struct HttpImageLoader {
    client: Client,
}

impl HttpImageLoader {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageLoader for HttpImageLoader {
    async fn load(&self, url: &str) -> Result<RgbImage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::ImageUnavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::ImageUnavailable(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::ImageUnavailable(format!("{}: {}", url, e)))?;
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| AppError::ImageUnavailable(format!("{}: {}", url, e)))?;
        Ok(decoded.to_rgb8())
    }
}

/// Applies the background heuristic to listing images.
///
/// Items are only ever rejected on a positive classification: a missing URL,
/// a failed download or an undecodable image all let the item through.
pub struct ImageFilter {
    enabled: bool,
    threshold: u8,
    max_ratio: f64,
    loader: Box<dyn ImageLoader>,
}

impl ImageFilter {
    pub fn new(config: &FilteringConfig, loader: Box<dyn ImageLoader>) -> Self {
        Self {
            enabled: config.background_filter_enabled,
            threshold: config.background_color_threshold,
            max_ratio: config.max_solid_color_ratio,
            loader,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn passes(&self, image_url: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(url) = image_url.filter(|u| !u.is_empty()) else {
            return true;
        };

        match self.loader.load(url).await {
            Ok(image) => {
                let background = is_likely_background(&image, self.threshold, self.max_ratio);
                if background {
                    tracing::debug!(url, "Image filtered: solid background detected");
                }
                !background
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "Image unavailable; skipping background check");
                true
            }
        }
    }

    pub async fn analyze(&self, url: &str) -> Result<ImageAnalysis> {
        let image = self.loader.load(url).await?;
        let solid_ratio = solid_color_ratio(&image, self.threshold).unwrap_or(0.0);

        Ok(ImageAnalysis {
            url: url.to_string(),
            width: image.width(),
            height: image.height(),
            solid_ratio,
            is_background: is_likely_background(&image, self.threshold, self.max_ratio),
        })
    }
}
