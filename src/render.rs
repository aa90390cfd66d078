//! Name card rendering: a chosen background with the user's name drawn
//! across the top, plus an optional watermark in the bottom-right corner.
//!
//! The main font is required; a missing watermark font degrades to a card
//! without the watermark. Rendered files live in scratch storage and are
//! returned as a guard that deletes the file when dropped, so delivery
//! success and failure both leave nothing behind.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAIN_FONT_FILE: &str = "Chonburi-Regular.ttf";
const WATERMARK_FONT_FILE: &str = "arial.ttf";

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub assets_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub watermark_text: Option<String>,
    pub style_count: usize,
}

pub struct Renderer {
    cfg: RenderConfig,
}

/// A rendered card on disk. Dropping the guard removes the file.
#[derive(Debug)]
pub struct RenderedCard {
    path: PathBuf,
}

impl RenderedCard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RenderedCard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("failed to remove card {}: {:?}", self.path.display(), e);
            }
        }
    }
}

impl Renderer {
    pub fn new(cfg: RenderConfig) -> Self {
        Self { cfg }
    }

    pub fn style_ids(&self) -> Vec<String> {
        (1..=self.cfg.style_count).map(|i| format!("style{}", i)).collect()
    }

    pub fn has_style(&self, style: &str) -> bool {
        self.style_ids().iter().any(|s| s == style)
    }

    pub fn background_path(&self, style: &str) -> PathBuf {
        self.cfg.assets_dir.join(format!("{}.png", style))
    }

    /// Preview collage for one gallery page, if the asset was shipped.
    pub fn preview_path(&self, page: usize) -> PathBuf {
        self.cfg.assets_dir.join(format!("styles{}_preview.png", page))
    }

    pub fn render(&self, name: &str, style: &str) -> Result<RenderedCard> {
        let background = self.background_path(style);
        if !background.exists() {
            return Err(anyhow!("background '{}' not found", background.display()));
        }
        let font_path = self.cfg.assets_dir.join(MAIN_FONT_FILE);
        if !font_path.exists() {
            return Err(anyhow!("font '{}' not found", font_path.display()));
        }

        let mut img = image::open(&background)
            .with_context(|| format!("open background '{}'", background.display()))?
            .to_rgba8();
        let (width, height) = img.dimensions();

        let font_bytes = std::fs::read(&font_path)
            .with_context(|| format!("read font '{}'", font_path.display()))?;
        let font = FontVec::try_from_vec(font_bytes)
            .map_err(|_| anyhow!("font '{}' is not a valid font", font_path.display()))?;

        let scale = PxScale::from(width as f32 / 5.5);
        let text_w = text_size(scale, &font, name).0 as i64;
        let x = ((width as i64 - text_w) / 2).max(0) as i32;
        let y = (height as f32 * 0.10) as i32;

        // outline first, fill on top
        let stroke = ((scale.y / 25.0) as i32).max(1);
        for dx in [-stroke, 0, stroke] {
            for dy in [-stroke, 0, stroke] {
                if dx == 0 && dy == 0 {
                    continue;
                }
                draw_text_mut(&mut img, Rgba([0, 0, 0, 255]), x + dx, y + dy, scale, &font, name);
            }
        }
        draw_text_mut(&mut img, Rgba([255, 255, 255, 255]), x, y, scale, &font, name);

        if let Some(text) = self.cfg.watermark_text.as_deref() {
            self.draw_watermark(&mut img, text, width, height);
        }

        let out_path = self
            .cfg
            .scratch_dir
            .join(format!("card_for_{}.png", sanitize_for_filename(name)));
        image::DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .save(&out_path)
            .with_context(|| format!("save card '{}'", out_path.display()))?;

        Ok(RenderedCard { path: out_path })
    }

    fn draw_watermark(&self, img: &mut RgbaImage, text: &str, width: u32, height: u32) {
        let font_path = self.cfg.assets_dir.join(WATERMARK_FONT_FILE);
        let font_bytes = match std::fs::read(&font_path) {
            Ok(b) => b,
            Err(_) => {
                warn!("watermark font not found, skipping watermark");
                return;
            }
        };
        let Ok(font) = FontVec::try_from_vec(font_bytes) else {
            warn!("watermark font is not a valid font, skipping watermark");
            return;
        };
        let scale = PxScale::from(width as f32 / 30.0);
        let (wm_w, wm_h) = text_size(scale, &font, text);
        let x = (width as i64 - wm_w as i64 - 20).max(0) as i32;
        let y = (height as i64 - wm_h as i64 - 20).max(0) as i32;
        draw_text_mut(img, Rgba([255, 255, 255, 128]), x, y, scale, &font, text);
    }
}

fn sanitize_for_filename(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
}
