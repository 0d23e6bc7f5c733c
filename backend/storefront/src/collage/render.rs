//! Rasterising a [`CompositionPlan`].
//!
//! Sources are fetched and decoded up front by [`load_sources`]; drawing is
//! then one synchronous pass over the plan, so draw order never depends on
//! which download finished first.

use std::io::Cursor;

use futures_util::future::try_join_all;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};

use crate::assets::AssetStore;
use crate::errors::{Result, StoreError};

use super::layout::{CompositionPlan, Placement, VisualFilter};

/// Multiplier applied to every RGB channel of the finished image.
pub const BRIGHTNESS_BOOST: f32 = 1.1;
const HIGH_CONTRAST: f32 = 1.5;
const PREVIEW_BLUR_SIGMA: f32 = 6.0;

/// Decoded images, in plan order.
#[derive(Debug, Clone)]
pub struct Sources {
    pub hero: Option<RgbaImage>,
    pub cells: Vec<RgbaImage>,
}

async fn load_one(store: &dyn AssetStore, placement: &Placement) -> Result<RgbaImage> {
    let bytes = store.fetch(&placement.image_url).await?;
    Ok(image::load_from_memory(&bytes)?.to_rgba8())
}

pub async fn load_sources(store: &dyn AssetStore, plan: &CompositionPlan) -> Result<Sources> {
    let hero = match &plan.hero {
        Some(placement) => Some(load_one(store, placement).await?),
        None => None,
    };
    let cells = try_join_all(plan.cells.iter().map(|p| load_one(store, p))).await?;
    Ok(Sources { hero, cells })
}

/// Draw the collage at the plan's resolution.
pub fn render(plan: &CompositionPlan, sources: &Sources, filter: VisualFilter) -> Result<RgbaImage> {
    if sources.cells.len() != plan.cells.len() || sources.hero.is_some() != plan.hero.is_some() {
        return Err(StoreError::Validation(
            "decoded sources do not match the layout".to_string(),
        ));
    }

    let [r, g, b] = plan.background;
    let mut canvas = RgbaImage::from_pixel(plan.width, plan.height, Rgba([r, g, b, 255]));

    if let (Some(placement), Some(img)) = (&plan.hero, &sources.hero) {
        draw(&mut canvas, placement, img, filter);
    }
    for (placement, img) in plan.cells.iter().zip(&sources.cells) {
        draw(&mut canvas, placement, img, filter);
    }

    brighten(&mut canvas, BRIGHTNESS_BOOST);
    Ok(canvas)
}

/// Blurred render shown before the collage is paid for.
pub fn render_preview(
    plan: &CompositionPlan,
    sources: &Sources,
    filter: VisualFilter,
) -> Result<RgbaImage> {
    let sharp = render(plan, sources, filter)?;
    Ok(imageops::blur(&sharp, PREVIEW_BLUR_SIGMA))
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

fn draw(canvas: &mut RgbaImage, placement: &Placement, img: &RgbaImage, filter: VisualFilter) {
    let rect = placement.rect;
    if rect.w == 0 || rect.h == 0 {
        return;
    }
    let mut tile = imageops::resize(img, rect.w, rect.h, FilterType::Triangle);
    apply_filter(&mut tile, filter);
    imageops::overlay(canvas, &tile, i64::from(rect.x), i64::from(rect.y));
}

fn apply_filter(img: &mut RgbaImage, filter: VisualFilter) {
    match filter {
        VisualFilter::None => {}
        VisualFilter::Grayscale => {
            for px in img.pixels_mut() {
                let [r, g, b, a] = px.0;
                let luma = (0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b))
                    .round()
                    .clamp(0.0, 255.0) as u8;
                *px = Rgba([luma, luma, luma, a]);
            }
        }
        VisualFilter::HighContrast => {
            for px in img.pixels_mut() {
                let [r, g, b, a] = px.0;
                let stretch =
                    |c: u8| ((f32::from(c) - 128.0) * HIGH_CONTRAST + 128.0).clamp(0.0, 255.0) as u8;
                *px = Rgba([stretch(r), stretch(g), stretch(b), a]);
            }
        }
    }
}

fn brighten(img: &mut RgbaImage, factor: f32) {
    for px in img.pixels_mut() {
        for channel in px.0.iter_mut().take(3) {
            *channel = (f32::from(*channel) * factor).round().min(255.0) as u8;
        }
    }
}
