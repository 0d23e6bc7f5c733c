//! Grid geometry and item ordering.
//!
//! All geometry is computed at display scale and multiplied by the output
//! scale at the end, so a plan is a pure function of the ordered items and
//! the layout parameters.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};
use crate::models::Skin;

/// Width of the collage at display scale, in pixels.
pub const DISPLAY_WIDTH: u32 = 1080;
/// Upscale factor for the paid, downloadable render.
pub const OUTPUT_SCALE: u32 = 2;
/// Hero banner aspect ratio (width:height).
pub const HERO_ASPECT: (u32, u32) = (16, 9);
pub const MAX_COLUMNS: u32 = 20;
pub const MAX_BORDER: u32 = 64;
/// Tallest collage accepted, at display scale. Keeps the output canvas bounded.
pub const MAX_DISPLAY_HEIGHT: u32 = 4 * DISPLAY_WIDTH;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// Keep selection order.
    #[default]
    Auto,
    WeightAsc,
    WeightDesc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualFilter {
    #[default]
    None,
    Grayscale,
    HighContrast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutParams {
    #[serde(default = "default_columns")]
    pub columns: u32,
    /// Outer padding and gap between cells, in display pixels.
    #[serde(default = "default_border")]
    pub border: u32,
    /// `#RRGGBB`
    #[serde(default = "default_background")]
    pub background: String,
    #[serde(default)]
    pub sort: SortMode,
    #[serde(default)]
    pub group_by_family: bool,
    #[serde(default)]
    pub filter: VisualFilter,
    /// Catalog id of an optional banner drawn above the grid.
    #[serde(default)]
    pub hero: Option<String>,
}

fn default_columns() -> u32 {
    8
}

fn default_border() -> u32 {
    4
}

fn default_background() -> String {
    "#101014".to_string()
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            columns: default_columns(),
            border: default_border(),
            background: default_background(),
            sort: SortMode::default(),
            group_by_family: false,
            filter: VisualFilter::default(),
            hero: None,
        }
    }
}

impl LayoutParams {
    pub fn validate(&self) -> Result<()> {
        if self.columns == 0 || self.columns > MAX_COLUMNS {
            return Err(StoreError::Validation(format!(
                "columns must be between 1 and {MAX_COLUMNS}"
            )));
        }
        if self.border > MAX_BORDER {
            return Err(StoreError::Validation(format!(
                "border must be at most {MAX_BORDER}"
            )));
        }
        if cell_size(DISPLAY_WIDTH, self.columns, self.border) == 0 {
            return Err(StoreError::Validation(
                "border too wide for the column count".to_string(),
            ));
        }
        parse_color(&self.background)?;
        Ok(())
    }
}

/// Parse a `#RRGGBB` colour.
pub fn parse_color(raw: &str) -> Result<[u8; 3]> {
    let digits = raw.strip_prefix('#').unwrap_or(raw);
    let bytes = hex::decode(digits)
        .map_err(|_| StoreError::Validation(format!("invalid colour '{raw}'")))?;
    <[u8; 3]>::try_from(bytes.as_slice())
        .map_err(|_| StoreError::Validation(format!("invalid colour '{raw}'")))
}

/// Side length of one square grid cell.
pub fn cell_size(width: u32, columns: u32, border: u32) -> u32 {
    if columns == 0 {
        return 0;
    }
    let total_gap = border * (columns - 1);
    let total_padding = border * 2;
    width.saturating_sub(total_gap + total_padding) / columns
}

pub fn row_count(items: usize, columns: u32) -> u32 {
    if columns == 0 {
        return 0;
    }
    let columns = columns as usize;
    ((items + columns - 1) / columns) as u32
}

/// Sort by weight (stable), then optionally bucket by family in order of
/// first appearance without disturbing the order inside a family.
pub fn order_items(items: &[Skin], sort: SortMode, group_by_family: bool) -> Vec<Skin> {
    let mut ordered = items.to_vec();
    match sort {
        SortMode::Auto => {}
        SortMode::WeightAsc => ordered.sort_by_key(|s| s.weight),
        SortMode::WeightDesc => ordered.sort_by(|a, b| b.weight.cmp(&a.weight)),
    }

    if !group_by_family {
        return ordered;
    }

    let mut families: Vec<&str> = Vec::new();
    for skin in &ordered {
        if !families.contains(&skin.family.as_str()) {
            families.push(&skin.family);
        }
    }
    families
        .iter()
        .flat_map(|family| ordered.iter().filter(move |s| s.family == *family))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    fn scaled(self, k: u32) -> Self {
        Self {
            x: self.x * k,
            y: self.y * k,
            w: self.w * k,
            h: self.h * k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub item_id: String,
    pub image_url: String,
    pub rect: Rect,
}

/// Everything needed to draw a collage, in draw order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompositionPlan {
    pub width: u32,
    pub height: u32,
    pub background: [u8; 3],
    pub hero: Option<Placement>,
    /// Row-major.
    pub cells: Vec<Placement>,
}

impl CompositionPlan {
    /// Item ids in the order they are drawn: hero first, then the grid.
    pub fn draw_order(&self) -> Vec<&str> {
        self.hero
            .iter()
            .chain(self.cells.iter())
            .map(|p| p.item_id.as_str())
            .collect()
    }
}

pub const HERO_ID: &str = "hero";

/// Lay out already-ordered items on the grid, with `hero` as the banner.
pub fn plan(
    items: &[Skin],
    hero: Option<&Skin>,
    params: &LayoutParams,
    scale: u32,
) -> Result<CompositionPlan> {
    params.validate()?;
    let background = parse_color(&params.background)?;

    let border = params.border;
    let columns = params.columns;
    let cell = cell_size(DISPLAY_WIDTH, columns, border);
    let content_width = DISPLAY_WIDTH - 2 * border;

    let mut top = border;
    let hero = hero.map(|banner| {
        let h = content_width * HERO_ASPECT.1 / HERO_ASPECT.0;
        let rect = Rect {
            x: border,
            y: top,
            w: content_width,
            h,
        };
        top += h + border;
        Placement {
            item_id: HERO_ID.to_string(),
            image_url: banner.image_url.clone(),
            rect: rect.scaled(scale),
        }
    });

    let cells = items
        .iter()
        .enumerate()
        .map(|(i, skin)| {
            let row = i as u32 / columns;
            let col = i as u32 % columns;
            let rect = Rect {
                x: border + col * (cell + border),
                y: top + row * (cell + border),
                w: cell,
                h: cell,
            };
            Placement {
                item_id: skin.id.clone(),
                image_url: skin.image_url.clone(),
                rect: rect.scaled(scale),
            }
        })
        .collect();

    let rows = row_count(items.len(), columns);
    let height = if rows > 0 {
        top + rows * cell + (rows - 1) * border + border
    } else {
        top.max(border * 2).max(1)
    };
    if height > MAX_DISPLAY_HEIGHT {
        return Err(StoreError::Validation(format!(
            "collage would be {height}px tall (limit {MAX_DISPLAY_HEIGHT}); use more columns"
        )));
    }

    Ok(CompositionPlan {
        width: DISPLAY_WIDTH * scale,
        height: height * scale,
        background,
        hero,
        cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skin(id: &str, weight: i64, family: &str) -> Skin {
        Skin {
            id: id.to_string(),
            name: id.to_uppercase(),
            image_url: format!("memory://{id}"),
            weight,
            family: family.to_string(),
        }
    }

    fn ids(items: &[Skin]) -> Vec<&str> {
        items.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn cell_width_floors() {
        // 1080 - 4*7 gaps - 4*2 padding = 1044 → 130.5
        assert_eq!(cell_size(1080, 8, 4), 130);
        assert_eq!(cell_size(1080, 1, 0), 1080);
        assert_eq!(cell_size(10, 4, 5), 0);
    }

    #[test]
    fn rows_round_up() {
        assert_eq!(row_count(0, 8), 0);
        assert_eq!(row_count(8, 8), 1);
        assert_eq!(row_count(9, 8), 2);
    }

    #[test]
    fn weight_sorts_are_stable() {
        let items = vec![
            skin("a", 2, "x"),
            skin("b", 1, "y"),
            skin("c", 2, "y"),
            skin("d", 1, "x"),
        ];
        assert_eq!(
            ids(&order_items(&items, SortMode::WeightAsc, false)),
            ["b", "d", "a", "c"]
        );
        assert_eq!(
            ids(&order_items(&items, SortMode::WeightDesc, false)),
            ["a", "c", "b", "d"]
        );
        assert_eq!(
            ids(&order_items(&items, SortMode::Auto, false)),
            ["a", "b", "c", "d"]
        );
    }

    #[test]
    fn grouping_is_a_stable_partition() {
        let items = vec![
            skin("a", 3, "mage"),
            skin("b", 9, "tank"),
            skin("c", 1, "mage"),
            skin("d", 5, "tank"),
            skin("e", 7, "marksman"),
        ];
        // Desc: b(9) e(7) d(5) a(3) c(1) → families first seen: tank, marksman, mage
        assert_eq!(
            ids(&order_items(&items, SortMode::WeightDesc, true)),
            ["b", "d", "e", "a", "c"]
        );
    }

    #[test]
    fn plan_is_row_major_with_hero_first() {
        let items: Vec<Skin> = (0..5).map(|i| skin(&format!("s{i}"), 0, "")).collect();
        let params = LayoutParams {
            columns: 2,
            border: 10,
            hero: Some("banner".into()),
            ..LayoutParams::default()
        };
        let banner = skin("banner", 0, "");
        let plan = plan(&items, Some(&banner), &params, 1).unwrap();

        assert_eq!(plan.draw_order(), ["hero", "s0", "s1", "s2", "s3", "s4"]);
        assert_eq!(plan.hero.as_ref().unwrap().image_url, "memory://banner");

        let hero = plan.hero.as_ref().unwrap().rect;
        assert_eq!(hero, Rect { x: 10, y: 10, w: 1060, h: 596 });

        let cell = cell_size(DISPLAY_WIDTH, 2, 10);
        assert_eq!(cell, 525);
        let grid_top = 10 + 596 + 10;
        assert_eq!(plan.cells[0].rect, Rect { x: 10, y: grid_top, w: 525, h: 525 });
        assert_eq!(plan.cells[1].rect.x, 10 + 525 + 10);
        assert_eq!(plan.cells[2].rect.y, grid_top + 525 + 10);
        assert_eq!(plan.height, grid_top + 3 * 525 + 2 * 10 + 10);
    }

    #[test]
    fn plan_is_deterministic_and_scales() {
        let items: Vec<Skin> = (0..9).map(|i| skin(&format!("s{i}"), i, "")).collect();
        let params = LayoutParams::default();

        let a = plan(&items, None, &params, OUTPUT_SCALE).unwrap();
        let b = plan(&items, None, &params, OUTPUT_SCALE).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.draw_order(), b.draw_order());

        let small = plan(&items, None, &params, 1).unwrap();
        assert_eq!(a.width, small.width * OUTPUT_SCALE);
        assert_eq!(a.height, small.height * OUTPUT_SCALE);
    }

    #[test]
    fn full_selection_in_one_column_is_too_tall() {
        let items: Vec<Skin> = (0..200).map(|i| skin(&format!("s{i}"), 0, "")).collect();
        let single = LayoutParams {
            columns: 1,
            border: 0,
            ..LayoutParams::default()
        };
        assert!(matches!(
            plan(&items, None, &single, OUTPUT_SCALE),
            Err(StoreError::Validation(_))
        ));

        // The default grid still fits the whole selection, hero included.
        let banner = skin("banner", 0, "");
        let fits = plan(&items, Some(&banner), &LayoutParams::default(), OUTPUT_SCALE).unwrap();
        assert!(fits.height <= MAX_DISPLAY_HEIGHT * OUTPUT_SCALE);
        assert_eq!(fits.cells.len(), 200);
    }

    #[test]
    fn colours_and_params_validate() {
        assert_eq!(parse_color("#ff8000").unwrap(), [255, 128, 0]);
        assert_eq!(parse_color("000000").unwrap(), [0, 0, 0]);
        assert!(parse_color("#fff").is_err());
        assert!(parse_color("#zzzzzz").is_err());

        let bad = LayoutParams {
            columns: 0,
            ..LayoutParams::default()
        };
        assert!(matches!(bad.validate(), Err(StoreError::Validation(_))));
    }
}
