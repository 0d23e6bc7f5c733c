//! Collage composition: ordering, grid layout and rasterisation.

pub mod layout;
pub mod render;

use serde::{Deserialize, Serialize};

pub use layout::{CompositionPlan, LayoutParams, SortMode, VisualFilter};

/// What the customer picked and how it should look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollageRequest {
    /// Catalog ids in selection order.
    pub items: Vec<String>,
    #[serde(default)]
    pub layout: LayoutParams,
}
