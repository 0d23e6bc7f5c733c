//! Collage pricing and the selection cap.

use serde::Serialize;
use tracing::warn;

/// `(max items, price)` steps; anything above the last step costs [`TOP_PRICE`].
const PRICE_BREAKPOINTS: [(usize, i64); 5] = [(50, 20), (80, 30), (100, 40), (120, 50), (150, 80)];
const TOP_PRICE: i64 = 100;

/// Price in currency units for a collage of `count` items.
pub fn price_for(count: usize) -> i64 {
    PRICE_BREAKPOINTS
        .iter()
        .find(|(max, _)| count <= *max)
        .map(|(_, price)| *price)
        .unwrap_or(TOP_PRICE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionWarning {
    /// The selection was cut down to the cap.
    SelectionLimitExceeded { requested: usize, cap: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub ids: Vec<String>,
    pub warning: Option<SelectionWarning>,
}

/// Apply the hard item cap, keeping the first `cap` ids in selection order.
pub fn cap_selection(mut ids: Vec<String>, cap: usize) -> Selection {
    if ids.len() <= cap {
        return Selection { ids, warning: None };
    }

    let requested = ids.len();
    ids.truncate(cap);
    warn!("Collage selection of {requested} items truncated to {cap}");
    Selection {
        ids,
        warning: Some(SelectionWarning::SelectionLimitExceeded { requested, cap }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("skin-{i}")).collect()
    }

    #[test]
    fn breakpoints_are_exact() {
        assert_eq!(price_for(0), 20);
        assert_eq!(price_for(50), 20);
        assert_eq!(price_for(51), 30);
        assert_eq!(price_for(80), 30);
        assert_eq!(price_for(81), 40);
        assert_eq!(price_for(100), 40);
        assert_eq!(price_for(101), 50);
        assert_eq!(price_for(120), 50);
        assert_eq!(price_for(121), 80);
        assert_eq!(price_for(150), 80);
        assert_eq!(price_for(151), 100);
        assert_eq!(price_for(10_000), 100);
    }

    #[test]
    fn price_never_decreases() {
        let mut last = price_for(0);
        for n in 1..=400 {
            let p = price_for(n);
            assert!(p >= last, "price dropped at {n}");
            last = p;
        }
    }

    #[test]
    fn cap_is_inclusive() {
        let selection = cap_selection(ids(200), 200);
        assert_eq!(selection.ids.len(), 200);
        assert_eq!(selection.warning, None);
    }

    #[test]
    fn one_over_cap_truncates_with_single_warning() {
        let selection = cap_selection(ids(201), 200);
        assert_eq!(selection.ids, ids(200));
        assert_eq!(
            selection.warning,
            Some(SelectionWarning::SelectionLimitExceeded {
                requested: 201,
                cap: 200
            })
        );
    }
}
