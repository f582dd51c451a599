//! Legend entries for the classes present in a segmentation.

use std::collections::BTreeSet;

use image::Rgb;

use super::palette::Palette;
use super::segmentation::ClassMap;

/// One renderable legend item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegendEntry {
    pub class_id: usize,
    pub color: Rgb<u8>,
    pub label: &'static str,
}

/// Distinct class ids present in `class_map`, ascending.
#[must_use]
pub fn distinct_classes(class_map: &ClassMap) -> BTreeSet<usize> {
    class_map.iter().copied().collect()
}

/// Turn class ids into legend entries, ascending by id.
///
/// Duplicates collapse to one entry; ids without both a color and a label are
/// skipped.
pub fn build_legend<I>(class_ids: I, palette: &Palette) -> Vec<LegendEntry>
where
    I: IntoIterator<Item = usize>,
{
    class_ids
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter_map(|class_id| {
            palette.entry(class_id).map(|(color, label)| LegendEntry {
                class_id,
                color,
                label,
            })
        })
        .collect()
}

/// Legend for every class observed in `class_map`.
#[must_use]
pub fn legend_for(class_map: &ClassMap, palette: &Palette) -> Vec<LegendEntry> {
    build_legend(distinct_classes(class_map), palette)
}
