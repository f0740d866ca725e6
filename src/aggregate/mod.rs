//! The aggregation engine.
//!
//! Pure computations over the deployment records and the block master: the
//! provider table, block-level provider counts per speed tier, the top-coded
//! area table and the population-weighted tract/county roll-ups. Nothing in
//! here touches the queues or the database; file I/O is limited to reading
//! inputs and writing the resulting CSVs.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::protocol::Tier;

mod area;
mod blocks;
mod cache;
mod fbd;
mod numprov;
mod provider;
mod rollup;

pub use area::{area_table, merge_area_tables, top_code, write_area_table, AreaRow, AREA_TABLE_COLUMNS};
pub use blocks::{BlockMaster, BlockRecord};
pub use cache::PreparedInputs;
pub use fbd::{collapse_max, read_fbd, split_county, CountyIndex, FbdColumns, FbdRecord};
pub use numprov::{block_numprov, BlockNumprov, NumprovRow};
pub use provider::{provider_table, write_provider_table, ProviderRow, Thresholds};
pub use rollup::{
    read_numprov_counts, roll_up, round_one, weighted_average, RollUp, RollUpLevel, RollUpRow,
};

/// A paired download/upload threshold and its label, e.g. `25_3`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedTier {
    pub label: String,
    pub down: f64,
    pub up: f64,
}

impl SpeedTier {
    pub fn new(label: impl Into<String>, down: f64, up: f64) -> Self {
        Self {
            label: label.into(),
            down,
            up,
        }
    }

    /// Whether a record advertising `down`/`up` meets both thresholds.
    pub fn admits(&self, down: f64, up: f64) -> bool {
        down >= self.down && up >= self.up
    }

    /// The `speed` value written to the area table: the download part of the
    /// label, with the sub-megabit `200` tier written as `0.2`.
    pub fn area_speed(&self) -> String {
        match self.label.split('_').next() {
            Some("200") => "0.2".into(),
            Some(download) => download.into(),
            None => self.label.clone(),
        }
    }
}

impl From<&SpeedTier> for Tier {
    fn from(tier: &SpeedTier) -> Self {
        Tier {
            label: tier.label.clone(),
            down: tier.down,
            up: tier.up,
        }
    }
}

impl From<Tier> for SpeedTier {
    fn from(tier: Tier) -> Self {
        SpeedTier::new(tier.label, tier.down, tier.up)
    }
}

/// One output column of the technology taxonomy: a combination of buckets
/// such as `acf`, with the union of their technology codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TechCombo {
    pub name: String,
    /// Bit `i` is set when the combination contains bucket `i` of the
    /// taxonomy.
    pub mask: u64,
}

/// Upper bound on `techlist`. Every combination of buckets becomes a column
/// and each bucket takes one bit of a `u64` mask.
pub const MAX_TECH_BUCKETS: usize = 16;

/// Technology codes bucketed into single-letter categories, and the powerset
/// of those categories that makes up the block-level column set.
#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    buckets: Vec<(String, Vec<u16>)>,
    combos: Vec<TechCombo>,
}

impl Taxonomy {
    /// Buckets are taken in `techlist` order; codes come from `tech_dict`.
    /// Buckets missing from `tech_dict` contribute no codes.
    pub fn new(tech_dict: &BTreeMap<String, Vec<u16>>, techlist: &[String]) -> Self {
        let buckets: Vec<(String, Vec<u16>)> = techlist
            .iter()
            .map(|bucket| (bucket.clone(), tech_dict.get(bucket).cloned().unwrap_or_default()))
            .collect();

        // largest combinations first, each size in lexical bucket order
        let mut combos = Vec::new();
        for size in (1..=buckets.len()).rev() {
            for members in (0..buckets.len()).combinations(size) {
                combos.push(TechCombo {
                    name: members.iter().map(|&i| buckets[i].0.as_str()).collect(),
                    mask: members.iter().fold(0, |mask, &i| mask | 1 << i),
                });
            }
        }
        Self { buckets, combos }
    }

    pub fn combos(&self) -> &[TechCombo] {
        &self.combos
    }

    pub fn column_names(&self) -> Vec<String> {
        self.combos.iter().map(|combo| combo.name.clone()).collect()
    }

    /// The buckets a technology code belongs to, as a bit mask.
    pub fn mask_of(&self, tech: u16) -> u64 {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, (_, codes))| codes.contains(&tech))
            .fold(0, |mask, (i, _)| mask | 1 << i)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::defaults;

    #[test]
    fn powerset_is_ordered_from_largest_combination() {
        let taxonomy = Taxonomy::new(&defaults::tech_dict(), &defaults::techlist());
        let names = taxonomy.column_names();
        assert_eq!(names.len(), 63);
        assert_eq!(names[0], "acfosw");
        assert_eq!(&names[1..7], ["acfos", "acfow", "acfsw", "acosw", "afosw", "cfosw"]);
        assert_eq!(&names[57..], ["a", "c", "f", "o", "s", "w"]);

        let sizes: Vec<usize> = names.iter().map(String::len).collect();
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn tech_codes_map_to_their_bucket() {
        let taxonomy = Taxonomy::new(&defaults::tech_dict(), &defaults::techlist());
        assert_eq!(taxonomy.mask_of(11), 0b000001);
        assert_eq!(taxonomy.mask_of(42), 0b000010);
        assert_eq!(taxonomy.mask_of(0), 0b001000);
        assert_eq!(taxonomy.mask_of(70), 0b100000);
        assert_eq!(taxonomy.mask_of(99), 0);
        let cable_or_fiber = taxonomy.combos().iter().find(|c| c.name == "cf").unwrap();
        assert_eq!(cable_or_fiber.mask, 0b000110);
    }

    #[test]
    fn area_speed_uses_the_download_part() {
        assert_eq!(SpeedTier::new("200", 0.2, 0.2).area_speed(), "0.2");
        assert_eq!(SpeedTier::new("25_3", 25., 3.).area_speed(), "25");
        assert_eq!(SpeedTier::new("1000_100", 1000., 100.).area_speed(), "1000");
    }
}
