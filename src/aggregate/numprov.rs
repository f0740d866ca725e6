use std::{collections::BTreeSet, path::Path};

use hashbrown::HashMap;

use super::{blocks::BlockMaster, fbd::FbdRecord, SpeedTier, Taxonomy};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct NumprovRow {
    pub geoid: String,
    pub h2only_undev: Option<i64>,
    /// Distinct holding companies per technology combination, `None` where
    /// no company qualifies.
    pub counts: Vec<Option<u32>>,
}

/// Provider counts per block for one speed tier. This is the canonical,
/// null-bearing table; the zero-filled file is derived from it on write.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockNumprov {
    pub geoid_column: String,
    pub tier: SpeedTier,
    /// Technology combination names, in column order.
    pub columns: Vec<String>,
    pub rows: Vec<NumprovRow>,
}

/// Counts, for every block and technology combination, the holding
/// companies whose maximum advertised speeds meet `tier`.
///
/// `records` are expected to be collapsed with
/// [`collapse_max`](super::collapse_max) already. Rows cover every block of
/// the block master plus any block that only appears in the deployment
/// data, sorted by geoid.
pub fn block_numprov(
    records: &[FbdRecord],
    blocks: &BlockMaster,
    taxonomy: &Taxonomy,
    tier: &SpeedTier,
    geoid_column: &str,
) -> BlockNumprov {
    // block -> holding company -> union of bucket masks it qualifies with
    let mut qualifying: HashMap<&str, HashMap<&str, u64>> = HashMap::new();
    let mut geoids: BTreeSet<&str> = blocks.blocks.iter().map(|b| b.geoid.as_str()).collect();
    for record in records {
        geoids.insert(record.block.as_str());
        if !tier.admits(record.down, record.up) {
            continue;
        }
        let mask = taxonomy.mask_of(record.tech);
        if mask != 0 {
            *qualifying
                .entry(record.block.as_str())
                .or_default()
                .entry(record.hoconum.as_str())
                .or_default() |= mask;
        }
    }

    let h2only: HashMap<&str, Option<i64>> = blocks
        .blocks
        .iter()
        .map(|b| (b.geoid.as_str(), b.h2only_undev))
        .collect();
    let combos = taxonomy.combos();
    let rows = geoids
        .into_iter()
        .map(|geoid| {
            let counts = match qualifying.get(geoid) {
                Some(companies) => combos
                    .iter()
                    .map(|combo| {
                        let n = companies.values().filter(|m| *m & combo.mask != 0).count();
                        (n > 0).then_some(n as u32)
                    })
                    .collect(),
                None => vec![None; combos.len()],
            };
            NumprovRow {
                geoid: geoid.to_string(),
                h2only_undev: h2only.get(geoid).copied().flatten(),
                counts,
            }
        })
        .collect();

    BlockNumprov {
        geoid_column: geoid_column.to_string(),
        tier: tier.clone(),
        columns: taxonomy.column_names(),
        rows,
    }
}

impl BlockNumprov {
    /// `geoid<yy>, h2only_undev, <combo>_<speed>...`
    pub fn headers(&self) -> Vec<String> {
        [self.geoid_column.clone(), "h2only_undev".to_string()]
            .into_iter()
            .chain(self.columns.iter().map(|c| format!("{c}_{}", self.tier.label)))
            .collect()
    }

    /// Writes absent counts, and a zero or absent `h2only_undev`, as empty
    /// cells.
    pub fn write_null(&self, path: &Path) -> Result<()> {
        self.write(path, |value| match value {
            Some(v) if v != 0 => v.to_string(),
            _ => String::new(),
        })
    }

    /// Writes every absent value as `0`.
    pub fn write_zero(&self, path: &Path) -> Result<()> {
        self.write(path, |value| value.unwrap_or(0).to_string())
    }

    fn write(&self, path: &Path, cell: impl Fn(Option<i64>) -> String) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.headers())?;
        for row in &self.rows {
            let mut record = Vec::with_capacity(row.counts.len() + 2);
            record.push(row.geoid.clone());
            record.push(cell(row.h2only_undev));
            record.extend(row.counts.iter().map(|c| cell(c.map(i64::from))));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::aggregate::{collapse_max, BlockRecord};

    fn record(block: &str, hoconum: &str, tech: u16, down: f64, up: f64) -> FbdRecord {
        FbdRecord {
            block: block.into(),
            hoconum: hoconum.into(),
            tech,
            down,
            up,
        }
    }

    fn block(geoid: &str, pop: u64, h2only_undev: Option<i64>) -> BlockRecord {
        BlockRecord {
            geoid: geoid.into(),
            pop,
            h2only_undev,
            attributes: vec![],
        }
    }

    /// Two buckets keep the column set small: `ac`, `a`, `c`.
    fn small_taxonomy() -> Taxonomy {
        let tech_dict: BTreeMap<String, Vec<u16>> =
            [("a".to_string(), vec![10]), ("c".to_string(), vec![40])].into();
        Taxonomy::new(&tech_dict, &["a".to_string(), "c".to_string()])
    }

    fn count(numprov: &BlockNumprov, geoid: &str, column: &str) -> Option<u32> {
        let row = numprov.rows.iter().find(|r| r.geoid == geoid).unwrap();
        let index = numprov.columns.iter().position(|c| c == column).unwrap();
        row.counts[index]
    }

    #[test]
    fn counts_distinct_companies_meeting_both_thresholds() {
        let records = collapse_max(vec![
            record("b1", "h1", 10, 25., 3.),
            record("b1", "h1", 40, 100., 10.),
            record("b1", "h2", 40, 25., 1.),
            record("b1", "h3", 10, 50., 5.),
            record("b2", "h1", 10, 4., 1.),
        ]);
        let master = BlockMaster {
            attribute_names: vec![],
            blocks: vec![block("b3", 10, Some(1)), block("b1", 5, Some(0))],
        };
        let tier = SpeedTier::new("25_3", 25., 3.);
        let numprov = block_numprov(&records, &master, &small_taxonomy(), &tier, "geoid10");

        assert_eq!(numprov.columns, ["ac", "a", "c"]);
        let geoids: Vec<&str> = numprov.rows.iter().map(|r| r.geoid.as_str()).collect();
        assert_eq!(geoids, ["b1", "b2", "b3"]);
        // h1 qualifies through both buckets but counts once
        assert_eq!(count(&numprov, "b1", "ac"), Some(2));
        assert_eq!(count(&numprov, "b1", "a"), Some(2));
        assert_eq!(count(&numprov, "b1", "c"), Some(1));
        // b2 only has a record below the tier
        assert_eq!(count(&numprov, "b2", "ac"), None);
        assert_eq!(numprov.rows[2].h2only_undev, Some(1));
        assert_eq!(numprov.rows[1].h2only_undev, None);
        assert_eq!(numprov.headers()[..3], ["geoid10", "h2only_undev", "ac_25_3"]);
    }

    #[test]
    fn null_and_zero_files_differ_only_at_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![record("b1", "h1", 10, 25., 3.)];
        let master = BlockMaster {
            attribute_names: vec![],
            blocks: vec![block("b1", 5, Some(0)), block("b2", 3, Some(1))],
        };
        let tier = SpeedTier::new("25_3", 25., 3.);
        let numprov = block_numprov(&records, &master, &small_taxonomy(), &tier, "geoid10");
        let null_path = dir.path().join("null.csv");
        let zero_path = dir.path().join("zero.csv");
        numprov.write_null(&null_path).unwrap();
        numprov.write_zero(&zero_path).unwrap();

        let read = |path: &Path| -> Vec<Vec<String>> {
            csv::Reader::from_path(path)
                .unwrap()
                .records()
                .map(|r| r.unwrap().iter().map(String::from).collect())
                .collect()
        };
        let (null, zero) = (read(&null_path), read(&zero_path));
        assert_eq!(null[0], ["b1", "", "1", "1", ""]);
        assert_eq!(zero[0], ["b1", "0", "1", "1", "0"]);
        assert_eq!(null[1], ["b2", "1", "", "", ""]);
        assert_eq!(zero[1], ["b2", "1", "0", "0", "0"]);
        for (n, z) in null.iter().zip(&zero) {
            for (a, b) in n.iter().zip(z) {
                assert!(a == b || (a.is_empty() && b == "0"));
            }
        }
        // the canonical table still carries its nulls
        assert_eq!(numprov.rows[1].counts, vec![None, None, None]);
    }

    proptest! {
        #[test]
        fn counts_never_increase_with_the_speed_tier(
            raw in prop::collection::vec(
                (0usize..4, 0usize..5, prop::sample::select(vec![10u16, 40]), 0f64..200., 0f64..30.),
                1..40,
            )
        ) {
            let records = collapse_max(raw.into_iter().map(|(b, h, tech, down, up)| {
                record(&format!("b{b}"), &format!("h{h}"), tech, down, up)
            }));
            let master = BlockMaster::default();
            let taxonomy = small_taxonomy();
            let tiers = [
                SpeedTier::new("4_1", 4., 1.),
                SpeedTier::new("25_3", 25., 3.),
                SpeedTier::new("100_10", 100., 10.),
            ];
            let tables: Vec<BlockNumprov> = tiers
                .iter()
                .map(|tier| block_numprov(&records, &master, &taxonomy, tier, "geoid10"))
                .collect();
            for pair in tables.windows(2) {
                for (low, high) in pair[0].rows.iter().zip(&pair[1].rows) {
                    prop_assert_eq!(&low.geoid, &high.geoid);
                    for (l, h) in low.counts.iter().zip(&high.counts) {
                        prop_assert!(l.unwrap_or(0) >= h.unwrap_or(0));
                    }
                }
            }
        }
    }
}
