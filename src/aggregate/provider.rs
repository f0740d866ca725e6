use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use super::{blocks::BlockMaster, fbd::FbdRecord};
use crate::error::Result;

/// Named speed thresholds for one direction, e.g. `d_1..d_8`.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub columns: Vec<String>,
    pub values: Vec<f64>,
}

impl Thresholds {
    pub fn new(columns: Vec<String>, values: Vec<f64>) -> Self {
        Self { columns, values }
    }

    fn accumulate(&self, sums: &mut [u64], speed: f64, pop: u64) {
        for (sum, threshold) in sums.iter_mut().zip(&self.values) {
            if speed >= *threshold {
                *sum += pop;
            }
        }
    }
}

/// Population a holding company serves at or above each threshold with one
/// technology, technology bucket, or (`all`) any technology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRow {
    pub hoconum: String,
    pub tech: String,
    pub down: Vec<u64>,
    pub up: Vec<u64>,
}

/// Builds the provider table.
///
/// Rows come in three groups: `all` per holding company, then one group per
/// `tech_stack` bucket (labelled with the bucket's name), then one row per
/// holding company and raw technology code. Within a block, a company's
/// speeds are the maxima over the records being grouped; blocks missing
/// from the block master count with zero population.
pub fn provider_table(
    records: &[FbdRecord],
    blocks: &BlockMaster,
    tech_dict: &BTreeMap<String, Vec<u16>>,
    tech_stack: &[(String, String)],
    down: &Thresholds,
    up: &Thresholds,
) -> Vec<ProviderRow> {
    let population = blocks.populations();
    let pop_of = |block: &str| population.get(block).copied().unwrap_or(0);

    let mut rows = grouped(records, |_| true, "all", &pop_of, down, up);
    for (bucket, name) in tech_stack {
        let codes: BTreeSet<u16> = tech_dict.get(bucket).into_iter().flatten().copied().collect();
        rows.extend(grouped(
            records,
            |tech| codes.contains(&tech),
            name,
            &pop_of,
            down,
            up,
        ));
    }

    // per (company, technology, block) maxima, then population sums
    let mut best: BTreeMap<(&str, u16, &str), (f64, f64)> = BTreeMap::new();
    for record in records {
        best.entry((record.hoconum.as_str(), record.tech, record.block.as_str()))
            .and_modify(|(d, u)| {
                *d = d.max(record.down);
                *u = u.max(record.up);
            })
            .or_insert((record.down, record.up));
    }
    let mut raw: BTreeMap<(&str, u16), (Vec<u64>, Vec<u64>)> = BTreeMap::new();
    for ((hoconum, tech, block), (max_down, max_up)) in best {
        let pop = pop_of(block);
        let (d, u) = raw
            .entry((hoconum, tech))
            .or_insert_with(|| (vec![0; down.values.len()], vec![0; up.values.len()]));
        down.accumulate(d, max_down, pop);
        up.accumulate(u, max_up, pop);
    }
    rows.extend(raw.into_iter().map(|((hoconum, tech), (d, u))| ProviderRow {
        hoconum: hoconum.to_string(),
        tech: tech.to_string(),
        down: d,
        up: u,
    }));
    rows
}

/// Rows for one group of technologies: per (block, company) maxima, then
/// population sums per company.
fn grouped(
    records: &[FbdRecord],
    include: impl Fn(u16) -> bool,
    label: &str,
    pop_of: &impl Fn(&str) -> u64,
    down: &Thresholds,
    up: &Thresholds,
) -> Vec<ProviderRow> {
    let mut best: BTreeMap<(&str, &str), (f64, f64)> = BTreeMap::new();
    for record in records.iter().filter(|r| include(r.tech)) {
        best.entry((record.hoconum.as_str(), record.block.as_str()))
            .and_modify(|(d, u)| {
                *d = d.max(record.down);
                *u = u.max(record.up);
            })
            .or_insert((record.down, record.up));
    }

    let mut sums: BTreeMap<&str, (Vec<u64>, Vec<u64>)> = BTreeMap::new();
    for ((hoconum, block), (max_down, max_up)) in best {
        let pop = pop_of(block);
        let (d, u) = sums
            .entry(hoconum)
            .or_insert_with(|| (vec![0; down.values.len()], vec![0; up.values.len()]));
        down.accumulate(d, max_down, pop);
        up.accumulate(u, max_up, pop);
    }
    sums.into_iter()
        .map(|(hoconum, (d, u))| ProviderRow {
            hoconum: hoconum.to_string(),
            tech: label.to_string(),
            down: d,
            up: u,
        })
        .collect()
}

/// Writes `hoconum, tech, <down columns>, <up columns>`.
pub fn write_provider_table(
    rows: &[ProviderRow],
    down: &Thresholds,
    up: &Thresholds,
    path: &Path,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let header = ["hoconum", "tech"]
        .into_iter()
        .chain(down.columns.iter().map(String::as_str))
        .chain(up.columns.iter().map(String::as_str));
    writer.write_record(header)?;
    for row in rows {
        let record = [row.hoconum.clone(), row.tech.clone()]
            .into_iter()
            .chain(row.down.iter().chain(&row.up).map(u64::to_string));
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}
