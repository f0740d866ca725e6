use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use hashbrown::HashMap;

use super::{blocks::BlockMaster, numprov::BlockNumprov};
use crate::{
    error::{Error, Result},
    layout::remove_if_exists,
};

pub const AREA_TABLE_COLUMNS: [&str; 10] = [
    "type",
    "id",
    "tech",
    "urban_rural",
    "tribal_non",
    "speed",
    "has_0",
    "has_1",
    "has_2",
    "has_3more",
];

/// Population of one geography unit, split by how many providers
/// (0, 1, 2, 3 or more) serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaRow {
    pub geography: String,
    pub id: String,
    pub tech: String,
    pub urban_rural: String,
    pub tribal_non: String,
    pub speed: String,
    pub has: [u64; 4],
}

/// Provider count as an area-table class. Absent counts are zero, anything
/// above three is three.
pub fn top_code(count: Option<u32>) -> u8 {
    count.unwrap_or(0).min(3) as u8
}

/// Builds the area table of one speed tier.
///
/// For every geography in `geog_dict` (block master column, type name) and
/// every technology combination, sums block population per
/// (id, urban_rural, tribal_non) into the four provider classes. Blocks
/// without a value for any of the three keys are left out of that
/// geography.
pub fn area_table(
    numprov: &BlockNumprov,
    blocks: &BlockMaster,
    geog_dict: &[(String, String)],
) -> Result<Vec<AreaRow>> {
    let column = |name: &str| {
        blocks
            .attribute_index(name)
            .ok_or_else(|| Error::InvalidConfig(format!("block master has no {name} column")))
    };
    let urban_rural = column("urban_rural")?;
    let tribal_non = column("tribal_non")?;
    let by_geoid: HashMap<&str, &[Option<u32>]> = numprov
        .rows
        .iter()
        .map(|row| (row.geoid.as_str(), row.counts.as_slice()))
        .collect();
    let no_providers = vec![None; numprov.columns.len()];
    let speed = numprov.tier.area_speed();

    let mut rows = Vec::new();
    for (geog, kind) in geog_dict {
        let geog = column(geog)?;
        let mut sums: BTreeMap<(&str, &str, &str), Vec<[u64; 4]>> = BTreeMap::new();
        for block in &blocks.blocks {
            let (Some(id), Some(ur), Some(tn)) = (
                block.attribute(geog),
                block.attribute(urban_rural),
                block.attribute(tribal_non),
            ) else {
                continue;
            };
            let counts = by_geoid
                .get(block.geoid.as_str())
                .copied()
                .unwrap_or(no_providers.as_slice());
            let unit = sums
                .entry((id, ur, tn))
                .or_insert_with(|| vec![[0; 4]; counts.len()]);
            for (classes, count) in unit.iter_mut().zip(counts) {
                classes[top_code(*count) as usize] += block.pop;
            }
        }
        for (combo, tech) in numprov.columns.iter().enumerate() {
            rows.extend(sums.iter().map(|((id, ur, tn), unit)| AreaRow {
                geography: kind.clone(),
                id: id.to_string(),
                tech: tech.clone(),
                urban_rural: ur.to_string(),
                tribal_non: tn.to_string(),
                speed: speed.clone(),
                has: unit[combo],
            }));
        }
    }
    Ok(rows)
}

pub fn write_area_table(rows: &[AreaRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(AREA_TABLE_COLUMNS)?;
    for row in rows {
        let [h0, h1, h2, h3] = row.has.map(|n| n.to_string());
        writer.write_record([
            row.geography.as_str(),
            row.id.as_str(),
            row.tech.as_str(),
            row.urban_rural.as_str(),
            row.tribal_non.as_str(),
            row.speed.as_str(),
            h0.as_str(),
            h1.as_str(),
            h2.as_str(),
            h3.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Concatenates per-speed area tables, in the given order, into `out` and
/// removes the parts. Returns the number of rows written.
pub fn merge_area_tables(parts: &[PathBuf], out: &Path) -> Result<usize> {
    if let Some(missing) = parts.iter().find(|part| !part.exists()) {
        Err(Error::MissingInput(missing.clone()))?
    }
    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record(AREA_TABLE_COLUMNS)?;
    let mut written = 0;
    for part in parts {
        let mut reader = csv::Reader::from_path(part)?;
        if reader.headers()?.iter().ne(AREA_TABLE_COLUMNS) {
            Err(Error::UnexpectedColumns(part.clone()))?
        }
        for record in reader.records() {
            writer.write_record(&record?)?;
            written += 1;
        }
    }
    writer.flush()?;
    for part in parts {
        remove_if_exists(part)?;
    }
    Ok(written)
}
