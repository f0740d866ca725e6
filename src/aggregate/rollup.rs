use std::{collections::BTreeMap, path::Path};

use hashbrown::HashMap;

use super::blocks::BlockMaster;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollUpLevel {
    Tract,
    County,
}

impl RollUpLevel {
    /// Leading geoid characters that identify the unit.
    pub fn prefix_len(self) -> usize {
        match self {
            RollUpLevel::Tract => 11,
            RollUpLevel::County => 5,
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            RollUpLevel::Tract => "tract_id",
            RollUpLevel::County => "county_id",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RollUpLevel::Tract => "tract",
            RollUpLevel::County => "county",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollUpRow {
    pub id: String,
    /// Rounded weighted averages, `None` for units without population.
    pub values: Vec<Option<f64>>,
    pub populated: bool,
}

/// Population-weighted averages of block-level columns per tract or county.
#[derive(Debug, Clone, PartialEq)]
pub struct RollUp {
    pub level: RollUpLevel,
    pub columns: Vec<String>,
    pub rows: Vec<RollUpRow>,
}

/// Reads a zero-filled block numprov file: column names after `geoid` and
/// `h2only_undev`, and the values of each block.
pub fn read_numprov_counts(path: &Path) -> Result<(Vec<String>, HashMap<String, Vec<f64>>)> {
    if !path.exists() {
        Err(Error::MissingInput(path.to_path_buf()))?
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if headers.len() < 3 || headers.get(1) != Some("h2only_undev") {
        Err(Error::UnexpectedColumns(path.to_path_buf()))?
    }
    let columns: Vec<String> = headers.iter().skip(2).map(String::from).collect();

    let mut counts = HashMap::new();
    for row in reader.records() {
        let row = row?;
        let values = row
            .iter()
            .skip(2)
            .zip(&columns)
            .map(|(value, column)| match value.trim() {
                "" => Ok(0.),
                value => value.parse::<f64>().map_err(|_| Error::MalformedValue {
                    column: column.clone(),
                    value: value.to_string(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        counts.insert(row.get(0).unwrap_or("").to_string(), values);
    }
    Ok((columns, counts))
}

/// `sum(pop * value) / sum(pop)`, or `None` when nobody lives there.
pub fn weighted_average(blocks: impl IntoIterator<Item = (u64, f64)>) -> Option<f64> {
    let (numerator, population) = blocks
        .into_iter()
        .fold((0., 0u64), |(num, pop), (p, value)| (num + p as f64 * value, pop + p));
    (population > 0).then(|| numerator / population as f64)
}

/// One decimal place, ties to even.
pub fn round_one(value: f64) -> f64 {
    (value * 10.).round_ties_even() / 10.
}

/// Rolls block values up to `level`. Every unit that has a block in the
/// block master gets a row; rows are sorted by unit id.
pub fn roll_up(
    level: RollUpLevel,
    columns: &[String],
    counts: &HashMap<String, Vec<f64>>,
    blocks: &BlockMaster,
) -> RollUp {
    // unit -> (population, value row) of each of its blocks
    let mut units: BTreeMap<&str, Vec<(u64, Option<&[f64]>)>> = BTreeMap::new();
    for block in &blocks.blocks {
        let Some(id) = block.geoid.get(..level.prefix_len()) else {
            continue;
        };
        units
            .entry(id)
            .or_default()
            .push((block.pop, counts.get(&block.geoid).map(Vec::as_slice)));
    }

    let rows = units
        .into_iter()
        .map(|(id, members)| RollUpRow {
            id: id.to_string(),
            values: (0..columns.len())
                .map(|column| {
                    let weighted = members.iter().map(|(pop, values)| {
                        (*pop, values.and_then(|v| v.get(column)).copied().unwrap_or(0.))
                    });
                    weighted_average(weighted).map(round_one)
                })
                .collect(),
            populated: members.iter().any(|(pop, _)| *pop > 0),
        })
        .collect();
    RollUp {
        level,
        columns: columns.to_vec(),
        rows,
    }
}

impl RollUp {
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let header = [self.level.id_column()]
            .into_iter()
            .chain(self.columns.iter().map(String::as_str))
            .chain(["is_populated"]);
        writer.write_record(header)?;
        for row in &self.rows {
            let record = [row.id.clone()]
                .into_iter()
                .chain(row.values.iter().map(|value| match value {
                    Some(v) => format!("{v:.1}"),
                    None => String::new(),
                }))
                .chain([if row.populated { "True" } else { "False" }.to_string()]);
            writer.write_record(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
