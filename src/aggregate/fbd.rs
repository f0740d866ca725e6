use std::{
    collections::BTreeMap,
    path::Path,
};

use csv::StringRecord;
use hashbrown::HashMap;
use rkyv::Archive;

use crate::error::{Error, Result};

const CANONICAL: [&str; 6] = ["BlockCode", "Consumer", "HocoNum", "TechCode", "MaxAdDown", "MaxAdUp"];

/// One consumer deployment record: a holding company offering a technology
/// at advertised speeds in a block.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct FbdRecord {
    pub block: String,
    pub hoconum: String,
    pub tech: u16,
    pub down: f64,
    pub up: f64,
}

impl FbdRecord {
    pub fn county(&self) -> &str {
        self.block.get(..5).unwrap_or(&self.block)
    }
}

/// Positions of the six deployment columns in a file's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FbdColumns {
    block: usize,
    consumer: usize,
    hoconum: usize,
    tech: usize,
    down: usize,
    up: usize,
}

impl FbdColumns {
    /// Accepts either the canonical header names or the long published names
    /// listed in `rename` (published name -> canonical name).
    pub fn resolve(
        headers: &StringRecord,
        rename: &BTreeMap<String, String>,
        path: &Path,
    ) -> Result<Self> {
        let position = |name: &str| headers.iter().position(|h| h == name);
        let published = |canonical: &str| {
            rename
                .iter()
                .find(|(_, to)| to.as_str() == canonical)
                .and_then(|(from, _)| position(from))
        };

        let found: Option<Vec<usize>> = CANONICAL.iter().map(|name| position(name)).collect();
        let found = match found {
            Some(found) => found,
            None => CANONICAL
                .iter()
                .map(|name| published(name))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::UnexpectedColumns(path.to_path_buf()))?,
        };
        Ok(Self {
            block: found[0],
            consumer: found[1],
            hoconum: found[2],
            tech: found[3],
            down: found[4],
            up: found[5],
        })
    }

    fn field<'r>(&self, record: &'r StringRecord, index: usize) -> &'r str {
        record.get(index).unwrap_or("").trim()
    }

    fn is_consumer(&self, record: &StringRecord) -> Result<bool> {
        Ok(parse_number(CANONICAL[1], self.field(record, self.consumer))? == 1.)
    }

    fn record(&self, record: &StringRecord) -> Result<FbdRecord> {
        let tech = self.field(record, self.tech);
        Ok(FbdRecord {
            block: self.field(record, self.block).to_string(),
            hoconum: self.field(record, self.hoconum).to_string(),
            tech: tech.parse().map_err(|_| malformed(CANONICAL[3], tech))?,
            down: parse_number(CANONICAL[4], self.field(record, self.down))?,
            up: parse_number(CANONICAL[5], self.field(record, self.up))?,
        })
    }
}

fn parse_number(column: &str, value: &str) -> Result<f64> {
    value.parse().map_err(|_| malformed(column, value))
}

fn malformed(column: &str, value: &str) -> Error {
    Error::MalformedValue {
        column: column.to_string(),
        value: value.to_string(),
    }
}

/// Reads the consumer records of a deployment file.
pub fn read_fbd(path: &Path, rename: &BTreeMap<String, String>) -> Result<Vec<FbdRecord>> {
    if !path.exists() {
        Err(Error::MissingInput(path.to_path_buf()))?
    }
    let mut reader = csv::Reader::from_path(path)?;
    let columns = FbdColumns::resolve(reader.headers()?, rename, path)?;
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        if columns.is_consumer(&row)? {
            records.push(columns.record(&row)?);
        }
    }
    Ok(records)
}

/// Collapses duplicate (block, holding company, technology) records to one,
/// keeping the maximum advertised download and upload speed of each.
/// The result is sorted by that key.
pub fn collapse_max(records: impl IntoIterator<Item = FbdRecord>) -> Vec<FbdRecord> {
    let mut best: BTreeMap<(String, String, u16), (f64, f64)> = BTreeMap::new();
    for record in records {
        best.entry((record.block, record.hoconum, record.tech))
            .and_modify(|(down, up)| {
                *down = down.max(record.down);
                *up = up.max(record.up);
            })
            .or_insert((record.down, record.up));
    }
    best.into_iter()
        .map(|((block, hoconum, tech), (down, up))| FbdRecord {
            block,
            hoconum,
            tech,
            down,
            up,
        })
        .collect()
}

/// Row positions of every county's records, built once per pool so a split
/// does not scan the whole deployment file.
#[derive(Debug, Default)]
pub struct CountyIndex {
    rows: HashMap<String, Vec<usize>>,
}

impl CountyIndex {
    pub fn new(records: &[FbdRecord]) -> Self {
        let mut rows: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            rows.entry(record.county().to_string()).or_default().push(i);
        }
        Self { rows }
    }

    pub fn counties(&self) -> usize {
        self.rows.len()
    }

    /// The records of `county`, in file order.
    pub fn records<'r>(
        &'r self,
        records: &'r [FbdRecord],
        county: &str,
    ) -> impl Iterator<Item = &'r FbdRecord> + 'r {
        self.rows
            .get(county)
            .into_iter()
            .flatten()
            .map(move |&i| &records[i])
    }
}

/// Writes the records of one county to `out` under canonical headers and
/// returns how many rows were written. A county without records still gets
/// its header row.
pub fn split_county(
    records: &[FbdRecord],
    index: &CountyIndex,
    county: &str,
    out: &Path,
) -> Result<usize> {
    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record(CANONICAL)?;
    let mut written = 0;
    for record in index.records(records, county) {
        let (tech, down, up) = (
            record.tech.to_string(),
            record.down.to_string(),
            record.up.to_string(),
        );
        writer.write_record([
            record.block.as_str(),
            "1",
            record.hoconum.as_str(),
            tech.as_str(),
            down.as_str(),
            up.as_str(),
        ])?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
