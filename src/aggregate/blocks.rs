use std::path::Path;

use hashbrown::HashMap;
use rkyv::Archive;

use crate::error::{Error, Result};

/// Geography column every block belongs to without being listed in the file.
const NATION: &str = "country";

#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct BlockRecord {
    pub geoid: String,
    pub pop: u64,
    pub h2only_undev: Option<i64>,
    /// Values of [`BlockMaster::attribute_names`], in the same order. Empty
    /// cells are `None`.
    pub attributes: Vec<Option<String>>,
}

/// The block master table: one row per census block with its population and
/// the geography codes it rolls up into.
#[derive(Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Default)]
#[archive(check_bytes)]
pub struct BlockMaster {
    pub attribute_names: Vec<String>,
    pub blocks: Vec<BlockRecord>,
}

impl BlockMaster {
    /// Reads `geoid_column`, `pop`, `h2only_undev` (optional) and the given
    /// attribute columns. `country` is synthesised as `0` when absent.
    pub fn read(path: &Path, geoid_column: &str, attribute_names: &[String]) -> Result<Self> {
        if !path.exists() {
            Err(Error::MissingInput(path.to_path_buf()))?
        }
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let position = |name: &str| headers.iter().position(|h| h == name);
        let unexpected = || Error::UnexpectedColumns(path.to_path_buf());

        let geoid = position(geoid_column).ok_or_else(unexpected)?;
        let pop = position("pop").ok_or_else(unexpected)?;
        let h2only_undev = position("h2only_undev");
        let attributes = attribute_names
            .iter()
            .map(|name| match position(name) {
                Some(index) => Ok(Some(index)),
                None if name == NATION => Ok(None),
                None => Err(unexpected()),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut blocks = Vec::new();
        for row in reader.records() {
            let row = row?;
            let field = |index: usize| row.get(index).unwrap_or("").trim();
            blocks.push(BlockRecord {
                geoid: field(geoid).to_string(),
                pop: parse_count("pop", field(pop))?,
                h2only_undev: match h2only_undev.map(field) {
                    None | Some("") => None,
                    Some(value) => Some(parse_count("h2only_undev", value)? as i64),
                },
                attributes: attributes
                    .iter()
                    .map(|index| match index {
                        Some(index) => Some(field(*index)).filter(|v| !v.is_empty()).map(String::from),
                        None => Some("0".to_string()),
                    })
                    .collect(),
            });
        }
        Ok(Self {
            attribute_names: attribute_names.to_vec(),
            blocks,
        })
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attribute_names.iter().position(|n| n == name)
    }

    /// Block population keyed by geoid.
    pub fn populations(&self) -> HashMap<&str, u64> {
        self.blocks
            .iter()
            .map(|block| (block.geoid.as_str(), block.pop))
            .collect()
    }
}

impl BlockRecord {
    pub fn attribute(&self, index: usize) -> Option<&str> {
        self.attributes.get(index).and_then(|v| v.as_deref())
    }
}

/// Integer counts sometimes arrive formatted as floats (`12.0`).
fn parse_count(column: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .ok()
        .or_else(|| {
            value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.)
                .map(|v| v.round() as u64)
        })
        .ok_or_else(|| Error::MalformedValue {
            column: column.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn reads_attributes_and_synthesises_the_nation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockmaster.csv");
        fs::write(
            &path,
            "geoid10,pop,hu,h2only_undev,state_fips,county_fips,cplace_id\n\
             010010201001000,61,26,0,01,01001,\n\
             010010201001001,0,0,1,01,01001,0100124\n",
        )
        .unwrap();
        let names: Vec<String> = ["county_fips", "cplace_id", "country"].map(String::from).to_vec();
        let master = BlockMaster::read(&path, "geoid10", &names).unwrap();

        assert_eq!(master.blocks.len(), 2);
        let first = &master.blocks[0];
        assert_eq!(first.pop, 61);
        assert_eq!(first.h2only_undev, Some(0));
        assert_eq!(first.attribute(0), Some("01001"));
        assert_eq!(first.attribute(1), None);
        assert_eq!(first.attribute(2), Some("0"));
        assert_eq!(master.blocks[1].attribute(1), Some("0100124"));
        assert_eq!(master.populations()["010010201001000"], 61);
    }

    #[test]
    fn missing_required_columns_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockmaster.csv");
        fs::write(&path, "geoid10,hu\n010010201001000,26\n").unwrap();
        assert!(matches!(
            BlockMaster::read(&path, "geoid10", &[]),
            Err(Error::UnexpectedColumns(_))
        ));
    }

    #[test]
    fn float_formatted_counts_parse() {
        assert_eq!(parse_count("pop", "12.0").unwrap(), 12);
        assert!(parse_count("pop", "twelve").is_err());
    }
}
