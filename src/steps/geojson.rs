//! Streaming GeoJSON feature collections.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use serde_json::{json, Map, Value};

use crate::error::Result;

/// Writes a `FeatureCollection` one feature at a time, one feature per line.
pub struct FeatureWriter {
    out: BufWriter<File>,
    written: usize,
}

impl FeatureWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(b"{\"type\":\"FeatureCollection\",\"features\":[\n")?;
        Ok(Self { out, written: 0 })
    }

    pub fn write(&mut self, feature: &Value) -> Result<()> {
        if self.written > 0 {
            self.out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.out, feature)?;
        self.written += 1;
        Ok(())
    }

    /// Closes the collection and returns the number of features.
    pub fn finish(mut self) -> Result<usize> {
        self.out.write_all(b"\n]}\n")?;
        self.out.flush()?;
        Ok(self.written)
    }
}

/// A feature from a geometry serialized by `ST_AsGeoJSON`.
pub fn feature(properties: Map<String, Value>, geometry: &str, bbox: Option<[f64; 4]>) -> Result<Value> {
    let geometry: Value = serde_json::from_str(geometry)?;
    let mut feature = json!({
        "type": "Feature",
        "properties": properties,
        "geometry": geometry,
    });
    if let (Some(bbox), Some(object)) = (bbox, feature.as_object_mut()) {
        object.insert("bbox".into(), json!(bbox));
    }
    Ok(feature)
}

/// A string property of a feature, empty when absent.
pub fn property<'a>(feature: &'a Value, key: &str) -> &'a str {
    feature["properties"][key].as_str().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collections_are_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("county.geojson");
        let mut writer = FeatureWriter::create(&path).unwrap();
        for id in ["01001", "01003"] {
            let mut properties = Map::new();
            properties.insert("county_id".into(), id.into());
            let feature = feature(
                properties,
                r#"{"type":"Point","coordinates":[-86.6,32.5]}"#,
                Some([-86.9, 32.3, -86.4, 32.7]),
            )
            .unwrap();
            writer.write(&feature).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 2);

        let parsed: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let features = parsed["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(property(&features[1], "county_id"), "01003");
        assert_eq!(features[0]["bbox"][2], json!(-86.4));
        assert_eq!(property(&features[0], "missing"), "");
    }
}
