//! Manifest document parsing and compatibility filtering
//!
//! The server publishes `{"response": [ ... ]}` where every record describes
//! one downloadable build. Records that fail to decode are skipped, a document
//! that is not shaped like this at all is rejected.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DeviceBuild;
use crate::error::{Result, UpdateError};
use crate::models::{UpdateInfo, UpdateMetadata};

/// One record of the server manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: String,
    /// Publish time in seconds since the epoch
    pub datetime: i64,
    pub filename: String,
    pub romtype: String,
    pub size: u64,
    pub url: String,
    pub version: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ManifestEntry {
    /// Convert into a remote registry entry
    pub fn to_update_info(&self) -> UpdateInfo {
        UpdateInfo::remote(
            self.id.clone(),
            self.datetime,
            UpdateMetadata {
                name: self.filename.clone(),
                version: self.version.clone(),
                release_type: self.romtype.clone(),
                size: self.size,
                download_url: Some(self.url.clone()),
                checksum: self.checksum.clone(),
                local_path: None,
            },
        )
    }
}

/// A parsed manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Parse a manifest document, skipping records that cannot be decoded
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let document: Value = serde_json::from_slice(bytes)
            .map_err(|e| UpdateError::malformed_manifest(format!("invalid JSON: {}", e)))?;

        let records = document
            .get("response")
            .and_then(Value::as_array)
            .ok_or_else(|| UpdateError::malformed_manifest("missing 'response' array"))?;

        let mut entries = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match serde_json::from_value::<ManifestEntry>(record.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Could not parse update record {}: {}", index, e),
            }
        }

        debug!("Parsed manifest with {} records", entries.len());
        Ok(Self { entries })
    }

    /// Serialize back into the wire shape
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let document = serde_json::json!({ "response": self.entries });
        Ok(serde_json::to_vec_pretty(&document)?)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all records
    pub fn ids(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    /// Keep only the records the device may install
    pub fn compatible(&self, filter: &CompatibilityFilter) -> Manifest {
        let entries = self
            .entries
            .iter()
            .filter(|entry| {
                let ok = filter.is_compatible(entry);
                if !ok {
                    debug!("Ignoring incompatible update {}", entry.id);
                }
                ok
            })
            .cloned()
            .collect();
        Manifest { entries }
    }

    /// Registry entries for every record
    pub fn to_updates(&self) -> Vec<UpdateInfo> {
        self.entries.iter().map(ManifestEntry::to_update_info).collect()
    }
}

/// Decides which manifest records apply to the running build
#[derive(Debug, Clone)]
pub struct CompatibilityFilter {
    build: DeviceBuild,
    channel: String,
    allow_downgrades: bool,
}

impl CompatibilityFilter {
    pub fn new(build: DeviceBuild, channel: impl Into<String>, allow_downgrades: bool) -> Self {
        Self {
            build,
            channel: channel.into(),
            allow_downgrades,
        }
    }

    pub fn is_compatible(&self, entry: &ManifestEntry) -> bool {
        if !entry.romtype.eq_ignore_ascii_case(&self.channel) {
            return false;
        }
        if compare_versions(&entry.version, &self.build.version) == Ordering::Less {
            return false;
        }
        self.allow_downgrades || entry.datetime > self.build.timestamp
    }
}

/// Compare dotted numeric versions; missing or non-numeric parts count as 0
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, datetime: i64, romtype: &str, version: &str) -> ManifestEntry {
        ManifestEntry {
            id: id.to_string(),
            datetime,
            filename: format!("{}.zip", id),
            romtype: romtype.to_string(),
            size: 1024,
            url: format!("https://example.com/{}.zip", id),
            version: version.to_string(),
            checksum: None,
        }
    }

    #[test]
    fn test_parse_manifest() {
        let json = br#"{"response":[
            {"id":"u1","datetime":100,"filename":"u1.zip","romtype":"nightly","size":10,"url":"https://x/u1.zip","version":"21.0"},
            {"id":"u2","datetime":200,"filename":"u2.zip","romtype":"nightly","size":20,"url":"https://x/u2.zip","version":"21.0","checksum":"abc"}
        ]}"#;

        let manifest = Manifest::parse(json).unwrap();
        assert_eq!(manifest.entries().len(), 2);
        assert_eq!(manifest.entries()[1].checksum.as_deref(), Some("abc"));
        assert!(manifest.ids().contains("u1"));
    }

    #[test]
    fn test_parse_skips_bad_records() {
        let json = br#"{"response":[
            {"id":"u1","datetime":100,"filename":"u1.zip","romtype":"nightly","size":10,"url":"https://x/u1.zip","version":"21.0"},
            {"id":"broken"}
        ]}"#;

        let manifest = Manifest::parse(json).unwrap();
        assert_eq!(manifest.entries().len(), 1);
        assert_eq!(manifest.entries()[0].id, "u1");
    }

    #[test]
    fn test_parse_rejects_malformed_document() {
        assert!(matches!(
            Manifest::parse(b"{not json"),
            Err(UpdateError::MalformedManifest { .. })
        ));
        assert!(matches!(
            Manifest::parse(br#"{"updates":[]}"#),
            Err(UpdateError::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_to_json_round_trip_shape() {
        let manifest = Manifest::new(vec![entry("u1", 100, "nightly", "21.0")]);
        let bytes = manifest.to_json().unwrap();
        assert_eq!(Manifest::parse(&bytes).unwrap(), manifest);
    }

    #[test]
    fn test_compatibility_filter() {
        let build = DeviceBuild {
            version: "21.0".to_string(),
            timestamp: 150,
            incremental: "1".to_string(),
        };
        let filter = CompatibilityFilter::new(build.clone(), "nightly", false);

        assert!(filter.is_compatible(&entry("new", 200, "NIGHTLY", "21.0")));
        assert!(!filter.is_compatible(&entry("old", 100, "nightly", "21.0")));
        assert!(!filter.is_compatible(&entry("other", 200, "snapshot", "21.0")));
        assert!(!filter.is_compatible(&entry("older-major", 200, "nightly", "20.0")));

        let permissive = CompatibilityFilter::new(build, "nightly", true);
        assert!(permissive.is_compatible(&entry("old", 100, "nightly", "21.0")));
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("21.0", "21"), Ordering::Equal);
        assert_eq!(compare_versions("21.1", "21.0"), Ordering::Greater);
        assert_eq!(compare_versions("20", "21.0"), Ordering::Less);
        assert_eq!(compare_versions("22.0-beta", "22.0"), Ordering::Equal);
    }
}
