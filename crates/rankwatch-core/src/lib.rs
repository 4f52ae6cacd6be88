//! Core domain model for rankwatch: ranking results, snapshots and raw table sections.

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marker used by the ranking page for a submitted original or consent.
pub const FLAG_SET: &str = "+";

/// Ranking of the tracked applicant inside one program table.
///
/// `code` is the snapshot key and is not written inside the record; it is
/// restored from the key when a [`Snapshot`] is deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgramResult {
    #[serde(skip)]
    pub code: String,
    pub name: String,
    pub position: u32,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub consents: u32,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub originals: u32,
    #[serde(default, alias = "totalApplications", deserialize_with = "null_as_zero")]
    pub total_applications: u32,
    #[serde(default, alias = "totalOriginals", deserialize_with = "null_as_zero")]
    pub total_originals: u32,
    #[serde(default, alias = "totalConsents", deserialize_with = "null_as_zero")]
    pub total_consents: u32,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or_default())
}

/// All program results observed in one cycle, keyed by program code.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "BTreeMap<String, ProgramResult>")]
pub struct Snapshot {
    programs: BTreeMap<String, ProgramResult>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a result under its own code, returning the result it replaced.
    pub fn insert(&mut self, result: ProgramResult) -> Option<ProgramResult> {
        self.programs.insert(result.code.clone(), result)
    }

    pub fn get(&self, code: &str) -> Option<&ProgramResult> {
        self.programs.get(code)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, ProgramResult> {
        self.programs.values()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

impl From<BTreeMap<String, ProgramResult>> for Snapshot {
    fn from(mut programs: BTreeMap<String, ProgramResult>) -> Self {
        for (code, result) in &mut programs {
            result.code = code.clone();
        }
        Self { programs }
    }
}

impl FromIterator<ProgramResult> for Snapshot {
    fn from_iter<I: IntoIterator<Item = ProgramResult>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for result in iter {
            snapshot.insert(result);
        }
        snapshot
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a ProgramResult;
    type IntoIter = btree_map::Values<'a, String, ProgramResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.programs.serialize(serializer)
    }
}

/// One table row as trimmed cell texts, in column order.
pub type RawRow = Vec<String>;

/// Handoff from the HTML extractor to the ranking computer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProgramSection {
    pub code: String,
    pub name: String,
    /// First-cell text of the row holding the tracked identifier.
    pub rank_marker: String,
    pub rows: Vec<RawRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(code: &str, position: u32) -> ProgramResult {
        ProgramResult {
            code: code.to_string(),
            name: format!("Program {code}"),
            position,
            consents: 1,
            originals: 2,
            total_applications: 3,
            total_originals: 4,
            total_consents: 5,
        }
    }

    #[test]
    fn snapshot_serializes_as_code_keyed_object_without_code_field() {
        let snapshot: Snapshot = [result("b", 2), result("a", 1)].into_iter().collect();
        let value = serde_json::to_value(&snapshot).unwrap();

        let object = value.as_object().unwrap();
        assert_eq!(object.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(object["a"].get("code").is_none());
        assert_eq!(object["a"]["total_applications"], 3);
    }

    #[test]
    fn deserialization_restores_codes_from_keys() {
        let snapshot: Snapshot = serde_json::from_str(
            r#"{"09.03.01": {"name": "Informatics", "position": 7, "consents": 1,
                "originals": 2, "total_applications": 30, "total_originals": 40,
                "total_consents": 50}}"#,
        )
        .unwrap();

        let program = snapshot.get("09.03.01").unwrap();
        assert_eq!(program.code, "09.03.01");
        assert_eq!(program.position, 7);
        assert_eq!(program.total_consents, 50);
    }

    #[test]
    fn deserialization_accepts_camel_case_nulls_and_missing_counters() {
        let snapshot: Snapshot = serde_json::from_str(
            r#"{"x": {"name": "X", "position": 3, "consents": null,
                "totalApplications": 9}}"#,
        )
        .unwrap();

        let program = snapshot.get("x").unwrap();
        assert_eq!(program.consents, 0);
        assert_eq!(program.originals, 0);
        assert_eq!(program.total_applications, 9);
    }

    #[test]
    fn insert_replaces_same_code() {
        let mut snapshot = Snapshot::new();
        assert!(snapshot.insert(result("a", 1)).is_none());
        let replaced = snapshot.insert(result("a", 5)).unwrap();
        assert_eq!(replaced.position, 1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a").unwrap().position, 5);
    }
}
