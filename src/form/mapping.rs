//! Tables mapping PDF field names to record fields.

use indexmap::IndexMap;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// Maps PDF field names to dotted record paths, like
/// `"Pt2Line4a_FamilyName[0]" = "petitioner.Last_Name"`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingTable(IndexMap<String, String>);

impl MappingTable {
    /// Build a table from `(pdf_field, record_path)` pairs.
    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Load and merge every `*.json` and `*.toml` file in `dir`.
    ///
    /// Files are read in file name order, and later files override earlier
    /// ones, so `99-overrides.toml` beats `10-page1.json`.
    #[instrument(level = "debug")]
    pub async fn load_dir(dir: &Path) -> Result<Self> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read mappings directory: {:?}", dir))?;
        let mut paths = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to read mappings directory: {:?}", dir))?
        {
            let path = entry.path();
            let is_mapping = path.extension().is_some_and(|ext| {
                ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("toml")
            });
            if is_mapping {
                paths.push(path);
            }
        }
        paths.sort();

        let mut table = Self::default();
        for path in &paths {
            let mappings = read_json_or_toml::<IndexMap<String, String>>(path).await?;
            debug!(path = %path.display(), count = mappings.len(), "Loaded mappings");
            table.0.extend(mappings);
        }
        if table.is_empty() {
            warn!("No field mappings found in {}", dir.display());
        }
        Ok(table)
    }

    /// The record path for a PDF field.
    pub fn get(&self, pdf_field: &str) -> Option<&str> {
        self.0.get(pdf_field).map(String::as_str)
    }

    /// Iterate over `(pdf_field, record_path)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[tokio::test]
    async fn later_files_override_earlier_ones() {
        let dir = tempfile::TempDir::with_prefix("mappings").unwrap();
        fs::write(
            dir.path().join("b.toml"),
            "\"Pt2Line4a_FamilyName[0]\" = \"beneficiary.Last_Name\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"{ "Pt2Line4a_FamilyName[0]": "petitioner.Last_Name", "Married": "petitioner.married" }"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not a mapping").unwrap();

        let table = MappingTable::load_dir(dir.path()).await.unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("Pt2Line4a_FamilyName[0]"), Some("beneficiary.Last_Name"));
        assert_eq!(table.get("Married"), Some("petitioner.married"));
        assert_eq!(table.get("Unknown"), None);
    }

    #[tokio::test]
    async fn malformed_files_are_errors() {
        let dir = tempfile::TempDir::with_prefix("mappings").unwrap();
        fs::write(dir.path().join("a.json"), r#"{ "field": ["not", "a", "path"] }"#).unwrap();
        assert!(MappingTable::load_dir(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn missing_directories_are_errors() {
        let dir = tempfile::TempDir::with_prefix("mappings").unwrap();
        assert!(MappingTable::load_dir(&dir.path().join("nope")).await.is_err());
    }
}
