//! Form data records and the templates that define their shape.
//!
//! A [`Record`] is a tree of string leaves. Any leaf we don't know yet holds
//! [`SENTINEL`]. A [`Template`] is a record whose leaves are just
//! placeholders, and which defines the complete set of fields we need to
//! collect. Key order matters: it's the order in which we ask the user about
//! missing fields, so we keep maps in declaration order.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Map;

use crate::{async_utils::io::write_json_pretty, prelude::*};

/// The value of a field we don't know yet.
pub const SENTINEL: &str = "NA";

/// A single node in a [`Record`] tree.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Field {
    /// A known value, the empty string, or [`SENTINEL`].
    Leaf(String),

    /// A group of named fields.
    Node(IndexMap<String, Field>),
}

impl Field {
    /// Convert arbitrary JSON into a field. Non-string scalars are rendered as
    /// strings, and `null` becomes [`SENTINEL`].
    fn from_template_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Field::Node(fields_from_template_map(map)?)),
            Value::String(s) => Ok(Field::Leaf(s.clone())),
            Value::Null => Ok(Field::Leaf(SENTINEL.to_owned())),
            Value::Bool(_) | Value::Number(_) => Ok(Field::Leaf(value.to_string())),
            Value::Array(_) => Err(anyhow!("arrays are not supported in templates")),
        }
    }
}

fn fields_from_template_map(map: &Map<String, Value>) -> Result<IndexMap<String, Field>> {
    map.iter()
        .map(|(key, value)| {
            let field = Field::from_template_value(value)
                .with_context(|| format!("invalid template field {key:?}"))?;
            Ok((key.clone(), field))
        })
        .collect()
}

/// The address of one leaf in a [`Record`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Create a new path from its segments.
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// A human-readable name for the field, based on the last path segment.
    pub fn label(&self) -> String {
        self.0
            .last()
            .map(|segment| segment.replace('_', " "))
            .unwrap_or_default()
    }

    /// A longer human-readable name, including all the enclosing groups. We
    /// use this when asking for a value, because "First Name" alone doesn't say
    /// whose.
    pub fn question_label(&self) -> String {
        self.0.join(" ").replace('_', " ")
    }

    /// Return a new path with `segment` appended.
    fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_owned());
        Self(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Form data, mirroring the shape of a [`Template`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record(IndexMap<String, Field>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record from top-level fields.
    pub fn from_fields(fields: IndexMap<String, Field>) -> Self {
        Self(fields)
    }

    /// Load a record from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read record at path: {:?}", path))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse record at path: {:?}", path))
    }

    /// The top-level fields.
    pub fn fields(&self) -> &IndexMap<String, Field> {
        &self.0
    }

    /// Does this record have no fields at all?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every leaf path, depth-first, in declaration order.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = vec![];
        self.walk(|path, _| paths.push(path));
        paths
    }

    /// The number of leaves in this record.
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        self.walk(|_, _| count += 1);
        count
    }

    /// Every leaf still holding [`SENTINEL`], depth-first, in declaration
    /// order.
    pub fn unresolved(&self) -> Vec<FieldPath> {
        let mut paths = vec![];
        self.walk(|path, value| {
            if value == SENTINEL {
                paths.push(path);
            }
        });
        paths
    }

    /// Look up a leaf value.
    pub fn get(&self, path: &FieldPath) -> Option<&str> {
        let (last, parents) = path.segments().split_last()?;
        let mut fields = &self.0;
        for segment in parents {
            match fields.get(segment)? {
                Field::Node(children) => fields = children,
                Field::Leaf(_) => return None,
            }
        }
        match fields.get(last)? {
            Field::Leaf(value) => Some(value),
            Field::Node(_) => None,
        }
    }

    /// Set a leaf value. Missing groups along the way are created, but we
    /// refuse to replace a group with a leaf or to descend through a leaf.
    pub fn set(&mut self, path: &FieldPath, value: impl Into<String>) -> Result<()> {
        let (last, parents) = path
            .segments()
            .split_last()
            .ok_or_else(|| anyhow!("cannot set a value at an empty path"))?;
        let mut fields = &mut self.0;
        for segment in parents {
            let entry = fields
                .entry(segment.clone())
                .or_insert_with(|| Field::Node(IndexMap::new()));
            match entry {
                Field::Node(children) => fields = children,
                Field::Leaf(_) => {
                    return Err(anyhow!("{path}: {segment:?} is a value, not a group"));
                }
            }
        }
        match fields.get_mut(last) {
            Some(Field::Node(_)) => Err(anyhow!("{path} is a group, not a value")),
            Some(Field::Leaf(existing)) => {
                *existing = value.into();
                Ok(())
            }
            None => {
                fields.insert(last.clone(), Field::Leaf(value.into()));
                Ok(())
            }
        }
    }

    /// Flatten into dotted keys, dropping every leaf equal to [`SENTINEL`].
    pub fn flatten(&self) -> IndexMap<String, String> {
        let mut flat = IndexMap::new();
        self.walk(|path, value| {
            if value != SENTINEL {
                flat.insert(path.to_string(), value.to_owned());
            }
        });
        flat
    }

    /// Convert to JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Call `f` for every leaf, depth-first, in declaration order.
    fn walk(&self, mut f: impl FnMut(FieldPath, &str)) {
        fn walk_fields(
            fields: &IndexMap<String, Field>,
            prefix: &FieldPath,
            f: &mut impl FnMut(FieldPath, &str),
        ) {
            for (key, field) in fields {
                let path = prefix.child(key);
                match field {
                    Field::Leaf(value) => f(path, value),
                    Field::Node(children) => walk_fields(children, &path, f),
                }
            }
        }
        walk_fields(&self.0, &FieldPath::default(), &mut f);
    }
}

/// The complete, fixed set of fields we need to collect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template(Record);

impl Template {
    /// Build a template from a JSON object. Leaf values are placeholders, and
    /// are ignored.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(Record(fields_from_template_map(map)?))),
            _ => Err(anyhow!("a template must be a JSON object")),
        }
    }

    /// Load a template from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read template at path: {:?}", path))?;
        let value = serde_json::from_str::<Value>(&data)
            .with_context(|| format!("Failed to parse template at path: {:?}", path))?;
        Self::from_json(&value).with_context(|| format!("Invalid template {:?}", path))
    }

    /// The shape of this template, as a record.
    pub fn shape(&self) -> &Record {
        &self.0
    }

    /// A record with every field set to [`SENTINEL`].
    pub fn blank_record(&self) -> Record {
        Record(blank_fields(&self.0.0))
    }

    /// Add every template field missing from `record`, set to [`SENTINEL`].
    /// Existing values, including skipped `""` fields and any keys the
    /// template doesn't know, are kept. Returns the number of leaves added.
    pub fn add_missing_fields(&self, record: &mut Record) -> usize {
        fn merge(
            template: &IndexMap<String, Field>,
            fields: &mut IndexMap<String, Field>,
        ) -> usize {
            let mut added = 0;
            for (key, field) in template {
                match fields.get_mut(key) {
                    Some(existing) => match (field, existing) {
                        (Field::Node(children), Field::Node(existing)) => {
                            added += merge(children, existing);
                        }
                        (Field::Leaf(_), Field::Leaf(_)) => {}
                        _ => warn!(%key, "Record field doesn't match the template, keeping it"),
                    },
                    None => {
                        let blank = match field {
                            Field::Leaf(_) => Field::Leaf(SENTINEL.to_owned()),
                            Field::Node(children) => Field::Node(blank_fields(children)),
                        };
                        added += count_leaves(&blank);
                        fields.insert(key.clone(), blank);
                    }
                }
            }
            added
        }
        merge(&self.0.0, &mut record.0)
    }
}

fn count_leaves(field: &Field) -> usize {
    match field {
        Field::Leaf(_) => 1,
        Field::Node(children) => children.values().map(count_leaves).sum(),
    }
}

/// Copy `fields`, setting every leaf to [`SENTINEL`].
fn blank_fields(fields: &IndexMap<String, Field>) -> IndexMap<String, Field> {
    fields
        .iter()
        .map(|(key, field)| {
            let field = match field {
                Field::Leaf(_) => Field::Leaf(SENTINEL.to_owned()),
                Field::Node(children) => Field::Node(blank_fields(children)),
            };
            (key.clone(), field)
        })
        .collect()
}

/// Where a [`Record`] lives on disk.
#[derive(Clone, Debug)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    /// Create a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path of our backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the backing file with `record`.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn save(&self, record: &Record) -> Result<()> {
        write_json_pretty(&self.path, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn flatten_drops_sentinel_values() {
        let record = record(json!({ "a": { "b": "X", "c": "NA" } }));
        let flat = record.flatten();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat.get("a.b").map(String::as_str), Some("X"));
    }

    #[test]
    fn flatten_keeps_empty_strings() {
        // Skipped fields are stored as "", and they're not unknown.
        let record = record(json!({ "a": "", "b": { "c": { "d": "deep" } } }));
        let flat = record.flatten();
        assert_eq!(flat.get("a").map(String::as_str), Some(""));
        assert_eq!(flat.get("b.c.d").map(String::as_str), Some("deep"));
    }

    #[test]
    fn unresolved_follows_declaration_order() {
        let record = record(json!({
            "z": "NA",
            "a": { "y": "known", "x": "NA" },
            "m": "NA",
        }));
        let unresolved = record
            .unresolved()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        assert_eq!(unresolved, vec!["z", "a.x", "m"]);
    }

    #[test]
    fn set_and_get_leaf() {
        let mut record = record(json!({ "a": { "b": "NA" } }));
        let path = FieldPath::new(["a", "b"]);
        record.set(&path, "value").unwrap();
        assert_eq!(record.get(&path), Some("value"));
        assert!(record.unresolved().is_empty());
    }

    #[test]
    fn set_refuses_to_replace_groups() {
        let mut record = record(json!({ "a": { "b": "NA" } }));
        assert!(record.set(&FieldPath::new(["a"]), "x").is_err());
        assert!(record.set(&FieldPath::new(["a", "b", "c"]), "x").is_err());
        assert!(record.set(&FieldPath::new(Vec::<String>::new()), "x").is_err());
    }

    #[test]
    fn labels_replace_underscores() {
        let path = FieldPath::new(["petitioner", "Last_Name"]);
        assert_eq!(path.label(), "Last Name");
        assert_eq!(path.question_label(), "petitioner Last Name");
        assert_eq!(path.to_string(), "petitioner.Last_Name");
    }

    #[test]
    fn template_accepts_any_scalar_placeholder() {
        let template = Template::from_json(&json!({
            "name": "{{NAME}}",
            "age": 0,
            "married": false,
            "spouse": { "name": null },
        }))
        .unwrap();
        assert_eq!(template.shape().leaf_count(), 4);
        let blank = template.blank_record();
        assert_eq!(blank.unresolved().len(), 4);
        assert!(blank.flatten().is_empty());
    }

    #[test]
    fn template_rejects_arrays_and_non_objects() {
        assert!(Template::from_json(&json!({ "a": [] })).is_err());
        assert!(Template::from_json(&json!("nope")).is_err());
    }

    #[test]
    fn record_json_preserves_key_order() {
        let json = r#"{"b":"1","a":{"d":"2","c":"3"}}"#;
        let record: Record = serde_json::from_str(json).unwrap();
        assert_eq!(serde_json::to_string(&record).unwrap(), json);
    }

    #[test]
    fn missing_template_fields_are_added_as_sentinel() {
        let template = Template::from_json(&json!({
            "a": "",
            "b": { "c": "", "d": "" },
            "e": { "f": "" },
        }))
        .unwrap();
        let mut record = record(json!({ "a": "", "b": { "d": "known" }, "extra": "x" }));
        let added = template.add_missing_fields(&mut record);
        assert_eq!(added, 2);
        assert_eq!(
            record.to_json(),
            json!({
                "a": "",
                "b": { "d": "known", "c": "NA" },
                "extra": "x",
                "e": { "f": "NA" },
            })
        );
        assert_eq!(template.add_missing_fields(&mut record), 0);
    }

    #[tokio::test]
    async fn store_round_trips_through_disk() {
        let dir = tempfile::TempDir::with_prefix("record").unwrap();
        let store = RecordStore::new(dir.path().join("record.json"));
        let original = record(json!({ "a": { "b": "X", "c": "NA" } }));
        store.save(&original).await.unwrap();
        let loaded = Record::load(store.path()).await.unwrap();
        assert_eq!(loaded, original);
    }
}
