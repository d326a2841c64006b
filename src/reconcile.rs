//! Reshaping extracted data to match a [`Template`].
//!
//! Extraction gives us JSON of unknown shape. Reconciliation produces a
//! [`Record`] with exactly the template's fields: anything we can match is
//! copied, everything else becomes [`SENTINEL`], and extra keys are dropped.

use indexmap::IndexMap;
use serde_json::Map;

use crate::{
    generate::TextGenerator,
    llm_json::parse_llm_object,
    prelude::*,
    prompt::Prompts,
    record::{Field, FieldPath, Record, SENTINEL, Template},
};

/// Reconcile `raw` against `template` without any help from a model.
#[instrument(level = "debug", skip_all)]
pub fn reconcile(raw: &Value, template: &Template) -> Record {
    let index = LenientIndex::new(raw, template);
    let fields = reconcile_fields(
        template.shape().fields(),
        raw.as_object(),
        &FieldPath::default(),
        &index,
    );
    Record::from_fields(fields)
}

/// Ask the model to reshape `raw` to match `template`.
///
/// Returns an empty record if the model's reply can't be parsed. Callers that
/// need a usable record should call [`reconcile_with_fallback`] instead.
#[instrument(level = "debug", skip_all)]
pub async fn reconcile_with_llm(
    raw: &Value,
    template: &Template,
    generator: &dyn TextGenerator,
    prompts: &Prompts,
) -> Record {
    let prompt = match prompts.correct_json(raw, &template.shape().to_json()) {
        Ok(prompt) => prompt,
        Err(err) => {
            error!("Could not build reconciliation prompt: {err:?}");
            return Record::new();
        }
    };
    let reply = generator.generate(&prompt).await;
    match parse_llm_object(&reply) {
        // The model may still have invented or dropped fields, so we run its
        // answer through the deterministic pass to get the exact key set.
        Ok(map) => reconcile(&Value::Object(map), template),
        Err(err) => {
            warn!("Could not parse reconciled JSON from model: {err:?}");
            Record::new()
        }
    }
}

/// Reconcile using the model, falling back to [`reconcile`] if the model
/// gives us nothing usable.
pub async fn reconcile_with_fallback(
    raw: &Value,
    template: &Template,
    generator: &dyn TextGenerator,
    prompts: &Prompts,
) -> Record {
    let record = reconcile_with_llm(raw, template, generator, prompts).await;
    if record.is_empty() && !template.shape().is_empty() {
        warn!("Model reconciliation failed, using deterministic reconciliation");
        reconcile(raw, template)
    } else {
        record
    }
}

fn reconcile_fields(
    template: &IndexMap<String, Field>,
    raw: Option<&Map<String, Value>>,
    prefix: &FieldPath,
    index: &LenientIndex,
) -> IndexMap<String, Field> {
    let mut fields = IndexMap::with_capacity(template.len());
    for (key, field) in template {
        let path = FieldPath::new(prefix.segments().iter().cloned().chain([key.clone()]));
        let raw_value = raw.and_then(|raw| raw.get(key));
        let reconciled = match field {
            Field::Node(children) => Field::Node(reconcile_fields(
                children,
                raw_value.and_then(Value::as_object),
                &path,
                index,
            )),
            Field::Leaf(_) => {
                let value = match raw_value {
                    Some(value) => leaf_text(value),
                    None => index.lookup(&path),
                };
                Field::Leaf(value.unwrap_or_else(|| SENTINEL.to_owned()))
            }
        };
        fields.insert(key.clone(), reconciled);
    }
    fields
}

/// Get the usable text of a leaf, or `None` if it's missing or a placeholder.
fn leaf_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    if is_placeholder(&text) { None } else { Some(text) }
}

/// Is this a value that means "we don't know"?
fn is_placeholder(text: &str) -> bool {
    let lower = text.to_lowercase();
    text.is_empty()
        || matches!(lower.as_str(), "na" | "n/a" | "null" | "none")
        || (text.starts_with("{{") && text.ends_with("}}"))
}

/// Normalize a key for loose matching: lower-case ASCII alphanumerics only.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A raw leaf, as seen by [`LenientIndex`].
#[derive(Debug)]
struct RawLeaf {
    /// The normalized keys of the enclosing objects.
    parents: Vec<String>,
    /// The normalized last key.
    key: String,
    /// The normalized full path, without separators.
    path: String,
    /// The leaf value, if usable.
    value: Option<String>,
}

/// Loose matching for raw leaves that aren't where the template expects them.
///
/// Extraction output is often flat (`petitioner_Last_Name`) or uses a
/// different capitalization. We match a template leaf against raw leaves by
/// normalized full path first. Failing that, we match by normalized key, but
/// only if that key is unique within the template and the raw leaf doesn't
/// sit inside some other group. A match only counts if it is unambiguous.
#[derive(Debug)]
struct LenientIndex {
    leaves: Vec<RawLeaf>,
    template_key_counts: IndexMap<String, usize>,
}

impl LenientIndex {
    fn new(raw: &Value, template: &Template) -> Self {
        fn collect(map: &Map<String, Value>, parents: &[String], leaves: &mut Vec<RawLeaf>) {
            for (key, value) in map {
                let key = normalize_key(key);
                match value {
                    Value::Object(children) => {
                        let mut parents = parents.to_vec();
                        parents.push(key);
                        collect(children, &parents, leaves);
                    }
                    _ => leaves.push(RawLeaf {
                        path: format!("{}{key}", parents.concat()),
                        parents: parents.to_vec(),
                        key,
                        value: leaf_text(value),
                    }),
                }
            }
        }

        let mut leaves = vec![];
        if let Some(map) = raw.as_object() {
            collect(map, &[], &mut leaves);
        }

        let mut template_key_counts = IndexMap::new();
        for path in template.shape().leaf_paths() {
            let key = normalize_key(path.segments().last().map_or("", String::as_str));
            *template_key_counts.entry(key).or_insert(0) += 1;
        }

        Self {
            leaves,
            template_key_counts,
        }
    }

    fn lookup(&self, path: &FieldPath) -> Option<String> {
        let (last, parents) = path.segments().split_last()?;
        let full = normalize_key(&path.segments().concat());
        let by_path = self
            .leaves
            .iter()
            .filter(|leaf| leaf.path == full)
            .collect::<Vec<_>>();
        if let [leaf] = by_path.as_slice() {
            trace!(%path, "Matched raw leaf by normalized path");
            return leaf.value.clone();
        }
        if !by_path.is_empty() {
            debug!(%path, "Ambiguous raw leaves for field");
            return None;
        }

        let key = normalize_key(last);
        if key.is_empty() || self.template_key_counts.get(&key) != Some(&1) {
            return None;
        }
        // A raw leaf may be shallower than the template field, but it must not
        // belong to a different group.
        let parents = parents.iter().map(|p| normalize_key(p)).collect::<Vec<_>>();
        let by_key = self
            .leaves
            .iter()
            .filter(|leaf| leaf.key == key && parents.starts_with(&leaf.parents))
            .collect::<Vec<_>>();
        match by_key.as_slice() {
            [leaf] => {
                trace!(%path, "Matched raw leaf by normalized key");
                leaf.value.clone()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::prompt::ChatPrompt;

    fn template(value: Value) -> Template {
        Template::from_json(&value).unwrap()
    }

    #[test]
    fn copies_matching_leaves_and_fills_the_rest_with_sentinel() {
        let template = template(json!({ "a": { "b": "", "c": "" }, "d": "" }));
        let record = reconcile(&json!({ "a": { "b": "X" }, "e": "Y" }), &template);
        assert_eq!(
            record.to_json(),
            json!({ "a": { "b": "X", "c": "NA" }, "d": "NA" })
        );
    }

    #[test]
    fn placeholders_become_sentinel() {
        let template = template(json!({
            "a": "", "b": "", "c": "", "d": "", "e": "", "f": "", "g": ""
        }));
        let raw = json!({
            "a": "  ", "b": "N/A", "c": "None", "d": "{{LAST_NAME}}",
            "e": null, "f": ["x"], "g": { "nested": "x" }
        });
        let record = reconcile(&raw, &template);
        assert_eq!(record.unresolved().len(), 7);
    }

    #[test]
    fn scalars_are_rendered_as_strings() {
        let template = template(json!({ "age": "", "married": "", "name": "" }));
        let record = reconcile(
            &json!({ "age": 42, "married": false, "name": "  Ann " }),
            &template,
        );
        assert_eq!(
            record.to_json(),
            json!({ "age": "42", "married": "false", "name": "Ann" })
        );
    }

    #[test]
    fn flat_extraction_output_lands_in_nested_fields() {
        let template = template(json!({
            "petitioner": { "Last_Name": "", "Date_of_Birth": "" },
            "beneficiary": { "Last_Name": "" }
        }));
        let raw = json!({
            "petitioner_Last_Name": "Smith",
            "date of birth": "01/02/1980",
            "Beneficiary": { "last_name": "Jones" }
        });
        let record = reconcile(&raw, &template);
        assert_eq!(
            record.to_json(),
            json!({
                "petitioner": { "Last_Name": "Smith", "Date_of_Birth": "01/02/1980" },
                "beneficiary": { "Last_Name": "Jones" }
            })
        );
    }

    #[test]
    fn ambiguous_loose_matches_are_ignored() {
        let template = template(json!({
            "petitioner": { "Last_Name": "" },
            "beneficiary": { "Last_Name": "" }
        }));
        // "Last_Name" could belong to either person.
        let record = reconcile(&json!({ "Last_Name": "Smith" }), &template);
        assert_eq!(record.unresolved().len(), 2);
    }

    #[test]
    fn exact_paths_win_over_loose_matches() {
        let template = template(json!({ "a": { "b": "" } }));
        let raw = json!({ "a": { "b": "NA" }, "a_b": "X" });
        let record = reconcile(&raw, &template);
        assert_eq!(record.to_json(), json!({ "a": { "b": "NA" } }));
    }

    #[test]
    fn loose_matches_never_cross_into_another_group() {
        let template = template(json!({ "name": "", "spouse": { "name": "" } }));
        let record = reconcile(&json!({ "spouse": { "name": "Jane" } }), &template);
        assert_eq!(
            record.to_json(),
            json!({ "name": "NA", "spouse": { "name": "Jane" } })
        );

        let template = self::template(json!({
            "petitioner": { "Last_Name": "" },
            "beneficiary": { "Last_Name": "" }
        }));
        let raw = json!({ "beneficiary": { "petitioner_Last_Name": "Jones" } });
        let record = reconcile(&raw, &template);
        assert_eq!(record.unresolved().len(), 2);
    }

    #[test]
    fn unique_keys_in_another_group_are_not_borrowed() {
        let template = template(json!({
            "petitioner": { "Date_of_Birth": "" },
            "beneficiary": { "Last_Name": "" }
        }));
        let raw = json!({ "beneficiary": { "date_of_birth": "01/02/1980" } });
        let record = reconcile(&raw, &template);
        assert_eq!(
            record.to_json(),
            json!({ "petitioner": { "Date_of_Birth": "NA" }, "beneficiary": { "Last_Name": "NA" } })
        );
    }

    #[test]
    fn loose_keys_match_within_their_own_group() {
        let template = template(json!({
            "petitioner": { "Date_of_Birth": "" },
            "beneficiary": { "Last_Name": "" }
        }));
        let raw = json!({ "Petitioner": { "date of birth": "01/02/1980" } });
        let record = reconcile(&raw, &template);
        assert_eq!(
            record.to_json(),
            json!({ "petitioner": { "Date_of_Birth": "01/02/1980" }, "beneficiary": { "Last_Name": "NA" } })
        );
    }

    /// A generator that always says the same thing.
    struct FixedGenerator(&'static str);

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &ChatPrompt) -> String {
            self.0.to_owned()
        }
    }

    #[tokio::test]
    async fn llm_output_is_held_to_the_template() {
        let template = template(json!({ "name": "", "city": "" }));
        let generator = FixedGenerator(
            "Sure! ```json\n{\"name\": \"Ann\", \"invented\": \"x\"}\n```",
        );
        let record =
            reconcile_with_llm(&json!({}), &template, &generator, &Prompts::default())
                .await;
        assert_eq!(record.to_json(), json!({ "name": "Ann", "city": "NA" }));
    }

    #[tokio::test]
    async fn unparseable_llm_output_gives_an_empty_record() {
        let template = template(json!({ "name": "" }));
        let generator = FixedGenerator("I can't do that.");
        let prompts = Prompts::default();
        let raw = json!({ "name": "Ann" });

        let record = reconcile_with_llm(&raw, &template, &generator, &prompts).await;
        assert!(record.is_empty());

        let record = reconcile_with_fallback(&raw, &template, &generator, &prompts).await;
        assert_eq!(record.to_json(), json!({ "name": "Ann" }));
    }

    /// Arbitrary JSON trees without arrays, which templates don't allow.
    fn json_tree() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            Just(json!("NA")),
            Just(json!("")),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-zA-Z ]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop::collection::vec(("[a-c_]{1,2}", inner), 0..4)
                .prop_map(|entries| Value::Object(entries.into_iter().collect()))
        })
    }

    fn json_object() -> impl Strategy<Value = Value> {
        prop::collection::vec(("[a-c_]{1,2}", json_tree()), 0..5)
            .prop_map(|entries| Value::Object(entries.into_iter().collect()))
    }

    /// Replace every leaf with `null`, leaving only the key structure.
    fn key_shape(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), key_shape(value)))
                    .collect(),
            ),
            _ => Value::Null,
        }
    }

    proptest! {
        #[test]
        fn reconciled_records_have_the_template_key_set(
            template_json in json_object(),
            raw in json_object(),
        ) {
            let template = Template::from_json(&template_json).unwrap();
            let record = reconcile(&raw, &template);
            prop_assert_eq!(key_shape(&record.to_json()), key_shape(&template_json));
        }

        #[test]
        fn flattened_records_are_no_larger_than_the_template(
            template_json in json_object(),
            raw in json_object(),
        ) {
            let template = Template::from_json(&template_json).unwrap();
            let record = reconcile(&raw, &template);
            let flat = record.flatten();
            prop_assert!(flat.len() <= template.shape().leaf_count());
            prop_assert!(flat.values().all(|value| !value.is_empty() && value != SENTINEL));
        }
    }
}
