//! Prompts for the language model, as Handlebars templates.
//!
//! Every prompt we send has a built-in default, and any of them can be replaced
//! by a TOML or JSON prompt file. The templates are checked when they're
//! loaded, so a typo shows up at startup instead of halfway through a chat.

use handlebars::Handlebars;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// A chat completion prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    pub developer: Option<String>,

    /// The user message.
    pub user: String,
}

/// Our prompt templates.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Prompts {
    /// The developer message sent with every dialogue prompt.
    pub developer: String,

    /// Ask the user for a field. Bindings: `label`.
    pub ask_question: String,

    /// Explain a field the user asked about. Bindings: `label`, `user_input`.
    pub explain_field: String,

    /// Pull a clean value out of a free-form reply. Bindings: `label`,
    /// `user_input`.
    pub extract_value: String,

    /// Reshape raw JSON to match a template. Bindings: `json_data`,
    /// `template_data`.
    pub correct_json: String,

    /// Extract raw field data from documents. Bindings: `documents` (each
    /// with `file` and `content`), `fields`, `template_data`.
    pub extract_documents: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            developer: "You are an assistant helping fill in missing fields in a form. \
                You will either ask a short friendly question for a field, explain what \
                a field means if asked, or clean up a user input and return just the \
                value with no comments."
                .to_owned(),
            ask_question: "Ask one friendly and short question to collect this info: \
                {{label}}. No explanation."
                .to_owned(),
            explain_field: "The user asked: '{{user_input}}'. Explain politely what \
                '{{label}}' means and how to find it."
                .to_owned(),
            extract_value: "The user said: '{{user_input}}' for the field '{{label}}'. \
                Return just the cleaned value. No comments. Don't add anything extra \
                on numbers like adding hyphens please."
                .to_owned(),
            correct_json: include_str!("prompts/correct_json.hbs").to_owned(),
            extract_documents: include_str!("prompts/extract_documents.hbs").to_owned(),
        }
    }
}

impl Prompts {
    /// Load prompts from a TOML or JSON file, or use the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let prompts = match path {
            Some(path) => read_json_or_toml::<Prompts>(path).await?,
            None => Prompts::default(),
        };
        prompts.check().context("invalid prompt template")?;
        Ok(prompts)
    }

    /// Make sure all our templates parse.
    fn check(&self) -> Result<()> {
        let mut handlebars = new_handlebars();
        for (name, template) in [
            ("developer", &self.developer),
            ("ask_question", &self.ask_question),
            ("explain_field", &self.explain_field),
            ("extract_value", &self.extract_value),
            ("correct_json", &self.correct_json),
            ("extract_documents", &self.extract_documents),
        ] {
            handlebars
                .register_template_string(name, template)
                .with_context(|| format!("failed to parse {name} template"))?;
        }
        Ok(())
    }

    /// Prompt asking the user for the value of `label`.
    pub fn ask_question(&self, label: &str) -> Result<ChatPrompt> {
        self.dialogue_prompt(&self.ask_question, &json!({ "label": label }))
    }

    /// Prompt explaining `label` in response to `user_input`.
    pub fn explain_field(&self, label: &str, user_input: &str) -> Result<ChatPrompt> {
        self.dialogue_prompt(
            &self.explain_field,
            &json!({ "label": label, "user_input": user_input }),
        )
    }

    /// Prompt extracting a value for `label` from `user_input`.
    pub fn extract_value(&self, label: &str, user_input: &str) -> Result<ChatPrompt> {
        self.dialogue_prompt(
            &self.extract_value,
            &json!({ "label": label, "user_input": user_input }),
        )
    }

    /// Prompt reshaping `json_data` to match `template_data`.
    pub fn correct_json(&self, json_data: &Value, template_data: &Value) -> Result<ChatPrompt> {
        Ok(ChatPrompt {
            developer: None,
            user: render(
                &self.correct_json,
                &json!({
                    "json_data": serde_json::to_string_pretty(json_data)?,
                    "template_data": serde_json::to_string_pretty(template_data)?,
                    "placeholder": "{{FIELD_NAME}}",
                }),
            )?,
        })
    }

    /// Prompt extracting `fields` from `documents`.
    pub fn extract_documents(
        &self,
        documents: &Value,
        fields: &[String],
        template_data: &Value,
    ) -> Result<ChatPrompt> {
        Ok(ChatPrompt {
            developer: None,
            user: render(
                &self.extract_documents,
                &json!({
                    "documents": documents,
                    "fields": fields,
                    "template_data": serde_json::to_string_pretty(template_data)?,
                }),
            )?,
        })
    }

    /// Build a prompt with our standard developer message.
    fn dialogue_prompt(&self, template: &str, bindings: &Value) -> Result<ChatPrompt> {
        Ok(ChatPrompt {
            developer: Some(render(&self.developer, bindings)?),
            user: render(template, bindings)?,
        })
    }
}

/// Create a Handlebars renderer. We're producing plain text, not HTML, so we
/// turn off escaping.
fn new_handlebars() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
}

/// Render a single template string.
fn render(template: &str, bindings: &Value) -> Result<String> {
    new_handlebars()
        .render_template(template, bindings)
        .context("Error rendering prompt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_input_is_not_html_escaped() {
        let prompts = Prompts::default();
        let prompt = prompts
            .extract_value("Last Name", "it's \"O'Brien\" & co")
            .unwrap();
        assert!(prompt.user.contains("it's \"O'Brien\" & co"));
        assert!(prompt.user.contains("'Last Name'"));
        assert!(prompt.developer.is_some());
    }

    #[test]
    fn document_prompt_lists_documents_and_fields() {
        let prompts = Prompts::default();
        let prompt = prompts
            .extract_documents(
                &json!([{ "file": "passport.pdf", "content": "SMITH JOHN" }]),
                &["petitioner.Last_Name".to_owned()],
                &json!({ "petitioner": { "Last_Name": "NA" } }),
            )
            .unwrap();
        assert!(prompt.user.contains("DOCUMENT passport.pdf:"));
        assert!(prompt.user.contains("SMITH JOHN"));
        assert!(prompt.user.contains("- petitioner.Last_Name"));
        assert!(prompt.developer.is_none());
    }

    #[test]
    fn correct_json_prompt_embeds_both_inputs() {
        let prompts = Prompts::default();
        let prompt = prompts
            .correct_json(&json!({ "name": "X" }), &json!({ "name": "NA" }))
            .unwrap();
        assert!(prompt.user.contains("\"name\": \"X\""));
        assert!(prompt.user.contains("\"name\": \"NA\""));
        assert!(prompt.user.contains("{{FIELD_NAME}}"));
    }

    #[tokio::test]
    async fn partial_prompt_files_keep_other_defaults() {
        let dir = tempfile::TempDir::with_prefix("prompts").unwrap();
        let path = dir.path().join("prompts.toml");
        std::fs::write(&path, "ask_question = \"Please tell me your {{label}}.\"\n")
            .unwrap();
        let prompts = Prompts::load(Some(&path)).await.unwrap();
        assert_eq!(
            prompts.ask_question("City of Birth").unwrap().user,
            "Please tell me your City of Birth."
        );
        assert_eq!(prompts.explain_field, Prompts::default().explain_field);
    }

    #[tokio::test]
    async fn broken_templates_are_rejected_at_load_time() {
        let dir = tempfile::TempDir::with_prefix("prompts").unwrap();
        let path = dir.path().join("prompts.json");
        std::fs::write(&path, r#"{ "ask_question": "{{#each}}" }"#).unwrap();
        assert!(Prompts::load(Some(&path)).await.is_err());
    }
}
