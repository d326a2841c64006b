//! The conversational loop that fills in missing fields.
//!
//! A [`Session`] owns one [`Record`] and walks through its unresolved fields
//! in template order. Each call to [`DialogueEngine::turn`] consumes one line
//! of user input and does exactly one of these things:
//!
//! - ask about the next missing field,
//! - skip the pending field,
//! - explain the pending field, if the user asked a question,
//! - store a cleaned-up answer, or ask again if we couldn't understand it,
//! - or, once nothing is missing, hand the record off to be written to a PDF.
//!
//! Once a session is complete, it stays complete.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    generate::TextGenerator,
    prelude::*,
    prompt::{ChatPrompt, Prompts},
    record::{FieldPath, Record, RecordStore},
};

/// What we say when the user skips a field.
const SKIP_ACKNOWLEDGEMENT: &str = "Okay, skipping this one.";

/// What we say when we can't make sense of an answer.
const CLARIFICATION_REQUEST: &str = "I couldn't understand that. Could you rephrase?";

/// Prefixes which mark an input as a question, even without a `?`.
const QUESTION_PREFIXES: &[&str] = &["what", "where", "how", "do i"];

/// Cleaned values which mean "no answer".
const UNCLEAR_VALUES: &[&str] = &["", "na", "none", "not sure"];

/// A trailing parenthetical remark, like `Boston (city of birth)`.
static TRAILING_PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\([^)]*\)$").expect("built-in regex should be valid")
});

/// Who said something.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One message in the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    #[serde(rename = "role")]
    pub speaker: Speaker,
    #[serde(rename = "content")]
    pub text: String,
}

/// Where a session is in the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogueState {
    /// No field is pending. The next turn will pick one, or complete.
    AwaitingFieldSelection,
    /// We've asked about a field and are waiting for the reply.
    AwaitingUserReply,
    /// Every field is resolved and the form has been filled.
    Complete,
}

/// The outcome of a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnStatus {
    /// We asked the first question.
    AwaitingReply,
    /// We stored an answer (or skipped) and asked the next question.
    NextQuestion,
    /// We explained the pending field.
    NeedMoreInfo,
    /// We couldn't understand the answer, and will ask again.
    Unclear,
    /// The form is finished.
    Complete,
}

impl TurnStatus {
    /// A short status line to show the user.
    pub fn message(self) -> &'static str {
        match self {
            TurnStatus::AwaitingReply => "Awaiting your response.",
            TurnStatus::NextQuestion => "Next question coming...",
            TurnStatus::NeedMoreInfo => "Let me know if you need more info.",
            TurnStatus::Unclear => "Unclear input.",
            TurnStatus::Complete => "Form complete.",
        }
    }
}

/// The result of one call to [`DialogueEngine::turn`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnReply {
    /// What happened.
    pub status: TurnStatus,
    /// The filled form, once the session is complete.
    pub output_path: Option<PathBuf>,
}

impl TurnReply {
    fn new(status: TurnStatus) -> Self {
        Self {
            status,
            output_path: None,
        }
    }
}

/// Somewhere to send a finished record.
#[async_trait]
pub trait FormSink: Send + Sync {
    /// Write `record` into a form, returning the path of the result.
    async fn fill(&self, record: &Record) -> Result<PathBuf>;
}

/// The state of one conversation, owned by the caller.
#[derive(Debug)]
pub struct Session {
    /// The record we're completing.
    record: Record,
    /// Unresolved fields, recomputed from `record` after every change.
    fields: Vec<FieldPath>,
    /// The field we're waiting for an answer about.
    current: Option<FieldPath>,
    /// Everything said so far.
    history: Vec<HistoryEntry>,
    /// Has `record` changed since we loaded it?
    dirty: bool,
    /// Where to persist `record`, if anywhere.
    store: Option<RecordStore>,
    /// The filled form, once we're done.
    completed: Option<PathBuf>,
}

impl Session {
    /// Start a session for `record`, without persistence.
    pub fn new(record: Record) -> Self {
        let fields = record.unresolved();
        Self {
            record,
            fields,
            current: None,
            history: vec![],
            dirty: false,
            store: None,
            completed: None,
        }
    }

    /// Persist the record to `store` after every change.
    pub fn with_store(mut self, store: RecordStore) -> Self {
        self.store = Some(store);
        self
    }

    /// The record in its current state.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// The conversation so far.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// The field we're waiting on, if any.
    pub fn current(&self) -> Option<&FieldPath> {
        self.current.as_ref()
    }

    /// Fields which still hold the sentinel.
    pub fn unresolved(&self) -> &[FieldPath] {
        &self.fields
    }

    /// Has the record changed?
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Where we are in the conversation.
    pub fn state(&self) -> DialogueState {
        if self.completed.is_some() {
            DialogueState::Complete
        } else if self.current.is_some() {
            DialogueState::AwaitingUserReply
        } else {
            DialogueState::AwaitingFieldSelection
        }
    }

    /// The filled form, once complete.
    pub fn output_path(&self) -> Option<&Path> {
        self.completed.as_deref()
    }

    fn say(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.history.push(HistoryEntry {
            speaker,
            text: text.into(),
        });
    }

    /// Store a value and recompute what's left to ask. The new record is
    /// saved first, so if saving fails the session is left unchanged.
    async fn update(&mut self, path: &FieldPath, value: &str) -> Result<()> {
        debug!(%path, %value, "Updating field");
        let mut record = self.record.clone();
        record.set(path, value)?;
        self.save(&record).await?;
        self.record = record;
        self.fields = self.record.unresolved();
        self.dirty = true;
        Ok(())
    }

    async fn save(&self, record: &Record) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(record).await.with_context(|| {
                format!("Failed to save record to {}", store.path().display())
            })?;
        }
        Ok(())
    }
}

/// Runs turns against a [`Session`], using its collaborators.
pub struct DialogueEngine<'a> {
    generator: &'a dyn TextGenerator,
    prompts: &'a Prompts,
    sink: &'a dyn FormSink,
}

impl<'a> DialogueEngine<'a> {
    /// Create a new engine.
    pub fn new(
        generator: &'a dyn TextGenerator,
        prompts: &'a Prompts,
        sink: &'a dyn FormSink,
    ) -> Self {
        Self {
            generator,
            prompts,
            sink,
        }
    }

    /// Process one line of user input. Pass an empty string to start the
    /// conversation.
    ///
    /// Errors only come from persisting the record or filling the form. Model
    /// failures show up as empty or unclear messages instead.
    #[instrument(level = "debug", skip_all, fields(current = ?session.current))]
    pub async fn turn(&self, session: &mut Session, input: &str) -> Result<TurnReply> {
        if let Some(path) = &session.completed {
            return Ok(TurnReply {
                status: TurnStatus::Complete,
                output_path: Some(path.clone()),
            });
        }

        let Some(current) = session.current.clone() else {
            return self.select_next(session, TurnStatus::AwaitingReply).await;
        };

        session.say(Speaker::User, input);

        if input.trim().eq_ignore_ascii_case("skip") {
            session.update(&current, "").await?;
            session.current = None;
            session.say(Speaker::Assistant, SKIP_ACKNOWLEDGEMENT);
            return self.select_next(session, TurnStatus::NextQuestion).await;
        }

        let label = current.label();
        if is_question(input) {
            let explanation = self
                .generate(self.prompts.explain_field(&label, input))
                .await;
            session.say(Speaker::Assistant, explanation);
            return Ok(TurnReply::new(TurnStatus::NeedMoreInfo));
        }

        let raw = self
            .generate(self.prompts.extract_value(&label, input))
            .await;
        let value = clean_value(&raw);
        if is_unclear(&value) {
            debug!(%raw, "Unclear answer");
            session.say(Speaker::Assistant, CLARIFICATION_REQUEST);
            return Ok(TurnReply::new(TurnStatus::Unclear));
        }

        session.update(&current, &value).await?;
        session.current = None;
        self.select_next(session, TurnStatus::NextQuestion).await
    }

    /// Ask about the first unresolved field, or complete the session.
    async fn select_next(&self, session: &mut Session, status: TurnStatus) -> Result<TurnReply> {
        let Some(next) = session.fields.first().cloned() else {
            return self.complete(session).await;
        };
        let question = self
            .generate(self.prompts.ask_question(&next.question_label()))
            .await;
        session.current = Some(next);
        session.say(Speaker::Assistant, question);
        Ok(TurnReply::new(status))
    }

    async fn complete(&self, session: &mut Session) -> Result<TurnReply> {
        if session.dirty {
            session.save(&session.record).await?;
        }
        let path = self.sink.fill(&session.record).await?;
        info!("Form complete: {}", path.display());
        session.completed = Some(path.clone());
        Ok(TurnReply {
            status: TurnStatus::Complete,
            output_path: Some(path),
        })
    }

    /// Run a prompt. A prompt that fails to render counts as a failed
    /// generation.
    async fn generate(&self, prompt: Result<ChatPrompt>) -> String {
        match prompt {
            Ok(prompt) => self.generator.generate(&prompt).await,
            Err(err) => {
                error!("Could not render prompt: {err:?}");
                String::new()
            }
        }
    }
}

/// Does this input look like a question about the field?
fn is_question(input: &str) -> bool {
    let lower = input.to_lowercase();
    input.contains('?') || QUESTION_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Strip any trailing parenthetical remark and surrounding whitespace.
fn clean_value(raw: &str) -> String {
    TRAILING_PARENTHETICAL
        .replace(raw.trim(), "")
        .trim()
        .to_owned()
}

/// Does this cleaned value mean "no answer"?
fn is_unclear(value: &str) -> bool {
    UNCLEAR_VALUES.contains(&value.to_lowercase().as_str())
}
