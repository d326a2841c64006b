//! The `chat` subcommand.

use clap::Args;
use tokio::io::{AsyncBufReadExt as _, BufReader};

use crate::{
    async_utils::io::write_json_output,
    dialogue::{DialogueEngine, Session, Speaker, TurnStatus},
    drivers::LlmOpts,
    form::{FormFiller, FormOpts},
    generate::Generator,
    prelude::*,
    record::{Record, RecordStore},
    ui::Ui,
};

use super::{PromptOpts, TemplateOpts};

/// Fill in missing fields by chatting on standard input and output.
#[derive(Debug, Args)]
pub struct ChatOpts {
    /// The record to complete. It is saved after every answer. If it doesn't
    /// exist yet, we start from a blank copy of the template.
    #[clap(long, default_value = "FinalPetitioner.json")]
    pub record: PathBuf,

    /// Write the conversation to this file as JSON when we exit.
    #[clap(long)]
    pub transcript: Option<PathBuf>,

    #[command(flatten)]
    pub template_opts: TemplateOpts,

    #[command(flatten)]
    pub form_opts: FormOpts,

    #[command(flatten)]
    pub prompt_opts: PromptOpts,

    #[command(flatten)]
    pub llm_opts: LlmOpts,
}

/// Run the `chat` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_chat(ui: Ui, opts: &ChatOpts) -> Result<()> {
    let prompts = opts.prompt_opts.load().await?;
    let generator = Generator::from_opts(&opts.llm_opts).await?;
    let filler = FormFiller::from_opts(&opts.form_opts).await?;
    let record = load_or_create_record(opts).await?;
    let mut session = Session::new(record).with_store(RecordStore::new(&opts.record));
    let engine = DialogueEngine::new(&generator, &prompts, &filler);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = 0;
    let mut reply = engine.turn(&mut session, "").await?;
    loop {
        shown = show_new_messages(&ui, &session, shown)?;
        debug!(status = reply.status.message(), "Turn finished");
        if reply.status == TurnStatus::Complete {
            match &reply.output_path {
                Some(path) => ui.print_line(&format!("Form complete. Wrote {}", path.display()))?,
                None => ui.print_line(TurnStatus::Complete.message())?,
            }
            break;
        }
        ui.print("> ")?;
        let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read from standard input")?
        else {
            info!(
                remaining = session.unresolved().len(),
                "End of input, progress saved to {}",
                opts.record.display()
            );
            break;
        };
        reply = engine.turn(&mut session, line.trim()).await?;
    }

    if let Some(transcript) = &opts.transcript {
        write_json_output(Some(transcript), session.history()).await?;
    }
    Ok(())
}

/// Load our record, or start a blank one from the template. An existing
/// record gets any template fields it's missing, so we ask about them too.
async fn load_or_create_record(opts: &ChatOpts) -> Result<Record> {
    let template = opts.template_opts.load().await?;
    if tokio::fs::try_exists(&opts.record).await.unwrap_or(false) {
        let mut record = Record::load(&opts.record).await?;
        let added = template.add_missing_fields(&mut record);
        if added > 0 {
            info!(added, "Added missing template fields to {}", opts.record.display());
        }
        Ok(record)
    } else {
        info!(
            "No record at {}, starting from the template",
            opts.record.display()
        );
        Ok(template.blank_record())
    }
}

/// Print any assistant messages we haven't shown yet. Returns the new count of
/// history entries seen.
fn show_new_messages(ui: &Ui, session: &Session, shown: usize) -> Result<usize> {
    let history = session.history();
    for entry in history.iter().skip(shown) {
        if entry.speaker == Speaker::Assistant {
            ui.print_line(&entry.text)?;
        }
    }
    Ok(history.len())
}
