//! The `extract` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    async_utils::io::write_json_output,
    drivers::LlmOpts,
    extract::{engines::CliTextExtractor, extract_documents, extract_fields},
    generate::Generator,
    prelude::*,
    record::RecordStore,
    reconcile::{reconcile, reconcile_with_fallback},
    ui::Ui,
};

use super::{PromptOpts, TemplateOpts};

/// Extract form data from a directory of documents.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// A directory of PDF, JPEG and PNG files.
    pub documents_dir: PathBuf,

    /// Output path for the raw extracted JSON. Defaults to standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    /// Also reconcile the extracted data against the template, and save the
    /// result as a record here, ready for `chat`.
    #[clap(long)]
    pub record: Option<PathBuf>,

    /// Use the model to reconcile the data, falling back to the
    /// deterministic reconciler if that fails.
    #[clap(long)]
    pub llm_reconcile: bool,

    /// Max number of documents to extract at a time.
    #[clap(short = 'j', long = "jobs", default_value = "4")]
    pub job_count: usize,

    #[command(flatten)]
    pub template_opts: TemplateOpts,

    #[command(flatten)]
    pub prompt_opts: PromptOpts,

    #[command(flatten)]
    pub llm_opts: LlmOpts,
}

/// Run the `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let template = opts.template_opts.load().await?;
    let prompts = opts.prompt_opts.load().await?;
    let generator = Generator::from_opts(&opts.llm_opts).await?;

    let documents = extract_documents(
        &ui,
        Arc::new(CliTextExtractor::new()),
        &opts.documents_dir,
        opts.job_count,
    )
    .await?;
    let raw = extract_fields(&documents, &template, &prompts, &generator).await;
    write_json_output(opts.output_path.as_deref(), &raw).await?;

    if let Some(record_path) = &opts.record {
        let record = if opts.llm_reconcile {
            reconcile_with_fallback(&raw, &template, &generator, &prompts).await
        } else {
            reconcile(&raw, &template)
        };
        info!(
            unresolved = record.unresolved().len(),
            "Saving record to {}",
            record_path.display()
        );
        RecordStore::new(record_path).save(&record).await?;
    }
    Ok(())
}
