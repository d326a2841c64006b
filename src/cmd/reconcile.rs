//! The `reconcile` subcommand.

use clap::Args;

use crate::{
    async_utils::io::{read_json, write_json_output},
    drivers::LlmOpts,
    generate::Generator,
    prelude::*,
    reconcile::{reconcile, reconcile_with_fallback},
};

use super::{PromptOpts, TemplateOpts};

/// Reshape raw extracted JSON into a record matching the template.
#[derive(Debug, Args)]
pub struct ReconcileOpts {
    /// The raw JSON, as written by `extract`.
    pub input_path: PathBuf,

    /// Output path for the record. Defaults to standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,

    /// Use the model to reconcile the data, falling back to the
    /// deterministic reconciler if that fails.
    #[clap(long)]
    pub llm_reconcile: bool,

    #[command(flatten)]
    pub template_opts: TemplateOpts,

    #[command(flatten)]
    pub prompt_opts: PromptOpts,

    #[command(flatten)]
    pub llm_opts: LlmOpts,
}

/// Run the `reconcile` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_reconcile(opts: &ReconcileOpts) -> Result<()> {
    let template = opts.template_opts.load().await?;
    let raw = read_json(&opts.input_path).await?;
    let record = if opts.llm_reconcile {
        let prompts = opts.prompt_opts.load().await?;
        let generator = Generator::from_opts(&opts.llm_opts).await?;
        reconcile_with_fallback(&raw, &template, &generator, &prompts).await
    } else {
        reconcile(&raw, &template)
    };
    info!(
        fields = template.shape().leaf_count(),
        unresolved = record.unresolved().len(),
        "Reconciled record"
    );
    write_json_output(opts.output_path.as_deref(), &record).await
}
