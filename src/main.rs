use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cpu_limit;
mod dialogue;
mod drivers;
mod extract;
mod form;
mod generate;
mod llm_json;
mod prelude;
mod prompt;
mod reconcile;
mod record;
mod retry;
mod ui;

/// Extract, reconcile and conversationally complete form data, then fill a
/// PDF form.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL.
  - OPENAI_API_KEY: The OpenAI key to use.

  These variables may be set in a standard `.env` file.

External Tools:
  `extract` needs `pdftotext` and `pdftoppm` (from poppler-utils) and
  `tesseract` on the PATH.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Extract raw form data from a directory of PDFs and images.
    Extract(cmd::extract::ExtractOpts),
    /// Reshape raw extracted JSON to match the form template.
    Reconcile(cmd::reconcile::ReconcileOpts),
    /// Fill in missing fields by chatting, then fill the PDF.
    Chat(cmd::chat::ChatOpts),
    /// Fill the PDF form from a record.
    Fill(cmd::fill::FillOpts),
    /// List the empty fields in a PDF form.
    MissingFields(cmd::missing_fields::MissingFieldsOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Extract(opts) => opts.output_path.is_none(),
            Cmd::Reconcile(opts) => opts.output_path.is_none(),
            Cmd::Chat(_) => true,
            Cmd::Fill(_) => false,
            Cmd::MissingFields(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Extract(opts) => cmd::extract::cmd_extract(ui, opts).await,
        Cmd::Reconcile(opts) => cmd::reconcile::cmd_reconcile(opts).await,
        Cmd::Chat(opts) => cmd::chat::cmd_chat(ui, opts).await,
        Cmd::Fill(opts) => cmd::fill::cmd_fill(opts).await,
        Cmd::MissingFields(opts) => cmd::missing_fields::cmd_missing_fields(opts).await,
    }
}
