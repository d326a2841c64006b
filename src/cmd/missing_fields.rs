//! The `missing-fields` subcommand.

use clap::Args;

use crate::{async_utils::io::write_json_output, form::missing_fields, prelude::*};

/// List the empty fields in a PDF form, by type.
#[derive(Debug, Args)]
pub struct MissingFieldsOpts {
    /// The PDF form to inspect.
    #[clap(long, default_value = "filling_input/i-130.pdf")]
    pub template_pdf: PathBuf,

    /// Output path for the JSON report. Defaults to standard output.
    #[clap(short = 'o', long = "output")]
    pub output_path: Option<PathBuf>,
}

/// Run the `missing-fields` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_missing_fields(opts: &MissingFieldsOpts) -> Result<()> {
    let missing = missing_fields(&opts.template_pdf).await?;
    write_json_output(opts.output_path.as_deref(), &missing).await
}
