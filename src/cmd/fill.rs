//! The `fill` subcommand.

use clap::Args;
use indexmap::IndexMap;

use crate::{
    async_utils::io::read_json_or_toml,
    form::{FormFiller, FormOpts},
    prelude::*,
    record::Record,
};

/// Fill the PDF form from a record.
#[derive(Debug, Args)]
pub struct FillOpts {
    /// The record to write into the form.
    #[clap(long, default_value = "FinalPetitioner.json")]
    pub record: PathBuf,

    /// Treat the input as a flat object of PDF field names and values,
    /// bypassing the field mappings.
    #[clap(long)]
    pub by_field_name: bool,

    #[command(flatten)]
    pub form_opts: FormOpts,
}

/// Run the `fill` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_fill(opts: &FillOpts) -> Result<()> {
    let output = if opts.by_field_name {
        let values = read_json_or_toml::<IndexMap<String, String>>(&opts.record).await?;
        let filler = FormFiller::new(
            Default::default(),
            &opts.form_opts.template_pdf,
            &opts.form_opts.output_pdf,
        )
        .with_need_appearances(opts.form_opts.need_appearances);
        filler.fill_by_field_name(&values).await?
    } else {
        let record = Record::load(&opts.record).await?;
        let filler = FormFiller::from_opts(&opts.form_opts).await?;
        filler.fill(&record).await?
    };
    info!("Wrote filled form to {}", output.display());
    Ok(())
}
