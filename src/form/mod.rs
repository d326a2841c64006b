//! Writing records into fillable PDF forms.
//!
//! A [`MappingTable`] says which record field goes into which PDF field. We
//! set values directly on the form fields and leave appearance streams alone,
//! so the output looks right in viewers that honor `/NeedAppearances` (which
//! we can optionally set) or regenerate appearances themselves.

use std::io;

use clap::Args;
use indexmap::IndexMap;
use lopdf::{Document, Object};

use crate::{
    async_utils::blocking::spawn_blocking_propagating_panics,
    dialogue::FormSink,
    prelude::*,
    record::Record,
};

pub mod mapping;
pub mod pdf;

pub use self::mapping::MappingTable;
use self::pdf::{FieldKind, encode_text_string, scan_widgets, set_key, set_need_appearances};

/// Options for filling PDF forms.
#[derive(Args, Clone, Debug)]
pub struct FormOpts {
    /// A directory of JSON or TOML files mapping PDF field names to dotted
    /// record paths.
    #[clap(long, default_value = "filling_input/mappings")]
    pub mappings_dir: PathBuf,

    /// The blank, fillable PDF form.
    #[clap(long, default_value = "filling_input/i-130.pdf")]
    pub template_pdf: PathBuf,

    /// Where to write the filled PDF. Any existing file is replaced.
    #[clap(long, default_value = "output/filled_form.pdf")]
    pub output_pdf: PathBuf,

    /// Ask PDF viewers to regenerate field appearances from our values.
    #[clap(long)]
    pub need_appearances: bool,
}

/// Fills a template PDF and writes the result.
#[derive(Clone, Debug)]
pub struct FormFiller {
    mappings: MappingTable,
    template_pdf: PathBuf,
    output_pdf: PathBuf,
    need_appearances: bool,
}

impl FormFiller {
    /// Create a filler, loading mappings from disk.
    pub async fn from_opts(opts: &FormOpts) -> Result<Self> {
        let mappings = MappingTable::load_dir(&opts.mappings_dir).await?;
        Ok(Self::new(mappings, &opts.template_pdf, &opts.output_pdf)
            .with_need_appearances(opts.need_appearances))
    }

    /// Create a filler from an existing mapping table.
    pub fn new(
        mappings: MappingTable,
        template_pdf: impl Into<PathBuf>,
        output_pdf: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mappings,
            template_pdf: template_pdf.into(),
            output_pdf: output_pdf.into(),
            need_appearances: false,
        }
    }

    /// Set `/NeedAppearances` in the output.
    pub fn with_need_appearances(mut self, need_appearances: bool) -> Self {
        self.need_appearances = need_appearances;
        self
    }

    /// Fill the form from `record`, using our mapping table. Returns the path
    /// of the output PDF.
    #[instrument(level = "debug", skip_all, fields(output = %self.output_pdf.display()))]
    pub async fn fill(&self, record: &Record) -> Result<PathBuf> {
        let flat = record.flatten();
        let values = self
            .mappings
            .iter()
            .filter_map(|(pdf_field, record_path)| {
                let value = flat.get(record_path)?;
                Some((pdf_field.to_owned(), value.clone()))
            })
            .collect::<IndexMap<_, _>>();
        self.write_values(values).await
    }

    /// Fill the form directly from PDF field names, ignoring our mapping
    /// table.
    #[instrument(level = "debug", skip_all, fields(output = %self.output_pdf.display()))]
    pub async fn fill_by_field_name(
        &self,
        values: &IndexMap<String, String>,
    ) -> Result<PathBuf> {
        self.write_values(values.clone()).await
    }

    async fn write_values(&self, values: IndexMap<String, String>) -> Result<PathBuf> {
        let template_pdf = self.template_pdf.clone();
        let need_appearances = self.need_appearances;
        let bytes = spawn_blocking_propagating_panics(move || -> Result<Vec<u8>> {
            let mut doc = Document::load(&template_pdf).with_context(|| {
                format!("Failed to load PDF template: {:?}", template_pdf)
            })?;
            fill_document(&mut doc, &values)?;
            if need_appearances {
                set_need_appearances(&mut doc)?;
            }
            let mut bytes = vec![];
            doc.save_to(&mut bytes).context("Failed to serialize PDF")?;
            Ok(bytes)
        })
        .await?;

        // Replace any previous output.
        match tokio::fs::remove_file(&self.output_pdf).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to remove old output: {:?}", self.output_pdf)
                });
            }
        }
        if let Some(parent) = self.output_pdf.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create output directory: {:?}", parent)
                })?;
            }
        }
        tokio::fs::write(&self.output_pdf, bytes)
            .await
            .with_context(|| format!("Failed to write PDF: {:?}", self.output_pdf))?;
        Ok(self.output_pdf.clone())
    }
}

#[async_trait]
impl FormSink for FormFiller {
    async fn fill(&self, record: &Record) -> Result<PathBuf> {
        FormFiller::fill(self, record).await
    }
}

/// Write `values` (keyed by PDF field name) into the form fields of `doc`.
///
/// Fields we have no value for, and fields we can't make sense of, are left
/// alone.
fn fill_document(doc: &mut Document, values: &IndexMap<String, String>) -> Result<()> {
    let mut filled = 0;
    for widget in scan_widgets(doc) {
        let Some(value) = values.get(&widget.name) else {
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        match (widget.kind, &widget.on_state) {
            (Some(FieldKind::Text | FieldKind::Choice), _) => {
                set_key(doc, widget.field_id, "V", encode_text_string(value))?;
            }
            // Any non-empty value checks the box. We always write the form's
            // own "on" state, never the value itself.
            (Some(FieldKind::Button), Some(on_state)) => {
                set_key(doc, widget.field_id, "V", Object::Name(on_state.clone()))?;
                set_key(doc, widget.widget_id, "AS", Object::Name(on_state.clone()))?;
            }
            (Some(FieldKind::Button), None) => {
                debug!(field = %widget.name, "Skipping checkbox without an \"on\" state");
                continue;
            }
            (None, _) => {
                debug!(field = %widget.name, "Skipping field of unknown type");
                continue;
            }
        }
        filled += 1;
    }
    info!(filled, "Filled PDF fields");
    Ok(())
}

/// Fields in a PDF form which don't have a value yet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MissingFields {
    pub text: Vec<String>,
    pub checkboxes: Vec<String>,
    pub dropdowns: Vec<String>,
}

/// List the empty fields in `template_pdf`, by type.
#[instrument(level = "debug")]
pub async fn missing_fields(template_pdf: &Path) -> Result<MissingFields> {
    let template_pdf = template_pdf.to_owned();
    spawn_blocking_propagating_panics(move || -> Result<MissingFields> {
        let doc = Document::load(&template_pdf)
            .with_context(|| format!("Failed to load PDF: {:?}", template_pdf))?;
        let mut missing = MissingFields::default();
        for widget in scan_widgets(&doc) {
            let value = widget.value.as_deref().unwrap_or("");
            let list = match widget.kind {
                Some(FieldKind::Text) if value.is_empty() => &mut missing.text,
                Some(FieldKind::Button) if matches!(value, "" | "Off" | "off") => {
                    &mut missing.checkboxes
                }
                Some(FieldKind::Choice) if value.is_empty() => &mut missing.dropdowns,
                _ => continue,
            };
            // Fields with several widgets only count once.
            if !list.contains(&widget.name) {
                list.push(widget.name);
            }
        }
        Ok(missing)
    })
    .await
}
