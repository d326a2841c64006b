//! Extracting raw form data from a directory of uploaded documents.
//!
//! Each supported file is turned into text by a [`TextExtractor`], using a
//! bounded, unordered pool of workers. Files that fail or yield no text are
//! logged and left out. The surviving documents are then sent to the model in
//! a single prompt, which returns JSON of whatever shape it likes. That JSON
//! still needs to be reconciled against a template.

use std::{error, fmt, sync::Arc};

use futures::{StreamExt as _, stream};

use crate::{
    generate::TextGenerator,
    llm_json::parse_llm_object,
    prelude::*,
    prompt::Prompts,
    record::Template,
    ui::{ProgressConfig, Ui},
};

pub mod engines;

use self::engines::{DocumentKind, TextExtractor};

/// The text of one uploaded file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Document {
    /// The file name, without its directory.
    pub file: String,
    /// The extracted text.
    pub content: String,
}

/// Returned when no file in a directory produced any text.
#[derive(Debug)]
pub struct NoDocumentsError {
    /// The directory we searched.
    pub dir: PathBuf,
}

impl fmt::Display for NoDocumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no readable documents found in {}", self.dir.display())
    }
}

impl error::Error for NoDocumentsError {}

/// List the files in `dir` that we know how to read, sorted by name.
pub async fn list_documents(dir: &Path) -> Result<Vec<(PathBuf, DocumentKind)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read directory: {:?}", dir))?;
    let mut files = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read directory: {:?}", dir))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.is_ok_and(|ty| ty.is_file());
        match DocumentKind::from_path(&path) {
            Some(kind) if is_file => files.push((path, kind)),
            _ => trace!(path = %path.display(), "Skipping unsupported file"),
        }
    }
    files.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(files)
}

/// Extract text from every supported file in `dir`, running up to `jobs`
/// extractions at once.
///
/// Returns a [`NoDocumentsError`] if nothing usable was found.
#[instrument(level = "debug", skip(ui, extractor))]
pub async fn extract_documents(
    ui: &Ui,
    extractor: Arc<dyn TextExtractor>,
    dir: &Path,
    jobs: usize,
) -> Result<Vec<Document>> {
    let files = list_documents(dir).await?;
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Extracting documents",
            done_msg: "Extracted documents",
        },
        files.len() as u64,
    );

    let work = files.into_iter().map(|(path, kind)| {
        let extractor = extractor.clone();
        async move { extract_document(extractor.as_ref(), &path, kind).await }
    });
    let results = pb
        .wrap_stream(stream::iter(work).buffer_unordered(jobs.max(1)))
        .collect::<Vec<_>>()
        .await;

    let mut documents = results.into_iter().flatten().collect::<Vec<_>>();
    if documents.is_empty() {
        warn!("No valid documents found in {}", dir.display());
        return Err(NoDocumentsError {
            dir: dir.to_owned(),
        }
        .into());
    }
    documents.sort_by(|a, b| a.file.cmp(&b.file));
    for document in &documents {
        let preview = document.content.chars().take(500).collect::<String>();
        info!("Extracted from {}:\n{}", document.file, preview);
    }
    Ok(documents)
}

/// Extract a single file, logging and discarding any failure.
async fn extract_document(
    extractor: &dyn TextExtractor,
    path: &Path,
    kind: DocumentKind,
) -> Option<Document> {
    let file = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    match extractor.extract_text(path, kind).await {
        Ok(content) if !content.trim().is_empty() => Some(Document {
            file,
            content: content.trim().to_owned(),
        }),
        Ok(_) => {
            warn!("No text found in {file}");
            None
        }
        Err(err) => {
            error!("Error extracting text from {file}: {err:?}");
            None
        }
    }
}

/// Ask the model to pull the template's fields out of `documents`.
///
/// Returns an empty object if the model's reply can't be parsed.
#[instrument(level = "debug", skip_all, fields(documents = documents.len()))]
pub async fn extract_fields(
    documents: &[Document],
    template: &Template,
    prompts: &Prompts,
    generator: &dyn TextGenerator,
) -> Value {
    let fields = template
        .shape()
        .leaf_paths()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let prompt = match serde_json::to_value(documents)
        .context("Failed to serialize documents")
        .and_then(|docs| {
            prompts.extract_documents(&docs, &fields, &template.shape().to_json())
        }) {
        Ok(prompt) => prompt,
        Err(err) => {
            error!("Could not build extraction prompt: {err:?}");
            return json!({});
        }
    };
    let reply = generator.generate(&prompt).await;
    match parse_llm_object(&reply) {
        Ok(map) => Value::Object(map),
        Err(err) => {
            error!("Could not parse extracted JSON: {err:?}. Raw response: {reply}");
            json!({})
        }
    }
}
