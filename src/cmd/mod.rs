//! Command-line entry points.

use clap::Args;

use crate::{prelude::*, prompt::Prompts, record::Template};

pub mod chat;
pub mod extract;
pub mod fill;
pub mod missing_fields;
pub mod reconcile;

/// Options for subcommands that need the form's template.
#[derive(Debug, Clone, Args)]
pub struct TemplateOpts {
    /// A JSON file describing every field we need to collect. Leaf values are
    /// ignored.
    #[clap(long = "template", default_value = "filling_input/pet1.json")]
    pub template_path: PathBuf,
}

impl TemplateOpts {
    /// Load our template.
    pub async fn load(&self) -> Result<Template> {
        Template::load(&self.template_path).await
    }
}

/// Options for subcommands that talk to a model.
#[derive(Debug, Clone, Args)]
pub struct PromptOpts {
    /// A TOML or JSON file overriding some or all of the built-in prompt
    /// templates.
    #[clap(long = "prompts")]
    pub prompts_path: Option<PathBuf>,
}

impl PromptOpts {
    /// Load our prompts.
    pub async fn load(&self) -> Result<Prompts> {
        Prompts::load(self.prompts_path.as_deref()).await
    }
}
