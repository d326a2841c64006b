//! The text-generation collaborator.
//!
//! Everything that wants text from a language model goes through
//! [`TextGenerator`]. The production implementation, [`Generator`], retries
//! transient failures, and turns any remaining failure into an empty string
//! after logging it. Callers treat an empty string as "no useful answer".

use keen_retry::{ExponentialJitter, ResolvedResult};

use crate::{
    drivers::{Driver, LlmOpts},
    prelude::*,
    prompt::ChatPrompt,
};

/// Something which can turn a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`. Returns an empty string on failure.
    async fn generate(&self, prompt: &ChatPrompt) -> String;
}

/// A [`TextGenerator`] backed by an LLM [`Driver`].
#[derive(Debug)]
pub struct Generator {
    /// The driver to use.
    driver: Box<dyn Driver>,

    /// Options to pass to the driver.
    llm_opts: LlmOpts,
}

impl Generator {
    /// Create a generator using the driver selected by `llm_opts`.
    pub async fn from_opts(llm_opts: &LlmOpts) -> Result<Self> {
        let driver = llm_opts.driver.create_driver().await?;
        Ok(Self::new(driver, llm_opts.clone()))
    }

    /// Create a generator from an existing driver.
    pub fn new(driver: Box<dyn Driver>, llm_opts: LlmOpts) -> Self {
        Self { driver, llm_opts }
    }
}

#[async_trait]
impl TextGenerator for Generator {
    #[instrument(level = "debug", skip_all)]
    async fn generate(&self, prompt: &ChatPrompt) -> String {
        // Somebody is usually waiting on the other end of the chat, so we
        // don't back off for as long as a batch job would.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=5_000,
            re_attempts: 3,
            jitter_ratio: 0.2,
        };

        let result = self
            .driver
            .chat_completion(prompt, &self.llm_opts)
            .await
            .retry_with_async(|_| async {
                self.driver.chat_completion(prompt, &self.llm_opts).await
            })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_fatal(|_, fatal_error| {
                error!("LLM request FAILED with error {fatal_error:?}")
            })
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "LLM request suceeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "LLM request FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            });

        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                output.trim().to_owned()
            }
            ResolvedResult::Fatal { .. }
            | ResolvedResult::GivenUp { .. }
            | ResolvedResult::Unrecoverable { .. } => String::new(),
        }
    }
}
