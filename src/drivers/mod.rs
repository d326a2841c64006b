//! LLM drivers.
//!
//! A driver knows how to send one [`ChatPrompt`] to one kind of backend and
//! get text back. Retries, timeouts and the "never fail a turn" policy live in
//! [`crate::generate`], so drivers only need to classify their errors as
//! transient or fatal.

use std::{error, fmt, pin::Pin, time::Duration};

use clap::{Args, ValueEnum};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::RetryResult;
use tokio::time;

use crate::{prelude::*, prompt::ChatPrompt, retry::IsKnownTransient};

pub mod echo;
pub mod openai;

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// OpenAI driver (also for LiteLLM, Ollama, etc).
    #[default]
    #[clap(name = "openai")]
    OpenAI,

    /// Echo the user message back. Useful for testing without a model.
    Echo,
}

impl DriverType {
    /// Instantiate an appropriate driver.
    pub async fn create_driver(&self) -> Result<Box<dyn Driver>> {
        match self {
            DriverType::OpenAI => Ok(Box::new(openai::OpenAiDriver::new().await?)),
            DriverType::Echo => Ok(Box::new(echo::EchoDriver::new())),
        }
    }
}

/// Our LLM-related options.
#[derive(Args, Clone, Debug)]
pub struct LlmOpts {
    /// The LLM driver to use. This defaults to `openai`, which works with
    /// OpenAI, LiteLLM and Ollama-based models.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// The model to use.
    #[clap(short = 'm', long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// An upper limit on the number of completion tokens to generate.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Defaults to
    /// the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// A timeout, in seconds, for the LLM to return a complete response. A
    /// request that times out counts as a failed turn, and we ask again.
    #[clap(long, default_value = "60")]
    pub timeout: u64,
}

impl Default for LlmOpts {
    fn default() -> Self {
        Self {
            driver: DriverType::default(),
            model: "gpt-4o-mini".to_owned(),
            max_completion_tokens: None,
            temperature: None,
            timeout: 60,
        }
    }
}

impl LlmOpts {
    /// Apply our timeout to a future.
    ///
    /// `'fut` is the lifetime of any data borrowed by `future`, which we need
    /// to preserve. We box the output because the timeout wrapper changes the
    /// future's concrete type.
    pub fn apply_timeout<'fut, T, E>(
        &self,
        future: impl Future<Output = Result<T, E>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, LlmError<E>>> + Send + 'fut>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let future = future.map_err(LlmError::Native);
        time::timeout(Duration::from_secs(self.timeout), future)
            // We have a `Result<Result<T, LlmError<E>>, Elapsed>` here, and
            // we want to convert it to a `Result<T, LlmError<E>>`.
            .map(|result| match result {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::Timeout),
            })
            .boxed()
    }
}

/// A [`RetryResult`] for LLM requests. This allows [`Driver`] instances to
/// distinguish between errors that may be transient, and errors that are
/// definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Interface trait for LLM drivers.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync + 'static {
    /// Run a "chat completion" request, returning the text of the reply.
    async fn chat_completion(
        &self,
        prompt: &ChatPrompt,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<String>;
}

/// An error which occurred while calling an LLM.
///
/// Used internally by drivers to handle timeouts.
#[derive(Debug)]
pub enum LlmError<E> {
    /// A native error.
    Native(E),

    /// A timeout error.
    Timeout,
}

impl<E> IsKnownTransient for LlmError<E>
where
    E: IsKnownTransient,
{
    /// Is this a known transient error?
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Native(err) => err.is_known_transient(),
            // Runaway LLM responses and some kinds of network timeouts can be retried
            // with hope of a better result.
            LlmError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for LlmError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Native(err) => write!(f, "LLM error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl<E> error::Error for LlmError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmError::Native(err) => Some(err),
            LlmError::Timeout => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Permanent;

    impl fmt::Display for Permanent {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "permanent")
        }
    }

    impl error::Error for Permanent {}

    impl IsKnownTransient for Permanent {
        fn is_known_transient(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn timeouts_are_transient() {
        let opts = LlmOpts {
            timeout: 0,
            ..LlmOpts::default()
        };
        let result = opts
            .apply_timeout(async {
                time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Permanent>(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
        assert!(err.is_known_transient());
        assert_eq!(err.to_string(), "LLM request timed out");
    }

    #[tokio::test]
    async fn native_errors_keep_their_classification() {
        let opts = LlmOpts::default();
        let err = opts
            .apply_timeout(async { Err::<(), _>(Permanent) })
            .await
            .unwrap_err();
        assert!(!err.is_known_transient());
        assert_eq!(err.to_string(), "LLM error: permanent");
    }
}
