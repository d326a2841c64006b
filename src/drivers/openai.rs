//! Our OpenAI driver, which we also use for LiteLLM, Ollama and other
//! compatible gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        FinishReason,
    },
};

use crate::{
    prelude::*,
    prompt::ChatPrompt,
    retry::{
        IsKnownTransient, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient,
    },
};

use super::{Driver, LlmOpts, LlmRetryResult};

/// Our OpenAI driver, which we also use for LiteLLM, Ollama and other
/// compatible gateways.
#[derive(Debug)]
pub struct OpenAiDriver {
    /// The OpenAI client.
    pub client: Client<OpenAIConfig>,
}

impl OpenAiDriver {
    /// Create a new OpenAI driver.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            client: Client::with_config(get_openai_client_config()),
        })
    }
}

/// Build an OpenAI client configuration from the standard environment
/// variables.
pub fn get_openai_client_config() -> OpenAIConfig {
    let mut client_config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        client_config = client_config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    client_config
}

/// Convert our prompt into OpenAI messages.
fn to_openai_messages(prompt: &ChatPrompt) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages = vec![];
    if let Some(developer) = &prompt.developer {
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(developer.as_str())
                .build()
                .context("Error building system message")?
                .into(),
        );
    }
    messages.push(
        ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.user.as_str())
            .build()
            .context("Error building user message")?
            .into(),
    );
    Ok(messages)
}

#[async_trait]
impl Driver for OpenAiDriver {
    #[instrument(level = "debug", skip_all, fields(model = %llm_opts.model))]
    async fn chat_completion(
        &self,
        prompt: &ChatPrompt,
        llm_opts: &LlmOpts,
    ) -> LlmRetryResult<String> {
        let messages = try_fatal!(to_openai_messages(prompt));

        // Turn our prompt into a chat request.
        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(llm_opts.model.clone()).messages(messages);
        if let Some(max_completion_tokens) = llm_opts.max_completion_tokens {
            req.max_completion_tokens(max_completion_tokens);
        }
        if let Some(temperature) = llm_opts.temperature {
            req.temperature(temperature);
        }
        let req = try_fatal!(req.build().context("Error building request"));
        trace!(?req, "Request");

        // Call OpenAI.
        let chat = self.client.chat();
        let response = try_potentially_transient!(
            llm_opts.apply_timeout(chat.create(req)).await
        );

        // Get the content from our response.
        let choice = match response.choices.first() {
            Some(choice) => choice,
            None => {
                return retry_result_fatal(anyhow!("No choices in OpenAI response"));
            }
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        let content = choice.message.content.clone().unwrap_or_default();
        debug!(%content, "Response");
        retry_result_ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn developer_message_comes_first() {
        let prompt = ChatPrompt {
            developer: Some("be brief".to_owned()),
            user: "hi".to_owned(),
        };
        let messages = to_openai_messages(&prompt).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn no_developer_message_means_one_message() {
        let prompt = ChatPrompt {
            developer: None,
            user: "hi".to_owned(),
        };
        assert_eq!(to_openai_messages(&prompt).unwrap().len(), 1);
    }
}
