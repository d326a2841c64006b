//! Echo driver for testing.
//!
//! This driver echoes back the user message, which is enough to drive a whole
//! dialogue end-to-end without talking to a real model.

use crate::{prelude::*, prompt::ChatPrompt, retry::retry_result_ok};

use super::{Driver, LlmOpts, LlmRetryResult};

/// Echo driver for testing.
#[derive(Debug)]
pub struct EchoDriver;

impl EchoDriver {
    /// Create a new echo driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for EchoDriver {
    async fn chat_completion(
        &self,
        prompt: &ChatPrompt,
        _llm_opts: &LlmOpts,
    ) -> LlmRetryResult<String> {
        retry_result_ok(prompt.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use keen_retry::RetryResult;

    use super::*;

    #[tokio::test]
    async fn echoes_user_message() {
        let prompt = ChatPrompt {
            developer: Some("ignored".to_owned()),
            user: "hello".to_owned(),
        };
        let result = EchoDriver::new()
            .chat_completion(&prompt, &LlmOpts::default())
            .await;
        match result {
            RetryResult::Ok { output, .. } => assert_eq!(output, "hello"),
            _ => panic!("echo driver should always succeed"),
        }
    }
}
