//! OpenAI vision provider.

use crate::data_url::data_url;
use crate::prelude::*;

use super::{
    ProviderError, Reconstruction, RequestPolicy, VisionProvider, request_json_with_retry,
};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";

/// Reconstruction via OpenAI's vision-capable chat models.
pub struct OpenAiVision {
    client: reqwest::Client,
    api_key: String,
    model: String,
    policy: RequestPolicy,
}

impl OpenAiVision {
    pub fn new(client: reqwest::Client, api_key: String, policy: RequestPolicy) -> Self {
        Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_owned(),
            policy,
        }
    }

    /// Override the model id.
    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }
}

#[async_trait]
impl VisionProvider for OpenAiVision {
    fn name(&self) -> &'static str {
        "openai"
    }

    #[instrument(level = "debug", skip_all)]
    async fn reconstruct(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> Result<Reconstruction, ProviderError> {
        let payload = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {
                        "type": "image_url",
                        "image_url": {"url": data_url("image/jpeg", image)},
                    },
                ],
            }],
            "max_tokens": 2000,
        });

        let data = request_json_with_retry(&self.policy, || {
            self.client
                .post(API_URL)
                .bearer_auth(&self.api_key)
                .json(&payload)
        })
        .await?;

        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::ParseFailure("No message content in OpenAI response".to_owned())
            })?;
        Ok(Reconstruction {
            text: text.to_owned(),
            model: self.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model() {
        let provider = OpenAiVision::new(
            reqwest::Client::new(),
            "sk-test".to_owned(),
            RequestPolicy::default(),
        );
        assert_eq!(provider.model, "gpt-4o");
        assert_eq!(provider.name(), "openai");

        let provider = provider.with_model("gpt-4o-mini".to_owned());
        assert_eq!(provider.model, "gpt-4o-mini");
    }
}
