//! Perplexity vision provider. The API is OpenAI-shaped.

use crate::data_url::data_url;
use crate::prelude::*;

use super::{
    ProviderError, Reconstruction, RequestPolicy, VisionProvider, request_json_with_retry,
};

const API_URL: &str = "https://api.perplexity.ai/chat/completions";
const DEFAULT_MODEL: &str = "sonar-pro";

/// Reconstruction via Perplexity's multimodal chat models.
pub struct PerplexityVision {
    client: reqwest::Client,
    api_key: String,
    model: String,
    policy: RequestPolicy,
}

impl PerplexityVision {
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
impl VisionProvider for PerplexityVision {
    fn name(&self) -> &'static str {
        "perplexity"
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
                ProviderError::ParseFailure(
                    "No message content in Perplexity response".to_owned(),
                )
            })?;
        Ok(Reconstruction {
            text: text.to_owned(),
            model: self.model.clone(),
        })
    }
}
