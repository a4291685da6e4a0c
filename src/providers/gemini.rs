//! Google Gemini vision provider, spoken over the `generateContent` REST API.

use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::prelude::*;

use super::{
    ProviderError, Reconstruction, RequestPolicy, VisionProvider, request_json_with_retry,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Reconstruction via Gemini Flash.
pub struct GeminiVision {
    client: reqwest::Client,
    api_key: String,
    model: String,
    policy: RequestPolicy,
}

impl GeminiVision {
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
impl VisionProvider for GeminiVision {
    fn name(&self) -> &'static str {
        "gemini"
    }

    #[instrument(level = "debug", skip_all)]
    async fn reconstruct(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> Result<Reconstruction, ProviderError> {
        let url = format!("{API_BASE}/{}:generateContent", self.model);
        let payload = json!({
            "contents": [{
                "parts": [
                    {"text": prompt},
                    {
                        "inline_data": {
                            "mime_type": "image/jpeg",
                            "data": BASE64_STANDARD.encode(image),
                        },
                    },
                ],
            }],
        });

        let data = request_json_with_retry(&self.policy, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&payload)
        })
        .await?;

        let text = data["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::ParseFailure(
                    "Invalid response structure from Gemini".to_owned(),
                )
            })?;
        Ok(Reconstruction {
            text: text.to_owned(),
            model: self.model.clone(),
        })
    }
}
