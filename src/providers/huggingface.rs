//! Hugging Face inference-router vision provider.
//!
//! Router-hosted models return wildly different response shapes, so parsing
//! here is deliberately permissive.

use crate::data_url::data_url;
use crate::prelude::*;

use super::{
    ProviderError, Reconstruction, RequestPolicy, VisionProvider, request_json_with_retry,
};

const API_BASE: &str = "https://router.huggingface.co/models";
const DEFAULT_MODEL: &str = "runwayml/stable-diffusion-v1-5";

/// Reconstruction via the Hugging Face inference router.
pub struct HuggingFaceVision {
    client: reqwest::Client,
    token: String,
    model: String,
    policy: RequestPolicy,
}

impl HuggingFaceVision {
    pub fn new(client: reqwest::Client, token: String, policy: RequestPolicy) -> Self {
        Self {
            client,
            token,
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

/// Pull a plausible text payload out of whatever shape the router returned.
fn extract_text(data: &Value) -> String {
    let from_map = |map: &serde_json::Map<String, Value>| {
        ["generated_text", "text", "result"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str).map(str::to_owned))
    };
    match data {
        Value::Object(map) => from_map(map),
        Value::Array(items) => items.first().and_then(|first| match first {
            Value::Object(map) => from_map(map),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }),
        _ => None,
    }
    .unwrap_or_else(|| data.to_string())
}

#[async_trait]
impl VisionProvider for HuggingFaceVision {
    fn name(&self) -> &'static str {
        "huggingface"
    }

    #[instrument(level = "debug", skip_all)]
    async fn reconstruct(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> Result<Reconstruction, ProviderError> {
        let url = format!("{API_BASE}/{}", self.model);
        let payload = json!({
            "inputs": {
                "image": data_url("image/jpeg", image),
                "prompt": prompt,
            },
        });

        let data = request_json_with_retry(&self.policy, || {
            self.client
                .post(&url)
                .bearer_auth(&self.token)
                .json(&payload)
        })
        .await?;

        Ok(Reconstruction {
            text: extract_text(&data),
            model: self.model.clone(),
        })
    }
}
