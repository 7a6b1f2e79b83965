use std::time::Duration;

use bytes::Bytes;

/// Deepgram text-to-speech client.
///
/// One instance (and one underlying HTTP client) is shared across all
/// segments of all sessions.
pub struct TtsClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl TtsClient {
    pub fn new(api_key: String, url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build TTS HTTP client"),
            url,
            api_key,
        }
    }

    /// Convert one text segment into a contiguous blob of mu-law 8 kHz audio.
    pub async fn synthesize(&self, text: &str) -> Result<Bytes, TtsError> {
        let body = serde_json::json!({ "text": text });

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TtsError::Api(format!("{status}: {body}")));
        }

        resp.bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("API error: {0}")]
    Api(String),
}
