use std::path::PathBuf;

/// Application settings, loaded from the process environment (optionally
/// seeded from a `.env` file in the working directory). Unknown environment
/// keys are ignored.
#[derive(Debug, Clone)]
pub struct Config {
    pub deepgram_api_key: String,
    pub openai_api_key: String,

    pub host: String,
    pub port: u16,

    /// Name the agent introduces itself with in the greeting.
    pub agent_name: String,

    pub stt_model: String,
    pub stt_language: String,

    pub tts_model: String,
    pub tts_sample_rate: u32,

    pub openai_model: String,
    pub max_tokens: u32,

    pub transcripts_dir: PathBuf,
    pub system_prompt_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set (add it to the environment or a .env file)")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env from {}", path.display()),
            Err(e) if e.not_found() => {
                tracing::debug!("No .env file, using environment only");
            }
            Err(e) => tracing::warn!("Failed to read .env: {e}"),
        }

        Ok(Self {
            deepgram_api_key: require("DEEPGRAM_API_KEY")?,
            openai_api_key: require("OPENAI_API_KEY")?,
            host: env_or("HOST", "0.0.0.0"),
            port: parse_env("PORT", 8000)?,
            agent_name: env_or("AGENT_NAME", "AI Assistant"),
            stt_model: env_or("STT_MODEL", "nova-2"),
            stt_language: env_or("STT_LANGUAGE", "en-US"),
            tts_model: env_or("TTS_MODEL", "aura-asteria-en"),
            tts_sample_rate: parse_env("TTS_SAMPLE_RATE", 8000)?,
            openai_model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
            max_tokens: parse_env("MAX_TOKENS", 300)?,
            transcripts_dir: PathBuf::from(env_or("TRANSCRIPTS_DIR", "transcripts")),
            system_prompt_path: PathBuf::from(env_or("SYSTEM_PROMPT_PATH", "system_prompt.md")),
        })
    }

    /// WebSocket URL for the Deepgram streaming recognizer, configured for
    /// Twilio's telephony codec: mu-law, 8 kHz, mono, with interim results
    /// and endpointing enabled.
    pub fn stt_url(&self) -> String {
        format!(
            "wss://api.deepgram.com/v1/listen\
             ?model={}\
             &language={}\
             &encoding=mulaw\
             &sample_rate=8000\
             &channels=1\
             &punctuate=true\
             &interim_results=true\
             &utterance_end_ms=1000\
             &vad_events=true\
             &endpointing=300",
            self.stt_model, self.stt_language
        )
    }

    /// HTTP URL for Deepgram speech synthesis.
    pub fn tts_url(&self) -> String {
        format!(
            "https://api.deepgram.com/v1/speak?model={}&encoding=mulaw&sample_rate={}",
            self.tts_model, self.tts_sample_rate
        )
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: v }),
        _ => Ok(default),
    }
}
