use futures_util::StreamExt;
use regex::Regex;
use serde::Deserialize;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Default system prompt used when no prompt file is configured.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a friendly and helpful phone assistant. You answer calls on behalf of \
the person whose phone this is.

Keep your responses conversational and concise - this is a phone call, not a \
text chat.
- Use short sentences
- Be warm but professional
- Don't use bullet points or formatting
- Respond naturally as you would in a real phone conversation
- If you don't know something, offer to take a message

When ending a call, say goodbye naturally.";

/// Load the system prompt from a file, falling back to the built-in default.
pub fn load_system_prompt(path: &std::path::Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!("Loaded system prompt from {}", path.display());
            contents.trim().to_string()
        }
        Err(_) => {
            tracing::info!("Using default system prompt");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Conversation history for one call.
///
/// Consecutive user messages are merged (the completion API rejects adjacent
/// same-role turns); assistant messages are never merged.
#[derive(Debug, Clone)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(system_prompt: String) -> Self {
        Self {
            system_prompt,
            messages: Vec::new(),
        }
    }

    pub fn add_user_message(&mut self, text: &str) {
        if let Some(last) = self.messages.last_mut() {
            if last.role == Role::User {
                last.content.push(' ');
                last.content.push_str(text);
                return;
            }
        }
        self.messages.push(ChatMessage {
            role: Role::User,
            content: text.to_string(),
        });
    }

    pub fn add_assistant_message(&mut self, text: &str) {
        self.messages.push(ChatMessage {
            role: Role::Assistant,
            content: text.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in completion-API shape, system prompt first.
    pub fn api_messages(&self) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(serde_json::json!({
            "role": "system",
            "content": self.system_prompt,
        }));
        for m in &self.messages {
            messages.push(serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            }));
        }
        messages
    }

    /// Caller-labeled transcript of the conversation.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    Role::User => "Caller",
                    Role::Assistant => "Assistant",
                };
                format!("{speaker}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Accumulates streamed completion deltas and emits complete sentences.
///
/// A sentence is the buffer prefix up to the first run of `.`, `!` or `?`
/// plus trailing whitespace. Deliberately naive (mis-splits decimals and
/// abbreviations); the consumer is TTS prosody, not semantic parsing.
pub struct SentenceSplitter {
    boundary: Regex,
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self {
            boundary: Regex::new(r"([.!?]+)\s*").expect("sentence regex is valid"),
            buffer: String::new(),
        }
    }

    /// Feed a delta; returns any sentences completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut sentences = Vec::new();
        while let Some(m) = self.boundary.find(&self.buffer) {
            let end = m.end();
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Flush the remaining buffer as a final sentence, if non-empty.
    pub fn finish(self) -> Option<String> {
        let tail = self.buffer.trim();
        if tail.is_empty() {
            None
        } else {
            Some(tail.to_string())
        }
    }
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Streaming chat-completion client driving response generation.
pub struct Brain {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl Brain {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            max_tokens,
        }
    }

    /// Stream a completion for the conversation, invoking `on_sentence` for
    /// each complete sentence in generation order. Returns the full response
    /// text (sentences joined with a single space) for history.
    pub async fn respond_sentences(
        &self,
        conversation: &Conversation,
        mut on_sentence: impl FnMut(String),
    ) -> Result<String, BrainError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "messages": conversation.api_messages(),
        });

        let resp = self
            .client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BrainError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BrainError::Api(format!("{status}: {body}")));
        }

        let mut stream = resp.bytes_stream();
        let mut sse_buffer = String::new();
        let mut splitter = SentenceSplitter::new();
        let mut sentences: Vec<String> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BrainError::Stream(e.to_string()))?;
            sse_buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line
            while let Some(pos) = sse_buffer.find("\n\n") {
                let event: String = sse_buffer.drain(..pos + 2).collect();

                for line in event.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                        continue;
                    };
                    let delta = parsed
                        .choices
                        .first()
                        .and_then(|c| c.delta.content.as_deref());
                    if let Some(content) = delta {
                        for sentence in splitter.push(content) {
                            on_sentence(sentence.clone());
                            sentences.push(sentence);
                        }
                    }
                }
            }
        }

        if let Some(tail) = splitter.finish() {
            on_sentence(tail.clone());
            sentences.push(tail);
        }

        Ok(sentences.join(" "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrainError {
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("completion API error: {0}")]
    Api(String),
    #[error("completion stream failed: {0}")]
    Stream(String),
}
