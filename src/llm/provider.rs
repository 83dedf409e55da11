//! Provider detection and endpoint construction.
//!
//! All supported providers speak the OpenAI Chat Completions dialect; they
//! differ only in where the `/v1` segment lives in their base URL.

/// Supported upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// `DeepSeek` (api.deepseek.com)
    DeepSeek,
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Groq (groq.com)
    Groq,
    /// Generic OpenAI-compatible provider
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chat_relay::llm::Provider;
    ///
    /// let provider = Provider::detect_from_url("https://api.deepseek.com");
    /// assert_eq!(provider, Provider::DeepSeek);
    /// ```
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();

        if lower.contains("deepseek.com") {
            Self::DeepSeek
        } else if lower.contains("openrouter.ai") {
            Self::OpenRouter
        } else if lower.contains("groq.com") {
            Self::Groq
        } else if lower.contains("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DeepSeek => "deepseek",
            Self::OpenAI => "openai",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::Generic => "generic",
        }
    }

    /// Build the chat completions URL for this provider.
    ///
    /// Bases that already end in a version segment (`.../api/v1`,
    /// `.../openai/v1`) get `/chat/completions` appended directly.
    #[must_use]
    pub fn build_chat_url(self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');

        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}
