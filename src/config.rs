use crate::llm::{LlmSettings, Provider};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Environment variables checked, in order, for the upstream credential.
const API_KEY_VARS: [&str; 2] = ["DEEPSEEK_API_KEY", "LLM_API_KEY"];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Upstream base URL
    #[arg(long, env = "LLM_BASE_URL")]
    pub base_url: Option<String>,

    /// Upstream model name
    #[arg(long, env = "MODEL_NAME")]
    pub model: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: Option<bool>,

    /// Disable timeout middleware
    #[arg(long, env = "TIMEOUT_DISABLED")]
    pub timeout_disabled: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub resilience: ResilienceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    /// Optional at startup; requests fail with a configuration error without it.
    #[serde(default)]
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: None,
            temperature: 0.9,
            max_tokens: 2048,
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResilienceConfig {
    pub timeout_disabled: bool,
    /// Upper bound on time-to-headers; the streamed body is not limited.
    pub request_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            timeout_disabled: false,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    pub json: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // 1. Built-in defaults
        let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        // 2. Config file: explicit path, else ./config.yaml when present
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config.yaml"));
        }

        // 3. Prefixed environment, e.g. RELAY_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. Direct environment and CLI overrides
        if let Some(key) = API_KEY_VARS
            .iter()
            .filter_map(|var| env::var(var).ok())
            .find(|v| !v.trim().is_empty())
        {
            builder = builder.set_override("upstream.api_key", key)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(base_url) = cli.base_url {
            builder = builder.set_override("upstream.base_url", base_url)?;
        }
        if let Some(model) = cli.model {
            builder = builder.set_override("upstream.model", model)?;
        }
        if let Some(json) = cli.log_json {
            builder = builder.set_override("logging.json", json)?;
        }
        if let Some(td) = cli.timeout_disabled {
            builder = builder.set_override("resilience.timeout_disabled", td)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "upstream.base_url cannot be empty".to_string(),
            ));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "upstream.model cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for the upstream driver.
    #[must_use]
    pub fn llm_settings(&self) -> LlmSettings {
        let upstream = &self.upstream;
        LlmSettings {
            base_url: upstream.base_url.clone(),
            api_key: upstream
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            model: upstream.model.clone(),
            provider: Provider::detect_from_url(&upstream.base_url),
            temperature: upstream.temperature,
            max_tokens: upstream.max_tokens,
        }
    }
}
