//! Runtime configuration.
//!
//! [`StoryConfig`] carries collaborator endpoints, the image URL allow-list,
//! timeouts and input limits. Build it explicitly with
//! [`StoryConfig::builder`], or load it from the process environment (and a
//! `.env` file) with [`StoryConfig::from_env`].
//!
//! | Variable | Default |
//! |---|---|
//! | `STORY_TEXT_ENDPOINT` | unset |
//! | `STORY_IMAGE_ENDPOINT` | unset |
//! | `OPENAI_API_KEY` | unset |
//! | `S3_PUB_URL_PREFIX` | empty (every image URL rejected) |
//! | `STORY_IMAGE_TIMEOUT_MS` | `55000` |
//! | `MAX_INPUT_CHARS` | `200` |
//! | `MAX_GENERATE_TOKENS` | `500` |
//! | `HOSTED_DOMAIN` | unset |
//! | `STORY_CONNECT_TIMEOUT_SECS` | `30` |

use crate::error::Result;
use crate::StoryError;
use reqwest::Client;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Per-prompt image deadline used when none is configured.
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_millis(55_000);

/// Connect timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by sessions, the image orchestrator and backends.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use story_pipeline::StoryConfig;
///
/// let config = StoryConfig::builder()
///     .text_endpoint("https://stories.example/api/story")
///     .allowed_image_url_prefix("https://cdn.example/")
///     .image_timeout(Duration::from_secs(30))
///     .build();
/// assert_eq!(config.max_input_chars, 200);
/// ```
#[derive(Clone)]
pub struct StoryConfig {
    pub text_endpoint: Option<String>,
    pub image_endpoint: Option<String>,
    /// Bearer token for OpenAI-compatible text endpoints.
    pub api_key: Option<String>,
    /// Image URLs must start with this prefix to be kept. Empty rejects all.
    pub allowed_image_url_prefix: String,
    /// Deadline for each prompt of an image request.
    pub image_timeout: Duration,
    pub max_input_chars: usize,
    pub max_generate_tokens: u32,
    /// Domain used to build shared story URLs.
    pub hosted_domain: Option<String>,
    pub connect_timeout: Duration,
}

impl StoryConfig {
    /// Create a new builder with every setting at its default.
    pub fn builder() -> StoryConfigBuilder {
        StoryConfigBuilder {
            config: StoryConfig::default(),
        }
    }

    /// Load `.env` (if present) and read configuration from the environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to
    /// its value.
    ///
    /// Blank values count as unset. Numeric values that do not parse are an
    /// [`StoryError::InvalidConfig`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut builder = Self::builder();
        if let Some(v) = get("STORY_TEXT_ENDPOINT") {
            builder = builder.text_endpoint(v);
        }
        if let Some(v) = get("STORY_IMAGE_ENDPOINT") {
            builder = builder.image_endpoint(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            builder = builder.api_key(v);
        }
        if let Some(v) = get("S3_PUB_URL_PREFIX") {
            builder = builder.allowed_image_url_prefix(v);
        }
        if let Some(v) = get("STORY_IMAGE_TIMEOUT_MS") {
            builder = builder.image_timeout(Duration::from_millis(parse_number(
                "STORY_IMAGE_TIMEOUT_MS",
                &v,
            )?));
        }
        if let Some(v) = get("MAX_INPUT_CHARS") {
            builder = builder.max_input_chars(parse_number("MAX_INPUT_CHARS", &v)?);
        }
        if let Some(v) = get("MAX_GENERATE_TOKENS") {
            builder = builder.max_generate_tokens(parse_number("MAX_GENERATE_TOKENS", &v)?);
        }
        if let Some(v) = get("HOSTED_DOMAIN") {
            builder = builder.hosted_domain(v);
        }
        if let Some(v) = get("STORY_CONNECT_TIMEOUT_SECS") {
            builder = builder.connect_timeout(Duration::from_secs(parse_number(
                "STORY_CONNECT_TIMEOUT_SECS",
                &v,
            )?));
        }
        Ok(builder.build())
    }

    /// HTTP client for streaming collaborators.
    ///
    /// Only connecting is bounded; bodies may stream for as long as the
    /// collaborator keeps them open. Image deadlines are enforced per prompt.
    pub fn http_client(&self) -> Result<Client> {
        Ok(Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()?)
    }
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            text_endpoint: None,
            image_endpoint: None,
            api_key: None,
            allowed_image_url_prefix: String::new(),
            image_timeout: DEFAULT_IMAGE_TIMEOUT,
            max_input_chars: crate::prompt::DEFAULT_MAX_INPUT_CHARS,
            max_generate_tokens: 500,
            hosted_domain: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for StoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryConfig")
            .field("text_endpoint", &self.text_endpoint)
            .field("image_endpoint", &self.image_endpoint)
            .field("has_api_key", &self.api_key.is_some())
            .field("allowed_image_url_prefix", &self.allowed_image_url_prefix)
            .field("image_timeout", &self.image_timeout)
            .field("max_input_chars", &self.max_input_chars)
            .field("max_generate_tokens", &self.max_generate_tokens)
            .field("hosted_domain", &self.hosted_domain)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoryError::InvalidConfig(format!("{} must be a number, got '{}'", key, value)))
}

/// Builder for [`StoryConfig`].
#[derive(Debug)]
pub struct StoryConfigBuilder {
    config: StoryConfig,
}

impl StoryConfigBuilder {
    pub fn text_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.text_endpoint = Some(url.into());
        self
    }

    pub fn image_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.image_endpoint = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn allowed_image_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.allowed_image_url_prefix = prefix.into();
        self
    }

    /// Set the per-prompt image deadline. Default: 55 seconds.
    pub fn image_timeout(mut self, timeout: Duration) -> Self {
        self.config.image_timeout = timeout;
        self
    }

    /// Set the user prompt length cap. Default: 200 characters.
    pub fn max_input_chars(mut self, max: usize) -> Self {
        self.config.max_input_chars = max;
        self
    }

    /// Set the completion token budget. Default: 500.
    pub fn max_generate_tokens(mut self, max: u32) -> Self {
        self.config.max_generate_tokens = max;
        self
    }

    pub fn hosted_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.hosted_domain = Some(domain.into());
        self
    }

    /// Set the HTTP connect timeout. Default: 30 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> StoryConfig {
        self.config
    }
}
