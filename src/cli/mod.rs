use clap::Parser;

use crate::config::prompt::Persona;
use crate::session::DEFAULT_GREETING;
use crate::tokens::{ DEFAULT_TOKENIZER_REPO, DEFAULT_TOKEN_LIMIT };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Provider Args ---
    /// Chat completion provider (openrouter, openai, replicate)
    #[arg(long, env = "CHAT_PROVIDER", default_value = "openrouter")]
    pub provider: String,

    /// API key for the provider. Falls back to OPENROUTER_API_KEY, OPENAI_API_KEY or REPLICATE_API_TOKEN.
    #[arg(long, env = "CHAT_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Base URL for the provider API (e.g., https://openrouter.ai/api/v1)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let clients handle defaults if None
    pub base_url: Option<String>,

    /// Connect timeout in seconds for provider requests. 0 disables it.
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub connect_timeout_secs: u64,

    // --- Generation Args ---
    /// Model id (e.g., openai/gpt-4o-mini-2024-07-18, meta/meta-llama-3-70b-instruct)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on provider defaults if None
    pub model: Option<String>,

    /// Sampling temperature (0.0 to 2.0)
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "1.0")]
    pub temperature: f32,

    /// Maximum number of tokens to generate (1 to 4096)
    #[arg(long, env = "CHAT_MAX_TOKENS", default_value = "1000")]
    pub max_tokens: u32,

    /// Nucleus sampling probability mass (0.0 exclusive to 1.0)
    #[arg(long, env = "CHAT_TOP_P")]
    pub top_p: Option<f32>,

    /// Wait for the whole reply instead of streaming it
    #[arg(long, env = "CHAT_NO_STREAM", default_value = "false")]
    pub no_stream: bool,

    // --- Persona Args ---
    /// Free-form instructions for the assistant
    #[arg(long, env = "CHAT_INSTRUCTIONS", default_value = "")]
    pub instructions: String,

    /// Ask the assistant to assume the user is a kid
    #[arg(long, env = "CHAT_SAFE", default_value = "false")]
    pub safe: bool,

    /// Ask the assistant to talk as a pirate
    #[arg(long, env = "CHAT_PIRATE", default_value = "false")]
    pub pirate: bool,

    /// Character the assistant should play (e.g., "Snow White", "Pluto")
    #[arg(long, env = "CHAT_CHARACTER")]
    pub character: Option<String>,

    /// First assistant message of every conversation
    #[arg(long, env = "CHAT_GREETING", default_value = DEFAULT_GREETING)]
    pub greeting: String,

    // --- Token Budget Args ---
    /// Hugging Face repository whose tokenizer.json measures conversation length
    #[arg(long, env = "TOKENIZER_REPO", default_value = DEFAULT_TOKENIZER_REPO)]
    pub tokenizer_repo: String,

    /// Local tokenizer.json; takes precedence over --tokenizer-repo
    #[arg(long, env = "TOKENIZER_FILE")]
    pub tokenizer_file: Option<String>,

    /// Conversations at or above this many tokens are rejected before sending
    #[arg(long, env = "TOKEN_LIMIT", default_value_t = DEFAULT_TOKEN_LIMIT)]
    pub token_limit: usize,

    // --- Comparison Args ---
    /// Second model to run every turn against, after the first one finishes
    #[arg(long, env = "COMPARE_MODEL")]
    pub compare_model: Option<String>,

    /// Provider for the comparison model. Defaults to --provider.
    #[arg(long, env = "COMPARE_PROVIDER")]
    pub compare_provider: Option<String>,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn persona(&self) -> Persona {
        Persona {
            instructions: self.instructions.clone(),
            safe: self.safe,
            pirate: self.pirate,
            character: self.character.clone(),
        }
    }
}
