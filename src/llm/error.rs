use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Provider rejected the credential: {body}")]
    Auth {
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Provider returned HTTP {status}: {body}")]
    Provider {
        status: u16,
        body: String,
    },

    #[error("Conversation length too long ({tokens} tokens). Please keep it under {limit} tokens.")]
    TokenBudgetExceeded {
        tokens: usize,
        limit: usize,
    },

    #[error("Provider reported a stream failure: {0}")]
    Stream(String),

    #[error("Failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    Config(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl CompletionError {
    /// Maps a non-2xx response to `Auth` (401) or `Provider`.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 401 {
            CompletionError::Auth { body }
        } else {
            CompletionError::Provider { status, body }
        }
    }
}
