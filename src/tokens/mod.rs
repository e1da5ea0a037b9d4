use hf_hub::api::sync::Api;
use log::{ debug, info };
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

use crate::llm::CompletionError;
use crate::models::chat::ConversationHistory;

pub const DEFAULT_TOKEN_LIMIT: usize = 3072;
pub const DEFAULT_TOKENIZER_REPO: &str = "huggyllama/llama-7b";

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> Result<usize, CompletionError>;
}

/// Counts tokens with a Hugging Face `tokenizer.json`, without special tokens.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
}

impl HfTokenCounter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CompletionError> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e|
            CompletionError::Tokenizer(format!("Failed to load '{}': {}", path.display(), e))
        )?;
        Ok(Self { tokenizer })
    }

    /// Downloads (or reuses the cached) `tokenizer.json` of a hub repository.
    pub fn from_pretrained(repo_id: &str) -> Result<Self, CompletionError> {
        let api = Api::new().map_err(|e| CompletionError::Tokenizer(e.to_string()))?;
        let path = api
            .model(repo_id.to_string())
            .get("tokenizer.json")
            .map_err(|e| CompletionError::Tokenizer(format!("Failed to fetch tokenizer for '{}': {}", repo_id, e)))?;
        info!("Using tokenizer from {}", path.display());
        Self::from_file(path)
    }

    /// A local file wins over the hub repository.
    pub fn load(file: Option<&str>, repo_id: &str) -> Result<Self, CompletionError> {
        match file {
            Some(path) => Self::from_file(path),
            None => Self::from_pretrained(repo_id),
        }
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> Result<usize, CompletionError> {
        let encoding = self.tokenizer
            .encode(text, false)
            .map_err(|e| CompletionError::Tokenizer(e.to_string()))?;
        Ok(encoding.len())
    }
}

/// Pre-flight ceiling on the tokenized size of a pending conversation.
#[derive(Clone)]
pub struct TokenBudget {
    counter: Arc<dyn TokenCounter>,
    limit: usize,
}

impl TokenBudget {
    pub fn new(counter: Arc<dyn TokenCounter>, limit: usize) -> Self {
        Self { counter, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Rejects the turn when history plus `new_turn` reaches the limit.
    /// Returns the token count otherwise.
    pub fn check(
        &self,
        history: &ConversationHistory,
        new_turn: &str
    ) -> Result<usize, CompletionError> {
        self.check_text(&pending_text(history, new_turn))
    }

    /// Same ceiling applied to an already rendered request, e.g. a full prompt.
    pub fn check_text(&self, text: &str) -> Result<usize, CompletionError> {
        let tokens = self.counter.count(text)?;
        debug!("Pending conversation is {} tokens (limit {})", tokens, self.limit);
        if tokens >= self.limit {
            return Err(CompletionError::TokenBudgetExceeded { tokens, limit: self.limit });
        }
        Ok(tokens)
    }
}

/// Newline-joined contents of every pending turn.
pub fn pending_text(history: &ConversationHistory, new_turn: &str) -> String {
    history
        .iter()
        .map(|turn| turn.content.as_str())
        .chain(std::iter::once(new_turn))
        .collect::<Vec<_>>()
        .join("\n")
}
