use futures::StreamExt;
use log::{ info, warn };
use std::future::Future;
use std::sync::Arc;

use crate::llm::chat::ChatClient;
use crate::llm::{ CompletionError, RequestConfig };
use crate::models::chat::ConversationHistory;
use crate::tokens::TokenBudget;

pub const DEFAULT_GREETING: &str = "Ask me anything!";

#[derive(Debug)]
pub enum Interruption {
    /// The caller's stop signal fired before the stream finished.
    Stopped,
    /// The stream broke after it had started.
    Failed(CompletionError),
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub response: String,
    pub interruption: Option<Interruption>,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        self.interruption.is_none()
    }
}

/// Caller-side owner of one conversation with one model.
pub struct ChatSession {
    client: Arc<dyn ChatClient>,
    config: RequestConfig,
    budget: TokenBudget,
    history: ConversationHistory,
    greeting: String,
}

impl ChatSession {
    pub fn new(
        client: Arc<dyn ChatClient>,
        config: RequestConfig,
        budget: TokenBudget,
        greeting: impl Into<String>
    ) -> Self {
        let greeting = greeting.into();
        Self {
            client,
            config,
            budget,
            history: ConversationHistory::with_greeting(&greeting),
            greeting,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.client.provider(), self.config.model_id)
    }

    pub fn clear(&mut self) {
        self.history = ConversationHistory::with_greeting(&self.greeting);
    }

    /// Runs one turn.
    ///
    /// The budget check happens before any network call. Errors raised
    /// before the first fragment leave the history untouched. Once streaming,
    /// each fragment is handed to `on_fragment`; if `stop` resolves or the
    /// stream breaks, whatever arrived so far is kept as a truncated reply.
    pub async fn send<F, S>(
        &mut self,
        text: &str,
        mut on_fragment: F,
        stop: S
    ) -> Result<TurnOutcome, CompletionError>
        where F: FnMut(&str), S: Future<Output = ()>
    {
        if text.trim().is_empty() {
            return Err(CompletionError::Config("message must not be empty".to_string()));
        }
        let tokens = self.budget.check_text(&self.client.budget_text(&self.history, text, &self.config))?;
        info!("Sending turn to {} ({} pending tokens)", self.label(), tokens);

        tokio::pin!(stop);

        let mut stream = tokio::select! {
            biased;
            _ = &mut stop => {
                return Ok(TurnOutcome { response: String::new(), interruption: Some(Interruption::Stopped) });
            }
            opened = self.client.stream(&self.history, text, &self.config) => opened?,
        };

        let mut response = String::new();
        let interruption = loop {
            tokio::select! {
                biased;
                _ = &mut stop => break Some(Interruption::Stopped),
                next = stream.next() => match next {
                    Some(Ok(fragment)) => {
                        on_fragment(&fragment);
                        response.push_str(&fragment);
                    }
                    Some(Err(e)) => break Some(Interruption::Failed(e)),
                    None => break None,
                },
            }
        };
        drop(stream);

        match &interruption {
            None => {}
            Some(Interruption::Stopped) => info!("Turn stopped after {} bytes", response.len()),
            Some(Interruption::Failed(e)) => warn!("Stream broke after {} bytes: {}", response.len(), e),
        }

        if interruption.is_none() || !response.is_empty() {
            self.history.push_user(text);
            self.history.push_assistant(response.clone());
        }

        Ok(TurnOutcome { response, interruption })
    }
}

/// Sends the same turn to two sessions, one after the other. The second
/// request is only issued once the first reply has been fully drained.
pub async fn compare<F, S, M>(
    sessions: [&mut ChatSession; 2],
    text: &str,
    mut on_fragment: F,
    mut stop: M
) -> [Result<TurnOutcome, CompletionError>; 2]
    where F: FnMut(usize, &str), M: FnMut() -> S, S: Future<Output = ()>
{
    let [left, right] = sessions;
    let first = left.send(text, |fragment| on_fragment(0, fragment), stop()).await;
    let second = right.send(text, |fragment| on_fragment(1, fragment), stop()).await;
    [first, second]
}
