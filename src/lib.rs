pub mod models;
pub mod config;
pub mod llm;
pub mod cli;
pub mod tokens;
pub mod session;
pub mod repl;

use cli::Args;
use llm::chat::new_client;
use llm::{ LlmConfig, ProviderType, RequestConfig };
use log::info;
use session::ChatSession;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokens::{ HfTokenCounter, TokenBudget };

/// Connection settings for one session. `--api-key` and `--base-url` only
/// apply to the provider named by `--provider`; any other provider reads its
/// own key variable through `env`.
fn endpoint_config<E>(args: &Args, provider: ProviderType, inherit_endpoint: bool, env: E) -> LlmConfig
    where E: Fn(&str) -> Option<String>
{
    let api_key = Some(args.api_key.clone())
        .filter(|key| inherit_endpoint && !key.is_empty())
        .or_else(|| env(provider.api_key_env()));

    LlmConfig {
        provider,
        api_key,
        base_url: args.base_url.clone().filter(|_| inherit_endpoint),
        connect_timeout: Some(args.connect_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
    }
}

fn build_session(
    args: &Args,
    provider: ProviderType,
    model: Option<String>,
    inherit_endpoint: bool,
    budget: TokenBudget
) -> Result<ChatSession, Box<dyn Error + Send + Sync>> {
    let llm_config = endpoint_config(args, provider, inherit_endpoint, |name| std::env::var(name).ok());

    let request_config = RequestConfig {
        model_id: model.unwrap_or_else(|| provider.default_model().to_string()),
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        stream: !args.no_stream,
        top_p: args.top_p,
        system_prompt: args.persona().system_instructions(),
    };
    request_config.validate()?;

    let client = new_client(&llm_config)?;
    info!(
        "Chat client configured: Provider={}, Model={}, BaseURL={}",
        provider,
        request_config.model_id,
        llm_config.base_url.as_deref().unwrap_or("provider default")
    );

    Ok(ChatSession::new(client, request_config, budget, args.greeting.clone()))
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Chat Configuration ---");
    info!("Provider: {}", args.provider);
    info!("Model: {}", args.model.as_deref().unwrap_or("provider default"));
    info!("Temperature: {}", args.temperature);
    info!("Max Tokens: {}", args.max_tokens);
    info!("Streaming: {}", !args.no_stream);
    info!("Token Limit: {}", args.token_limit);
    info!("Tokenizer: {}", args.tokenizer_file.as_deref().unwrap_or(&args.tokenizer_repo));
    if let Some(model) = &args.compare_model {
        info!("Compare Model: {}", model);
        info!("Compare Provider: {}", args.compare_provider.as_deref().unwrap_or(&args.provider));
    }
    info!("-------------------------");

    let provider: ProviderType = args.provider.parse()?;

    let tokenizer_file = args.tokenizer_file.clone();
    let tokenizer_repo = args.tokenizer_repo.clone();
    let counter = tokio::task::spawn_blocking(move || {
        HfTokenCounter::load(tokenizer_file.as_deref(), &tokenizer_repo)
    }).await??;
    let budget = TokenBudget::new(Arc::new(counter), args.token_limit);

    let primary = build_session(
        &args,
        provider,
        args.model.clone(),
        true,
        budget.clone()
    )?;

    let secondary = match &args.compare_model {
        Some(model) => {
            let compare_provider: ProviderType = match &args.compare_provider {
                Some(name) => name.parse()?,
                None => provider,
            };
            let inherit_endpoint = compare_provider == provider;
            Some(build_session(&args, compare_provider, Some(model.clone()), inherit_endpoint, budget)?)
        }
        None => None,
    };

    repl::run_repl(primary, secondary).await
}
