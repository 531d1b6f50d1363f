use anyhow::{Context, Result};
use clap::Parser;

use message_relay::{
    api::{self, AppState},
    config::Config,
    delivery::DeliveryEngine,
    notify::AckNotifier,
    registry::ConnectionRegistry,
    store::MessageStore,
    transform::{Provider, TextTransformer},
};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
const DEFAULT_TELEGRAM_BASE_URL: &str = "https://api.telegram.org";
const DEFAULT_SYSTEM_PROMPT: &str =
    "Rewrite the user's message into a clear, well-structured note. \
     Reply in the form `date//body`, where `date` is the date the note refers \
     to (or empty when none applies) and `body` is the rewritten text.";

fn init_logging(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(cfg.log_level.clone())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn build_transformer(cfg: &Config) -> Result<Option<TextTransformer>> {
    if cfg.skip_transform {
        return Ok(None);
    }
    // OPENAI_API_KEY wins when both backends are configured
    let (provider, api_key, base_url, model) = if let Some(key) = env_non_empty("OPENAI_API_KEY") {
        (
            Provider::OpenAi,
            key,
            env_non_empty("OPENAI_API_URL").unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            cfg.transform_model.clone(),
        )
    } else if let Some(key) = env_non_empty("ANTHROPIC_API_KEY") {
        (
            Provider::Anthropic,
            key,
            env_non_empty("ANTHROPIC_API_URL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
            env_non_empty("ANTHROPIC_MODEL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
        )
    } else {
        tracing::info!("no transform API key set; text transform disabled");
        return Ok(None);
    };

    let prompt_path = cfg
        .prompt_path
        .clone()
        .or_else(|| env_non_empty("PROMPT_PATH").map(Into::into));
    let system_prompt = match prompt_path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading prompt file {}", path.display()))?,
        None => DEFAULT_SYSTEM_PROMPT.to_string(),
    };

    tracing::info!(provider = ?provider, model = %model, "text transform enabled");
    Ok(Some(
        TextTransformer::new(base_url, api_key, model, system_prompt)
            .with_provider(provider)
            .with_marker("📅"),
    ))
}

fn build_notifier() -> Option<AckNotifier> {
    let Some(token) = env_non_empty("TELEGRAM_BOT_TOKEN") else {
        tracing::info!("TELEGRAM_BOT_TOKEN not set; post-ack notifications disabled");
        return None;
    };
    let base_url =
        env_non_empty("TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_BASE_URL.to_string());
    Some(AckNotifier::new(base_url, token))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg);

    let db_path = cfg.database_path();
    let store = MessageStore::open(&db_path)
        .with_context(|| format!("opening message store at {}", db_path.display()))?;

    let registry = ConnectionRegistry::new();
    let engine = DeliveryEngine::new(
        store.clone(),
        registry.clone(),
        cfg.ack_timeout_duration(),
        build_notifier(),
    );
    let state = AppState {
        store,
        registry,
        engine,
        transformer: build_transformer(&cfg)?,
        ping_interval: cfg.ping_interval_duration(),
        ping_timeout: cfg.ping_timeout_duration(),
    };

    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    tracing::info!(bind = %cfg.bind, db = %db_path.display(), "message-relay listening");

    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
