use crate::http::AppState;
use crate::provider::{CompletionOptions, Message, Provider, ToolChoice};
use crate::relay::{continuation::MAX_TOKENS, Orchestrator};
use crate::usage::{UsageSnapshot, UsageStore};
use crate::{config, provider, server};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5173;

pub fn build_provider(
    http: &reqwest::Client,
    cfg: Option<&config::Config>,
    provider_name: &str,
) -> anyhow::Result<Arc<dyn Provider>> {
    match provider_name {
        "anthropic" => {
            #[cfg(feature = "anthropic")]
            {
                let anthropic = cfg.map(|c| c.anthropic.clone()).unwrap_or_default();
                let api_key = std::env::var("ANTHROPIC_API_KEY")
                    .ok()
                    .or(anthropic.api_key)
                    .context("No API key found. Set ANTHROPIC_API_KEY or anthropic.api_key in config.toml")?;

                let mut p = provider::anthropic::AnthropicProvider::new(http.clone(), api_key)?
                    .with_beta(anthropic.beta);
                if let Some(base) = anthropic.api_base.as_deref() {
                    p = p
                        .with_api_base(base)
                        .with_context(|| format!("invalid anthropic.api_base: {base}"))?;
                }
                if let Some(version) = anthropic.version {
                    p = p.with_version(version);
                }
                Ok(Arc::new(p))
            }
            #[cfg(not(feature = "anthropic"))]
            {
                let _ = http;
                let _ = cfg;
                anyhow::bail!("anthropic provider is not enabled in this build")
            }
        }
        "stub" => Ok(Arc::new(provider::stub::StubProvider::new())),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

pub fn completion_options(cfg: Option<&config::Config>, model: Option<String>) -> CompletionOptions {
    CompletionOptions {
        model: model
            .or_else(|| cfg.and_then(|c| c.model.clone()))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        max_tokens: cfg.and_then(|c| c.max_tokens).unwrap_or(MAX_TOKENS),
        system: cfg.and_then(|c| c.system_prompt.clone()),
        tool_choice: ToolChoice::None,
    }
}

pub fn bind_addr(
    cfg: Option<&config::Config>,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<SocketAddr> {
    let host = host
        .or_else(|| cfg.and_then(|c| c.server.host.clone()))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = port
        .or_else(|| cfg.and_then(|c| c.server.port))
        .unwrap_or(DEFAULT_PORT);

    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address: {host}:{port}"))
}

pub async fn cmd_serve(
    provider: Arc<dyn Provider>,
    options: CompletionOptions,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let state = AppState::new(provider, UsageStore::global(), options);
    server::run(addr, state).await
}

pub async fn cmd_tokens(provider: Arc<dyn Provider>, model: &str) -> anyhow::Result<()> {
    let headers = provider
        .fetch_rate_limits(model)
        .await
        .context("failed to fetch rate limits")?;

    let store = UsageStore::global();
    let snapshot: UsageSnapshot = store
        .publish(&headers)
        .context("provider returned unusable rate-limit headers")?;

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Runs one prompt through the relay and prints the stitched answer.
pub async fn cmd_prompt(
    provider: Arc<dyn Provider>,
    options: CompletionOptions,
    prompt: String,
) -> anyhow::Result<()> {
    use std::io::Write;
    use tokio_stream::StreamExt;

    let orchestrator = Orchestrator::new(provider, UsageStore::global());
    let mut session = orchestrator
        .start(vec![Message::user(prompt)], options)
        .await
        .context("provider failed to start streaming")?;

    let mut stdout = std::io::stdout();
    while let Some(item) = session.output.next().await {
        let chunk = item.context("stream chunk error")?;
        print!("{}", chunk.text);
        stdout.flush().ok();
    }
    println!();

    let outcome = session
        .driver
        .await
        .context("relay task panicked")?
        .context("response ended abnormally")?;
    tracing::debug!(segments = outcome.segments, switches = outcome.switches, "prompt complete");
    Ok(())
}
