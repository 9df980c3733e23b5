use anyhow::Context;
use chatrelay::{app, cli, config, paths};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Args::parse();

    let config_path = paths::config_path()?;
    let cfg = config::Config::load_optional(&config_path)?;
    tracing::debug!(?config_path, ?cfg, "resolved config");

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let provider_name = args
        .provider
        .clone()
        .or_else(|| cfg.as_ref().and_then(|c| c.provider.clone()))
        .unwrap_or_else(|| "anthropic".to_string());

    let provider = app::build_provider(&http, cfg.as_ref(), &provider_name)?;
    let options = app::completion_options(cfg.as_ref(), args.model.clone());

    match args.cmd {
        Some(cli::Command::Serve { host, port }) => {
            let addr = app::bind_addr(cfg.as_ref(), host, port)?;
            return app::cmd_serve(provider, options, addr).await;
        }
        Some(cli::Command::Tokens) => {
            return app::cmd_tokens(provider, &options.model).await;
        }
        None => {}
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: chatrelay \"Hello\" or `chatrelay serve`");
    }

    app::cmd_prompt(provider, options, prompt).await
}
