use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use api::{provider_secret, registration_variants, ApiClient, Registration};
use cli::CLIArgs;
use engine::Engine;
use provider::ProviderConfig;

mod api;
mod cli;
mod engine;
mod parse;
mod provider;
#[cfg(test)]
mod testutil;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CLIArgs::parse();
    setup_logging(args.log_level)?;

    let Some(token) = args.token.clone() else {
        eprintln!(
            "Need LICHESS_API_TOKEN environment variable from \
             {}/account/oauth/token/create?scopes[]=engine:read&scopes[]=engine:write",
            args.lichess
        );
        std::process::exit(128);
    };

    let config = ProviderConfig {
        engine_command: args.engine.clone(),
        lichess_url: args.lichess.trim_end_matches('/').to_string(),
        broker_url: args.broker.trim_end_matches('/').to_string(),
        token,
        provider_secret: args.provider_secret.clone(),
        engine_name: args.name.clone(),
        max_threads: args.max_threads,
        max_hash: args.max_hash,
        keep_alive: Duration::from_secs(args.keep_alive),
        extra_options: args.setoption_pairs(),
    };

    // spawn the first engine up front; registration needs its variants
    let engine = Engine::new(&config.engine_command, &config.extra_options).await?;

    let api = ApiClient::new(&config.lichess_url, &config.broker_url, &config.token)?;
    let secret = provider_secret(config.provider_secret.as_deref());
    let registration = Registration {
        name: config.engine_name.clone(),
        max_threads: config.max_threads,
        max_hash: config.max_hash,
        variants: registration_variants(engine.supported_variants()),
        provider_secret: secret.clone(),
    };
    api.register_engine(&registration).await?;

    provider::run(config, api, secret, engine).await;
    Ok(())
}

fn setup_logging(level: log::LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%dT%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
