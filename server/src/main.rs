mod backend;
mod config;
mod gate;
mod graphql;
mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use platform_obs::{ObsConfig, init_tracing};

use crate::{
    backend::RestFactory,
    config::{AppConfig, load_policy},
    gate::Gate,
    http::{AppState, ServeConfig},
};

#[derive(Parser, Debug)]
#[command(name = "farmdash-server", version, about = "Farm dashboard access gate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP + GraphQL gate.
    Serve(ServeCommand),
    /// Resolve one route for a token and print the verdict.
    Check {
        #[arg(long, help = "Route to evaluate, e.g. /finance")]
        path: String,
        #[arg(long, env = "FARMDASH_TOKEN", help = "Access token of the visitor")]
        token: Option<String>,
    },
    /// Print the effective route access policy.
    Policy,
}

#[derive(Args, Debug)]
struct ServeCommand {
    #[arg(long, default_value = "0.0.0.0")]
    host: std::net::IpAddr,
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

impl From<ServeCommand> for ServeConfig {
    fn from(value: ServeCommand) -> Self {
        ServeConfig::new(value.host, value.port)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(ObsConfig::from_env("farmdash-server"))?;
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(cmd) => run_server(cmd, AppConfig::load()?).await,
        Command::Check { path, token } => run_check(&path, token, AppConfig::load()?).await,
        Command::Policy => print_policy(),
    }
}

fn build_gate(config: &AppConfig) -> Gate {
    Gate::new(
        config.policy.clone(),
        Arc::new(RestFactory::new(config.backend.clone())),
        config.resolver.clone(),
    )
}

async fn run_server(cmd: ServeCommand, config: AppConfig) -> Result<()> {
    let gate = build_gate(&config);
    let state = AppState {
        schema: graphql::build_schema(gate.clone()),
        gate,
        cors_allowed_origins: config.cors_allowed_origins.into(),
    };
    http::serve(cmd.into(), state).await
}

async fn run_check(path: &str, token: Option<String>, config: AppConfig) -> Result<()> {
    let evaluation = build_gate(&config)
        .evaluate(token.as_deref(), path)
        .await
        .with_context(|| format!("cannot evaluate {path}"))?;
    println!("{}", serde_json::to_string_pretty(&evaluation)?);
    Ok(())
}

fn print_policy() -> Result<()> {
    let policy = load_policy(|key| std::env::var(key).ok())?;
    println!("{}", serde_json::to_string_pretty(&policy.to_document())?);
    Ok(())
}
