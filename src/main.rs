// src/main.rs

mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{Cli, Commands, SettingsCommands};
use envstore::auth::{self, Claims, TokenSigner};
use envstore::config::parse_duration;
use envstore::queue::WorkerPool;
use envstore::{AppContext, Config, db, settings};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Server => {
            db::init(&config.storage.database)?;
            let ctx = Arc::new(AppContext::new(config)?);
            envstore::server::run_server(ctx).await
        }
        Commands::Worker { drain } => cmd_worker(config, drain).await,
        Commands::Token {
            primary_namespace,
            role_bindings,
            expiration,
        } => cmd_token(&config, primary_namespace, &role_bindings, expiration.as_deref()),
        Commands::Settings(command) => cmd_settings(&config, command),
    }
}

fn cmd_init(config: &Config) -> Result<()> {
    db::init(&config.storage.database)?;
    std::fs::create_dir_all(&config.storage.store_directory).with_context(|| {
        format!(
            "Failed to create store directory {}",
            config.storage.store_directory.display()
        )
    })?;
    TokenSigner::load_or_generate(&config.auth.key_path)?;
    println!("Database initialized at: {}", config.storage.database.display());
    println!("Store directory: {}", config.storage.store_directory.display());
    println!("Token signing key: {}", config.auth.key_path.display());
    Ok(())
}

async fn cmd_worker(config: Config, drain: bool) -> Result<()> {
    db::init(&config.storage.database)?;
    let ctx = Arc::new(AppContext::new(config)?);
    let pool = WorkerPool::new(ctx)?;

    if drain {
        pool.startup().await?;
        let executed = pool.drain().await?;
        info!("Executed {} task(s)", executed);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, finishing running tasks");
        }
        signal.cancel();
    });
    pool.run(shutdown).await?;
    Ok(())
}

fn cmd_token(
    config: &Config,
    primary_namespace: String,
    role_bindings: &[String],
    expiration: Option<&str>,
) -> Result<()> {
    let mut bindings: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for binding in role_bindings {
        let (pattern, role) = binding
            .split_once('=')
            .with_context(|| format!("Invalid role binding {binding}: expected PATTERN=ROLE"))?;
        bindings
            .entry(pattern.to_string())
            .or_default()
            .push(role.to_string());
    }
    let role_bindings = auth::normalize_bindings(&bindings)?;

    let lifetime = match expiration {
        Some(value) => parse_duration(value)?,
        None => config.token_expiry()?,
    };
    let claims = Claims {
        exp: Utc::now().timestamp() + lifetime.as_secs() as i64,
        primary_namespace,
        role_bindings,
    };

    let signer = TokenSigner::load(&config.auth.key_path).with_context(|| {
        format!(
            "Failed to load signing key {} (run `envstore init`)",
            config.auth.key_path.display()
        )
    })?;
    println!("{}", signer.issue(&claims)?);
    Ok(())
}

/// `key=value` with the value read as JSON, falling back to a plain string
fn parse_setting(pair: &str) -> Result<(String, Value)> {
    let (key, raw) = pair
        .split_once('=')
        .with_context(|| format!("Invalid setting {pair}: expected KEY=VALUE"))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn cmd_settings(config: &Config, command: SettingsCommands) -> Result<()> {
    let mut conn = db::open(&config.storage.database)?;
    match command {
        SettingsCommands::Get {
            namespace,
            environment,
        } => {
            let resolved = settings::get_settings(
                &conn,
                &config.settings,
                namespace.as_deref(),
                environment.as_deref(),
            )?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        SettingsCommands::Set {
            values,
            namespace,
            environment,
        } => {
            let mut data = Map::new();
            for pair in &values {
                let (key, value) = parse_setting(pair)?;
                data.insert(key, value);
            }
            settings::set_settings(
                &mut conn,
                &config.settings,
                namespace.as_deref(),
                environment.as_deref(),
                &data,
            )?;
            println!("Updated {} setting(s)", data.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting() {
        assert_eq!(
            parse_setting("conda_max_solve_time=60").unwrap(),
            ("conda_max_solve_time".to_string(), Value::from(60))
        );
        assert_eq!(
            parse_setting("conda_channel_alias=https://conda.example.org").unwrap(),
            (
                "conda_channel_alias".to_string(),
                Value::String("https://conda.example.org".into())
            )
        );
        assert!(parse_setting("no-equals").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "envstore",
            "token",
            "--primary-namespace",
            "ops",
            "--role-binding",
            "*/*=admin",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Token { .. }));
    }
}
