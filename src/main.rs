//! llm-router - cost- and health-aware routing of LLM inference
//!
//! Routes OpenAI-compatible requests to the cheapest healthy self-hosted
//! cluster or hosted model provider.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_router::config::{Config, KeySource};
use llm_router::providers::ProviderRegistry;

#[derive(Parser)]
#[command(name = "llm-router")]
#[command(about = "Cost- and health-aware router for LLM inference clusters and providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured clusters and provider pricing
    Targets {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llm_router={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &str) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    Config::from_file(Path::new(path))
        .with_context(|| format!("failed to load configuration from '{}'", path))
}

fn log_key_sources(sources: &[(String, KeySource)]) {
    for (provider, source) in sources {
        match source {
            KeySource::None => tracing::warn!(provider = %provider, "No API key available"),
            _ => tracing::info!(provider = %provider, source = %source, "API key resolved"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => {
            let (mut cfg, sources) = load_config(&config)?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config, "Loaded configuration");
            log_key_sources(&sources);

            if let Some(port) = port {
                tracing::info!(port, "Overriding listen port");
                cfg.server.port = port;
            }

            llm_router::proxy::run_server(cfg).await
        }

        Commands::Check { config } => {
            let (cfg, sources) = load_config(&config)?;
            init_tracing(&cfg.logging.level);
            log_key_sources(&sources);

            let enabled = cfg.external_providers.iter().filter(|p| p.enabled).count();
            println!(
                "Configuration OK: {} cluster(s), {} enabled provider(s), strategy {}",
                cfg.clusters.len(),
                enabled,
                cfg.router.routing_strategy
            );
            Ok(())
        }

        Commands::Targets { config } => {
            let (cfg, _) = load_config(&config)?;
            init_tracing(&cfg.logging.level);
            print_targets(&cfg)
        }
    }
}

fn print_targets(cfg: &Config) -> anyhow::Result<()> {
    println!("Clusters:");
    if cfg.clusters.is_empty() {
        println!("  (none)");
    }
    for cluster in &cfg.clusters {
        println!(
            "  {:<20} {:<40} region={:<12} provider={:<8} ${:.4}/h auth={}",
            cluster.name,
            cluster.endpoint,
            cluster.region,
            cluster.provider,
            cluster.cost_per_hour,
            cluster.auth_type.map(|a| a.as_str()).unwrap_or("none"),
        );
    }

    let registry = ProviderRegistry::from_config(&cfg.external_providers)?;
    println!();
    println!("Providers:");
    if registry.is_empty() {
        println!("  (none)");
    }
    for provider in registry.all() {
        println!(
            "  {} ({}, default model {})",
            provider.name(),
            provider.kind(),
            provider.default_model()
        );
        println!(
            "    {:<28} {:>12} {:>12} {:>10} {:>10}",
            "model", "input/1K", "output/1K", "max out", "context"
        );
        for (model, pricing) in provider.pricing_table() {
            println!(
                "    {:<28} {:>12.6} {:>12.6} {:>10} {:>10}",
                model,
                pricing.input_price_per_1k,
                pricing.output_price_per_1k,
                pricing.max_tokens,
                pricing.context_window
            );
        }
    }

    for disabled in cfg.external_providers.iter().filter(|p| !p.enabled) {
        println!("  {} ({}, disabled)", disabled.name, disabled.kind);
    }

    Ok(())
}
