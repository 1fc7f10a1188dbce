//! Fanout - scatter-gather messaging between cluster instances
//!
//! CLI entry point: an in-process demo cluster plus identity/config inspection.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{debug, info};

use fanout::cli::{Cli, Command, OutputFormat};
use fanout::{Config, GetMessagesOptions, Identity, Messenger};
use procbus::LocalCluster;

fn parse_level(level_str: Option<&str>) -> tracing::Level {
    match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    }
}

fn open_log_file() -> Result<fs::File> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fanout")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    fs::File::create(log_dir.join("fanout.log")).context("Failed to create log file")
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = parse_level(cli_log_level.or(config_log_level));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    match open_log_file() {
        Ok(log_file) => tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init(),
        Err(e) => {
            eprintln!("Warning: {:#}, logging to stderr", e);
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    info!("Logging initialized (level: {:?})", level);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref());

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(timeout_ms = config.timeout_ms, "Fanout loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Demo {
            instances,
            name,
            topic,
            timeout_ms,
            silent,
            unmanaged,
            format,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            cmd_demo(&config, instances, &name, &topic, timeout, silent, unmanaged, format).await
        }
        Command::Identity { format } => cmd_identity(&config, format),
        Command::Config => cmd_config(&config),
    }
}

/// Start `instances` siblings in one process and scatter `topic` across them
#[allow(clippy::too_many_arguments)]
async fn cmd_demo(
    config: &Config,
    instances: u32,
    name: &str,
    topic: &str,
    timeout: Option<Duration>,
    silent: u32,
    unmanaged: bool,
    format: OutputFormat,
) -> Result<()> {
    debug!(instances, %name, %topic, ?timeout, silent, unmanaged, "cmd_demo: called");
    if instances == 0 && !unmanaged {
        bail!("Demo needs at least one instance to call from (or --unmanaged)");
    }

    let cluster = LocalCluster::new();
    let answering = instances.saturating_sub(silent);
    let mut messengers = Vec::with_capacity(instances as usize);

    for index in 0..instances {
        let instance = cluster.spawn(name);
        let instance_id = instance.id();
        let messenger = Messenger::new(Identity::managed(instance_id, name), instance.client.clone(), config);

        if index < answering {
            let reply_topic = topic.to_string();
            messenger.on_message_sync(topic, move |payload| {
                Ok(json!({"instanceId": instance_id, "topic": reply_topic, "payload": payload}))
            })?;
        } else {
            debug!(instance_id, "cmd_demo: instance stays silent");
        }

        messenger.serve(instance.inbox);
        messengers.push(messenger);
    }

    let caller = if unmanaged {
        Messenger::new(Identity::unmanaged(Some(name.to_string())), Arc::new(cluster.client()), config)
    } else {
        messengers.remove(0)
    };
    caller.connect().await.context("Failed to connect to the bus")?;

    let mut options = GetMessagesOptions::new();
    if let Some(timeout) = timeout {
        options = options.with_timeout(timeout);
    }
    let payload = json!({"from": caller.identity().instance_id});
    let outcome = caller.get_messages_with(topic, payload, options).await;
    info!(metrics = ?caller.metrics(), "cmd_demo: call finished");
    caller.disconnect().await.context("Failed to disconnect from the bus")?;

    let results = match outcome {
        Ok(results) => results,
        Err(e) => {
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&json!({"topic": topic, "error": e.to_string()}))?);
                }
                OutputFormat::Text => println!("{} {}", "✗".red(), e),
            }
            return Err(e).context(format!("Request for '{}' failed", topic));
        }
    };

    match format {
        OutputFormat::Json => {
            let report = json!({"topic": topic, "results": Value::Array(results)});
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("{} {} replies to '{}'", "✓".green(), results.len(), topic.cyan());
            for result in &results {
                println!("  {}", serde_json::to_string(result)?);
            }
        }
    }

    Ok(())
}

fn cmd_identity(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_identity: called");
    let identity = Identity::from_env(&config.identity);

    match format {
        OutputFormat::Json => {
            let mut report = serde_json::to_value(&identity).context("Failed to serialize identity")?;
            report["managed"] = json!(identity.is_managed());
            report["reply-channel"] = json!(identity.reply_channel());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            match identity.instance_id {
                Some(id) => println!("Instance id: {}", id),
                None => println!("Instance id: {} ({} not set)", "unmanaged".yellow(), config.identity.id_env),
            }
            println!("Instance name: {}", identity.instance_name.as_deref().unwrap_or("-"));
            println!("Reply channel: {}", identity.reply_channel());
        }
    }

    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
