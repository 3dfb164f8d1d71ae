mod config;
mod error;

use std::path::PathBuf;
use std::time::Instant;

use chrono::Local;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use mcp::ToolContent;
use pool::{CallOptions, ConnectionManager, ConnectionPoolStats};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use error::{Error, Result};

#[derive(Parser)]
#[command(name = "toolpool")]
#[command(about = "Pooled, fault-tolerant access to MCP tool servers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true, default_value = config::CONFIG_FILE)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured server and show pool status
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a tool
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// List a server's tools
    Tools { server: String },
    /// Ping a server through the full recovery path
    Ping { server: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(&cli.config)?;
    tracing::debug!(
        path = %cli.config.display(),
        servers = config.servers.len(),
        "config loaded"
    );
    let manager = ConnectionManager::new(config)?;
    let options = CallOptions::new();

    let result = match cli.command {
        Commands::Status { json } => cmd_status(&manager, &options, json).await,
        Commands::Call { server, tool, args } => {
            cmd_call(&manager, &options, &server, &tool, args.as_deref()).await
        }
        Commands::Tools { server } => cmd_tools(&manager, &options, &server).await,
        Commands::Ping { server } => cmd_ping(&manager, &options, &server).await,
    };

    manager.shutdown().await;
    result
}

async fn cmd_status(manager: &ConnectionManager, options: &CallOptions, json: bool) -> Result<()> {
    let servers: Vec<String> = manager.config().servers.keys().cloned().collect();
    if servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    let pings = join_all(servers.iter().map(|s| manager.ping(s, options))).await;
    let stats = manager.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }

    for (server, ping) in servers.iter().zip(&pings) {
        if let Err(e) = ping {
            eprintln!("{server}: {e}");
        }
    }
    let failed = pings.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        return Err(Error::Unreachable {
            failed,
            total: servers.len(),
        });
    }
    Ok(())
}

fn print_stats(stats: &ConnectionPoolStats) {
    println!(
        "{:<20}  {:<10}  {:<9}  {:>6}  {:>6}  {:<16}  LAST ERROR",
        "SERVER", "STATE", "BREAKER", "REQS", "FAILS", "CONNECTED"
    );
    println!("{}", "-".repeat(96));

    for conn in &stats.connections {
        let connected = conn
            .connected_at
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        // Truncate long errors for display
        let last_error = match &conn.last_error {
            Some(e) if e.chars().count() > 60 => format!("{}...", e.chars().take(60).collect::<String>()),
            Some(e) => e.clone(),
            None => String::new(),
        };
        println!(
            "{:<20}  {:<10}  {:<9}  {:>6}  {:>6}  {:<16}  {last_error}",
            conn.server,
            conn.state.as_str(),
            conn.breaker.as_str(),
            conn.requests,
            conn.failures,
            connected
        );
    }

    println!(
        "\n{} ready, {} degraded, {} connecting, {} closed",
        stats.ready, stats.degraded, stats.connecting, stats.closed
    );
}

async fn cmd_call(
    manager: &ConnectionManager,
    options: &CallOptions,
    server: &str,
    tool: &str,
    args: Option<&str>,
) -> Result<()> {
    let arguments = args.map(parse_args).transpose()?;
    let result = manager.call_tool(server, tool, arguments, options).await?;

    for block in &result.content {
        match block {
            ToolContent::Text { text } => println!("{text}"),
            ToolContent::Image { mime_type, data } => {
                println!("[image {mime_type}, {} bytes base64]", data.len())
            }
            ToolContent::Resource { resource } => {
                println!("{}", serde_json::to_string_pretty(resource)?)
            }
        }
    }

    if result.is_error {
        return Err(Error::ToolFailed {
            server: server.to_string(),
            tool: tool.to_string(),
        });
    }
    Ok(())
}

fn parse_args(raw: &str) -> Result<Value> {
    match serde_json::from_str(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(Error::InvalidArgs(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(Error::InvalidArgs(e.to_string())),
    }
}

async fn cmd_tools(manager: &ConnectionManager, options: &CallOptions, server: &str) -> Result<()> {
    let tools = manager.list_tools(server, options).await?;
    if tools.is_empty() {
        println!("{server} exposes no tools.");
        return Ok(());
    }

    for tool in tools {
        match tool.description {
            Some(description) => println!("{:<32}  {description}", tool.name),
            None => println!("{}", tool.name),
        }
    }
    Ok(())
}

async fn cmd_ping(manager: &ConnectionManager, options: &CallOptions, server: &str) -> Result<()> {
    let started = Instant::now();
    manager.ping(server, options).await?;
    println!("{server}: ok ({}ms)", started.elapsed().as_millis());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_must_be_an_object() {
        assert!(parse_args(r#"{"path": "README.md"}"#).is_ok());
        assert!(matches!(parse_args("[1, 2]"), Err(Error::InvalidArgs(_))));
        assert!(matches!(parse_args("{oops"), Err(Error::InvalidArgs(_))));
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from([
            "toolpool",
            "--config",
            "custom.toml",
            "call",
            "fs",
            "read_file",
            "--args",
            "{}",
        ]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert!(matches!(
            cli.command,
            Commands::Call { ref server, ref tool, args: Some(_) } if server == "fs" && tool == "read_file"
        ));
    }
}
