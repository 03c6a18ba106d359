//! Lexguard CLI - probe endpoints through retry and circuit breaking

use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};
use colored::Colorize;
use serde_json::json;

use lexguard::config::EndpointOverrides;
use lexguard::{
    CancellationToken, EndpointRegistry, ErrorRecord, ExecutionError, FixSuggestion,
    HttpOperation, LexguardConfig, LexguardError, RawFailure, ResilientEndpoint,
};

#[derive(Parser)]
#[command(name = "lexguard")]
#[command(about = "Lexguard - retry and circuit breaking for remote calls")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a URL through the resilient executor
    Probe {
        /// Absolute http(s) URL
        url: String,

        /// Endpoint name for config overrides (defaults to the URL host)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Override max attempts
        #[arg(short, long)]
        attempts: Option<u32>,

        /// Per-attempt timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Send a POST with this JSON body instead of a GET
        #[arg(short, long)]
        data: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how a failure signal is classified
    #[command(group(
        ArgGroup::new("signal")
            .required(true)
            .args(["status", "timeout", "connection", "message"])
    ))]
    Classify {
        /// HTTP status code
        #[arg(long)]
        status: Option<u16>,

        /// An attempt deadline expired
        #[arg(long)]
        timeout: bool,

        /// A connection could not be established
        #[arg(long)]
        connection: bool,

        /// Free-form error text
        #[arg(long)]
        message: Option<String>,

        /// Print the classification as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage ~/.config/lexguard/config.toml
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (file + environment)
    Show,

    /// Print the config file path
    Path,

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    // Logs go to stderr so --json output stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Probe {
            url,
            endpoint,
            attempts,
            timeout_ms,
            data,
            json,
        } => probe(&url, endpoint, attempts, timeout_ms, data, json).await,
        Commands::Classify {
            status,
            timeout,
            connection,
            message,
            json,
        } => classify_signal(status, timeout, connection, message, json),
        Commands::Config { action } => handle_config_command(action),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn probe(
    url: &str,
    endpoint_override: Option<String>,
    attempts: Option<u32>,
    timeout_ms: Option<u64>,
    data: Option<String>,
    json_output: bool,
) -> Result<(), LexguardError> {
    let operation = match data {
        Some(body) => HttpOperation::post(url, body)?,
        None => HttpOperation::get(url)?,
    };
    let name = endpoint_override
        .or_else(|| operation.url().host_str().map(str::to_string))
        .unwrap_or_else(|| "default".to_string());

    let mut config = LexguardConfig::load()?.with_env()?;
    if attempts.is_some() || timeout_ms.is_some() {
        let overrides = config
            .endpoints
            .entry(name.clone())
            .or_insert_with(EndpointOverrides::default);
        overrides.max_attempts = attempts.or(overrides.max_attempts);
        overrides.attempt_timeout_ms = timeout_ms.or(overrides.attempt_timeout_ms);
    }

    let registry = EndpointRegistry::new(config);
    let endpoint = registry.get_or_create(&name)?;

    if !json_output {
        println!(
            "{} Probing {} {} | endpoint: {} | attempts: {}",
            "→".cyan(),
            operation.method(),
            operation.url().as_str().cyan().bold(),
            name.cyan(),
            endpoint.policy().max_attempts
        );
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let started = std::time::Instant::now();
    let outcome = endpoint.call_with_cancel(operation, &cancel).await;
    let elapsed = started.elapsed();
    cancel.cancel();

    if json_output {
        print_probe_json(&endpoint, &outcome)?;
    } else {
        print_probe_text(&endpoint, &outcome, elapsed);
    }

    outcome.map(|_| ()).map_err(LexguardError::from)
}

fn print_probe_json(
    endpoint: &ResilientEndpoint,
    outcome: &Result<lexguard::HttpResponse, ExecutionError>,
) -> Result<(), LexguardError> {
    let value = match outcome {
        Ok(response) => json!({
            "ok": true,
            "response": response,
            "endpoint": endpoint.snapshot(),
        }),
        Err(e) => json!({
            "ok": false,
            "code": e.error_code(),
            "error": e.to_string(),
            "records": e.records(),
            "endpoint": endpoint.snapshot(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_probe_text(
    endpoint: &ResilientEndpoint,
    outcome: &Result<lexguard::HttpResponse, ExecutionError>,
    elapsed: Duration,
) {
    let stats = endpoint.stats();

    match outcome {
        Ok(response) => {
            println!(
                "{} HTTP {} ({} bytes) after {} retries",
                "✓".green(),
                response.status,
                response.body.len(),
                stats.retries
            );
        }
        Err(e) => {
            for record in e.records() {
                print_record(record);
            }
            if let Some(rejection) = e.circuit_rejection() {
                println!("  {} {}", "✗".red(), rejection);
            }
        }
    }

    println!(
        "  Circuit: {} | elapsed: {}ms",
        endpoint.circuit_state(),
        elapsed.as_millis()
    );
}

fn print_record(record: &ErrorRecord) {
    let kind = if record.recoverable {
        record.kind.to_string().yellow()
    } else {
        record.kind.to_string().red()
    };
    println!(
        "  {} attempt {} {} [{}] {}",
        "✗".red(),
        record.attempt_number,
        kind,
        record.severity,
        record.message
    );
}

fn classify_signal(
    status: Option<u16>,
    timeout: bool,
    connection: bool,
    message: Option<String>,
    json_output: bool,
) -> Result<(), LexguardError> {
    let failure = if let Some(code) = status {
        RawFailure::status(code, "")
    } else if timeout {
        RawFailure::Timeout {
            elapsed: Duration::ZERO,
        }
    } else if connection {
        RawFailure::connection("connection failed")
    } else {
        RawFailure::from_message(message.unwrap_or_default())
    };

    let record = ErrorRecord::from_failure(&failure, 1);

    if json_output {
        let value = json!({
            "kind": record.kind,
            "severity": record.severity,
            "recoverable": record.recoverable,
            "message": record.message,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} {}", "Signal:".cyan(), failure);
    println!("  Kind: {}", record.kind.to_string().bold());
    println!("  Severity: {}", record.severity);
    println!(
        "  Recoverable: {}",
        if record.recoverable {
            "yes".green()
        } else {
            "no".red()
        }
    );
    Ok(())
}

fn handle_config_command(action: ConfigAction) -> Result<(), LexguardError> {
    match action {
        ConfigAction::Show => {
            let config = LexguardConfig::load()?.with_env()?;
            // surface invalid values here rather than on first call
            config.to_policy()?;
            config.to_breaker_config()?;

            let content =
                toml::to_string_pretty(&config).map_err(|e| LexguardError::ConfigError {
                    reason: format!("Failed to serialize config: {}", e),
                })?;
            println!("{}", content);
            Ok(())
        }

        ConfigAction::Path => {
            println!("{}", LexguardConfig::config_path().display());
            Ok(())
        }

        ConfigAction::Init { force } => {
            let path = LexguardConfig::config_path();
            if path.exists() && !force {
                println!(
                    "{} Config already exists at {} (use --force to overwrite)",
                    "!".yellow(),
                    path.display()
                );
                return Ok(());
            }

            LexguardConfig::default().save()?;
            println!("{} Wrote {}", "✓".green(), path.display());
            Ok(())
        }
    }
}
