//! Kai CLI
//!
//! Talk to the pipeline from a terminal against any OpenAI-compatible
//! endpoint. Conversations and profiles persist in the local sled store.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use kai_core::agents::{OrchestrationResult, Orchestrator};
use kai_core::config::{default_config_path, load_config, save_config, PipelineConfig};
use kai_core::gateway::OpenAiCompatClient;
use kai_core::memory::SledStore;
use kai_core::notifications::LoggingNotifier;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "kai-cli")]
#[command(about = "Kai wellness companion command line interface")]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config_dir>/kai/config.toml)
    #[arg(short, long, env = "KAI_CONFIG")]
    config: Option<PathBuf>,

    /// Sled database path (defaults to <data_dir>/kai/state.db)
    #[arg(long, env = "KAI_DB_PATH")]
    db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive conversation
    Chat {
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Send a single message
    Send {
        #[arg(short, long, default_value = "local")]
        user: String,

        message: String,
    },

    /// Check that the model endpoint is reachable
    Status,

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    kai_core::init_tracing(if cli.verbose {
        "kai_core=debug,kai_cli=debug"
    } else {
        "kai_core=warn"
    });

    match run_command(cli).await {
        Ok(_) => process::exit(0),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn build_orchestrator(config: &PipelineConfig, db: Option<PathBuf>) -> anyhow::Result<Orchestrator> {
    let client = Arc::new(OpenAiCompatClient::new(config.llm.clone()));
    let store = Arc::new(match db {
        Some(path) => SledStore::open(path)?,
        None => SledStore::new()?,
    });

    Ok(Orchestrator::new(client, config)
        .with_conversation_store(store.clone())
        .with_profile_store(store)
        .with_notifier(Arc::new(LoggingNotifier)))
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Send { user, message } => {
            let orchestrator = build_orchestrator(&config, cli.db)?;
            let result = orchestrator.process(&user, &message).await?;
            print_result(&result, cli.format)?;
        }

        Commands::Chat { user } => {
            let orchestrator = build_orchestrator(&config, cli.db)?;
            run_chat(&orchestrator, &user, cli.format).await?;
        }

        Commands::Status => {
            let client = OpenAiCompatClient::new(config.llm.clone());
            let available = client.is_available().await;
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "endpoint": config.llm.base_url,
                        "available": available,
                    }))?
                ),
                OutputFormat::Text => {
                    println!("Endpoint:  {}", config.llm.base_url);
                    println!("Available: {}", available);
                }
            }
        }

        Commands::Config { write } => {
            if write {
                let path = cli.config.unwrap_or_else(default_config_path);
                save_config(&config, &path)?;
                println!("Wrote {}", path.display());
            } else {
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                    OutputFormat::Text => print!("{}", toml::to_string_pretty(&config)?),
                }
            }
        }
    }

    Ok(())
}

async fn run_chat(orchestrator: &Orchestrator, user: &str, format: OutputFormat) -> anyhow::Result<()> {
    println!("Kai - type 'help' for commands, 'exit' to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"you> ").await?;
        stdout.flush().await?;

        let Some(input) = lines.next_line().await? else {
            break;
        };

        match input.trim() {
            "" => continue,
            "exit" | "quit" => {
                println!("Take care.");
                break;
            }
            "help" => {
                println!("Available commands:");
                println!("  checkin  - Ask Kai whether a check-in is due");
                println!("  clear    - Forget this session's buffer");
                println!("  metrics  - Show pipeline counters");
                println!("  health   - Show per-role circuit state");
                println!("  exit     - Quit");
            }
            "checkin" => match orchestrator.proactive_check_in(user).await? {
                Some(prompt) => println!("kai> {}", prompt),
                None => println!("(no check-in needed)"),
            },
            "clear" => {
                orchestrator.clear_session(user);
                println!("(session cleared)");
            }
            "metrics" => {
                println!("{}", serde_json::to_string_pretty(&orchestrator.metrics().snapshot())?);
            }
            "health" => {
                println!("{}", serde_json::to_string_pretty(&orchestrator.gateway().health())?);
            }
            message => match orchestrator.process(user, message).await {
                Ok(result) => print_result(&result, format)?,
                Err(e) => eprintln!("Error: {}", e),
            },
        }
    }

    Ok(())
}

fn print_result(result: &OrchestrationResult, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Text => {
            println!("kai> {}", result.response_text);
            if result.metadata.safety_warning {
                println!("     [safety: {}]", result.safety.as_str());
            }
            for insight in &result.wellness_insights {
                println!(
                    "     [{:?}/{:?}] {}",
                    insight.category, insight.severity, insight.insight
                );
            }
            if let Some(prompt) = &result.proactive_prompt {
                println!("kai> {}", prompt);
            }
        }
    }
    Ok(())
}
