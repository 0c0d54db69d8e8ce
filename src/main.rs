use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexgate::cli::commands::complete::CompleteOptions;

#[derive(Parser)]
#[command(name = "lexgate")]
#[command(version, about = "Reliability gateway for AI completions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, global = true, help = "Load configuration from this file only")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a completion request through the gateway
    Complete {
        #[arg(help = "User prompt text")]
        prompt: String,
        #[arg(long, help = "System prompt prepended to the conversation")]
        system: Option<String>,
        #[arg(long, short, help = "Provider to try first (by configured name)")]
        provider: Option<String>,
        #[arg(long, short, help = "Model override")]
        model: Option<String>,
        #[arg(long, short, help = "User id for usage attribution and budgets")]
        user: Option<String>,
        #[arg(long, help = "Matter reference for billing attribution")]
        matter: Option<String>,
        #[arg(long, short, help = "Sampling temperature (0.0-2.0)")]
        temperature: Option<f64>,
        #[arg(long, help = "Completion token limit")]
        max_tokens: Option<u32>,
        #[arg(long, help = "Ask the provider for a JSON object response")]
        json_mode: bool,
        #[arg(long, help = "Skip the response cache")]
        no_cache: bool,
        #[arg(long, help = "Fail fast instead of retrying")]
        no_retry: bool,
        #[arg(long, help = "Opt out of in-flight request coalescing")]
        no_dedupe: bool,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Show cache, usage, and budget status
    Status {
        #[arg(long, short, help = "Limit usage and budgets to this user")]
        user: Option<String>,
        #[arg(
            long,
            default_value = "24",
            help = "Usage window in hours"
        )]
        window_hours: u64,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Show provider health over the rolling window
    Health {
        #[arg(long, help = "Also probe each provider's API right now")]
        probe: bool,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },

    /// Remove expired and stale gateway data
    Clean {
        #[arg(long, help = "Also drop live cache entries and health history")]
        all: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(short = 'g', long, help = "Show global config file only")]
        global: bool,
        #[arg(
            short = 'f',
            long,
            default_value = "text",
            help = "Output format: text, json"
        )]
        format: String,
    },
    /// Show configuration file paths
    Path,
    /// Edit configuration file with $EDITOR
    Edit {
        #[arg(long, short, help = "Edit global config")]
        global: bool,
    },
    /// Initialize configuration
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        // Extract panic message
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        // Log the panic
        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mLexgate encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }

        eprintln!();

        // Call default hook for backtrace (if RUST_BACKTRACE=1)
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    // Install panic handler first
    setup_panic_handler();

    // Run the actual CLI
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_file = cli.config.as_deref();

    match cli.command {
        Commands::Complete {
            prompt,
            system,
            provider,
            model,
            user,
            matter,
            temperature,
            max_tokens,
            json_mode,
            no_cache,
            no_retry,
            no_dedupe,
            format,
        } => {
            let rt = Runtime::new()?;
            rt.block_on(lexgate::cli::commands::complete::run(
                config_file,
                CompleteOptions {
                    prompt,
                    system,
                    provider,
                    model,
                    user,
                    matter,
                    temperature,
                    max_tokens,
                    json_mode,
                    no_cache,
                    no_retry,
                    no_dedupe,
                    format,
                },
            ))?;
        }
        Commands::Status {
            user,
            window_hours,
            format,
        } => {
            lexgate::cli::commands::status::run(config_file, user.as_deref(), window_hours, &format)?;
        }
        Commands::Health { probe, format } => {
            let rt = Runtime::new()?;
            rt.block_on(lexgate::cli::commands::health::run(
                config_file,
                probe,
                &format,
            ))?;
        }
        Commands::Clean { all } => {
            lexgate::cli::commands::clean::run(config_file, all)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { global, format } => {
                lexgate::cli::commands::config::show(global, &format)?;
            }
            ConfigAction::Path => {
                lexgate::cli::commands::config::path()?;
            }
            ConfigAction::Edit { global } => {
                lexgate::cli::commands::config::edit(global)?;
            }
            ConfigAction::Init { global, force } => {
                if global {
                    lexgate::cli::commands::config::init_global(force)?;
                } else {
                    lexgate::cli::commands::config::init_project()?;
                }
            }
        },
    }

    Ok(())
}
