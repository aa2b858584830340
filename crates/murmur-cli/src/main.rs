use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use murmur_core::config::{Config, LoggingConfig, ServerConfig};
use murmur_gateway::GatewayState;
use murmur_providers::TextToSpeech;
use murmur_providers::murf::MurfProvider;

#[derive(Parser)]
#[command(
    name = "murmur",
    about = "Real-time voice conversation agent: speech in, spoken replies out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List the voices offered by the synthesis provider
    Voices,

    /// Synthesize text and print the hosted audio URL
    Say {
        text: String,

        /// Voice to use (default: configured voice)
        #[arg(long)]
        voice: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate configuration and report problems
    Check,
    /// Get a specific config value by dotted path
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            let port = port.unwrap_or_else(|| config.port());
            if let Some(bind) = bind {
                let current_port = config.port();
                config
                    .server
                    .get_or_insert_with(|| ServerConfig {
                        port: current_port,
                        bind: None,
                        fallback_audio: None,
                    })
                    .bind = Some(bind);
            }

            let (warnings, errors) = config.validate();
            for w in &warnings {
                tracing::warn!("{w}");
            }
            if !errors.is_empty() {
                for e in &errors {
                    tracing::error!("{e}");
                }
                anyhow::bail!("invalid configuration: {}", config_path.display());
            }

            let state = GatewayState::from_config(Arc::new(config));
            #[cfg(feature = "metrics")]
            let state = state.with_metrics(murmur_gateway::metrics::install_prometheus_recorder()?);

            tracing::info!(config = %config_path.display(), "Starting Murmur on port {port}");
            murmur_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Check => {
                let (warnings, errors) = config.validate();
                println!("Config: {}", config_path.display());
                for w in &warnings {
                    println!("  warning: {w}");
                }
                for e in &errors {
                    println!("  error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("OK");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at `{key}`"),
            },
        },
        Commands::Voices => {
            let tts = synthesis_provider(&config)?;
            for voice in tts.list_voices().await? {
                let name = voice.display_name.as_deref().unwrap_or("");
                let locale = voice.locale.as_deref().unwrap_or("");
                println!("{:<24} {:<28} {locale}", voice.voice_id, name);
            }
        }
        Commands::Say { text, voice } => {
            let tts = synthesis_provider(&config)?;
            let voice = voice.unwrap_or_else(|| tts.default_voice().to_string());
            let url = tts.synthesize_url(&text, &voice).await?;
            println!("{url}");
        }
    }

    Ok(())
}

fn synthesis_provider(config: &Config) -> anyhow::Result<MurfProvider> {
    MurfProvider::from_config(&config.tts())
        .ok_or_else(|| anyhow::anyhow!("Speech synthesis API key not configured"))
}

/// Level precedence: `RUST_LOG`, then `--verbose`, then `logging.level`.
fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let mut filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = if verbose {
                "debug"
            } else {
                logging.level.as_deref().unwrap_or("info")
            };
            EnvFilter::try_new(level)?
        }
    };
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring invalid log filter `{directive}`: {e}"),
        }
    }

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
