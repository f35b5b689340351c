//! CLI binary for aura.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use aura::audio::{CpalCapture, CpalPlayback};
use aura::chat::ChatSession;
use aura::gemini::{GeminiClient, GenerativeBackend};
use aura::image::{ImageService, TextArtOptions, render_text_art};
use aura::live::{
    LiveEvent, LiveOptions, LiveSession, SessionSetup, Speaker, WebSocketConnector,
};
use aura::turn::TurnEvent;
use aura::{AuraConfig, paths};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _};

/// Aura: a conversational companion with text, pictures and voice.
#[derive(Parser)]
#[command(name = "aura", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also log to stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Text conversation on stdin/stdout.
    Chat,

    /// Live voice conversation until Ctrl+C.
    Voice,

    /// List available audio devices.
    Devices,

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose)?;

    let config_path = cli.config.unwrap_or_else(AuraConfig::default_config_path);
    let config = AuraConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        Command::Voice => run_voice(config).await,
        Command::Devices => list_devices(),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// File logging always; stderr only with `--verbose` so stdout stays clean.
fn init_logging(verbose: bool) -> anyhow::Result<WorkerGuard> {
    let logs_dir = paths::logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("creating {}", logs_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&logs_dir, "aura.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aura=info"))
    };
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());
    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(guard)
}

async fn run_chat(config: AuraConfig) -> anyhow::Result<()> {
    let backend: Arc<dyn GenerativeBackend> = Arc::new(GeminiClient::from_config(&config.api)?);
    let mut session = ChatSession::new(Arc::clone(&backend), &config);
    let images = ImageService::new(backend, config.retry.policy());
    let art = TextArtOptions::from(&config.render);

    println!("Aura v{}. Type a message, or /quit.", env!("CARGO_PKG_VERSION"));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_turn(rx));
        let result = session.send(line, &tx).await;
        drop(tx);
        let _ = printer.await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "turn failed");
                continue;
            }
        };
        if let Some(prompt) = outcome.image_prompt {
            println!("(drawing: {prompt})");
            match images.generate(&prompt).await {
                Ok(bytes) => match render_text_art(&bytes, &art) {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("cannot show picture: {e}"),
                },
                Err(e) => eprintln!("no picture this time: {e}"),
            }
        }
    }
    Ok(())
}

async fn print_turn(mut events: mpsc::UnboundedReceiver<TurnEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::HeaderParsed(header) => {
                print!("[{}] ", header.mood);
                if header.is_code {
                    print!(
                        "\n```{}\n{}\n```\n",
                        header.code_language, header.code_content
                    );
                }
            }
            TurnEvent::TextChunk(text) => print!("{text}"),
            TurnEvent::ImageRequired(_) => {}
            TurnEvent::Complete => println!(),
            TurnEvent::Error(reason) => eprintln!("\nerror: {reason}"),
        }
        let _ = stdout.flush();
    }
}

async fn run_voice(config: AuraConfig) -> anyhow::Result<()> {
    let connector = Arc::new(WebSocketConnector::from_config(&config.api)?);
    let capture = Arc::new(CpalCapture::new(&config.audio));
    let playback = CpalPlayback::open(&config.audio)?;
    let options = LiveOptions {
        setup: SessionSetup::from_config(&config.api, &config.live),
        connect_policy: config.retry.policy(),
        output_sample_rate: config.audio.output_sample_rate,
    };
    let (mut session, mut events) =
        LiveSession::new(connector, capture, Box::new(playback), options);

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    });

    println!("Connecting...");
    session.start().await?;

    while let Some(event) = events.recv().await {
        match event {
            LiveEvent::StateChanged(state) => info!(?state, "voice session"),
            LiveEvent::Transcription {
                speaker,
                text,
                is_final: true,
            } => {
                let who = match speaker {
                    Speaker::User => "you",
                    Speaker::Model => "aura",
                };
                println!("{who}: {text}");
            }
            LiveEvent::Transcription { .. } => {}
            LiveEvent::ToolCall { name, args, .. } => println!("(tool {name}: {args})"),
            LiveEvent::Error(reason) => eprintln!("error: {reason}"),
            LiveEvent::Closed { reason } => {
                if let Some(reason) = reason {
                    println!("Session closed: {reason}");
                }
                break;
            }
        }
    }
    session.stop().await;
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
