//! mimird, the Mimir daemon.
//!
//! Runs the chat pipeline against an Ollama server and answers questions read
//! line by line from stdin. `:stats` prints the health snapshot as JSON and
//! `:stream <question>` prints the answer as it is generated.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mimir::{ChatEvent, ChatRequest, ClientIdentity, Config, Gateway, Mimir, MimirError};

/// Mimir daemon: retrieval-augmented chat with admission control.
#[derive(Parser)]
#[command(name = "mimird")]
#[command(version)]
#[command(about = "Mimir chat gateway daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "MIMIR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    init_tracing(&config.log_level);

    let interval = config.maintenance.interval;
    let gateway = Mimir::builder().config(config).build()?;
    gateway.start();

    info!(version = env!("CARGO_PKG_VERSION"), "mimird starting");

    let maintenance = tokio::spawn(run_maintenance(gateway.clone(), interval));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                handle_line(&gateway, line.trim()).await;
            }
            _ = &mut shutdown => {
                info!("interrupt received");
                break;
            }
        }
    }

    maintenance.abort();
    gateway.shutdown().await;
    info!("mimird stopped");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn handle_line(gateway: &Gateway, line: &str) {
    match line {
        "" => {}
        ":stats" => {
            let snapshot = gateway.health().await;
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{json}"),
                Err(e) => error!(error = %e, "failed to serialize health snapshot"),
            }
        }
        line if line.starts_with(":stream ") => {
            let question = line.trim_start_matches(":stream ").to_string();
            let request = ChatRequest::new(question).with_client(ClientIdentity::peer("stdin"));
            if let Err(e) = stream_answer(gateway, request).await {
                report(&e);
            }
        }
        question => {
            // Answered concurrently so a burst of lines exercises the queue.
            let gateway = gateway.clone();
            let request = ChatRequest::new(question).with_client(ClientIdentity::peer("stdin"));
            tokio::spawn(async move {
                match gateway.chat(request).await {
                    Ok(response) => {
                        println!("{}", response.answer);
                        for source in &response.sources {
                            println!("  [{}] {}", source.source, source.content);
                        }
                    }
                    Err(e) => report(&e),
                }
            });
        }
    }
}

async fn stream_answer(gateway: &Gateway, request: ChatRequest) -> Result<(), MimirError> {
    let mut events = gateway.chat_stream(request).await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event? {
            ChatEvent::Content { text } => {
                print!("{text}");
                let _ = stdout.flush();
            }
            ChatEvent::Done { sources } => {
                println!();
                for source in &sources {
                    println!("  [{}] {}", source.source, source.content);
                }
            }
        }
    }
    Ok(())
}

fn report(e: &MimirError) {
    if e.is_rejection() {
        warn!(
            error = %e,
            retry_after_secs = e.retry_after_secs(),
            "question rejected"
        );
    } else {
        error!(error = %e, "question failed");
    }
}

async fn run_maintenance(gateway: Gateway, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        gateway.run_maintenance();
    }
}
