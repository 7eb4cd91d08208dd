use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use textgen::{
    AdapterError, AdapterFactory, GenerationOptions, OptionOverrides, StopSpecification,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "textgen-cli")]
#[command(about = "Run text generation against local or remote model backends")]
#[command(version)]
pub struct Cli {
    /// Model identifier: a GGUF file or folder, a HuggingFace repo,
    /// an http(s) endpoint, an openai:<model> name, or "debug"
    #[arg(short, long)]
    pub model: String,

    /// Prompt text to complete
    #[arg(short, long)]
    pub prompt: String,

    /// Stream increments to stdout as they are generated
    #[arg(short, long)]
    pub stream: bool,

    /// Sampling temperature; 0 selects greedy decoding
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Maximum number of new tokens to generate
    #[arg(long)]
    pub max_new_tokens: Option<u32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub top_k: Option<u32>,

    #[arg(long)]
    pub repetition_penalty: Option<f32>,

    /// Stop string; may be repeated
    #[arg(long = "stop")]
    pub stop: Vec<String>,

    /// API key for remote backends
    #[arg(long)]
    pub api_key: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .init();
    }

    if cli.debug {
        info!("Starting textgen-cli");
        info!("Model: {}", cli.model);
        info!("Prompt: {}", cli.prompt);
    }

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            match &e {
                AdapterError::InvalidOptions(_) | AdapterError::InvalidStopSequence(_) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(2);
                }
                AdapterError::Unloaded(_) | AdapterError::Backend(_) => {
                    eprintln!("Runtime Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

async fn run(cli: Cli) -> std::result::Result<(), AdapterError> {
    let defaults = GenerationOptions::default();
    let overrides = OptionOverrides {
        temperature: cli.temperature,
        max_new_tokens: cli.max_new_tokens,
        top_p: cli.top_p,
        top_k: cli.top_k,
        repetition_penalty: cli.repetition_penalty,
    };
    let stop = StopSpecification::new(cli.stop)?;

    let mut factory = AdapterFactory::new(cli.model.as_str()).defaults(defaults);
    if let Some(api_key) = &cli.api_key {
        factory = factory.api_key(api_key.as_str());
    }
    let adapter = factory.build().await?;

    if cli.stream {
        let mut stream = adapter
            .generate_stream(&cli.prompt, overrides, &stop)
            .await?;
        let mut stdout = std::io::stdout();
        while let Some(item) = stream.next().await {
            let piece = item?;
            stdout
                .write_all(piece.as_bytes())
                .and_then(|_| stdout.flush())
                .map_err(|e| AdapterError::Backend(format!("stdout write failed: {e}")))?;
        }
        println!();
    } else {
        let completion = adapter.generate(&cli.prompt, overrides, &stop).await?;
        println!("{completion}");
    }

    adapter.unload().await?;
    Ok(())
}
