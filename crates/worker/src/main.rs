//! `soulgen-generate` -- run one text-to-image generation from the shell.
//!
//! Loads [`GenerationConfig`] from the environment (and `.env`), submits
//! the prompt, waits for the job and downloads the artifacts. The
//! aggregated result is printed to stdout as JSON; logs go to stderr.
//! Ctrl-C cancels the poll loop and requests a remote cancel.
//!
//! See [`GenerationConfig::from_env`] for the environment variables.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soulgen_pipeline::config::GenerationConfig;
use soulgen_pipeline::orchestrator::{GenerationRequest, ImageGenerator};

#[derive(Parser)]
#[command(name = "soulgen-generate", about = "Generate images from a text prompt")]
struct Cli {
    /// Text prompt describing the image
    prompt: String,

    /// Content to steer away from
    #[arg(long, default_value = "")]
    negative: String,

    /// Number of images to request
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Fixed seed for reproducible output
    #[arg(long)]
    seed: Option<u32>,

    /// File stem for the written images (generated when omitted)
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soulgen_generate=info,soulgen_pipeline=info,soulgen_dashscope=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = GenerationConfig::from_env().context("Invalid configuration")?;
    let generator = ImageGenerator::from_config(&config)?;

    let mut request = GenerationRequest::new(cli.prompt)
        .with_negative_prompt(cli.negative)
        .with_output_count(cli.count);
    if let Some(seed) = cli.seed {
        request = request.with_seed(seed);
    }
    if let Some(name) = cli.name {
        request = request.with_base_filename(name);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling generation");
            on_signal.cancel();
        }
    });

    let result = generator
        .generate_with_cancel(request, &cancel)
        .await
        .context("Generation failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
