use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use offline_ai::core::app_state::AppState;
use offline_ai::core::settings::{Settings, SettingsManager};
use offline_ai::llm::{InferenceEngine, PromptTemplate};
use tracing::info;
use tracing::metadata::LevelFilter;

#[derive(Parser)]
#[command(author, version, about = "Answer a prompt with the local model", long_about = None)]
struct Cli {
    /// Where to fetch the model artifact from when it is missing.
    #[arg(long, env = "OFFLINE_AI_MODEL_URL")]
    url: Option<String>,

    /// Fail instead of downloading a missing artifact.
    #[arg(long)]
    no_download: bool,

    prompt: Vec<String>,
}

fn setup_logging() {
    let filter = std::env::var("OFFLINE_AI_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(feature = "llama")]
fn build_engine(settings: &Settings) -> Result<Arc<dyn InferenceEngine>> {
    Ok(Arc::new(offline_ai::llm::LlamaEngine::new(
        PromptTemplate::new(settings.system_prompt.clone()),
        settings.max_generated_tokens,
    )))
}

#[cfg(not(feature = "llama"))]
fn build_engine(settings: &Settings) -> Result<Arc<dyn InferenceEngine>> {
    let engine = offline_ai::llm::CommandEngine::from_env()?
        .with_template(PromptTemplate::new(settings.system_prompt.clone()))
        .with_max_tokens(settings.max_generated_tokens);
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let settings = Arc::new(SettingsManager::new()?);
    let engine = build_engine(&settings.read())?;
    let state = AppState::with_settings(settings.clone(), engine)?;
    state.start();

    let (bridge, mut events) = state.bridge();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("status: {}", event.status);
        }
    });

    let orchestrator = state.orchestrator();
    if !orchestrator.artifact_present() {
        if cli.no_download {
            bail!(
                "model artifact missing at {}",
                orchestrator.artifact_path().display()
            );
        }
        let url = cli.url.unwrap_or_else(|| settings.read().model_url);
        if url.is_empty() {
            bail!(
                "no model url configured; pass --url or set modelUrl in {:?}",
                settings.config_path()
            );
        }
        bridge
            .download_model(url, |event| info!("downloading model: {}%", event.progress))
            .await?;
    }
    bridge.initialize_model(None).await?;

    let prompt = cli.prompt.join(" ");
    if !prompt.trim().is_empty() {
        let answer = bridge.generate_response(prompt).await?;
        println!("{answer}");
    }

    drop(bridge);
    state.shutdown();
    Ok(())
}
