//! cutie-tts command line tool
//!
//! - `generate` - Synthesize text to a WAV file
//! - `speakers` - List known speaker names
//! - `info` - Show which synthesis stages are available
//!
//! Usage:
//!   cutie-tts generate --text "Hello there" --speaker Paimon --output hello.wav
//!   cutie-tts speakers
//!   cutie-tts info --model-path model.safetensors

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use cutie_tts::{
    cli_style::{print_engine_info, print_error, print_info, print_outcome, print_section},
    config::{init_tracing, load_dotenv, Cli, Commands, GenerateArgs, ModelArgs},
    speakers::SpeakerRegistry,
    SpeechEngine, SynthesisRequest, TtsError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Commands::Generate(args) => run_generate(args).await,
        Commands::Speakers => run_speakers(),
        Commands::Info(args) => run_info(args).await,
    }
}

async fn build_engine(args: &ModelArgs) -> Result<Arc<SpeechEngine>, TtsError> {
    let config = args.engine_config();
    let engine = tokio::task::spawn_blocking(move || SpeechEngine::from_config(&config))
        .await
        .map_err(|e| TtsError::Config(format!("engine construction panicked: {e}")))??;
    Ok(Arc::new(engine))
}

async fn run_generate(args: GenerateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(&args.model).await?;

    let mut request = SynthesisRequest::new(args.text).with_speaker(args.speaker);
    if let Some(path) = args.output {
        request = request.with_output_path(path);
    }

    let cancel = tokio_util::sync::CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("received Ctrl+C, cancelling synthesis");
            interrupt.cancel();
        }
    });

    let quiet = args.json;
    let progress = move |message: String| {
        if !quiet {
            print_info(&message);
        }
    };

    match engine
        .synthesize_with_progress(request, &cancel, &progress)
        .await
    {
        Ok(outcome) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            if outcome.total_failure {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Synthesis failed: {e}"));
            std::process::exit(1);
        }
    }
}

fn run_speakers() -> Result<(), Box<dyn std::error::Error>> {
    let registry = SpeakerRegistry::new();
    print_section(&format!("{} speakers", registry.len()));
    for name in registry.list() {
        println!("  {name}");
    }
    Ok(())
}

async fn run_info(args: ModelArgs) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(&args).await?;
    let info = engine.info();
    info!(
        neural = info.capabilities.has_neural,
        "engine information collected"
    );
    print_engine_info(&info);
    Ok(())
}
