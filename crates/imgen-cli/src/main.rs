use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgen_contracts::events::EventWriter;
use imgen_contracts::{GenerationRequest, ImageArtifact, Job};
use imgen_engine::{
    default_generator_registry, ImageFetcher, ImageGeneratorRegistry, JobClient, MidjourneyConfig,
    MidjourneyGenerator,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "imgen-rs", version, about = "Image generation adapters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one image through a provider adapter and save it under --out.
    Generate(GenerateArgs),
    /// Run a Midjourney job and print the candidate CDN URLs.
    Midjourney(MidjourneyArgs),
    /// Download or decode an image and save it next to --dest.
    Fetch(FetchArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "midjourney")]
    provider: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "1:1")]
    aspect_ratio: String,
    #[arg(long)]
    input_image: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct MidjourneyArgs {
    prompt: String,
    #[arg(long, short = 'a', default_value = "1:1")]
    aspect_ratio: String,
}

#[derive(Debug, Parser)]
struct FetchArgs {
    #[arg(long)]
    source: String,
    /// Destination path without extension.
    #[arg(long)]
    dest: PathBuf,
    /// Treat --source as base64 instead of a URL.
    #[arg(long)]
    inline: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("imgen-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let _ = dotenv::dotenv();
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Midjourney(args) => run_midjourney(args),
        Command::Fetch(args) => run_fetch(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = MidjourneyConfig::from_env();
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, uuid::Uuid::new_v4().to_string()));
    let request = build_request(&args);

    let registry = match &events {
        Some(events) => registry_with_progress_events(config, &args.out, events.clone())?,
        None => default_generator_registry(config, &args.out)?,
    };

    if let Some(events) = &events {
        events.generation_started(&args.provider, &request)?;
    }
    let artifact = match registry.generate(&args.provider, &request) {
        Ok(artifact) => artifact,
        Err(err) => {
            if let Some(events) = &events {
                events.generation_failed(&args.provider, &format!("{err:#}"))?;
            }
            return Err(err);
        }
    };
    if let Some(events) = &events {
        events.artifact_created(&args.provider, &artifact)?;
    }

    println!("{}", artifact_json(&artifact));
    Ok(0)
}

fn registry_with_progress_events(
    config: MidjourneyConfig,
    out: &Path,
    events: EventWriter,
) -> Result<ImageGeneratorRegistry> {
    let observer = Arc::new(move |job: &Job| {
        if let Err(err) = events.job_progress(job) {
            tracing::warn!("failed to record job progress: {err:#}");
        }
    });
    let mut registry = ImageGeneratorRegistry::new();
    registry.register(MidjourneyGenerator::new(config, out)?.with_progress(observer));
    Ok(registry)
}

fn run_midjourney(args: MidjourneyArgs) -> Result<i32> {
    let config = MidjourneyConfig::from_env();
    config.auth.validate()?;
    eprintln!("Prompt: {}\nAspect ratio: {}", args.prompt, args.aspect_ratio);
    let client = JobClient::new(config)?;
    let urls = client.generate_image(&args.prompt, &args.aspect_ratio)?;
    for url in urls {
        println!("{url}");
    }
    Ok(0)
}

fn run_fetch(args: FetchArgs) -> Result<i32> {
    let fetcher = ImageFetcher::new()?;
    let artifact = fetcher
        .fetch_and_save(&args.source, &args.dest, args.inline)
        .with_context(|| format!("failed to save image to {}", args.dest.display()))?;
    println!("{}", artifact_json(&artifact));
    Ok(0)
}

fn build_request(args: &GenerateArgs) -> GenerationRequest {
    let mut request = GenerationRequest::new(args.prompt.clone()).with_aspect_ratio(args.aspect_ratio.clone());
    if let Some(model) = &args.model {
        request = request.with_model(model.clone());
    }
    if let Some(input_image) = &args.input_image {
        request = request.with_input_image(input_image.clone());
    }
    request
}

fn artifact_json(artifact: &ImageArtifact) -> serde_json::Value {
    json!({
        "mime_type": artifact.mime_type,
        "width": artifact.width,
        "height": artifact.height,
        "filename": artifact.local_filename,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_defaults_to_midjourney_and_square_ratio() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["imgen-rs", "generate", "--prompt", "a red fox", "--out", "/tmp/files"])?;
        let Command::Generate(args) = cli.command else {
            panic!("expected generate command");
        };
        assert_eq!(args.provider, "midjourney");
        assert_eq!(args.aspect_ratio, "1:1");
        assert!(args.events.is_none());

        let request = build_request(&args);
        assert_eq!(request, GenerationRequest::new("a red fox"));
        Ok(())
    }

    #[test]
    fn generate_request_carries_optional_arguments() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "imgen-rs",
            "generate",
            "--prompt",
            "a red fox",
            "--model",
            "v7",
            "--aspect-ratio",
            "16:9",
            "--input-image",
            "ref.png",
            "--out",
            "/tmp/files",
        ])?;
        let Command::Generate(args) = cli.command else {
            panic!("expected generate command");
        };
        let request = build_request(&args);
        assert_eq!(request.model.as_deref(), Some("v7"));
        assert_eq!(request.aspect_ratio, "16:9");
        assert_eq!(request.input_image.as_deref(), Some("ref.png"));
        Ok(())
    }

    #[test]
    fn midjourney_takes_positional_prompt_and_short_ratio_flag() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["imgen-rs", "midjourney", "a red fox", "-a", "3:4"])?;
        let Command::Midjourney(args) = cli.command else {
            panic!("expected midjourney command");
        };
        assert_eq!(args.prompt, "a red fox");
        assert_eq!(args.aspect_ratio, "3:4");
        Ok(())
    }

    #[test]
    fn fetch_requires_source_and_destination() {
        assert!(Cli::try_parse_from(["imgen-rs", "fetch", "--source", "https://x.test/a.png"]).is_err());
        assert!(Cli::try_parse_from(["imgen-rs", "fetch", "--source", "AAAA", "--dest", "out/im_x", "--inline"]).is_ok());
    }

    #[test]
    fn artifact_json_matches_adapter_tuple() {
        let artifact = ImageArtifact {
            mime_type: "image/webp".to_string(),
            width: 1024,
            height: 1024,
            extension: "webp".to_string(),
            local_filename: "im_abcdefgh.webp".to_string(),
        };
        assert_eq!(
            artifact_json(&artifact),
            json!({
                "mime_type": "image/webp",
                "width": 1024,
                "height": 1024,
                "filename": "im_abcdefgh.webp",
            })
        );
    }
}
