use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use image_handler::config::{self, HandlerConfig};
use image_handler::imaging::RustBackend;
use image_handler::request::{DefaultImageRequest, codec, sign};
use image_handler::services::{FileSecretStore, FsObjectStore, SecretProvider};
use image_handler::types::ImageFormat;
use image_handler::{ImageHandler, ImageHandlerEvent};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "image-handler")]
#[command(about = "Resolve and render image-transformation requests")]
#[command(long_about = "\
Resolve and render image-transformation requests

Requests are URL paths in one of three encodings:

  DEFAULT       /<base64 of {\"bucket\":..,\"key\":..,\"edits\":{..}}>
  LEGACY_PATH   /fit-in/200x200/filters:grayscale():quality(80)/photo.jpg
  REWRITTEN     any path matched by the configured rewrite rule

Buckets are subdirectories of the --store directory. Without --config, settings
come from environment variables (SOURCE_BUCKETS, AUTO_WEBP, ENABLE_SIGNATURE, ...).

Run 'image-handler gen-config' to generate a documented config file.")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Flags for commands that read source images.
#[derive(clap::Args, Clone)]
struct StoreArgs {
    /// Directory holding one subdirectory per bucket
    #[arg(long, default_value = ".")]
    store: PathBuf,

    /// Directory holding one file per secret id
    #[arg(long)]
    secrets: Option<PathBuf>,

    /// Request header, as NAME=VALUE (repeatable)
    #[arg(long = "header", value_parser = parse_pair)]
    headers: Vec<(String, String)>,

    /// Request signature
    #[arg(long)]
    signature: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved request context as JSON
    Resolve {
        path: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Render one or more requests and write the images
    Render {
        #[arg(required = true)]
        paths: Vec<String>,
        #[command(flatten)]
        store: StoreArgs,
        /// Output directory
        #[arg(long, default_value = "out")]
        output: PathBuf,
    },
    /// Encode a JSON payload as a DEFAULT request path
    Encode { json: String },
    /// Decode a DEFAULT request path into its JSON payload
    Decode { path: String },
    /// Compute the signature of a request path
    Sign {
        path: String,
        /// Signing key
        #[arg(long)]
        key: String,
    },
    /// Print a stock config file with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Resolve { path, store } => {
            let handler = build_handler(load_settings(cli.config.as_deref())?, &store)?;
            let ctx = handler.resolve(&event_for(&path, &store))?;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        Command::Render {
            paths,
            store,
            output,
        } => {
            let settings = load_settings(cli.config.as_deref())?;
            init_thread_pool(&settings.processing);
            let handler = build_handler(settings, &store)?;
            std::fs::create_dir_all(&output)?;

            let failures = paths
                .par_iter()
                .enumerate()
                .filter(|(index, path)| {
                    match render_one(&handler, &event_for(path, &store), &output, *index) {
                        Ok(file) => {
                            println!("{} → {}", path, file.display());
                            false
                        }
                        Err(e) => {
                            error!(path = %path, error = %e, "render failed");
                            true
                        }
                    }
                })
                .count();
            if failures > 0 {
                return Err(format!("{failures} of {} requests failed", paths.len()).into());
            }
        }
        Command::Encode { json } => {
            let request: DefaultImageRequest = serde_json::from_str(&json)?;
            println!("{}", codec::encode(&request)?);
        }
        Command::Decode { path } => {
            let request = codec::decode(Some(&path))?;
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
        Command::Sign { path, key } => {
            println!("{}", sign(&path, &key).map_err(|e| e.to_string())?);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn load_settings(path: Option<&Path>) -> Result<HandlerConfig, config::ConfigError> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration file");
            config::load_config(path)
        }
        None => HandlerConfig::from_env(),
    }
}

fn build_handler(
    settings: HandlerConfig,
    args: &StoreArgs,
) -> Result<ImageHandler<RustBackend>, config::ConfigError> {
    let store = Box::new(FsObjectStore::new(&args.store));
    let handler = ImageHandler::new(settings, RustBackend::new(), store)?;
    Ok(match &args.secrets {
        Some(dir) => handler.with_secrets(Box::new(SecretProvider::new(FileSecretStore::new(dir)))),
        None => handler,
    })
}

fn event_for(path: &str, args: &StoreArgs) -> ImageHandlerEvent {
    let event = args
        .headers
        .iter()
        .fold(ImageHandlerEvent::new(path), |event, (name, value)| {
            event.with_header(name, value)
        });
    match &args.signature {
        Some(signature) => event.with_query(image_handler::handler::SIGNATURE_PARAM, signature),
        None => event,
    }
}

/// Render one request into `output`, named by position and key.
fn render_one(
    handler: &ImageHandler<RustBackend>,
    event: &ImageHandlerEvent,
    output: &Path,
    index: usize,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    let (ctx, body) = handler.render(event)?;
    let bytes = STANDARD.decode(body)?;
    let stem = Path::new(&ctx.key)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let extension = ImageFormat::from_content_type(&ctx.content_type)
        .map(ImageFormat::as_str)
        .unwrap_or("bin");
    let file = output.join(format!("{index:03}-{stem}.{extension}"));
    std::fs::write(&file, bytes)?;
    Ok(file)
}

/// Initialize the rayon thread pool based on processing config.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    rayon::ThreadPoolBuilder::new()
        .num_threads(processing.render_threads())
        .build_global()
        .ok();
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))
}
