use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{ArgValueCompleter, CompletionCandidate};
use futures::StreamExt;
use grab_upload::{
    DEFAULT_CONCURRENCY, DEFAULT_PART_SIZE, FileApiClient, LocalFile, UploadEvent, UploadSource,
    Uploader, fit_part_size,
};
use iocraft::prelude::*;
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::ui::{ConfigHeader, ErrorMessage, InputPrompt, ProgressBar, SuccessMessage};

mod config;
mod ui;

const DEFAULT_BASE_URL: &str = "https://www.grabteacher.example";

/// Upload namespaces the file API knows how to place.
const KNOWN_MODULES: &[&str] = &[
    "avatar",
    "course-cover",
    "video",
    "doc",
    "admin/avatar",
    "admin/qrcode",
    "admin/wechat",
    "admin/teacher/avatar",
    "admin/student/avatar",
];

#[derive(Parser)]
#[command(name = "grab-upload")]
#[command(version)]
#[command(about = "Upload files to GrabTeacher storage")]
struct Cli {
    /// Print debug logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file
    Upload {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Destination namespace, e.g. avatar or course-cover
        #[arg(short, long, add = ArgValueCompleter::new(module_completer))]
        module: Option<String>,
        /// Part size in bytes for multipart uploads
        #[arg(short, long)]
        part_size: Option<u64>,
        /// Maximum number of parts in flight
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Lifetime of presigned URLs, e.g. 5m
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
        /// Use a multipart upload even if the file fits in one part
        #[arg(long)]
        multipart: bool,
    },
    /// Delete an uploaded file by URL or key
    Delete { target: String },
    /// Configure grab-upload interactively
    Config,
    /// Store your API token in the OS keyring
    SetToken { api_token: String },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "grab_upload=debug"
    } else {
        "grab_upload=warn"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let _rt_guard = rt.enter();
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    rt.block_on(async {
        match cli.command {
            Commands::Config => interactive_config(),
            Commands::SetToken { api_token } => {
                config::set_api_token_keyring(api_token)?;
                println!("API token stored for use with grab-upload");
                Ok(())
            }
            Commands::Delete { target } => {
                let config = config::read_config()?;
                let client = build_client(&config, None)?;
                delete_file(&client, &target).await
            }
            Commands::Upload {
                file,
                module,
                part_size,
                concurrency,
                ttl,
                multipart,
            } => {
                let config = config::read_config()?;
                let client = build_client(&config, ttl)?;
                let module = module.or(config.default_module.clone()).ok_or_else(|| {
                    anyhow!("A module must be specified via --module or configured as default")
                })?;
                let part_size = part_size.or(config.part_size).unwrap_or(DEFAULT_PART_SIZE);
                let concurrency = concurrency
                    .or(config.concurrency)
                    .unwrap_or(DEFAULT_CONCURRENCY);

                upload_file(client, &module, &file, part_size, concurrency, multipart).await
            }
        }
    })
}

fn build_client(config: &config::Config, ttl: Option<Duration>) -> Result<FileApiClient> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    let http_client = builder.build().context("Failed to build HTTP client")?;

    let mut client = FileApiClient::new(config.base_url.clone(), config.api_token.clone())
        .with_http_client(http_client);
    if let Some(ttl) = ttl {
        client = client.presign_ttl(ttl);
    }
    Ok(client)
}

async fn upload_file(
    client: FileApiClient,
    module: &str,
    file: &Path,
    part_size: u64,
    concurrency: usize,
    force_multipart: bool,
) -> Result<()> {
    let source = LocalFile::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    if source.is_empty() {
        bail!("Refusing to upload empty file {}", file.display());
    }
    if concurrency == 0 {
        bail!("Concurrency must be at least 1");
    }

    let fitted_part_size = fit_part_size(source.len(), part_size)?;
    if fitted_part_size != part_size {
        warn!(
            requested = part_size,
            used = fitted_part_size,
            "adjusted part size to the object store limits"
        );
    }

    if !force_multipart && source.len() <= fitted_part_size {
        let outcome = client
            .upload_single(&source, module)
            .await
            .context("Upload failed")?;
        element!(SuccessMessage(message: format!("File uploaded: {}", outcome.url))).print();
        return Ok(());
    }

    let total_bytes = source.len();
    let uploader = Uploader::new(client.clone(), client)
        .part_size(fitted_part_size)
        .concurrency(concurrency);
    let mut stream = uploader.upload_stream(&source, module);

    let (tx, rx) = watch::channel(0.0);

    let process_stream = async {
        let mut bytes_uploaded = 0u64;
        while let Some(event) = stream.next().await {
            match event? {
                UploadEvent::PartUploaded { bytes, .. } => {
                    bytes_uploaded += bytes;
                    let percent = (bytes_uploaded as f32 / total_bytes as f32) * 100.0;
                    let _ = tx.send(percent);
                }
                UploadEvent::State(_) => {}
                UploadEvent::Complete(url) => return Ok(url),
            }
        }
        Err::<String, anyhow::Error>(anyhow!("Upload ended without a final object URL"))
    };

    let mut progress_bar = element!(ProgressBar(
        title: format!("Uploading {}", source.name()),
        progress: Some(rx)
    ));

    let url = finish_behind_display(process_stream, progress_bar.render_loop())
        .await
        .context("Upload failed")?;

    element!(SuccessMessage(message: format!("File uploaded: {}", url))).print();

    Ok(())
}

/// Drives `work` to its end even if `display` stops first.
///
/// Dropping an upload midway would skip the abort of its session.
async fn finish_behind_display<T>(
    work: impl Future<Output = Result<T>>,
    display: impl Future<Output = io::Result<()>>,
) -> Result<T> {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        result = display => {
            if let Err(error) = result {
                warn!(%error, "progress display stopped");
            }
            work.await
        }
    }
}

async fn delete_file(client: &FileApiClient, target: &str) -> Result<()> {
    client
        .delete_object(target)
        .await
        .with_context(|| format!("Failed to delete {}", target))?;
    element!(SuccessMessage(message: format!("Deleted {}", target))).print();
    Ok(())
}

fn module_completer(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let Some(current) = current.to_str() else {
        return vec![];
    };

    KNOWN_MODULES
        .iter()
        .filter(|module| module.starts_with(current))
        .map(|module| CompletionCandidate::new(*module))
        .collect()
}

fn read_input(prompt: &str, default: Option<&str>, description: Option<&str>) -> Result<String> {
    element! {
        InputPrompt(
            prompt: prompt.to_string(),
            default: default.map(|s| s.to_string()),
            description: description.map(|s| s.to_string())
        )
    }
    .print();

    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();

    if input.is_empty() {
        if let Some(def) = default {
            Ok(def.to_string())
        } else {
            Ok(input)
        }
    } else {
        Ok(input)
    }
}

fn interactive_config() -> Result<()> {
    element!(ConfigHeader()).print();

    let existing = config::read_config_file()?;
    let current_base_url = existing
        .base_url
        .as_ref()
        .map_or(DEFAULT_BASE_URL, |url| url.as_str());

    let base_url = loop {
        let base_url_str = read_input(
            "API Base URL",
            Some(current_base_url),
            Some("The base URL of the GrabTeacher API"),
        )?;

        match Url::parse(&base_url_str) {
            Ok(url) => break url,
            Err(e) => {
                element!(ErrorMessage(message: format!("Invalid URL: {}", e))).print();
                println!();
            }
        }
    };

    let api_token = loop {
        let api_token = read_input(
            "API Token",
            None,
            Some("Your API token (stored securely in OS keyring)"),
        )?;

        if api_token.is_empty() {
            element!(ErrorMessage(message: "API token cannot be empty".to_string())).print();
            println!();
        } else {
            break api_token;
        }
    };

    let default_module_str = read_input(
        "Default Module",
        existing.default_module.as_deref(),
        Some("Optional: Set a default module to avoid specifying --module every time"),
    )?;
    let default_module = if default_module_str.is_empty() {
        None
    } else {
        Some(default_module_str)
    };

    config::set_api_token_keyring(api_token)?;

    config::update_config(|config_file| {
        config_file.base_url = Some(base_url);
        config_file.default_module = default_module;
    })?;

    element!(SuccessMessage(message: "Configuration complete!".to_string())).print();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    #[tokio::test]
    async fn test_work_outlives_failed_display() {
        let finished = Arc::new(AtomicBool::new(false));
        let work = {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.store(true, Ordering::SeqCst);
                Ok("https://bucket.example.com/a.bin".to_string())
            }
        };
        let display = async { Err(io::Error::other("terminal closed")) };

        let url = finish_behind_display(work, display).await.unwrap();
        assert_eq!(url, "https://bucket.example.com/a.bin");
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_work_error_is_returned() {
        let work = async { Err::<String, _>(anyhow!("part 2 failed")) };
        let display = std::future::pending::<io::Result<()>>();

        let error = finish_behind_display(work, display).await.unwrap_err();
        assert_eq!(error.to_string(), "part 2 failed");
    }
}
