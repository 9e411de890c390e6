use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use flarecache::{
    build::bazel::remote::execution::v2::Digest,
    config::{ClientConfig, Endpoint},
    digest::sha256_of_reader,
    filegroup::{FileGroup, FileGroupTransfer, TransferConfig},
    KvClient, SessionState,
};
#[cfg(unix)]
use flarecache::proxy::{self, ProxyConfig};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about=None)]
struct Cli {
    /// Overrides BITRISE_BUILD_CACHE_ENDPOINT.
    #[clap(long)]
    endpoint: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Caps,
    Put {
        file: PathBuf,
        /// Defaults to the file's SHA-256.
        #[clap(long)]
        key: Option<String>,
    },
    Get {
        key: String,
        file: PathBuf,
    },
    Delete {
        key: String,
    },
    /// Takes digests as `<sha256>/<size>`.
    Missing {
        digests: Vec<String>,
    },
    UploadGroup {
        manifest: PathBuf,
        /// Also store the manifest remotely under this key.
        #[clap(long)]
        key: Option<String>,
        #[clap(long, default_value_t = 20)]
        concurrency: usize,
    },
    DownloadGroup {
        manifest: Option<PathBuf>,
        /// Fetch the manifest stored under this key instead.
        #[clap(long)]
        key: Option<String>,
        #[clap(long)]
        skip_existing: bool,
        #[clap(long)]
        force_overwrite: bool,
        #[clap(long, default_value_t = 20)]
        concurrency: usize,
    },
    #[cfg(unix)]
    Proxy {
        #[clap(subcommand)]
        command: ProxyCommand,
    },
}

#[cfg(unix)]
#[derive(Subcommand, Debug)]
enum ProxyCommand {
    Start {
        /// Serve reads only; writes succeed without reaching the remote.
        #[clap(long)]
        no_push: bool,
    },
    Stop,
}

type CliResult = anyhow::Result<()>;

#[tokio::main]
async fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,h2=warn,hyper=warn,tower=warn")),
        )
        .init();
    real_main().await
}

async fn connect(endpoint: &Option<String>) -> anyhow::Result<Arc<KvClient>> {
    let mut config = ClientConfig::from_env("flare-kv")?;
    if let Some(endpoint) = endpoint {
        config.endpoint = Endpoint::parse(endpoint)?;
    }
    let client = KvClient::connect(config, SessionState::from_env()).await?;
    Ok(Arc::new(client))
}

fn parse_digest(raw: &str) -> anyhow::Result<Digest> {
    let (hash, size) = raw
        .split_once('/')
        .ok_or_else(|| anyhow!("expected <sha256>/<size>, got {}", raw))?;
    Ok(Digest {
        hash: hash.to_lowercase(),
        size_bytes: size.parse().with_context(|| format!("bad size in {}", raw))?,
    })
}

async fn read_manifest(path: &PathBuf) -> anyhow::Result<FileGroup> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn real_main() -> CliResult {
    let cli = Cli::parse();

    match cli.command {
        Command::Caps => {
            connect(&cli.endpoint).await?.get_capabilities().await?;
            println!("ok");
        }
        Command::Put { file, key } => {
            let key = match key {
                Some(key) => key,
                None => sha256_of_reader(&mut File::open(&file).await?).await?.0,
            };
            connect(&cli.endpoint).await?.upload_file(&file, &key).await?;
            println!("{}", key);
        }
        Command::Get { key, file } => {
            connect(&cli.endpoint)
                .await?
                .download_file(&file, &key, 0, false, false)
                .await?;
        }
        Command::Delete { key } => connect(&cli.endpoint).await?.delete(&key).await?,
        Command::Missing { digests } => {
            let digests = digests
                .iter()
                .map(|d| parse_digest(d))
                .collect::<anyhow::Result<Vec<_>>>()?;
            for digest in connect(&cli.endpoint).await?.find_missing(&digests).await? {
                println!("{}/{}", digest.hash, digest.size_bytes);
            }
        }
        Command::UploadGroup {
            manifest,
            key,
            concurrency,
        } => {
            let group = read_manifest(&manifest).await?;
            let transfer = FileGroupTransfer::new(
                connect(&cli.endpoint).await?,
                TransferConfig {
                    concurrency,
                    ..Default::default()
                },
            );
            let token = CancellationToken::new();
            let (stats, result) = match key {
                Some(key) => transfer.upload_with_manifest(&group, &key, &token).await,
                None => transfer.upload(&group, &token).await,
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
            result?;
        }
        Command::DownloadGroup {
            manifest,
            key,
            skip_existing,
            force_overwrite,
            concurrency,
        } => {
            let transfer = FileGroupTransfer::new(
                connect(&cli.endpoint).await?,
                TransferConfig {
                    concurrency,
                    skip_existing,
                    force_overwrite,
                    ..Default::default()
                },
            );
            let token = CancellationToken::new();
            let stats = match (manifest, key) {
                (Some(manifest), None) => {
                    let group = read_manifest(&manifest).await?;
                    let (stats, result) = transfer.download(&group, &token).await;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                    result.map(|_| stats)
                }
                (None, Some(key)) => {
                    let (stats, result) = transfer.download_from_manifest(&key, &token).await;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                    result.map(|_| stats)
                }
                _ => bail!("pass exactly one of a manifest file or --key"),
            }?;
            info!(downloaded = stats.files_downloaded, "done");
        }
        #[cfg(unix)]
        Command::Proxy { command } => {
            let config = ProxyConfig::from_env();
            match command {
                ProxyCommand::Start { no_push } => {
                    let client = connect(&cli.endpoint).await?;
                    proxy::serve(config.with_push_enabled(!no_push), client).await?;
                }
                ProxyCommand::Stop => {
                    if !proxy::stop(&config.pid_file).await? {
                        println!("no proxy running");
                    }
                }
            }
        }
    };

    Ok(())
}
