use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use novelseek::config::{AppConfig, DEFAULT_CONFIG_FILE};
use novelseek::db::Catalog;
use novelseek::embeddings::build_embedder;
use novelseek::error::IndexError;
use novelseek::extractor::{FfprobeProbe, MediaProbe};
use novelseek::http_server::start_server;
use novelseek::indexer::index_all;
use novelseek::models::{FileType, SearchRequest};
use novelseek::search::SearchService;
use novelseek::vector_index::FlatIpIndex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// NovelSeek command line.
///
/// ```bash
/// novelseek index
/// novelseek search "dragon slayer" --target novels --sort date_desc
/// novelseek serve --addr 0.0.0.0:5000
/// ```
#[derive(Parser)]
#[command(name = "novelseek")]
#[command(about = "Incremental semantic indexing and search over local novels and videos")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring catalogs and vector indexes up to date with the file system
    Index {
        /// Only index the corpus with this key
        #[arg(long)]
        corpus: Option<String>,
    },

    /// Serve the search API over HTTP
    Serve {
        /// Listen address, overrides the config
        #[arg(long)]
        addr: Option<String>,
    },

    /// Run one search and print the JSON response
    Search {
        query: String,

        /// Corpus keys to search (repeatable); all corpora when omitted
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// score, date_desc, date_asc, size, duration, resolution or name
        #[arg(long)]
        sort: Option<String>,

        #[arg(long)]
        min_score: Option<f32>,

        #[arg(long)]
        page: Option<i64>,

        #[arg(long)]
        page_size: Option<i64>,
    },

    /// Show catalog and index sizes per corpus
    Status,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;

    match cli.command {
        Commands::Index { corpus } => run_index(&config, corpus.as_deref()),
        Commands::Serve { addr } => run_serve(&config, addr),
        Commands::Search {
            query,
            targets,
            sort,
            min_score,
            page,
            page_size,
        } => {
            let request = SearchRequest {
                query: Some(query),
                targets,
                min_score,
                sort_by: sort,
                page,
                page_size,
            };
            run_search(&config, &request)
        }
        Commands::Status => run_status(&config),
    }
}

fn run_index(config: &AppConfig, only: Option<&str>) -> Result<()> {
    if let Some(key) = only {
        if config.corpus(key).is_none() {
            anyhow::bail!("Unknown corpus key: {}", key);
        }
    }

    let embedder = build_embedder(&config.embedder)?;
    log::info!("Using embedder {}", embedder.model_name());

    let wants_probe = config
        .corpora
        .iter()
        .any(|c| c.file_type == FileType::Video && only.map_or(true, |key| key == c.key));
    let probe: Option<Arc<dyn MediaProbe>> = if wants_probe {
        FfprobeProbe::detect(config.indexer.probe_timeout())
            .map(|p| Arc::new(p) as Arc<dyn MediaProbe>)
    } else {
        None
    };

    let mut failed = 0;
    for (key, result) in index_all(config, embedder, probe, only) {
        match result {
            Ok(report) => println!("{}", serde_json::to_string(&report)?),
            Err(IndexError::MissingRoot(root)) => {
                println!("{}: skipped, root {:?} not found", key, root);
            }
            Err(e) => {
                println!("{}: failed: {}", key, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} corpora failed to index", failed);
    }
    Ok(())
}

fn search_service(config: &AppConfig) -> Result<SearchService> {
    let embedder = build_embedder(&config.embedder)?;
    Ok(SearchService::new(
        config.corpora.clone(),
        embedder,
        config.search.clone(),
    ))
}

fn run_serve(config: &AppConfig, addr: Option<String>) -> Result<()> {
    let addr = addr.unwrap_or_else(|| config.server.addr.clone());
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid listen address {:?}", addr))?;

    let service = Arc::new(search_service(config)?);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(start_server(addr, service))
}

fn run_search(config: &AppConfig, request: &SearchRequest) -> Result<()> {
    let service = search_service(config)?;
    let response = service.search(request)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn run_status(config: &AppConfig) -> Result<()> {
    for corpus in &config.corpora {
        let documents = if corpus.catalog.exists() {
            Catalog::open(&corpus.catalog)?.count()?.to_string()
        } else {
            "-".to_string()
        };
        let vectors = match FlatIpIndex::load(&corpus.index) {
            Ok(index) => index.ntotal().to_string(),
            Err(e) => {
                log::debug!("Index for {} not loadable: {}", corpus.key, e);
                "-".to_string()
            }
        };
        println!(
            "{:<16} {:<24} {:<6} documents: {:<8} vectors: {}",
            corpus.key,
            corpus.name,
            corpus.file_type.as_str(),
            documents,
            vectors
        );
    }
    Ok(())
}
