//! memd CLI: run the memory service. Config from presets and env
//! (`LLM_API_KEY`, `LLM_BASE_URL`, `RUST_LOG`); `.env` loaded at startup.
//!
//! Exit codes: 0 success, 2 config error, 3 storage error, 4 transient error.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use embedding::{EmbeddingService, HashEmbedding};
use llm_client::create_llm_client;
use memory_core::ConfigPresets;
use memory_extract::create_extractor;
use memory_manager::MemoryManager;
use memory_sqlite::CappedSqliteStore;

mod api;
mod logger;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_STORAGE: i32 = 3;
const EXIT_TRANSIENT: i32 = 4;

#[derive(Parser)]
#[command(name = "memd")]
#[command(about = "Memory service for a conversational toy assistant", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP memory service.
    Serve {
        /// Configuration preset: minimal | balanced | full_featured.
        #[arg(short, long, default_value = "balanced")]
        preset: String,
        /// Listen address.
        #[arg(short, long, default_value = "0.0.0.0:8000")]
        addr: String,
        /// Override the data directory.
        #[arg(long)]
        data_dir: Option<String>,
        /// Log file path.
        #[arg(long, default_value = "memd.log")]
        log_file: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Serve {
            preset,
            addr,
            data_dir,
            log_file,
        } => run_serve(preset, addr, data_dir, log_file).await,
    };
    std::process::exit(code);
}

async fn run_serve(
    preset: String,
    addr: String,
    data_dir: Option<String>,
    log_file: String,
) -> i32 {
    if let Err(e) = logger::init_tracing(&log_file) {
        eprintln!("failed to initialize logging: {e}");
        return EXIT_CONFIG;
    }

    let mut config = match ConfigPresets::by_name(&preset) {
        Some(config) => config,
        None => {
            error!(preset = %preset, "unknown preset (expected minimal | balanced | full_featured)");
            return EXIT_CONFIG;
        }
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration, refusing to serve");
        return EXIT_CONFIG;
    }

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(error = %e, data_dir = %config.data_dir, "cannot create data directory");
        return EXIT_STORAGE;
    }
    let db_path = config.db_path();
    let store = match CappedSqliteStore::open(
        &db_path.to_string_lossy(),
        config.max_episodes_per_user,
        config.max_facts_per_user,
    )
    .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, db_path = %db_path.display(), "failed to open storage");
            return EXIT_STORAGE;
        }
    };

    let llm = match create_llm_client(&config) {
        Ok(llm) => llm,
        Err(e) => {
            error!(error = %e, "failed to build LLM client");
            return EXIT_CONFIG;
        }
    };
    let extractor = create_extractor(&config, llm);
    let embedder: Option<Arc<dyn EmbeddingService>> = if config.enable_vector_search {
        Some(Arc::new(HashEmbedding::new(config.vector_dim)))
    } else {
        None
    };

    let manager = match MemoryManager::new(config, store, extractor, embedder) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!(error = %e, "failed to build memory manager");
            return EXIT_CONFIG;
        }
    };

    match api::serve(manager, &addr).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "server error");
            EXIT_TRANSIENT
        }
    }
}
