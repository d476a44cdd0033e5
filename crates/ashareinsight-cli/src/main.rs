//! AShareInsight command-line entry point (spec §6.4): `archive`, `fuse`,
//! `vectorize`, `sync-market-data`, and `serve`, all built on the same
//! composition root.

mod commands;
mod composition;
mod extraction;
mod http;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex as AsyncMutex;

use ashareinsight_core::cache::TtlLruCache;
use ashareinsight_core::Config;

#[derive(Debug, Parser)]
#[command(name = "ashareinsight", about = "Concept-retrieval engine for A-share listed companies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive one extracted document, or every `*.json` file in a directory.
    Archive { path: PathBuf },
    /// Replay fusion for one `doc_id`, or every pending/failed document ("all-unfused").
    Fuse { target: String },
    /// Embed concepts lacking a current vector.
    Vectorize {
        #[arg(long)]
        rebuild_all: bool,
        #[arg(long)]
        company_code: Option<String>,
    },
    /// Load a market-data provider's daily quote snapshot.
    SyncMarketData {
        path: PathBuf,
        /// Backfill mode: skip pruning stale rows.
        #[arg(long)]
        init: bool,
    },
    /// Run the HTTP search surface.
    Serve,
}

#[tokio::main]
async fn main() {
    composition::init_tracing();
    let cli = Cli::parse();

    // Config errors exit 2, matching `AppError::Config(_)`'s mapping (spec §7).
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };

    let runtime = match composition::Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build runtime");
            std::process::exit(2);
        }
    };

    let exit_code = match cli.command {
        Command::Archive { path } => {
            let summary = commands::archive::run(&runtime.storage, &path);
            tracing::info!(
                total = summary.total,
                archived = summary.archived,
                already_existed = summary.already_existed,
                skipped = summary.skipped,
                failed = summary.failed,
                "archive complete"
            );
            summary.exit_code()
        }
        Command::Fuse { target } => {
            let summary = commands::fuse::run(&runtime.storage, &target);
            tracing::info!(total = summary.total, fused = summary.fused, failed = summary.failed, "fuse complete");
            summary.exit_code()
        }
        Command::Vectorize { rebuild_all, company_code } => {
            let args = commands::vectorize::VectorizeArgs { rebuild_all, company_code };
            commands::vectorize::run(&runtime.storage, &runtime.embedding_client, args).await
        }
        Command::SyncMarketData { path, init } => {
            let summary = commands::sync_market_data::run(&runtime.storage, &path, init);
            summary.exit_code()
        }
        Command::Serve => {
            let state = http::AppState {
                storage: runtime.storage.clone(),
                rerank_client: Some(Arc::new(runtime.rerank_client)),
                cache: Arc::new(AsyncMutex::new(TtlLruCache::new(
                    runtime.config.cache_capacity,
                    runtime.config.cache_ttl,
                ))),
                config: Arc::new(runtime.config.clone()),
            };
            match http::serve(state, &runtime.config.http_bind_addr).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "http server failed");
                    3
                }
            }
        }
    };

    std::process::exit(exit_code);
}
