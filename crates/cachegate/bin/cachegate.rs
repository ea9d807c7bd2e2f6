//! Cachegate demo binary.
//!
//! Builds the full layer against a simulated backing source and runs a
//! short workload through it:
//! 1. Reads a post list and each post's author one query at a time (N+1)
//! 2. Reads the same authors through a batching loader
//! 3. Serves cached and stale-while-revalidate reads
//! 4. Renames a user and invalidates the affected entries
//!
//! The resulting diagnostics report is printed to stdout as JSON; logs go
//! to stderr.

use anyhow::{Context, Result};
use cachegate::{LoaderStats, prelude::*};
use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Run a simulated workload through the cache layer and print diagnostics
#[derive(Debug, Parser)]
#[command(name = "cachegate", version)]
struct Args {
    /// JSON configuration file; missing fields use defaults
    #[arg(long, env = "CACHEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the cache key namespace
    #[arg(long, env = "CACHEGATE_NAMESPACE")]
    namespace: Option<String>,

    /// Override the concurrency gate limit
    #[arg(long, env = "CACHEGATE_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Posts in the simulated data set
    #[arg(long, env = "CACHEGATE_POSTS", default_value_t = 20)]
    posts: u64,

    /// Simulated latency of every backing operation, in milliseconds
    #[arg(long, env = "CACHEGATE_LATENCY_MS", default_value_t = 5)]
    latency_ms: u64,

    /// Log output format
    #[arg(long, env = "CACHEGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print Prometheus metrics instead of the JSON report
    #[cfg(feature = "metrics")]
    #[arg(long, env = "CACHEGATE_PROMETHEUS")]
    prometheus: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Post {
    id: u64,
    author_id: u64,
    title: String,
}

#[derive(Debug, Clone, thiserror::Error)]
enum DbError {
    #[error(transparent)]
    Busy(#[from] PoolTimeout),
    #[error("user {0} not found")]
    UserNotFound(u64),
}

/// In-memory stand-in for a database with fixed per-query latency
#[derive(Debug)]
struct Database {
    users: Mutex<HashMap<u64, User>>,
    posts: Vec<Post>,
    latency: Duration,
}

impl Database {
    fn seed(posts: u64, latency: Duration) -> Self {
        let authors = (posts / 4).max(1);
        let users = (1..=authors)
            .map(|id| {
                let user = User {
                    id,
                    name: format!("user-{id}"),
                };
                (id, user)
            })
            .collect();
        let posts = (1..=posts)
            .map(|id| Post {
                id,
                author_id: id % authors + 1,
                title: format!("Post {id}"),
            })
            .collect();

        Self {
            users: Mutex::new(users),
            posts,
            latency,
        }
    }

    async fn posts(&self) -> Result<Vec<Post>, DbError> {
        tokio::time::sleep(self.latency).await;
        Ok(self.posts.clone())
    }

    async fn user(&self, id: u64) -> Result<User, DbError> {
        tokio::time::sleep(self.latency).await;
        self.users
            .lock()
            .get(&id)
            .cloned()
            .ok_or(DbError::UserNotFound(id))
    }

    async fn users(&self, ids: &[u64]) -> Vec<Result<User, DbError>> {
        tokio::time::sleep(self.latency).await;
        let users = self.users.lock();
        ids.iter()
            .map(|id| users.get(id).cloned().ok_or(DbError::UserNotFound(*id)))
            .collect()
    }

    async fn rename_user(&self, id: u64, name: &str) -> Result<User, DbError> {
        tokio::time::sleep(self.latency).await;
        let mut users = self.users.lock();
        let user = users.get_mut(&id).ok_or(DbError::UserNotFound(id))?;
        user.name = name.to_string();
        Ok(user.clone())
    }
}

struct Layer {
    config: LayerConfig,
    scheduler: Arc<dyn Scheduler>,
    db: Arc<Database>,
    cache: Cache,
    access: DataAccess,
    invalidator: Invalidator,
    diagnostics: Diagnostics,
}

impl Layer {
    fn new(config: LayerConfig, db: Database) -> Self {
        let scheduler = TokioScheduler::shared();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::with_sweeper(
            &config.cache,
            Arc::clone(&scheduler),
        ));
        let cache = Cache::with_scheduler(
            Arc::clone(&store),
            config.cache.clone(),
            Arc::clone(&scheduler),
        );
        let access = DataAccess::new(&config, Arc::clone(&scheduler));

        Self {
            invalidator: Invalidator::new(Arc::clone(&store)),
            diagnostics: Diagnostics::new(store, access.clone()),
            db: Arc::new(db),
            config,
            scheduler,
            cache,
            access,
        }
    }

    fn user_loader(&self) -> BatchLoader<u64, User, DbError> {
        let db = Arc::clone(&self.db);
        let access = self.access.clone();
        BatchLoader::new(
            move |ids: Vec<u64>| {
                let db = Arc::clone(&db);
                let access = access.clone();
                async move {
                    let list = ids
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    let signature = format!("SELECT * FROM users WHERE id IN ({list})");
                    access
                        .run(&signature, || async { Ok::<_, DbError>(db.users(&ids).await) })
                        .await
                }
            },
            self.config.loader.clone(),
            Arc::clone(&self.scheduler),
        )
    }

    /// One query for the list plus one per post.
    async fn authors_one_by_one(&self) -> Result<usize, DbError> {
        let db = &self.db;
        let posts = self.access.run("SELECT * FROM posts", || db.posts()).await?;

        let mut authors = Vec::with_capacity(posts.len());
        for post in &posts {
            let signature = format!("SELECT * FROM users WHERE id = {}", post.author_id);
            authors.push(self.access.run(&signature, || db.user(post.author_id)).await?);
        }
        Ok(authors.len())
    }

    /// One query for the list plus batched author lookups.
    async fn authors_batched(&self) -> Result<LoaderStats, DbError> {
        let db = &self.db;
        let posts = self.access.run("SELECT * FROM posts", || db.posts()).await?;

        let loader = self.user_loader();
        let authors = loader
            .load_many(posts.iter().map(|post| post.author_id))
            .await;
        let failed = authors.iter().filter(|author| author.is_err()).count();
        if failed > 0 {
            tracing::warn!("{} author lookups failed", failed);
        }
        Ok(loader.stats())
    }

    async fn cached_reads(&self) -> Result<(), DbError> {
        let db = Arc::clone(&self.db);
        let access = self.access.clone();
        let posts_by_author = self
            .cache
            .wrap("posts.by_author", move |author_id: u64| {
                let db = Arc::clone(&db);
                let access = access.clone();
                async move {
                    let signature = format!("SELECT * FROM posts WHERE author_id = {author_id}");
                    let posts = access.run(&signature, || db.posts()).await?;
                    Ok::<_, DbError>(
                        posts
                            .into_iter()
                            .filter(|post| post.author_id == author_id)
                            .collect::<Vec<_>>(),
                    )
                }
            })
            .ttl(Duration::from_secs(60))
            .tags(["posts"])
            .tags_with(|author_id: &u64| vec![format!("user:{author_id}")]);

        for author_id in [1, 1, 2, 1] {
            let result = posts_by_author.call(author_id).await?;
            info!(
                "posts.by_author({}) -> {} posts ({:?})",
                author_id,
                result.value.len(),
                result.status
            );
        }

        let options = RevalidateOptions::new(Duration::from_secs(60), Duration::from_secs(10))
            .with_tags(["users"]);
        for _ in 0..2 {
            let db = Arc::clone(&self.db);
            let user = self
                .cache
                .get_with_revalidate(
                    "user:1",
                    move || async move { db.user(1).await },
                    options.clone(),
                )
                .await?;
            info!("user:1 -> {} ({:?})", user.value.name, user.status);
        }
        Ok(())
    }

    async fn write_and_invalidate(&self) -> Result<User, DbError> {
        let user = self
            .invalidator
            .after_write(
                self.db.rename_user(1, "renamed"),
                &["users".to_string(), "user:1".to_string()],
            )
            .await?;

        let reread: Option<User> = self.cache.get("user:1").await.unwrap_or_default();
        info!(
            "After rename, user:1 is {}",
            if reread.is_some() { "still cached" } else { "evicted" }
        );
        Ok(user)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &Args) -> Result<LayerConfig> {
    let mut config = match &args.config {
        Some(path) => LayerConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => LayerConfig::default(),
    };

    if let Some(namespace) = &args.namespace {
        config.cache.namespace.clone_from(namespace);
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.gate.max_concurrent = max_concurrent;
    }

    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(&args)?;
    info!(
        "Configuration loaded: namespace={}, max_concurrent={}, posts={}",
        config.cache.namespace, config.gate.max_concurrent, args.posts
    );

    let db = Database::seed(args.posts, Duration::from_millis(args.latency_ms));
    let layer = Layer::new(config, db);

    let lookups = layer.authors_one_by_one().await?;
    info!("Loaded {} authors one query at a time", lookups);

    let loader_stats = layer.authors_batched().await?;
    info!(
        "Loaded {} authors in {} batches ({} distinct keys)",
        loader_stats.requests, loader_stats.batches, loader_stats.keys_dispatched
    );

    layer.cached_reads().await?;
    let user = layer.write_and_invalidate().await?;
    info!("Renamed user {} to {}", user.id, user.name);

    let latency = layer.diagnostics.ping().await?;
    info!("Store ping took {:?}", latency);

    let report = layer.diagnostics.report();

    #[cfg(feature = "metrics")]
    if args.prometheus {
        let exporter = cachegate::PrometheusExporter::new()?;
        exporter.update(&report);
        for record in layer.access.monitor().recent(layer.config.monitor.max_log_size) {
            exporter.record_operation_time(record.duration);
        }
        print!("{}", exporter.gather());
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
