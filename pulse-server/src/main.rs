use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use pulse_api::Store;

mod cache;
mod db;
mod error;
mod extractors;
mod feeds;
mod handlers;
mod tree;
mod votes;

mod fuzz;
#[cfg(test)]
mod testing;

use cache::{Cache, MemoryCache, RedisCache};
use error::Error;
use extractors::AppState;
use feeds::Feeds;
use tree::{CommentTree, TreeConfig};
use votes::VoteLedger;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(structopt::StructOpt)]
#[structopt(name = "pulse-server", about = "Threaded comment board with live updates")]
struct Opt {
    /// Address to listen on
    #[structopt(long, env = "PULSE_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string, comments are not cached if unset or unreachable
    #[structopt(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Cache in process memory when no redis is available
    #[structopt(long)]
    memory_cache: bool,

    /// Time to live of cached comment list pages, in seconds
    #[structopt(long, default_value = "300")]
    list_cache_ttl: u64,

    /// Time to live of cached single comments, in seconds
    #[structopt(long, default_value = "600")]
    detail_cache_ttl: u64,

    #[structopt(long, default_value = "3")]
    default_max_depth: u32,

    /// Maximum depth of nested replies a client may request
    #[structopt(long, default_value = "10")]
    max_depth_cap: u32,

    #[structopt(long, default_value = "100")]
    max_page_size: u64,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("opening database {db_url:?}"))
}

async fn build_cache(opt: &Opt) -> Cache {
    if let Some(url) = &opt.redis_url {
        match RedisCache::connect(url).await {
            Ok(c) => {
                tracing::info!("caching comments in redis");
                return Cache::new(c);
            }
            Err(err) => tracing::warn!(?err, "redis is unreachable"),
        }
    }
    if opt.memory_cache {
        tracing::info!("caching comments in memory");
        return Cache::new(MemoryCache::new());
    }
    tracing::info!("running without a comment cache");
    Cache::noop()
}

pub fn state(store: Arc<dyn Store>, cache: Cache, config: TreeConfig) -> AppState {
    let feeds = Feeds::new();
    let publisher = Arc::new(feeds.clone());
    let votes = VoteLedger::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        config.max_depth_cap,
    );
    let comments = CommentTree::new(store.clone(), cache, publisher, config);
    AppState {
        store,
        feeds,
        comments,
        votes,
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/whoami", get(handlers::whoami))
        .route(
            "/api/comments",
            get(handlers::list_comments).post(handlers::create_comment),
        )
        .route(
            "/api/comments/:id",
            get(handlers::get_comment)
                .put(handlers::update_comment)
                .delete(handlers::delete_comment),
        )
        .route("/api/comments/:id/like", post(handlers::like))
        .route("/api/comments/:id/dislike", post(handlers::dislike))
        .route("/api/comments/:id/votes", get(handlers::vote_counts))
        .route("/api/feed", get(handlers::feed))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = <Opt as structopt::StructOpt>::from_args();

    let pool = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("running pending migrations")?;

    let cache = build_cache(&opt).await;
    let config = TreeConfig {
        list_ttl: Duration::from_secs(opt.list_cache_ttl),
        detail_ttl: Duration::from_secs(opt.detail_cache_ttl),
        default_max_depth: opt.default_max_depth.min(opt.max_depth_cap),
        max_depth_cap: opt.max_depth_cap,
        default_page_size: TreeConfig::default().default_page_size.min(opt.max_page_size),
        max_page_size: opt.max_page_size,
    };
    let store = Arc::new(db::PostgresStore::new(pool));
    let app = app(state(store, cache, config));

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
