use fellowship_common::model::{
    Id,
    post::Post,
    user::{Actor, DisplayName, UserMarker},
};
use fellowship_db::client::{DEFAULT_CHANGE_CHANNEL, DbClient};
use fellowship_sync::{cache::QueryState, client::SyncClient, realtime, session::Session};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
enum InitError {
    #[error("Error parsing .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Error parsing environment: {0}")]
    Envy(#[from] envy::Error),
    #[error("Error connecting to the database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Error listening for the shutdown signal: {0}")]
    Signal(std::io::Error),
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
struct Env {
    database_url: String,
    #[serde(default = "default_realtime_channel")]
    realtime_channel: String,
    user_id: Id<UserMarker>,
    user_name: DisplayName,
    user_avatar_url: Option<String>,
}

fn default_realtime_channel() -> String {
    DEFAULT_CHANGE_CHANNEL.to_owned()
}

fn install_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fellowship_sync=debug,\
                fellowship_db=debug,\
                fellowship_common=debug,sqlx=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn get_env() -> Result<Env, InitError> {
    if let Err(e) = dotenvy::dotenv() {
        if e.not_found() {
            debug!("No .dotenv file found");
        } else {
            return Err(e.into());
        }
    }

    envy::from_env().map_err(InitError::from)
}

fn report(state: &QueryState<Vec<Post>>) {
    if state.is_loading {
        return;
    }

    match &state.data {
        Some(posts) => {
            let comments: usize = posts.iter().map(|post| post.comments.len()).sum();
            info!(
                posts = posts.len(),
                comments,
                stale = state.is_stale,
                failed = state.is_error,
                "Feed updated"
            );
        }
        None if state.is_error => warn!("Feed could not be loaded"),
        None => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), InitError> {
    install_tracing();
    let env = get_env()?;

    let pool = PgPool::connect(&env.database_url).await?;
    let session = Session::new();
    let client = SyncClient::new(
        Arc::new(DbClient::new(pool, env.realtime_channel)),
        session.clone(),
    );

    let shutdown = CancellationToken::new();
    let refetcher = client.spawn_refetcher(shutdown.clone());
    let watcher = realtime::watch_session(client.clone(), shutdown.clone());
    session.sign_in(Actor {
        id: env.user_id,
        name: env.user_name,
        avatar_url: env.user_avatar_url,
    });

    let mut notices = client.notices();
    let mut feed = client.posts(env.user_id).await;
    report(&feed.state());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(InitError::Signal)?;
                break;
            }
            alive = feed.changed() => {
                if !alive {
                    break;
                }
                report(&feed.state());
            }
            notice = notices.recv() => match notice {
                Ok(event) => info!(
                    table = %event.table,
                    id = %event.id,
                    author = ?event.author,
                    "New activity from the community"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed activity notices"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    debug!("Shutting down");
    session.sign_out();
    shutdown.cancel();
    for task in [refetcher, watcher] {
        if let Err(error) = task.await {
            warn!(%error, "Background task failed");
        }
    }

    Ok(())
}
