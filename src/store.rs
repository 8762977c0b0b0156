//! # Postgres node store
//!
//! Every record lives in one row of `store_node`, addressed by its parent
//! path and its key. Children of a path are the rows whose `path` equals it,
//! ordered by `seq` so list readers see insertion order.
//!
//! Writes announce the touched path with `pg_notify` on [`CHANGE_CHANNEL`];
//! other server instances bridge those notifications into their local change
//! feed so their subscribers refresh too.

use serde_json::{Map, Value};
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    query, query_as,
    types::Json,
    Error as SqlxError, Pool, Postgres,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{config::Config, error::StoreError, structure::StoredNode};

pub const CHANGE_CHANNEL: &str = "store_changes";

const INSUFFICIENT_PRIVILEGE: &str = "42501";

pub async fn establish_database_connection(
    config: &Config,
    database_url: &str,
) -> Result<Pool<Postgres>, StoreError> {
    let connection_pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .connect(database_url)
        .await
        .map_err(|e| read_error("database", e))?;

    info!(
        min = config.min_connections,
        max = config.max_connections,
        "database connection pool established"
    );

    Ok(connection_pool)
}

pub async fn table_exist(database_pool: &Pool<Postgres>) -> Result<(), StoreError> {
    query(
        r#"
            CREATE TABLE IF NOT EXISTS store_node (
                seq BIGSERIAL,
                path TEXT NOT NULL,
                key TEXT NOT NULL,
                value JSONB NOT NULL,
                PRIMARY KEY (path, key)
            );
        "#,
    )
    .execute(database_pool)
    .await
    .map_err(|e| write_error("store_node", e))?;

    query(
        r#"
            CREATE INDEX IF NOT EXISTS store_node_path_seq ON store_node (path, seq);
        "#,
    )
    .execute(database_pool)
    .await
    .map_err(|e| write_error("store_node", e))?;

    Ok(())
}

fn split_path(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn read_error(path: &str, error: SqlxError) -> StoreError {
    StoreError::ReadFailed {
        path: path.to_string(),
        detail: error.to_string(),
    }
}

fn write_error(path: &str, error: SqlxError) -> StoreError {
    if let SqlxError::Database(database_error) = &error {
        if database_error.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE) {
            return StoreError::WriteDenied {
                path: path.to_string(),
            };
        }
    }

    StoreError::WriteFailed {
        path: path.to_string(),
        detail: error.to_string(),
    }
}

pub struct PgStore {
    pool: Pool<Postgres>,
    instance: String,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>, instance: String) -> Self {
        Self { pool, instance }
    }

    async fn own_row(&self, path: &str) -> Result<Option<StoredNode>, StoreError> {
        let (parent, key) = split_path(path);

        query_as::<_, StoredNode>("SELECT * FROM store_node WHERE path = $1 AND key = $2")
            .bind(parent)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| read_error(path, e))
    }

    async fn child_rows(&self, path: &str) -> Result<Vec<StoredNode>, StoreError> {
        query_as::<_, StoredNode>("SELECT * FROM store_node WHERE path = $1 ORDER BY seq")
            .bind(path)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| read_error(path, e))
    }

    pub async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        if let Some(row) = self.own_row(path).await? {
            return Ok(Some(row.value.0));
        }

        let rows = self.child_rows(path).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let children: Map<String, Value> = rows.into_iter().map(|row| (row.key, row.value.0)).collect();
        Ok(Some(Value::Object(children)))
    }

    pub async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = self.child_rows(path).await?;
        if !rows.is_empty() {
            return Ok(rows.into_iter().map(|row| (row.key, row.value.0)).collect());
        }

        match self.own_row(path).await? {
            Some(StoredNode {
                value: Json(Value::Object(map)),
                ..
            }) => Ok(map.into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn insert(&self, path: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let child = format!("{path}/{key}");

        query("INSERT INTO store_node (path, key, value) VALUES ($1, $2, $3)")
            .bind(path)
            .bind(key)
            .bind(Json(value))
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(&child, e))?;

        self.notify(&child).await;
        Ok(())
    }

    /// Overwrite the node at `path`, dropping anything stored beneath it.
    pub async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        if value.is_null() {
            return self.remove(path).await;
        }

        let (parent, key) = split_path(path);

        query("DELETE FROM store_node WHERE path = $1 OR starts_with(path, $1 || '/')")
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(path, e))?;

        query(
            r#"
                INSERT INTO store_node (path, key, value) VALUES ($1, $2, $3)
                ON CONFLICT (path, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(parent)
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(path, e))?;

        self.notify(path).await;
        Ok(())
    }

    pub async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let (parent, key) = split_path(path);
        let (removed, kept): (Vec<_>, Vec<_>) = fields.into_iter().partition(|(_, v)| v.is_null());
        let removed: Vec<String> = removed.into_iter().map(|(k, _)| k).collect();
        let kept: Map<String, Value> = kept.into_iter().collect();

        query(
            r#"
                INSERT INTO store_node (path, key, value) VALUES ($1, $2, $3)
                ON CONFLICT (path, key) DO UPDATE SET value = (store_node.value || EXCLUDED.value) - $4::text[]
            "#,
        )
        .bind(parent)
        .bind(key)
        .bind(Json(Value::Object(kept)))
        .bind(&removed)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(path, e))?;

        self.notify(path).await;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let (parent, key) = split_path(path);

        query(
            "DELETE FROM store_node WHERE (path = $1 AND key = $2) OR path = $3 OR starts_with(path, $3 || '/')",
        )
        .bind(parent)
        .bind(key)
        .bind(path)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(path, e))?;

        self.notify(path).await;
        Ok(())
    }

    /// Notification failures only delay remote subscribers; the write itself
    /// already succeeded.
    async fn notify(&self, path: &str) {
        let payload = format!("{}|{path}", self.instance);

        if let Err(e) = query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            warn!(path, error = %e, "change notification failed");
        }
    }

    /// Forward notifications raised by other instances into `feed`.
    pub async fn listen(&self, feed: broadcast::Sender<String>) -> Result<JoinHandle<()>, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| read_error(CHANGE_CHANNEL, e))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| read_error(CHANGE_CHANNEL, e))?;

        let instance = self.instance.clone();
        info!(channel = CHANGE_CHANNEL, "listening for remote changes");

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some((origin, path)) = notification.payload().split_once('|') else {
                            warn!(payload = notification.payload(), "malformed change notification");
                            continue;
                        };
                        if origin == instance {
                            continue;
                        }
                        debug!(path, origin, "remote change");
                        let _ = feed.send(path.to_string());
                    }
                    Err(e) => {
                        warn!(error = %e, "change listener stopped");
                        break;
                    }
                }
            }
        }))
    }
}
