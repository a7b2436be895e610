use crate::db::pool::{check_pool_health, create_pg_pool, PoolConfig};
use anyhow::Context;
use serde_json::Value;
use std::{collections::HashMap, env, sync::Arc};
use tokio::sync::RwLock;
use tracing::warn;

/// Read access to the persisted notification backlog.
///
/// Persistence itself belongs to the notification-creation workflow; the
/// broker only reads the backlog once per connect. A fetch failure never
/// fails the connection; callers degrade to an empty list.
#[derive(Clone)]
pub enum NotificationBacklog {
    Postgres(sqlx::PgPool),
    /// Development/test store; payloads are kept in delivery order
    /// (newest first).
    Memory(Arc<RwLock<HashMap<i64, Vec<Value>>>>),
    /// Always errors; exercises the degrade-to-empty path.
    #[cfg(test)]
    Failing,
}

impl NotificationBacklog {
    /// Connect the store described by the environment: PostgreSQL when
    /// `BEACON_BROKER_DATABASE_URL` is set, otherwise an empty in-memory
    /// store for development.
    pub async fn from_env() -> anyhow::Result<Self> {
        match env::var("BEACON_BROKER_DATABASE_URL") {
            Ok(database_url) => {
                let pool = create_pg_pool(&database_url, PoolConfig::from_env())
                    .await
                    .context("failed to initialize broker PostgreSQL pool for the backlog")?;
                check_pool_health(&pool)
                    .await
                    .context("broker PostgreSQL health check failed for the backlog")?;

                Ok(Self::Postgres(pool))
            }
            Err(_) => {
                warn!("BEACON_BROKER_DATABASE_URL is not set; using an empty in-memory backlog");
                Ok(Self::memory())
            }
        }
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Fetch the persisted notifications for one user, newest first.
    pub async fn for_user(&self, user_id: i64) -> anyhow::Result<Vec<Value>> {
        match self {
            Self::Postgres(pool) => {
                let payloads = sqlx::query_scalar::<_, Value>(
                    r#"
                    SELECT payload
                    FROM notifications
                    WHERE recipient_id = $1
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to query the notification backlog")?;

                Ok(payloads)
            }
            Self::Memory(store) => {
                Ok(store.read().await.get(&user_id).cloned().unwrap_or_default())
            }
            #[cfg(test)]
            Self::Failing => anyhow::bail!("backlog store unavailable"),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::memory()
    }

    #[cfg(test)]
    pub(crate) async fn seed_for_tests(&self, user_id: i64, payloads: Vec<Value>) {
        if let Self::Memory(store) = self {
            store.write().await.insert(user_id, payloads);
        }
    }
}
