//! SQL-backed allocation store.
//!
//! One table, `floating_ips`, keyed by the canonical address string. The
//! claim primitive runs a guarded `UPDATE ... WHERE key = ''` inside a
//! transaction, so exactly one claimer wins a row under any engine with
//! transactional writes.

use crate::error::StoreError;
use crate::models::{AllocationRecord, ReleasePolicy};
use crate::store::{AllocationStore, PoolSeed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::net::Ipv4Addr;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS floating_ips (
    ip TEXT PRIMARY KEY,
    subnet TEXT NOT NULL,
    key TEXT NOT NULL DEFAULT '',
    attr TEXT NOT NULL DEFAULT '',
    policy INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
)";

/// Allocation store over a SQL connection pool.
pub struct SqlStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct FipRow {
    ip: String,
    subnet: String,
    key: String,
    attr: String,
    policy: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FipRow> for AllocationRecord {
    type Error = StoreError;

    fn try_from(row: FipRow) -> Result<Self, StoreError> {
        let ip: Ipv4Addr = row
            .ip
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("ip {:?}", row.ip)))?;
        let subnet: Ipv4Network = row
            .subnet
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("subnet {:?}", row.subnet)))?;
        Ok(AllocationRecord {
            ip,
            subnet,
            key: row.key,
            attr: row.attr,
            policy: ReleasePolicy::from_i64(row.policy),
            updated_at: row.updated_at,
        })
    }
}

impl SqlStore {
    /// Connects and bootstraps the table if it does not exist yet.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool, bootstrapping the table.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    async fn fetch_records(&self, sql: &str, bind: Option<&str>) -> Result<Vec<AllocationRecord>, StoreError> {
        let query = sqlx::query_as::<_, FipRow>(sql);
        let query = match bind {
            Some(value) => query.bind(value.to_string()),
            None => query,
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(AllocationRecord::try_from).collect()
    }
}

#[async_trait]
impl AllocationStore for SqlStore {
    async fn reconcile(&self, seeds: &[PoolSeed]) -> Result<Vec<AllocationRecord>, StoreError> {
        let now = Utc::now();
        let desired: HashSet<String> = seeds.iter().map(|s| s.ip.to_string()).collect();
        let mut tx = self.pool.begin().await?;
        for seed in seeds {
            sqlx::query(
                "INSERT INTO floating_ips (ip, subnet, key, attr, policy, updated_at)
                 VALUES ($1, $2, '', '', 0, $3)
                 ON CONFLICT(ip) DO UPDATE SET subnet = excluded.subnet",
            )
            .bind(seed.ip.to_string())
            .bind(seed.subnet.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        let rows = sqlx::query_as::<_, FipRow>("SELECT * FROM floating_ips ORDER BY ip")
            .fetch_all(&mut *tx)
            .await?;
        let mut orphans = Vec::new();
        for row in rows {
            if desired.contains(&row.ip) {
                continue;
            }
            if row.key.is_empty() {
                sqlx::query("DELETE FROM floating_ips WHERE ip = $1 AND key = ''")
                    .bind(&row.ip)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("UPDATE floating_ips SET updated_at = $1 WHERE ip = $2")
                    .bind(now)
                    .bind(&row.ip)
                    .execute(&mut *tx)
                    .await?;
                orphans.push(AllocationRecord::try_from(row)?);
            }
        }
        tx.commit().await?;
        Ok(orphans)
    }

    async fn claim_one_in_subnet(
        &self,
        key: &str,
        subnet: &Ipv4Network,
        attr: &str,
    ) -> Result<Option<Ipv4Addr>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        loop {
            let candidate = sqlx::query_as::<_, (String,)>(
                "SELECT ip FROM floating_ips WHERE subnet = $1 AND key = '' ORDER BY ip LIMIT 1",
            )
            .bind(subnet.to_string())
            .fetch_optional(&mut *tx)
            .await?;
            let Some((ip,)) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };
            // The key guard loses against a concurrent claimer of the same
            // row; loop to the next candidate in that case.
            let updated = sqlx::query(
                "UPDATE floating_ips SET key = $1, attr = $2, updated_at = $3
                 WHERE ip = $4 AND key = ''",
            )
            .bind(key)
            .bind(attr)
            .bind(now)
            .bind(&ip)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                tx.commit().await?;
                let ip = ip
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("ip {ip:?}")))?;
                return Ok(Some(ip));
            }
        }
    }

    async fn query_by_key(&self, key: &str) -> Result<Vec<AllocationRecord>, StoreError> {
        self.fetch_records(
            "SELECT * FROM floating_ips WHERE key = $1 ORDER BY ip",
            Some(key),
        )
        .await
    }

    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<AllocationRecord>, StoreError> {
        // substr instead of LIKE: keys contain '_', which LIKE treats as a
        // wildcard.
        self.fetch_records(
            "SELECT * FROM floating_ips
             WHERE key <> '' AND substr(key, 1, length($1)) = $1 ORDER BY ip",
            Some(prefix),
        )
        .await
    }

    async fn subnets_with_key(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT subnet FROM floating_ips WHERE key = $1 ORDER BY subnet",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn subnets_with_free_ip(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT subnet FROM floating_ips WHERE key = '' ORDER BY subnet",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn release_by_keys(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut released = 0;
        for key in keys {
            let result = sqlx::query(
                "UPDATE floating_ips SET key = '', attr = '', updated_at = $1 WHERE key = $2",
            )
            .bind(now)
            .bind(key)
            .execute(&self.pool)
            .await?;
            released += result.rows_affected();
        }
        Ok(released)
    }

    async fn release_by_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE floating_ips SET key = '', attr = '', updated_at = $1
             WHERE key <> '' AND substr(key, 1, length($2)) = $2",
        )
        .bind(now)
        .bind(prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_allocated(&self) -> Result<Vec<AllocationRecord>, StoreError> {
        self.fetch_records(
            "SELECT * FROM floating_ips WHERE key <> '' ORDER BY ip",
            None,
        )
        .await
    }
}
