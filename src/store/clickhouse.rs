use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::config::StoreConfig;
use crate::event::Event;
use crate::health::HealthMetrics;

use super::{DayWindow, EventStore, PathViews, SiteStats, TOP_PATHS_LIMIT};

/// ClickHouse-backed event table over a native TCP connection pool.
///
/// Pool sizing and LZ4 compression follow [`build_dsn`]; a full DSN in
/// `store.url` replaces the generated one.
pub struct ClickHouseStore {
    pool: Pool,
    table: String,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStore {
    /// Opens the pool and verifies connectivity with a ping.
    pub async fn connect(cfg: &StoreConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let dsn = if cfg.url.is_empty() {
            build_dsn(cfg)
        } else {
            cfg.url.clone()
        };
        let pool = Pool::new(dsn);

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        if let Some(h) = &health {
            h.clickhouse_connected.set(1.0);
        }

        tracing::info!(
            endpoint = %cfg.endpoint,
            table = %cfg.table,
            "ClickHouse store connected"
        );

        Ok(Self {
            pool,
            table: qualified_table(cfg),
            health,
        })
    }

    fn observe(&self, operation: &str, started: Instant) {
        if let Some(h) = &self.health {
            h.store_duration
                .with_label_values(&[operation])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

impl EventStore for ClickHouseStore {
    async fn insert_event(&self, event: &Event) -> Result<()> {
        let started = Instant::now();
        let sql = insert_sql(&self.table, event);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for event insert")?;

        handle
            .execute(sql.as_str())
            .await
            .context("inserting event row")?;

        self.observe("insert", started);

        Ok(())
    }

    async fn site_stats(&self, site_id: &str, window: DayWindow) -> Result<SiteStats> {
        let started = Instant::now();
        let sql = site_stats_sql(&self.table, site_id, window);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for site stats")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying site stats")?;

        let stats = match block.rows().next() {
            Some(row) => SiteStats {
                total_views: row.get("total_views").context("reading total_views")?,
                unique_users: row.get("unique_users").context("reading unique_users")?,
            },
            None => SiteStats::default(),
        };

        self.observe("site_stats", started);

        Ok(stats)
    }

    async fn top_paths(&self, site_id: &str, window: DayWindow) -> Result<Vec<PathViews>> {
        let started = Instant::now();
        let sql = top_paths_sql(&self.table, site_id, window);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for top paths")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying top paths")?;

        let mut top = Vec::with_capacity(TOP_PATHS_LIMIT);
        for row in block.rows() {
            top.push(PathViews {
                path: row.get("path").context("reading path")?,
                views: row.get("views").context("reading views")?,
            });
        }

        self.observe("top_paths", started);

        Ok(top)
    }
}

/// Builds a clickhouse-rs compatible TCP DSN from configuration.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
pub fn build_dsn(cfg: &StoreConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

    dsn
}

fn qualified_table(cfg: &StoreConfig) -> String {
    if cfg.database.is_empty() {
        cfg.table.clone()
    } else {
        format!("{}.{}", cfg.database, cfg.table)
    }
}

// --- SQL formatting helpers ---

fn insert_sql(table: &str, event: &Event) -> String {
    let mut sql = String::with_capacity(128 + table.len() + event.path().len());
    let _ = write!(
        sql,
        "INSERT INTO {table} (site_id, event_type, path, user_id, timestamp) \
         VALUES ('{}', '{}', '{}', '{}', {})",
        escape_sql(event.site_id()),
        escape_sql(event.event_type()),
        escape_sql(event.path()),
        escape_sql(event.user_id()),
        format_datetime(event.timestamp()),
    );
    sql
}

fn window_filter(site_id: &str, window: DayWindow) -> String {
    format!(
        "site_id = '{}' AND timestamp >= {} AND timestamp < {}",
        escape_sql(site_id),
        format_datetime(window.start),
        format_datetime(window.end),
    )
}

fn site_stats_sql(table: &str, site_id: &str, window: DayWindow) -> String {
    format!(
        "SELECT count() AS total_views, uniqExactIf(user_id, user_id != '') AS unique_users \
         FROM {table} WHERE {}",
        window_filter(site_id, window),
    )
}

fn top_paths_sql(table: &str, site_id: &str, window: DayWindow) -> String {
    format!(
        "SELECT path, count() AS views FROM {table} WHERE {} \
         GROUP BY path ORDER BY views DESC, path ASC LIMIT {TOP_PATHS_LIMIT}",
        window_filter(site_id, window),
    )
}

/// Formats a timestamp as a ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
