//! Event store seam and the reporting query contracts.

pub mod clickhouse;
pub mod memory;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::event::Event;

use self::clickhouse::ClickHouseStore;
use self::memory::MemoryStore;

/// Maximum number of rows returned by [`EventStore::top_paths`].
pub const TOP_PATHS_LIMIT: usize = 10;

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    /// Window covering the UTC calendar day `date`, or `None` for the last
    /// representable day.
    pub fn for_date(date: NaiveDate) -> Option<Self> {
        let next = date.succ_opt()?;
        Some(Self {
            start: date.and_time(NaiveTime::MIN).and_utc(),
            end: next.and_time(NaiveTime::MIN).and_utc(),
        })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Aggregate counts for one site and window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SiteStats {
    pub total_views: u64,
    pub unique_users: u64,
}

/// View count for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathViews {
    pub path: String,
    pub views: u64,
}

/// Durable event storage plus the two aggregate reads.
pub trait EventStore: Send + Sync {
    /// Writes one row. A returned error means the row may not be durable.
    fn insert_event(&self, event: &Event) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Total events and distinct non-empty users for `site_id` within `window`.
    fn site_stats(
        &self,
        site_id: &str,
        window: DayWindow,
    ) -> impl std::future::Future<Output = Result<SiteStats>> + Send;

    /// Most viewed paths, views descending then path ascending, capped at
    /// [`TOP_PATHS_LIMIT`].
    fn top_paths(
        &self,
        site_id: &str,
        window: DayWindow,
    ) -> impl std::future::Future<Output = Result<Vec<PathViews>>> + Send;
}

/// Store backend selected from configuration.
pub enum Store {
    ClickHouse(ClickHouseStore),
    Memory(MemoryStore),
}

impl Store {
    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClickHouse(_) => "clickhouse",
            Self::Memory(_) => "memory",
        }
    }
}

impl EventStore for Store {
    async fn insert_event(&self, event: &Event) -> Result<()> {
        match self {
            Self::ClickHouse(s) => s.insert_event(event).await,
            Self::Memory(s) => s.insert_event(event).await,
        }
    }

    async fn site_stats(&self, site_id: &str, window: DayWindow) -> Result<SiteStats> {
        match self {
            Self::ClickHouse(s) => s.site_stats(site_id, window).await,
            Self::Memory(s) => s.site_stats(site_id, window).await,
        }
    }

    async fn top_paths(&self, site_id: &str, window: DayWindow) -> Result<Vec<PathViews>> {
        match self {
            Self::ClickHouse(s) => s.top_paths(site_id, window).await,
            Self::Memory(s) => s.top_paths(site_id, window).await,
        }
    }
}
