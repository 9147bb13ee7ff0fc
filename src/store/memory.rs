use std::collections::HashMap;

use anyhow::Result;
use parking_lot::RwLock;

use crate::event::Event;

use super::{DayWindow, EventStore, PathViews, SiteStats, TOP_PATHS_LIMIT};

/// In-memory event table with the same query semantics as ClickHouse.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Copy of every stored row in insertion order.
    pub fn rows(&self) -> Vec<Event> {
        self.rows.read().clone()
    }
}

impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<()> {
        self.rows.write().push(event.clone());
        Ok(())
    }

    async fn site_stats(&self, site_id: &str, window: DayWindow) -> Result<SiteStats> {
        let rows = self.rows.read();
        let mut users = std::collections::HashSet::new();
        let mut total_views = 0u64;

        for e in rows
            .iter()
            .filter(|e| e.site_id() == site_id && window.contains(e.timestamp()))
        {
            total_views += 1;
            if !e.user_id().is_empty() {
                users.insert(e.user_id());
            }
        }

        Ok(SiteStats {
            total_views,
            unique_users: users.len() as u64,
        })
    }

    async fn top_paths(&self, site_id: &str, window: DayWindow) -> Result<Vec<PathViews>> {
        let rows = self.rows.read();
        let mut counts: HashMap<&str, u64> = HashMap::new();

        for e in rows
            .iter()
            .filter(|e| e.site_id() == site_id && window.contains(e.timestamp()))
        {
            *counts.entry(e.path()).or_default() += 1;
        }

        let mut top: Vec<PathViews> = counts
            .into_iter()
            .map(|(path, views)| PathViews {
                path: path.to_string(),
                views,
            })
            .collect();

        top.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.path.cmp(&b.path)));
        top.truncate(TOP_PATHS_LIMIT);

        Ok(top)
    }
}
