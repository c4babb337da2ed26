use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::model::Chart;

/// Persistence for charts and per-user favorites.
#[async_trait]
pub trait ChartStore: Send + Sync {
    async fn get(&self, id: i64) -> Option<Chart>;

    /// Charts that exist among `ids`, in id order.
    async fn find_by_ids(&self, ids: &[i64]) -> Vec<Chart>;

    async fn find_by_uuid(&self, uuid: Uuid) -> Option<Chart>;

    /// One page of charts in id order plus the total count.
    async fn list(&self, page: usize, page_size: usize) -> (usize, Vec<Chart>);

    /// Insert when `chart.id` is 0, otherwise replace the chart with that id.
    async fn save(&self, chart: Chart) -> Chart;

    /// Returns the number of charts removed.
    async fn delete(&self, ids: &[i64]) -> usize;

    async fn favorited_ids(&self, ids: &[i64], user_id: &str) -> HashSet<i64>;

    async fn set_favorite(&self, id: i64, user_id: &str, favorite: bool);
}

#[derive(Default)]
struct Inner {
    charts: BTreeMap<i64, Chart>,
    next_id: i64,
    favorites: HashSet<(String, i64)>,
}

#[derive(Default)]
pub struct InMemoryChartStore {
    inner: RwLock<Inner>,
}

impl InMemoryChartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChartStore for InMemoryChartStore {
    async fn get(&self, id: i64) -> Option<Chart> {
        self.inner.read().await.charts.get(&id).cloned()
    }

    async fn find_by_ids(&self, ids: &[i64]) -> Vec<Chart> {
        let inner = self.inner.read().await;
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        inner
            .charts
            .values()
            .filter(|c| wanted.contains(&c.id))
            .cloned()
            .collect()
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> Option<Chart> {
        let inner = self.inner.read().await;
        inner.charts.values().find(|c| c.uuid == uuid).cloned()
    }

    async fn list(&self, page: usize, page_size: usize) -> (usize, Vec<Chart>) {
        let inner = self.inner.read().await;
        let page = inner
            .charts
            .values()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect();
        (inner.charts.len(), page)
    }

    async fn save(&self, mut chart: Chart) -> Chart {
        let mut inner = self.inner.write().await;
        if chart.id == 0 {
            inner.next_id += 1;
            chart.id = inner.next_id;
        } else {
            inner.next_id = inner.next_id.max(chart.id);
        }
        inner.charts.insert(chart.id, chart.clone());
        chart
    }

    async fn delete(&self, ids: &[i64]) -> usize {
        let mut inner = self.inner.write().await;
        let removed = ids
            .iter()
            .filter(|id| inner.charts.remove(*id).is_some())
            .count();
        inner.favorites.retain(|(_, id)| !ids.contains(id));
        removed
    }

    async fn favorited_ids(&self, ids: &[i64], user_id: &str) -> HashSet<i64> {
        let inner = self.inner.read().await;
        ids.iter()
            .copied()
            .filter(|id| inner.favorites.contains(&(user_id.to_string(), *id)))
            .collect()
    }

    async fn set_favorite(&self, id: i64, user_id: &str, favorite: bool) {
        let mut inner = self.inner.write().await;
        let key = (user_id.to_string(), id);
        if favorite {
            inner.favorites.insert(key);
        } else {
            inner.favorites.remove(&key);
        }
    }
}
