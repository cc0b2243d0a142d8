//! Process-wide index of the `BeamSqlTable` resources observed by the watch,
//! keyed by `(namespace, name)`. Eventually consistent: readers get the most
//! recently observed snapshot of a table; a missing entry is a lookup miss
//! the reconciler turns into a retry.

use crate::crd::BeamSqlTable;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    ResourceExt,
};
use kube_runtime::watcher;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

type Key = (String, String);

/// Shared snapshot map. Cloning shares the underlying index.
#[derive(Clone, Default)]
pub struct TableIndex {
    inner: Arc<RwLock<HashMap<Key, BeamSqlTable>>>,
}

impl TableIndex {
    /// Immutable snapshot of one table, or `None` when it has not been
    /// observed (yet).
    pub async fn get(&self, namespace: &str, name: &str) -> Option<BeamSqlTable> {
        let key = (namespace.to_string(), name.to_string());
        self.inner.read().await.get(&key).cloned()
    }

    /// Number of tables currently known.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Fold one watch event into the index.
    pub async fn apply(&self, event: watcher::Event<BeamSqlTable>) {
        let mut index = self.inner.write().await;
        match event {
            watcher::Event::Applied(table) => {
                let key = key_of(&table);
                debug!(namespace = %key.0, name = %key.1, "table observed");
                index.insert(key, table);
            }
            watcher::Event::Deleted(table) => {
                let key = key_of(&table);
                debug!(namespace = %key.0, name = %key.1, "table removed");
                index.remove(&key);
            }
            watcher::Event::Restarted(tables) => {
                index.clear();
                for table in tables {
                    index.insert(key_of(&table), table);
                }
                debug!(count = index.len(), "table index resynced");
            }
        }
    }
}

fn key_of(table: &BeamSqlTable) -> Key {
    (table.namespace().unwrap_or_default(), table.name())
}

/// Keep the index in sync with the cluster. Watch errors are transient; the
/// watcher stream recovers by relisting, which shows up as a `Restarted`.
pub async fn run(api: Api<BeamSqlTable>, index: TableIndex) {
    let mut stream = watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => index.apply(event).await,
            Err(error) => warn!(%error, "beamsqltables watch interrupted"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::BeamSqlTableSpec;

    fn table(namespace: &str, name: &str) -> BeamSqlTable {
        let mut table = BeamSqlTable::new(
            name,
            BeamSqlTableSpec {
                connector: "kafka".to_string(),
                format: "json".to_string(),
                fields: Default::default(),
                kafka: Default::default(),
            },
        );
        table.metadata.namespace = Some(namespace.to_string());
        table
    }

    #[tokio::test]
    async fn applied_and_deleted_events_update_the_index() {
        let index = TableIndex::default();
        index
            .apply(watcher::Event::Applied(table("oisp", "metrics")))
            .await;
        assert!(index.get("oisp", "metrics").await.is_some());
        assert!(index.get("other", "metrics").await.is_none());

        index
            .apply(watcher::Event::Deleted(table("oisp", "metrics")))
            .await;
        assert!(index.get("oisp", "metrics").await.is_none());
    }

    #[tokio::test]
    async fn restart_replaces_the_snapshot() {
        let index = TableIndex::default();
        index
            .apply(watcher::Event::Applied(table("oisp", "stale")))
            .await;
        index
            .apply(watcher::Event::Restarted(vec![
                table("oisp", "metrics"),
                table("oisp", "alerts"),
            ]))
            .await;
        assert_eq!(index.len().await, 2);
        assert!(index.get("oisp", "stale").await.is_none());
        assert!(index.get("oisp", "alerts").await.is_some());
    }

    #[tokio::test]
    async fn later_snapshots_win() {
        let index = TableIndex::default();
        let mut first = table("oisp", "metrics");
        first.spec.format = "csv".to_string();
        index.apply(watcher::Event::Applied(first)).await;

        let second = table("oisp", "metrics");
        index.apply(watcher::Event::Applied(second)).await;

        let observed = index.get("oisp", "metrics").await.unwrap();
        assert_eq!(observed.spec.format, "json");
    }
}
