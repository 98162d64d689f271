//! Keeps the ownership index fresh while the watches feeding it are healthy
//! but have nothing to deliver.
//!
//! Followers serve admission from the watch-fed index and fail closed once it
//! is stale. A quiet cluster produces no watch events, so freshness is also
//! refreshed from a heartbeat that confirms every watch task is still running
//! and its API server still answers.

use crate::{
    index::SharedIndex,
    k8s::{Api, ListParams, Resource},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use tokio::{
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tracing::{debug, info, warn};

/// A watch feeding the ownership index.
#[async_trait]
pub(crate) trait Watch: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn is_live(&self) -> bool;
}

/// A watch task streaming every `T` in the cluster.
pub(crate) struct ApiWatch<T> {
    name: String,
    task: JoinHandle<()>,
    api: Api<T>,
}

// === impl ApiWatch ===

impl<T> ApiWatch<T>
where
    T: Resource<DynamicType = ()>,
{
    pub(crate) fn new(task: JoinHandle<()>, api: Api<T>) -> Self {
        Self {
            name: T::plural(&()).to_string(),
            task,
            api,
        }
    }
}

#[async_trait]
impl<T> Watch for ApiWatch<T>
where
    T: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_live(&self) -> bool {
        if self.task.is_finished() {
            return false;
        }
        match self.api.list_metadata(&ListParams::default().limit(1)).await {
            Ok(_) => true,
            Err(error) => {
                debug!(watch = %self.name, %error, "API server did not answer");
                false
            }
        }
    }
}

/// Refreshes the index every `interval` for as long as every watch is live.
pub(crate) fn spawn(
    index: SharedIndex,
    watches: Vec<Box<dyn Watch>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut was_live = true;
        loop {
            ticks.tick().await;
            let live = all_live(&watches).await;
            if live {
                index.write().mark_live(Instant::now());
            }
            if live != was_live {
                if live {
                    info!("Ownership index watches recovered");
                } else {
                    warn!("Ownership index watches are unhealthy; followers will fail closed once the index is stale");
                }
                was_live = live;
            }
        }
    })
}

async fn all_live(watches: &[Box<dyn Watch>]) -> bool {
    for watch in watches {
        if !watch.is_live().await {
            debug!(watch = %watch.name(), "Watch is not live");
            return false;
        }
    }
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::index::{IndexMetrics, OwnershipIndex, Unavailable};
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    /// A watch whose health is set by the test.
    #[derive(Clone, Default)]
    pub(crate) struct StaticWatch(pub(crate) Arc<AtomicBool>);

    #[async_trait]
    impl Watch for StaticWatch {
        fn name(&self) -> &str {
            "static"
        }

        async fn is_live(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn live_watches_keep_a_quiet_index_fresh() {
        let max = Duration::from_secs(300);
        let index = OwnershipIndex::shared(IndexMetrics::default());
        index.write().mark_synced(Instant::now());
        let watch = StaticWatch(Arc::new(AtomicBool::new(true)));
        let task = spawn(
            index.clone(),
            vec![Box::new(watch.clone())],
            Duration::from_secs(100),
        );

        time::sleep(Duration::from_secs(301)).await;
        assert_eq!(index.read().ensure_fresh(Instant::now(), max), Ok(()));

        watch.0.store(false, Ordering::SeqCst);
        time::sleep(Duration::from_secs(301)).await;
        assert!(matches!(
            index.read().ensure_fresh(Instant::now(), max),
            Err(Unavailable::Stale(_))
        ));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_do_not_stand_in_for_the_initial_sync() {
        let index = OwnershipIndex::shared(IndexMetrics::default());
        let task = spawn(
            index.clone(),
            vec![Box::new(StaticWatch(Arc::new(AtomicBool::new(true))))],
            Duration::from_secs(1),
        );

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(index.read().ensure_synced(), Err(Unavailable::NotSynced));
        task.abort();
    }
}
