use ahash::AHashMap as HashMap;
use kube::runtime::reflector::ObjectRef;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{Duration, Instant};

/// Per-object exponential backoff for failed reconciles.
///
/// Failures are counted per object so that a workload stuck on transient
/// errors does not slow the retries of others. Entries that have not failed
/// for twice the maximum delay belong to objects that are gone and are
/// pruned.
#[derive(Debug)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, Failures>>,
}

#[derive(Debug)]
struct Failures {
    count: u32,
    last: Instant,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure and returns the delay before the next attempt:
    /// `initial_delay * 2^(failures - 1)`, capped, with 0.5x-1.5x jitter.
    pub fn next<K>(&self, obj: &ObjectRef<K>) -> Duration
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let now = Instant::now();
        let idle = self.max_delay.saturating_mul(2);
        let failures = {
            let mut map = self.failures.lock();
            map.retain(|_, f| now.saturating_duration_since(f.last) <= idle);
            let f = map.entry(obj.to_string()).or_insert(Failures {
                count: 0,
                last: now,
            });
            f.count = f.count.saturating_add(1);
            f.last = now;
            f.count
        };
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        self.base_delay(failures).mul_f64(jitter).min(self.max_delay)
    }

    /// Clears an object's failure count after a successful reconcile or once
    /// it is being deleted.
    pub fn reset<K>(&self, obj: &ObjectRef<K>)
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.failures.lock().remove(&obj.to_string());
    }

    pub fn failures<K>(&self, obj: &ObjectRef<K>) -> u32
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.failures
            .lock()
            .get(&obj.to_string())
            .map(|f| f.count)
            .unwrap_or(0)
    }

    fn base_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_ingress_controller_k8s_api::App;

    #[test]
    fn delays_grow_per_object_and_reset() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let a = ObjectRef::<App>::new("a").within("ns-demo");
        let b = ObjectRef::<App>::new("b").within("ns-demo");

        for expected in [1, 2, 4, 8, 16, 30, 30] {
            let delay = backoff.next(&a);
            let expected = Duration::from_secs(expected);
            assert!(delay >= expected.mul_f64(0.5), "{delay:?} < {expected:?}/2");
            assert!(delay <= expected.mul_f64(1.5).min(Duration::from_secs(30)));
        }
        assert_eq!(backoff.failures(&a), 7);
        assert_eq!(backoff.failures(&b), 0);

        backoff.reset(&a);
        assert_eq!(backoff.failures(&a), 0);
        assert!(backoff.next(&a) <= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_pruned() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let gone = ObjectRef::<App>::new("gone").within("ns-demo");
        let live = ObjectRef::<App>::new("live").within("ns-demo");

        backoff.next(&gone);
        backoff.next(&gone);
        tokio::time::advance(Duration::from_secs(61)).await;
        backoff.next(&live);
        assert_eq!(backoff.failures(&gone), 0);
        assert_eq!(backoff.failures(&live), 1);
    }
}
