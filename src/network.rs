//! Network registry: server discovery and per-target backoff
//!
//! A RobustIRC network is addressed by a single name (e.g.
//! `robustirc.net`) behind which a set of cooperating backend servers
//! hides. This module maintains one entry per network address holding
//!
//! - the ordered list of `host:port` targets discovered via DNS SRV, and
//! - per-target exponential backoff state.
//!
//! The registry is process-wide: multiple sessions to the same address
//! share it, so a server that fails for one session is avoided by all of
//! them.
//!
//! # Target selection
//!
//! [`NetworkRegistry::pick`] implements a queue-rotation scheme: the
//! head of the queue is tried first and requeued at the head when
//! usable, so consecutive picks stick to a recently-successful server.
//! A target under backoff rotates to the tail and the first usable
//! target further down is pulled to the head. When every target is
//! waiting out its backoff, `pick` sleeps until the soonest one becomes
//! eligible again. Sorting by `next_attempt` instead would lose the
//! preference for a server that just succeeded.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use rand::Rng as _;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Result, RobustSessionError};

/// Exponential backoff is capped at 2^6 = 64 seconds. In that region, we
/// run into danger of the host client disconnecting due to ping timeout.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Per-target backoff state.
#[derive(Debug, Clone)]
struct BackoffState {
    exponent: u32,
    next_attempt: Instant,
}

impl BackoffState {
    fn usable(&self, now: Instant) -> bool {
        self.next_attempt <= now
    }
}

/// State for one resolved network address.
#[derive(Debug, Default)]
struct NetworkState {
    /// Ordered `host:port` targets; the order is the preferred retry order.
    targets: VecDeque<String>,
    /// Backoff per target; a missing entry means immediately usable.
    backoff: HashMap<String, BackoffState>,
}

impl NetworkState {
    fn usable(&self, target: &str, now: Instant) -> bool {
        self.backoff.get(target).map_or(true, |b| b.usable(now))
    }
}

/// Process-wide registry of RobustIRC networks, keyed by case-folded
/// address.
///
/// # Examples
///
/// ```
/// use robustsession::NetworkRegistry;
///
/// # tokio_test::block_on(async {
/// let registry = NetworkRegistry::new();
/// // A comma-separated address registers literal targets without DNS.
/// registry.resolve("a:60667,b:60667").await?;
/// let target = registry.pick("a:60667,b:60667", true).await?;
/// assert!(target == "a:60667" || target == "b:60667");
/// # anyhow::Ok(())
/// # }).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    networks: Mutex<HashMap<String, NetworkState>>,
}

/// Outcome of one selection attempt under the registry lock.
enum Selection {
    Ready(String),
    /// All targets are backing off; retry after this wait.
    Wait(Duration),
}

impl NetworkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(address: &str) -> String {
        address.to_ascii_lowercase()
    }

    /// Resolve `address` into its target list.
    ///
    /// An address containing a comma is split, trimmed, and registered
    /// verbatim (testing hook). Otherwise a DNS SRV lookup for
    /// `_robustirc._tcp.<address>` is performed and each record becomes a
    /// `"<hostname>:<port>"` target, in the order the resolver returned
    /// them.
    ///
    /// Resolving an already-resolved address is a no-op: the first
    /// resolution wins.
    ///
    /// # Errors
    ///
    /// Returns [`RobustSessionError::Resolve`] if the lookup fails or
    /// yields no targets.
    pub async fn resolve(&self, address: &str) -> Result<()> {
        let key = Self::key(address);
        {
            let networks = self.networks.lock().await;
            if networks.contains_key(&key) {
                return Ok(());
            }
        }

        let targets = if address.contains(',') {
            address
                .split(',')
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(String::from)
                .collect::<VecDeque<String>>()
        } else {
            self.lookup_srv(address).await?
        };

        if targets.is_empty() {
            return Err(anyhow::anyhow!(RobustSessionError::Resolve(format!(
                "no targets found for {address}"
            ))));
        }

        tracing::debug!("resolved {address} to {targets:?}");

        let mut networks = self.networks.lock().await;
        networks.entry(key).or_insert_with(|| NetworkState {
            targets,
            backoff: HashMap::new(),
        });
        Ok(())
    }

    async fn lookup_srv(&self, address: &str) -> Result<VecDeque<String>> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|err| {
            anyhow::anyhow!(RobustSessionError::Resolve(format!(
                "failed to construct resolver: {err}"
            )))
        })?;
        let name = format!("_robustirc._tcp.{address}.");
        let lookup = resolver.srv_lookup(name.as_str()).await.map_err(|err| {
            anyhow::anyhow!(RobustSessionError::Resolve(format!(
                "SRV lookup for {name} failed: {err}"
            )))
        })?;
        Ok(lookup
            .iter()
            .map(|srv| {
                format!(
                    "{}:{}",
                    srv.target().to_utf8().trim_end_matches('.'),
                    srv.port()
                )
            })
            .collect())
    }

    /// Pick a target for `address`, waiting out backoff if necessary.
    ///
    /// With `random == false` the queue-rotation scheme described in the
    /// module docs applies: the head of the queue is preferred, so
    /// consecutive picks stick to the same server. With `random == true`
    /// a uniformly random choice among the currently usable targets is
    /// made and moved to the head of the queue; CreateSession and
    /// GetMessages use this to spread sessions across the server set
    /// (SRV results are deliberately not shuffled at resolve time).
    ///
    /// When every target is waiting out its backoff, this call sleeps
    /// until the soonest one becomes eligible and tries again.
    ///
    /// # Errors
    ///
    /// Returns [`RobustSessionError::NotResolved`] if `address` was never
    /// resolved.
    pub async fn pick(&self, address: &str, random: bool) -> Result<String> {
        let key = Self::key(address);
        loop {
            let selection = {
                let mut networks = self.networks.lock().await;
                let state = networks.get_mut(&key).ok_or_else(|| {
                    anyhow::anyhow!(RobustSessionError::NotResolved(address.to_string()))
                })?;
                Self::select_target(state, random)
            };
            match selection {
                Selection::Ready(target) => return Ok(target),
                Selection::Wait(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    fn select_target(state: &mut NetworkState, random: bool) -> Selection {
        let now = Instant::now();

        if random {
            let usable: Vec<usize> = (0..state.targets.len())
                .filter(|&i| state.usable(&state.targets[i], now))
                .collect();
            if !usable.is_empty() {
                let index = usable[rand::rng().random_range(0..usable.len())];
                if let Some(target) = state.targets.remove(index) {
                    state.targets.push_front(target.clone());
                    return Selection::Ready(target);
                }
            }
        } else if let Some(head) = state.targets.pop_front() {
            if state.usable(&head, now) {
                // Retry this server next.
                state.targets.push_front(head.clone());
                return Selection::Ready(head);
            }
            // Retry this server last.
            state.targets.push_back(head);

            for i in 0..state.targets.len() {
                if state.usable(&state.targets[i], now) {
                    if let Some(target) = state.targets.remove(i) {
                        state.targets.push_front(target.clone());
                        return Selection::Ready(target);
                    }
                }
            }
        }

        // Every target is backing off; wait for the soonest one.
        let soonest = state
            .targets
            .iter()
            .filter_map(|target| state.backoff.get(target))
            .map(|b| b.next_attempt.saturating_duration_since(now))
            .min()
            .unwrap_or(Duration::from_secs(1));
        Selection::Wait(soonest)
    }

    /// Record a failed request against `target`, adjusting its
    /// exponential backoff state.
    ///
    /// The wait grows as `2^exponent + jitter` seconds with `jitter` in
    /// `[0, exponent]`, the exponent saturating at 6.
    pub async fn failed(&self, address: &str, target: &str) {
        let mut networks = self.networks.lock().await;
        let Some(state) = networks.get_mut(&Self::key(address)) else {
            return;
        };
        let backoff = state
            .backoff
            .entry(target.to_string())
            .or_insert_with(|| BackoffState {
                exponent: 0,
                next_attempt: Instant::now(),
            });
        if backoff.exponent < MAX_BACKOFF_EXPONENT {
            backoff.exponent += 1;
        }
        let jitter = u64::from(rand::rng().random_range(0..=backoff.exponent));
        backoff.next_attempt =
            Instant::now() + Duration::from_secs((1u64 << backoff.exponent) + jitter);
        tracing::debug!(
            "backoff for {target}: exponent {}, next attempt in {:?}",
            backoff.exponent,
            backoff.next_attempt.saturating_duration_since(Instant::now())
        );
    }

    /// Record a successful request against `target`, making it
    /// immediately eligible again.
    pub async fn succeeded(&self, address: &str, target: &str) {
        let mut networks = self.networks.lock().await;
        if let Some(state) = networks.get_mut(&Self::key(address)) {
            state.backoff.remove(target);
        }
    }

    /// Replace the target list of `address` with `new_targets`.
    ///
    /// The update is skipped when `new_targets` contains the same entries
    /// (case-insensitively) as the current list, so that the retry order
    /// within the queue is kept. An empty update is discarded: a
    /// registered network always has at least one target.
    pub async fn update_targets(&self, address: &str, new_targets: Vec<String>) {
        if new_targets.is_empty() {
            return;
        }
        let mut networks = self.networks.lock().await;
        let Some(state) = networks.get_mut(&Self::key(address)) else {
            return;
        };

        let equal = new_targets.len() == state.targets.len()
            && new_targets.iter().all(|new| {
                state
                    .targets
                    .iter()
                    .any(|current| current.eq_ignore_ascii_case(new))
            });
        if equal {
            return;
        }

        tracing::debug!("updating targets for {address} to {new_targets:?}");
        state.targets = new_targets.into_iter().collect();
        // TODO: purge backoff entries for targets no longer in the list.
    }

    /// Snapshot of the current target list for `address`, in queue order.
    ///
    /// Returns `None` if the address was never resolved. Intended for
    /// diagnostics and tests.
    pub async fn targets(&self, address: &str) -> Option<Vec<String>> {
        let networks = self.networks.lock().await;
        networks
            .get(&Self::key(address))
            .map(|state| state.targets.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(addr: &str) -> NetworkRegistry {
        let registry = NetworkRegistry::new();
        registry.resolve(addr).await.expect("resolve");
        registry
    }

    #[tokio::test]
    async fn test_resolve_comma_list_registers_targets() {
        let registry = NetworkRegistry::new();
        registry
            .resolve("a:60667, b:60667 ,c:60667")
            .await
            .expect("resolve");
        assert_eq!(
            registry.targets("a:60667, b:60667 ,c:60667").await,
            Some(vec![
                "a:60667".to_string(),
                "b:60667".to_string(),
                "c:60667".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_resolve_trailing_comma_single_target() {
        let registry = NetworkRegistry::new();
        registry.resolve("127.0.0.1:60667,").await.expect("resolve");
        assert_eq!(
            registry.targets("127.0.0.1:60667,").await,
            Some(vec!["127.0.0.1:60667".to_string()])
        );
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let registry = NetworkRegistry::new();
        registry.resolve("a:1,b:2").await.expect("first resolve");
        registry.resolve("a:1,b:2").await.expect("second resolve");
        assert_eq!(
            registry.targets("a:1,b:2").await,
            Some(vec!["a:1".to_string(), "b:2".to_string()])
        );
    }

    #[tokio::test]
    async fn test_resolve_key_is_case_folded() {
        let registry = NetworkRegistry::new();
        registry.resolve("A:1,B:2").await.expect("resolve");
        assert!(registry.targets("a:1,b:2").await.is_some());
    }

    #[tokio::test]
    async fn test_pick_unresolved_fails() {
        let registry = NetworkRegistry::new();
        let result = registry.pick("never.resolved.example", false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_pick_sticks_to_head() {
        let registry = registry_with("a:1,b:2,c:3").await;
        for _ in 0..3 {
            let target = registry.pick("a:1,b:2,c:3", false).await.expect("pick");
            assert_eq!(target, "a:1");
        }
    }

    #[tokio::test]
    async fn test_pick_skips_failed_target() {
        let addr = "a:1,b:2,c:3";
        let registry = registry_with(addr).await;
        registry.failed(addr, "a:1").await;
        let target = registry.pick(addr, false).await.expect("pick");
        assert_eq!(target, "b:2");
        // The failed target rotated to the tail.
        assert_eq!(
            registry.targets(addr).await,
            Some(vec!["b:2".to_string(), "c:3".to_string(), "a:1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_succeeded_makes_target_immediately_eligible() {
        let addr = "a:1,";
        let registry = registry_with(addr).await;
        registry.failed(addr, "a:1").await;
        registry.succeeded(addr, "a:1").await;
        let before = Instant::now();
        let target = registry.pick(addr, false).await.expect("pick");
        assert_eq!(target, "a:1");
        assert!(before.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window_after_one_failure() {
        let addr = "a:1,";
        let registry = registry_with(addr).await;
        registry.failed(addr, "a:1").await;
        let before = Instant::now();
        registry.pick(addr, false).await.expect("pick");
        let waited = before.elapsed();
        // exponent 1: wait in [2, 2 + 1] seconds (plus the sleep quantum).
        assert!(waited >= Duration::from_secs(2), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(4), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window_grows_with_failures() {
        let addr = "a:1,";
        let registry = registry_with(addr).await;
        registry.failed(addr, "a:1").await;
        registry.failed(addr, "a:1").await;
        registry.failed(addr, "a:1").await;
        let before = Instant::now();
        registry.pick(addr, false).await.expect("pick");
        let waited = before.elapsed();
        // exponent 3: wait in [8, 8 + 3] seconds.
        assert!(waited >= Duration::from_secs(8), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(12), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exponent_saturates() {
        let addr = "a:1,";
        let registry = registry_with(addr).await;
        for _ in 0..20 {
            registry.failed(addr, "a:1").await;
        }
        let before = Instant::now();
        registry.pick(addr, false).await.expect("pick");
        let waited = before.elapsed();
        // exponent capped at 6: wait in [64, 64 + 6] seconds.
        assert!(waited >= Duration::from_secs(64), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(72), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_random_pick_avoids_backed_off_target() {
        let addr = "a:1,b:2,c:3";
        let registry = registry_with(addr).await;
        for _ in 0..6 {
            registry.failed(addr, "a:1").await;
        }
        for _ in 0..20 {
            let target = registry.pick(addr, true).await.expect("pick");
            assert_ne!(target, "a:1");
        }
    }

    #[tokio::test]
    async fn test_random_pick_moves_choice_to_head() {
        let addr = "a:1,b:2,c:3";
        let registry = registry_with(addr).await;
        let picked = registry.pick(addr, true).await.expect("pick");
        let sticky = registry.pick(addr, false).await.expect("pick");
        assert_eq!(picked, sticky);
    }

    #[tokio::test]
    async fn test_update_targets_set_equal_keeps_order() {
        let addr = "a:1,b:2,c:3";
        let registry = registry_with(addr).await;
        registry.failed(addr, "a:1").await;
        registry.pick(addr, false).await.expect("pick");
        let order_before = registry.targets(addr).await;
        // Same servers, rotated and case-varied: order must be kept.
        registry
            .update_targets(
                addr,
                vec!["C:3".to_string(), "A:1".to_string(), "B:2".to_string()],
            )
            .await;
        assert_eq!(registry.targets(addr).await, order_before);
    }

    #[tokio::test]
    async fn test_update_targets_replaces_on_difference() {
        let addr = "a:1,b:2";
        let registry = registry_with(addr).await;
        registry
            .update_targets(addr, vec!["c:3".to_string(), "a:1".to_string()])
            .await;
        assert_eq!(
            registry.targets(addr).await,
            Some(vec!["c:3".to_string(), "a:1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_update_targets_empty_is_discarded() {
        let addr = "a:1,b:2";
        let registry = registry_with(addr).await;
        registry.update_targets(addr, Vec::new()).await;
        assert_eq!(
            registry.targets(addr).await,
            Some(vec!["a:1".to_string(), "b:2".to_string()])
        );
    }
}
