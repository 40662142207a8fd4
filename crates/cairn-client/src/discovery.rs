//! Endpoint discovery.
//!
//! A discoverer answers one question: which node should the next transport
//! be opened to. A single-node setup answers with its fixed endpoint. A
//! cluster setup asks gossip seeds for the member list and ranks the alive
//! members against the configured [`NodePreference`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cairn_config::{ConnectionSettings, DiscoverySettings, EndpointSource};
use cairn_types::{ClusterMember, Endpoint, MemberRole, NodeEndpoints, NodePreference};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument, warn};

use crate::error::{ClientError, ClientResult};
use crate::gossip::GossipClient;

/// Pause between two failed discovery attempts.
pub const DISCOVER_ATTEMPT_DELAY: Duration = Duration::from_millis(500);

/// Resolves the endpoints of the node to connect to.
#[async_trait]
pub trait EndpointDiscoverer: Send + Sync + 'static {
    /// `failed` names the node the previous transport was connected to, if
    /// that transport failed. It loses ties against other candidates.
    async fn discover(&self, failed: Option<&NodeEndpoints>) -> ClientResult<NodeEndpoints>;
}

/// Always returns the same node.
#[derive(Debug, Clone)]
pub struct StaticEndpointDiscoverer {
    endpoints: NodeEndpoints,
}

impl StaticEndpointDiscoverer {
    pub fn new(endpoints: NodeEndpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl EndpointDiscoverer for StaticEndpointDiscoverer {
    async fn discover(&self, _failed: Option<&NodeEndpoints>) -> ClientResult<NodeEndpoints> {
        Ok(self.endpoints.clone())
    }
}

#[derive(Debug, Clone)]
enum Seeds {
    Static(Vec<Endpoint>),
    Dns { name: String, gossip_port: u16 },
}

/// Discovers a node by querying gossip seeds.
pub struct ClusterEndpointDiscoverer {
    gossip: Arc<dyn GossipClient>,
    seeds: Seeds,
    settings: DiscoverySettings,
    attempt_delay: Duration,
    rng: Mutex<StdRng>,
}

impl ClusterEndpointDiscoverer {
    /// Queries a fixed list of seeds.
    pub fn with_seeds(
        gossip: Arc<dyn GossipClient>,
        seeds: Vec<Endpoint>,
        settings: DiscoverySettings,
    ) -> Self {
        Self::build(gossip, Seeds::Static(seeds), settings)
    }

    /// Resolves seeds from `name:gossip_port` on every attempt.
    pub fn with_cluster_dns(
        gossip: Arc<dyn GossipClient>,
        name: impl Into<String>,
        gossip_port: u16,
        settings: DiscoverySettings,
    ) -> Self {
        Self::build(
            gossip,
            Seeds::Dns {
                name: name.into(),
                gossip_port,
            },
            settings,
        )
    }

    fn build(gossip: Arc<dyn GossipClient>, seeds: Seeds, settings: DiscoverySettings) -> Self {
        Self {
            gossip,
            seeds,
            settings,
            attempt_delay: DISCOVER_ATTEMPT_DELAY,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Makes seed order and random selection reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    async fn resolve_seeds(&self) -> Result<Vec<Endpoint>, String> {
        match &self.seeds {
            Seeds::Static(seeds) => Ok(seeds.clone()),
            Seeds::Dns { name, gossip_port } => {
                let addrs = tokio::net::lookup_host((name.as_str(), *gossip_port))
                    .await
                    .map_err(|e| format!("failed to resolve cluster dns '{name}': {e}"))?;
                Ok(addrs
                    .map(|addr| Endpoint::new(addr.ip().to_string(), addr.port()))
                    .collect())
            }
        }
    }

    #[instrument(skip_all, fields(attempt = attempt, seed = %seed))]
    async fn query_seed(
        &self,
        attempt: u32,
        seed: &Endpoint,
        failed: Option<&NodeEndpoints>,
    ) -> Result<NodeEndpoints, String> {
        let timeout = self.settings.gossip_timeout;
        let members = tokio::time::timeout(timeout, self.gossip.fetch_members(seed, timeout))
            .await
            .map_err(|_| format!("gossip request to {seed} timed out"))?
            .map_err(|e| e.to_string())?;

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let chosen = select_member(&members, self.settings.node_preference, failed, &mut *rng)
            .ok_or_else(|| format!("{seed} reported no usable alive member"))?;
        debug!(attempt, endpoints = %chosen.endpoints, role = %chosen.role, "discovered node");
        Ok(chosen.endpoints.clone())
    }
}

#[async_trait]
impl EndpointDiscoverer for ClusterEndpointDiscoverer {
    async fn discover(&self, failed: Option<&NodeEndpoints>) -> ClientResult<NodeEndpoints> {
        let offset: usize = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .r#gen();
        let mut attempts = 0u32;
        let mut last_error = String::from("no discovery attempt was made");

        while !self.settings.max_discover_attempts.is_exhausted(attempts) {
            attempts += 1;

            let outcome = match self.resolve_seeds().await {
                Ok(seeds) if !seeds.is_empty() => {
                    // Random start, then the next seed on every attempt.
                    let index = offset.wrapping_add(attempts as usize - 1) % seeds.len();
                    self.query_seed(attempts, &seeds[index], failed).await
                }
                Ok(_) => Err("no gossip seeds available".to_string()),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(endpoints) => return Ok(endpoints),
                Err(reason) => {
                    warn!(attempt = attempts, %reason, "discovery attempt failed");
                    last_error = reason;
                }
            }

            if !self.settings.max_discover_attempts.is_exhausted(attempts) {
                tokio::time::sleep(self.attempt_delay).await;
            }
        }

        Err(ClientError::DiscoveryFailed {
            attempts,
            reason: last_error,
        })
    }
}

/// Builds the discoverer for the configured endpoint source. Cluster sources
/// need a gossip client.
pub fn discoverer_for(
    settings: &ConnectionSettings,
    gossip: Option<Arc<dyn GossipClient>>,
) -> ClientResult<Arc<dyn EndpointDiscoverer>> {
    let discovery = settings.discovery().clone();
    match (settings.endpoint_source(), gossip) {
        (EndpointSource::Single(endpoint), _) => {
            let endpoints = if settings.use_tls() {
                NodeEndpoints::secure(endpoint.clone())
            } else {
                NodeEndpoints::plain(endpoint.clone())
            };
            Ok(Arc::new(StaticEndpointDiscoverer::new(endpoints)))
        }
        (EndpointSource::GossipSeeds(seeds), Some(gossip)) => Ok(Arc::new(
            ClusterEndpointDiscoverer::with_seeds(gossip, seeds.clone(), discovery),
        )),
        (EndpointSource::ClusterDns { name, gossip_port }, Some(gossip)) => Ok(Arc::new(
            ClusterEndpointDiscoverer::with_cluster_dns(gossip, name.clone(), *gossip_port, discovery),
        )),
        (_, None) => Err(ClientError::InvalidArgument(
            "cluster discovery requires a gossip client".to_string(),
        )),
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// Lower sorts first.
fn rank_key(
    member: &ClusterMember,
    preference: NodePreference,
    failed: Option<&NodeEndpoints>,
) -> (u8, bool) {
    let tier = if preference.matches(member.role) { 0 } else { 1 };
    (tier, failed == Some(&member.endpoints))
}

/// Orders the usable members, best first.
///
/// Dead members and members in an unknown role are dropped. Members whose
/// role matches `preference` come first, then every other alive member.
/// Within a tier the member that just failed goes last; otherwise the
/// gossip order is kept.
pub fn rank_members<'a>(
    members: &'a [ClusterMember],
    preference: NodePreference,
    failed: Option<&NodeEndpoints>,
) -> Vec<&'a ClusterMember> {
    let mut usable: Vec<&ClusterMember> = members
        .iter()
        .filter(|m| m.alive && m.role != MemberRole::Unknown)
        .collect();
    usable.sort_by_key(|m| rank_key(m, preference, failed));
    usable
}

/// Picks the member to connect to. [`NodePreference::Random`] picks
/// uniformly among the best-ranked members.
pub fn select_member<'a, R: Rng + ?Sized>(
    members: &'a [ClusterMember],
    preference: NodePreference,
    failed: Option<&NodeEndpoints>,
    rng: &mut R,
) -> Option<&'a ClusterMember> {
    let ranked = rank_members(members, preference, failed);
    let best = *ranked.first()?;
    if preference != NodePreference::Random {
        return Some(best);
    }

    let best_key = rank_key(best, preference, failed);
    let ties: Vec<&ClusterMember> = ranked
        .into_iter()
        .take_while(|m| rank_key(m, preference, failed) == best_key)
        .collect();
    ties.choose(rng).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use cairn_config::Limit;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn member(host: &str, role: MemberRole) -> ClusterMember {
        ClusterMember::new(NodeEndpoints::plain(Endpoint::new(host, 1113)), role)
    }

    fn hosts(ranked: &[&ClusterMember]) -> Vec<String> {
        ranked
            .iter()
            .map(|m| m.endpoints.connect_target(false).host.clone())
            .collect()
    }

    #[test]
    fn test_preferred_role_ranks_first() {
        let members = vec![
            member("f1", MemberRole::Follower),
            member("l", MemberRole::Leader),
            member("f2", MemberRole::Follower),
        ];
        assert_eq!(
            hosts(&rank_members(&members, NodePreference::Leader, None)),
            ["l", "f1", "f2"]
        );
        assert_eq!(
            hosts(&rank_members(&members, NodePreference::Follower, None)),
            ["f1", "f2", "l"]
        );
    }

    #[test]
    fn test_dead_and_unknown_members_dropped() {
        let members = vec![
            member("l", MemberRole::Leader).dead(),
            member("x", MemberRole::Unknown),
            member("r", MemberRole::ReadOnlyReplica),
        ];
        assert_eq!(
            hosts(&rank_members(&members, NodePreference::Leader, None)),
            ["r"]
        );
    }

    #[test]
    fn test_failed_endpoint_loses_ties() {
        let members = vec![
            member("f1", MemberRole::Follower),
            member("f2", MemberRole::Follower),
        ];
        let failed = members[0].endpoints.clone();
        assert_eq!(
            hosts(&rank_members(&members, NodePreference::Follower, Some(&failed))),
            ["f2", "f1"]
        );
    }

    #[test]
    fn test_failed_endpoint_still_wins_its_tier() {
        let members = vec![
            member("f", MemberRole::Follower),
            member("l", MemberRole::Leader),
        ];
        let failed = members[1].endpoints.clone();
        let mut rng = StdRng::seed_from_u64(1);
        let chosen =
            select_member(&members, NodePreference::Leader, Some(&failed), &mut rng).unwrap();
        assert_eq!(chosen.role, MemberRole::Leader);
    }

    #[test]
    fn test_random_preference_stays_in_best_tier() {
        let members = vec![
            member("a", MemberRole::Leader),
            member("b", MemberRole::Follower),
            member("c", MemberRole::ReadOnlyReplica),
            member("d", MemberRole::Unknown),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let chosen = select_member(&members, NodePreference::Random, None, &mut rng).unwrap();
            assert_ne!(chosen.role, MemberRole::Unknown);
        }
    }

    fn role_strategy() -> impl Strategy<Value = MemberRole> {
        prop_oneof![
            Just(MemberRole::Leader),
            Just(MemberRole::Follower),
            Just(MemberRole::ReadOnlyReplica),
            Just(MemberRole::Unknown),
        ]
    }

    fn preference_strategy() -> impl Strategy<Value = NodePreference> {
        prop_oneof![
            Just(NodePreference::Leader),
            Just(NodePreference::Follower),
            Just(NodePreference::ReadOnlyReplica),
        ]
    }

    proptest! {
        #[test]
        fn prop_matching_member_always_chosen_when_present(
            roles in proptest::collection::vec((role_strategy(), any::<bool>()), 0..12),
            preference in preference_strategy(),
            seed in any::<u64>(),
        ) {
            let members: Vec<ClusterMember> = roles
                .iter()
                .enumerate()
                .map(|(i, (role, alive))| {
                    let m = member(&format!("n{i}"), *role);
                    if *alive { m } else { m.dead() }
                })
                .collect();
            let mut rng = StdRng::seed_from_u64(seed);
            let chosen = select_member(&members, preference, None, &mut rng);

            let any_match = members.iter().any(|m| m.alive && preference.matches(m.role));
            let any_usable = members.iter().any(|m| m.alive && m.role != MemberRole::Unknown);

            match chosen {
                Some(m) => {
                    prop_assert!(m.alive);
                    prop_assert_ne!(m.role, MemberRole::Unknown);
                    prop_assert_eq!(preference.matches(m.role), any_match);
                }
                None => prop_assert!(!any_usable),
            }
        }

        #[test]
        fn prop_ranking_is_deterministic(
            roles in proptest::collection::vec(role_strategy(), 0..12),
            preference in preference_strategy(),
        ) {
            let members: Vec<ClusterMember> = roles
                .iter()
                .enumerate()
                .map(|(i, role)| member(&format!("n{i}"), *role))
                .collect();
            let first = hosts(&rank_members(&members, preference, None));
            let second = hosts(&rank_members(&members, preference, None));
            prop_assert_eq!(first, second);
        }
    }

    struct ScriptedGossip {
        calls: AtomicUsize,
        fail_first: usize,
        members: Vec<ClusterMember>,
    }

    #[async_trait]
    impl GossipClient for ScriptedGossip {
        async fn fetch_members(
            &self,
            seed: &Endpoint,
            _timeout: Duration,
        ) -> Result<Vec<ClusterMember>, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(TransportError::Refused {
                    endpoint: seed.clone(),
                });
            }
            Ok(self.members.clone())
        }
    }

    fn settings(max_attempts: Limit) -> DiscoverySettings {
        DiscoverySettings {
            max_discover_attempts: max_attempts,
            gossip_timeout: Duration::from_secs(1),
            node_preference: NodePreference::Leader,
        }
    }

    fn seeds() -> Vec<Endpoint> {
        vec![Endpoint::new("s1", 2113), Endpoint::new("s2", 2113)]
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_a_seed_answers() {
        let gossip = Arc::new(ScriptedGossip {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            members: vec![
                member("f", MemberRole::Follower),
                member("l", MemberRole::Leader),
            ],
        });
        let discoverer =
            ClusterEndpointDiscoverer::with_seeds(gossip.clone(), seeds(), settings(Limit::Bounded(5)))
                .with_rng_seed(3);

        let endpoints = discoverer.discover(None).await.unwrap();
        assert_eq!(endpoints.connect_target(false).host, "l");
        assert_eq!(gossip.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let gossip = Arc::new(ScriptedGossip {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            members: Vec::new(),
        });
        let discoverer =
            ClusterEndpointDiscoverer::with_seeds(gossip.clone(), seeds(), settings(Limit::Bounded(3)));

        match discoverer.discover(None).await {
            Err(ClientError::DiscoveryFailed { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("refused"));
            }
            other => panic!("expected discovery failure, got {other:?}"),
        }
        assert_eq!(gossip.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_static_discoverer() {
        let endpoints = NodeEndpoints::plain(Endpoint::new("localhost", 1113));
        let discoverer = StaticEndpointDiscoverer::new(endpoints.clone());
        assert_eq!(discoverer.discover(Some(&endpoints)).await.unwrap(), endpoints);
    }
}
