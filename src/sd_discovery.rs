//! Discovery Backend - master-peer (swarm) variant
//!
//! One node, the one holding the reserved master identifier, aggregates the
//! free/used snapshot of every peer. Peers track their own capacity and push a
//! fresh snapshot to the master after every change and on every refresh.
//!
//! The master view is advisory: between a peer's local change and the arrival
//! of its push the master may offer capacity that is already gone. Callers
//! treat a failed obtain as a failed placement attempt.
//!
//! Nodes never hold references to each other. Every operation that talks to
//! another node takes a `RemoteClient`, which the engine implements on top of
//! the overlay and its node array.

use indexmap::IndexMap;
use log::{debug, warn};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::sd_error::{Result, SimError};
use crate::sd_interface::{Guid, NodeAddress, NodeIndex};
use crate::sd_resources::{ClassPolicy, Resources};

// ============================================================================
// Messages and Views
// ============================================================================

/// Snapshot a peer pushes to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Offer {
    pub address: NodeAddress,
    pub free: Resources,
    pub used: Resources,
    pub running: u32,
}

/// Master-side record of one peer. Overwritten wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterNodeView {
    pub address: NodeAddress,
    pub free: Resources,
    pub used: Resources,
    pub running: u32,
}

impl From<&Offer> for ClusterNodeView {
    fn from(offer: &Offer) -> Self {
        Self {
            address: offer.address.clone(),
            free: offer.free,
            used: offer.used,
            running: offer.running,
        }
    }
}

/// Transport seam between nodes
pub trait RemoteClient: Sync {
    /// Address of the master as resolved from `from` through the overlay
    fn locate_master(&self, from: &str) -> Option<NodeAddress>;

    fn create_offer(&self, master: &str, offer: &Offer);

    fn update_offer(&self, master: &str, offer: &Offer);

    fn find_offers(&self, master: &str, target: &Resources) -> Vec<ClusterNodeView>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Master,
    Peer,
}

impl Role {
    pub fn for_guid(guid: Guid, master_guid: Guid) -> Self {
        if guid == master_guid {
            Role::Master
        } else {
            Role::Peer
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalResources {
    maximum: Resources,
    available: Resources,
    running: u32,
}

/// Point-in-time copy of a node's discovery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscoverySnapshot {
    pub maximum: Resources,
    pub free: Resources,
    pub used: Resources,
    pub running: u32,
}

// ============================================================================
// Per-node Backend
// ============================================================================

pub struct SwarmDiscovery {
    guid: Guid,
    address: NodeAddress,
    role: Role,
    policy: ClassPolicy,

    /// Resolved on first use and never changes (no re-election)
    master_address: OnceLock<NodeAddress>,

    local: Mutex<LocalResources>,

    /// Only present on the master
    views: Option<Mutex<IndexMap<NodeAddress, ClusterNodeView>>>,
}

impl SwarmDiscovery {
    pub fn new(
        guid: Guid,
        address: NodeAddress,
        maximum: Resources,
        master_guid: Guid,
        policy: ClassPolicy,
    ) -> Self {
        let role = Role::for_guid(guid, master_guid);
        Self {
            guid,
            address,
            role,
            policy,
            master_address: OnceLock::new(),
            local: Mutex::new(LocalResources {
                maximum,
                available: maximum,
                running: 0,
            }),
            views: match role {
                Role::Master => Some(Mutex::new(IndexMap::new())),
                Role::Peer => None,
            },
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    fn local(&self) -> MutexGuard<'_, LocalResources> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offer_from(&self, local: &LocalResources) -> Offer {
        Offer {
            address: self.address.clone(),
            free: local.available,
            used: local.maximum.saturating_minus(&local.available),
            running: local.running,
        }
    }

    /// Master address, routed through the overlay on first use and cached
    pub fn master_address(&self, client: &dyn RemoteClient) -> Option<NodeAddress> {
        if let Some(address) = self.master_address.get() {
            return Some(address.clone());
        }
        let address = client.locate_master(&self.address)?;
        Some(self.master_address.get_or_init(|| address).clone())
    }

    fn push_update(&self, client: &dyn RemoteClient, offer: &Offer) {
        match self.master_address(client) {
            Some(master) => client.update_offer(&master, offer),
            None => warn!("{}: master unreachable, update not pushed", self.address),
        }
    }

    // ========================================================================
    // Peer Role
    // ========================================================================

    /// First contact with the master
    pub fn start(&self, client: &dyn RemoteClient) {
        if self.is_master() {
            return;
        }
        let offer = self.offer_from(&self.local());
        match self.master_address(client) {
            Some(master) => client.create_offer(&master, &offer),
            None => warn!("{}: master unreachable, offer not created", self.address),
        }
    }

    /// Reserve `amount` locally and push the new state to the master.
    /// Returns false, with no state change, when capacity is insufficient.
    pub fn obtain_resources(&self, client: &dyn RemoteClient, amount: &Resources) -> bool {
        if self.is_master() || !amount.is_valid() {
            return false;
        }

        let offer = {
            let mut local = self.local();
            if !local.available.contains(amount, self.policy) {
                return false;
            }
            local.available.sub(amount);
            local.running += 1;
            self.offer_from(&local)
        };

        debug!("{}: obtained {}, free now {}", self.address, amount, offer.free);
        self.push_update(client, &offer);
        true
    }

    /// Give `amount` back. Callers must only return what they obtained.
    pub fn return_resources(&self, client: &dyn RemoteClient, amount: &Resources) {
        if self.is_master() {
            return;
        }

        let offer = {
            let mut local = self.local();
            local.available.add(amount);
            local.running = local.running.saturating_sub(1);
            self.offer_from(&local)
        };

        debug!("{}: returned {}, free now {}", self.address, amount, offer.free);
        self.push_update(client, &offer);
    }

    /// Periodic re-announcement, sent whether or not anything changed
    pub fn refresh_offer(&self, client: &dyn RemoteClient) {
        if self.is_master() {
            return;
        }
        let offer = self.offer_from(&self.local());
        self.push_update(client, &offer);
    }

    /// Periodic re-registration. The master ignores it once the peer is known.
    pub fn spread_offer(&self, client: &dyn RemoteClient) {
        self.start(client);
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        let local = self.local();
        DiscoverySnapshot {
            maximum: local.maximum,
            free: local.available,
            used: local.maximum.saturating_minus(&local.available),
            running: local.running,
        }
    }

    pub fn available(&self) -> Resources {
        self.local().available
    }

    pub fn maximum(&self) -> Resources {
        self.local().maximum
    }

    pub fn running(&self) -> u32 {
        self.local().running
    }

    /// `free <= max` in every dimension, which makes `free + used == max` hold
    pub fn check_invariant(&self, node: NodeIndex) -> Result<()> {
        let local = self.local();
        if !local.maximum.covers(&local.available) {
            return Err(SimError::InvariantViolation {
                node,
                detail: format!("free {} exceeds maximum {}", local.available, local.maximum),
            });
        }
        if local.running == 0 && local.available != local.maximum {
            return Err(SimError::InvariantViolation {
                node,
                detail: format!(
                    "no running workload but free {} differs from maximum {}",
                    local.available, local.maximum
                ),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Master Role
    // ========================================================================

    fn views(&self) -> Option<MutexGuard<'_, IndexMap<NodeAddress, ClusterNodeView>>> {
        self.views
            .as_ref()
            .map(|views| views.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Register a peer on first contact. Repeated contacts are ignored.
    pub fn create_offer(&self, offer: &Offer) {
        let Some(mut views) = self.views() else {
            warn!("{}: create_offer sent to a non-master node", self.address);
            return;
        };
        if !views.contains_key(&offer.address) {
            views.insert(offer.address.clone(), ClusterNodeView::from(offer));
        }
    }

    /// Overwrite a known peer's view. Unknown senders are dropped.
    pub fn update_offer(&self, offer: &Offer) {
        let Some(mut views) = self.views() else {
            warn!("{}: update_offer sent to a non-master node", self.address);
            return;
        };
        match views.get_mut(&offer.address) {
            Some(view) => *view = ClusterNodeView::from(offer),
            None => debug!(
                "{}: dropping update from unknown sender {}",
                self.address, offer.address
            ),
        }
    }

    /// Every known peer whose last announced free capacity contains `target`,
    /// in registration order. Empty for invalid targets and on non-masters.
    pub fn find_offers(&self, target: &Resources) -> Vec<ClusterNodeView> {
        if !target.is_valid() {
            return Vec::new();
        }
        let Some(views) = self.views() else {
            return Vec::new();
        };
        views
            .values()
            .filter(|view| view.free.contains(target, self.policy))
            .cloned()
            .collect()
    }

    /// Number of peers registered with this master (0 on peers)
    pub fn known_peers(&self) -> usize {
        self.views().map(|views| views.len()).unwrap_or(0)
    }

    pub fn view_of(&self, address: &str) -> Option<ClusterNodeView> {
        self.views().and_then(|views| views.get(address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd_resources::CpuClass;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delivers every message straight to the master
    struct DirectClient<'a> {
        master: &'a SwarmDiscovery,
        messages: AtomicUsize,
    }

    impl<'a> DirectClient<'a> {
        fn new(master: &'a SwarmDiscovery) -> Self {
            Self {
                master,
                messages: AtomicUsize::new(0),
            }
        }
    }

    impl RemoteClient for DirectClient<'_> {
        fn locate_master(&self, _from: &str) -> Option<NodeAddress> {
            Some(self.master.address().to_string())
        }

        fn create_offer(&self, _master: &str, offer: &Offer) {
            self.messages.fetch_add(1, Ordering::Relaxed);
            self.master.create_offer(offer);
        }

        fn update_offer(&self, _master: &str, offer: &Offer) {
            self.messages.fetch_add(1, Ordering::Relaxed);
            self.master.update_offer(offer);
        }

        fn find_offers(&self, _master: &str, target: &Resources) -> Vec<ClusterNodeView> {
            self.messages.fetch_add(1, Ordering::Relaxed);
            self.master.find_offers(target)
        }
    }

    fn low(cpus: u32, ram: u32) -> Resources {
        Resources::new(CpuClass::Low, cpus, ram)
    }

    fn master() -> SwarmDiscovery {
        SwarmDiscovery::new(0, "10.0.0.0".into(), low(8, 8192), 0, ClassPolicy::Exact)
    }

    fn peer(guid: Guid, max: Resources) -> SwarmDiscovery {
        SwarmDiscovery::new(guid, format!("10.0.0.{}", guid), max, 0, ClassPolicy::Exact)
    }

    #[test]
    fn test_role_assignment() {
        assert_eq!(master().role(), Role::Master);
        assert_eq!(peer(3, low(1, 1)).role(), Role::Peer);
        assert_eq!(Role::for_guid(9, 9), Role::Master);
    }

    #[test]
    fn test_scenario_master_and_two_peers() {
        let master = master();
        let client = DirectClient::new(&master);
        let peer1 = peer(1, low(4, 2048));
        let peer2 = peer(2, low(1, 512));
        peer1.start(&client);
        peer2.start(&client);

        let request = low(2, 1024);
        let offers = master.find_offers(&request);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].address, peer1.address());

        assert!(peer1.obtain_resources(&client, &request));
        assert_eq!(peer1.available(), low(2, 1024));

        let view = master.view_of(peer1.address()).unwrap();
        assert_eq!(view.free, low(2, 1024));
        assert_eq!(view.used, low(2, 1024));
        assert_eq!(view.running, 1);
    }

    #[test]
    fn test_obtain_return_round_trip() {
        let master = master();
        let client = DirectClient::new(&master);
        let p = peer(1, low(4, 2048));
        p.start(&client);

        let before = p.available();
        assert!(p.obtain_resources(&client, &low(3, 100)));
        p.return_resources(&client, &low(3, 100));

        assert_eq!(p.available(), before);
        assert_eq!(p.running(), 0);
        assert_eq!(master.view_of(p.address()).unwrap().free, before);
        assert!(p.check_invariant(1).is_ok());
    }

    #[test]
    fn test_obtain_insufficient_leaves_state_untouched() {
        let master = master();
        let client = DirectClient::new(&master);
        let p = peer(1, low(2, 1024));
        p.start(&client);
        let sent = client.messages.load(Ordering::Relaxed);

        assert!(!p.obtain_resources(&client, &low(4, 512)));
        assert!(!p.obtain_resources(&client, &Resources::new(CpuClass::High, 1, 1)));
        assert!(!p.obtain_resources(&client, &low(0, 0)));

        assert_eq!(p.available(), low(2, 1024));
        assert_eq!(p.running(), 0);
        assert_eq!(client.messages.load(Ordering::Relaxed), sent, "no push on failure");
    }

    #[test]
    fn test_master_hosts_no_workload() {
        let master = master();
        let client = DirectClient::new(&master);
        assert!(!master.obtain_resources(&client, &low(1, 1)));
        master.start(&client);
        assert_eq!(master.known_peers(), 0);
    }

    #[test]
    fn test_find_offers_rejects_invalid_target() {
        let master = master();
        let client = DirectClient::new(&master);
        peer(1, low(4, 2048)).start(&client);

        assert!(master.find_offers(&low(0, 1024)).is_empty());
        assert!(master.find_offers(&low(2, 0)).is_empty());
        assert_eq!(master.find_offers(&low(1, 1)).len(), 1);
    }

    #[test]
    fn test_unknown_sender_update_dropped() {
        let master = master();
        let stranger = Offer {
            address: "10.9.9.9".into(),
            free: low(4, 4),
            used: low(0, 0),
            running: 0,
        };
        master.update_offer(&stranger);
        assert_eq!(master.known_peers(), 0);
        assert!(master.view_of("10.9.9.9").is_none());
    }

    #[test]
    fn test_create_offer_is_first_contact_only() {
        let master = master();
        let client = DirectClient::new(&master);
        let p = peer(1, low(4, 2048));
        p.start(&client);
        assert!(p.obtain_resources(&client, &low(1, 1)));

        // a repeated registration must not roll the view back
        p.spread_offer(&client);
        assert_eq!(master.known_peers(), 1);
        assert_eq!(master.view_of(p.address()).unwrap().free, low(3, 2047));
    }

    #[test]
    fn test_master_aggregation_matches_filter() {
        let mut rng = StdRng::seed_from_u64(3);
        let master = master();
        let client = DirectClient::new(&master);

        let peers: Vec<SwarmDiscovery> = (1..=20)
            .map(|g| peer(g, low(rng.gen_range(1..=16), rng.gen_range(1..=8) * 512)))
            .collect();
        for p in &peers {
            p.start(&client);
        }

        for _ in 0..50 {
            let request = low(rng.gen_range(1..=16), rng.gen_range(1..=8) * 512);
            let expected: Vec<&str> = peers
                .iter()
                .filter(|p| p.available().contains(&request, ClassPolicy::Exact))
                .map(|p| p.address())
                .collect();
            let found: Vec<String> = master.find_offers(&request).into_iter().map(|v| v.address).collect();
            assert_eq!(found, expected, "request {}", request);
        }
    }

    #[test]
    fn test_class_agnostic_policy() {
        let strict = SwarmDiscovery::new(1, "a".into(), low(4, 4096), 0, ClassPolicy::Exact);
        let loose = SwarmDiscovery::new(2, "b".into(), low(4, 4096), 0, ClassPolicy::Agnostic);
        let master = master();
        let client = DirectClient::new(&master);
        let high = Resources::new(CpuClass::High, 1, 128);

        assert!(!strict.obtain_resources(&client, &high));
        assert!(loose.obtain_resources(&client, &high));
    }

    #[test]
    fn test_invariant_detects_over_return() {
        let master = master();
        let client = DirectClient::new(&master);
        let p = peer(1, low(2, 1024));
        p.return_resources(&client, &low(1, 1));
        assert!(matches!(
            p.check_invariant(1),
            Err(SimError::InvariantViolation { node: 1, .. })
        ));
    }

    #[test]
    fn test_concurrent_obtain_never_oversubscribes() {
        let master = master();
        let client = DirectClient::new(&master);
        let p = peer(1, low(10, 10_000));
        p.start(&client);
        let granted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..5 {
                        if p.obtain_resources(&client, &low(1, 100)) {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::Relaxed), 10);
        assert_eq!(p.available(), low(0, 9000));
        assert_eq!(p.running(), 10);
        assert!(p.check_invariant(1).is_ok());
    }
}
