//! The Provisioner (C7): orchestrates `plant`, `grow`, `teardown`, and the
//! shared rollback helper over a single `CancellationToken`.
//!
//! Structurally grounded in two teacher patterns at once:
//! `gf_provision::ProvisionOrchestrator` for the shape — a thin struct
//! wrapping the capability adapters, exposing one high-level verb per
//! lifecycle operation — and `claw_commander`'s safety-rule-before-action
//! discipline for the posture: rollback on failure is not optional.

#![forbid(unsafe_code)]

use chrono::Utc;
use morpheus_core::{
    DNSRecord, DnsRecordType, Forest, ForestStatus, MorpheusError, MorpheusResult, Node, NodeRole, NodeStatus,
    DEFAULT_RECORD_TTL,
};
use morpheus_cloudinit::NodeIdentity;
use morpheus_config::MorpheusConfig;
use morpheus_dns::DnsProvider;
use morpheus_hetzner::{CloudProvider, ServerSpec};
use morpheus_reachability::SshProbe;
use morpheus_registry::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const SERVER_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SSH_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const ROLLBACK_BUDGET: Duration = Duration::from_secs(60);

pub struct Provisioner {
    registry: Arc<Registry>,
    cloud: Arc<dyn CloudProvider>,
    dns: Arc<dyn DnsProvider>,
    ssh_probe: Arc<dyn SshProbe>,
    config: MorpheusConfig,
    /// Whether this host can reach the public internet over IPv6, per
    /// `morpheus_reachability::check_host_capability`. Determined once at
    /// process startup by the caller (spec.md §4.1) and handed in here
    /// rather than probed per call, so the address-selection decision in
    /// `create_and_verify` stays a pure function of known state.
    host_ipv6_ok: bool,
}

impl Provisioner {
    pub fn new(
        registry: Arc<Registry>,
        cloud: Arc<dyn CloudProvider>,
        dns: Arc<dyn DnsProvider>,
        ssh_probe: Arc<dyn SshProbe>,
        config: MorpheusConfig,
        host_ipv6_ok: bool,
    ) -> Self {
        Self {
            registry,
            cloud,
            dns,
            ssh_probe,
            config,
            host_ipv6_ok,
        }
    }

    fn preferred_server_types(&self) -> Vec<String> {
        let mut types = vec![self.config.server_type.clone()];
        types.extend(self.config.server_type_fallback.iter().cloned());
        types
    }

    /// `plant`: create a brand new forest with `node_count` nodes.
    pub async fn plant(&self, node_count: u32, cancel: CancellationToken) -> MorpheusResult<Forest> {
        let request_id = Uuid::new_v4();
        let _span = tracing::info_span!("plant", %request_id, node_count).entered();

        if node_count == 0 {
            return Err(MorpheusError::ConfigInvalid("node count must be at least 1".into()));
        }

        let forest_id = morpheus_core::forest_id(Utc::now().timestamp());
        let forest = Forest::new(forest_id.clone(), node_count, self.config.location.clone(), "hetzner".into());
        self.registry.register_forest(forest)?;

        let ssh_handle = match self
            .cloud
            .ensure_ssh_key(&self.config.ssh_key_name, self.config.ssh_key_path.as_deref())
            .await
        {
            Ok(h) => h,
            Err(e) => {
                let _ = self.registry.delete_forest(&forest_id);
                return Err(e);
            }
        };

        let preferred_types = self.preferred_server_types();
        let pairs = match morpheus_selector::build_pairs(
            self.cloud.as_ref(),
            &preferred_types,
            std::slice::from_ref(&self.config.location),
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                let _ = self.registry.delete_forest(&forest_id);
                return Err(e);
            }
        };

        let mut created_node_ids = Vec::new();
        for i in 1..=node_count {
            if cancel.is_cancelled() {
                self.rollback_forest(&forest_id, &created_node_ids).await;
                return Err(MorpheusError::Cancelled);
            }

            match self
                .provision_node(&forest_id, i, &pairs, &ssh_handle.name, &cancel)
                .await
            {
                Ok(node) => created_node_ids.push(node.id),
                Err(e) => {
                    self.rollback_forest(&forest_id, &created_node_ids).await;
                    return Err(e);
                }
            }
        }

        self.registry.update_forest_status(&forest_id, ForestStatus::Active)?;
        Ok(self.registry.get_forest(&forest_id).expect("just updated"))
    }

    /// `grow`: add `extra_nodes` to an existing forest. Never touches
    /// preexisting nodes, including on rollback.
    pub async fn grow(&self, forest_id: &str, extra_nodes: u32, cancel: CancellationToken) -> MorpheusResult<Forest> {
        let request_id = Uuid::new_v4();
        let _span = tracing::info_span!("grow", %request_id, forest_id, extra_nodes).entered();

        if extra_nodes == 0 {
            return Err(MorpheusError::ConfigInvalid("extra node count must be at least 1".into()));
        }
        let forest = self
            .registry
            .get_forest(forest_id)
            .ok_or_else(|| MorpheusError::Other(format!("forest not found: {forest_id}")))?;

        let existing_count = self.registry.nodes_in_forest(forest_id).len() as u32;

        let ssh_handle = self
            .cloud
            .ensure_ssh_key(&self.config.ssh_key_name, self.config.ssh_key_path.as_deref())
            .await?;

        let preferred_types = self.preferred_server_types();
        let pairs = morpheus_selector::build_pairs(
            self.cloud.as_ref(),
            &preferred_types,
            std::slice::from_ref(&forest.location),
        )
        .await?;

        let mut created_node_ids = Vec::new();
        for offset in 1..=extra_nodes {
            if cancel.is_cancelled() {
                self.rollback_nodes(&created_node_ids).await;
                return Err(MorpheusError::Cancelled);
            }

            let index = existing_count + offset;
            match self
                .provision_node(forest_id, index, &pairs, &ssh_handle.name, &cancel)
                .await
            {
                Ok(node) => created_node_ids.push(node.id),
                Err(e) => {
                    // Only this call's own nodes are rolled back; siblings
                    // created before `grow` was invoked are left untouched.
                    self.rollback_nodes(&created_node_ids).await;
                    return Err(e);
                }
            }
        }

        let new_total = existing_count + extra_nodes;
        self.registry.update_forest_node_count(forest_id, new_total)?;
        self.registry.update_forest_status(forest_id, ForestStatus::Active)?;
        Ok(self.registry.get_forest(forest_id).expect("just updated"))
    }

    /// `teardown`: idempotent. Absent forest returns success.
    pub async fn teardown(&self, forest_id: &str) -> MorpheusResult<()> {
        let request_id = Uuid::new_v4();
        let _span = tracing::info_span!("teardown", %request_id, forest_id).entered();

        if self.registry.get_forest(forest_id).is_none() {
            return Ok(());
        }

        let nodes = self.registry.nodes_in_forest(forest_id);
        let mut residual_errors = Vec::new();

        for node in &nodes {
            if let Ok(server_id) = node.id.parse::<u64>() {
                if let Err(e) = self.cloud.delete_server(server_id).await {
                    residual_errors.push(format!("server {}: {e}", node.id));
                }
            }
        }

        if let Some(domain) = &self.config.dns_domain {
            for node in &nodes {
                if let Err(e) = self.dns.delete_record(domain, &node.name, DnsRecordType::A).await {
                    residual_errors.push(format!("DNS A record for {}: {e}", node.name));
                }
                if let Err(e) = self.dns.delete_record(domain, &node.name, DnsRecordType::AAAA).await {
                    residual_errors.push(format!("DNS AAAA record for {}: {e}", node.name));
                }
            }
        }

        self.registry.delete_forest(forest_id)?;

        if residual_errors.is_empty() {
            Ok(())
        } else {
            Err(MorpheusError::Other(format!(
                "teardown left residual errors: {}",
                residual_errors.join("; ")
            )))
        }
    }

    pub fn list_forests(&self) -> Vec<Forest> {
        self.registry.list_forests()
    }

    pub fn status(&self, forest_id: &str) -> Option<(Forest, Vec<Node>)> {
        let forest = self.registry.get_forest(forest_id)?;
        let nodes = self.registry.nodes_in_forest(forest_id);
        Some((forest, nodes))
    }

    /// Per-node pipeline: render → create → wait → resolve IP → register →
    /// probe → DNS. Steps 2–4 (create/wait/resolve) are retried across the
    /// selector's pair stream on `CapacityUnavailable`; every other error
    /// is fatal to the whole node and bubbles out to trigger rollback.
    async fn provision_node(
        &self,
        forest_id: &str,
        index: u32,
        pairs: &[(String, String)],
        ssh_key_name: &str,
        cancel: &CancellationToken,
    ) -> MorpheusResult<Node> {
        let mut last_attempt: Option<(String, String)> = None;

        for (server_type, location) in pairs {
            if cancel.is_cancelled() {
                return Err(MorpheusError::Cancelled);
            }

            let outcome = self
                .create_and_verify(forest_id, index, server_type, location, ssh_key_name)
                .await;

            match outcome {
                Ok(node) => return Ok(node),
                Err(MorpheusError::CapacityUnavailable { server_type, location }) => {
                    last_attempt = Some((server_type, location));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(MorpheusError::Other(format!(
            "no capacity available for node {index}{}",
            last_attempt
                .map(|(t, l)| format!(" (last attempt: {t}@{l})"))
                .unwrap_or_default()
        )))
    }

    /// Create + wait + resolve-IP + register + SSH-probe for one
    /// (server_type, location) candidate. DNS is attached last and never
    /// fails this function.
    async fn create_and_verify(
        &self,
        forest_id: &str,
        index: u32,
        server_type: &str,
        location: &str,
        ssh_key_name: &str,
    ) -> MorpheusResult<Node> {
        let name = Node::display_name(forest_id, index);
        let identity = NodeIdentity {
            forest_id: forest_id.to_string(),
            role: NodeRole::Edge,
            provisioned_at: Utc::now(),
            registry_url: String::new(),
            callback_url: String::new(),
        };
        let user_data = morpheus_cloudinit::render(&identity)?;

        let mut labels = std::collections::HashMap::new();
        labels.insert("forest".to_string(), forest_id.to_string());
        labels.insert("role".to_string(), "edge".to_string());

        let spec = ServerSpec {
            name: name.clone(),
            server_type: server_type.to_string(),
            location: location.to_string(),
            image: self.config.image.clone(),
            ssh_key_names: vec![ssh_key_name.to_string()],
            user_data,
            enable_ipv4: self.config.ipv4_enabled,
            labels,
        };

        let created = self.cloud.create_server(&spec).await?;

        let running = match self.cloud.wait_for_server_running(created.id, SERVER_WAIT_TIMEOUT).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.cloud.delete_server(created.id).await;
                return Err(e);
            }
        };

        let ipv6 = running.ipv6.clone().unwrap_or_default();
        let ipv4 = running.ipv4.clone().unwrap_or_default();
        let (chosen_ipv4, chosen_ipv6) = if self.host_ipv6_ok && !ipv6.is_empty() {
            (String::new(), ipv6)
        } else if !ipv4.is_empty() {
            (ipv4, String::new())
        } else {
            let _ = self.cloud.delete_server(created.id).await;
            return Err(MorpheusError::NoReachableAddress(name));
        };

        let node = Node {
            id: created.id.to_string(),
            name: name.clone(),
            forest_id: forest_id.to_string(),
            role: NodeRole::Edge,
            ipv4: chosen_ipv4.clone(),
            ipv6: chosen_ipv6.clone(),
            location: location.to_string(),
            status: NodeStatus::Provisioning,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        };
        self.registry.register_node(node.clone())?;

        let probe_address = if !chosen_ipv6.is_empty() { chosen_ipv6 } else { chosen_ipv4 };
        if let Err(e) = self.ssh_probe.wait_for_ssh(&probe_address, 22, SSH_WAIT_TIMEOUT).await {
            let _ = self.cloud.delete_server(created.id).await;
            let _ = self.registry.remove_node(&node.id);
            return Err(MorpheusError::SSHTimeout {
                address: probe_address,
                kind: e.to_string(),
            });
        }
        self.registry.update_node_status(&node.id, NodeStatus::Active)?;

        if let Some(domain) = self.config.dns_domain.clone() {
            if let Err(e) = self.register_dns(&node, &domain).await {
                warn!(node = %node.id, error = %e, "DNS registration failed; node remains active");
                let _ = self.registry.set_node_metadata(&node.id, "dns_warning", e.to_string());
            }
        }

        self.registry.get_node(&node.id).ok_or_else(|| MorpheusError::RegistryIO("node vanished after registration".into()))
    }

    async fn register_dns(&self, node: &Node, domain: &str) -> MorpheusResult<()> {
        if !node.ipv4.is_empty() {
            self.dns
                .create_record(&DNSRecord {
                    zone: domain.to_string(),
                    name: node.name.clone(),
                    record_type: DnsRecordType::A,
                    value: node.ipv4.clone(),
                    ttl: DEFAULT_RECORD_TTL,
                })
                .await?;
        }
        if !node.ipv6.is_empty() {
            self.dns
                .create_record(&DNSRecord {
                    zone: domain.to_string(),
                    name: node.name.clone(),
                    record_type: DnsRecordType::AAAA,
                    value: node.ipv6.clone(),
                    ttl: DEFAULT_RECORD_TTL,
                })
                .await?;
        }
        Ok(())
    }

    /// Rollback for nodes this call created, without touching the forest
    /// record. Used by `grow` so preexisting siblings are never disturbed.
    async fn rollback_nodes(&self, node_ids: &[String]) {
        let result = tokio::time::timeout(ROLLBACK_BUDGET, self.rollback_nodes_inner(node_ids)).await;
        if result.is_err() {
            warn!(count = node_ids.len(), "rollback exceeded its 60s budget; some resources may need manual cleanup");
        }
    }

    async fn rollback_nodes_inner(&self, node_ids: &[String]) {
        for node_id in node_ids {
            if let Some(node) = self.registry.get_node(node_id) {
                if let Ok(server_id) = node.id.parse::<u64>() {
                    if let Err(e) = self.cloud.delete_server(server_id).await {
                        warn!(node_id, error = %e, "rollback: failed to delete server");
                    }
                }
                if let Some(domain) = &self.config.dns_domain {
                    let _ = self.dns.delete_record(domain, &node.name, DnsRecordType::A).await;
                    let _ = self.dns.delete_record(domain, &node.name, DnsRecordType::AAAA).await;
                }
            }
            let _ = self.registry.remove_node(node_id);
        }
    }

    /// Rollback for a whole-forest failure: rolls back nodes, then deletes
    /// the forest record. Runs under a fresh 60s budget so a cancelled
    /// `plant` can't hang indefinitely trying to clean up.
    async fn rollback_forest(&self, forest_id: &str, node_ids: &[String]) {
        info!(forest_id, node_count = node_ids.len(), "rolling back forest after failure");
        self.rollback_nodes(node_ids).await;
        let _ = self.registry.delete_forest(forest_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use morpheus_core::SSHKeyHandle;
    use morpheus_dns::{DelegationStatus, Zone};
    use morpheus_hetzner::Server;
    use morpheus_reachability::ReachabilityError;
    use parking_lot::Mutex;
    use std::collections::HashMap as StdHashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeCloud {
        next_id: AtomicU64,
        servers: Mutex<StdHashMap<u64, Server>>,
        deleted: Mutex<Vec<u64>>,
        capacity_unavailable_for: Mutex<Vec<(String, String)>>,
        ssh_fingerprint: Mutex<Option<String>>,
    }

    impl FakeCloud {
        fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                servers: Mutex::new(StdHashMap::new()),
                deleted: Mutex::new(Vec::new()),
                capacity_unavailable_for: Mutex::new(Vec::new()),
                ssh_fingerprint: Mutex::new(None),
            }
        }

        fn deny_capacity(&self, server_type: &str, location: &str) {
            self.capacity_unavailable_for
                .lock()
                .push((server_type.to_string(), location.to_string()));
        }
    }

    #[async_trait]
    impl CloudProvider for FakeCloud {
        async fn create_server(&self, spec: &ServerSpec) -> MorpheusResult<Server> {
            if self
                .capacity_unavailable_for
                .lock()
                .contains(&(spec.server_type.clone(), spec.location.clone()))
            {
                return Err(MorpheusError::CapacityUnavailable {
                    server_type: spec.server_type.clone(),
                    location: spec.location.clone(),
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let server = Server {
                id,
                name: spec.name.clone(),
                status: "running".to_string(),
                ipv4: spec.enable_ipv4.then(|| format!("10.0.0.{id}")),
                ipv6: Some(format!("2001:db8::{id}")),
            };
            self.servers.lock().insert(id, server.clone());
            Ok(server)
        }

        async fn wait_for_server_running(&self, id: u64, _timeout: Duration) -> MorpheusResult<Server> {
            self.servers
                .lock()
                .get(&id)
                .cloned()
                .ok_or_else(|| MorpheusError::Other(format!("unknown server {id}")))
        }

        async fn get_server(&self, id: u64) -> MorpheusResult<Server> {
            self.wait_for_server_running(id, Duration::from_secs(0)).await
        }

        async fn delete_server(&self, id: u64) -> MorpheusResult<()> {
            self.servers.lock().remove(&id);
            self.deleted.lock().push(id);
            Ok(())
        }

        async fn list_servers(&self, _label_selector: Option<&str>) -> MorpheusResult<Vec<Server>> {
            Ok(self.servers.lock().values().cloned().collect())
        }

        async fn validate_server_type(&self, _server_type: &str) -> MorpheusResult<bool> {
            Ok(true)
        }

        async fn get_available_locations(&self, _server_type: &str) -> MorpheusResult<Vec<String>> {
            Ok(vec!["fsn1".to_string()])
        }

        async fn ensure_ssh_key(&self, name: &str, _public_key_path: Option<&Path>) -> MorpheusResult<SSHKeyHandle> {
            Ok(SSHKeyHandle {
                name: name.to_string(),
                fingerprint: self
                    .ssh_fingerprint
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "aa:bb".to_string()),
            })
        }
    }

    /// Always succeeds immediately, or always times out, depending on
    /// construction — never touches a real socket.
    struct FakeSshProbe {
        should_succeed: bool,
    }

    impl FakeSshProbe {
        fn always_succeeds() -> Self {
            Self { should_succeed: true }
        }

        fn always_times_out() -> Self {
            Self { should_succeed: false }
        }
    }

    #[async_trait]
    impl SshProbe for FakeSshProbe {
        async fn wait_for_ssh(&self, _addr: &str, _port: u16, _deadline: Duration) -> Result<(), ReachabilityError> {
            if self.should_succeed {
                Ok(())
            } else {
                Err(ReachabilityError::Timeout)
            }
        }
    }

    struct NullDns;

    #[async_trait]
    impl DnsProvider for NullDns {
        async fn create_zone(&self, name: &str) -> MorpheusResult<Zone> {
            Ok(Zone {
                id: String::new(),
                name: name.to_string(),
                ttl: 86400,
            })
        }
        async fn get_zone(&self, _name: &str) -> MorpheusResult<Option<Zone>> {
            Ok(None)
        }
        async fn list_zones(&self) -> MorpheusResult<Vec<Zone>> {
            Ok(Vec::new())
        }
        async fn delete_zone(&self, _zone_id: &str) -> MorpheusResult<()> {
            Ok(())
        }
        async fn create_record(&self, _record: &DNSRecord) -> MorpheusResult<()> {
            Ok(())
        }
        async fn create_rrset(&self, _zone: &str, _name: &str, _t: DnsRecordType, _ttl: u32, _values: &[String]) -> MorpheusResult<()> {
            Ok(())
        }
        async fn list_records(&self, _zone: &str) -> MorpheusResult<Vec<DNSRecord>> {
            Ok(Vec::new())
        }
        async fn delete_record(&self, _zone: &str, _name: &str, _t: DnsRecordType) -> MorpheusResult<()> {
            Ok(())
        }
        async fn verify_ns_delegation(&self, _domain: &str, _ns: &[String]) -> MorpheusResult<DelegationStatus> {
            Ok(DelegationStatus::default())
        }
    }

    fn test_config() -> MorpheusConfig {
        let mut config = MorpheusConfig::default();
        config.hetzner_api_token = Some("test-token".into());
        config
    }

    fn make_provisioner(dir: &Path) -> (Provisioner, Arc<FakeCloud>) {
        let registry = Arc::new(Registry::open(dir.join("registry.json")).unwrap());
        let cloud = Arc::new(FakeCloud::new());
        let dns = Arc::new(NullDns);
        let ssh_probe = Arc::new(FakeSshProbe::always_succeeds());
        let provisioner = Provisioner::new(registry, cloud.clone(), dns, ssh_probe, test_config(), true);
        (provisioner, cloud)
    }

    #[tokio::test]
    async fn test_plant_rejects_zero_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, _cloud) = make_provisioner(dir.path());
        let result = provisioner.plant(0, CancellationToken::new()).await;
        assert!(matches!(result, Err(MorpheusError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_plant_two_nodes_succeeds_with_ipv6_only() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, _cloud) = make_provisioner(dir.path());

        let forest = provisioner.plant(2, CancellationToken::new()).await.unwrap();
        assert_eq!(forest.status, ForestStatus::Active);
        assert_eq!(forest.node_count, 2);

        let (_forest, nodes) = provisioner.status(&forest.id).unwrap();
        assert_eq!(nodes.len(), 2);
        for node in &nodes {
            assert!(node.ipv4.is_empty());
            assert!(!node.ipv6.is_empty());
            assert_eq!(node.status, NodeStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_plant_falls_back_to_ipv4_when_host_lacks_ipv6() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("registry.json")).unwrap());
        let cloud = Arc::new(FakeCloud::new());
        let dns = Arc::new(NullDns);

        let mut config = test_config();
        config.ipv4_enabled = true;
        let ssh_probe = Arc::new(FakeSshProbe::always_succeeds());

        let provisioner = Provisioner::new(registry, cloud, dns, ssh_probe, config, false);
        let forest = provisioner.plant(1, CancellationToken::new()).await.unwrap();

        let (_, nodes) = provisioner.status(&forest.id).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(!nodes[0].ipv4.is_empty());
        assert!(nodes[0].ipv6.is_empty(), "host without IPv6 must not be assigned an IPv6-only node");
    }

    #[tokio::test]
    async fn test_plant_without_ipv6_host_and_without_ipv4_fails_no_reachable_address() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, _cloud) = {
            let registry = Arc::new(Registry::open(dir.path().join("registry.json")).unwrap());
            let cloud = Arc::new(FakeCloud::new());
            let dns = Arc::new(NullDns);
            let ssh_probe = Arc::new(FakeSshProbe::always_succeeds());
            let config = test_config(); // ipv4_enabled defaults to false
            (Provisioner::new(registry, cloud.clone(), dns, ssh_probe, config, false), cloud)
        };

        let result = provisioner.plant(1, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_plant_with_capacity_exhaustion_falls_back_to_next_pair() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("registry.json")).unwrap());
        let cloud = Arc::new(FakeCloud::new());
        cloud.deny_capacity("cx22", "fsn1");
        let dns = Arc::new(NullDns);

        let mut config = test_config();
        config.server_type = "cx22".into();
        config.server_type_fallback = vec!["cpx11".into()];
        config.location = "fsn1".into();
        let ssh_probe = Arc::new(FakeSshProbe::always_succeeds());

        let provisioner = Provisioner::new(registry, cloud.clone(), dns, ssh_probe, config, true);
        let forest = provisioner.plant(1, CancellationToken::new()).await.unwrap();
        assert_eq!(forest.status, ForestStatus::Active);
        assert!(cloud.deleted.lock().is_empty(), "no partial server should remain after a capacity fallback");
    }

    #[tokio::test]
    async fn test_plant_failure_leaves_no_residual_forest_or_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("registry.json")).unwrap());
        let cloud = Arc::new(FakeCloud::new());
        // Deny capacity everywhere this config could try, so the whole
        // plant call exhausts the selector and fails.
        cloud.deny_capacity("cx22", "fsn1");
        let dns = Arc::new(NullDns);
        let config = test_config();
        let ssh_probe = Arc::new(FakeSshProbe::always_succeeds());

        let provisioner = Provisioner::new(registry.clone(), cloud, dns, ssh_probe, config, true);
        let result = provisioner.plant(1, CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(registry.list_forests().is_empty(), "failed plant must leave no forest behind");
    }

    #[tokio::test]
    async fn test_ssh_probe_timeout_triggers_full_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("registry.json")).unwrap());
        let cloud = Arc::new(FakeCloud::new());
        let dns = Arc::new(NullDns);
        let ssh_probe = Arc::new(FakeSshProbe::always_times_out());

        let provisioner = Provisioner::new(registry.clone(), cloud.clone(), dns, ssh_probe, test_config(), true);
        let result = provisioner.plant(1, CancellationToken::new()).await;

        assert!(matches!(result, Err(MorpheusError::SSHTimeout { .. })));
        assert_eq!(cloud.deleted.lock().len(), 1, "the unreachable server must be deleted");
        assert!(registry.list_forests().is_empty(), "forest must not survive an SSH timeout");
    }

    #[tokio::test]
    async fn test_teardown_of_nonexistent_forest_is_idempotent_success() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, _cloud) = make_provisioner(dir.path());
        assert!(provisioner.teardown("forest-ghost").await.is_ok());
    }

    #[tokio::test]
    async fn test_teardown_deletes_every_node_server() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, cloud) = make_provisioner(dir.path());

        let forest = provisioner.plant(3, CancellationToken::new()).await.unwrap();
        provisioner.teardown(&forest.id).await.unwrap();

        assert_eq!(cloud.deleted.lock().len(), 3);
        assert!(provisioner.status(&forest.id).is_none());
    }

    #[tokio::test]
    async fn test_grow_adds_nodes_without_touching_existing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, _cloud) = make_provisioner(dir.path());

        let forest = provisioner.plant(1, CancellationToken::new()).await.unwrap();
        let (_, nodes_before) = provisioner.status(&forest.id).unwrap();
        let original_id = nodes_before[0].id.clone();

        let grown = provisioner.grow(&forest.id, 2, CancellationToken::new()).await.unwrap();
        assert_eq!(grown.node_count, 3);

        let (_, nodes_after) = provisioner.status(&forest.id).unwrap();
        assert_eq!(nodes_after.len(), 3);
        assert!(nodes_after.iter().any(|n| n.id == original_id), "grow must not disturb preexisting nodes");
    }

    #[tokio::test]
    async fn test_grow_on_absent_forest_creates_no_servers() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, cloud) = make_provisioner(dir.path());

        let result = provisioner.grow("forest-ghost", 1, CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(cloud.servers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_any_node_rolls_back_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (provisioner, cloud) = make_provisioner(dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = provisioner.plant(3, cancel).await;
        assert!(matches!(result, Err(MorpheusError::Cancelled)));
        assert!(cloud.servers.lock().is_empty());
    }
}
