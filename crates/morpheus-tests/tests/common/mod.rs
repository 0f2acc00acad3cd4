//! Shared fakes for the end-to-end scenario tests: an in-memory
//! `CloudProvider`, a no-op `DnsProvider`, and a scriptable `SshProbe`, so
//! every test here exercises the real `Provisioner` against deterministic,
//! network-free doubles.

use async_trait::async_trait;
use morpheus_config::MorpheusConfig;
use morpheus_core::{DNSRecord, DnsRecordType, MorpheusError, MorpheusResult, SSHKeyHandle};
use morpheus_dns::{DelegationStatus, DnsProvider, Zone};
use morpheus_hetzner::{CloudProvider, Server, ServerSpec};
use morpheus_provision::Provisioner;
use morpheus_reachability::{ReachabilityError, SshProbe};
use morpheus_registry::Registry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct FakeCloud {
    next_id: AtomicU64,
    created_count: AtomicU64,
    pub servers: Mutex<HashMap<u64, Server>>,
    pub deleted: Mutex<Vec<u64>>,
    deny_capacity: Mutex<Vec<(String, String)>>,
    ssh_key_mismatch: Option<(String, String)>,
    cancel_on_nth_create: Mutex<Option<(u64, CancellationToken)>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            created_count: AtomicU64::new(0),
            servers: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            deny_capacity: Mutex::new(Vec::new()),
            ssh_key_mismatch: None,
            cancel_on_nth_create: Mutex::new(None),
        }
    }

    pub fn with_ssh_key_mismatch(expected: &str, actual: &str) -> Self {
        Self {
            ssh_key_mismatch: Some((expected.to_string(), actual.to_string())),
            ..Self::new()
        }
    }

    pub fn deny(&self, server_type: &str, location: &str) {
        self.deny_capacity.lock().push((server_type.to_string(), location.to_string()));
    }

    /// Triggers `token.cancel()` the moment the n-th `create_server` call
    /// happens, simulating a SIGINT arriving mid-plant.
    pub fn cancel_on_nth_create(&self, n: u64, token: CancellationToken) {
        *self.cancel_on_nth_create.lock() = Some((n, token));
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(&self, spec: &ServerSpec) -> MorpheusResult<Server> {
        if self
            .deny_capacity
            .lock()
            .contains(&(spec.server_type.clone(), spec.location.clone()))
        {
            return Err(MorpheusError::CapacityUnavailable {
                server_type: spec.server_type.clone(),
                location: spec.location.clone(),
            });
        }

        let count = self.created_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = self.cancel_on_nth_create.lock().as_ref() {
            if count == *n {
                token.cancel();
            }
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
        if let Some((expected, actual)) = &self.ssh_key_mismatch {
            return Err(MorpheusError::SSHKeyFingerprintMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
        Ok(SSHKeyHandle {
            name: name.to_string(),
            fingerprint: "aa:bb:cc:dd".to_string(),
        })
    }
}

/// Always succeeds immediately, or always times out, never touching a
/// real socket.
pub struct FakeSshProbe {
    should_succeed: bool,
}

impl FakeSshProbe {
    pub fn always_succeeds() -> Self {
        Self { should_succeed: true }
    }

    pub fn always_times_out() -> Self {
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

pub struct NullDns;

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

pub fn test_config() -> MorpheusConfig {
    let mut config = MorpheusConfig::default();
    config.hetzner_api_token = Some("test-token".into());
    config
}

pub fn provisioner_with(
    dir: &Path,
    cloud: Arc<FakeCloud>,
    ssh_probe: FakeSshProbe,
    config: MorpheusConfig,
) -> (Provisioner, Arc<Registry>) {
    let registry = Arc::new(Registry::open(dir.join("registry.json")).unwrap());
    let provisioner = Provisioner::new(registry.clone(), cloud, Arc::new(NullDns), Arc::new(ssh_probe), config, true);
    (provisioner, registry)
}
