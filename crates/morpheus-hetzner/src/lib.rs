//! Hetzner Cloud adapter (C3): the only cloud provider Morpheus supports.
//!
//! Generalizes `claw_provision::HetznerProvider` — same `reqwest` client
//! shape, same `bearer_auth`/`error_for_status`/`json::<Value>()` navigation
//! style, same polling idiom for "wait until running" — but widens the
//! surface to cover catalog validation, location availability, and SSH key
//! reconciliation, none of which the teacher's five-provider trait needed.

#![forbid(unsafe_code)]

mod retry;
mod ssh_key;

use async_trait::async_trait;
use morpheus_core::{MorpheusError, MorpheusResult, SSHKeyHandle};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const CAPACITY_PHRASES: [&str; 3] = [
    "server location disabled",
    "resource_unavailable",
    "unsupported location for server type",
];

#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    pub ssh_key_names: Vec<String>,
    pub user_data: String,
    pub enable_ipv4: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// The capability contract the Provisioner depends on. One real
/// implementation ([`HetznerProvider`]) and, in `morpheus-tests`, an
/// in-memory fake for testing without the live API.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_server(&self, spec: &ServerSpec) -> MorpheusResult<Server>;
    async fn wait_for_server_running(&self, id: u64, timeout: Duration) -> MorpheusResult<Server>;
    async fn get_server(&self, id: u64) -> MorpheusResult<Server>;
    async fn delete_server(&self, id: u64) -> MorpheusResult<()>;
    async fn list_servers(&self, label_selector: Option<&str>) -> MorpheusResult<Vec<Server>>;
    async fn validate_server_type(&self, server_type: &str) -> MorpheusResult<bool>;
    async fn get_available_locations(&self, server_type: &str) -> MorpheusResult<Vec<String>>;
    async fn ensure_ssh_key(&self, name: &str, public_key_path: Option<&Path>) -> MorpheusResult<SSHKeyHandle>;
}

pub struct HetznerProvider {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerProvider {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token,
            base_url: API_BASE.to_string(),
            client: build_client(),
        }
    }

    async fn get_json(&self, path: &str) -> MorpheusResult<serde_json::Value> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        handle_response(resp, None).await
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        capacity_ctx: Option<(&str, &str)>,
    ) -> MorpheusResult<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        handle_response(resp, capacity_ctx).await
    }

    async fn delete(&self, path: &str) -> MorpheusResult<()> {
        let resp = self
            .client
            .delete(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        handle_response(resp, None).await.map(|_| ())
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build HTTP client")
}

fn classify_reqwest_error(e: reqwest::Error) -> MorpheusError {
    // Every transport-level failure reqwest can hand back here — timeout,
    // connection reset, DNS resolution failure — falls under the spec's
    // transient-network retry bucket.
    MorpheusError::TransientNetwork(e.to_string())
}

/// Maps an HTTP response to either a parsed JSON body or a typed
/// `MorpheusError`, checking the response body for the capacity-unavailable
/// phrases before falling back to status-code classification.
async fn handle_response(
    resp: reqwest::Response,
    capacity_ctx: Option<(&str, &str)>,
) -> MorpheusResult<serde_json::Value> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| MorpheusError::TransientNetwork(format!("failed to parse Hetzner response: {e}")));
    }

    let body = resp.text().await.unwrap_or_default();
    let lower = body.to_lowercase();

    if let Some((server_type, location)) = capacity_ctx {
        if CAPACITY_PHRASES.iter().any(|p| lower.contains(p)) {
            return Err(MorpheusError::CapacityUnavailable {
                server_type: server_type.to_string(),
                location: location.to_string(),
            });
        }
    }

    match status.as_u16() {
        401 | 403 => Err(MorpheusError::ProviderAuth(body)),
        429 => Err(MorpheusError::TransientNetwork(format!("rate limited: {body}"))),
        s if (500..600).contains(&s) => Err(MorpheusError::TransientNetwork(format!("{status}: {body}"))),
        _ => Err(MorpheusError::Other(format!("Hetzner API error {status}: {body}"))),
    }
}

/// First usable address inside an IPv6 /64 the way Hetzner hands them out:
/// the network address with the low bit set to 1.
fn first_host_in_network(cidr: &str) -> Option<String> {
    let network = cidr.split('/').next()?;
    let addr: Ipv6Addr = network.parse().ok()?;
    let mut octets = addr.octets();
    octets[15] |= 1;
    Some(Ipv6Addr::from(octets).to_string())
}

fn server_from_json(v: &serde_json::Value) -> MorpheusResult<Server> {
    let id = v["id"]
        .as_u64()
        .ok_or_else(|| MorpheusError::Other("missing server.id in Hetzner response".into()))?;
    let name = v["name"].as_str().unwrap_or_default().to_string();
    let status = v["status"].as_str().unwrap_or("unknown").to_string();
    let ipv4 = v["public_net"]["ipv4"]["ip"].as_str().map(String::from);
    let ipv6 = v["public_net"]["ipv6"]["ip"]
        .as_str()
        .and_then(first_host_in_network);
    Ok(Server {
        id,
        name,
        status,
        ipv4,
        ipv6,
    })
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    async fn create_server(&self, spec: &ServerSpec) -> MorpheusResult<Server> {
        info!(name = %spec.name, server_type = %spec.server_type, location = %spec.location, "creating Hetzner server");

        let body = serde_json::json!({
            "name": spec.name,
            "server_type": spec.server_type,
            "location": spec.location,
            "image": spec.image,
            "ssh_keys": spec.ssh_key_names,
            "user_data": spec.user_data,
            "public_net": { "enable_ipv4": spec.enable_ipv4, "enable_ipv6": true },
            "labels": spec.labels,
            "start_after_create": true,
        });

        // Deliberately not wrapped in retry::with_backoff: a CapacityUnavailable
        // response here must propagate immediately so the selector can advance.
        let resp = self
            .post_json("/servers", &body, Some((&spec.server_type, &spec.location)))
            .await?;
        server_from_json(&resp["server"])
    }

    async fn wait_for_server_running(&self, id: u64, timeout: Duration) -> MorpheusResult<Server> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt = 0u32;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(MorpheusError::Other(format!(
                    "timed out waiting for server {id} to reach running state"
                )));
            }
            let server = self.get_server(id).await?;
            if server.status == "running" {
                return Ok(server);
            }
            if server.status == "error" {
                return Err(MorpheusError::Other(format!("server {id} entered error state")));
            }
            if attempt % 12 == 0 {
                info!(id, status = %server.status, "waiting for server to reach running state");
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn get_server(&self, id: u64) -> MorpheusResult<Server> {
        let resp = retry::with_backoff(|| async { self.get_json(&format!("/servers/{id}")).await }).await?;
        server_from_json(&resp["server"])
    }

    async fn delete_server(&self, id: u64) -> MorpheusResult<()> {
        retry::with_backoff(|| async { self.delete(&format!("/servers/{id}")).await }).await
    }

    async fn list_servers(&self, label_selector: Option<&str>) -> MorpheusResult<Vec<Server>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let mut path = format!("/servers?page={page}&per_page=25");
            if let Some(sel) = label_selector {
                path.push_str(&format!("&label_selector={}", urlencode(sel)));
            }
            let resp = retry::with_backoff(|| async { self.get_json(&path).await }).await?;
            let servers = resp["servers"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let count = servers.len();
            for s in &servers {
                all.push(server_from_json(s)?);
            }
            let next_page = resp["meta"]["pagination"]["next_page"].as_u64();
            match next_page {
                Some(np) => page = np as u32,
                None => break,
            }
            if count == 0 {
                break;
            }
        }
        debug!(count = all.len(), "listed Hetzner servers");
        Ok(all)
    }

    async fn validate_server_type(&self, server_type: &str) -> MorpheusResult<bool> {
        let resp = retry::with_backoff(|| async { self.get_json("/server_types").await }).await?;
        let found = resp["server_types"]
            .as_array()
            .map(|arr| arr.iter().any(|t| t["name"] == server_type))
            .unwrap_or(false);
        Ok(found)
    }

    async fn get_available_locations(&self, server_type: &str) -> MorpheusResult<Vec<String>> {
        let resp = retry::with_backoff(|| async { self.get_json("/server_types").await }).await?;
        let entry = resp["server_types"]
            .as_array()
            .and_then(|arr| arr.iter().find(|t| t["name"] == server_type));

        let Some(entry) = entry else {
            return Err(MorpheusError::ServerTypeUnknown(server_type.to_string()));
        };

        let type_id = entry["id"].as_u64();
        let priced_locations: Vec<String> = entry["prices"]
            .as_array()
            .map(|prices| {
                prices
                    .iter()
                    .filter_map(|p| p["location"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        // Pricing lists a location even after Hetzner has stopped actually
        // racking the type there; `/datacenters` is the authoritative
        // availability signal, so we intersect against it.
        let datacenters_resp = retry::with_backoff(|| async { self.get_json("/datacenters").await }).await?;
        let available_in: std::collections::HashSet<String> = datacenters_resp["datacenters"]
            .as_array()
            .map(|dcs| {
                dcs.iter()
                    .filter(|dc| {
                        type_id.is_some_and(|id| {
                            dc["server_types"]["available"]
                                .as_array()
                                .is_some_and(|ids| ids.iter().any(|v| v.as_u64() == Some(id)))
                        })
                    })
                    .filter_map(|dc| dc["location"]["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let locations = priced_locations
            .into_iter()
            .filter(|loc| available_in.contains(loc))
            .collect();
        Ok(locations)
    }

    async fn ensure_ssh_key(&self, name: &str, public_key_path: Option<&Path>) -> MorpheusResult<SSHKeyHandle> {
        let local_key = ssh_key::read_local_public_key(public_key_path)?;
        let local_fingerprint = ssh_key::fingerprint(&local_key)?;

        let resp = retry::with_backoff(|| async {
            self.get_json(&format!("/ssh_keys?name={}", urlencode(name))).await
        })
        .await?;

        let existing: Vec<SSHKeyHandle> = resp["ssh_keys"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|k| {
                        Some(SSHKeyHandle {
                            name: k["name"].as_str()?.to_string(),
                            fingerprint: k["fingerprint"].as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        match ssh_key::decide(&local_fingerprint, &existing) {
            ssh_key::Decision::NoOp(handle) => {
                debug!(name, fingerprint = %handle.fingerprint, "SSH key already present and matching");
                Ok(handle)
            }
            ssh_key::Decision::Mismatch { expected, actual } => {
                warn!(name, expected = %expected, actual = %actual, "SSH key fingerprint mismatch");
                Err(MorpheusError::SSHKeyFingerprintMismatch { expected, actual })
            }
            ssh_key::Decision::Upload => {
                info!(name, "uploading new SSH key");
                let body = serde_json::json!({ "name": name, "public_key": local_key });
                let resp = self.post_json("/ssh_keys", &body, None).await?;
                Ok(SSHKeyHandle {
                    name: resp["ssh_key"]["name"].as_str().unwrap_or(name).to_string(),
                    fingerprint: resp["ssh_key"]["fingerprint"]
                        .as_str()
                        .unwrap_or(&local_fingerprint)
                        .to_string(),
                })
            }
        }
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}
