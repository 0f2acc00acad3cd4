//! DNS provider adapter (C4). New relative to the teacher — ClawOps has no
//! DNS layer — built in the same `reqwest` + JSON-`Value` navigation idiom
//! as `morpheus-hetzner`'s cloud adapter, for a consistent feel across both
//! provider crates.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use morpheus_core::{DNSRecord, DnsRecordType, MorpheusError, MorpheusResult, DEFAULT_RECORD_TTL, DEFAULT_ZONE_TTL};
use std::time::Duration;
use tracing::{debug, info};

const DNS_API_BASE: &str = "https://dns.hetzner.com/api/v1";

#[derive(Debug, Clone)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DelegationStatus {
    pub delegated: bool,
    pub partial: bool,
    pub missing: Vec<String>,
    pub matching: Vec<String>,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_zone(&self, name: &str) -> MorpheusResult<Zone>;
    async fn get_zone(&self, name: &str) -> MorpheusResult<Option<Zone>>;
    async fn list_zones(&self) -> MorpheusResult<Vec<Zone>>;
    async fn delete_zone(&self, zone_id: &str) -> MorpheusResult<()>;

    /// Adds one record to the (zone, name, type) set. Must not replace
    /// existing values — serialize-and-retry if the backend can't express
    /// "add" natively.
    async fn create_record(&self, record: &DNSRecord) -> MorpheusResult<()>;

    /// Installs an entire record set atomically.
    async fn create_rrset(&self, zone: &str, name: &str, record_type: DnsRecordType, ttl: u32, values: &[String]) -> MorpheusResult<()>;

    async fn list_records(&self, zone: &str) -> MorpheusResult<Vec<DNSRecord>>;

    /// Tolerates "not found" — deleting an absent record is success.
    async fn delete_record(&self, zone: &str, name: &str, record_type: DnsRecordType) -> MorpheusResult<()>;

    async fn verify_ns_delegation(&self, domain: &str, expected_nameservers: &[String]) -> MorpheusResult<DelegationStatus>;
}

fn normalize_ns(ns: &str) -> String {
    ns.trim_end_matches('.').to_lowercase()
}

// ─── Hetzner DNS ──────────────────────────────────────────────────────────────

pub struct HetznerDnsProvider {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerDnsProvider {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token,
            base_url: DNS_API_BASE.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    async fn get(&self, path: &str) -> MorpheusResult<serde_json::Value> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header("Auth-API-Token", &self.api_token)
            .send()
            .await
            .map_err(|e| MorpheusError::TransientNetwork(e.to_string()))?;
        handle(resp).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> MorpheusResult<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Auth-API-Token", &self.api_token)
            .json(body)
            .send()
            .await
            .map_err(|e| MorpheusError::TransientNetwork(e.to_string()))?;
        handle(resp).await
    }

    async fn delete(&self, path: &str) -> MorpheusResult<()> {
        let resp = self
            .client
            .delete(format!("{}{path}", self.base_url))
            .header("Auth-API-Token", &self.api_token)
            .send()
            .await
            .map_err(|e| MorpheusError::TransientNetwork(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        handle(resp).await.map(|_| ())
    }

    async fn find_zone(&self, name: &str) -> MorpheusResult<Option<Zone>> {
        let resp = self.get(&format!("/zones?name={name}")).await?;
        let zone = resp["zones"]
            .as_array()
            .and_then(|arr| arr.first())
            .map(|z| Zone {
                id: z["id"].as_str().unwrap_or_default().to_string(),
                name: z["name"].as_str().unwrap_or_default().to_string(),
                ttl: z["ttl"].as_u64().unwrap_or(DEFAULT_ZONE_TTL as u64) as u32,
            });
        Ok(zone)
    }

    async fn find_record(&self, zone_id: &str, name: &str, record_type: DnsRecordType) -> MorpheusResult<Option<String>> {
        let resp = self.get(&format!("/records?zone_id={zone_id}")).await?;
        let type_str = record_type.to_string();
        let id = resp["records"]
            .as_array()
            .and_then(|arr| {
                arr.iter()
                    .find(|r| r["name"] == name && r["type"] == type_str)
            })
            .and_then(|r| r["id"].as_str())
            .map(String::from);
        Ok(id)
    }
}

async fn handle(resp: reqwest::Response) -> MorpheusResult<serde_json::Value> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| MorpheusError::DNSFailure(format!("failed to parse Hetzner DNS response: {e}")));
    }
    let body = resp.text().await.unwrap_or_default();
    match status.as_u16() {
        401 | 403 => Err(MorpheusError::ProviderAuth(body)),
        429 => Err(MorpheusError::TransientNetwork(format!("DNS API rate limited: {body}"))),
        s if (500..600).contains(&s) => Err(MorpheusError::TransientNetwork(format!("{status}: {body}"))),
        _ => Err(MorpheusError::DNSFailure(format!("Hetzner DNS API error {status}: {body}"))),
    }
}

#[async_trait]
impl DnsProvider for HetznerDnsProvider {
    async fn create_zone(&self, name: &str) -> MorpheusResult<Zone> {
        if let Some(existing) = self.find_zone(name).await? {
            return Ok(existing);
        }
        info!(zone = name, "creating DNS zone");
        let body = serde_json::json!({ "name": name, "ttl": DEFAULT_ZONE_TTL });
        let resp = self.post("/zones", &body).await?;
        Ok(Zone {
            id: resp["zone"]["id"].as_str().unwrap_or_default().to_string(),
            name: resp["zone"]["name"].as_str().unwrap_or(name).to_string(),
            ttl: resp["zone"]["ttl"].as_u64().unwrap_or(DEFAULT_ZONE_TTL as u64) as u32,
        })
    }

    async fn get_zone(&self, name: &str) -> MorpheusResult<Option<Zone>> {
        self.find_zone(name).await
    }

    async fn list_zones(&self) -> MorpheusResult<Vec<Zone>> {
        let resp = self.get("/zones").await?;
        Ok(resp["zones"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|z| Zone {
                        id: z["id"].as_str().unwrap_or_default().to_string(),
                        name: z["name"].as_str().unwrap_or_default().to_string(),
                        ttl: z["ttl"].as_u64().unwrap_or(DEFAULT_ZONE_TTL as u64) as u32,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_zone(&self, zone_id: &str) -> MorpheusResult<()> {
        self.delete(&format!("/zones/{zone_id}")).await
    }

    async fn create_record(&self, record: &DNSRecord) -> MorpheusResult<()> {
        let zone = self
            .find_zone(&record.zone)
            .await?
            .ok_or_else(|| MorpheusError::DNSFailure(format!("zone not found: {}", record.zone)))?;

        // Add-not-replace: if a record with this (name, type) already
        // exists, this backend expresses "add another value" as a second
        // POST, so no read-modify-write is needed here.
        let body = serde_json::json!({
            "zone_id": zone.id,
            "type": record.record_type.to_string(),
            "name": record.name,
            "value": record.value,
            "ttl": record.ttl,
        });
        self.post("/records", &body).await?;
        Ok(())
    }

    async fn create_rrset(&self, zone: &str, name: &str, record_type: DnsRecordType, ttl: u32, values: &[String]) -> MorpheusResult<()> {
        for value in values {
            self.create_record(&DNSRecord {
                zone: zone.to_string(),
                name: name.to_string(),
                record_type,
                value: value.clone(),
                ttl,
            })
            .await?;
        }
        Ok(())
    }

    async fn list_records(&self, zone: &str) -> MorpheusResult<Vec<DNSRecord>> {
        let z = self
            .find_zone(zone)
            .await?
            .ok_or_else(|| MorpheusError::DNSFailure(format!("zone not found: {zone}")))?;
        let resp = self.get(&format!("/records?zone_id={}", z.id)).await?;
        let records = resp["records"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let record_type = match r["type"].as_str()? {
                            "A" => DnsRecordType::A,
                            "AAAA" => DnsRecordType::AAAA,
                            "NS" => DnsRecordType::NS,
                            "MX" => DnsRecordType::MX,
                            "TXT" => DnsRecordType::TXT,
                            _ => return None,
                        };
                        Some(DNSRecord {
                            zone: zone.to_string(),
                            name: r["name"].as_str()?.to_string(),
                            record_type,
                            value: r["value"].as_str()?.to_string(),
                            ttl: r["ttl"].as_u64().unwrap_or(DEFAULT_RECORD_TTL as u64) as u32,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    async fn delete_record(&self, zone: &str, name: &str, record_type: DnsRecordType) -> MorpheusResult<()> {
        let Some(z) = self.find_zone(zone).await? else {
            return Ok(());
        };
        match self.find_record(&z.id, name, record_type).await? {
            Some(record_id) => self.delete(&format!("/records/{record_id}")).await,
            None => Ok(()),
        }
    }

    async fn verify_ns_delegation(&self, domain: &str, expected_nameservers: &[String]) -> MorpheusResult<DelegationStatus> {
        let records = self.list_records(domain).await?;
        let actual: Vec<String> = records
            .iter()
            .filter(|r| r.record_type == DnsRecordType::NS)
            .map(|r| normalize_ns(&r.value))
            .collect();

        let expected: Vec<String> = expected_nameservers.iter().map(|n| normalize_ns(n)).collect();
        let matching: Vec<String> = expected.iter().filter(|e| actual.contains(e)).cloned().collect();
        let missing: Vec<String> = expected.iter().filter(|e| !actual.contains(e)).cloned().collect();

        debug!(domain, matching = matching.len(), missing = missing.len(), "checked NS delegation");

        Ok(DelegationStatus {
            delegated: missing.is_empty(),
            partial: !matching.is_empty() && !missing.is_empty(),
            missing,
            matching,
        })
    }
}

// ─── Null provider ────────────────────────────────────────────────────────────

/// Selected automatically when no DNS domain is configured. Every operation
/// succeeds trivially and no state is kept.
pub struct NullDnsProvider;

#[async_trait]
impl DnsProvider for NullDnsProvider {
    async fn create_zone(&self, name: &str) -> MorpheusResult<Zone> {
        Ok(Zone {
            id: String::new(),
            name: name.to_string(),
            ttl: DEFAULT_ZONE_TTL,
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

    async fn create_rrset(&self, _zone: &str, _name: &str, _record_type: DnsRecordType, _ttl: u32, _values: &[String]) -> MorpheusResult<()> {
        Ok(())
    }

    async fn list_records(&self, _zone: &str) -> MorpheusResult<Vec<DNSRecord>> {
        Ok(Vec::new())
    }

    async fn delete_record(&self, _zone: &str, _name: &str, _record_type: DnsRecordType) -> MorpheusResult<()> {
        Ok(())
    }

    async fn verify_ns_delegation(&self, _domain: &str, _expected_nameservers: &[String]) -> MorpheusResult<DelegationStatus> {
        Ok(DelegationStatus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ns_strips_trailing_dot_and_case() {
        assert_eq!(normalize_ns("NS1.Hetzner.Com."), "ns1.hetzner.com");
        assert_eq!(normalize_ns("ns1.hetzner.com"), "ns1.hetzner.com");
    }

    #[tokio::test]
    async fn test_null_provider_create_record_always_succeeds() {
        let provider = NullDnsProvider;
        let record = DNSRecord {
            zone: "example.com".into(),
            name: "node-1".into(),
            record_type: DnsRecordType::A,
            value: "1.2.3.4".into(),
            ttl: DEFAULT_RECORD_TTL,
        };
        assert!(provider.create_record(&record).await.is_ok());
    }

    #[tokio::test]
    async fn test_null_provider_lists_no_records() {
        let provider = NullDnsProvider;
        assert!(provider.list_records("example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_null_provider_delegation_is_empty_not_delegated() {
        let provider = NullDnsProvider;
        let status = provider
            .verify_ns_delegation("example.com", &["ns1.hetzner.com".into()])
            .await
            .unwrap();
        assert!(!status.delegated);
        assert!(status.matching.is_empty());
    }
}
