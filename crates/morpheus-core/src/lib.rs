//! Shared domain types and error taxonomy for Morpheus.
//!
//! Mirrors the data model in spec §3: [`Forest`] and [`Node`] are the two
//! entities the [`Registry`](../morpheus_registry) owns; [`SSHKeyHandle`] and
//! [`DNSRecord`] are capability-contract value types shared by the provider
//! adapters. Nothing here talks to disk or the network.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// ─── Forest ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForestStatus {
    Provisioning,
    Active,
    Degraded,
    TornDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forest {
    pub id: String,
    pub node_count: u32,
    pub location: String,
    pub provider: String,
    pub status: ForestStatus,
    pub created_at: DateTime<Utc>,
}

impl Forest {
    /// New forest in `provisioning` status, ID formatted per spec §3.
    pub fn new(id: String, node_count: u32, location: String, provider: String) -> Self {
        Self {
            id,
            node_count,
            location,
            provider,
            status: ForestStatus::Provisioning,
            created_at: Utc::now(),
        }
    }
}

/// Forest ID is opaque but has a fixed, documented shape: `forest-<unix-seconds>`.
pub fn forest_id(unix_seconds: i64) -> String {
    format!("forest-{unix_seconds}")
}

// ─── Node ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Edge,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edge => write!(f, "edge"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = MorpheusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edge" => Ok(Self::Edge),
            other => Err(MorpheusError::InvalidRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Provisioning,
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub forest_id: String,
    pub role: NodeRole,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    pub location: String,
    pub status: NodeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Node {
    /// Display name per spec §3: `<forest-id>-node-<i>`.
    pub fn display_name(forest_id: &str, index: u32) -> String {
        format!("{forest_id}-node-{index}")
    }

    /// Exactly one of ipv4/ipv6 should be set on a successfully provisioned node.
    pub fn has_single_address(&self) -> bool {
        !self.ipv4.is_empty() ^ !self.ipv6.is_empty()
    }
}

// ─── SSH key ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SSHKeyHandle {
    pub name: String,
    /// MD5 fingerprint, 32 hex digits in 16 colon-separated pairs.
    pub fingerprint: String,
}

// ─── DNS ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    A,
    AAAA,
    NS,
    MX,
    TXT,
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::AAAA => "AAAA",
            Self::NS => "NS",
            Self::MX => "MX",
            Self::TXT => "TXT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNSRecord {
    pub zone: String,
    pub name: String,
    pub record_type: DnsRecordType,
    pub value: String,
    pub ttl: u32,
}

pub const DEFAULT_ZONE_TTL: u32 = 86_400;
pub const DEFAULT_RECORD_TTL: u32 = 300;

// ─── Registry snapshot ────────────────────────────────────────────────────────

/// The entire persisted state. Ordered maps give deterministic JSON output
/// across runs, which matters for diffing the registry file in tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub forests: BTreeMap<String, Forest>,
    pub nodes: BTreeMap<String, Node>,
}

// ─── Validation ───────────────────────────────────────────────────────────────

pub fn validate_forest_id(id: &str) -> bool {
    !id.is_empty() && id.starts_with("forest-") && id.len() <= 64
}

pub fn validate_node_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

// ─── Error taxonomy (spec §7) ─────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MorpheusError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    #[error("capacity unavailable for {server_type} in {location}")]
    CapacityUnavailable { server_type: String, location: String },

    #[error("server type unknown: {0}")]
    ServerTypeUnknown(String),

    #[error("SSH key fingerprint mismatch: expected {expected}, provider has {actual}")]
    SSHKeyFingerprintMismatch { expected: String, actual: String },

    #[error("no reachable address for node {0}")]
    NoReachableAddress(String),

    #[error("SSH timeout waiting for {address}: {kind}")]
    SSHTimeout { address: String, kind: String },

    #[error("DNS operation failed: {0}")]
    DNSFailure(String),

    #[error("registry I/O failed: {0}")]
    RegistryIO(String),

    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl MorpheusError {
    /// Map an error kind to the CLI exit code convention from spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for MorpheusError {
    fn from(e: std::io::Error) -> Self {
        Self::RegistryIO(e.to_string())
    }
}

impl From<serde_json::Error> for MorpheusError {
    fn from(e: serde_json::Error) -> Self {
        Self::RegistryIO(e.to_string())
    }
}

pub type MorpheusResult<T> = Result<T, MorpheusError>;
