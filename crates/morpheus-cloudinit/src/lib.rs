//! Pure-function cloud-init renderer.
//!
//! No network calls, no filesystem access: given a [`NodeIdentity`], produce
//! the exact bootstrap document a node will run on first boot. Same input,
//! same bytes, every time.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use morpheus_core::{MorpheusError, MorpheusResult, NodeRole};

/// Everything the renderer needs to know about one node.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub forest_id: String,
    pub role: NodeRole,
    pub provisioned_at: DateTime<Utc>,
    pub registry_url: String,
    pub callback_url: String,
}

const FIREWALL_PORTS: [u16; 5] = [22, 4222, 6222, 8222, 7777];

/// Renders the cloud-init document for `node`. Fails only if the role is
/// not one this renderer knows how to bootstrap.
pub fn render(node: &NodeIdentity) -> MorpheusResult<String> {
    let role_str = match node.role {
        NodeRole::Edge => "edge",
        #[allow(unreachable_patterns)]
        _ => return Err(MorpheusError::InvalidRole(node.role.to_string())),
    };

    let ufw_rules: String = FIREWALL_PORTS
        .iter()
        .map(|p| format!("ufw allow {p}/tcp\n"))
        .collect();

    let callback_block = if node.callback_url.is_empty() {
        String::new()
    } else {
        format!(
            r#"curl -fsSL -X POST "{url}" -H "Content-Type: application/json" -d @/etc/morpheus/node-info.json || true
"#,
            url = node.callback_url
        )
    };

    let doc = format!(
        r#"#!/bin/bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
apt-get update -qq
apt-get install -y -qq curl ufw ca-certificates
{ufw_rules}ufw --force enable
mkdir -p /opt/nimsforest /var/lib/nimsforest /etc/morpheus
cat > /etc/morpheus/node-info.json << 'NODE_INFO_EOF'
{{
  "forest_id": "{forest_id}",
  "role": "{role_str}",
  "provisioner": "morpheus",
  "provisioned_at": "{provisioned_at}",
  "registry_url": "{registry_url}",
  "callback_url": "{callback_url}"
}}
NODE_INFO_EOF
{callback_block}"#,
        ufw_rules = ufw_rules,
        forest_id = node.forest_id,
        role_str = role_str,
        provisioned_at = node.provisioned_at.to_rfc3339(),
        registry_url = node.registry_url,
        callback_url = node.callback_url,
        callback_block = callback_block,
    );

    Ok(doc)
}
