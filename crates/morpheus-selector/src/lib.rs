//! Fallback selector (C5): walks a server-type x location matrix.
//!
//! Generalizes `claw_provision::ProviderRegistry::select_provider`'s
//! preference-then-fallback walk (there: provider-then-region; here:
//! server-type-then-location). Unlike that registry, which resolves to a
//! single `Option` up front, this produces the whole ordered stream of
//! pairs up front — the Provisioner consumes it incrementally, advancing
//! past `CapacityUnavailable` until one pair succeeds or the stream runs
//! dry.

#![forbid(unsafe_code)]

use morpheus_core::{MorpheusError, MorpheusResult};
use morpheus_hetzner::CloudProvider;
use tracing::debug;

/// Exhaustion of the candidate stream without a successful attempt.
#[derive(Debug, thiserror::Error)]
#[error("no capacity available after attempting {attempted:?}")]
pub struct NoCapacityError {
    pub attempted: Vec<(String, String)>,
}

/// Builds the ordered (server_type, location) candidate stream.
///
/// Unknown server types are discarded; if every candidate is unknown,
/// fails fatally with `ServerTypeUnknown` rather than returning an empty
/// stream (per spec.md §7: "fatal only if all candidates unknown").
pub async fn build_pairs(
    provider: &dyn CloudProvider,
    preferred_types: &[String],
    preferred_locations: &[String],
) -> MorpheusResult<Vec<(String, String)>> {
    let mut valid_types = Vec::new();
    let mut unknown_types = Vec::new();
    for server_type in preferred_types {
        if provider.validate_server_type(server_type).await? {
            valid_types.push(server_type.clone());
        } else {
            unknown_types.push(server_type.clone());
        }
    }

    if valid_types.is_empty() {
        return Err(MorpheusError::ServerTypeUnknown(unknown_types.join(", ")));
    }

    let mut pairs = Vec::new();
    for server_type in &valid_types {
        let available = provider.get_available_locations(server_type).await?;

        let mut ordered: Vec<String> = preferred_locations
            .iter()
            .filter(|loc| available.contains(loc))
            .cloned()
            .collect();
        for loc in &available {
            if !ordered.contains(loc) {
                ordered.push(loc.clone());
            }
        }

        for location in ordered {
            pairs.push((server_type.clone(), location));
        }
    }

    debug!(pair_count = pairs.len(), "built selector candidate stream");
    Ok(pairs)
}
