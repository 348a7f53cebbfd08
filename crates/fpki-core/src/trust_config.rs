//! Trust-preference configuration (spec §4.4/§4.5), loaded once at
//! `Engine::init` time and held for the life of the engine. Grounded in
//! `LegacyTrustPreference`/`LegacyTrustInfo` (`validation_legacy.go`) and
//! `PolicyTrustPreference` (`validation_policy.go`), expressed here as a
//! `serde`-deserializable config the way `caclient.rs`'s `Config` struct is
//! built from the host-supplied JSON.

use crate::hash::Hash32;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("malformed trust configuration JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("root_trust_levels entry {0:?} is not a valid base64 Hash32")]
	BadRootHash(String),
}

/// How much a legacy (non-F-PKI) trust root is trusted, keyed by its
/// identity hash (`H_id`). Mirrors `LegacyTrustInfo`: an absent root
/// defaults to `TrustLevel::default()` rather than being rejected outright
/// — legacy validation only blocks on explicit constraint violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrustLevel(pub u8);

impl Default for TrustLevel {
	fn default() -> Self {
		TrustLevel(0)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct LegacyTrustPreferenceWire {
	#[serde(default)]
	root_trust_levels: HashMap<String, u8>,
	/// Same-key fallback (spec §4.4): when the issuing key reappears under
	/// a new subject, allow it to keep serving at its prior trust level
	/// instead of dropping to the default for the "new" root.
	#[serde(default = "default_true")]
	allow_same_key_fallback: bool,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Default)]
pub struct LegacyTrustPreference {
	pub root_trust_levels: HashMap<Hash32, TrustLevel>,
	pub allow_same_key_fallback: bool,
}

impl LegacyTrustPreference {
	pub fn trust_level_for(&self, root_identity_hash: Hash32) -> TrustLevel {
		self
			.root_trust_levels
			.get(&root_identity_hash)
			.copied()
			.unwrap_or_default()
	}
}

/// Attributes that may legitimately conflict between a policy chain and a
/// legacy chain for the same domain without invalidating the policy result
/// (spec §4.5); anything not named here is treated as a hard conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictingPolicyAttribute {
	TrustedCa,
	AllowedSubdomains,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PolicyTrustPreferenceWire {
	#[serde(default)]
	tolerated_conflicts: Vec<ConflictingPolicyAttribute>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyTrustPreference {
	pub tolerated_conflicts: Vec<ConflictingPolicyAttribute>,
}

impl PolicyTrustPreference {
	pub fn tolerates(&self, attr: ConflictingPolicyAttribute) -> bool {
		self.tolerated_conflicts.contains(&attr)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct TrustConfigWire {
	#[serde(default)]
	legacy: LegacyTrustPreferenceWire,
	#[serde(default)]
	policy: PolicyTrustPreferenceWire,
}

impl Default for LegacyTrustPreferenceWire {
	fn default() -> Self {
		Self {
			root_trust_levels: HashMap::new(),
			allow_same_key_fallback: true,
		}
	}
}

impl Default for PolicyTrustPreferenceWire {
	fn default() -> Self {
		Self { tolerated_conflicts: Vec::new() }
	}
}

#[derive(Debug, Clone, Default)]
pub struct TrustConfig {
	pub legacy: LegacyTrustPreference,
	pub policy: PolicyTrustPreference,
}

impl TrustConfig {
	pub fn load(bytes: &[u8]) -> Result<Self, Error> {
		let wire: TrustConfigWire = serde_json::from_slice(bytes)?;
		let mut root_trust_levels = HashMap::new();
		for (k, v) in wire.legacy.root_trust_levels {
			let hash = Hash32::from_base64(&k).map_err(|_| Error::BadRootHash(k.clone()))?;
			root_trust_levels.insert(hash, TrustLevel(v));
		}
		Ok(TrustConfig {
			legacy: LegacyTrustPreference {
				root_trust_levels,
				allow_same_key_fallback: wire.legacy.allow_same_key_fallback,
			},
			policy: PolicyTrustPreference {
				tolerated_conflicts: wire.policy.tolerated_conflicts,
			},
		})
	}

	pub fn empty() -> Self {
		Self::default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_defaults_to_trust_level_zero() {
		let cfg = TrustConfig::empty();
		assert_eq!(cfg.legacy.trust_level_for(Hash32::of_nil()), TrustLevel(0));
	}

	#[test]
	fn loads_root_trust_levels_keyed_by_base64_hash() {
		let hash = Hash32::from_bytes([3u8; 32]);
		let json = serde_json::json!({
			"legacy": {"root_trust_levels": {hash.to_base64(): 5}},
			"policy": {}
		});
		let cfg = TrustConfig::load(&serde_json::to_vec(&json).unwrap()).unwrap();
		assert_eq!(cfg.legacy.trust_level_for(hash), TrustLevel(5));
	}

	#[test]
	fn bad_base64_key_is_rejected() {
		let json = serde_json::json!({"legacy": {"root_trust_levels": {"not-base64!!": 1}}});
		assert!(TrustConfig::load(&serde_json::to_vec(&json).unwrap()).is_err());
	}
}
