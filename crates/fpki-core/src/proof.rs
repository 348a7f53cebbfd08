//! Map-server proof cache (component M, spec §4.3): sparse-Merkle-tree
//! inclusion/non-inclusion proof verification against a registered map
//! server's signed tree head, plus the per-server misbehavior counter
//! (spec §5.6).
//!
//! Grounded in the bit-oriented recursive combinator of
//! `computeMHTBasedOnProof` and the leaf/root plumbing of `verifyLeaf` and
//! `VerifyProof` in the original cache. Unlike the original — whose root
//! signature check is an unimplemented TODO that always returns `false` —
//! this verifies the tree-head signature in full (spec §4.3 step 3).

use crate::hash::{Hash32, hash_bytes, hash_concat};
use aws_lc_rs::signature::{self, UnparsedPublicKey};
use std::collections::HashMap;

/// Tree depth: one bit of the 256-bit key per level.
const TREE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unknown map server id: {0}")]
	UnknownMapServer(String),
	#[error("proof has more siblings than the tree depth allows")]
	ProofTooLong,
}

/// A registered map server: its verification key and the running count of
/// proofs it has produced that failed to verify. The counter is purely
/// observational (spec §5.6) — it never gates trust decisions by itself.
#[derive(Debug, Clone)]
pub struct MapServerInfo {
	pub id: String,
	pub public_key: Vec<u8>,
	n_misbehaviors: u64,
}

impl MapServerInfo {
	pub fn new(id: impl Into<String>, public_key: Vec<u8>) -> Self {
		Self {
			id: id.into(),
			public_key,
			n_misbehaviors: 0,
		}
	}
}

/// A tree head signed by a map server over `(root, timestamp)`.
#[derive(Debug, Clone)]
pub struct SignedTreeHead {
	pub root: Hash32,
	pub timestamp: i64,
	pub signature: Vec<u8>,
}

impl SignedTreeHead {
	fn signed_bytes(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(40);
		buf.extend_from_slice(self.root.as_bytes());
		buf.extend_from_slice(&self.timestamp.to_be_bytes());
		buf
	}
}

/// Whether a response proves inclusion (PoP) or absence (PoA) of a domain
/// entry in the tree (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofType {
	Pop,
	Poa,
}

/// The map server's `DomainEntry` (spec §3/§4.3): the domain name the proof
/// is about, plus the sorted content/policy id sets the map server claims
/// to have observed for it. `proof_key` and `leaf_hash` are always derived
/// from this record, never taken from the wire as raw bytes — a map server
/// cannot make an unrelated proof "verify" for a domain/id-set it didn't
/// actually attest to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
	pub domain_name: String,
	pub cert_ids: Vec<Hash32>,
	pub policy_ids: Vec<Hash32>,
}

impl DomainEntry {
	/// `proof_key = SHA-256(DomainName)` (spec §4.3).
	fn proof_key(&self) -> Hash32 {
		hash_bytes(self.domain_name.as_bytes())
	}

	/// `leaf_hash = SHA-256(concat(sorted(CertIDs ∪ PolicyIDs)))`, sorted
	/// lexicographically over raw hash bytes (spec §4.3).
	pub fn leaf_hash(&self) -> Hash32 {
		let mut ids: Vec<Hash32> = self.cert_ids.iter().chain(self.policy_ids.iter()).copied().collect();
		ids.sort();
		ids.dedup();
		let parts: Vec<&[u8]> = ids.iter().map(|h| h.as_bytes().as_slice()).collect();
		hash_concat(&parts)
	}
}

/// A proof of inclusion or non-inclusion for one domain entry (spec §4.3).
/// `proof_value` is the map server's claimed leaf value: for a PoP it must
/// equal `domain.leaf_hash()`; a PoA carries `None` and requires an empty
/// id set instead.
#[derive(Debug, Clone)]
pub struct Poi {
	pub map_server_id: String,
	pub proof_type: ProofType,
	pub domain: DomainEntry,
	pub proof_value: Option<Hash32>,
	/// Sibling hashes, ordered leaf-to-root.
	pub siblings: Vec<Hash32>,
	pub sth: SignedTreeHead,
}

fn bit_is_set(key: &Hash32, index: usize) -> bool {
	let byte = key.as_bytes()[index / 8];
	let shift = 7 - (index % 8);
	(byte >> shift) & 1 == 1
}

fn combine(left: Hash32, right: Hash32) -> Hash32 {
	hash_concat(&[left.as_bytes(), right.as_bytes()])
}

/// `H(key || value)` for an occupied tree leaf, or the nil sentinel for an
/// absent one. Not to be confused with `DomainEntry::leaf_hash`, which
/// computes the *value* this function hashes together with the key.
fn tree_leaf_node(key: &Hash32, value: Option<Hash32>) -> Hash32 {
	match value {
		Some(v) => hash_concat(&[key.as_bytes(), v.as_bytes()]),
		None => Hash32::of_nil(),
	}
}

/// Recompute the tree root implied by `key`, `value` and `siblings`,
/// walking from the leaf's own depth up to the root and branching on each
/// bit of `key` (MSB first), matching `computeMHTBasedOnProof`.
fn compute_root(key: &Hash32, value: Option<Hash32>, siblings: &[Hash32]) -> Result<Hash32, Error> {
	if siblings.len() > TREE_DEPTH {
		return Err(Error::ProofTooLong);
	}
	let mut current = tree_leaf_node(key, value);
	// siblings[0] is the deepest sibling (closest to the leaf); level index
	// counts down from the leaf's depth to the root.
	let leaf_depth = siblings.len();
	for (i, sibling) in siblings.iter().enumerate() {
		let level = leaf_depth - 1 - i;
		current = if bit_is_set(key, level) {
			combine(*sibling, current)
		} else {
			combine(current, *sibling)
		};
	}
	Ok(current)
}

#[derive(Default)]
pub struct ProofCache {
	servers: HashMap<String, MapServerInfo>,
	/// Single-assignment cache keyed by `(map_server_id, proof_key,
	/// leaf_hash)` — the same triple spec §4.3 hashes together to form the
	/// proof-cache key — so re-verifying an already-evaluated response is
	/// pure waste, since its inputs are immutable once delivered.
	verified: HashMap<(String, Hash32, Hash32), bool>,
}

impl ProofCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_map_server(&mut self, info: MapServerInfo) {
		self.servers.insert(info.id.clone(), info);
	}

	pub fn misbehaviors(&self, map_server_id: &str) -> u64 {
		self.servers.get(map_server_id).map_or(0, |s| s.n_misbehaviors)
	}

	/// Verify `poi` (spec §4.3 steps 1-3, in order — any failure is
	/// terminal): leaf consistency, then the Merkle path, then the tree-head
	/// signature. Returns `Ok(true)` for a confirmed inclusion or
	/// non-inclusion proof, `Ok(false)` for one that fails any step, and
	/// `Err` for a usage error (unknown server, proof malformed beyond tree
	/// depth). Every `Ok(false)` counts as a misbehavior for the map server.
	pub fn verify(&mut self, poi: &Poi) -> Result<bool, Error> {
		let proof_key = poi.domain.proof_key();
		let leaf_hash = poi.domain.leaf_hash();
		let cache_key = (poi.map_server_id.clone(), proof_key, leaf_hash);
		if let Some(&cached) = self.verified.get(&cache_key) {
			return Ok(cached);
		}

		let server = self
			.servers
			.get_mut(&poi.map_server_id)
			.ok_or_else(|| Error::UnknownMapServer(poi.map_server_id.clone()))?;

		let mut reject = |server: &mut MapServerInfo, verified: &mut HashMap<(String, Hash32, Hash32), bool>| {
			server.n_misbehaviors += 1;
			verified.insert(cache_key.clone(), false);
			Ok(false)
		};

		// Step 1: leaf consistency.
		let leaf_consistent = match poi.proof_type {
			ProofType::Pop => poi.proof_value == Some(leaf_hash),
			ProofType::Poa => poi.domain.cert_ids.is_empty() && poi.domain.policy_ids.is_empty(),
		};
		if !leaf_consistent {
			return reject(server, &mut self.verified);
		}

		// Step 2: Merkle path, against the claimed leaf value (PoP) or
		// absence (PoA).
		let merkle_value = match poi.proof_type {
			ProofType::Pop => Some(leaf_hash),
			ProofType::Poa => None,
		};
		let computed_root = compute_root(&proof_key, merkle_value, &poi.siblings)?;
		if computed_root != poi.sth.root {
			return reject(server, &mut self.verified);
		}

		// Step 3: tree-head signature. Unknown map-server id was already
		// handled as a fatal error above.
		let key = UnparsedPublicKey::new(&signature::ED25519, &server.public_key);
		let ok = key.verify(&poi.sth.signed_bytes(), &poi.sth.signature).is_ok();
		if !ok {
			server.n_misbehaviors += 1;
		}
		self.verified.insert(cache_key, ok);
		Ok(ok)
	}
}
