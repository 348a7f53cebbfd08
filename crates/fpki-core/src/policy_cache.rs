//! Policy-certificate cache (component P, spec §4.2): ingestion of P-nodes
//! into immutable-fields classes, and the min-max "newest chain" selection
//! used by the policy trust evaluator.

use crate::hash::Hash32;
use crate::policy::{self, PolicyNode};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

const MAX_CHAIN_DEPTH: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("malformed policy certificate: {0}")]
	Parse(#[from] policy::ParseError),
}

/// A fully resolved policy chain from a domain's P-node up to a root
/// (immutable_issuer_hash == nil).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyChain {
	/// Content hashes, leaf first, root last.
	pub members: Vec<Hash32>,
	/// `min` over the chain of each member's `latest_timestamp()` — the
	/// chain's weakest attestation. Used to rank competing chains for the
	/// same domain (spec §4.2's min-max rule).
	pub bottleneck_timestamp: i64,
}

#[derive(Default)]
pub struct PolicyCache {
	/// Keyed by content hash (`H(JSON(policy))`).
	content: HashMap<Hash32, PolicyNode>,
	/// Immutable-fields class -> member content hashes sharing that `H_im`.
	immutable_classes: HashMap<Hash32, BTreeSet<Hash32>>,
	/// Domain -> content hashes of P-nodes naming that exact domain.
	domain_index: HashMap<String, Vec<Hash32>>,
}

impl PolicyCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn missing_policy_hashes(&self, wanted: &[Hash32]) -> Vec<Hash32> {
		wanted
			.iter()
			.copied()
			.filter(|h| !self.content.contains_key(h))
			.collect()
	}

	pub fn contains(&self, hash: Hash32) -> bool {
		self.content.contains_key(&hash)
	}

	/// Ingest a batch of JSON-encoded policy certificates. Returns the
	/// content hashes that were newly admitted. Mirrors `cert_cache`'s
	/// same-bag-then-cached-parent resolution (spec §4.1/§4.2 share the
	/// ingestion shape), but the parent pointer is `immutable_issuer_hash`
	/// rather than an X.509 issuer/AKI pair, and there is no expiry concept
	/// — a policy that fails parent-constraint checking is simply not
	/// admitted; it is never placed in a permanent ignore-list, since a
	/// later-delivered differently-shaped parent could still validate it.
	pub fn add_policies(&mut self, raw: Vec<Vec<u8>>) -> Vec<Hash32> {
		let mut bag = HashMap::new();
		for bytes in raw {
			match policy::parse(&bytes) {
				Ok(node) => {
					bag.insert(node.content_hash, node);
				}
				Err(e) => warn!(error = %e, "dropping malformed policy certificate"),
			}
		}

		let hashes: Vec<Hash32> = bag.keys().copied().collect();
		let mut admitted = Vec::new();
		for hash in hashes {
			if self.try_insert(hash, &bag, &mut BTreeSet::new(), 0) {
				admitted.push(hash);
			}
		}
		admitted
	}

	fn try_insert(
		&mut self,
		hash: Hash32,
		bag: &HashMap<Hash32, PolicyNode>,
		visiting: &mut BTreeSet<Hash32>,
		depth: usize,
	) -> bool {
		if self.content.contains_key(&hash) {
			return false;
		}
		if depth >= MAX_CHAIN_DEPTH || visiting.contains(&hash) {
			return false;
		}
		let Some(node) = bag.get(&hash).cloned() else {
			return false;
		};

		if node.immutable_issuer_hash == Hash32::of_nil() {
			self.admit(PolicyNode { trust_root: true, ..node });
			return true;
		}

		visiting.insert(hash);

		// Parent already cached: validate directly against its class.
		if let Some(members) = self.immutable_classes.get(&node.immutable_issuer_hash) {
			let any_parent_hash = *members.iter().next().expect("non-empty class");
			let parent_domain = self.content[&any_parent_hash].domain().to_string();
			visiting.remove(&hash);
			return if is_same_or_subdomain(node.domain(), &parent_domain) {
				self.admit(node);
				true
			} else {
				false
			};
		}

		// Parent delivered in the same batch: resolve it first.
		if let Some((&parent_hash, parent)) = bag
			.iter()
			.find(|(_, n)| n.immutable_hash == node.immutable_issuer_hash)
		{
			let parent_domain = parent.domain().to_string();
			let parent_admitted = self.try_insert(parent_hash, bag, visiting, depth + 1);
			visiting.remove(&hash);
			if !parent_admitted && !self.content.contains_key(&parent_hash) {
				return false;
			}
			return if is_same_or_subdomain(node.domain(), &parent_domain) {
				self.admit(node);
				true
			} else {
				false
			};
		}

		visiting.remove(&hash);
		false
	}

	fn admit(&mut self, node: PolicyNode) {
		self
			.immutable_classes
			.entry(node.immutable_hash)
			.or_default()
			.insert(node.content_hash);
		self
			.domain_index
			.entry(node.domain().to_string())
			.or_default()
			.push(node.content_hash);
		self.content.insert(node.content_hash, node);
	}

	/// All chains rooted at a P-node naming `domain` exactly, newest-first
	/// by `bottleneck_timestamp`.
	pub fn chains_for_domain(&self, domain: &str) -> Vec<PolicyChain> {
		let mut chains: Vec<PolicyChain> = self
			.domain_index
			.get(domain)
			.into_iter()
			.flatten()
			.filter_map(|&leaf| self.build_chain(leaf))
			.collect();
		chains.sort_by(|a, b| b.bottleneck_timestamp.cmp(&a.bottleneck_timestamp));
		chains
	}

	/// The single newest chain for `domain`, applying the min-max rule: at
	/// each level pick the freshest member of that immutable-fields class,
	/// then across distinct leaf lineages prefer the chain whose weakest
	/// (oldest) member is newest (spec §4.2).
	pub fn newest_chain(&self, domain: &str) -> Option<PolicyChain> {
		self.chains_for_domain(domain).into_iter().next()
	}

	fn build_chain(&self, leaf: Hash32) -> Option<PolicyChain> {
		let mut members = Vec::new();
		let mut bottleneck = i64::MAX;
		let mut current = leaf;
		let mut depth = 0;
		loop {
			if depth >= MAX_CHAIN_DEPTH {
				return None;
			}
			let node = self.content.get(&current)?;
			bottleneck = bottleneck.min(node.latest_timestamp());
			members.push(current);
			if node.trust_root {
				break;
			}
			let class = self.immutable_classes.get(&node.immutable_issuer_hash)?;
			current = *class
				.iter()
				.max_by_key(|h| self.content[h].latest_timestamp())
				.expect("non-empty class");
			depth += 1;
		}
		Some(PolicyChain {
			members,
			bottleneck_timestamp: bottleneck,
		})
	}

	pub fn node(&self, hash: Hash32) -> Option<&PolicyNode> {
		self.content.get(&hash)
	}
}

/// `child == parent || child` ends in `.parent` (spec §4.2's subdomain
/// containment rule for AllowedSubdomains/TrustedCA inheritance).
pub fn is_same_or_subdomain(child: &str, parent: &str) -> bool {
	child == parent || child.ends_with(&format!(".{parent}"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn policy_json(domain: &str, issuer_hash: Vec<u8>, timestamp: i64) -> Vec<u8> {
		serde_json::to_vec(&json!({
			"domain": domain,
			"policy_attributes": {"trusted_ca": [], "allowed_subdomains": []},
			"timestamp": timestamp,
			"spcts": [],
			"issuer_hash": issuer_hash,
			"signature": [1, 2, 3],
		}))
		.unwrap()
	}

	fn immutable_hash_of(bytes: &[u8]) -> Hash32 {
		policy::parse(bytes).unwrap().immutable_hash
	}

	#[test]
	fn root_policy_has_empty_issuer_hash_and_is_admitted() {
		let mut cache = PolicyCache::new();
		let root = policy_json("com", vec![], 100);
		let admitted = cache.add_policies(vec![root]);
		assert_eq!(admitted.len(), 1);
		assert!(cache.node(admitted[0]).unwrap().trust_root);
	}

	#[test]
	fn child_must_be_same_or_subdomain_of_parent() {
		let mut cache = PolicyCache::new();
		let root = policy_json("example.com", vec![], 100);
		let root_im = immutable_hash_of(&root);
		cache.add_policies(vec![root]);

		let good_child = policy_json("sub.example.com", root_im.as_bytes().to_vec(), 200);
		let bad_child = policy_json("other.org", root_im.as_bytes().to_vec(), 200);

		let admitted = cache.add_policies(vec![good_child, bad_child]);
		assert_eq!(admitted.len(), 1);
		assert_eq!(cache.node(admitted[0]).unwrap().domain(), "sub.example.com");
	}

	#[test]
	fn newest_chain_picks_bottleneck_max_across_lineages() {
		let mut cache = PolicyCache::new();
		let root_old = policy_json("example.com", vec![], 10);
		let root_old_im = immutable_hash_of(&root_old);
		let root_new = policy_json("example.com", vec![], 9000);
		let root_new_im = immutable_hash_of(&root_new);
		cache.add_policies(vec![root_old, root_new]);

		let child_of_old = policy_json("sub.example.com", root_old_im.as_bytes().to_vec(), 20);
		let child_of_new = policy_json("sub.example.com", root_new_im.as_bytes().to_vec(), 9500);
		cache.add_policies(vec![child_of_old, child_of_new]);

		let chain = cache.newest_chain("sub.example.com").expect("chain exists");
		// bottleneck of the old-root lineage is 10; of the new-root lineage is 9000.
		assert_eq!(chain.bottleneck_timestamp, 9000);
	}

	#[test]
	fn missing_policy_hashes_excludes_already_cached() {
		let mut cache = PolicyCache::new();
		let root = policy_json("example.com", vec![], 100);
		let root_hash = policy::parse(&root).unwrap().content_hash;
		cache.add_policies(vec![root]);

		let other = Hash32::from_bytes([7u8; 32]);
		let missing = cache.missing_policy_hashes(&[root_hash, other]);
		assert_eq!(missing, vec![other]);
	}
}
