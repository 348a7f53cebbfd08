//! Certificate cache (component C, spec §4.1): content/identity/DNS
//! indices over C-nodes, plus chain enumeration to locally trusted roots.

use crate::cert::{self, CertNode, RejectReason};
use crate::dns::wildcard_lookup_keys;
use crate::hash::Hash32;
use rustls_pki_types::CertificateDer;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Chains are never walked past this many hops, defensively bounding
/// pathological or cyclic input (spec §5/§9).
const MAX_CHAIN_DEPTH: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("reading trust root directory {path}: {source}")]
	TrustStoreIo {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("parsing trust root file {path}: {source}")]
	TrustStoreParse {
		path: String,
		#[source]
		source: cert::ParseError,
	},
}

/// One buildable path from a leaf to a trust root (spec §4.1), leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
	pub certs: Vec<Hash32>,
	pub constraints_apply: bool,
}

#[derive(Default)]
pub struct CertCache {
	content: HashMap<Hash32, CertNode>,
	/// `H_id -> {H_c}` (spec I1): all content hashes sharing an identity.
	identity_buckets: HashMap<Hash32, BTreeSet<Hash32>>,
	dns_index: HashMap<String, Vec<Hash32>>,
	ignored: HashSet<Hash32>,
}

impl CertCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Load every PEM-encoded certificate in `trust_root_dir` and install it
	/// as a trust-root C-node. Duplicates are idempotent.
	pub fn initialize(&mut self, trust_root_dir: &Path) -> Result<usize, Error> {
		let mut count = 0;
		let entries = std::fs::read_dir(trust_root_dir).map_err(|source| Error::TrustStoreIo {
			path: trust_root_dir.display().to_string(),
			source,
		})?;
		for entry in entries {
			let entry = entry.map_err(|source| Error::TrustStoreIo {
				path: trust_root_dir.display().to_string(),
				source,
			})?;
			let path = entry.path();
			let bytes = std::fs::read(&path).map_err(|source| Error::TrustStoreIo {
				path: path.display().to_string(),
				source,
			})?;
			let mut reader = std::io::BufReader::new(bytes.as_slice());
			for der in rustls_pemfile::certs(&mut reader) {
				let der = der.map_err(|source| Error::TrustStoreIo {
					path: path.display().to_string(),
					source,
				})?;
				let mut node = cert::parse(der).map_err(|source| Error::TrustStoreParse {
					path: path.display().to_string(),
					source,
				})?;
				node.trust_root = true;
				if !self.content.contains_key(&node.content_hash) {
					self.insert_node(node);
					count += 1;
				}
			}
		}
		Ok(count)
	}

	pub fn missing_content_hashes(&self, hashes: &[Hash32]) -> Vec<Hash32> {
		hashes
			.iter()
			.copied()
			.filter(|h| !self.content.contains_key(h) && !self.ignored.contains(h))
			.collect()
	}

	pub fn is_ignored(&self, hash: &Hash32) -> bool {
		self.ignored.contains(hash)
	}

	pub fn contains(&self, hash: &Hash32) -> bool {
		self.content.contains_key(hash)
	}

	/// Ingest a bag of certificates in any order (spec §4.1): for each
	/// certificate, recursively try its same-bag parent first, then fall
	/// back to whatever is already cached. Returns the hashes that ended up
	/// cached or ignored as a result of this call (processed, not
	/// necessarily newly added).
	pub fn add_certificates(&mut self, certs: Vec<CertificateDer<'static>>) -> Vec<Hash32> {
		let mut bag: HashMap<Hash32, CertNode> = HashMap::new();
		for der in certs {
			match cert::parse(der) {
				Ok(node) => {
					bag.insert(node.content_hash, node);
				},
				Err(e) => warn!(error = %e, "dropping malformed certificate"),
			}
		}
		let bag_hashes: Vec<Hash32> = bag.keys().copied().collect();
		let mut processed = Vec::with_capacity(bag_hashes.len());
		let mut visiting = HashSet::new();
		for hash in bag_hashes {
			self.try_insert(hash, &bag, &mut visiting, 0);
			processed.push(hash);
		}
		processed
	}

	/// Attempt to admit `hash` (a member of `bag`) into the cache,
	/// recursing into its same-bag parent first. Returns whether `hash` is
	/// cached after the call returns.
	fn try_insert(
		&mut self,
		hash: Hash32,
		bag: &HashMap<Hash32, CertNode>,
		visiting: &mut HashSet<Hash32>,
		depth: usize,
	) -> bool {
		if self.content.contains_key(&hash) {
			return true;
		}
		if self.ignored.contains(&hash) || depth > MAX_CHAIN_DEPTH || !visiting.insert(hash) {
			return false;
		}
		let Some(node) = bag.get(&hash) else {
			return false;
		};

		// Self-signed reissue of an already-trusted root (spec I2).
		if node.subject == node.issuer {
			if let Some(bucket) = self.identity_buckets.get(&node.identity_hash) {
				if bucket.iter().any(|h| self.content[h].trust_root) {
					return self.admit_as_root(node.clone());
				}
			}
		}

		// Recurse into a same-bag parent, if one exists, before falling
		// back to the cache's own identity buckets.
		if let Some(parent_hash) = bag
			.values()
			.find(|candidate| candidate.identity_hash == node.issuer_hash)
			.map(|candidate| candidate.content_hash)
		{
			self.try_insert(parent_hash, bag, visiting, depth + 1);
		}

		self.admit_non_root(node.clone())
	}

	fn admit_as_root(&mut self, mut node: CertNode) -> bool {
		node.trust_root = true;
		match cert::check_validity(&node, SystemTime::now()) {
			Ok(()) => {
				self.insert_node(node);
				true
			},
			Err(RejectReason::Expired) => {
				debug!(hash = %node.content_hash, "ignoring expired re-issued root");
				self.ignored.insert(node.content_hash);
				false
			},
			Err(_) => false,
		}
	}

	/// Try to admit a non-root certificate against whatever parent is
	/// already cached under its issuer identity bucket (spec I3).
	fn admit_non_root(&mut self, node: CertNode) -> bool {
		let Some(parent_hash) = self
			.identity_buckets
			.get(&node.issuer_hash)
			.and_then(|bucket| bucket.iter().next())
			.copied()
		else {
			return false;
		};
		let parent_der = self.content[&parent_hash].der.clone();
		if !cert::verifies_signature(&node.der, &parent_der) {
			debug!(subject = %node.subject, "signature does not verify against candidate parent");
			return false;
		}
		match cert::check_validity(&node, SystemTime::now()) {
			Ok(()) => {
				self.insert_node(node);
				true
			},
			Err(RejectReason::Expired) => {
				debug!(hash = %node.content_hash, "ignoring expired certificate");
				self.ignored.insert(node.content_hash);
				false
			},
			Err(reason) => {
				debug!(?reason, subject = %node.subject, "rejecting certificate");
				false
			},
		}
	}

	pub(crate) fn insert_node(&mut self, node: CertNode) {
		let hash = node.content_hash;
		self
			.identity_buckets
			.entry(node.identity_hash)
			.or_default()
			.insert(hash);
		if !node.is_ca {
			for name in &node.dns_names {
				self.dns_index.entry(name.clone()).or_default().push(hash);
			}
		}
		self.content.insert(hash, node);
	}

	/// Enumerate every chain from a leaf matching `name` (direct or one
	/// wildcard label) up to a trust root (spec §4.1).
	pub fn chains_for_domain(&self, name: &str) -> Vec<ChainInfo> {
		let mut leaves: Vec<Hash32> = Vec::new();
		for key in wildcard_lookup_keys(name) {
			if let Some(hashes) = self.dns_index.get(&key) {
				leaves.extend(hashes.iter().copied());
			}
		}
		leaves.sort();
		leaves.dedup();

		let mut chains = Vec::new();
		for leaf in leaves {
			self.enumerate_chains(leaf, Vec::new(), false, 0, &mut chains);
		}
		chains
	}

	fn enumerate_chains(
		&self,
		hash: Hash32,
		mut prefix: Vec<Hash32>,
		mut constraints_apply: bool,
		depth: usize,
		out: &mut Vec<ChainInfo>,
	) {
		if depth > MAX_CHAIN_DEPTH {
			return;
		}
		let Some(node) = self.content.get(&hash) else {
			return;
		};
		prefix.push(hash);
		constraints_apply |= node.constraints_apply;

		if node.trust_root {
			out.push(ChainInfo {
				certs: prefix,
				constraints_apply,
			});
			return;
		}

		let Some(parents) = self.identity_buckets.get(&node.issuer_hash) else {
			return;
		};
		for &parent in parents {
			self.enumerate_chains(parent, prefix.clone(), constraints_apply, depth + 1, out);
		}
	}

	pub fn node(&self, hash: &Hash32) -> Option<&CertNode> {
		self.content.get(hash)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rcgen::{CertificateParams, KeyPair, SanType};

	struct TestChain {
		root_der: CertificateDer<'static>,
		intermediate_der: CertificateDer<'static>,
		leaf_der: CertificateDer<'static>,
	}

	fn build_chain(dns_name: &str) -> TestChain {
		let root_key = KeyPair::generate().unwrap();
		let mut root_params = CertificateParams::new(vec![]).unwrap();
		root_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		let root_cert = root_params.self_signed(&root_key).unwrap();

		let int_key = KeyPair::generate().unwrap();
		let mut int_params = CertificateParams::new(vec![]).unwrap();
		int_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		int_params
			.distinguished_name
			.push(rcgen::DnType::CommonName, "intmCA1");
		let int_cert = int_params
			.signed_by(&int_key, &root_cert, &root_key)
			.unwrap();

		let leaf_key = KeyPair::generate().unwrap();
		let mut leaf_params = CertificateParams::new(vec![]).unwrap();
		leaf_params.subject_alt_names = vec![SanType::DnsName(dns_name.try_into().unwrap())];
		let leaf_cert = leaf_params.signed_by(&leaf_key, &int_cert, &int_key).unwrap();

		TestChain {
			root_der: root_cert.der().clone(),
			intermediate_der: int_cert.der().clone(),
			leaf_der: leaf_cert.der().clone(),
		}
	}

	fn install_root(cache: &mut CertCache, root_der: CertificateDer<'static>) {
		let mut node = cert::parse(root_der).unwrap();
		node.trust_root = true;
		cache.insert_node(node);
	}

	#[test]
	fn single_chain() {
		let chain = build_chain("leaf1.example.com");
		let mut cache = CertCache::new();
		install_root(&mut cache, chain.root_der);
		cache.add_certificates(vec![chain.leaf_der, chain.intermediate_der]);

		let chains = cache.chains_for_domain("leaf1.example.com");
		assert_eq!(chains.len(), 1);
		assert_eq!(chains[0].certs.len(), 3);
	}

	#[test]
	fn parent_reuse_across_two_leaves() {
		let root_key = KeyPair::generate().unwrap();
		let mut root_params = CertificateParams::new(vec![]).unwrap();
		root_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		let root_cert = root_params.self_signed(&root_key).unwrap();

		let int_key = KeyPair::generate().unwrap();
		let mut int_params = CertificateParams::new(vec![]).unwrap();
		int_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		let int_cert = int_params.signed_by(&int_key, &root_cert, &root_key).unwrap();

		let mut leaf1_params = CertificateParams::new(vec![]).unwrap();
		leaf1_params.subject_alt_names =
			vec![SanType::DnsName("leaf1.example.com".try_into().unwrap())];
		let leaf1_cert = leaf1_params
			.signed_by(&KeyPair::generate().unwrap(), &int_cert, &int_key)
			.unwrap();

		let mut leaf2_params = CertificateParams::new(vec![]).unwrap();
		leaf2_params.subject_alt_names =
			vec![SanType::DnsName("leaf2.example.com".try_into().unwrap())];
		let leaf2_cert = leaf2_params
			.signed_by(&KeyPair::generate().unwrap(), &int_cert, &int_key)
			.unwrap();

		let mut cache = CertCache::new();
		install_root(&mut cache, root_cert.der().clone());
		cache.add_certificates(vec![leaf1_cert.der().clone(), int_cert.der().clone()]);
		let nodes_after_first_leaf = cache.content.len();

		cache.add_certificates(vec![leaf2_cert.der().clone()]);
		// Only leaf2 should be newly added; the intermediate is reused, not re-admitted.
		assert_eq!(cache.content.len(), nodes_after_first_leaf + 1);

		let chains2 = cache.chains_for_domain("leaf2.example.com");
		assert_eq!(chains2.len(), 1);
		assert_eq!(chains2[0].certs.len(), 3);
	}

	#[test]
	fn missing_hashes_excludes_cached_and_ignored() {
		let chain = build_chain("leaf1.example.com");
		let mut cache = CertCache::new();
		install_root(&mut cache, chain.root_der);
		let leaf_node = cert::parse(chain.leaf_der.clone()).unwrap();
		cache.add_certificates(vec![chain.leaf_der, chain.intermediate_der]);

		let missing = cache.missing_content_hashes(&[leaf_node.content_hash]);
		assert!(missing.is_empty());
	}

	/// Ingestion must be insensitive to insertion order (spec §8): a bag of
	/// certs split and fed to `add_certificates` in any permutation ends up
	/// with the same chain for the leaf.
	#[test]
	fn chain_resolution_is_insensitive_to_insertion_order() {
		use itertools::Itertools;

		let chain = build_chain("leaf1.example.com");
		let certs = vec![chain.leaf_der, chain.intermediate_der];

		for ordering in certs.into_iter().permutations(2) {
			let mut cache = CertCache::new();
			install_root(&mut cache, chain.root_der.clone());
			cache.add_certificates(ordering);
			let chains = cache.chains_for_domain("leaf1.example.com");
			assert_eq!(chains.len(), 1);
			assert_eq!(chains[0].certs.len(), 3);
		}
	}
}
