//! Legacy trust evaluator (component L, spec §4.4): for a connection whose
//! presented chain has no applicable policy chain, decide success/failure
//! against the union of cached chains for the name and the configured
//! legacy trust preferences.
//!
//! Grounded in `ComputeChainTrustLevelForDomainAndParents`/
//! `ComputeChainTrustLevelForDomain` and `VerifyLegacy` in
//! `validation_legacy.go`. This crate's trust preferences are a flat
//! identity-hash -> trust-level map rather than the original's CA-subject-set
//! indirection (see DESIGN.md); a chain's level is still "the maximum
//! configured level among its non-leaf certificates", just without a CA-set
//! layer in between.

use crate::cert::{self, CertNode};
use crate::cert_cache::{CertCache, ChainInfo};
use crate::dns::wildcard_and_parent_domains;
use crate::hash::Hash32;
use crate::trust_config::{LegacyTrustPreference, TrustLevel};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationResult {
	Failure,
	Success,
}

impl EvaluationResult {
	pub fn as_u8(self) -> u8 {
		match self {
			EvaluationResult::Failure => 0,
			EvaluationResult::Success => 1,
		}
	}
}

/// One cached chain offered as evidence for a FAILURE verdict (spec §6):
/// its position in the evaluated max-level set, its certificate hashes and
/// subjects, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevantChain {
	pub chain_index: usize,
	pub certificate_hashes: Vec<Hash32>,
	pub subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyVerdict {
	pub dns_name: String,
	pub connection_trust_level: TrustLevel,
	pub evaluation_result: EvaluationResult,
	/// `L_H`: the highest trust level found among the cached chains that
	/// decided this verdict (post-prune, if a prune retry happened).
	pub highest_trust_level: TrustLevel,
	/// Populated only on FAILURE — the chains making up the max-level set
	/// `H` that the connection failed to clear or match by same-key.
	pub relevant_chains: Vec<RelevantChain>,
	pub max_validity: SystemTime,
}

/// All cached chains for `domain`, trying the domain itself and then its
/// wildcard/parent ancestors in order of specificity (spec §4.4), stopping
/// at the first ancestor with any cached chain.
fn gather_cached_chains(cache: &CertCache, domain: &str) -> Vec<ChainInfo> {
	for candidate in wildcard_and_parent_domains(domain) {
		let chains = cache.chains_for_domain(&candidate);
		if !chains.is_empty() {
			return chains;
		}
	}
	Vec::new()
}

/// Chain level (spec §4.4): the maximum configured trust level among the
/// chain's non-leaf certificates (index 0 is the leaf, leaf-first
/// convention per `ChainInfo`).
fn chain_level(cache: &CertCache, config: &LegacyTrustPreference, certs: &[Hash32]) -> TrustLevel {
	certs
		.iter()
		.skip(1)
		.filter_map(|h| cache.node(h))
		.map(|n| config.trust_level_for(n.identity_hash))
		.max()
		.unwrap_or_default()
}

fn connection_chain_level(config: &LegacyTrustPreference, chain: &[CertNode]) -> TrustLevel {
	chain
		.iter()
		.skip(1)
		.map(|n| config.trust_level_for(n.identity_hash))
		.max()
		.unwrap_or_default()
}

/// Partition `chains` by level; return the max-level subset `H` and `L_H`
/// (spec §4.4 step 2). An empty input yields an empty `H` at the default
/// level, so a domain with nothing cached imposes no floor at all.
fn partition_max_level(
	cache: &CertCache,
	config: &LegacyTrustPreference,
	chains: &[ChainInfo],
) -> (Vec<ChainInfo>, TrustLevel) {
	let levels: Vec<TrustLevel> = chains.iter().map(|c| chain_level(cache, config, &c.certs)).collect();
	let l_h = levels.iter().copied().max().unwrap_or_default();
	let h = chains
		.iter()
		.zip(levels)
		.filter(|(_, level)| *level == l_h)
		.map(|(c, _)| c.clone())
		.collect();
	(h, l_h)
}

/// Whether a cached chain still counts as currently valid (spec §4.4 step
/// 4): unconstrained chains always do; constrained ones need a
/// ServerAuth-capable leaf and every position to pass the RFC-5280
/// validity/constraint check. Any failure here (missing node, bad EKU,
/// expired) prunes the chain rather than aborting evaluation (spec §4.4
/// "Failure semantics").
fn chain_is_currently_valid(cache: &CertCache, chain: &ChainInfo, now: SystemTime) -> bool {
	if !chain.constraints_apply {
		return true;
	}
	let Some(leaf) = chain.certs.first().and_then(|h| cache.node(h)) else {
		return false;
	};
	if !leaf.server_auth {
		return false;
	}
	chain
		.certs
		.iter()
		.all(|h| cache.node(h).is_some_and(|n| cert::check_validity(n, now).is_ok()))
}

fn leaf_identity(cache: &CertCache, chain: &ChainInfo) -> Option<Hash32> {
	cache.node(chain.certs.first()?).map(|n| n.identity_hash)
}

/// Same-key fallback (spec §4.4 step 4): does any currently-valid chain in
/// `h` share its leaf's identity hash with the connection's leaf?
fn same_key_fallback_succeeds(
	cache: &CertCache,
	now: SystemTime,
	h: &[ChainInfo],
	connection_leaf_identity: Option<Hash32>,
) -> bool {
	let Some(conn_id) = connection_leaf_identity else {
		return false;
	};
	h
		.iter()
		.any(|chain| chain_is_currently_valid(cache, chain, now) && leaf_identity(cache, chain) == Some(conn_id))
}

fn relevant_chains(cache: &CertCache, h: &[ChainInfo]) -> Vec<RelevantChain> {
	h
		.iter()
		.enumerate()
		.map(|(chain_index, chain)| RelevantChain {
			chain_index,
			certificate_hashes: chain.certs.clone(),
			subjects: chain
				.certs
				.iter()
				.map(|hash| cache.node(hash).map(|n| n.subject.clone()).unwrap_or_default())
				.collect(),
		})
		.collect()
}

/// `min(now+10min, min over leaves in H of NotAfter)` (spec §4.4).
fn max_validity(cache: &CertCache, now: SystemTime, h: &[ChainInfo]) -> SystemTime {
	let cap = now + Duration::from_secs(600);
	h
		.iter()
		.filter_map(|c| c.certs.first().and_then(|hash| cache.node(hash)))
		.map(|n| n.not_after)
		.min()
		.map(|leaf_not_after| leaf_not_after.min(cap))
		.unwrap_or(cap)
}

fn verdict(
	domain: &str,
	connection_level: TrustLevel,
	result: EvaluationResult,
	l_h: TrustLevel,
	now: SystemTime,
	cache: &CertCache,
	h: &[ChainInfo],
) -> LegacyVerdict {
	LegacyVerdict {
		dns_name: domain.to_string(),
		connection_trust_level: connection_level,
		evaluation_result: result,
		highest_trust_level: l_h,
		relevant_chains: match result {
			EvaluationResult::Success => Vec::new(),
			EvaluationResult::Failure => relevant_chains(cache, h),
		},
		max_validity: max_validity(cache, now, h),
	}
}

/// Top-level legacy verification entry point (spec §4.4/§6): runs the full
/// 6-step algorithm against whatever chains are cached for `domain`, given
/// the chain the connection itself presented.
pub fn verify_legacy(
	cache: &CertCache,
	config: &LegacyTrustPreference,
	domain: &str,
	connection_chain: &[CertNode],
	now: SystemTime,
) -> LegacyVerdict {
	let cached = gather_cached_chains(cache, domain);
	let connection_level = connection_chain_level(config, connection_chain);
	let connection_leaf_identity = connection_chain.first().map(|n| n.identity_hash);

	// Steps 2-4: first pass over the full cached set.
	let (h, l_h) = partition_max_level(cache, config, &cached);
	if connection_level >= l_h {
		return verdict(domain, connection_level, EvaluationResult::Success, l_h, now, cache, &h);
	}
	if config.allow_same_key_fallback && same_key_fallback_succeeds(cache, now, &h, connection_leaf_identity) {
		return verdict(domain, connection_level, EvaluationResult::Success, l_h, now, cache, &h);
	}

	// Step 5: lazy-prune retry, run at most once.
	let pruned: Vec<ChainInfo> = cached
		.iter()
		.filter(|c| chain_is_currently_valid(cache, c, now))
		.cloned()
		.collect();
	if pruned.len() != cached.len() {
		let (h2, l_h2) = partition_max_level(cache, config, &pruned);
		if connection_level >= l_h2 {
			return verdict(domain, connection_level, EvaluationResult::Success, l_h2, now, cache, &h2);
		}
		if config.allow_same_key_fallback && same_key_fallback_succeeds(cache, now, &h2, connection_leaf_identity) {
			return verdict(domain, connection_level, EvaluationResult::Success, l_h2, now, cache, &h2);
		}
		return verdict(domain, connection_level, EvaluationResult::Failure, l_h2, now, cache, &h2);
	}

	// Step 6: FAILURE, nothing to prune.
	verdict(domain, connection_level, EvaluationResult::Failure, l_h, now, cache, &h)
}

#[cfg(test)]
mod tests {
	use super::*;
	use rcgen::{CertificateParams, ExtendedKeyUsagePurpose, GeneralSubtree, KeyPair, NameConstraints, SanType};
	use rustls_pki_types::CertificateDer;
	use std::collections::HashMap;

	fn install_root(cache: &mut CertCache, der: CertificateDer<'static>) -> Hash32 {
		let mut node = cert::parse(der).unwrap();
		node.trust_root = true;
		let identity_hash = node.identity_hash;
		cache.insert_node(node);
		identity_hash
	}

	fn build_chain_with_options(
		domain: &str,
		root_constrained: bool,
		leaf_server_auth: bool,
	) -> (CertificateDer<'static>, CertificateDer<'static>) {
		let root_key = KeyPair::generate().unwrap();
		let mut root_params = CertificateParams::new(vec![]).unwrap();
		root_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
		if root_constrained {
			root_params.name_constraints = Some(NameConstraints {
				permitted_subtrees: vec![GeneralSubtree::DnsName(domain.to_string())],
				excluded_subtrees: vec![],
			});
		}
		let root_cert = root_params.self_signed(&root_key).unwrap();

		let mut leaf_params = CertificateParams::new(vec![]).unwrap();
		leaf_params.subject_alt_names = vec![SanType::DnsName(domain.try_into().unwrap())];
		if leaf_server_auth {
			leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		}
		let leaf_cert = leaf_params
			.signed_by(&KeyPair::generate().unwrap(), &root_cert, &root_key)
			.unwrap();

		(root_cert.der().clone(), leaf_cert.der().clone())
	}

	fn build_chain(domain: &str) -> (CertificateDer<'static>, CertificateDer<'static>) {
		build_chain_with_options(domain, false, true)
	}

	fn connection_chain_of(leaf_der: CertificateDer<'static>, root_der: CertificateDer<'static>) -> Vec<CertNode> {
		vec![cert::parse(leaf_der).unwrap(), cert::parse(root_der).unwrap()]
	}

	#[test]
	fn domain_with_no_cached_chains_succeeds_vacuously() {
		let cache = CertCache::new();
		let config = LegacyTrustPreference::default();
		let verdict = verify_legacy(&cache, &config, "nowhere.example.com", &[], SystemTime::now());
		assert_eq!(verdict.evaluation_result, EvaluationResult::Success);
		assert_eq!(verdict.highest_trust_level, TrustLevel(0));
	}

	#[test]
	fn connection_chain_clearing_the_cached_level_succeeds() {
		let (root_der, leaf_der) = build_chain("service.example.com");
		let mut cache = CertCache::new();
		let root_identity = install_root(&mut cache, root_der.clone());
		cache.add_certificates(vec![leaf_der.clone()]);

		let mut root_trust_levels = HashMap::new();
		root_trust_levels.insert(root_identity, TrustLevel(3));
		let config = LegacyTrustPreference { root_trust_levels, allow_same_key_fallback: true };

		let connection_chain = connection_chain_of(leaf_der, root_der);
		let verdict = verify_legacy(&cache, &config, "service.example.com", &connection_chain, SystemTime::now());
		assert_eq!(verdict.evaluation_result, EvaluationResult::Success);
		assert_eq!(verdict.connection_trust_level, TrustLevel(3));
		assert_eq!(verdict.highest_trust_level, TrustLevel(3));
	}

	#[test]
	fn connection_below_cached_level_with_different_key_fails() {
		let (high_root_der, _high_leaf_der) = build_chain("c.com");
		let (low_root_der, low_leaf_der) = build_chain("c.com");
		let (_, other_leaf_der) = build_chain("c.com");

		let mut cache = CertCache::new();
		let high_root_identity = install_root(&mut cache, high_root_der);
		let low_root_identity = install_root(&mut cache, low_root_der.clone());
		cache.add_certificates(vec![low_leaf_der]);

		let mut root_trust_levels = HashMap::new();
		root_trust_levels.insert(high_root_identity, TrustLevel(2));
		root_trust_levels.insert(low_root_identity, TrustLevel(1));
		let config = LegacyTrustPreference { root_trust_levels, allow_same_key_fallback: true };

		let connection_chain = connection_chain_of(other_leaf_der, low_root_der);
		let verdict = verify_legacy(&cache, &config, "c.com", &connection_chain, SystemTime::now());
		assert_eq!(verdict.evaluation_result, EvaluationResult::Failure);
		assert_eq!(verdict.highest_trust_level, TrustLevel(2));
		assert!(!verdict.relevant_chains.is_empty());
	}

	#[test]
	fn same_key_fallback_succeeds_when_connection_leaf_matches_a_currently_valid_cached_chain() {
		let (high_root_der, high_leaf_der) = build_chain("c.com");
		let (low_root_der, low_leaf_der) = build_chain("c.com");

		let mut cache = CertCache::new();
		let high_root_identity = install_root(&mut cache, high_root_der);
		let low_root_identity = install_root(&mut cache, low_root_der.clone());
		cache.add_certificates(vec![high_leaf_der.clone()]);
		cache.add_certificates(vec![low_leaf_der]);

		let mut root_trust_levels = HashMap::new();
		root_trust_levels.insert(high_root_identity, TrustLevel(2));
		root_trust_levels.insert(low_root_identity, TrustLevel(1));
		let config = LegacyTrustPreference { root_trust_levels, allow_same_key_fallback: true };

		// The connection presents the same leaf key cached under the
		// high-trust chain, just paired with the low-trust root in hand.
		let connection_chain = connection_chain_of(high_leaf_der, low_root_der);
		let verdict = verify_legacy(&cache, &config, "c.com", &connection_chain, SystemTime::now());
		assert_eq!(verdict.evaluation_result, EvaluationResult::Success);
	}

	#[test]
	fn same_key_fallback_disabled_by_config_falls_through_to_failure() {
		let (high_root_der, high_leaf_der) = build_chain("c.com");
		let (low_root_der, low_leaf_der) = build_chain("c.com");

		let mut cache = CertCache::new();
		let high_root_identity = install_root(&mut cache, high_root_der);
		let low_root_identity = install_root(&mut cache, low_root_der.clone());
		cache.add_certificates(vec![high_leaf_der.clone()]);
		cache.add_certificates(vec![low_leaf_der]);

		let mut root_trust_levels = HashMap::new();
		root_trust_levels.insert(high_root_identity, TrustLevel(2));
		root_trust_levels.insert(low_root_identity, TrustLevel(1));
		let config = LegacyTrustPreference { root_trust_levels, allow_same_key_fallback: false };

		let connection_chain = connection_chain_of(high_leaf_der, low_root_der);
		let verdict = verify_legacy(&cache, &config, "c.com", &connection_chain, SystemTime::now());
		assert_eq!(verdict.evaluation_result, EvaluationResult::Failure);
	}

	/// Scenario 6 (spec §8): an invalid name-constrained chain inflates
	/// `L_H` above what the connection can clear; pruning it on retry lets
	/// the valid lower-trust chain decide the verdict instead.
	#[test]
	fn lazy_prune_retry_recovers_after_evicting_invalid_higher_trust_chain() {
		let (invalid_root_der, invalid_leaf_der) = build_chain_with_options("c.com", true, false);
		let (valid_root_der, valid_leaf_der) = build_chain_with_options("c.com", false, true);

		let mut cache = CertCache::new();
		let invalid_root_identity = install_root(&mut cache, invalid_root_der);
		let valid_root_identity = install_root(&mut cache, valid_root_der.clone());
		cache.add_certificates(vec![invalid_leaf_der]);
		cache.add_certificates(vec![valid_leaf_der.clone()]);

		let mut root_trust_levels = HashMap::new();
		root_trust_levels.insert(invalid_root_identity, TrustLevel(2));
		root_trust_levels.insert(valid_root_identity, TrustLevel(1));
		let config = LegacyTrustPreference { root_trust_levels, allow_same_key_fallback: true };

		let connection_chain = connection_chain_of(valid_leaf_der, valid_root_der);
		let verdict = verify_legacy(&cache, &config, "c.com", &connection_chain, SystemTime::now());
		assert_eq!(verdict.evaluation_result, EvaluationResult::Success);
		assert_eq!(verdict.highest_trust_level, TrustLevel(1));
	}

	#[test]
	fn parent_domain_walk_finds_wildcard_chain() {
		let (root_der, leaf_der) = build_chain("*.example.com");
		let mut cache = CertCache::new();
		install_root(&mut cache, root_der);
		cache.add_certificates(vec![leaf_der]);

		let config = LegacyTrustPreference::default();
		let chains = gather_cached_chains(&cache, "deep.service.example.com");
		assert_eq!(chains.len(), 1);
	}
}
