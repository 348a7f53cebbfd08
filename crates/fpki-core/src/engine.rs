//! The single owned handle tying every cache and evaluator together (spec
//! §5/§6). The original implementation kept each cache as a package-level
//! global inside a WASM module instance; a process only ever had one, so
//! collapsing that into one `Engine` value changes no observable behavior
//! while giving callers ordinary Rust ownership instead of implicit
//! globals.

use crate::cert::{self, CertNode};
use crate::cert_cache::{self, CertCache, ChainInfo};
use crate::hash::Hash32;
use crate::legacy_trust::{self, LegacyVerdict};
use crate::policy_cache::PolicyCache;
use crate::policy_trust::{self, PolicyVerdict};
use crate::proof::{self, MapServerInfo, Poi, ProofCache};
use crate::trust_config::{self, TrustConfig};
use rustls_pki_types::CertificateDer;
use std::marker::PhantomData;
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	TrustStore(#[from] cert_cache::Error),
	#[error(transparent)]
	TrustConfig(#[from] trust_config::Error),
	#[error(transparent)]
	Proof(#[from] proof::Error),
	#[error("parsing presented connection chain: {0}")]
	PresentedChain(#[from] cert::ParseError),
}

/// The content/policy hashes a caller still needs to supply payloads for
/// after a batch of proofs was verified (spec §4.3's "missing ids" flow,
/// §6 `verify_and_get_missing_ids`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingIds {
	pub certificates: Vec<Hash32>,
	pub policies: Vec<Hash32>,
}

/// The client-side F-PKI trust engine. Not `Sync` or `Send`: every cache it
/// owns is a plain `HashMap`, not an `Arc`/`Mutex` pair, so the engine must
/// stay on the single thread that created it (spec §5).
pub struct Engine {
	certs: CertCache,
	policies: PolicyCache,
	proofs: ProofCache,
	trust_config: TrustConfig,
	_not_sync: PhantomData<*const ()>,
}

impl Engine {
	/// Load the trust-root store and trust-preference config. Called once
	/// per process lifetime (spec §5).
	pub fn init(trust_root_dir: &Path, trust_config_json: &[u8]) -> Result<Self, Error> {
		let mut certs = CertCache::new();
		certs.initialize(trust_root_dir)?;
		let trust_config = TrustConfig::load(trust_config_json)?;
		Ok(Engine {
			certs,
			policies: PolicyCache::new(),
			proofs: ProofCache::new(),
			trust_config,
			_not_sync: PhantomData,
		})
	}

	/// An engine with an empty trust store and default (permissive) trust
	/// preferences — used by hosts that install roots exclusively through
	/// `add_certificates`.
	pub fn empty() -> Self {
		Engine {
			certs: CertCache::new(),
			policies: PolicyCache::new(),
			proofs: ProofCache::new(),
			trust_config: TrustConfig::empty(),
			_not_sync: PhantomData,
		}
	}

	pub fn register_map_server(&mut self, info: MapServerInfo) {
		self.proofs.register_map_server(info);
	}

	pub fn add_certificates(&mut self, certs: Vec<CertificateDer<'static>>) -> Vec<Hash32> {
		self.certs.add_certificates(certs)
	}

	pub fn add_policies(&mut self, raw: Vec<Vec<u8>>) -> Vec<Hash32> {
		self.policies.add_policies(raw)
	}

	/// Verify a batch of map-server proofs, then report which of the
	/// certificate/policy ids *attested to by a proof that actually
	/// verified* this engine still has no payload for (spec §6
	/// `verify_and_get_missing_ids`). Ids are taken from each verified
	/// proof's own `DomainEntry`, never from caller-supplied lists — a proof
	/// that fails verification contributes nothing, so a misbehaving map
	/// server cannot use a bogus proof to make the client go fetch arbitrary
	/// content.
	pub fn verify_and_get_missing_ids(&mut self, proofs: &[Poi]) -> Result<MissingIds, Error> {
		let mut verified_cert_ids = Vec::new();
		let mut verified_policy_ids = Vec::new();
		for poi in proofs {
			if self.proofs.verify(poi)? {
				verified_cert_ids.extend(poi.domain.cert_ids.iter().copied());
				verified_policy_ids.extend(poi.domain.policy_ids.iter().copied());
			}
		}

		Ok(MissingIds {
			certificates: self.certs.missing_content_hashes(&verified_cert_ids),
			policies: self.policies.missing_policy_hashes(&verified_policy_ids),
		})
	}

	pub fn map_server_misbehaviors(&self, map_server_id: &str) -> u64 {
		self.proofs.misbehaviors(map_server_id)
	}

	pub fn chains_for_domain(&self, domain: &str) -> Vec<ChainInfo> {
		self.certs.chains_for_domain(domain)
	}

	/// Verify the connection's presented chain against legacy trust (spec
	/// §4.4/§6). `connection_chain` is leaf-first, as presented over TLS.
	pub fn verify_legacy(
		&self,
		domain: &str,
		connection_chain: &[CertificateDer<'static>],
	) -> Result<LegacyVerdict, Error> {
		let parsed: Vec<CertNode> = connection_chain
			.iter()
			.cloned()
			.map(cert::parse)
			.collect::<Result<_, _>>()?;
		Ok(legacy_trust::verify_legacy(
			&self.certs,
			&self.trust_config.legacy,
			domain,
			&parsed,
			SystemTime::now(),
		))
	}

	pub fn verify_policy(&self, domain: &str, cert_chain: &ChainInfo, root_subject: &str) -> PolicyVerdict {
		policy_trust::verify_policy(&self.policies, &self.trust_config.policy, domain, cert_chain, root_subject)
	}
}
