//! Wire-format glue for hosts that can only exchange JSON/base64 strings
//! with this engine (e.g. a WASM host, spec §6). Every function here does
//! nothing but decode its arguments, call into [`fpki_core::Engine`], and
//! re-encode the result — no trust logic lives in this crate.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fpki_core::cert_cache::ChainInfo;
use fpki_core::proof::{DomainEntry, MapServerInfo, Poi, ProofType, SignedTreeHead};
use fpki_core::{Engine, Hash32, MissingIds};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum FfiError {
	#[error("malformed request JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("malformed base64 field {field}: {source}")]
	Base64 {
		field: &'static str,
		#[source]
		source: base64::DecodeError,
	},
	#[error("hash field {field} decoded to {len} bytes, expected 32")]
	BadHashLength { field: &'static str, len: usize },
	#[error(transparent)]
	Engine(#[from] fpki_core::Error),
}

fn decode_bytes(field: &'static str, s: &str) -> Result<Vec<u8>, FfiError> {
	BASE64.decode(s).map_err(|source| FfiError::Base64 { field, source })
}

fn decode_hash(field: &'static str, s: &str) -> Result<Hash32, FfiError> {
	let bytes = decode_bytes(field, s)?;
	let len = bytes.len();
	let arr: [u8; 32] = bytes
		.try_into()
		.map_err(|_| FfiError::BadHashLength { field, len })?;
	Ok(Hash32::from_bytes(arr))
}

/// Load the trust store at `trust_root_dir` and the trust-preference JSON
/// `trust_config_json` (spec §6 `init`).
pub fn init(trust_root_dir: &str, trust_config_json: &str) -> Result<Engine, FfiError> {
	Ok(Engine::init(Path::new(trust_root_dir), trust_config_json.as_bytes())?)
}

#[derive(Debug, Deserialize)]
struct AddPayloadsRequest {
	#[serde(default)]
	certificates: Vec<String>,
	#[serde(default)]
	policies: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AddPayloadsResponse {
	added_certificates: Vec<String>,
	added_policies: Vec<String>,
}

/// Decode and ingest a batch of base64 DER certificates and base64
/// (JSON-encoded) policy certificates (spec §6 `add_missing_payloads`).
pub fn add_missing_payloads(engine: &mut Engine, request_json: &str) -> Result<String, FfiError> {
	let request: AddPayloadsRequest = serde_json::from_str(request_json)?;

	let mut certs = Vec::with_capacity(request.certificates.len());
	for (i, b64) in request.certificates.iter().enumerate() {
		match decode_bytes("certificates[]", b64) {
			Ok(bytes) => certs.push(CertificateDer::from(bytes)),
			Err(e) => warn!(index = i, error = %e, "skipping malformed certificate payload"),
		}
	}
	let mut policies = Vec::with_capacity(request.policies.len());
	for (i, b64) in request.policies.iter().enumerate() {
		match decode_bytes("policies[]", b64) {
			Ok(bytes) => policies.push(bytes),
			Err(e) => warn!(index = i, error = %e, "skipping malformed policy payload"),
		}
	}

	let added_certificates = engine.add_certificates(certs).into_iter().map(Hash32::to_base64).collect();
	let added_policies = engine.add_policies(policies).into_iter().map(Hash32::to_base64).collect();

	Ok(serde_json::to_string(&AddPayloadsResponse { added_certificates, added_policies })?)
}

#[derive(Debug, Deserialize)]
struct SignedTreeHeadWire {
	root: String,
	timestamp: i64,
	signature: String,
}

/// Spec §4.3/§6: the domain entry a map server attests to, carried
/// alongside the proof so `proof_key`/`leaf_hash` are always derived from
/// it rather than trusted as raw bytes from the host.
#[derive(Debug, Deserialize)]
struct DomainEntryWire {
	domain_name: String,
	#[serde(default)]
	cert_ids: Vec<String>,
	#[serde(default)]
	policy_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProofTypeWire {
	Pop,
	Poa,
}

#[derive(Debug, Deserialize)]
struct PoiWire {
	map_server_id: String,
	proof_type: ProofTypeWire,
	domain: DomainEntryWire,
	/// Present for a PoP (must equal the domain entry's leaf hash),
	/// absent for a PoA.
	proof_value: Option<String>,
	#[serde(default)]
	siblings: Vec<String>,
	sth: SignedTreeHeadWire,
}

#[derive(Debug, Deserialize)]
struct VerifyAndGetMissingIdsRequest {
	#[serde(default)]
	proofs: Vec<PoiWire>,
}

#[derive(Debug, Serialize)]
struct MissingIdsResponse {
	certificates: Vec<String>,
	policies: Vec<String>,
}

fn decode_domain_entry(wire: DomainEntryWire) -> Result<DomainEntry, FfiError> {
	let mut cert_ids = Vec::with_capacity(wire.cert_ids.len());
	for s in &wire.cert_ids {
		cert_ids.push(decode_hash("proofs[].domain.cert_ids[]", s)?);
	}
	let mut policy_ids = Vec::with_capacity(wire.policy_ids.len());
	for s in &wire.policy_ids {
		policy_ids.push(decode_hash("proofs[].domain.policy_ids[]", s)?);
	}
	Ok(DomainEntry { domain_name: wire.domain_name, cert_ids, policy_ids })
}

fn decode_poi(wire: PoiWire) -> Result<Poi, FfiError> {
	let domain = decode_domain_entry(wire.domain)?;
	let proof_value = wire
		.proof_value
		.as_deref()
		.map(|v| decode_hash("proofs[].proof_value", v))
		.transpose()?;
	let mut siblings = Vec::with_capacity(wire.siblings.len());
	for s in &wire.siblings {
		siblings.push(decode_hash("proofs[].siblings[]", s)?);
	}
	let root = decode_hash("proofs[].sth.root", &wire.sth.root)?;
	let signature = decode_bytes("proofs[].sth.signature", &wire.sth.signature)?;
	Ok(Poi {
		map_server_id: wire.map_server_id,
		proof_type: match wire.proof_type {
			ProofTypeWire::Pop => ProofType::Pop,
			ProofTypeWire::Poa => ProofType::Poa,
		},
		domain,
		proof_value,
		siblings,
		sth: SignedTreeHead { root, timestamp: wire.sth.timestamp, signature },
	})
}

/// Verify a batch of map-server proofs and report which referenced content
/// hashes the engine still lacks payloads for (spec §6
/// `verify_and_get_missing_ids`).
pub fn verify_and_get_missing_ids(engine: &mut Engine, request_json: &str) -> Result<String, FfiError> {
	let request: VerifyAndGetMissingIdsRequest = serde_json::from_str(request_json)?;

	let mut proofs = Vec::with_capacity(request.proofs.len());
	for wire in request.proofs {
		proofs.push(decode_poi(wire)?);
	}

	let MissingIds { certificates, policies } = engine.verify_and_get_missing_ids(&proofs)?;

	Ok(serde_json::to_string(&MissingIdsResponse {
		certificates: certificates.into_iter().map(Hash32::to_base64).collect(),
		policies: policies.into_iter().map(Hash32::to_base64).collect(),
	})?)
}

#[derive(Debug, Deserialize)]
struct VerifyLegacyRequest {
	#[serde(default)]
	chain: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RelevantChainWire {
	chain_index: usize,
	certificate_hashes: Vec<String>,
	subjects: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LegacyVerdictWire {
	dns_name: String,
	connection_trust_level: u8,
	evaluation_result: u8,
	highest_trust_level: u8,
	relevant_chains: Vec<RelevantChainWire>,
	max_validity: i64,
}

fn unix_seconds(t: SystemTime) -> i64 {
	match t.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(e) => -(e.duration().as_secs() as i64),
	}
}

/// Spec §6 `verify_legacy`: evaluate `domain` against legacy trust given the
/// connection's presented chain (`chain`, base64 DER, leaf first).
pub fn verify_legacy(engine: &Engine, domain: &str, request_json: &str) -> Result<String, FfiError> {
	let request: VerifyLegacyRequest = serde_json::from_str(request_json)?;
	let mut chain = Vec::with_capacity(request.chain.len());
	for s in &request.chain {
		chain.push(CertificateDer::from(decode_bytes("chain[]", s)?));
	}

	let verdict = engine.verify_legacy(domain, &chain)?;
	Ok(serde_json::to_string(&LegacyVerdictWire {
		dns_name: verdict.dns_name,
		connection_trust_level: verdict.connection_trust_level.0,
		evaluation_result: verdict.evaluation_result.as_u8(),
		highest_trust_level: verdict.highest_trust_level.0,
		relevant_chains: verdict
			.relevant_chains
			.into_iter()
			.map(|c| RelevantChainWire {
				chain_index: c.chain_index,
				certificate_hashes: c.certificate_hashes.into_iter().map(Hash32::to_base64).collect(),
				subjects: c.subjects,
			})
			.collect(),
		max_validity: unix_seconds(verdict.max_validity),
	})?)
}

#[derive(Debug, Deserialize)]
struct VerifyPolicyRequest {
	#[serde(default)]
	cert_chain: Vec<String>,
	#[serde(default)]
	constraints_apply: bool,
	root_subject: String,
}

#[derive(Debug, Serialize)]
struct ConflictWire {
	attribute: &'static str,
	policy_domain: String,
}

#[derive(Debug, Serialize)]
struct VerifyPolicyResponse {
	verdict: &'static str,
	conflicting_attributes: Vec<ConflictWire>,
}

/// Spec §6 `verify_policy`: check `domain` against the policy cache given
/// the presented certificate chain's content hashes and its trust root's
/// subject name.
pub fn verify_policy(engine: &Engine, domain: &str, request_json: &str) -> Result<String, FfiError> {
	let request: VerifyPolicyRequest = serde_json::from_str(request_json)?;
	let mut certs = Vec::with_capacity(request.cert_chain.len());
	for s in &request.cert_chain {
		certs.push(decode_hash("cert_chain[]", s)?);
	}
	let chain = ChainInfo { certs, constraints_apply: request.constraints_apply };

	let (verdict, conflicting_attributes) = match engine.verify_policy(domain, &chain, &request.root_subject) {
		fpki_core::policy_trust::PolicyVerdict::Success => ("success", Vec::new()),
		fpki_core::policy_trust::PolicyVerdict::NoApplicablePolicy => ("no_applicable_policy", Vec::new()),
		fpki_core::policy_trust::PolicyVerdict::Failure(conflicts) => (
			"failure",
			conflicts
				.into_iter()
				.map(|c| ConflictWire {
					attribute: match c.attribute {
						fpki_core::trust_config::ConflictingPolicyAttribute::TrustedCa => "trusted_ca",
						fpki_core::trust_config::ConflictingPolicyAttribute::AllowedSubdomains => "allowed_subdomains",
					},
					policy_domain: c.policy_domain,
				})
				.collect(),
		),
	};
	Ok(serde_json::to_string(&VerifyPolicyResponse { verdict, conflicting_attributes })?)
}

/// Register a map server's verification key (spec §4.3), taking its public
/// key as base64.
pub fn register_map_server(engine: &mut Engine, id: &str, public_key_b64: &str) -> Result<(), FfiError> {
	let public_key = decode_bytes("public_key", public_key_b64)?;
	engine.register_map_server(MapServerInfo::new(id, public_key));
	Ok(())
}
