//! Policy-certificate records (P-nodes, spec §3/§4.2). Policy certificates
//! arrive as JSON (per the external common library, spec §6) rather than
//! DER — the parent pointer (`IssuerHash`) is a field of the JSON document
//! itself instead of something derived from an X.509 extension.

use crate::hash::{Hash32, hash_bytes};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("malformed policy certificate JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("issuer_hash must be exactly 32 bytes, got {0}")]
	BadIssuerHashLength(usize),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyAttributes {
	#[serde(default)]
	pub trusted_ca: Vec<String>,
	#[serde(default)]
	pub allowed_subdomains: Vec<String>,
}

impl PolicyAttributes {
	pub fn is_empty(&self) -> bool {
		self.trusted_ca.is_empty() && self.allowed_subdomains.is_empty()
	}
}

/// A signed policy timestamp: a third party's attestation that it observed
/// this policy certificate by `added_ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Spct {
	pub added_ts: i64,
}

/// Wire shape of a policy certificate, as delivered by the map server
/// (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCertificateWire {
	pub domain: String,
	pub policy_attributes: PolicyAttributes,
	/// Unix seconds.
	pub timestamp: i64,
	#[serde(default)]
	pub spcts: Vec<Spct>,
	/// Raw pointer to the parent's immutable-fields hash (`H_im_iss`). This
	/// is carried verbatim in the certificate, not recomputed by us (spec
	/// §3: "embedded in the policy itself").
	pub issuer_hash: Vec<u8>,
	/// Opaque issuer signature over the immutable fields; not verified
	/// bit-for-bit here (that is an external-library concern), but its
	/// presence is what lets `H_im` differ between genuinely distinct
	/// signers of identical attributes.
	pub signature: Vec<u8>,
}

/// An ingested, fingerprinted policy certificate.
#[derive(Debug, Clone)]
pub struct PolicyNode {
	pub wire: PolicyCertificateWire,
	/// Content hash: `SHA256(JSON(wire))`, analogous to a C-node's `H_c`.
	/// Keys the policy cache the way `getPolicyHash` does in the original.
	pub content_hash: Hash32,
	/// `H_im`: hash over the immutable fields (domain, attributes,
	/// timestamp, issuer pointer) as defined by the signer.
	pub immutable_hash: Hash32,
	/// `H_im_iss`: the parent's immutable hash, taken verbatim from the
	/// wire `issuer_hash` field.
	pub immutable_issuer_hash: Hash32,
	pub trust_root: bool,
}

impl PolicyNode {
	pub fn domain(&self) -> &str {
		&self.wire.domain
	}

	pub fn timestamp(&self) -> SystemTime {
		SystemTime::UNIX_EPOCH + Duration::from_secs(self.wire.timestamp.max(0) as u64)
	}

	/// `max(Timestamp, max(SPCT.AddedTS))` — the "latest" timestamp used by
	/// the min-max chain-selection rule (spec §4.2).
	pub fn latest_timestamp(&self) -> i64 {
		self
			.wire
			.spcts
			.iter()
			.map(|s| s.added_ts)
			.fold(self.wire.timestamp, i64::max)
	}
}

/// Canonical immutable-field encoding used to compute `H_im`. Only fields
/// the signer committed to at issuance participate; the signature itself
/// and any later-appended SPCTs do not (spec §3: P-nodes sharing `H_im`
/// form one "immutable-fields class" even as SPCTs accumulate on members).
#[derive(Serialize)]
struct ImmutableFields<'a> {
	domain: &'a str,
	policy_attributes: &'a PolicyAttributes,
	timestamp: i64,
	issuer_hash: &'a [u8],
}

pub fn parse(bytes: &[u8]) -> Result<PolicyNode, ParseError> {
	let wire: PolicyCertificateWire = serde_json::from_slice(bytes)?;
	if wire.issuer_hash.len() != 32 && !wire.issuer_hash.is_empty() {
		return Err(ParseError::BadIssuerHashLength(wire.issuer_hash.len()));
	}
	let content_hash = hash_bytes(&serde_json::to_vec(&wire).expect("policy wire always serializes"));
	let immutable_fields = ImmutableFields {
		domain: &wire.domain,
		policy_attributes: &wire.policy_attributes,
		timestamp: wire.timestamp,
		issuer_hash: &wire.issuer_hash,
	};
	let immutable_hash = hash_bytes(
		&serde_json::to_vec(&immutable_fields).expect("immutable fields always serialize"),
	);
	let immutable_issuer_hash = if wire.issuer_hash.is_empty() {
		Hash32::of_nil()
	} else {
		let mut arr = [0u8; 32];
		arr.copy_from_slice(&wire.issuer_hash);
		Hash32::from_bytes(arr)
	};

	Ok(PolicyNode {
		wire,
		content_hash,
		immutable_hash,
		immutable_issuer_hash,
		trust_root: false,
	})
}
