//! Certificate records (C-nodes, spec §3) and the pure parsing/fingerprint
//! logic around them. No caching lives here — see `cert_cache`.

use crate::hash::{Hash32, hash_concat};
use rustls_pki_types::CertificateDer;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("malformed DER: {0}")]
	Der(String),
	#[error("certificate is missing a required extension: {0}")]
	MissingExtension(&'static str),
}

/// Why a certificate was rejected at ingestion (spec §4.1 error/ignore
/// policy). `Expired` is the only variant that lands the content hash in
/// the ignored-set; every other variant is a silent, retryable reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	Expired,
	NotYetValid,
	SignatureInvalid,
	NoCandidateParent,
	Malformed,
}

/// An immutable certificate record plus the precomputed fingerprints and
/// flags described in spec §3.
#[derive(Debug, Clone)]
pub struct CertNode {
	pub der: CertificateDer<'static>,
	/// `H_c`: content fingerprint.
	pub content_hash: Hash32,
	/// `H_id`: identity fingerprint (subject+key).
	pub identity_hash: Hash32,
	/// `H_iss`: issuer fingerprint.
	pub issuer_hash: Hash32,
	pub subject: String,
	pub issuer: String,
	pub is_ca: bool,
	pub trust_root: bool,
	pub not_before: SystemTime,
	pub not_after: SystemTime,
	pub dns_names: Vec<String>,
	pub constraints_apply: bool,
	pub server_auth: bool,
}

fn asn1_time_to_system_time(t: x509_parser::time::ASN1Time) -> SystemTime {
	let secs = t.timestamp();
	if secs >= 0 {
		UNIX_EPOCH + Duration::from_secs(secs as u64)
	} else {
		UNIX_EPOCH - Duration::from_secs((-secs) as u64)
	}
}

/// `H_id = SHA256(Subject || SubjectKeyId)` for CAs, `SHA256(Subject ||
/// SubjectPublicKeyInfo)` for leaves (spec §3).
fn identity_hash(cert: &X509Certificate, is_ca: bool, subject: &str) -> Result<Hash32, ParseError> {
	if is_ca {
		let ski = cert
			.subject_key_identifier()
			.map_err(|e| ParseError::Der(e.to_string()))?
			.ok_or(ParseError::MissingExtension("subjectKeyIdentifier"))?;
		Ok(hash_concat(&[subject.as_bytes(), ski.0]))
	} else {
		let spki = &cert.tbs_certificate.subject_pki.raw;
		Ok(hash_concat(&[subject.as_bytes(), spki]))
	}
}

/// `H_iss = SHA256(Issuer || AuthorityKeyId)` (spec §3). Certificates that
/// omit the AKI extension (typically self-signed roots) hash against an
/// empty key id instead of failing outright, so that `identity_hash` of a
/// self-signed root's own subject/SKI can be compared against it.
fn issuer_hash(cert: &X509Certificate, issuer: &str) -> Hash32 {
	let aki = cert
		.authority_key_identifier()
		.ok()
		.flatten()
		.and_then(|aki| aki.key_identifier.as_ref())
		.map(|ki| ki.0)
		.unwrap_or(&[]);
	hash_concat(&[issuer.as_bytes(), aki])
}

fn constraints_apply(cert: &X509Certificate, is_ca: bool) -> bool {
	let path_len_constrained = cert
		.basic_constraints()
		.ok()
		.flatten()
		.map(|bc| is_ca && bc.path_len_constraint.is_some())
		.unwrap_or(false);

	let name_constrained = cert
		.name_constraints()
		.ok()
		.flatten()
		.map(|nc| {
			!nc.permitted_subtrees.as_deref().unwrap_or(&[]).is_empty()
				|| !nc.excluded_subtrees.as_deref().unwrap_or(&[]).is_empty()
		})
		.unwrap_or(false);

	path_len_constrained || name_constrained
}

fn dns_names(cert: &X509Certificate) -> Vec<String> {
	cert
		.subject_alternative_name()
		.ok()
		.flatten()
		.map(|ext| {
			ext
				.value
				.general_names
				.iter()
				.filter_map(|n| match n {
					GeneralName::DNSName(name) => Some(name.to_string()),
					_ => None,
				})
				.collect()
		})
		.unwrap_or_default()
}

fn server_auth(cert: &X509Certificate) -> bool {
	cert
		.extended_key_usage()
		.ok()
		.flatten()
		.map(|eku| eku.value.server_auth)
		.unwrap_or(false)
}

/// Parse a DER-encoded certificate into a `CertNode`. `trust_root` is set by
/// the caller (`cert_cache`), since whether a certificate is a root is a
/// cache-level decision (spec I2), not a parsing-level one.
pub fn parse(der: CertificateDer<'static>) -> Result<CertNode, ParseError> {
	let (_, cert) =
		x509_parser::parse_x509_certificate(&der).map_err(|e| ParseError::Der(e.to_string()))?;

	let subject = cert.subject().to_string();
	let issuer = cert.issuer().to_string();
	let is_ca = cert
		.basic_constraints()
		.ok()
		.flatten()
		.map(|bc| bc.ca)
		.unwrap_or(false);

	let content_hash = hash_concat(&[cert.as_ref()]);
	let identity_hash = identity_hash(&cert, is_ca, &subject)?;
	let issuer_hash = issuer_hash(&cert, &issuer);

	Ok(CertNode {
		der,
		content_hash,
		identity_hash,
		issuer_hash,
		subject,
		issuer: issuer.clone(),
		is_ca,
		trust_root: false,
		not_before: asn1_time_to_system_time(cert.validity().not_before),
		not_after: asn1_time_to_system_time(cert.validity().not_after),
		dns_names: dns_names(&cert),
		constraints_apply: constraints_apply(&cert, is_ca),
		server_auth: server_auth(&cert),
	})
}

/// Whether `child.der`'s signature verifies against `parent`'s public key.
pub fn verifies_signature(child: &CertificateDer<'_>, parent: &CertificateDer<'_>) -> bool {
	let Ok((_, child_cert)) = x509_parser::parse_x509_certificate(child) else {
		return false;
	};
	let Ok((_, parent_cert)) = x509_parser::parse_x509_certificate(parent) else {
		return false;
	};
	child_cert
		.verify_signature(Some(&parent_cert.tbs_certificate.subject_pki))
		.is_ok()
}

/// Current-time validity check, classified per spec §4.1's error/ignore
/// policy: `Expired` is distinguished from every other failure so the
/// caller can decide whether to add the hash to the ignored-set.
pub fn check_validity(node: &CertNode, now: SystemTime) -> Result<(), RejectReason> {
	if now < node.not_before {
		return Err(RejectReason::NotYetValid);
	}
	if now > node.not_after {
		return Err(RejectReason::Expired);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn self_signed_der(not_before: time::OffsetDateTime, not_after: time::OffsetDateTime) -> CertificateDer<'static> {
		let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
		params.not_before = not_before;
		params.not_after = not_after;
		let key = rcgen::KeyPair::generate().unwrap();
		let cert = params.self_signed(&key).unwrap();
		CertificateDer::from(cert.der().to_vec())
	}

	#[test]
	fn parses_self_signed_leaf_and_extracts_dns_names() {
		let now = time::OffsetDateTime::now_utc();
		let der = self_signed_der(now - time::Duration::days(1), now + time::Duration::days(30));
		let node = parse(der).expect("parses");
		assert_eq!(node.dns_names, vec!["example.com".to_string()]);
		assert_eq!(node.subject, node.issuer);
	}

	#[test]
	fn expired_cert_is_classified_as_expired() {
		let now = time::OffsetDateTime::now_utc();
		let der = self_signed_der(now - time::Duration::days(60), now - time::Duration::days(30));
		let node = parse(der).expect("parses");
		assert_eq!(
			check_validity(&node, SystemTime::now()),
			Err(RejectReason::Expired)
		);
	}

	#[test]
	fn not_yet_valid_is_a_distinct_reason_from_expired() {
		let now = time::OffsetDateTime::now_utc();
		let der = self_signed_der(now + time::Duration::days(1), now + time::Duration::days(30));
		let node = parse(der).expect("parses");
		assert_eq!(
			check_validity(&node, SystemTime::now()),
			Err(RejectReason::NotYetValid)
		);
	}
}
