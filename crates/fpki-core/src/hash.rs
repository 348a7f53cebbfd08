//! SHA-256 fingerprints used as cache keys throughout the engine.
//!
//! See spec §3: content (`H_c`), identity (`H_id`), issuer (`H_iss`) and
//! immutable (`H_im`/`H_im_iss`) fingerprints are all plain SHA-256 digests
//! over different byte concatenations. They share one representation here
//! so every cache can be keyed and sorted the same way.

use aws_lc_rs::digest::{Context, Digest, SHA256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt;

/// A 32-byte SHA-256 digest, used as the key type for every cache in this
/// crate (content hash, identity hash, issuer hash, immutable hash, proof
/// cache key).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash32([u8; 32]);

impl Hash32 {
	pub const fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_base64(self) -> String {
		BASE64.encode(self.0)
	}

	pub fn from_base64(s: &str) -> Result<Self, base64::DecodeError> {
		let bytes = BASE64.decode(s)?;
		let arr: [u8; 32] = bytes
			.try_into()
			.map_err(|_| base64::DecodeError::InvalidLength(0))?;
		Ok(Self(arr))
	}

	/// The "empty parent" sentinel used by the policy cache: the root of an
	/// immutable-bucket chain carries `H_im_iss == hash(nil)` (spec §4.2).
	pub fn of_nil() -> Self {
		hash_concat(&[])
	}
}

impl fmt::Debug for Hash32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Hash32({})", self.to_base64())
	}
}

impl fmt::Display for Hash32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_base64())
	}
}

fn finish(ctx: Context) -> Hash32 {
	let digest: Digest = ctx.finish();
	let mut out = [0u8; 32];
	out.copy_from_slice(digest.as_ref());
	Hash32(out)
}

/// `SHA256(concat(parts))`.
pub fn hash_concat(parts: &[&[u8]]) -> Hash32 {
	let mut ctx = Context::new(&SHA256);
	for part in parts {
		ctx.update(part);
	}
	finish(ctx)
}

/// `SHA256(bytes)`.
pub fn hash_bytes(bytes: &[u8]) -> Hash32 {
	hash_concat(&[bytes])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn base64_roundtrip() {
		let h = hash_bytes(b"hello world");
		let encoded = h.to_base64();
		let decoded = Hash32::from_base64(&encoded).unwrap();
		assert_eq!(h, decoded);
	}

	#[test]
	fn concat_is_order_sensitive() {
		let a = hash_concat(&[b"a", b"b"]);
		let b = hash_concat(&[b"b", b"a"]);
		assert_ne!(a, b);
	}

	#[test]
	fn nil_hash_is_stable() {
		assert_eq!(Hash32::of_nil(), Hash32::of_nil());
		assert_eq!(Hash32::of_nil(), hash_concat(&[]));
	}
}
