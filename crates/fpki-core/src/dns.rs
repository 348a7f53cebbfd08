//! DNS name helpers shared by the certificate cache (§4.1 wildcard lookup)
//! and the legacy trust evaluator (§4.4 domain walk).
//!
//! Both only ever try a single wildcard, at the least-specific position of
//! whatever suffix is currently being considered. This is deliberately
//! narrower than RFC 6125 (spec §9, open question (c)) — not a bug.

/// Strip one trailing dot, if present (`"example.com." -> "example.com"`).
pub fn normalize(name: &str) -> &str {
	name.strip_suffix('.').unwrap_or(name)
}

/// `{name, *.name}` — the two DNS-index lookup keys for a leaf certificate
/// (spec §4.1's wildcard lookup rule), queried at the full name only.
pub fn wildcard_lookup_keys(name: &str) -> [String; 2] {
	let name = normalize(name);
	[name.to_string(), wildcard_of(name)]
}

fn wildcard_of(suffix: &str) -> String {
	match suffix.split_once('.') {
		Some((_, rest)) => format!("*.{rest}"),
		None => "*".to_string(),
	}
}

/// Ordered list of candidate domains to check trust preferences against,
/// walking from the most specific name up to the bare TLD, trying one
/// wildcard at each level: for `a.b.com` this yields
/// `["a.b.com", "*.b.com", "b.com", "*.com", "com"]`.
pub fn wildcard_and_parent_domains(name: &str) -> Vec<String> {
	let name = normalize(name);
	let labels: Vec<&str> = name.split('.').collect();
	let mut out = Vec::with_capacity(labels.len() * 2);
	for depth in 0..labels.len() {
		out.push(labels[depth..].join("."));
		if depth + 1 < labels.len() {
			out.push(format!("*.{}", labels[depth + 1..].join(".")));
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wildcard_lookup_is_least_specific_position() {
		assert_eq!(
			wildcard_lookup_keys("leaf.example.com"),
			["leaf.example.com".to_string(), "*.example.com".to_string()]
		);
	}

	#[test]
	fn parent_domain_walk_matches_spec_example() {
		assert_eq!(
			wildcard_and_parent_domains("a.b.com"),
			vec!["a.b.com", "*.b.com", "b.com", "*.com", "com"]
		);
	}

	#[test]
	fn single_label_has_no_wildcard() {
		assert_eq!(wildcard_and_parent_domains("com"), vec!["com"]);
	}

	#[test]
	fn trailing_dot_is_normalized() {
		assert_eq!(
			wildcard_and_parent_domains("a.com."),
			wildcard_and_parent_domains("a.com")
		);
	}
}
