//! Formatting helpers for log output.

/// Shortens a hex identifier to `0x` plus four bytes.
pub fn truncate_id(id: &str) -> String {
	match id.get(..10) {
		Some(head) if id.len() > 10 => format!("{}..", head),
		_ => id.to_string(),
	}
}
