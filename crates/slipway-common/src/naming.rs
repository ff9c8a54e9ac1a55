//! Artifact and stack naming.
//!
//! Artifact names follow `<logical>-<UTC timestamp>-<commit sha>` so that two
//! builds of the same app never collide in the blob store or registry.

use chrono::{DateTime, Utc};

/// True for a full 40-character hexadecimal commit id.
pub fn is_commit_sha(rev: &str) -> bool {
    rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// Lower-cased, docker-reference-safe form of a logical name.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// `<logical>-<YYYYmmddHHMMSS>-<sha>`, lower-cased.
pub fn artifact_name(logical: &str, at: DateTime<Utc>, sha: &str) -> String {
    format!(
        "{}-{}-{}",
        sanitize(logical),
        at.format("%Y%m%d%H%M%S"),
        sha.to_ascii_lowercase()
    )
}

/// Orchestration stack name for an assembly: `<name>-<uuid>`. Stable across
/// redeploys, so an existing stack is found and updated in place.
pub fn stack_name(assembly_name: &str, assembly_uuid: &str) -> String {
    format!(
        "{}-{}",
        sanitize(assembly_name),
        assembly_uuid.to_ascii_lowercase()
    )
}
