//! # Container naming.
//!
//! Every container the daemon manages carries a name of the form
//!
//! ```text
//! <service>-<hash16>__<index>_kir
//! ```
//!
//! where `hash16` is the first 16 hex chars of SHA-1 over the serialized
//! service spec plus the daemon version. The name alone determines:
//!
//! - whether the daemon owns the container (contains [`POSTFIX`]),
//! - which service it belongs to (prefix before `-`),
//! - whether it is current (contains the current hash) or an old
//!   generation (same service prefix, different hash),
//! - which replica index it is.
//!
//! Hashing the parsed spec rather than the manifest text means two
//! manifests that differ only in whitespace produce the same names, and
//! names are stable across daemon restarts as long as neither the spec nor
//! the daemon version changed.

use sha1::{Digest, Sha1};

use crate::config::ServiceSpec;

/// Marker suffix identifying containers owned by this daemon.
pub const POSTFIX: &str = "_kir";

/// Separator between the generation part and the replica index.
const INDEX_SEP: &str = "__";

/// Daemon version, mixed into the generation hash so upgrades roll
/// containers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// First 16 hex chars of SHA-1 over the canonical spec plus daemon
/// version.
pub fn generation_hash(spec: &ServiceSpec) -> String {
    let serialized =
        serde_json::to_string(spec).expect("service spec serializes infallibly");
    let mut hasher = Sha1::new();
    hasher.update(serialized.as_bytes());
    hasher.update(VERSION.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Canonical name of replica `index` in the given generation.
pub fn container_name(service: &str, hash: &str, index: usize) -> String {
    format!("{service}-{hash}{INDEX_SEP}{index}{POSTFIX}")
}

/// True when the name marks a container as owned by this daemon.
pub fn is_owned(name: &str) -> bool {
    name.contains(POSTFIX)
}

/// True when a listed name belongs to the given service's generations.
///
/// `raw` is the engine's listing form, possibly with a leading slash.
/// Linked-alias entries carry a second slash and are excluded.
pub fn belongs_to_service(raw: &str, service: &str) -> bool {
    if raw.matches('/').count() > 1 {
        return false;
    }
    let name = raw.trim_start_matches('/');
    name.starts_with(&format!("{service}-")) && is_owned(name)
}

/// True for containers of `service` that are NOT of the current
/// generation.
pub fn is_old_generation(raw: &str, service: &str, current_hash: &str) -> bool {
    belongs_to_service(raw, service) && !raw.contains(current_hash)
}

/// Extracts the replica index from a canonical container name.
pub fn replica_index(name: &str) -> Option<usize> {
    let trimmed = name.trim_start_matches('/');
    let after = trimmed.rsplit_once(INDEX_SEP)?.1;
    after.strip_suffix(POSTFIX)?.parse().ok()
}
