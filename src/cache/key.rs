/// Cache entry naming
///
/// An entry name identifies a library built for one target signature. It
/// embeds a short fingerprint of the path-independent compile flags so that
/// changing the flag set never reuses an archive built with the old one.
use sha2::{Digest, Sha256};

/// Number of hex digits of the flag fingerprint kept in the name
const FINGERPRINT_LEN: usize = 8;

/// Derive the cache output name for `library` on `triple`/`cpu`.
///
/// The result is a single path component: anything outside
/// `[A-Za-z0-9._-]` is replaced by `_`.
pub fn output_name(library: &str, triple: &str, cpu: &str, flags: &[String]) -> String {
    let mut name = format!("{}-{}", sanitize(library), sanitize(triple));
    if !cpu.is_empty() {
        name.push('-');
        name.push_str(&sanitize(cpu));
    }
    name.push('-');
    name.push_str(&fingerprint(flags));
    name
}

/// Short hex digest of a flag list
pub fn fingerprint(flags: &[String]) -> String {
    let mut hasher = Sha256::new();
    for flag in flags {
        hasher.update(flag.as_bytes());
        hasher.update([0u8]);
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    // "." and ".." are not usable entry names
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}
