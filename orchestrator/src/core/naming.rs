//! Deterministic naming for repositories and published URLs.

use std::sync::LazyLock;

use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use regex::Regex;
use sha2::{Digest, Sha256};

/// Maximum slug length (fits DNS labels and repository names).
pub const MAX_SLUG_LEN: usize = 63;
const EMPTY_SLUG: &str = "generated-app";
const SUFFIX_LEN: usize = 6;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));

/// Lowercase ASCII slug joined by `-`, at most [`MAX_SLUG_LEN`] chars.
pub fn slugify(value: &str) -> String {
    let lowered = value.to_ascii_lowercase();
    let replaced = NON_SLUG.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        return EMPTY_SLUG.to_string();
    }
    let mut slug: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Filesystem key for a task: `{slug}-{hash}`, readable and distinct for ids
/// that slug alike.
pub fn task_key(task_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(task_id.as_bytes()));
    format!("{}-{}", slugify(task_id), &digest[..12])
}

/// Repository name proposed for a create-mode run: `{slug}-r{round}-{suffix}`.
pub fn repo_name(task_id: &str, round: u32, suffix: &str) -> String {
    format!("{}-r{round}-{suffix}", slugify(task_id))
}

/// Random lowercase suffix used to keep created repositories unique per run.
pub fn random_suffix() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Predictable static-site URL for a repository.
pub fn pages_url(owner: &str, repo: &str, pages_host: &str) -> String {
    format!(
        "https://{}.{}/{}/",
        owner.trim_matches('/'),
        pages_host.trim_matches('/'),
        repo.trim_matches('/')
    )
}

/// Browsable repository URL.
pub fn repo_url(base_url: &str, owner: &str, repo: &str) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        owner.trim_matches('/'),
        repo.trim_matches('/')
    )
}

/// Inverse of [`pages_url`]: recover `(owner, repo)` from a published URL.
pub fn parse_pages_url(url: &str, pages_host: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("https://")?;
    let (host, path) = rest.split_once('/')?;
    let owner = host.strip_suffix(pages_host.trim_matches('/'))?.strip_suffix('.')?;
    let repo = path.trim_matches('/');
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}
