//! Content addressing for application states.
//!
//! A state is identified by its normalized URL plus an opaque digest of the
//! interactive DOM. Node ids are derived from that hash alone, so the same
//! state gets the same id in every run.

use sha2::{Digest, Sha256};
use url::Url;

const FINGERPRINT_LEN: usize = 16;
pub const NODE_ID_HASH_LEN: usize = 12;
const MAX_ACTION_NAME_LEN: usize = 64;
const ACTION_DIGEST_LEN: usize = 8;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Drop the fragment so `/page#top` and `/page` are the same state.
/// Unparseable input is only trimmed.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Digest of a DOM summary, for drivers that do not supply their own.
pub fn dom_fingerprint(dom_summary: &str) -> String {
    let mut digest = sha256_hex(dom_summary.as_bytes());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Content hash of a `(url, dom_fingerprint)` pair.
pub fn state_hash(url: &str, dom_fingerprint: &str) -> String {
    let key = format!("{}\n{}", normalize_url(url), dom_fingerprint);
    sha256_hex(key.as_bytes())
}

/// Node id for a non-root state.
pub fn node_id_for(state_hash: &str) -> String {
    let end = state_hash.len().min(NODE_ID_HASH_LEN);
    format!("node_{}", &state_hash[..end])
}

/// Reduce an action name to `[a-z0-9_-]`, collapsing runs of other
/// characters into a single underscore. Empty results become `unnamed`.
pub fn sanitize_action_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out.truncate(MAX_ACTION_NAME_LEN);
    if out.is_empty() {
        "unnamed".to_string()
    } else {
        out
    }
}

/// Edge name for an action: the sanitized `readable` part, cut short to
/// leave room for a digest of `identity`. Distinct identities get distinct
/// names even when their readable parts sanitize to the same text. The
/// result is already sanitized.
pub fn edge_action_name(readable: &str, identity: &str) -> String {
    let mut name = sanitize_action_name(readable);
    name.truncate(MAX_ACTION_NAME_LEN - ACTION_DIGEST_LEN - 1);
    while name.ends_with('_') {
        name.pop();
    }
    let digest = sha256_hex(identity.as_bytes());
    format!("{name}_{}", &digest[..ACTION_DIGEST_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_drops_fragment() {
        assert_eq!(
            normalize_url("https://app.test/page#section"),
            "https://app.test/page"
        );
        assert_eq!(normalize_url("  not a url "), "not a url");
    }

    #[test]
    fn test_state_hash_ignores_fragment() {
        let a = state_hash("https://app.test/page#a", "fp");
        let b = state_hash("https://app.test/page", "fp");
        assert_eq!(a, b);
        assert_ne!(a, state_hash("https://app.test/page", "other"));
    }

    #[test]
    fn test_dom_fingerprint_is_stable_and_short() {
        let fp = dom_fingerprint("<form><input name=q></form>");
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert_eq!(fp, dom_fingerprint("<form><input name=q></form>"));
        assert_ne!(fp, dom_fingerprint("<form></form>"));
    }

    #[test]
    fn test_node_id_is_prefixed_hash() {
        let hash = state_hash("https://app.test/", "fp");
        let id = node_id_for(&hash);
        assert!(id.starts_with("node_"));
        assert_eq!(id.len(), "node_".len() + NODE_ID_HASH_LEN);
    }

    #[test]
    fn test_sanitize_action_name() {
        assert_eq!(sanitize_action_name("click #Login Button"), "click_login_button");
        assert_eq!(sanitize_action_name("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_action_name("submit-form"), "submit-form");
        assert_eq!(sanitize_action_name("!!!"), "unnamed");
        assert_eq!(sanitize_action_name(&"a".repeat(200)).len(), MAX_ACTION_NAME_LEN);
    }

    #[test]
    fn test_edge_action_name_separates_lookalike_selectors() {
        let dotted = edge_action_name("click_#a.b", "click\n#a.b\n{}");
        let spaced = edge_action_name("click_#a b", "click\n#a b\n{}");
        assert_ne!(dotted, spaced);
        assert!(dotted.starts_with("click_a_b_"), "{dotted}");
        assert_eq!(dotted, edge_action_name("click_#a.b", "click\n#a.b\n{}"));
        // Already in sanitized form, so stores keep it verbatim.
        assert_eq!(sanitize_action_name(&dotted), dotted);
    }

    #[test]
    fn test_edge_action_name_keeps_digest_for_long_names() {
        let prefix = "click_".to_string() + &"x".repeat(100);
        let first = edge_action_name(&(prefix.clone() + "1"), &(prefix.clone() + "1"));
        let second = edge_action_name(&(prefix.clone() + "2"), &(prefix + "2"));
        assert_ne!(first, second);
        assert!(first.len() <= MAX_ACTION_NAME_LEN);
        assert_eq!(sanitize_action_name(&first), first);
    }
}
