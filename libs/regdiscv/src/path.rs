//! Helpers for '/'-delimited registration paths.
//!
//! Layout convention: `{base}/{module}[/{cluster_id}]/{node_id}`, where
//! sequential node ids end with a 10-digit counter assigned by the
//! coordination service.

/// Width of the counter appended to ephemeral-sequential node names.
pub const SEQUENCE_SUFFIX_LEN: usize = 10;

/// Join a parent path and a child name.
#[must_use]
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    format!("{parent}/{child}")
}

/// Parent of `path`, `None` for the root.
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Last segment of `path`.
#[must_use]
pub fn name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Path of `path` relative to `base`, without the leading separator.
///
/// Returns `None` when `path` is not below `base`.
#[must_use]
pub fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    let rest = path.strip_prefix(base)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix('/')
}

/// Sequence counter encoded in the last 10 characters of a node name.
///
/// Names shorter than the suffix or with a non-numeric suffix yield `None`.
#[must_use]
pub fn sequence_of(node: &str) -> Option<u64> {
    let len = node.len();
    if len < SEQUENCE_SUFFIX_LEN || !node.is_char_boundary(len - SEQUENCE_SUFFIX_LEN) {
        return None;
    }
    let suffix = &node[len - SEQUENCE_SUFFIX_LEN..];
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Children ordered by their sequence counter, ascending.
///
/// Children without a valid counter are dropped from the ordered view.
#[must_use]
pub fn order_by_sequence(children: &[String]) -> Vec<String> {
    let mut ordered: Vec<(u64, &String)> = children
        .iter()
        .filter_map(|c| sequence_of(c).map(|seq| (seq, c)))
        .collect();
    ordered.sort_by_key(|(seq, _)| *seq);
    ordered.into_iter().map(|(_, c)| c.clone()).collect()
}
