//! Path-to-shard hasher.
//!
//! Pure function mapping a logical pathname to a server index. Servers and
//! clients must agree exactly on the result, since it locates a file's
//! master shard: this is part of the wire contract, not an implementation
//! detail, so changing it is a breaking change to every deployed partition.

/// Returns the index in `[0, server_count)` that owns `path`'s master
/// shard (`is_file = true`) or that owns the parent directory entry used
/// to dedupe `readdir` results (`is_file = false`).
///
/// `server_count == 0` returns the raw sum instead of dividing by zero,
/// matching the reference implementation's `max_num > 0 ? num % max_num :
/// num` guard.
pub fn hash(path: &str, server_count: u32, is_file: bool) -> u32 {
    let name = if is_file { last_component(path) } else { last_component(&remove_last_component(path)) };

    let sum: u32 = name.bytes().map(u32::from).sum();

    if server_count > 0 {
        sum % server_count
    } else {
        sum
    }
}

/// Returns the final `/`-separated component of `path`, skipping any
/// trailing slashes first.
fn last_component(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Returns `path` with its final `/`-separated component removed. When
/// `path` has no separator at all, there is nothing to strip, so the
/// whole (trimmed) path is returned unchanged, matching the reference
/// implementation's `name = path` fallback.
fn remove_last_component(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn naive_sum(s: &str) -> u32 {
        s.bytes().map(u32::from).sum()
    }

    #[test]
    fn file_hash_uses_last_component() {
        let h = hash("/a/b/c.txt", 7, true);
        assert_eq!(h, naive_sum("c.txt") % 7);
    }

    #[test]
    fn dir_hash_uses_parents_last_component() {
        // parent of "/a/b/c.txt" is "/a/b" whose last component is "b".
        let h = hash("/a/b/c.txt", 7, false);
        assert_eq!(h, naive_sum("b") % 7);
    }

    #[test]
    fn trailing_slashes_are_ignored() {
        assert_eq!(hash("/a/b/c/", 5, true), hash("/a/b/c", 5, true));
    }

    #[test]
    fn zero_servers_returns_raw_sum() {
        assert_eq!(hash("ab", 0, true), naive_sum("ab"));
    }

    #[test]
    fn single_component_path_hashes_itself_for_files() {
        assert_eq!(hash("root.txt", 3, true), naive_sum("root.txt") % 3);
    }

    #[test]
    fn single_component_path_hashes_itself_for_dirs() {
        // No parent to strip, so the whole path is the "name".
        assert_eq!(hash("root", 3, false), naive_sum("root") % 3);
    }

    #[test]
    fn is_pure_across_repeated_calls() {
        for _ in 0..10 {
            assert_eq!(hash("/mnt/xpn/data/file", 11, true), hash("/mnt/xpn/data/file", 11, true));
        }
    }
}
