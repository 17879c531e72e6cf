//! Advisory-lock key derivation.
//!
//! PostgreSQL advisory locks (`pg_advisory_xact_lock`) are keyed by a bare `i64`.
//! Deriving that key from `(table, path)` via [`std::collections::hash_map::DefaultHasher`]
//! would be wrong here: its output is randomized per-process (SipHash with a
//! random key), so the same `(table, path)` pair would hash to different lock
//! keys in different processes and never contend with each other. We use a fixed,
//! process-independent FNV-1a hash instead.

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Derive a stable `i64` advisory lock key from a table name and path rendering.
///
/// Same `(table, path)` always produces the same key, across processes and
/// restarts, which is the whole point of an advisory lock.
pub fn lock_key(table: &str, path: &str) -> i64 {
    let key = format!("{table}:{path}");
    fnv1a(key.as_bytes()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(lock_key("kb1_job", "kb1.jobs.worker"), lock_key("kb1_job", "kb1.jobs.worker"));
    }

    #[test]
    fn distinguishes_table_and_path() {
        assert_ne!(lock_key("kb1_job", "kb1.a"), lock_key("kb1_stream", "kb1.a"));
        assert_ne!(lock_key("kb1_job", "kb1.a"), lock_key("kb1_job", "kb1.b"));
    }
}
