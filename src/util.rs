use std::{sync::OnceLock, time::Instant};

use crate::Rank;

/// Microseconds on a process-local monotonic clock. All deadlines in the
/// runtime are absolute values of this clock.
pub fn monotonic_us() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();

    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_micros() as u64
}

/// Absolute deadline `diff_us` microseconds from now.
pub fn deadline_us(diff_us: u64) -> u64 {
    monotonic_us().saturating_add(diff_us)
}

/// Sort and deduplicate a rank list in place. Wire-crossing rank lists and
/// excluded-rank sets are kept in this canonical form.
pub fn rank_list_sort_uniq(ranks: &mut Vec<Rank>) {
    ranks.sort_unstable();
    ranks.dedup();
}

/// Remove from `ranks` every rank present in `excluded` (both canonical).
pub fn rank_list_filter(ranks: &mut Vec<Rank>, excluded: &[Rank]) {
    ranks.retain(|rank| excluded.binary_search(rank).is_err());
}

/// Position of `rank` within a canonical rank list.
pub fn rank_list_index(ranks: &[Rank], rank: Rank) -> Option<u32> {
    ranks.binary_search(&rank).ok().map(|idx| idx as u32)
}

/// Boolean environment knob: unset yields `None`, `0`/`false`/`no` (any
/// case) yield `Some(false)`, anything else `Some(true)`.
pub fn getenv_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let val = val.trim().to_ascii_lowercase();
    Some(!matches!(val.as_str(), "" | "0" | "false" | "no"))
}

/// Best-effort hostname for diagnostics.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    match nix::unistd::gethostname(&mut buf) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => String::from("<unknown>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_uniq_dedups() {
        let mut ranks = vec![5, 1, 3, 1, 5, 0];
        rank_list_sort_uniq(&mut ranks);
        assert_eq!(ranks, [0, 1, 3, 5]);
    }

    #[test]
    fn filter_removes_excluded() {
        let mut ranks = vec![0, 1, 2, 3, 4, 5];
        rank_list_filter(&mut ranks, &[1, 4]);
        assert_eq!(ranks, [0, 2, 3, 5]);
    }

    #[test]
    fn index_in_canonical_list() {
        let ranks = [2, 4, 7, 9];
        assert_eq!(rank_list_index(&ranks, 7), Some(2));
        assert_eq!(rank_list_index(&ranks, 3), None);
    }

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }
}
