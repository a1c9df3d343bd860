//! Quorum arithmetic shared by the Appender's commit-index computation and
//! the ConfigCoordinator's vote tallying.

/// The smallest count that is a strict majority of `total` members.
pub fn majority_of(total: usize) -> usize {
    total / 2 + 1
}

/// Given the match-index of every voting member (including the leader's own
/// last log index), returns the highest index replicated to a majority.
///
/// This is the single-configuration form. Joint-consensus quorum
/// intersection is out of scope; reconfiguration in this crate is
/// single-step, so a configuration change never has two member sets to
/// satisfy at once.
pub fn commit_index_of(mut match_indexes: Vec<u64>) -> u64 {
    if match_indexes.is_empty() {
        return 0;
    }
    match_indexes.sort_unstable();
    let majority = majority_of(match_indexes.len());
    match_indexes[match_indexes.len() - majority]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_of_odd_and_even() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn commit_index_picks_highest_majority_replicated() {
        assert_eq!(commit_index_of(vec![5, 3, 4]), 4);
        assert_eq!(commit_index_of(vec![1, 1, 1, 9]), 1);
        assert_eq!(commit_index_of(vec![7]), 7);
    }
}
