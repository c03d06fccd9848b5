//! Package version strings: `<semantic>-<revision>`, e.g. `4.4.1-2`.
use std::cmp::Ordering;

/// Compare two version strings. Returns `None` when either side does not
/// parse as `<digits>.<digits>...-<digits>`.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    let (a_semantic, a_revision) = split(a)?;
    let (b_semantic, b_revision) = split(b)?;

    let semantic = compare_semantic(&a_semantic, &b_semantic);
    if semantic != Ordering::Equal {
        return Some(semantic);
    }
    Some(a_revision.cmp(&b_revision))
}

fn split(version: &str) -> Option<(Vec<u64>, u64)> {
    let (semantic, revision) = version.split_once('-')?;
    let parts: Option<Vec<u64>> = semantic.split('.').map(|p| p.parse().ok()).collect();
    Some((parts?, revision.parse().ok()?))
}

fn compare_semantic(a: &[u64], b: &[u64]) -> Ordering {
    for (part_a, part_b) in a.iter().zip(b) {
        match part_a.cmp(part_b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}
