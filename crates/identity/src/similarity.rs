//! Ratcliff/Obershelp string similarity.
//!
//! Ratio of matched characters to total length (`2M / T`), where matches
//! are found by recursively locating the longest common substring and
//! matching the pieces to its left and right. This is the classic
//! "gestalt pattern matching" ratio used for fuzzy name comparison.

use std::collections::HashMap;

/// Similarity in `[0, 1]`. Two empty strings are identical (1.0).
pub fn ratcliff_obershelp(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matches = matching_chars(&a, &b);
    2.0 * matches as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (ai, bi, len) = longest_match(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..ai], &b[..bi]) + matching_chars(&a[ai + len..], &b[bi + len..])
}

/// Longest common substring; on ties the earliest position in `a`, then in
/// `b`, wins.
fn longest_match(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut run_lengths: HashMap<usize, usize> = HashMap::new();
    for (i, &ca) in a.iter().enumerate() {
        let mut next_runs: HashMap<usize, usize> = HashMap::new();
        for (j, &cb) in b.iter().enumerate() {
            if ca == cb {
                let k = if j == 0 {
                    1
                } else {
                    run_lengths.get(&(j - 1)).copied().unwrap_or(0) + 1
                };
                next_runs.insert(j, k);
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        run_lengths = next_runs;
    }
    best
}

/// Jaccard overlap of two value sets: `|A ∩ B| / |A ∪ B|`.
pub fn jaccard<'a, I, J>(a: I, b: J) -> f64
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
{
    let a: std::collections::HashSet<&str> = a.into_iter().collect();
    let b: std::collections::HashSet<&str> = b.into_iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_strings() {
        assert_eq!(ratcliff_obershelp("alice brown", "alice brown"), 1.0);
    }

    #[test]
    fn test_disjoint_strings() {
        assert_eq!(ratcliff_obershelp("abc", "xyz"), 0.0);
    }

    #[test]
    fn test_known_ratio() {
        // "abcd" vs "bcde": longest match "bcd" (3 chars), ratio 2*3/8.
        assert!((ratcliff_obershelp("abcd", "bcde") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_recursive_side_matching() {
        // "abxcd" vs "abcd": "ab" + "cd" both match -> 2*4/9.
        let ratio = ratcliff_obershelp("abxcd", "abcd");
        assert!((ratio - 8.0 / 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_strings() {
        assert_eq!(ratcliff_obershelp("", ""), 1.0);
        assert_eq!(ratcliff_obershelp("a", ""), 0.0);
    }

    #[test]
    fn test_symmetry_of_close_names() {
        let ab = ratcliff_obershelp("alice browne", "alice brown");
        assert!(ab > 0.9);
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard(["a", "b"], ["b", "c"]), 1.0 / 3.0);
        assert_eq!(jaccard(["a"], ["a"]), 1.0);
        assert_eq!(jaccard([], ["a"]), 0.0);
        let empty: [&str; 0] = [];
        assert_eq!(jaccard(empty, empty), 0.0);
    }

    #[test]
    fn test_jaccard_half_overlap() {
        // {phone} ∩ {phone, device} over union of 2.
        assert_eq!(jaccard(["+49123456789"], ["+49123456789", "D1"]), 0.5);
    }
}
