//! Common settings and log-domain arithmetic.

use hashbrown::{HashMap, HashSet};

use crate::errors::{LegatoError, Result};

/// A vocabulary or statistics table: factor to score/count.
pub type Vocab = HashMap<String, f64>;

/// Log-probability charged for a bigram that is absent from the transition
/// table during dynamic programming. Missing is interpreted as rare, not as
/// illegal.
pub const SMALL_LP: f64 = -100.0;

/// Minimum log-probability enforced on table entries after normalization.
pub const FLOOR_LP: f64 = -50.0;

/// Log-probability floor guaranteeing that single-character factors survive
/// pruning.
pub const ONE_CHAR_MIN_LP: f64 = -25.0;

/// Score of an unreached lattice state.
pub const MIN_LP: f64 = f64::NEG_INFINITY;

/// The reserved factor marking string starts and ends in the bigram model.
pub const DEFAULT_BOUNDARY: &str = "*";

/// Stable log(exp(a) + exp(b)).
#[inline(always)]
pub fn add_log(a: f64, b: f64) -> f64 {
    if a == MIN_LP {
        return b;
    }
    if b == MIN_LP {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Stable log(exp(a) - exp(b)) for a > b.
#[inline(always)]
pub fn sub_log(a: f64, b: f64) -> Result<f64> {
    if b >= a {
        return Err(LegatoError::numeric_underflow(a, b));
    }
    if b == MIN_LP {
        return Ok(a);
    }
    Ok(a + (-((b - a).exp())).ln_1p())
}

/// Byte offsets of the first byte of each character of `text`: codepoint
/// starts when `utf8` is set, every byte otherwise.
pub fn char_positions(text: &str, utf8: bool) -> Vec<usize> {
    if utf8 {
        text.char_indices().map(|(i, _)| i).collect()
    } else {
        (0..text.len()).collect()
    }
}

/// Length of a factor in characters (codepoints when `utf8`, bytes otherwise).
#[inline(always)]
pub fn factor_length(factor: &str, utf8: bool) -> usize {
    if utf8 {
        factor.chars().count()
    } else {
        factor.len()
    }
}

/// Collects vocabulary entries shorter than `min_length` characters. These
/// are permanently protected from removal.
pub fn find_short_factors(vocab: &Vocab, min_length: usize, utf8: bool) -> HashSet<String> {
    vocab
        .keys()
        .filter(|f| factor_length(f, utf8) < min_length)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_log() {
        let sum = add_log(0.5_f64.ln(), 0.25_f64.ln());
        assert!((sum - 0.75_f64.ln()).abs() < 1e-12);
        assert_eq!(add_log(MIN_LP, -1.0), -1.0);
        assert_eq!(add_log(-1.0, MIN_LP), -1.0);
    }

    #[test]
    fn test_add_log_symmetric() {
        let a = -3.25;
        let b = -17.5;
        assert_eq!(add_log(a, b), add_log(b, a));
    }

    #[test]
    fn test_sub_log() {
        let diff = sub_log(0.75_f64.ln(), 0.25_f64.ln()).unwrap();
        assert!((diff - 0.5_f64.ln()).abs() < 1e-12);
        assert!(sub_log(-2.0, -1.0).is_err());
        assert!(sub_log(-1.0, -1.0).is_err());
    }

    #[test]
    fn test_char_positions_bytes() {
        assert_eq!(char_positions("abc", false), vec![0, 1, 2]);
    }

    #[test]
    fn test_char_positions_utf8() {
        assert_eq!(char_positions("kääntää", true), vec![0, 1, 3, 5, 6, 7, 9]);
        assert_eq!(factor_length("kääntää", true), 7);
        assert_eq!(factor_length("kääntää", false), 11);
    }

    #[test]
    fn test_find_short_factors() {
        let mut vocab = Vocab::default();
        vocab.insert("a".to_string(), -1.0);
        vocab.insert("ä".to_string(), -1.0);
        vocab.insert("ab".to_string(), -1.0);
        let short = find_short_factors(&vocab, 2, true);
        assert!(short.contains("a"));
        assert!(short.contains("ä"));
        assert!(!short.contains("ab"));
        let short = find_short_factors(&vocab, 2, false);
        assert!(!short.contains("ä"));
    }
}
