use super::vocab;
use crate::common::{Vocab, MIN_LP};
use crate::em;
use crate::factor_graph::FactorGraph;
use crate::lexicon::Lexicon;
use crate::transitions::Transitions;

fn transitions(entries: &[(&str, &str, f64)]) -> Transitions {
    let mut t = Transitions::new();
    for (src, tgt, lp) in entries {
        t.set(src, tgt, *lp);
    }
    t
}

#[test]
fn test_unigram_viterbi_map() {
    let v = vocab(&[("a", -1.0), ("bc", -2.0)]);
    let (lp, path) = em::viterbi_map(&v, 2, "abc", false);
    assert_eq!(path, vec!["a", "bc"]);
    assert!((lp - -3.0).abs() < 1e-12);
}

#[test]
fn test_unigram_viterbi_prefers_better_prefix() {
    let v = vocab(&[("a", -1.0), ("bc", -2.0), ("ab", 0.0), ("c", 0.0)]);
    let (lp, path) = em::viterbi_map(&v, 2, "abc", false);
    assert_eq!(path, vec!["ab", "c"]);
    assert!(lp.abs() < 1e-12);

    let lexicon = Lexicon::from_vocab(&v, true);
    let (lp, path) = em::viterbi(&lexicon, "abc", false);
    assert_eq!(path, vec!["ab", "c"]);
    assert!(lp.abs() < 1e-12);
}

#[test]
fn test_unigram_viterbi_unsegmentable() {
    let v = vocab(&[("a", -1.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let (lp, path) = em::viterbi(&lexicon, "ax", false);
    assert_eq!(lp, MIN_LP);
    assert!(path.is_empty());
}

#[test]
fn test_unigram_forward_backward_posteriors() {
    let v = vocab(&[
        ("a", 0.25_f64.ln()),
        ("sa", 0.25_f64.ln()),
        ("s", 0.25_f64.ln()),
        ("ki", 0.50_f64.ln()),
        ("kis", 0.50_f64.ln()),
    ]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut stats = Vocab::default();
    let ll = em::forward_backward(&lexicon, "kissa", false, &mut stats);

    // Segmentations: ki+s+sa, kis+sa, kis+s+a, ki+s+s+a.
    assert!((ll - 0.1953125_f64.ln()).abs() < 1e-9);
    assert!((ll - -1.63315).abs() < 1e-5);
    assert!((stats["kis"] - 0.8).abs() < 1e-9);
    assert!((stats["ki"] - 0.2).abs() < 1e-9);
    assert!((stats["sa"] - 0.8).abs() < 1e-9);
    assert!((stats["s"] - 0.4).abs() < 1e-9);
    assert!((stats["a"] - 0.2).abs() < 1e-9);
}

#[test]
fn test_unigram_viterbi_not_above_forward_backward() {
    let v = vocab(&[
        ("a", 0.25_f64.ln()),
        ("sa", 0.25_f64.ln()),
        ("s", 0.25_f64.ln()),
        ("ki", 0.50_f64.ln()),
        ("kis", 0.50_f64.ln()),
    ]);
    let lexicon = Lexicon::from_vocab(&v, true);
    for text in ["kissa", "kisa", "sas"] {
        let (viterbi_lp, _) = em::viterbi(&lexicon, text, false);
        let mut stats = Vocab::default();
        let fb_lp = em::forward_backward(&lexicon, text, false, &mut stats);
        assert!(viterbi_lp <= fb_lp + 1e-12, "{}", text);
    }
}

#[test]
fn test_bigram_viterbi_with_boundary() {
    let v = vocab(&[("a", 0.0), ("bc", 0.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let t = transitions(&[("*", "a", -1.0), ("a", "bc", -1.0), ("bc", "*", -1.0)]);
    let (lp, path) = em::viterbi_fg(&t, &mut fg);
    assert_eq!(path, vec!["*", "a", "bc", "*"]);
    assert!((lp - -3.0).abs() < 1e-12);
}

#[test]
fn test_bigram_viterbi_ties_resolve_to_earlier_node() {
    let v = vocab(&[("a", 0.0), ("b", 0.0), ("ab", 0.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("ab", "*", &lexicon, false);
    // Both paths cost -3; the arc from the earlier node ("ab" is created
    // before "b"'s predecessor chain completes) must win.
    let t = transitions(&[
        ("*", "a", -1.0),
        ("*", "ab", -2.0),
        ("a", "b", -1.0),
        ("b", "*", -1.0),
        ("ab", "*", -1.0),
    ]);
    let (lp, path) = em::viterbi_fg(&t, &mut fg);
    assert!((lp - -3.0).abs() < 1e-12);
    assert_eq!(path, vec!["*", "ab", "*"]);
}

#[test]
fn test_bigram_viterbi_charges_small_lp_for_missing_pairs() {
    let v = vocab(&[("a", 0.0), ("b", 0.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("ab", "*", &lexicon, false);
    let t = transitions(&[("*", "a", -1.0), ("a", "b", -1.0)]);
    let (lp, path) = em::viterbi_fg(&t, &mut fg);
    assert_eq!(path, vec!["*", "a", "b", "*"]);
    // The final transition is absent and costs SMALL_LP.
    assert!((lp - (-2.0 + crate::common::SMALL_LP)).abs() < 1e-12);
}

fn abc_model() -> (Vocab, Transitions) {
    let v = vocab(&[("a", 0.0), ("b", 0.0), ("c", 0.0), ("ab", 0.0), ("bc", 0.0)]);
    let t = transitions(&[
        ("*", "a", 0.5_f64.ln()),
        ("*", "ab", 0.5_f64.ln()),
        ("a", "b", 0.5_f64.ln()),
        ("a", "bc", 0.5_f64.ln()),
        ("b", "c", 0.0),
        ("ab", "c", 0.0),
        ("c", "*", 0.0),
        ("bc", "*", 0.0),
    ]);
    (v, t)
}

#[test]
fn test_bigram_forward_backward_posterior_mass() {
    let (v, t) = abc_model();
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let mut stats = Transitions::new();
    let ll = em::forward_backward_fg(&t, &mut fg, &mut stats);

    // The model is normalized over the lattice, so the likelihood is one
    // and the posteriors crossing the sentinels each sum to one.
    assert!(ll.abs() < 1e-12);
    let from_start: f64 = stats.row_sorted("*").iter().map(|(_, p)| p).sum();
    assert!((from_start - 1.0).abs() < 1e-9);
    let into_end = stats.get("c", "*").unwrap() + stats.get("bc", "*").unwrap();
    assert!((into_end - 1.0).abs() < 1e-9);
    assert!((stats.get("c", "*").unwrap() - 0.75).abs() < 1e-9);
    assert!((stats.get("bc", "*").unwrap() - 0.25).abs() < 1e-9);
}

#[test]
fn test_bigram_viterbi_not_above_forward_backward() {
    let (v, t) = abc_model();
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let (viterbi_lp, _) = em::viterbi_fg(&t, &mut fg);
    let mut stats = Transitions::new();
    let fb_lp = em::forward_backward_fg(&t, &mut fg, &mut stats);
    assert!(viterbi_lp <= fb_lp + 1e-12);
    assert!((viterbi_lp - 0.5_f64.ln()).abs() < 1e-12);
}

#[test]
fn test_bigram_forward_backward_blocked() {
    let (v, t) = abc_model();
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let mut stats = Transitions::new();
    let ll = em::forward_backward_fg_blocked(&t, &mut fg, &mut stats, "ab");

    // Without "ab" the remaining mass is a+b+c and a+bc.
    assert!((ll - 0.5_f64.ln()).abs() < 1e-9);
    assert!(stats.get("ab", "c").is_none());
    assert!(stats.get("*", "ab").is_none());
}

#[test]
fn test_bigram_forward_backward_per_character_posteriors() {
    let (v, t) = abc_model();
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let mut stats = Transitions::new();
    let mut post = vec![];
    let ll = em::forward_backward_fg_posteriors(&t, &mut fg, &mut stats, &mut post);
    assert!(ll.abs() < 1e-12);
    assert_eq!(post.len(), 3);
    // Every segmentation has a factor ending at the last character.
    assert!(post[2].exp() > 0.99);
}

#[test]
fn test_posterior_decode_returns_full_path() {
    let (v, t) = abc_model();
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let (lp, path) = em::posterior_decode_fg(&t, &mut fg);
    assert!(lp > MIN_LP);
    assert_eq!(path.first().map(String::as_str), Some("*"));
    assert_eq!(path.last().map(String::as_str), Some("*"));
    let joined: String = path[1..path.len() - 1].join("");
    assert_eq!(joined, "abc");
}

#[test]
fn test_unigram_seeding_collects_bigram_stats() {
    let v = vocab(&[("a", 0.5_f64.ln()), ("b", 0.5_f64.ln())]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut stats = Transitions::new();
    let lp = em::viterbi_bigram_stats(&lexicon, "ab", "*", false, &mut stats);
    assert!((lp - 0.25_f64.ln()).abs() < 1e-12);
    assert_eq!(stats.get("*", "a"), Some(1.0));
    assert_eq!(stats.get("a", "b"), Some(1.0));
    assert_eq!(stats.get("b", "*"), Some(1.0));
}

#[test]
fn test_fg_unigram_forward_backward_requires_boundary_score() {
    let v = vocab(&[("a", 0.5_f64.ln()), ("b", 0.5_f64.ln())]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("ab", "*", &lexicon, false);
    let mut stats = Transitions::new();
    assert!(em::forward_backward_fg_unigram(&v, &mut fg, &mut stats).is_err());

    let mut with_boundary = v.clone();
    with_boundary.insert("*".to_string(), 0.0);
    let ll = em::forward_backward_fg_unigram(&with_boundary, &mut fg, &mut stats).unwrap();
    assert!((ll - 0.25_f64.ln()).abs() < 1e-12);
    assert!((stats.get("a", "b").unwrap() - 1.0).abs() < 1e-9);
}
