use super::vocab;
use crate::common::Vocab;
use crate::em;
use crate::errors::Result;
use crate::factor_graph::FactorGraph;
use crate::lexicon::Lexicon;
use crate::msfg::Msfg;
use crate::transitions::Transitions;

fn kissa_vocab() -> Vocab {
    let mut v = vocab(&[
        ("k", 0.1_f64.ln()),
        ("i", 0.1_f64.ln()),
        ("s", 0.2_f64.ln()),
        ("a", 0.1_f64.ln()),
        ("sa", 0.2_f64.ln()),
        ("ki", 0.1_f64.ln()),
        ("kis", 0.2_f64.ln()),
    ]);
    v.insert("*".to_string(), 0.0);
    v
}

fn build_msfg(words: &[&str], v: &Vocab) -> Result<Msfg> {
    let lexicon = Lexicon::from_vocab(v, true);
    let mut msfg = Msfg::new("*");
    for word in words {
        let fg = FactorGraph::new(word, "*", &lexicon, false);
        msfg.add(&fg)?;
    }
    Ok(msfg)
}

#[test]
fn test_add_shares_prefixes() {
    let v = kissa_vocab();
    let lexicon = Lexicon::from_vocab(&v, true);
    let mut msfg = Msfg::new("*");
    let mut separate_nodes = 0;
    for word in ["kissa", "kisa"] {
        let fg = FactorGraph::new(word, "*", &lexicon, false);
        separate_nodes += fg.num_nodes();
        msfg.add(&fg).unwrap();
    }
    assert_eq!(msfg.texts().len(), 2);
    assert!(msfg.num_nodes() < separate_nodes);
    assert_ne!(
        msfg.string_end_node("kissa").unwrap(),
        msfg.string_end_node("kisa").unwrap()
    );
}

#[test]
fn test_num_paths_matches_factor_graph() {
    let v = kissa_vocab();
    let lexicon = Lexicon::from_vocab(&v, true);
    let msfg = build_msfg(&["kissa", "kisa"], &v).unwrap();
    for word in ["kissa", "kisa"] {
        let fg = FactorGraph::new(word, "*", &lexicon, false);
        assert_eq!(msfg.num_paths(word), fg.num_paths(), "{}", word);
    }
    assert_eq!(msfg.num_paths("unknown"), 0);
}

#[test]
fn test_add_rejects_unsegmentable_string() {
    let v = vocab(&[("a", -1.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);
    let fg = FactorGraph::new("ax", "*", &lexicon, false);
    let mut msfg = Msfg::new("*");
    assert!(msfg.add(&fg).is_err());
}

#[test]
fn test_path_coverage() {
    // Every factor of every legal segmentation must be in the factor-node
    // map.
    let v = kissa_vocab();
    let lexicon = Lexicon::from_vocab(&v, true);
    let msfg = build_msfg(&["kissa", "kisa"], &v).unwrap();
    for word in ["kissa", "kisa"] {
        let fg = FactorGraph::new(word, "*", &lexicon, false);
        for path in fg.paths() {
            for factor in path {
                assert!(
                    msfg.factor_node_map.contains_key(&factor),
                    "missing {}",
                    factor
                );
            }
        }
        let collected = msfg.collect_factors(word).unwrap();
        assert!(collected.contains("sa"));
    }
}

#[test]
fn test_unigram_scored_equivalence_with_factor_graphs() {
    // The merged lattice must reproduce the per-string forward-backward
    // stats and likelihoods exactly.
    let v = kissa_vocab();
    let words = vocab(&[("kissa", 1.0), ("kisa", 2.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);

    let mut fg_stats = Transitions::new();
    let mut fg_total = 0.0;
    for (word, weight) in [("kissa", 1.0), ("kisa", 2.0)] {
        let mut fg = FactorGraph::new(word, "*", &lexicon, false);
        let mut local = Transitions::new();
        let lp = em::forward_backward_fg_unigram(&v, &mut fg, &mut local).unwrap();
        fg_stats.add_all(&local, weight);
        fg_total += weight * lp;
    }

    let mut msfg = build_msfg(&["kissa", "kisa"], &v).unwrap();
    let cells = msfg.assign_unigram_scores(&v).unwrap();
    let mut msfg_stats = Transitions::new();
    let msfg_total = em::forward_backward_msfg(&msfg, &cells, &words, &mut msfg_stats).unwrap();

    assert!((fg_total - msfg_total).abs() < 1e-10);
    assert_eq!(fg_stats.transition_count(), msfg_stats.transition_count());
    for src in fg_stats.sources_sorted() {
        for (tgt, value) in fg_stats.row_sorted(&src) {
            let other = msfg_stats.get(&src, &tgt).unwrap();
            assert!((value - other).abs() < 1e-10, "{} {}", src, tgt);
        }
    }
}

#[test]
fn test_forward_handles_out_of_order_diamonds() {
    // {a, b, c, d, abc} over "abcd" creates an arc from a late-created node
    // back to an earlier one; the sweep must follow the topological order,
    // not the creation order.
    let mut v = vocab(&[
        ("a", 0.2_f64.ln()),
        ("b", 0.2_f64.ln()),
        ("c", 0.2_f64.ln()),
        ("d", 0.2_f64.ln()),
        ("abc", 0.2_f64.ln()),
    ]);
    v.insert("*".to_string(), 0.0);
    let words = vocab(&[("abcd", 1.0)]);
    let lexicon = Lexicon::from_vocab(&v, true);

    let mut fg = FactorGraph::new("abcd", "*", &lexicon, false);
    let mut fg_stats = Transitions::new();
    let fg_ll = em::forward_backward_fg_unigram(&v, &mut fg, &mut fg_stats).unwrap();

    let mut msfg = build_msfg(&["abcd"], &v).unwrap();
    let cells = msfg.assign_unigram_scores(&v).unwrap();
    let mut msfg_stats = Transitions::new();
    let msfg_ll = em::forward_backward_msfg(&msfg, &cells, &words, &mut msfg_stats).unwrap();

    assert!((fg_ll - msfg_ll).abs() < 1e-10);
    let value = msfg_stats.get("abc", "d").unwrap();
    assert!((value - fg_stats.get("abc", "d").unwrap()).abs() < 1e-10);
}

#[test]
fn test_bigram_scored_equivalence_with_factor_graph() {
    let v = vocab(&[("a", 0.0), ("b", 0.0), ("c", 0.0), ("ab", 0.0), ("bc", 0.0)]);
    let mut t = Transitions::new();
    for (src, tgt, lp) in [
        ("*", "a", 0.5_f64.ln()),
        ("*", "ab", 0.5_f64.ln()),
        ("a", "b", 0.5_f64.ln()),
        ("a", "bc", 0.5_f64.ln()),
        ("b", "c", 0.0),
        ("ab", "c", 0.0),
        ("c", "*", 0.0),
        ("bc", "*", 0.0),
    ] {
        t.set(src, tgt, lp);
    }

    let lexicon = Lexicon::from_vocab(&v, true);
    let mut fg = FactorGraph::new("abc", "*", &lexicon, false);
    let mut fg_stats = Transitions::new();
    let fg_ll = em::forward_backward_fg(&t, &mut fg, &mut fg_stats);

    let mut msfg = build_msfg(&["abc"], &v).unwrap();
    msfg.assign_scores(&t).unwrap();
    let mut msfg_stats = Transitions::new();
    let msfg_ll =
        em::forward_backward_msfg_text(&msfg, t.cells(), "abc", &mut msfg_stats).unwrap();

    assert!((fg_ll - msfg_ll).abs() < 1e-10);
    for src in fg_stats.sources_sorted() {
        for (tgt, value) in fg_stats.row_sorted(&src) {
            let other = msfg_stats.get(&src, &tgt).unwrap();
            assert!((value - other).abs() < 1e-10, "{} {}", src, tgt);
        }
    }

    let (viterbi_lp, path) = em::viterbi_msfg_text(&msfg, t.cells(), "abc").unwrap();
    assert!(viterbi_lp <= msfg_ll + 1e-12);
    assert_eq!(path.first().map(String::as_str), Some("*"));
    assert_eq!(path.last().map(String::as_str), Some("*"));
}

#[test]
fn test_likelihood_blocked_matches_reduced_lattice() {
    let v = kissa_vocab();
    let mut msfg = build_msfg(&["kissa"], &v).unwrap();
    let cells = msfg.assign_unigram_scores(&v).unwrap();

    let blocked =
        em::likelihood_blocked_msfg_text(&msfg, &cells, "kissa", Some("kis"), true).unwrap();

    // Blocking "kis" must equal removing it from the vocabulary.
    let mut reduced = v.clone();
    reduced.remove("kis");
    let mut reduced_msfg = build_msfg(&["kissa"], &reduced).unwrap();
    let reduced_cells = reduced_msfg.assign_unigram_scores(&reduced).unwrap();
    let expected =
        em::likelihood_msfg_text(&reduced_msfg, &reduced_cells, "kissa", true).unwrap();

    assert!((blocked - expected).abs() < 1e-10);

    let full = em::likelihood_msfg_text(&msfg, &cells, "kissa", true).unwrap();
    assert!(blocked < full);
}

#[test]
fn test_remove_arcs_safety() {
    let v = kissa_vocab();
    let mut msfg = build_msfg(&["kissa", "kisa"], &v).unwrap();
    let paths_before = msfg.num_paths("kissa");
    msfg.remove_arcs("kis");

    assert!(!msfg.factor_node_map.contains_key("kis"));
    assert!(!msfg.collect_factors("kissa").unwrap().contains("kis"));
    // Both strings stay segmentable through the single-character factors.
    assert!(msfg.num_paths("kissa") >= 1);
    assert!(msfg.num_paths("kissa") < paths_before);
    assert!(msfg.num_paths("kisa") >= 1);
}

#[test]
fn test_remove_arcs_can_make_string_unsegmentable() {
    let v = vocab(&[("a", -1.0), ("bc", -1.0)]);
    let mut with_boundary = v.clone();
    with_boundary.insert("*".to_string(), 0.0);
    let mut msfg = build_msfg(&["abc"], &with_boundary).unwrap();
    msfg.remove_arcs("bc");
    assert_eq!(msfg.num_paths("abc"), 0);
}

#[test]
fn test_serialization_round_trip() {
    let v = kissa_vocab();
    let msfg = build_msfg(&["kissa", "kisa"], &v).unwrap();
    let mut buf = vec![];
    msfg.write(&mut buf).unwrap();
    let back = Msfg::read(buf.as_slice(), "*").unwrap();
    assert!(msfg.assert_equal(&back));
    assert_eq!(back.num_paths("kissa"), msfg.num_paths("kissa"));

    // And the round trip again after a mutation.
    let mut mutated = back;
    mutated.remove_arcs("kis");
    let mut buf = vec![];
    mutated.write(&mut buf).unwrap();
    let back = Msfg::read(buf.as_slice(), "*").unwrap();
    assert!(mutated.assert_equal(&back));
}

#[test]
fn test_read_rejects_cycles() {
    let file = "2 2 0\nn 0 *\nn 1 ab\na 0 1\na 1 0\n";
    assert!(Msfg::read(file.as_bytes(), "*").is_err());
}

#[test]
fn test_read_rejects_bad_sentinel() {
    let file = "1 0 0\nn 0 ab\n";
    assert!(Msfg::read(file.as_bytes(), "*").is_err());
}

#[test]
fn test_prune_unused_drops_stale_factors() {
    let v = kissa_vocab();
    let mut msfg = build_msfg(&["kissa"], &v).unwrap();
    let mut t = Transitions::new();
    // A model that only knows the whole-word segmentation path factors.
    for (src, tgt) in [("*", "kis"), ("kis", "sa"), ("sa", "*")] {
        t.set(src, tgt, -1.0);
    }
    msfg.prune_unused(&t);
    assert!(!msfg.factor_node_map.contains_key("ki"));
    assert!(msfg.factor_node_map.contains_key("kis"));
    assert!(msfg.num_paths("kissa") >= 1);
}
