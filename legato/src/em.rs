//! Viterbi and forward-backward passes over the segmentation lattices.
//!
//! All scores are natural-log probabilities and [`MIN_LP`] marks an
//! unreached state. Every pass iterates arcs in lattice order, never in hash
//! order, so results are deterministic given the input ordering. When two
//! paths tie exactly, the one through the earlier node index wins.

use hashbrown::HashMap;
use log::warn;

use crate::common::{add_log, char_positions, Vocab, MIN_LP, SMALL_LP};
use crate::errors::{LegatoError, Result};
use crate::factor_graph::FactorGraph;
use crate::lexicon::Lexicon;
use crate::msfg::Msfg;
use crate::transitions::Transitions;

/// Search token: predecessor byte position (-1 at the string start) and
/// accumulated cost.
#[derive(Clone, Copy)]
struct Token {
    source: isize,
    cost: f64,
}

// ------------------------------------------------------------------------
// 1-gram passes over trie-indexed text
// ------------------------------------------------------------------------

/// Finds the best segmentation of `text` under a unigram lexicon. Returns
/// ([`MIN_LP`], empty) when no segmentation exists.
pub fn viterbi(lexicon: &Lexicon, text: &str, utf8: bool) -> (f64, Vec<String>) {
    if text.is_empty() {
        return (MIN_LP, vec![]);
    }
    let bytes = text.as_bytes();
    let mut search = vec![
        Token {
            source: -1,
            cost: MIN_LP
        };
        text.len()
    ];

    for start in char_positions(text, utf8) {
        if start > 0 && search[start - 1].cost == MIN_LP {
            continue;
        }
        for m in lexicon.common_prefix_iterator(&bytes[start..]) {
            let end = start + m.end_byte - 1;
            let mut cost = m.score;
            if start > 0 {
                cost += search[start - 1].cost;
            }
            if cost > search[end].cost {
                search[end] = Token {
                    source: start as isize - 1,
                    cost,
                };
            }
        }
    }

    backtrace_tokens(text, &search)
}

/// Best unigram segmentation from a plain vocabulary map, considering
/// factors of up to `max_len` characters.
pub fn viterbi_map(
    vocab: &Vocab,
    max_len: usize,
    text: &str,
    utf8: bool,
) -> (f64, Vec<String>) {
    if text.is_empty() {
        return (MIN_LP, vec![]);
    }
    let mut search = vec![
        Token {
            source: -1,
            cost: MIN_LP
        };
        text.len()
    ];

    let positions = char_positions(text, utf8);
    for (i, &start) in positions.iter().enumerate() {
        if start > 0 && search[start - 1].cost == MIN_LP {
            continue;
        }
        for j in i..positions.len().min(i + max_len) {
            let end = if j + 1 < positions.len() {
                positions[j + 1]
            } else {
                text.len()
            };
            let score = match vocab.get(&text[start..end]) {
                Some(&score) => score,
                None => continue,
            };
            let mut cost = score;
            if start > 0 {
                cost += search[start - 1].cost;
            }
            if cost > search[end - 1].cost {
                search[end - 1] = Token {
                    source: start as isize - 1,
                    cost,
                };
            }
        }
    }

    backtrace_tokens(text, &search)
}

fn backtrace_tokens(text: &str, search: &[Token]) -> (f64, Vec<String>) {
    let mut target = search.len() - 1;
    if search[target].cost == MIN_LP {
        return (MIN_LP, vec![]);
    }
    let mut path = vec![];
    let mut source = search[target].source;
    loop {
        path.push(text[(source + 1) as usize..=target].to_string());
        if source == -1 {
            break;
        }
        target = source as usize;
        source = search[target].source;
    }
    path.reverse();
    (search[search.len() - 1].cost, path)
}

/// Viterbi segmentation adding one count per factor of the best path.
pub fn viterbi_stats(lexicon: &Lexicon, text: &str, utf8: bool, stats: &mut Vocab) -> f64 {
    let (lp, path) = viterbi(lexicon, text, utf8);
    for factor in path {
        *stats.entry(factor).or_insert(0.0) += 1.0;
    }
    lp
}

/// Viterbi segmentation under a unigram lexicon, collecting bigram counts
/// along the best path bracketed by the boundary symbol. This seeds the
/// bigram model from a unigram one.
pub fn viterbi_bigram_stats(
    lexicon: &Lexicon,
    text: &str,
    boundary: &str,
    utf8: bool,
    stats: &mut Transitions,
) -> f64 {
    let (lp, path) = viterbi(lexicon, text, utf8);
    if path.is_empty() {
        return MIN_LP;
    }
    let mut prev = boundary;
    for factor in &path {
        stats.add(prev, factor, 1.0);
        prev = factor;
    }
    stats.add(prev, boundary, 1.0);
    lp
}

fn forward_tokens(
    lexicon: &Lexicon,
    text: &str,
    utf8: bool,
    search: &mut [Vec<Token>],
    fw: &mut [f64],
) {
    let len = text.len();
    let bytes = text.as_bytes();
    for start in char_positions(text, utf8) {
        if start > 0 && search[start - 1].is_empty() {
            continue;
        }
        if start > 0 {
            let mut acc = search[start - 1][0].cost;
            for token in &search[start - 1][1..] {
                acc = add_log(acc, token.cost);
            }
            fw[start - 1] = acc;
        }
        for m in lexicon.common_prefix_iterator(&bytes[start..]) {
            let end = start + m.end_byte - 1;
            let mut cost = m.score;
            if start > 0 {
                cost += fw[start - 1];
            }
            search[end].push(Token {
                source: start as isize - 1,
                cost,
            });
        }
    }

    if search[len - 1].is_empty() {
        return;
    }
    let mut acc = search[len - 1][0].cost;
    for token in &search[len - 1][1..] {
        acc = add_log(acc, token.cost);
    }
    fw[len - 1] = acc;
}

fn backward_tokens(
    text: &str,
    search: &[Vec<Token>],
    fw: &[f64],
    bw: &mut [f64],
    stats: &mut Vocab,
) {
    let len = text.len();
    if search[len - 1].is_empty() {
        return;
    }
    for i in (0..len).rev() {
        if bw[i] == MIN_LP {
            continue;
        }
        for token in &search[i] {
            let normalized = token.cost - fw[i] + bw[i];
            *stats
                .entry_ref(&text[(token.source + 1) as usize..=i])
                .or_insert(0.0) += normalized.exp();
            if token.source == -1 {
                continue;
            }
            let source = token.source as usize;
            bw[source] = add_log(bw[source], normalized);
        }
    }
}

/// Forward-backward over a trie-indexed text: accumulates the posterior
/// count of every factor of every legal segmentation into `stats` and
/// returns the total log-likelihood, or [`MIN_LP`] when the text is
/// unsegmentable (then `stats` is untouched).
pub fn forward_backward(lexicon: &Lexicon, text: &str, utf8: bool, stats: &mut Vocab) -> f64 {
    let mut bw = vec![];
    forward_backward_with_bw(lexicon, text, utf8, stats, &mut bw)
}

/// [`forward_backward`] that also exposes the per-position backward scores,
/// the boundary-confidence signal of the posterior tools.
pub fn forward_backward_with_bw(
    lexicon: &Lexicon,
    text: &str,
    utf8: bool,
    stats: &mut Vocab,
    bw: &mut Vec<f64>,
) -> f64 {
    let len = text.len();
    if len == 0 {
        return MIN_LP;
    }
    let mut search: Vec<Vec<Token>> = vec![vec![]; len];
    let mut fw = vec![MIN_LP; len];
    bw.clear();
    bw.resize(len, MIN_LP);
    bw[len - 1] = 0.0;

    forward_tokens(lexicon, text, utf8, &mut search, &mut fw);
    if search[len - 1].is_empty() {
        return MIN_LP;
    }
    backward_tokens(text, &search, &fw, bw, stats);
    fw[len - 1]
}

/// [`forward_backward`] from a plain vocabulary map.
pub fn forward_backward_map(vocab: &Vocab, text: &str, utf8: bool, stats: &mut Vocab) -> f64 {
    let lexicon = Lexicon::from_vocab(vocab, true);
    forward_backward(&lexicon, text, utf8, stats)
}

// ------------------------------------------------------------------------
// 2-gram passes over a factor graph
// ------------------------------------------------------------------------

fn transition_cost(transitions: &Transitions, fg: &FactorGraph, src: usize, tgt: usize) -> f64 {
    transitions
        .get(fg.factor(src), fg.factor(tgt))
        .unwrap_or(SMALL_LP)
}

/// Finds the best path through a factor graph under a bigram model. The
/// returned path includes the boundary symbols. Transitions missing from
/// the table are charged [`SMALL_LP`].
pub fn viterbi_fg(transitions: &Transitions, fg: &mut FactorGraph) -> (f64, Vec<String>) {
    if fg.is_empty() {
        return (MIN_LP, vec![]);
    }
    let n = fg.num_nodes();
    let mut costs = vec![MIN_LP; n];
    let mut sources = vec![-1isize; n];
    costs[0] = 0.0;

    for i in 0..n {
        if costs[i] == MIN_LP {
            continue;
        }
        for k in 0..fg.nodes[i].outgoing.len() {
            let arc = fg.nodes[i].outgoing[k] as usize;
            let tgt = fg.arcs[arc].target as usize;
            let cost = transition_cost(transitions, fg, i, tgt);
            fg.arcs[arc].cost = cost;
            let new_cost = costs[i] + cost;
            if new_cost > costs[tgt] {
                costs[tgt] = new_cost;
                sources[tgt] = i as isize;
            }
        }
    }

    if costs[n - 1] == MIN_LP {
        return (MIN_LP, vec![]);
    }
    let mut path = vec![fg.factor(n - 1).to_string()];
    let mut node = sources[n - 1];
    while node != -1 {
        path.push(fg.factor(node as usize).to_string());
        node = sources[node as usize];
    }
    path.reverse();
    (costs[n - 1], path)
}

/// Bigram Viterbi adding `multiplier` per transition of the best path.
pub fn viterbi_fg_stats(
    transitions: &Transitions,
    fg: &mut FactorGraph,
    stats: &mut Transitions,
    multiplier: f64,
) -> f64 {
    let (lp, path) = viterbi_fg(transitions, fg);
    if path.len() < 2 {
        return MIN_LP;
    }
    for pair in path.windows(2) {
        stats.add(&pair[0], &pair[1], multiplier);
    }
    lp
}

fn forward_fg(transitions: &Transitions, fg: &mut FactorGraph, fw: &mut [f64]) {
    for i in 0..fg.num_nodes() {
        if fw[i] == MIN_LP {
            continue;
        }
        for k in 0..fg.nodes[i].outgoing.len() {
            let arc = fg.nodes[i].outgoing[k] as usize;
            let tgt = fg.arcs[arc].target as usize;
            let cost = transition_cost(transitions, fg, i, tgt);
            fg.arcs[arc].cost = cost;
            fw[tgt] = add_log(fw[tgt], fw[i] + cost);
        }
    }
}

fn backward_fg(fg: &FactorGraph, fw: &[f64], bw: &mut [f64], stats: &mut Transitions) {
    for i in (1..fg.num_nodes()).rev() {
        if bw[i] == MIN_LP {
            continue;
        }
        for &arc in &fg.nodes[i].incoming {
            let arc = &fg.arcs[arc as usize];
            let src = arc.source as usize;
            if fw[src] == MIN_LP {
                continue;
            }
            let cost = arc.cost + fw[src] - fw[i] + bw[i];
            stats.add(fg.factor(src), fg.factor(i), cost.exp());
            bw[src] = add_log(bw[src], cost);
        }
    }
}

/// Forward-backward over a factor graph under a bigram model: accumulates
/// the posterior of every transition into `stats` and returns the total
/// log-likelihood.
pub fn forward_backward_fg(
    transitions: &Transitions,
    fg: &mut FactorGraph,
    stats: &mut Transitions,
) -> f64 {
    if fg.is_empty() {
        return MIN_LP;
    }
    let n = fg.num_nodes();
    let mut fw = vec![MIN_LP; n];
    let mut bw = vec![MIN_LP; n];
    fw[0] = 0.0;
    bw[n - 1] = 0.0;

    forward_fg(transitions, fg, &mut fw);
    backward_fg(fg, &fw, &mut bw, stats);
    fw[n - 1]
}

/// [`forward_backward_fg`] that also sums, per character position, the
/// backward scores of the nodes whose factor ends there.
pub fn forward_backward_fg_posteriors(
    transitions: &Transitions,
    fg: &mut FactorGraph,
    stats: &mut Transitions,
    post_scores: &mut Vec<f64>,
) -> f64 {
    if fg.is_empty() {
        return MIN_LP;
    }
    let n = fg.num_nodes();
    let mut fw = vec![MIN_LP; n];
    let mut bw = vec![MIN_LP; n];
    fw[0] = 0.0;
    bw[n - 1] = 0.0;

    forward_fg(transitions, fg, &mut fw);
    backward_fg(fg, &fw, &mut bw, stats);

    post_scores.clear();
    post_scores.resize(fg.text().len(), MIN_LP);
    for i in 1..n - 1 {
        let node = &fg.nodes[i];
        let idx = node.start_pos + node.len - 1;
        post_scores[idx] = add_log(post_scores[idx], bw[i]);
    }
    fw[n - 1]
}

/// Forward-backward with one factor blocked: nodes carrying `block` are
/// skipped in both sweeps. Estimates the likelihood of "what if this factor
/// did not exist" without rebuilding the lattice.
pub fn forward_backward_fg_blocked(
    transitions: &Transitions,
    fg: &mut FactorGraph,
    stats: &mut Transitions,
    block: &str,
) -> f64 {
    if fg.is_empty() {
        return MIN_LP;
    }
    let n = fg.num_nodes();
    let mut fw = vec![MIN_LP; n];
    let mut bw = vec![MIN_LP; n];
    fw[0] = 0.0;
    bw[n - 1] = 0.0;

    for i in 0..n {
        if fw[i] == MIN_LP || fg.factor(i) == block {
            continue;
        }
        for k in 0..fg.nodes[i].outgoing.len() {
            let arc = fg.nodes[i].outgoing[k] as usize;
            let tgt = fg.arcs[arc].target as usize;
            if fg.factor(tgt) == block {
                continue;
            }
            let cost = transition_cost(transitions, fg, i, tgt);
            fg.arcs[arc].cost = cost;
            fw[tgt] = add_log(fw[tgt], fw[i] + cost);
        }
    }

    backward_fg(fg, &fw, &mut bw, stats);
    fw[n - 1]
}

/// Forward-backward over a factor graph with arcs scored by the unigram
/// probability of their target, collecting bigram posterior stats. This is
/// the bigram-seeding pass; every factor of the lattice, the boundary
/// included, must be present in `vocab`.
pub fn forward_backward_fg_unigram(
    vocab: &Vocab,
    fg: &mut FactorGraph,
    stats: &mut Transitions,
) -> Result<f64> {
    if fg.is_empty() {
        return Ok(MIN_LP);
    }
    let n = fg.num_nodes();
    let mut fw = vec![MIN_LP; n];
    let mut bw = vec![MIN_LP; n];
    fw[0] = 0.0;
    bw[n - 1] = 0.0;

    for i in 0..n {
        if fw[i] == MIN_LP {
            continue;
        }
        for k in 0..fg.nodes[i].outgoing.len() {
            let arc = fg.nodes[i].outgoing[k] as usize;
            let tgt = fg.arcs[arc].target as usize;
            let cost = *vocab.get(fg.factor(tgt)).ok_or_else(|| {
                LegatoError::model(format!(
                    "lattice factor absent from the vocabulary: {}",
                    fg.factor(tgt)
                ))
            })?;
            fg.arcs[arc].cost = cost;
            fw[tgt] = add_log(fw[tgt], fw[i] + cost);
        }
    }

    backward_fg(fg, &fw, &mut bw, stats);
    Ok(fw[n - 1])
}

/// Picks the path maximizing the sum of node posteriors under a bigram
/// model. The returned path includes the boundary symbols.
pub fn posterior_decode_fg(
    transitions: &Transitions,
    fg: &mut FactorGraph,
) -> (f64, Vec<String>) {
    if fg.is_empty() {
        return (MIN_LP, vec![]);
    }
    let n = fg.num_nodes();
    let mut fw = vec![MIN_LP; n];
    let mut bw = vec![MIN_LP; n];
    fw[0] = 0.0;
    bw[n - 1] = 0.0;

    let mut stats = Transitions::new();
    forward_fg(transitions, fg, &mut fw);
    backward_fg(fg, &fw, &mut bw, &mut stats);

    let mut costs = vec![MIN_LP; n];
    let mut sources = vec![-1isize; n];
    costs[0] = 0.0;

    for i in 0..n {
        if costs[i] == MIN_LP {
            continue;
        }
        for &arc in &fg.nodes[i].outgoing {
            let tgt = fg.arcs[arc as usize].target as usize;
            let new_cost = costs[i] + bw[tgt];
            if new_cost > costs[tgt] {
                costs[tgt] = new_cost;
                sources[tgt] = i as isize;
            }
        }
    }

    if costs[n - 1] == MIN_LP {
        return (MIN_LP, vec![]);
    }
    let mut path = vec![fg.factor(n - 1).to_string()];
    let mut node = sources[n - 1];
    while node != -1 {
        path.push(fg.factor(node as usize).to_string());
        node = sources[node as usize];
    }
    path.reverse();
    (costs[n - 1], path)
}

// ------------------------------------------------------------------------
// Passes over a multi-string factor graph
// ------------------------------------------------------------------------

/// Full forward sweep: one pass in topological order yields the forward
/// score of every node for every registered string at once. Arcs read their
/// cost through the cell handles stamped by the last assignment.
pub fn forward_msfg(msfg: &Msfg, costs: &[f64], fw: &mut Vec<f64>) {
    fw.clear();
    fw.resize(msfg.num_nodes(), MIN_LP);
    fw[0] = 0.0;
    for &i in msfg.topo() {
        let i = i as usize;
        if fw[i] == MIN_LP {
            continue;
        }
        for &arc in &msfg.nodes[i].outgoing {
            let arc = &msfg.arcs[arc as usize];
            let cost = fw[i] + costs[arc.cell as usize];
            let tgt = arc.target as usize;
            fw[tgt] = add_log(fw[tgt], cost);
        }
    }
}

/// Forward sweep restricted to the sub-lattice of one string. Returns the
/// sparse forward scores; absent keys are unreached.
pub fn forward_msfg_text(
    msfg: &Msfg,
    costs: &[f64],
    text: &str,
) -> Result<HashMap<u32, f64>> {
    let end = msfg
        .string_end_node(text)
        .ok_or_else(|| LegatoError::model(format!("string is not in the graph: {}", text)))?;
    let reachable = msfg.reachable_from_end(end);

    let mut fw: HashMap<u32, f64> = HashMap::new();
    fw.insert(0, 0.0);
    for &i in msfg.topo() {
        if !reachable.contains(&i) {
            continue;
        }
        let source_score = match fw.get(&i) {
            Some(&score) => score,
            None => continue,
        };
        for &arc in &msfg.nodes[i as usize].outgoing {
            let arc = &msfg.arcs[arc as usize];
            if !reachable.contains(&arc.target) {
                continue;
            }
            let cost = source_score + costs[arc.cell as usize];
            let entry = fw.entry(arc.target).or_insert(MIN_LP);
            *entry = add_log(*entry, cost);
        }
    }
    Ok(fw)
}

/// Backward sweep for one string given forward scores, attributing the
/// posterior of every transition to `stats` with the string's corpus
/// weight. Returns the string's log-likelihood, unweighted.
pub fn backward_msfg_text<F>(
    msfg: &Msfg,
    costs: &[f64],
    text: &str,
    fw: F,
    stats: &mut Transitions,
    text_weight: f64,
) -> Result<f64>
where
    F: Fn(u32) -> f64,
{
    let end = msfg
        .string_end_node(text)
        .ok_or_else(|| LegatoError::model(format!("string is not in the graph: {}", text)))?;
    if fw(end) == MIN_LP {
        return Ok(MIN_LP);
    }
    let reachable = msfg.reachable_from_end(end);

    let mut bw: HashMap<u32, f64> = HashMap::new();
    bw.insert(end, 0.0);
    for &i in msfg.topo().iter().rev() {
        if !reachable.contains(&i) {
            continue;
        }
        let bw_i = match bw.get(&i) {
            Some(&score) => score,
            None => continue,
        };
        for &arc in &msfg.nodes[i as usize].incoming {
            let arc = &msfg.arcs[arc as usize];
            let src = arc.source;
            let fw_src = fw(src);
            if fw_src == MIN_LP {
                continue;
            }
            let cost = costs[arc.cell as usize] + fw_src - fw(i) + bw_i;
            stats.add(
                &msfg.nodes[src as usize].factor,
                &msfg.nodes[i as usize].factor,
                text_weight * cost.exp(),
            );
            let entry = bw.entry(src).or_insert(MIN_LP);
            *entry = add_log(*entry, cost);
        }
    }
    Ok(fw(end))
}

/// Full forward-backward: a single forward sweep, then one backward per
/// registered string. Returns the corpus log-likelihood, the sum of
/// per-string likelihoods weighted by the corpus frequencies.
pub fn forward_backward_msfg(
    msfg: &Msfg,
    costs: &[f64],
    word_freqs: &Vocab,
    stats: &mut Transitions,
) -> Result<f64> {
    if msfg.num_nodes() == 0 {
        return Ok(MIN_LP);
    }
    let mut fw = vec![];
    forward_msfg(msfg, costs, &mut fw);

    let mut total_lp = 0.0;
    for (text, _) in msfg.texts() {
        let weight = *word_freqs.get(text).ok_or_else(|| {
            LegatoError::model(format!("string has no corpus weight: {}", text))
        })?;
        let lp = backward_msfg_text(msfg, costs, text, |n| fw[n as usize], stats, weight)?;
        if lp == MIN_LP {
            warn!("no segmentation for string: {}", text);
            continue;
        }
        total_lp += weight * lp;
    }
    Ok(total_lp)
}

/// Forward-backward for a single registered string with unit weight.
pub fn forward_backward_msfg_text(
    msfg: &Msfg,
    costs: &[f64],
    text: &str,
    stats: &mut Transitions,
) -> Result<f64> {
    let fw = forward_msfg_text(msfg, costs, text)?;
    backward_msfg_text(
        msfg,
        costs,
        text,
        |n| fw.get(&n).copied().unwrap_or(MIN_LP),
        stats,
        1.0,
    )
}

/// Best path for one registered string, boundary symbols included.
pub fn viterbi_msfg_text(msfg: &Msfg, costs: &[f64], text: &str) -> Result<(f64, Vec<String>)> {
    let end = msfg
        .string_end_node(text)
        .ok_or_else(|| LegatoError::model(format!("string is not in the graph: {}", text)))?;
    let reachable = msfg.reachable_from_end(end);

    // Max-plus from the end; `succ` points towards the end node.
    let mut scores: HashMap<u32, f64> = HashMap::new();
    let mut succ: HashMap<u32, u32> = HashMap::new();
    scores.insert(end, 0.0);
    for &i in msfg.topo().iter().rev() {
        if !reachable.contains(&i) {
            continue;
        }
        let score_i = match scores.get(&i) {
            Some(&score) => score,
            None => continue,
        };
        for &arc in &msfg.nodes[i as usize].incoming {
            let arc = &msfg.arcs[arc as usize];
            let cost = score_i + costs[arc.cell as usize];
            let better = match scores.get(&arc.source) {
                Some(&old) => cost > old,
                None => true,
            };
            if better {
                scores.insert(arc.source, cost);
                succ.insert(arc.source, i);
            }
        }
    }

    let best = match scores.get(&0) {
        Some(&best) => best,
        None => return Ok((MIN_LP, vec![])),
    };
    let mut path = vec![];
    let mut node = 0;
    loop {
        path.push(msfg.nodes[node as usize].factor.clone());
        if node == end {
            break;
        }
        node = succ[&node];
    }
    Ok((best, path))
}

/// [`viterbi_msfg_text`] adding `multiplier` per transition of the best
/// path.
pub fn viterbi_msfg_text_stats(
    msfg: &Msfg,
    costs: &[f64],
    text: &str,
    stats: &mut Transitions,
    multiplier: f64,
) -> Result<f64> {
    let (lp, path) = viterbi_msfg_text(msfg, costs, text)?;
    for pair in path.windows(2) {
        stats.add(&pair[0], &pair[1], multiplier);
    }
    Ok(lp)
}

/// Full Viterbi sweep: max-plus forward with backpointers, then one
/// backtrace per registered string writing bigram counts weighted by the
/// corpus frequency. Returns the weighted corpus log-likelihood.
pub fn viterbi_msfg(
    msfg: &Msfg,
    costs: &[f64],
    word_freqs: &Vocab,
    stats: &mut Transitions,
) -> Result<f64> {
    if msfg.num_nodes() == 0 {
        return Ok(MIN_LP);
    }
    let mut fw = vec![MIN_LP; msfg.num_nodes()];
    let mut sources = vec![-1isize; msfg.num_nodes()];
    fw[0] = 0.0;

    for &i in msfg.topo() {
        let i = i as usize;
        if fw[i] == MIN_LP {
            continue;
        }
        for &arc in &msfg.nodes[i].outgoing {
            let arc = &msfg.arcs[arc as usize];
            let cost = fw[i] + costs[arc.cell as usize];
            let tgt = arc.target as usize;
            if cost > fw[tgt] {
                fw[tgt] = cost;
                sources[tgt] = i as isize;
            }
        }
    }

    let mut total_lp = 0.0;
    for (text, end) in msfg.texts() {
        let weight = *word_freqs.get(text).ok_or_else(|| {
            LegatoError::model(format!("string has no corpus weight: {}", text))
        })?;
        if fw[*end as usize] == MIN_LP {
            warn!("no segmentation for string: {}", text);
            continue;
        }
        let mut node = *end as usize;
        while node != 0 {
            let source = sources[node];
            if source < 0 {
                return Err(LegatoError::model(format!(
                    "could not backtrack the best path for: {}",
                    text
                )));
            }
            stats.add(
                &msfg.nodes[source as usize].factor,
                &msfg.nodes[node].factor,
                weight,
            );
            node = source as usize;
        }
        total_lp += weight * fw[*end as usize];
    }
    Ok(total_lp)
}

/// Log-likelihood of one string, computed backwards from its end node:
/// sum-product when `forward_backward` is set, max-product otherwise.
pub fn likelihood_msfg_text(
    msfg: &Msfg,
    costs: &[f64],
    text: &str,
    forward_backward: bool,
) -> Result<f64> {
    likelihood_blocked_msfg_text(msfg, costs, text, None, forward_backward)
}

/// [`likelihood_msfg_text`] with an optionally blocked factor: nodes
/// carrying it are skipped, estimating the likelihood without the factor.
pub fn likelihood_blocked_msfg_text(
    msfg: &Msfg,
    costs: &[f64],
    text: &str,
    blocked: Option<&str>,
    forward_backward: bool,
) -> Result<f64> {
    let end = msfg
        .string_end_node(text)
        .ok_or_else(|| LegatoError::model(format!("string is not in the graph: {}", text)))?;
    let reachable = msfg.reachable_from_end(end);

    let mut acc: HashMap<u32, f64> = HashMap::new();
    acc.insert(end, 0.0);
    for &i in msfg.topo().iter().rev() {
        if !reachable.contains(&i) {
            continue;
        }
        if let Some(blocked) = blocked {
            if msfg.nodes[i as usize].factor == blocked {
                continue;
            }
        }
        let acc_i = match acc.get(&i) {
            Some(&score) => score,
            None => continue,
        };
        for &arc in &msfg.nodes[i as usize].incoming {
            let arc = &msfg.arcs[arc as usize];
            if let Some(blocked) = blocked {
                if msfg.nodes[arc.source as usize].factor == blocked {
                    continue;
                }
            }
            let cost = acc_i + costs[arc.cell as usize];
            let entry = acc.entry(arc.source).or_insert(MIN_LP);
            *entry = if forward_backward {
                add_log(*entry, cost)
            } else {
                entry.max(cost)
            };
        }
    }
    Ok(acc.get(&0).copied().unwrap_or(MIN_LP))
}

/// Weighted log-likelihood of a selection of registered strings.
pub fn likelihood_msfg_selected(
    msfg: &Msfg,
    costs: &[f64],
    word_freqs: &Vocab,
    selected: &[String],
    forward_backward: bool,
) -> Result<f64> {
    let mut total_lp = 0.0;
    for text in selected {
        let weight = *word_freqs.get(text).ok_or_else(|| {
            LegatoError::model(format!("string has no corpus weight: {}", text))
        })?;
        total_lp += weight * likelihood_msfg_text(msfg, costs, text, forward_backward)?;
    }
    Ok(total_lp)
}
