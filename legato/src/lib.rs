//! Lattice-based subword vocabulary and bigram model trainer.
//!
//! Legato induces a subword (morph) lexicon and a bigram model over subwords
//! from a corpus of words with counts, or from raw sentences. Training
//! alternates expectation-maximization over segmentation lattices with
//! likelihood-guided pruning of the least useful subwords until a target
//! vocabulary size is reached.
#![deny(missing_docs)]

#[cfg(target_pointer_width = "16")]
compile_error!("`target_pointer_width` must be larger than or equal to 32");

pub mod arpa;
pub mod bigram;
pub mod common;
pub mod em;
pub mod errors;
pub mod factor_graph;
pub mod lexicon;
pub mod msfg;
pub mod pipeline;
pub mod transitions;
pub mod unigram;

#[cfg(test)]
mod tests;

pub use factor_graph::FactorGraph;
pub use lexicon::Lexicon;
pub use msfg::Msfg;
pub use transitions::Transitions;
