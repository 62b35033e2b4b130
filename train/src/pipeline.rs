use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use log::info;

use legato::errors::Result;
use legato::pipeline::{Pipeline, PipelineConfig};
use legato::unigram::read_vocab;

#[derive(Parser, Debug)]
#[clap(
    name = "pipeline",
    about = "Runs the whole training pipeline: unigram warmup, bigram seeding, and iterated bigram pruning."
)]
struct Args {
    /// Word list with counts.
    wordlist: PathBuf,

    /// Initial subword vocabulary.
    vocab_init: PathBuf,

    /// File the final transition table is written to.
    transitions_out: PathBuf,

    /// Target vocabulary size.
    #[clap(short = 'v', long, required = true)]
    vocab_size: usize,

    /// Unigram EM iterations before bigram seeding.
    #[clap(short = 'w', long, default_value = "2")]
    warmup: usize,

    /// Number of candidate subwords to try to remove per iteration.
    #[clap(short = 'c', long, default_value = "5000")]
    candidates: usize,

    /// Number of removals per iteration.
    #[clap(short = 'r', long, default_value = "500")]
    removals: usize,

    /// Minimum length of removable subwords.
    #[clap(short = 'm', long, default_value = "2")]
    min_length: usize,

    /// Kneser-Ney discount; plain maximum likelihood when absent.
    #[clap(short = 'd', long)]
    discount: Option<f64>,

    /// Write an intermediate model whenever the size crosses a multiple of
    /// N.
    #[clap(short = 't', long, default_value = "0")]
    temp_models: usize,

    /// Use forward-backward passes instead of Viterbi.
    #[clap(short = 'f', long)]
    forward_backward: bool,

    /// Worker threads for the backward passes.
    #[clap(long, default_value = "4")]
    threads: usize,

    /// Treat the input as UTF-8 codepoint sequences.
    #[clap(short = '8', long = "utf-8")]
    utf8: bool,
}

fn run(args: Args) -> Result<()> {
    let (vocab, _) = read_vocab(File::open(&args.vocab_init)?, args.utf8)?;
    let (words, _) = read_vocab(File::open(&args.wordlist)?, args.utf8)?;
    info!(
        "{} words, initial vocabulary size {}",
        words.len(),
        vocab.len()
    );

    let config = PipelineConfig {
        utf8: args.utf8,
        forward_backward: args.forward_backward,
        unigram_warmup_iters: args.warmup,
        n_candidates: args.candidates,
        removals_per_iter: args.removals,
        min_removal_length: args.min_length,
        target_vocab_size: args.vocab_size,
        temp_vocab_interval: args.temp_models,
        kn_discount: args.discount,
        threads: args.threads,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(words, vocab, config);
    pipeline.on_checkpoint(Box::new(|transitions, vocab_size| {
        let path = format!("transitions.{}", vocab_size);
        let mut wtr = BufWriter::new(File::create(&path)?);
        transitions.write(&mut wtr, false)?;
        info!("wrote {}", path);
        Ok(())
    }));
    pipeline.run()?;

    let mut wtr = BufWriter::new(File::create(&args.transitions_out)?);
    pipeline.transitions().write(&mut wtr, false)?;
    info!(
        "final vocabulary size {}",
        pipeline.transitions().num_sources()
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };
    if let Err(e) = run(args) {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
