use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use hashbrown::HashSet;
use log::info;

use legato::bigram::{BigramTrainer, Reestimate};
use legato::common::{find_short_factors, DEFAULT_BOUNDARY};
use legato::errors::Result;
use legato::unigram::read_vocab;
use legato::{Msfg, Transitions};

#[derive(Parser, Debug)]
#[clap(
    name = "bigram-kn",
    about = "Bigram pruning with Kneser-Ney smoothed re-estimation."
)]
struct Args {
    /// Word list with counts.
    wordlist: PathBuf,

    /// Initial transition table.
    transitions_init: PathBuf,

    /// Multi-string factor graph built from the same vocabulary.
    msfg_in: PathBuf,

    /// File the final transition table is written to.
    transitions_out: PathBuf,

    /// Number of candidate subwords to try to remove per iteration.
    #[clap(short = 'c', long, default_value = "5000")]
    candidates: usize,

    /// Number of removals per iteration.
    #[clap(short = 'r', long, default_value = "500")]
    removals: usize,

    /// Minimum length of removable subwords.
    #[clap(short = 'm', long, default_value = "2")]
    min_length: usize,

    /// Target vocabulary size.
    #[clap(short = 'v', long, required = true)]
    vocab_size: usize,

    /// Kneser-Ney discount parameter.
    #[clap(short = 'd', long, default_value = "0.1")]
    discount: f64,

    /// Do not renormalize probabilities after smoothing.
    #[clap(short = 'n', long)]
    no_normalization: bool,

    /// Write an intermediate model whenever the size crosses a multiple of
    /// N.
    #[clap(short = 't', long, default_value = "0")]
    temp_models: usize,

    /// Normalize candidate scores by the number of bigrams.
    #[clap(short = 'b', long)]
    normalize_by_bigrams: bool,

    /// Use forward-backward stat collection instead of Viterbi.
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
    let mut transitions = Transitions::read(File::open(&args.transitions_init)?)?;
    info!(
        "initial transitions: {} pairs over {} subwords",
        transitions.transition_count(),
        transitions.num_sources()
    );
    let (words, _) = read_vocab(File::open(&args.wordlist)?, args.utf8)?;
    info!("word list size {}", words.len());

    let mut msfg = Msfg::read(File::open(&args.msfg_in)?, DEFAULT_BOUNDARY)?;
    msfg.prune_unused(&transitions);

    let mut stoplist: HashSet<String> =
        find_short_factors(&transitions.to_vocab(), args.min_length, args.utf8);
    let trainer = BigramTrainer::new()
        .forward_backward(args.forward_backward)
        .utf8(args.utf8)
        .threads(args.threads)
        .normalize_by_bigrams(args.normalize_by_bigrams)
        .reestimate(Reestimate::KneserNey {
            discount: args.discount,
            renormalize: !args.no_normalization,
        });

    let mut iteration = 1;
    let mut next_out_size = 0;
    loop {
        info!("iteration {}", iteration);
        let report = trainer.prune_step(
            &words,
            &mut msfg,
            &mut transitions,
            args.candidates,
            args.removals,
            args.min_length,
            &stoplist,
        )?;
        info!(
            "likelihood {}, removed {}, vocabulary size {}",
            report.likelihood, report.removed, report.vocab_size
        );

        if iteration == 1 && args.temp_models > 0 {
            next_out_size = report.vocab_size / args.temp_models * args.temp_models;
        }
        if args.temp_models > 0
            && report.vocab_size <= next_out_size
            && report.vocab_size > args.vocab_size
        {
            let path = format!("transitions.{}", report.vocab_size);
            let mut wtr = BufWriter::new(File::create(&path)?);
            transitions.write(&mut wtr, false)?;
            info!("wrote {}", path);
            next_out_size = next_out_size.saturating_sub(args.temp_models);
        }

        if report.vocab_size <= args.vocab_size || report.removed == 0 {
            break;
        }
        stoplist.extend(find_short_factors(
            &transitions.to_vocab(),
            args.min_length,
            args.utf8,
        ));
        iteration += 1;
    }

    let mut wtr = BufWriter::new(File::create(&args.transitions_out)?);
    transitions.write(&mut wtr, false)?;
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
