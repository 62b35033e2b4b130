use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use hashbrown::HashSet;
use log::info;

use legato::common::{find_short_factors, ONE_CHAR_MIN_LP, SMALL_LP};
use legato::errors::Result;
use legato::unigram::{
    assert_factors, freqs_to_logprobs, read_sents, read_vocab, write_vocab, SegMethod,
    UnigramTrainer,
};

#[derive(Parser, Debug)]
#[clap(
    name = "unigram-prune",
    about = "Iterative unigram training with likelihood-based subword removal."
)]
struct Args {
    /// Word list with counts.
    wordlist: PathBuf,

    /// Initial subword vocabulary.
    vocab_init: PathBuf,

    /// File the final vocabulary is written to.
    vocab_out: PathBuf,

    /// Number of subwords to consider for removal per iteration.
    #[clap(short = 'c', long, default_value = "10000")]
    candidates: usize,

    /// Number of subwords to remove per iteration.
    #[clap(short = 'r', long, default_value = "500")]
    removals: usize,

    /// Minimum length of removable subwords.
    #[clap(short = 'm', long, default_value = "2")]
    min_length: usize,

    /// Target vocabulary size.
    #[clap(short = 'v', long, required = true)]
    vocab_size: usize,

    /// Text file of subwords that must never be removed.
    #[clap(short = 's', long)]
    stop_list: Option<PathBuf>,

    /// Write an intermediate vocabulary whenever the size is a multiple of
    /// N.
    #[clap(short = 't', long, default_value = "0")]
    temp_vocabs: usize,

    /// Use forward-backward segmentation instead of Viterbi.
    #[clap(short = 'f', long)]
    forward_backward: bool,

    /// Treat the input as UTF-8 codepoint sequences.
    #[clap(short = '8', long = "utf-8")]
    utf8: bool,
}

fn run(args: Args) -> Result<()> {
    let (mut vocab, max_len) = read_vocab(File::open(&args.vocab_init)?, args.utf8)?;
    info!("vocabulary size {}, longest subword {}", vocab.len(), max_len);
    let (words, _) = read_vocab(File::open(&args.wordlist)?, args.utf8)?;
    info!("word list size {}", words.len());

    let mut stoplist: HashSet<String> = match &args.stop_list {
        Some(path) => read_sents(File::open(path)?)?.into_iter().collect(),
        None => HashSet::new(),
    };
    stoplist.extend(find_short_factors(&vocab, args.min_length, args.utf8));

    let method = if args.forward_backward {
        SegMethod::ForwardBackward
    } else {
        SegMethod::Viterbi
    };
    let trainer = UnigramTrainer::new()
        .segmentation_method(method)
        .utf8(args.utf8);

    let (mut cost, mut freqs) = trainer.resegment(&words, &vocab);
    info!("initial likelihood {}", cost);

    let mut iteration = 1;
    while vocab.len() > args.vocab_size {
        info!("iteration {}", iteration);

        let mut candidates = std::collections::BTreeSet::new();
        trainer.candidates_by_usage(
            &words,
            &vocab,
            &mut candidates,
            args.candidates / 3,
            &stoplist,
            args.min_length,
            f64::MAX,
        );
        let random_target = candidates.len() + (args.candidates - candidates.len()) / 4;
        trainer.candidates_by_random(
            &vocab,
            &mut candidates,
            random_target,
            &stoplist,
            args.min_length,
            iteration as u64,
        );
        trainer.candidates_by_frequency(
            &vocab,
            &mut candidates,
            args.candidates,
            &stoplist,
            args.min_length,
        );
        info!("ranking {} candidate subwords", candidates.len());

        let (ll, removal_scores) = trainer.rank_candidates(&words, &vocab, &candidates, &mut freqs);
        cost = ll;
        info!("likelihood before removals {}", cost);

        let mut n_removals = 0;
        for (factor, _) in &removal_scores {
            if !vocab.contains_key(factor) || !freqs.contains_key(factor) {
                continue;
            }
            vocab.remove(factor);
            freqs.remove(factor);
            n_removals += 1;

            if args.temp_vocabs > 0 && freqs.len() % args.temp_vocabs == 0 {
                let mut temp_vocab = freqs.clone();
                freqs_to_logprobs(&mut temp_vocab, SMALL_LP);
                let path = format!("iteration_{}_{}.vocab", iteration, temp_vocab.len());
                let mut wtr = BufWriter::new(File::create(&path)?);
                write_vocab(&mut wtr, &temp_vocab, false)?;
                info!("wrote {}", path);
            }

            if n_removals >= args.removals || vocab.len() <= args.vocab_size {
                break;
            }
        }

        cost = trainer.iterate(&words, &mut vocab, 1);
        assert_factors(&mut vocab, &stoplist, ONE_CHAR_MIN_LP);

        info!(
            "removed {} subwords, vocabulary size {}, likelihood {}",
            n_removals,
            vocab.len(),
            cost
        );
        if n_removals == 0 {
            info!("no subwords left to remove");
            break;
        }
        iteration += 1;
    }

    let mut wtr = BufWriter::new(File::create(&args.vocab_out)?);
    write_vocab(&mut wtr, &vocab, false)?;
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
