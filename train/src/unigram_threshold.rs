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
    name = "unigram-threshold",
    about = "Unigram training with frequency-threshold pruning."
)]
struct Args {
    /// Word list with counts.
    wordlist: PathBuf,

    /// Initial subword vocabulary.
    vocab_init: PathBuf,

    /// File the final vocabulary is written to.
    vocab_out: PathBuf,

    /// Threshold increment applied at each iteration.
    #[clap(short = 'i', long, default_value = "1.0")]
    threshold_increment: f64,

    /// Minimum length of removable subwords.
    #[clap(short = 'm', long, default_value = "2")]
    min_length: usize,

    /// Target vocabulary size.
    #[clap(short = 'v', long, required = true)]
    vocab_size: usize,

    /// Text file of subwords that must never be removed.
    #[clap(short = 's', long)]
    stop_list: Option<PathBuf>,

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

    let mut threshold = 0.0;
    while vocab.len() > args.vocab_size {
        threshold += args.threshold_increment;
        let removed = trainer.cutoff(&mut freqs, threshold, &stoplist, args.min_length);
        info!(
            "threshold {}, removed {}, vocabulary size {}",
            threshold,
            removed,
            freqs.len()
        );

        vocab = freqs.clone();
        freqs_to_logprobs(&mut vocab, SMALL_LP);
        assert_factors(&mut vocab, &stoplist, ONE_CHAR_MIN_LP);

        let (ll, new_freqs) = trainer.resegment(&words, &vocab);
        cost = ll;
        freqs = new_freqs;
        info!("likelihood {}", cost);
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
