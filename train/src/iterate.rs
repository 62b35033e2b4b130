use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use log::info;

use legato::common::ONE_CHAR_MIN_LP;
use legato::errors::Result;
use legato::unigram::{
    assert_factors, read_sents, read_vocab, write_vocab, SegMethod, UnigramTrainer,
};

#[derive(Parser, Debug)]
#[clap(
    name = "iterate",
    about = "Runs a fixed number of unigram EM iterations without pruning."
)]
struct Args {
    /// Word list with counts, or a sentence corpus with --sentences.
    wordlist: PathBuf,

    /// Input vocabulary.
    vocab_in: PathBuf,

    /// File the re-estimated vocabulary is written to.
    vocab_out: PathBuf,

    /// Number of EM iterations.
    #[clap(short = 'i', long, default_value = "1")]
    iterations: usize,

    /// Treat the corpus file as ordered sentences instead of a word list.
    #[clap(long)]
    sentences: bool,

    /// Use forward-backward segmentation instead of Viterbi.
    #[clap(short = 'f', long)]
    forward_backward: bool,

    /// Treat the input as UTF-8 codepoint sequences.
    #[clap(short = '8', long = "utf-8")]
    utf8: bool,
}

fn run(args: Args) -> Result<()> {
    let (mut vocab, max_len) = read_vocab(File::open(&args.vocab_in)?, args.utf8)?;
    info!("vocabulary size {}, longest subword {}", vocab.len(), max_len);

    let method = if args.forward_backward {
        SegMethod::ForwardBackward
    } else {
        SegMethod::Viterbi
    };
    let trainer = UnigramTrainer::new()
        .segmentation_method(method)
        .utf8(args.utf8);

    if args.sentences {
        let sents = read_sents(File::open(&args.wordlist)?)?;
        info!("{} sentences", sents.len());
        let mut chars: Vec<String> = sents
            .iter()
            .flat_map(|s| s.chars().map(|c| c.to_string()))
            .collect();
        chars.sort_unstable();
        chars.dedup();
        for i in 0..args.iterations {
            let ll = trainer.iterate_sents(&sents, &mut vocab, 1);
            assert_factors(&mut vocab, &chars, ONE_CHAR_MIN_LP);
            info!("iteration {}, likelihood {}", i + 1, ll);
        }
    } else {
        let (words, _) = read_vocab(File::open(&args.wordlist)?, args.utf8)?;
        info!("word list size {}", words.len());
        let mut chars: Vec<String> = words
            .keys()
            .flat_map(|w| w.chars().map(|c| c.to_string()))
            .collect();
        chars.sort_unstable();
        chars.dedup();
        for i in 0..args.iterations {
            let ll = trainer.iterate(&words, &mut vocab, 1);
            assert_factors(&mut vocab, &chars, ONE_CHAR_MIN_LP);
            info!("iteration {}, likelihood {}", i + 1, ll);
        }
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
