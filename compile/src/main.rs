use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use log::info;

use legato::common::DEFAULT_BOUNDARY;
use legato::errors::Result;
use legato::unigram::read_vocab;
use legato::{FactorGraph, Lexicon, Msfg};

#[derive(Parser, Debug)]
#[clap(
    name = "build-msfg",
    about = "Merges the segmentation lattices of a word list into a multi-string factor graph."
)]
struct Args {
    /// Word list with counts, one `<count> <word>` record per line.
    wordlist: PathBuf,

    /// Initial subword vocabulary.
    vocab: PathBuf,

    /// File the graph is written to.
    msfg_out: PathBuf,

    /// Write an intermediate graph after every N words.
    #[clap(short = 't', long, default_value = "0")]
    temp_graphs: usize,

    /// Treat the input as UTF-8 codepoint sequences.
    #[clap(short = '8', long = "utf-8")]
    utf8: bool,
}

fn run(args: Args) -> Result<()> {
    let (vocab, max_len) = read_vocab(File::open(&args.vocab)?, args.utf8)?;
    info!(
        "vocabulary {:?}: {} subwords, longest {}",
        args.vocab,
        vocab.len(),
        max_len
    );
    let (words, word_max_len) = read_vocab(File::open(&args.wordlist)?, args.utf8)?;
    info!(
        "word list {:?}: {} words, longest {}",
        args.wordlist,
        words.len(),
        word_max_len
    );

    let lexicon = Lexicon::from_vocab(&vocab, true);
    let mut msfg = Msfg::new(DEFAULT_BOUNDARY);

    let mut sorted: Vec<_> = words.keys().collect();
    sorted.sort_unstable();
    for (i, word) in sorted.iter().enumerate() {
        let fg = FactorGraph::new(word, DEFAULT_BOUNDARY, &lexicon, args.utf8);
        msfg.add(&fg)?;
        if (i + 1) % 10000 == 0 {
            info!("processed {} words", i + 1);
        }
        if args.temp_graphs > 0 && (i + 1) % args.temp_graphs == 0 {
            let temp_path = args.msfg_out.with_extension(format!("{}", i + 1));
            let mut wtr = BufWriter::new(File::create(&temp_path)?);
            msfg.write(&mut wtr)?;
            info!("wrote an intermediate graph to {:?}", temp_path);
        }
    }

    let mut wtr = BufWriter::new(File::create(&args.msfg_out)?);
    msfg.write(&mut wtr)?;
    info!(
        "wrote {} nodes, {} arcs and {} strings to {:?}",
        msfg.num_nodes(),
        msfg.num_arcs(),
        msfg.texts().len(),
        args.msfg_out
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
