use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use legato::common::DEFAULT_BOUNDARY;
use legato::em;
use legato::errors::Result;
use legato::unigram::read_vocab;
use legato::{FactorGraph, Lexicon, Transitions};

/// Log-probability of characters injected to keep every line segmentable.
const FALLBACK_CHAR_LP: f64 = -500.0;

#[derive(Parser, Debug)]
#[clap(
    name = "segment-text",
    about = "Segments a text corpus with a unigram or a bigram subword model."
)]
struct Args {
    /// Input corpus, one string per line.
    input: PathBuf,

    /// Output file, the factors of each line separated by spaces.
    output: PathBuf,

    /// Unigram model file.
    #[clap(
        short = 'v',
        long,
        conflicts_with = "transitions",
        required_unless_present = "transitions"
    )]
    vocabulary: Option<PathBuf>,

    /// Bigram model file.
    #[clap(short = 't', long)]
    transitions: Option<PathBuf>,

    /// Treat the input as UTF-8 codepoint sequences.
    #[clap(short = '8', long = "utf-8")]
    utf8: bool,
}

fn write_path<W: Write>(wtr: &mut W, path: &[String]) -> Result<()> {
    for (i, factor) in path.iter().enumerate() {
        if factor == " " {
            write!(wtr, "\t")?;
        } else {
            if i > 0 {
                write!(wtr, " ")?;
            }
            write!(wtr, "{}", factor)?;
        }
    }
    writeln!(wtr)?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let mut transitions = None;
    let mut lexicon;
    match (&args.vocabulary, &args.transitions) {
        (Some(path), _) => {
            let (vocab, max_len) = read_vocab(File::open(path)?, args.utf8)?;
            info!("vocabulary size {}, longest subword {}", vocab.len(), max_len);
            lexicon = Lexicon::from_vocab(&vocab, true);
        }
        (_, Some(path)) => {
            let table = Transitions::read(File::open(path)?)?;
            info!(
                "transitions: {} pairs over {} subwords",
                table.transition_count(),
                table.num_sources()
            );
            lexicon = Lexicon::from_vocab(&table.to_vocab(), true);
            transitions = Some(table);
        }
        _ => unreachable!(),
    }

    let infile = BufReader::new(File::open(&args.input)?);
    let mut outfile = BufWriter::new(File::create(&args.output)?);

    for line in infile.lines() {
        let line = line?;

        // Unseen characters are injected at a very low probability so that
        // every line stays segmentable.
        for ch in line.chars() {
            let ch = ch.to_string();
            if !lexicon.contains(&ch) {
                lexicon.add(&ch, FALLBACK_CHAR_LP);
            }
        }

        let path = match &transitions {
            None => em::viterbi(&lexicon, &line, args.utf8).1,
            Some(transitions) => {
                let mut fg = FactorGraph::new(&line, DEFAULT_BOUNDARY, &lexicon, args.utf8);
                let (_, mut path) = em::viterbi_fg(transitions, &mut fg);
                if !path.is_empty() {
                    path.remove(0);
                    path.pop();
                }
                path
            }
        };

        if path.is_empty() {
            warn!("no segmentation for line: {}", line);
            continue;
        }
        write_path(&mut outfile, &path)?;
    }

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
