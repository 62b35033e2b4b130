use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use legato::arpa::Ngram;
use legato::common::{add_log, SMALL_LP};
use legato::errors::Result;

#[derive(Parser, Debug)]
#[clap(
    name = "string-score",
    about = "Scores strings with an ARPA character n-gram model, normalized over the batch."
)]
struct Args {
    /// ARPA n-gram model over single characters.
    arpa: PathBuf,

    /// Input file, one `<count> <string>` record per line.
    input: PathBuf,

    /// Output file of `<normalized-log-prob>\t<string>` records.
    output: PathBuf,
}

fn run(args: Args) -> Result<()> {
    let model = Ngram::read_arpa(File::open(&args.arpa)?)?;
    info!(
        "read an order-{} model over {} symbols",
        model.max_order(),
        model.num_symbols()
    );

    let infile = BufReader::new(File::open(&args.input)?);
    let mut scores: Vec<(String, f64)> = vec![];
    let mut normalizer = SMALL_LP;

    'lines: for line in infile.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (_count, text) = match (fields.next(), fields.next()) {
            (Some(count), Some(text)) => (count, text),
            _ => {
                warn!("expected `count string`, skipping: {}", line);
                continue;
            }
        };

        let mut node = Ngram::ROOT;
        let mut total_log10 = 0.0;
        for ch in text.chars() {
            let sym = match model.symbol(&ch.to_string()) {
                Some(sym) => sym,
                None => {
                    warn!("character {} is not in the model, skipping: {}", ch, text);
                    continue 'lines;
                }
            };
            let (next, delta) = model.score(node, sym);
            node = next;
            total_log10 += delta;
        }

        // ARPA probabilities are log10; the rest of the system speaks
        // natural log.
        let total = total_log10 * std::f64::consts::LN_10;
        normalizer = add_log(normalizer, total);
        scores.push((text.to_string(), total));
    }

    let mut outfile = BufWriter::new(File::create(&args.output)?);
    for (text, score) in scores {
        writeln!(outfile, "{}\t{}", score - normalizer, text)?;
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
