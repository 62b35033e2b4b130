mod em;
mod msfg;
mod trainer;

use crate::common::Vocab;

pub(crate) fn vocab(entries: &[(&str, f64)]) -> Vocab {
    entries
        .iter()
        .map(|(f, s)| (f.to_string(), *s))
        .collect()
}
