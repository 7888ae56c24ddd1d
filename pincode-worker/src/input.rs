use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::error::InputError;

/// Read the pincodes listed in the file at `path`.
pub fn read_pincodes(path: impl AsRef<Path>) -> Result<Vec<String>, InputError> {
    let path = path.as_ref();
    let to_error = |error| InputError::Io {
        path: path.to_owned(),
        error,
    };

    let file = File::open(path).map_err(to_error)?;
    parse_pincodes(BufReader::new(file)).map_err(to_error)
}

/// Collect every whitespace-separated numeric token, in order. Anything else is skipped.
pub fn parse_pincodes<R: BufRead>(reader: R) -> io::Result<Vec<String>> {
    let mut pincodes = Vec::new();

    for line in reader.lines() {
        let line = line?;
        pincodes.extend(
            line.split_whitespace()
                .filter(|token| token.bytes().all(|b| b.is_ascii_digit()))
                .map(str::to_owned),
        );
    }

    Ok(pincodes)
}
