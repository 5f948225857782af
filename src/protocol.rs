//! Framing of the device's serial output: one UTF-8 line per reading, fields
//! separated by commas.

pub const FIELD_SEPARATOR: char = ',';

/// Record is one validated line of sensor data: exactly `arity` fields, kept
/// as the text the device sent. Fields are never interpreted as numbers here,
/// that's left for whoever consumes the CSV.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    line: String,
    fields: Vec<std::ops::Range<usize>>,
}

impl Record {
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|range| &self.line[range.clone()])
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// The line this record was parsed from.
    pub fn line(&self) -> &str {
        &self.line
    }
}

/// Reasons for a line never becoming a record. None of these are errors in
/// the session sense: they are expected on a noisy link, and the line is
/// simply dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum Discard {
    InvalidUtf8,
    Empty,
    WrongArity { expected: usize, actual: usize },
}

/// Decodes one raw line (with or without its terminator) and strips
/// surrounding whitespace, including the <CR> that Arduino's println emits.
pub fn decode_line(raw: &[u8]) -> Result<&str, Discard> {
    let line = std::str::from_utf8(raw)
        .map_err(|_| Discard::InvalidUtf8)?
        .trim();
    if line.is_empty() {
        return Err(Discard::Empty);
    }
    Ok(line)
}

/// Splits an already decoded line, and accepts it only if it has exactly
/// `arity` fields.
pub fn parse_record(line: &str, arity: usize) -> Result<Record, Discard> {
    let mut fields = Vec::with_capacity(arity);
    let mut start = 0;
    for (i, _) in line.match_indices(FIELD_SEPARATOR) {
        fields.push(start..i);
        start = i + FIELD_SEPARATOR.len_utf8();
    }
    fields.push(start..line.len());

    if fields.len() != arity {
        return Err(Discard::WrongArity {
            expected: arity,
            actual: fields.len(),
        });
    }
    Ok(Record {
        line: line.to_string(),
        fields,
    })
}

/// decode_line followed by parse_record.
pub fn parse_raw_line(raw: &[u8], arity: usize) -> Result<Record, Discard> {
    parse_record(decode_line(raw)?, arity)
}
