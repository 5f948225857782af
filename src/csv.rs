use std::io::Write;

use crate::protocol::Record;
use crate::schema::Schema;

// Reusing an existing CSV crate would be the obvious approach, but the files
// we produce are trivially simple: one header, one row per record, no
// embedded newlines. The only thing worth handling is quoting, so that a stray
// quote from a noisy link can't turn the file into something that other
// tools refuse to load.

/// Appends records to a CSV output, one flushed row per record.
pub struct RecordWriter<W: Write> {
    inner: W,
    rows: usize,
}

impl<W: Write> RecordWriter<W> {
    /// Writes (and flushes) the schema's header row.
    pub fn new(mut inner: W, schema: &Schema) -> std::io::Result<RecordWriter<W>> {
        write_row(&mut inner, schema.header.iter().copied())?;
        inner.flush()?;
        Ok(RecordWriter { inner, rows: 0 })
    }

    /// Writes one row and flushes it immediately. The session can be stopped
    /// between any two lines, and there is no final flush step that could
    /// rescue buffered rows - so every accepted record has to hit the file
    /// before we go back to waiting on the port.
    pub fn write_record(&mut self, record: &Record) -> std::io::Result<()> {
        write_row(&mut self.inner, record.fields())?;
        self.inner.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn write_row<'a>(out: &mut impl Write, fields: impl Iterator<Item = &'a str>) -> std::io::Result<()> {
    // Assemble the row first, so that a row is handed to the writer in one
    // piece.
    let mut row = String::with_capacity(64);
    for (i, field) in fields.enumerate() {
        if i > 0 {
            row.push(',');
        }
        push_field(&mut row, field);
    }
    row.push('\n');
    out.write_all(row.as_bytes())
}

fn push_field(row: &mut String, field: &str) {
    if !field.contains(['"', '\r', '\n', ',']) {
        row.push_str(field);
        return;
    }
    row.push('"');
    for c in field.chars() {
        if c == '"' {
            row.push('"');
        }
        row.push(c);
    }
    row.push('"');
}

#[derive(Debug, PartialEq, Eq)]
pub enum TokeniseError {
    BadLeadingQuotation,
    BadTrailingQuotation,
    UnclosedQuotation,
}

impl TokeniseError {
    pub fn message(&self) -> &'static str {
        match self {
            TokeniseError::BadLeadingQuotation => {
                "quotation marks must occur immediately after a separator"
            }
            TokeniseError::BadTrailingQuotation => {
                "a separator must occur immediately after a closing quotation mark"
            }
            TokeniseError::UnclosedQuotation => "all quotations must be closed",
        }
    }
}

/// Splits one CSV line into cells, undoing the quoting applied by
/// RecordWriter. The line must not include its terminator.
pub fn tokenise_line(line: &str) -> Result<Vec<String>, TokeniseError> {
    #[derive(Clone, Copy)]
    enum LineState {
        Normal,
        InQuote,
    }

    let mut iter = line.chars().peekable();
    let mut out = vec![String::new()];
    let mut state = LineState::Normal;
    while let Some(c) = iter.next() {
        // `out` always holds at least one token.
        let current_token = out.last_mut().expect("out is never empty");
        match (c, state) {
            (',', LineState::Normal) => out.push(String::new()),
            ('"', LineState::Normal) => {
                if !current_token.is_empty() {
                    return Err(TokeniseError::BadLeadingQuotation);
                }
                state = LineState::InQuote;
            }
            ('"', LineState::InQuote) => match iter.peek() {
                None => state = LineState::Normal,
                Some('"') => {
                    current_token.push('"');
                    iter.next();
                }
                Some(',') => state = LineState::Normal,
                Some(_) => return Err(TokeniseError::BadTrailingQuotation),
            },
            (c, _) => current_token.push(c),
        }
    }
    if matches!(state, LineState::InQuote) {
        return Err(TokeniseError::UnclosedQuotation);
    }
    Ok(out)
}
