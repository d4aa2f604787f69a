//! Delimited input decoding: PostgreSQL text format and CSV.
//!
//! Each input line becomes one [`SourceRow`]. The decoded values drive
//! routing; the raw line (without its terminator) is what gets forwarded to
//! the shards, which decode it again with the same format options.

use std::io::BufRead;

use shardcopy_cluster::source::{RowSource, SourceRow};
use shardcopy_common::datum::Datum;
use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::DataType;

/// Input format of the delimited stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RowFormat {
    #[default]
    Text,
    Csv,
}

impl RowFormat {
    /// The `format` option value shards are given.
    pub fn as_option(&self) -> &'static str {
        match self {
            RowFormat::Text => "text",
            RowFormat::Csv => "csv",
        }
    }
}

/// Options shared by both formats.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub format: RowFormat,
    pub delimiter: u8,
    pub quote: u8,
    pub escape: u8,
    pub null_as: String,
    pub header: bool,
}

impl CsvOptions {
    /// PostgreSQL defaults for `format`.
    pub fn for_format(format: RowFormat) -> Self {
        match format {
            RowFormat::Text => Self {
                format,
                delimiter: b'\t',
                quote: b'"',
                escape: b'"',
                null_as: "\\N".into(),
                header: false,
            },
            RowFormat::Csv => Self {
                format,
                delimiter: b',',
                quote: b'"',
                escape: b'"',
                null_as: String::new(),
                header: false,
            },
        }
    }
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self::for_format(RowFormat::Text)
    }
}

/// Parse a delimiter token like `','` or `'\t'` into a byte.
pub fn parse_delimiter(s: &str) -> Option<u8> {
    let s = match s.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        Some(inner) if !inner.is_empty() => inner,
        _ => s,
    };
    match s {
        "\\t" | "\t" => Some(b'\t'),
        _ if s.len() == 1 && s.is_ascii() => Some(s.as_bytes()[0]),
        _ => None,
    }
}

/// One field split out of a line.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub value: String,
    /// CSV only: the field was quoted, so it is never NULL.
    pub quoted: bool,
}

/// Split a CSV line, honouring quotes and the escape character.
/// Returns `None` for an unterminated quote or stray text after a closing
/// quote.
pub fn parse_csv_line(line: &str, opts: &CsvOptions) -> Option<Vec<Field>> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    let q = opts.quote as char;
    let esc = opts.escape as char;
    let d = opts.delimiter as char;

    loop {
        if chars.peek() == Some(&q) {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == esc && chars.peek() == Some(&q) {
                    // Doubled quote, or escape followed by quote.
                    chars.next();
                    value.push(q);
                } else if c == esc && esc != q && chars.peek() == Some(&esc) {
                    chars.next();
                    value.push(esc);
                } else if c == q {
                    closed = true;
                    break;
                } else {
                    value.push(c);
                }
            }
            if !closed {
                return None;
            }
            fields.push(Field {
                value,
                quoted: true,
            });
            match chars.next() {
                Some(c) if c == d => {}
                None => return Some(fields),
                _ => return None,
            }
        } else {
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == d => break,
                    Some(c) => value.push(c),
                    None => {
                        fields.push(Field {
                            value,
                            quoted: false,
                        });
                        return Some(fields);
                    }
                }
            }
            fields.push(Field {
                value,
                quoted: false,
            });
        }
    }
}

/// Split a text-format line on the delimiter. Fields keep their backslash
/// escapes; see [`unescape_text`].
pub fn split_text_line(line: &str, delimiter: u8) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            // An escaped delimiter does not split.
            i += 2;
            continue;
        }
        if bytes[i] == delimiter {
            fields.push(&line[start..i]);
            start = i + 1;
        }
        i += 1;
    }
    fields.push(&line[start.min(line.len())..]);
    fields
}

/// Undo text-format backslash escapes.
pub fn unescape_text(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\u{b}'),
            Some(d @ '0'..='7') => {
                let mut code = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(v) => {
                            code = code * 8 + v;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Reads delimited lines and decodes them against the copied columns'
/// types.
pub struct DelimitedRowSource<R> {
    reader: R,
    column_types: Vec<DataType>,
    opts: CsvOptions,
    line_no: u64,
    header_pending: bool,
    finished: bool,
    buf: String,
}

impl<R: BufRead + Send> DelimitedRowSource<R> {
    pub fn new(reader: R, column_types: Vec<DataType>, opts: CsvOptions) -> Self {
        Self {
            reader,
            column_types,
            header_pending: opts.header,
            opts,
            line_no: 0,
            finished: false,
            buf: String::new(),
        }
    }

    /// Physical lines consumed so far, header included.
    pub fn lines_read(&self) -> u64 {
        self.line_no
    }

    fn read_line(&mut self) -> CopyResult<Option<String>> {
        self.buf.clear();
        let n = self
            .reader
            .read_line(&mut self.buf)
            .map_err(|e| CopyError::Source {
                line: self.line_no + 1,
                reason: e.to_string(),
            })?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        let line = self
            .buf
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(self.buf.as_str());
        Ok(Some(line.to_string()))
    }

    fn source_error(&self, reason: impl Into<String>) -> CopyError {
        CopyError::Source {
            line: self.line_no,
            reason: reason.into(),
        }
    }

    fn decode(&self, line: &str) -> CopyResult<Vec<Datum>> {
        let raw: Vec<(String, bool)> = match self.opts.format {
            RowFormat::Csv => parse_csv_line(line, &self.opts)
                .ok_or_else(|| self.source_error("unterminated CSV quoted field"))?
                .into_iter()
                .map(|f| {
                    let is_null = !f.quoted && f.value == self.opts.null_as;
                    (f.value, is_null)
                })
                .collect(),
            RowFormat::Text => split_text_line(line, self.opts.delimiter)
                .into_iter()
                .map(|f| {
                    if f == self.opts.null_as {
                        (String::new(), true)
                    } else {
                        (unescape_text(f), false)
                    }
                })
                .collect(),
        };

        if raw.len() != self.column_types.len() {
            return Err(self.source_error(format!(
                "expected {} column(s), found {}",
                self.column_types.len(),
                raw.len()
            )));
        }

        raw.into_iter()
            .zip(&self.column_types)
            .map(|((value, is_null), data_type)| {
                if is_null {
                    Ok(Datum::Null)
                } else {
                    Datum::parse(&value, *data_type).map_err(|e| self.source_error(e))
                }
            })
            .collect()
    }
}

impl<R: BufRead + Send> RowSource for DelimitedRowSource<R> {
    fn next_row(&mut self) -> CopyResult<Option<SourceRow>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let Some(line) = self.read_line()? else {
                self.finished = true;
                return Ok(None);
            };
            if self.header_pending {
                self.header_pending = false;
                continue;
            }
            if self.opts.format == RowFormat::Text && line == "\\." {
                self.finished = true;
                return Ok(None);
            }
            let values = self.decode(&line)?;
            return Ok(Some(SourceRow::new(values, line.into_bytes())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn csv_opts() -> CsvOptions {
        CsvOptions::for_format(RowFormat::Csv)
    }

    fn drain<R: BufRead + Send>(source: &mut DelimitedRowSource<R>) -> Vec<SourceRow> {
        let mut rows = Vec::new();
        while let Some(row) = source.next_row().unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_parse_delimiter() {
        assert_eq!(parse_delimiter(","), Some(b','));
        assert_eq!(parse_delimiter("'|'"), Some(b'|'));
        assert_eq!(parse_delimiter("\\t"), Some(b'\t'));
        assert_eq!(parse_delimiter("'"), Some(b'\''));
        assert_eq!(parse_delimiter("ab"), None);
    }

    #[test]
    fn test_parse_csv_line_quoting() {
        let fields = parse_csv_line(r#"1,"a,b","say ""hi""","#, &csv_opts()).unwrap();
        let values: Vec<&str> = fields.iter().map(|f| f.value.as_str()).collect();
        assert_eq!(values, vec!["1", "a,b", "say \"hi\"", ""]);
        assert!(fields[1].quoted);
        assert!(!fields[3].quoted);
    }

    #[test]
    fn test_parse_csv_line_malformed() {
        assert!(parse_csv_line(r#"1,"open"#, &csv_opts()).is_none());
        assert!(parse_csv_line(r#""a"x,2"#, &csv_opts()).is_none());
    }

    #[test]
    fn test_parse_csv_line_custom_escape() {
        let opts = CsvOptions {
            escape: b'\\',
            ..csv_opts()
        };
        let fields = parse_csv_line(r#""a\"b",c"#, &opts).unwrap();
        assert_eq!(fields[0].value, "a\"b");
        assert_eq!(fields[1].value, "c");
    }

    #[test]
    fn test_text_split_and_unescape() {
        let fields = split_text_line("1\ta\\tb\t\\N", b'\t');
        assert_eq!(fields, vec!["1", "a\\tb", "\\N"]);
        assert_eq!(unescape_text("a\\tb"), "a\tb");
        assert_eq!(unescape_text("back\\\\slash"), "back\\slash");
        assert_eq!(unescape_text("\\101"), "A");
        assert_eq!(split_text_line("", b'\t'), vec![""]);
    }

    #[test]
    fn test_text_source_decodes_rows() {
        let input = "1\talpha\n2\t\\N\n";
        let mut source = DelimitedRowSource::new(
            Cursor::new(input),
            vec![DataType::Int64, DataType::Text],
            CsvOptions::default(),
        );
        let rows = drain(&mut source);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values, vec![Datum::Int64(1), Datum::Text("alpha".into())]);
        assert_eq!(rows[0].line, b"1\talpha".to_vec());
        assert_eq!(rows[1].values, vec![Datum::Int64(2), Datum::Null]);
    }

    #[test]
    fn test_text_end_of_data_marker() {
        let input = "1\ta\n\\.\n2\tb\n";
        let mut source = DelimitedRowSource::new(
            Cursor::new(input),
            vec![DataType::Int32, DataType::Text],
            CsvOptions::default(),
        );
        assert_eq!(drain(&mut source).len(), 1);
        assert!(source.next_row().unwrap().is_none());
    }

    #[test]
    fn test_csv_source_header_and_nulls() {
        let input = "id,name\r\n7,\"\"\r\n8,\r\n";
        let opts = CsvOptions {
            header: true,
            ..csv_opts()
        };
        let mut source =
            DelimitedRowSource::new(Cursor::new(input), vec![DataType::Int64, DataType::Text], opts);
        let rows = drain(&mut source);
        assert_eq!(rows.len(), 2);
        // Quoted empty string is a value, bare empty is NULL.
        assert_eq!(rows[0].values[1], Datum::Text(String::new()));
        assert_eq!(rows[1].values[1], Datum::Null);
        assert_eq!(rows[1].line, b"8,".to_vec());
        assert_eq!(source.lines_read(), 3);
    }

    #[test]
    fn test_column_count_mismatch_reports_line() {
        let input = "1\ta\n2\n";
        let mut source = DelimitedRowSource::new(
            Cursor::new(input),
            vec![DataType::Int64, DataType::Text],
            CsvOptions::default(),
        );
        assert!(source.next_row().unwrap().is_some());
        match source.next_row() {
            Err(CopyError::Source { line, reason }) => {
                assert_eq!(line, 2);
                assert!(reason.contains("expected 2"));
            }
            other => panic!("expected source error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_value_reports_line() {
        let input = "id\nnot-a-number\n";
        let opts = CsvOptions {
            header: true,
            ..csv_opts()
        };
        let mut source = DelimitedRowSource::new(Cursor::new(input), vec![DataType::Int64], opts);
        match source.next_row() {
            Err(CopyError::Source { line, reason }) => {
                assert_eq!(line, 2);
                assert!(reason.contains("BIGINT"));
            }
            other => panic!("expected source error, got {:?}", other),
        }
    }
}
