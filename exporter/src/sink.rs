//! Row sinks for export output.
//!
//! Every view is written with the same RFC 4180 discipline: one configurable
//! single-byte delimiter, CRLF row terminators, and double-quote escaping.
//! Generated values are quoted according to the configured style, and
//! whenever they contain a comma. Free text (exam titles, item names) is
//! always quoted so numeric looking titles survive spreadsheet imports
//! untouched.

use crate::types::RowKind;
use csv::{Terminator, WriterBuilder};
use serde::Deserialize;
use std::io::{self, Write};

#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    /// Generated value. Quoted only when required.
    Value(String),
    /// Free text. Always quoted.
    Text(String),
}

impl Cell {
    pub fn as_str(&self) -> &str {
        match self {
            Cell::Value(s) | Cell::Text(s) => s,
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Value(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Value(value)
    }
}

pub type Row = Vec<Cell>;

pub trait RowSink: Send {
    fn write_row(&mut self, row: &[Cell]) -> io::Result<()>;
}

// Collects rows in memory.
impl RowSink for Vec<Row> {
    fn write_row(&mut self, row: &[Cell]) -> io::Result<()> {
        self.push(row.to_vec());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStyle {
    /// Quote only cells that would otherwise corrupt the row.
    #[default]
    Necessary,
    /// Additionally quote every cell that does not parse as a number.
    NonNumeric,
}

impl From<QuoteStyle> for csv::QuoteStyle {
    fn from(style: QuoteStyle) -> Self {
        match style {
            QuoteStyle::Necessary => csv::QuoteStyle::Necessary,
            QuoteStyle::NonNumeric => csv::QuoteStyle::NonNumeric,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsvFormat {
    pub delimiter: u8,
    pub quote_style: QuoteStyle,
}

impl Default for CsvFormat {
    fn default() -> Self {
        CsvFormat {
            delimiter: b',',
            quote_style: QuoteStyle::Necessary,
        }
    }
}

/// Quotes and escapes single cells. Each cell is written as a one-field
/// record into a scratch buffer and the terminator is cut off again.
struct CellEncoder {
    writer: csv::Writer<Vec<u8>>,
}

impl CellEncoder {
    fn new(delimiter: u8, style: csv::QuoteStyle) -> Self {
        let writer = WriterBuilder::new()
            .delimiter(delimiter)
            .quote_style(style)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        CellEncoder { writer }
    }

    fn encode(&mut self, value: &str) -> io::Result<Vec<u8>> {
        self.writer.write_record([value])?;
        self.writer.flush()?;
        let mut field = std::mem::take(self.writer.get_mut());
        field.pop();
        Ok(field)
    }
}

/// Writes rows as CSV records to any writer.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    values: CellEncoder,
    text: CellEncoder,
    rows: usize,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W, format: CsvFormat) -> Self {
        // Cells arrive already quoted, so the record writer only joins them.
        let writer = WriterBuilder::new()
            .delimiter(format.delimiter)
            .terminator(Terminator::CRLF)
            .quote_style(csv::QuoteStyle::Never)
            .has_headers(false)
            .from_writer(writer);

        CsvSink {
            writer,
            values: CellEncoder::new(format.delimiter, format.quote_style.into()),
            text: CellEncoder::new(format.delimiter, csv::QuoteStyle::Always),
            rows: 0,
        }
    }

    /// Rows written so far, header included.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }

    fn encode(&mut self, cell: &Cell) -> io::Result<Vec<u8>> {
        match cell {
            // A lone empty field would come back as `""`.
            Cell::Value(value) if value.is_empty() => Ok(Vec::new()),
            // Commas are quoted whatever the delimiter.
            Cell::Value(value) if value.contains(',') => self.text.encode(value),
            Cell::Value(value) => self.values.encode(value),
            Cell::Text(text) => self.text.encode(text),
        }
    }
}

impl<W: Write + Send> RowSink for CsvSink<W> {
    fn write_row(&mut self, row: &[Cell]) -> io::Result<()> {
        let fields = row
            .iter()
            .map(|cell| self.encode(cell))
            .collect::<io::Result<Vec<_>>>()?;
        self.writer.write_record(&fields)?;
        self.rows += 1;
        Ok(())
    }
}

/// The set of output streams handed to one export run. The run writes each
/// row kind to its own sink, so a single pass over the deliveries fills all
/// of them with aligned rows.
#[derive(Default)]
pub struct Sinks<'a> {
    candidate: Option<&'a mut dyn RowSink>,
    exam: Option<&'a mut dyn RowSink>,
    item: Option<&'a mut dyn RowSink>,
}

impl<'a> Sinks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: RowKind, sink: &'a mut dyn RowSink) -> Self {
        match kind {
            RowKind::Candidate => self.candidate = Some(sink),
            RowKind::Exam => self.exam = Some(sink),
            RowKind::Item => self.item = Some(sink),
        }
        self
    }

    pub fn contains(&self, kind: RowKind) -> bool {
        match kind {
            RowKind::Candidate => self.candidate.is_some(),
            RowKind::Exam => self.exam.is_some(),
            RowKind::Item => self.item.is_some(),
        }
    }

    pub fn get(&mut self, kind: RowKind) -> Option<&mut (dyn RowSink + 'a)> {
        match kind {
            RowKind::Candidate => self.candidate.as_deref_mut(),
            RowKind::Exam => self.exam.as_deref_mut(),
            RowKind::Item => self.item.as_deref_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| Cell::from(*c)).collect()
    }

    fn render(format: CsvFormat, rows: &[Row]) -> String {
        let mut sink = CsvSink::new(Vec::new(), format);
        for row in rows {
            sink.write_row(row).unwrap();
        }
        String::from_utf8(sink.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn test_plain_row() {
        assert_eq!(render(CsvFormat::default(), &[row(&["a", "1", ""])]), "a,1,\r\n");
    }

    #[test]
    fn test_quoting() {
        let cells = vec![
            Cell::from("Math, Science"),
            Cell::from("say \"hi\""),
            Cell::Text("2020".into()),
            Cell::from("line\nbreak"),
            Cell::Text(String::new()),
        ];
        assert_eq!(
            render(CsvFormat::default(), &[cells]),
            "\"Math, Science\",\"say \"\"hi\"\"\",\"2020\",\"line\nbreak\",\"\"\r\n"
        );
    }

    #[test]
    fn test_comma_quoted_with_other_delimiter() {
        let format = CsvFormat {
            delimiter: b';',
            quote_style: QuoteStyle::Necessary,
        };
        assert_eq!(
            render(format, &[row(&["a;b", "c,d", "e"])]),
            "\"a;b\";\"c,d\";e\r\n"
        );
    }

    #[test]
    fn test_non_numeric_style() {
        let format = CsvFormat {
            delimiter: b',',
            quote_style: QuoteStyle::NonNumeric,
        };
        assert_eq!(
            render(format, &[row(&["OK", "90", "0.5", ""])]),
            "\"OK\",90,0.5,\r\n"
        );
    }

    #[test]
    fn test_csv_sink_output_parses() {
        let mut sink = CsvSink::new(Vec::new(), CsvFormat::default());
        sink.write_row(&row(&["exam_id", "exam_title"])).unwrap();
        sink.write_row(&[Cell::from("d1"), Cell::Text("Algebra, \"Intro\"".into())])
            .unwrap();
        sink.write_row(&[Cell::from("d2"), Cell::Text("42".into())])
            .unwrap();
        assert_eq!(sink.rows(), 3);

        let bytes = sink.into_inner().unwrap();
        assert!(bytes.ends_with(b"\"42\"\r\n"));

        let mut reader = csv::ReaderBuilder::new().from_reader(bytes.as_slice());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][0], "d1");
        assert_eq!(&records[0][1], "Algebra, \"Intro\"");
        assert_eq!(&records[1][1], "42");
    }

    #[test]
    fn test_sinks_routing() {
        let mut exam: Vec<Row> = Vec::new();
        let mut item: Vec<Row> = Vec::new();
        {
            let mut sinks = Sinks::new()
                .with(RowKind::Exam, &mut exam)
                .with(RowKind::Item, &mut item);
            assert!(!sinks.contains(RowKind::Candidate));
            assert!(sinks.get(RowKind::Candidate).is_none());
            sinks
                .get(RowKind::Exam)
                .unwrap()
                .write_row(&row(&["e"]))
                .unwrap();
        }
        assert_eq!(exam, vec![row(&["e"])]);
        assert!(item.is_empty());
    }
}
