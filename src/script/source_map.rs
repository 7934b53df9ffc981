//! Mapping from positions in an assembled (generated) buffer back to the
//! files the author wrote.
//!
//! Page assembly concatenates included files and code fragments into one
//! buffer before lexing. Every appended chunk is registered here so that any
//! span reported against the buffer can be translated back.

use std::sync::Arc;

use serde::Serialize;

use super::ast::{Location, Span};

/// A span in an original source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocSpan {
    pub file: Arc<str>,
    pub span: Span,
}

impl DocSpan {
    pub fn new(file: Arc<str>, span: Span) -> Self {
        Self { file, span }
    }
}

impl std::fmt::Display for DocSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, line {}, column {}",
            self.file, self.span.start.line, self.span.start.column
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceMapError {
    #[error("mapping at index {start} overlaps or precedes the previous mapping ending at {previous_end}")]
    OutOfOrder { start: usize, previous_end: usize },
    #[error("mapping span ends before it starts")]
    Inverted,
}

#[derive(Debug, Clone)]
struct Interval {
    generated: Span,
    doc: DocSpan,
}

/// Ordered, non-overlapping (generated span → `DocSpan`) intervals.
#[derive(Debug, Clone, Default)]
pub struct SourceMapper {
    intervals: Vec<Interval>,
}

impl SourceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapper for a buffer that is exactly one file.
    pub fn identity(file: Arc<str>, source: &str) -> Self {
        let end = end_location(source);
        let span = Span::new(Location::START, end);
        Self {
            intervals: vec![Interval {
                generated: span,
                doc: DocSpan::new(file, span),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Record that `generated` came from `doc`. Calls must arrive in
    /// increasing generated-position order.
    pub fn add_mapping(&mut self, generated: Span, doc: DocSpan) -> Result<(), SourceMapError> {
        if generated.end.index < generated.start.index {
            return Err(SourceMapError::Inverted);
        }
        if let Some(last) = self.intervals.last() {
            if generated.start.index < last.generated.end.index {
                return Err(SourceMapError::OutOfOrder {
                    start: generated.start.index,
                    previous_end: last.generated.end.index,
                });
            }
        }
        self.intervals.push(Interval { generated, doc });
        Ok(())
    }

    /// Translate a generated span into original coordinates. Returns `None`
    /// when the span's start lies outside every recorded interval.
    pub fn map(&self, span: Span) -> Option<DocSpan> {
        let interval = self.find(span.start.index)?;
        let anchor_gen = interval.generated.start;
        let anchor_doc = interval.doc.span.start;
        let end = if span.end.index < span.start.index { span.start } else { span.end };
        Some(DocSpan {
            file: Arc::clone(&interval.doc.file),
            span: Span::new(
                offset(anchor_gen, anchor_doc, span.start),
                offset(anchor_gen, anchor_doc, end),
            ),
        })
    }

    /// Translate a single generated location.
    pub fn map_location(&self, loc: Location) -> Option<(Arc<str>, Location)> {
        self.map(Span::at(loc)).map(|d| (d.file, d.span.start))
    }

    fn find(&self, index: usize) -> Option<&Interval> {
        // Last interval whose start is <= index.
        let pos = self.intervals.partition_point(|iv| iv.generated.start.index <= index);
        let candidate = self.intervals.get(pos.checked_sub(1)?)?;
        let gen = &candidate.generated;
        let inside = index < gen.end.index || (index == gen.end.index && gen.start.index == gen.end.index);
        // A zero-width query sitting exactly on the end of the final interval
        // (an Eof token, say) still belongs to it.
        let at_tail = index == gen.end.index && pos == self.intervals.len();
        if inside || at_tail {
            Some(candidate)
        } else {
            None
        }
    }
}

/// Same-line offsets add columns; once the offset crosses a line break the
/// generated column is carried over unchanged.
fn offset(anchor_gen: Location, anchor_doc: Location, point: Location) -> Location {
    let index = anchor_doc.index + point.index.saturating_sub(anchor_gen.index);
    if point.line == anchor_gen.line {
        Location::new(
            index,
            anchor_doc.line,
            anchor_doc.column + point.column.saturating_sub(anchor_gen.column),
        )
    } else {
        Location::new(
            index,
            anchor_doc.line + point.line.saturating_sub(anchor_gen.line),
            point.column,
        )
    }
}

/// Location just past the end of `text`, starting from line 1 column 1.
pub fn end_location(text: &str) -> Location {
    advance(Location::START, text)
}

/// Location reached after appending `text` at `from`.
pub fn advance(from: Location, text: &str) -> Location {
    let mut loc = from;
    for ch in text.chars() {
        loc.index += ch.len_utf8();
        if ch == '\n' {
            loc.line += 1;
            loc.column = 1;
        } else {
            loc.column += 1;
        }
    }
    loc
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn loc(index: usize, line: u32, column: u32) -> Location {
        Location::new(index, line, column)
    }

    fn file(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[test]
    fn same_line_offset_adds_columns() {
        let mut m = SourceMapper::new();
        // generated 1:1 came from page.asp 4:10
        m.add_mapping(
            Span::new(loc(0, 1, 1), loc(20, 1, 21)),
            DocSpan::new(file("page.asp"), Span::new(loc(50, 4, 10), loc(70, 4, 30))),
        )
        .unwrap();
        let doc = m.map(Span::new(loc(5, 1, 6), loc(8, 1, 9))).unwrap();
        assert_eq!(&*doc.file, "page.asp");
        assert_eq!(doc.span.start, loc(55, 4, 15));
        assert_eq!(doc.span.end, loc(58, 4, 18));
    }

    #[test]
    fn later_line_keeps_generated_column() {
        let mut m = SourceMapper::new();
        m.add_mapping(
            Span::new(loc(10, 2, 5), loc(60, 5, 1)),
            DocSpan::new(file("inc.asp"), Span::new(loc(100, 7, 12), loc(150, 10, 1))),
        )
        .unwrap();
        let doc = m.map(Span::new(loc(30, 3, 4), loc(33, 3, 7))).unwrap();
        assert_eq!(doc.span.start.line, 8);
        assert_eq!(doc.span.start.column, 4);
        assert_eq!(doc.span.end.column, 7);
        assert_eq!(doc.span.start.index, 120);
    }

    #[test]
    fn binary_search_picks_containing_interval() {
        let mut m = SourceMapper::new();
        m.add_mapping(
            Span::new(loc(0, 1, 1), loc(10, 2, 1)),
            DocSpan::new(file("a.asp"), Span::new(loc(0, 1, 1), loc(10, 2, 1))),
        )
        .unwrap();
        m.add_mapping(
            Span::new(loc(10, 2, 1), loc(30, 3, 1)),
            DocSpan::new(file("b.inc"), Span::new(loc(0, 1, 1), loc(20, 2, 1))),
        )
        .unwrap();
        m.add_mapping(
            Span::new(loc(30, 3, 1), loc(40, 4, 1)),
            DocSpan::new(file("a.asp"), Span::new(loc(40, 3, 1), loc(50, 4, 1))),
        )
        .unwrap();
        assert_eq!(&*m.map(Span::at(loc(12, 2, 3))).unwrap().file, "b.inc");
        let back = m.map(Span::at(loc(32, 3, 3))).unwrap();
        assert_eq!(&*back.file, "a.asp");
        assert_eq!(back.span.start, loc(42, 3, 3));
    }

    #[test]
    fn out_of_order_mapping_is_rejected() {
        let mut m = SourceMapper::new();
        m.add_mapping(
            Span::new(loc(10, 1, 11), loc(20, 1, 21)),
            DocSpan::new(file("a"), Span::default()),
        )
        .unwrap();
        let err = m
            .add_mapping(Span::new(loc(15, 1, 16), loc(25, 1, 26)), DocSpan::new(file("a"), Span::default()))
            .unwrap_err();
        assert!(matches!(err, SourceMapError::OutOfOrder { start: 15, previous_end: 20 }));
    }

    #[test]
    fn unmapped_gap_returns_none() {
        let mut m = SourceMapper::new();
        m.add_mapping(
            Span::new(loc(10, 1, 11), loc(20, 1, 21)),
            DocSpan::new(file("a"), Span::default()),
        )
        .unwrap();
        assert!(m.map(Span::at(loc(2, 1, 3))).is_none());
    }

    #[test]
    fn identity_mapper_round_trips() {
        let src = "a = 1\r\nb = 2\r\n";
        let m = SourceMapper::identity(file("t.vbs"), src);
        let span = Span::new(loc(7, 2, 1), loc(12, 2, 6));
        assert_eq!(m.map(span).unwrap().span, span);
    }

    #[test]
    fn advance_tracks_lines() {
        let end = advance(Location::START, "ab\ncd");
        assert_eq!(end, loc(5, 2, 3));
    }
}
