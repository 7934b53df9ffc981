//! Page assembly: turns an ASP-style page into the single script buffer the
//! lexer sees.
//!
//! `<% code %>` fragments are copied through, `<%= expr %>` becomes
//! `Response.Write (expr)`, literal markup is moved into the literal-block
//! table and replaced by `Response.WriteBlock n`, and include directives are
//! expanded in place. Every appended chunk gets a source-map interval so
//! diagnostics point at the file the author wrote.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ast::{Location, Span};
use super::error::{Diagnostic, ErrorCode, ErrorKind};
use super::source_map::{self, DocSpan, SourceMapper};

/// Reads the text of a page or include file.
pub trait SourceLoader {
    fn load(&self, path: &Path) -> std::io::Result<String>;
}

/// Loads from the file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn load(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// The generated buffer plus everything needed to compile and run it.
#[derive(Debug, Clone, Default)]
pub struct AssembledPage {
    pub source: String,
    pub mapper: SourceMapper,
    pub literal_blocks: Vec<String>,
    /// The page and every file it included, for cache invalidation.
    pub files: Vec<PathBuf>,
}

/// A problem found while assembling, in original-file coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageError {
    pub file: Arc<str>,
    pub span: Span,
    pub code: ErrorCode,
    pub message: String,
}

impl PageError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic {
            file: self.file.to_string(),
            line: self.span.start.line,
            column: self.span.start.column,
            code: self.code.number(),
            kind: ErrorKind::Compiler,
            description: self.message.clone(),
        }
    }
}

/// Assemble the page at `path` whose text is `text`. `include_root` resolves
/// `virtual=` includes; without it they resolve like `file=` includes.
pub fn assemble(
    path: &Path,
    text: &str,
    loader: &dyn SourceLoader,
    include_root: Option<&Path>,
) -> (AssembledPage, Vec<PageError>) {
    let mut assembler = Assembler {
        out: String::new(),
        loc: Location::START,
        page: AssembledPage::default(),
        errors: Vec::new(),
        stack: Vec::new(),
        loader,
        include_root: include_root.map(Path::to_path_buf),
    };
    assembler.page.files.push(path.to_path_buf());
    assembler.file(path, text);
    let mut page = assembler.page;
    page.source = assembler.out;
    (page, assembler.errors)
}

/// Wrap a plain script file: one buffer, one identity interval.
pub fn plain(path: &Path, text: &str) -> AssembledPage {
    let file: Arc<str> = Arc::from(path.display().to_string());
    AssembledPage {
        source: text.to_string(),
        mapper: SourceMapper::identity(file, text),
        literal_blocks: Vec::new(),
        files: vec![path.to_path_buf()],
    }
}

/// Byte offset → (line, column) for one original file.
struct LineIndex<'t> {
    text: &'t str,
    starts: Vec<usize>,
}

impl<'t> LineIndex<'t> {
    fn new(text: &'t str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { text, starts }
    }

    fn location(&self, index: usize) -> Location {
        let line = self.starts.partition_point(|&s| s <= index) - 1;
        let start = self.starts[line];
        let column = self.text[start..index].chars().count() + 1;
        Location::new(index, line as u32 + 1, column as u32)
    }

    fn span(&self, start: usize, end: usize) -> Span {
        Span::new(self.location(start), self.location(end))
    }
}

struct Assembler<'a> {
    out: String,
    loc: Location,
    page: AssembledPage,
    errors: Vec<PageError>,
    /// Files currently being expanded, for cycle detection.
    stack: Vec<PathBuf>,
    loader: &'a dyn SourceLoader,
    include_root: Option<PathBuf>,
}

impl Assembler<'_> {
    /// Append generated text that stands for `doc`.
    fn emit(&mut self, text: &str, file: &Arc<str>, doc: Span) {
        if text.is_empty() {
            return;
        }
        let start = self.loc;
        self.out.push_str(text);
        self.loc = source_map::advance(start, text);
        // Intervals are appended in buffer order, so this cannot fail.
        let _ = self
            .page
            .mapper
            .add_mapping(Span::new(start, self.loc), DocSpan::new(Arc::clone(file), doc));
    }

    fn error(&mut self, file: &Arc<str>, span: Span, code: ErrorCode, message: String) {
        self.errors.push(PageError {
            file: Arc::clone(file),
            span,
            code,
            message,
        });
    }

    fn file(&mut self, path: &Path, text: &str) {
        let key = normalize(path);
        self.stack.push(key);
        let file: Arc<str> = Arc::from(path.display().to_string());
        let lines = LineIndex::new(text);
        let mut pos = 0;
        while pos < text.len() {
            let rest = &text[pos..];
            let code_at = rest.find("<%");
            let include_at = find_include(rest);
            match (code_at, include_at) {
                (Some(c), Some((i, _))) if i < c => {
                    self.literal(&text[pos..pos + i], &file, &lines, pos);
                    pos = self.include(path, text, &file, &lines, pos + i);
                }
                (None, Some((i, _))) => {
                    self.literal(&text[pos..pos + i], &file, &lines, pos);
                    pos = self.include(path, text, &file, &lines, pos + i);
                }
                (Some(c), _) => {
                    self.literal(&text[pos..pos + c], &file, &lines, pos);
                    pos = self.code(text, &file, &lines, pos + c);
                }
                (None, None) => {
                    self.literal(rest, &file, &lines, pos);
                    pos = text.len();
                }
            }
        }
        self.stack.pop();
    }

    fn literal(&mut self, html: &str, file: &Arc<str>, lines: &LineIndex<'_>, at: usize) {
        if html.is_empty() {
            return;
        }
        let n = self.page.literal_blocks.len();
        self.page.literal_blocks.push(html.to_string());
        let doc = lines.span(at, at + html.len());
        self.emit(&format!("Response.WriteBlock {n}\n"), file, doc);
    }

    /// Handle the `<%` block starting at `open`; returns the position after it.
    fn code(&mut self, text: &str, file: &Arc<str>, lines: &LineIndex<'_>, open: usize) -> usize {
        let body_start = open + 2;
        let (body_end, next) = match text[body_start..].find("%>") {
            Some(i) => (body_start + i, body_start + i + 2),
            None => {
                self.error(
                    file,
                    lines.span(open, body_start),
                    ErrorCode::SyntaxError,
                    "Unterminated script block: missing '%>'".to_string(),
                );
                (text.len(), text.len())
            }
        };
        let body = &text[body_start..body_end];
        if body.starts_with('@') {
            // Page directive (`<%@ Language=VBScript %>`).
            return next;
        }
        if let Some(expr) = body.strip_prefix('=') {
            let expr_start = body_start + 1;
            self.emit("Response.Write (", file, lines.span(open, expr_start));
            self.emit(expr, file, lines.span(expr_start, body_end));
            self.emit(")\n", file, lines.span(body_end, next));
        } else {
            let mut chunk = body.to_string();
            chunk.push('\n');
            self.emit(&chunk, file, lines.span(body_start, body_end));
        }
        next
    }

    /// Expand the include directive starting at `open`; returns the position
    /// after it.
    fn include(&mut self, path: &Path, text: &str, file: &Arc<str>, lines: &LineIndex<'_>, open: usize) -> usize {
        let Some((_, directive)) = find_include(&text[open..]) else {
            return open + 4;
        };
        let end = open + directive.len;
        let span = lines.span(open, end);
        let target = match directive.kind {
            IncludeKind::File => path.parent().unwrap_or_else(|| Path::new("")).join(&directive.target),
            IncludeKind::Virtual => match &self.include_root {
                Some(root) => root.join(directive.target.trim_start_matches(['/', '\\'])),
                None => path.parent().unwrap_or_else(|| Path::new("")).join(&directive.target),
            },
        };
        let key = normalize(&target);
        if self.stack.contains(&key) {
            self.error(
                file,
                span,
                ErrorCode::IncludeCycle,
                format!("Include cycle: '{}' includes itself", target.display()),
            );
            return end;
        }
        match self.loader.load(&target) {
            Ok(included) => {
                if !self.page.files.contains(&target) {
                    self.page.files.push(target.clone());
                }
                self.file(&target, &included);
            }
            Err(e) => self.error(
                file,
                span,
                ErrorCode::IncludeNotFound,
                format!("Include file not found: '{}' ({e})", target.display()),
            ),
        }
        end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IncludeKind {
    File,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    kind: IncludeKind,
    target: String,
    /// Length of the whole `<!-- ... -->` comment.
    len: usize,
}

/// Find the first `<!-- #include file|virtual="..." -->` in `text`.
fn find_include(text: &str) -> Option<(usize, Directive)> {
    let mut from = 0;
    while let Some(i) = text[from..].find("<!--") {
        let at = from + i;
        if let Some(d) = parse_directive(&text[at..]) {
            return Some((at, d));
        }
        from = at + 4;
    }
    None
}

fn parse_directive(text: &str) -> Option<Directive> {
    let close = text.find("-->")?;
    let inner = text[4..close].trim();
    let rest = strip_prefix_ignore_case(inner, "#include")?.trim_start();
    let (kind, rest) = if let Some(r) = strip_prefix_ignore_case(rest, "file") {
        (IncludeKind::File, r)
    } else {
        (IncludeKind::Virtual, strip_prefix_ignore_case(rest, "virtual")?)
    };
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let target = &rest[..rest.find('"')?];
    Some(Directive {
        kind,
        target: target.to_string(),
        len: close + 3,
    })
}

fn strip_prefix_ignore_case<'t>(text: &'t str, prefix: &str) -> Option<&'t str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

/// Lexical normalization for cycle detection; the file may not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct MemoryLoader {
        files: HashMap<PathBuf, String>,
    }

    impl MemoryLoader {
        fn with(mut self, path: &str, text: &str) -> Self {
            self.files.insert(PathBuf::from(path), text.to_string());
            self
        }
    }

    impl SourceLoader for MemoryLoader {
        fn load(&self, path: &Path) -> std::io::Result<String> {
            self.files
                .get(&normalize(path))
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }
    }

    fn assemble_str(text: &str, loader: &MemoryLoader) -> (AssembledPage, Vec<PageError>) {
        assemble(Path::new("site/page.asp"), text, loader, Some(Path::new("site")))
    }

    #[test]
    fn code_expressions_and_literals() {
        let (page, errors) = assemble_str("<p><% x = 1 %><%= x %></p>", &MemoryLoader::default());
        assert!(errors.is_empty());
        assert_eq!(page.literal_blocks, vec!["<p>".to_string(), "</p>".to_string()]);
        assert_eq!(
            page.source,
            "Response.WriteBlock 0\n x = 1 \nResponse.Write ( x )\nResponse.WriteBlock 1\n"
        );
    }

    #[test]
    fn generated_positions_map_back_to_the_page() {
        let text = "<html>\n<body>\n<%\nx = 1\ny = 2 %>";
        let (page, _) = assemble_str(text, &MemoryLoader::default());
        // `y` sits on generated line 4 (after the WriteBlock line and the
        // fragment's leading newline) and on page line 5.
        let y = page.source.find('y').unwrap();
        let loc = source_map::advance(Location::START, &page.source[..y]);
        let doc = page.mapper.map(Span::at(loc)).unwrap();
        assert_eq!(&*doc.file, "site/page.asp");
        assert_eq!((doc.span.start.line, doc.span.start.column), (5, 1));
    }

    #[test]
    fn includes_expand_and_map_to_their_file() {
        let loader = MemoryLoader::default()
            .with("site/lib/util.inc", "<% Function Twice(n)\nTwice = n * 2\nEnd Function %>")
            .with("site/common.inc", "<!-- #include file=\"lib/util.inc\" -->");
        let (page, errors) = assemble_str("<!-- #include virtual=\"/common.inc\" --><%= Twice(2) %>", &loader);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(page.source.contains("Function Twice"));
        assert_eq!(page.files.len(), 3);
        let at = page.source.find("Twice = n").unwrap();
        let loc = source_map::advance(Location::START, &page.source[..at]);
        let doc = page.mapper.map(Span::at(loc)).unwrap();
        assert_eq!(&*doc.file, "site/lib/util.inc");
        assert_eq!(doc.span.start.line, 2);
    }

    #[test]
    fn include_cycles_and_missing_files_are_reported() {
        let loader = MemoryLoader::default().with("site/a.inc", "<!-- #include file=\"page.asp\" -->");
        let (_, errors) = assemble_str("<!-- #include file=\"a.inc\" -->\n<!-- #include file=\"gone.inc\" -->", &loader);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, ErrorCode::IncludeCycle);
        assert_eq!(&*errors[0].file, "site/a.inc");
        assert_eq!(errors[1].code, ErrorCode::IncludeNotFound);
        assert_eq!(errors[1].span.start.line, 2);
    }

    #[test]
    fn ordinary_comments_stay_literal() {
        let (page, _) = assemble_str("<!-- note --><% %>", &MemoryLoader::default());
        assert_eq!(page.literal_blocks, vec!["<!-- note -->".to_string()]);
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let (_, errors) = assemble_str("<% x = 1", &MemoryLoader::default());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::SyntaxError);
    }
}
