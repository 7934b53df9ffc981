#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
)]
pub mod analyzer;
pub mod ast;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
)]
pub mod compiler;
pub mod error;
#[allow(clippy::indexing_slicing)]
pub mod lexer;
#[allow(clippy::indexing_slicing)]
pub mod page;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::single_match_else,
)]
pub mod parser;
pub mod source_map;
pub mod trace;
#[allow(
    clippy::indexing_slicing,
    clippy::needless_pass_by_value,
    clippy::single_match_else,
)]
pub mod vm;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::runtime::binder::BinderFactory;
use compiler::{CompileOptions, CompiledUnit, UnitSource};
use error::{CompileError, CompileFailure};
use page::{AssembledPage, SourceLoader};

/// Compile a standalone script.
///
/// source → lex → parse → analyze → compile → [`CompiledUnit`]
pub fn compile_script(
    name: &str,
    source: &str,
    options: CompileOptions,
    factory: &BinderFactory,
) -> Result<Arc<CompiledUnit>, CompileFailure> {
    let page = page::plain(Path::new(name), source);
    compile_assembled(name, &page, Vec::new(), options, factory)
}

/// Compile a page: `<% %>` blocks, `<%= %>` output and `#include`
/// directives are assembled into one script first.
pub fn compile_page(
    path: &Path,
    text: &str,
    loader: &dyn SourceLoader,
    include_root: Option<&Path>,
    options: CompileOptions,
    factory: &BinderFactory,
) -> Result<(Arc<CompiledUnit>, Vec<std::path::PathBuf>), CompileFailure> {
    let (page, page_errors) = page::assemble(path, text, loader, include_root);
    let diagnostics = page_errors.iter().map(page::PageError::to_diagnostic).collect();
    let name = path.display().to_string();
    let unit = compile_assembled(&name, &page, diagnostics, options, factory)?;
    Ok((unit, page.files))
}

fn compile_assembled(
    name: &str,
    page: &AssembledPage,
    mut diagnostics: Vec<error::Diagnostic>,
    options: CompileOptions,
    factory: &BinderFactory,
) -> Result<Arc<CompiledUnit>, CompileFailure> {
    let fail = |diagnostics: Vec<error::Diagnostic>, errors: &[CompileError]| {
        let mut failure = CompileFailure::from_errors(errors, &page.mapper, name);
        let mut all = diagnostics;
        all.append(&mut failure.diagnostics);
        failure.diagnostics = all;
        failure
    };

    let (tokens, mut errors) = lexer::lex(&page.source);
    let (program, parse_errors) = parser::parse(tokens);
    errors.extend(parse_errors);
    errors.sort_by_key(|e| e.span.start);
    if !errors.is_empty() || !diagnostics.is_empty() {
        return Err(fail(std::mem::take(&mut diagnostics), &errors));
    }

    let (analysis, errors) = analyzer::analyze(&program);
    if !errors.is_empty() {
        return Err(fail(diagnostics, &errors));
    }

    let source = UnitSource {
        name: Arc::from(name),
        mapper: page.mapper.clone(),
        literal_blocks: page.literal_blocks.clone(),
    };
    let unit = compiler::compile(&program, &analysis, source, options, factory)
        .map_err(|errors| fail(Vec::new(), &errors))?;
    debug!(
        unit = name,
        procs = unit.procs.len(),
        classes = unit.classes.len(),
        sites = unit.sites.len(),
        "compiled"
    );
    Ok(Arc::new(unit))
}
