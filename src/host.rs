//! The hosting facade: compile sources and pages, cache compiled pages, and
//! run units against a module scope with the configured limits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::runtime::binder::BinderFactory;
use crate::runtime::err_object::ErrObject;
use crate::runtime::error::ScriptException;
use crate::runtime::object::HostObject;
use crate::runtime::scope::ModuleScope;
use crate::script::compiler::{CompileOptions, CompiledUnit};
use crate::script::error::CompileFailure;
use crate::script::page::{FsLoader, SourceLoader};
use crate::script::trace::{LogTraceSink, TraceSink};
use crate::script::vm::Vm;
use crate::script::{compile_page, compile_script};
use crate::settings::{EngineSettings, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileFailure),
    #[error(transparent)]
    Script(#[from] ScriptException),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

struct CachedPage {
    unit: Arc<CompiledUnit>,
    /// The page and every include it pulled in.
    files: Vec<PathBuf>,
    compiled_at: SystemTime,
}

impl CachedPage {
    fn is_fresh(&self) -> bool {
        self.files.iter().all(|file| {
            std::fs::metadata(file)
                .and_then(|m| m.modified())
                .is_ok_and(|modified| modified <= self.compiled_at)
        })
    }
}

/// Per-execution knobs supplied by the caller.
#[derive(Default, Clone)]
pub struct Execution<'a> {
    /// Receives trace points of a unit compiled with tracing. Defaults to
    /// [`LogTraceSink`].
    pub trace: Option<&'a dyn TraceSink>,
    /// Set from another thread to stop the script. The engine's timeout
    /// watchdog sets the same flag.
    pub abort: Option<Arc<AtomicBool>>,
}

pub struct Engine {
    settings: EngineSettings,
    factory: BinderFactory,
    pages: Mutex<HashMap<PathBuf, CachedPage>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            factory: BinderFactory::new(),
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Binders shared by every unit this engine compiles.
    pub fn factory(&self) -> &BinderFactory {
        &self.factory
    }

    fn options(&self) -> CompileOptions {
        CompileOptions {
            trace: self.settings.trace,
            option_explicit: self.settings.option_explicit,
        }
    }

    /// Compile a standalone script held in memory.
    pub fn compile_source(&self, name: &str, source: &str) -> Result<Arc<CompiledUnit>, CompileFailure> {
        compile_script(name, source, self.options(), &self.factory)
    }

    /// Compile a page held in memory, loading includes with `loader`.
    /// Bypasses the page cache.
    pub fn compile_page_source(
        &self,
        path: &Path,
        text: &str,
        loader: &dyn SourceLoader,
    ) -> Result<Arc<CompiledUnit>, CompileFailure> {
        let include_root = self.settings.include_root.as_deref();
        compile_page(path, text, loader, include_root, self.options(), &self.factory).map(|(unit, _)| unit)
    }

    /// Compile a file: a page when its extension is listed in
    /// `page_extensions`, otherwise a plain script.
    pub fn compile_file(&self, path: &Path) -> Result<Arc<CompiledUnit>, HostError> {
        if !self.settings.is_page(path) {
            let text = read(path)?;
            return Ok(self.compile_source(&path.display().to_string(), &text)?);
        }

        if self.settings.cache_pages {
            let pages = self.pages.lock();
            if let Some(cached) = pages.get(path) {
                if cached.is_fresh() {
                    debug!(path = %path.display(), "page cache hit");
                    return Ok(Arc::clone(&cached.unit));
                }
                debug!(path = %path.display(), "page cache entry is stale");
            }
        }

        let started = SystemTime::now();
        let text = read(path)?;
        let include_root = self.settings.include_root.as_deref();
        let (unit, files) = compile_page(path, &text, &FsLoader, include_root, self.options(), &self.factory)?;
        if self.settings.cache_pages {
            debug!(path = %path.display(), includes = files.len().saturating_sub(1), "page cached");
            self.pages.lock().insert(
                path.to_path_buf(),
                CachedPage {
                    unit: Arc::clone(&unit),
                    files,
                    compiled_at: started,
                },
            );
        }
        Ok(unit)
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn clear_cache(&self) {
        self.pages.lock().clear();
    }

    /// Run a unit against `scope`. A fresh `Err` object is bound as `Err`.
    pub fn execute(&self, unit: &Arc<CompiledUnit>, scope: &ModuleScope) -> Result<(), ScriptException> {
        self.execute_with(unit, scope, Execution::default())
    }

    pub fn execute_with(
        &self,
        unit: &Arc<CompiledUnit>,
        scope: &ModuleScope,
        execution: Execution<'_>,
    ) -> Result<(), ScriptException> {
        let err = Rc::new(ErrObject::new());
        scope.add_object("Err", Rc::clone(&err) as Rc<dyn HostObject>);

        let abort = execution.abort.unwrap_or_default();
        let watchdog = self.settings.script_timeout_ms.map(|ms| {
            let (done, finished) = mpsc::channel::<()>();
            let flag = Arc::clone(&abort);
            let name = Arc::clone(&unit.name);
            let handle = thread::spawn(move || {
                if finished.recv_timeout(Duration::from_millis(ms)) == Err(RecvTimeoutError::Timeout) {
                    warn!(unit = %name, timeout_ms = ms, "script timed out");
                    flag.store(true, Ordering::Relaxed);
                }
            });
            (done, handle)
        });

        let log_sink = LogTraceSink;
        let trace = execution.trace.unwrap_or(&log_sink);
        let result = Vm::new(scope, err, &self.factory)
            .with_trace(Some(trace))
            .with_abort(&abort)
            .with_max_depth(self.settings.max_call_depth)
            .run(unit);

        if let Some((done, handle)) = watchdog {
            drop(done);
            if handle.join().is_err() {
                warn!("timeout watchdog panicked");
            }
        }
        result
    }

    /// Compile (or fetch from the cache) and execute a file.
    pub fn run_file(&self, path: &Path, scope: &ModuleScope) -> Result<Arc<CompiledUnit>, HostError> {
        let unit = self.compile_file(path)?;
        self.execute(&unit, scope)?;
        Ok(unit)
    }
}

fn read(path: &Path) -> Result<String, HostError> {
    std::fs::read_to_string(path).map_err(|source| HostError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;
    use crate::script::trace::RecordingTraceSink;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vbscript_host_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn compiles_and_runs_a_script() {
        let engine = Engine::default();
        let unit = engine.compile_source("inline.vbs", "x = 6 * 7\n").unwrap();
        let scope = ModuleScope::new();
        engine.execute(&unit, &scope).unwrap();
        assert_eq!(scope.get("x"), Some(Value::Integer(42)));
    }

    #[test]
    fn units_can_run_more_than_once() {
        let engine = Engine::default();
        let unit = engine.compile_source("again.vbs", "n = n + 1\n").unwrap();
        let scope = ModuleScope::new();
        scope.set("n", Value::Integer(0));
        engine.execute(&unit, &scope).unwrap();
        engine.execute(&unit, &scope).unwrap();
        assert_eq!(scope.get("n"), Some(Value::Integer(2)));
    }

    #[test]
    fn the_timeout_aborts_a_runaway_script() {
        let engine = Engine::new(EngineSettings {
            script_timeout_ms: Some(50),
            ..EngineSettings::default()
        });
        let unit = engine
            .compile_source("spin.vbs", "On Error Resume Next\nDo\n    n = n + 1\nLoop\n")
            .unwrap();
        let e = engine.execute(&unit, &ModuleScope::new()).unwrap_err();
        assert!(e.aborted);
    }

    #[test]
    fn an_external_abort_flag_stops_execution() {
        let engine = Engine::default();
        let unit = engine.compile_source("stop.vbs", "x = 1\n").unwrap();
        let execution = Execution {
            abort: Some(Arc::new(AtomicBool::new(true))),
            ..Execution::default()
        };
        let e = engine.execute_with(&unit, &ModuleScope::new(), execution).unwrap_err();
        assert!(e.aborted);
    }

    #[test]
    fn trace_setting_reaches_the_sink() {
        let engine = Engine::new(EngineSettings {
            trace: true,
            ..EngineSettings::default()
        });
        let unit = engine.compile_source("traced.vbs", "a = 1\nb = 2\n").unwrap();
        let sink = RecordingTraceSink::new();
        let execution = Execution {
            trace: Some(&sink),
            ..Execution::default()
        };
        engine.execute_with(&unit, &ModuleScope::new(), execution).unwrap();
        let lines: Vec<u32> = sink.points().iter().map(|p| p.start_line).collect();
        assert_eq!(lines, vec![1, 2]);
    }

    #[test]
    fn pages_are_cached_until_an_include_changes() {
        let dir = temp_dir("cache");
        let page = dir.join("index.asp");
        let include = dir.join("header.inc");
        std::fs::write(&include, "<% title = \"Home\" %>").unwrap();
        std::fs::write(&page, "<!-- #include file=\"header.inc\" --><% shown = title %>").unwrap();

        let engine = Engine::default();
        let first = engine.compile_file(&page).unwrap();
        let second = engine.compile_file(&page).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cached_pages(), 1);

        std::fs::write(&include, "<% title = \"Start\" %>").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&include)
            .unwrap()
            .set_modified(later)
            .unwrap();
        let third = engine.compile_file(&page).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_files_are_io_errors() {
        let engine = Engine::default();
        let result = engine.compile_file(Path::new("/nonexistent/vbscript/test.vbs"));
        assert!(matches!(result, Err(HostError::Io { .. })));
    }
}
