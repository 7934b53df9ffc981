#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use vbscript::runtime::error::RuntimeError;
use vbscript::runtime::object::{HostObject, InvokeKind, MemberInfo, ParamKind};
use vbscript::runtime::value::{self, Value, VbType};
use vbscript::script::page::SourceLoader;
use vbscript::{Engine, EngineSettings, ModuleScope, ScriptException};

// ── Test doubles ─────────────────────────────────────────────────

/// Collects everything written through `Response`.
struct Recorder {
    blocks: Vec<String>,
    written: RefCell<String>,
}

const RECORDER_MEMBERS: [MemberInfo; 2] = [
    MemberInfo::method("Write", &[ParamKind::Any]),
    MemberInfo::method("WriteBlock", &[ParamKind::Typed(VbType::Long)]),
];

impl HostObject for Recorder {
    fn type_name(&self) -> &str {
        "Response"
    }

    fn members(&self) -> &[MemberInfo] {
        &RECORDER_MEMBERS
    }

    fn invoke(&self, member: usize, _kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError> {
        let text = if member == 0 {
            value::to_str(&value::unwrap_default(&args[0])?)?.to_string()
        } else {
            let index = value::to_i64(&args[0])? as usize;
            self.blocks[index].clone()
        };
        self.written.borrow_mut().push_str(&text);
        Ok(Value::Empty)
    }
}

/// A COM-style object whose only useful member is its default property.
struct Wrapped {
    value: RefCell<Value>,
}

const WRAPPED_MEMBERS: [MemberInfo; 1] = [MemberInfo::property("Value", &[])];

impl HostObject for Wrapped {
    fn type_name(&self) -> &str {
        "Wrapped"
    }

    fn members(&self) -> &[MemberInfo] {
        &WRAPPED_MEMBERS
    }

    fn invoke(&self, _member: usize, kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError> {
        match kind {
            InvokeKind::PropertyPut | InvokeKind::PropertyPutRef => {
                *self.value.borrow_mut() = args[0].clone();
                Ok(Value::Empty)
            }
            InvokeKind::Method | InvokeKind::PropertyGet => Ok(self.value.borrow().clone()),
        }
    }

    fn default_member(&self) -> Option<&str> {
        Some("Value")
    }
}

#[derive(Default)]
struct MemoryLoader {
    files: HashMap<PathBuf, String>,
}

impl SourceLoader for MemoryLoader {
    fn load(&self, path: &Path) -> std::io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string()))
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn run(source: &str) -> Result<ModuleScope, ScriptException> {
    run_with(&Engine::default(), source)
}

fn run_with(engine: &Engine, source: &str) -> Result<ModuleScope, ScriptException> {
    let unit = engine.compile_source("test.vbs", source).unwrap();
    let scope = ModuleScope::new();
    engine.execute(&unit, &scope)?;
    Ok(scope)
}

fn int(scope: &ModuleScope, name: &str) -> i64 {
    value::to_i64(&scope.get(name).unwrap()).unwrap()
}

fn text(scope: &ModuleScope, name: &str) -> String {
    value::to_str(&scope.get(name).unwrap()).unwrap().to_string()
}

// ── Scripts ──────────────────────────────────────────────────────

#[test]
fn numeric_string_coercion() {
    let scope = run("a = 1\r\nb = \"2\"\r\nc = a + b\r\n").unwrap();
    assert_eq!(scope.get("c"), Some(Value::Integer(3)));
}

#[test]
fn redim_preserve_then_ubound() {
    let scope = run("ReDim arr(4)\nReDim Preserve arr(2)\nn = UBound(arr)\n").unwrap();
    assert_eq!(int(&scope, "n"), 2);
}

#[test]
fn recursion() {
    let source = "Function Fact(n)
    If n <= 1 Then
        Fact = 1
    Else
        Fact = n * Fact(n - 1)
    End If
End Function
f = Fact(10)
";
    let scope = run(source).unwrap();
    assert_eq!(int(&scope, "f"), 3_628_800);
}

#[test]
fn string_library() {
    let source = "s = Join(Split(\"a,b,c\", \",\"), \"-\")
l = Len(s)
u = UCase(Left(s, 3)) & Mid(s, 4)
p = InStr(s, \"c\")
";
    let scope = run(source).unwrap();
    assert_eq!(text(&scope, "s"), "a-b-c");
    assert_eq!(int(&scope, "l"), 5);
    assert_eq!(text(&scope, "u"), "A-B-c");
    assert_eq!(int(&scope, "p"), 5);
}

#[test]
fn resume_next_contains_a_fault() {
    let source = "On Error Resume Next
x = CInt(\"abc\")
n = Err.Number
Err.Clear
cleared = Err.Number
";
    let scope = run(source).unwrap();
    assert_eq!(int(&scope, "n"), 13);
    assert_eq!(int(&scope, "cleared"), 0);
}

#[test]
fn faults_escape_without_resume_next() {
    let e = run("x = 1\ny = x / 0\n").err().unwrap();
    assert_eq!(e.number, 11);
    assert_eq!(e.location.as_ref().unwrap().span.start.line, 2);
    assert!(e.source_location.contains("test.vbs"));
}

#[test]
fn err_raise_with_a_custom_number() {
    let source = "On Error Resume Next
Err.Raise vbObjectError + 1, \"app\", \"custom failure\"
n = Err.Number
d = Err.Description
s = Err.Source
";
    let scope = run(source).unwrap();
    assert_eq!(int(&scope, "n"), -2_147_221_503);
    assert_eq!(text(&scope, "d"), "custom failure");
    assert_eq!(text(&scope, "s"), "app");
}

#[test]
fn class_properties() {
    let source = "Class Person
    Private mName
    Public Property Let Name(v)
        mName = UCase(v)
    End Property
    Public Property Get Name
        Name = mName
    End Property
    Public Function Greet(other)
        Greet = \"Hello \" & other & \", I am \" & Name
    End Function
End Class
Set p = New Person
p.Name = \"ann\"
n = p.Name
g = p.Greet(\"Bob\")
Set q = p
same = q Is p
";
    let scope = run(source).unwrap();
    assert_eq!(text(&scope, "n"), "ANN");
    assert_eq!(text(&scope, "g"), "Hello Bob, I am ANN");
    assert_eq!(scope.get("same"), Some(Value::Boolean(true)));
}

#[test]
fn byref_writes_back_through_nested_calls() {
    let source = "Sub Inner(ByRef v)
    v = v & \"!\"
End Sub
Sub Outer(ByRef v)
    Inner v
    v = v & \"?\"
End Sub
s = \"hi\"
Outer s
Call Outer(s)
";
    let scope = run(source).unwrap();
    assert_eq!(text(&scope, "s"), "hi!?!?");
}

#[test]
fn parenthesized_arguments_pass_by_value() {
    let source = "Sub Bump(ByRef n)
    n = n + 1
End Sub
Class Counter
    Public Sub Bump(ByRef n)
        n = n + 10
    End Sub
End Class
a = 1
Bump (a)
b = 1
Call Bump(b)
Set c = New Counter
d = 1
c.Bump (d)
e = 1
c.Bump e
";
    let scope = run(source).unwrap();
    assert_eq!(int(&scope, "a"), 1);
    assert_eq!(int(&scope, "b"), 2);
    assert_eq!(int(&scope, "d"), 1);
    assert_eq!(int(&scope, "e"), 11);
}

#[test]
fn dictionary_keys_and_items() {
    let source = "Set d = CreateObject(\"Scripting.Dictionary\")
d.Add \"x\", 10
d.Add \"y\", 20
total = 0
For Each k In d.Keys
    total = total + d(k)
Next
has = d.Exists(\"y\")
d.Remove \"x\"
remaining = d.Count
On Error Resume Next
d.Add \"y\", 1
dup = Err.Number
";
    let scope = run(source).unwrap();
    assert_eq!(int(&scope, "total"), 30);
    assert_eq!(scope.get("has"), Some(Value::Boolean(true)));
    assert_eq!(int(&scope, "remaining"), 1);
    assert_eq!(int(&scope, "dup"), 457);
}

#[test]
fn host_default_values_take_part_in_expressions() {
    let engine = Engine::default();
    let unit = engine
        .compile_source(
            "com.vbs",
            "n = w * 2\ns = \"v=\" & w\nIf w = 5 Then hit = True\nw.Value = 7\nplain = w\n",
        )
        .unwrap();
    let scope = ModuleScope::new();
    let wrapped = Rc::new(Wrapped {
        value: RefCell::new(Value::Integer(5)),
    });
    scope.add_object("w", Rc::clone(&wrapped) as Rc<dyn HostObject>);
    engine.execute(&unit, &scope).unwrap();
    assert_eq!(int(&scope, "n"), 10);
    assert_eq!(text(&scope, "s"), "v=5");
    assert_eq!(scope.get("hit"), Some(Value::Boolean(true)));
    assert_eq!(int(&scope, "plain"), 7);
}

#[test]
fn option_explicit_from_settings() {
    let engine = Engine::new(EngineSettings {
        option_explicit: true,
        ..EngineSettings::default()
    });
    let e = run_with(&engine, "Dim a\na = 1\nb = a\n").err().unwrap();
    assert_eq!(e.number, 500);
}

#[test]
fn call_depth_limit() {
    let engine = Engine::new(EngineSettings {
        max_call_depth: 64,
        ..EngineSettings::default()
    });
    let e = run_with(&engine, "Sub Forever()\n    Forever\nEnd Sub\nForever\n").err().unwrap();
    assert_eq!(e.number, 28);
}

#[test]
fn compile_errors_are_collected() {
    let engine = Engine::default();
    let failure = engine
        .compile_source("broken.vbs", "x = 1\nIf x Then\ny = (1 +\n")
        .unwrap_err();
    assert!(!failure.diagnostics.is_empty());
    assert!(failure.diagnostics.iter().all(|d| d.file == "broken.vbs"));
    assert!(failure.diagnostics.iter().any(|d| d.line == 3));
}

// ── Pages ────────────────────────────────────────────────────────

fn page_engine_run(text: &str, loader: &MemoryLoader) -> (Result<(), ScriptException>, String) {
    let engine = Engine::default();
    let unit = engine.compile_page_source(Path::new("site/index.asp"), text, loader).unwrap();
    let recorder = Rc::new(Recorder {
        blocks: unit.literal_blocks.clone(),
        written: RefCell::new(String::new()),
    });
    let scope = ModuleScope::new();
    scope.add_object("Response", Rc::clone(&recorder) as Rc<dyn HostObject>);
    let result = engine.execute(&unit, &scope);
    let written = recorder.written.borrow().clone();
    (result, written)
}

#[test]
fn pages_render_literal_text_and_expressions() {
    let mut loader = MemoryLoader::default();
    loader
        .files
        .insert(PathBuf::from("site/header.inc"), "<% title = \"Home\" %>".to_string());
    let text = "<!-- #include file=\"header.inc\" -->\n<h1><%= title %></h1>\n<% For i = 1 To 3 %><%= i %><% Next %>";
    let (result, written) = page_engine_run(text, &loader);
    result.unwrap();
    assert_eq!(written, "\n<h1>Home</h1>\n123");
}

#[test]
fn page_faults_map_to_the_original_line() {
    let text = "<html>\n<body>\n<% x = 1 / 0 %>\n</body>";
    let (result, written) = page_engine_run(text, &MemoryLoader::default());
    let e = result.unwrap_err();
    assert_eq!(e.number, 11);
    let location = e.location.unwrap();
    assert_eq!(&*location.file, "site/index.asp");
    assert_eq!(location.span.start.line, 3);
    assert_eq!(written, "<html>\n<body>\n");
}
