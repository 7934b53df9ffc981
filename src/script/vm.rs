//! Tree-walking interpreter for [`CompiledUnit`]s.
//!
//! One [`Vm`] runs one execution: it borrows the module scope, owns the
//! per-execution `Err` object, and carries the host's abort flag and trace
//! sink. Dynamic operations go through the unit's call sites.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::ast::{BinaryOp, ExitKind, Literal, Span};
use super::compiler::{Arg, CompiledUnit, LoopTest, Node, Op, OpKind, Place, Target};
use super::trace::TraceSink;
use crate::runtime::array::VbArray;
use crate::runtime::binder::{Action, BinderFactory, BinderKey, CallSite, Resolution};
use crate::runtime::builtins::BUILTINS;
use crate::runtime::err_object::ErrObject;
use crate::runtime::error::{Fault, FaultKind, RuntimeError, ScriptException};
use crate::runtime::object::{host_default_value, Instance, ObjectRef};
use crate::runtime::ops;
use crate::runtime::scope::ModuleScope;
use crate::runtime::value::{self, Value};

pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Default-member chains longer than this are treated as cycles.
const MAX_DEFAULT_CHAIN: usize = 32;

pub fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Empty => Value::Empty,
        Literal::Null => Value::Null,
        Literal::Nothing => Value::Nothing,
        Literal::Bool(b) => Value::Boolean(*b),
        Literal::Integer(n) => Value::Integer(*n),
        Literal::Long(n) => Value::Long(*n),
        Literal::Double(n) => Value::Double(*n),
        Literal::String(s) => Value::from(s.as_str()),
        Literal::Date(d) => Value::Date(*d),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Exit(ExitKind),
}

struct Frame {
    unit: Arc<CompiledUnit>,
    locals: Vec<Value>,
    me: Option<Rc<Instance>>,
    with: Vec<Value>,
    resume_next: bool,
}

impl Frame {
    fn new(unit: Arc<CompiledUnit>, locals: Vec<Value>, me: Option<Rc<Instance>>) -> Self {
        Self {
            unit,
            locals,
            me,
            with: Vec::new(),
            resume_next: false,
        }
    }

    fn me(&self) -> Result<&Rc<Instance>, RuntimeError> {
        self.me.as_ref().ok_or_else(|| RuntimeError::object_required("Me"))
    }

    fn local(&self, slot: usize) -> Value {
        self.locals.get(slot).cloned().unwrap_or_default()
    }

    fn set_local(&mut self, slot: usize, value: Value) {
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, Value::Empty);
        }
        self.locals[slot] = value;
    }
}

/// Where a ByRef argument writes back to, in the caller's frame.
enum Ref {
    Place(Place),
    Element { array: Place, indices: Vec<i64> },
}

pub struct Vm<'a> {
    scope: &'a ModuleScope,
    err: Rc<ErrObject>,
    factory: &'a BinderFactory,
    trace: Option<&'a dyn TraceSink>,
    abort: Option<&'a AtomicBool>,
    max_depth: usize,
    depth: usize,
    /// Module slot of each (unit, global index) seen so far.
    global_slots: HashMap<(u64, usize), usize>,
    /// Innermost statement that raised the fault being propagated.
    fault_at: Option<(Arc<CompiledUnit>, Span)>,
}

impl<'a> Vm<'a> {
    pub fn new(scope: &'a ModuleScope, err: Rc<ErrObject>, factory: &'a BinderFactory) -> Self {
        Self {
            scope,
            err,
            factory,
            trace: None,
            abort: None,
            max_depth: DEFAULT_MAX_DEPTH,
            depth: 0,
            global_slots: HashMap::new(),
            fault_at: None,
        }
    }

    pub fn with_trace(mut self, sink: Option<&'a dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    /// Checked before every statement and loop iteration.
    pub fn with_abort(mut self, flag: &'a AtomicBool) -> Self {
        self.abort = Some(flag);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Run the unit's top-level code against the module scope.
    pub fn run(&mut self, unit: &Arc<CompiledUnit>) -> Result<(), ScriptException> {
        debug!(unit = %unit.name, "executing");
        let mut frame = Frame::new(Arc::clone(unit), Vec::new(), None);
        let result = self
            .exec_block(&mut frame, &unit.prologue)
            .and_then(|_| self.exec_block(&mut frame, &unit.body));
        match result {
            Ok(_) => Ok(()),
            Err(fault) => {
                let location = self
                    .fault_at
                    .take()
                    .and_then(|(at, span)| at.mapper.map(span));
                let exception = ScriptException::from_fault(fault, location, &unit.name);
                warn!(unit = %unit.name, number = exception.number, "{exception}");
                Err(exception)
            }
        }
    }

    fn check_abort(&self) -> Result<(), Fault> {
        match self.abort {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Fault::Aborted {
                reason: "script execution was aborted by the host".to_string(),
            }),
            _ => Ok(()),
        }
    }

    // ── Statements ───────────────────────────────────────────────

    fn exec_block(&mut self, frame: &mut Frame, ops: &[Op]) -> Result<Flow, Fault> {
        for op in ops {
            if let Flow::Exit(kind) = self.exec(frame, op)? {
                return Ok(Flow::Exit(kind));
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, frame: &mut Frame, op: &Op) -> Result<Flow, Fault> {
        self.check_abort()?;
        let result = self.exec_kind(frame, op);
        if result.is_err() && self.fault_at.is_none() {
            self.fault_at = Some((Arc::clone(&frame.unit), op.span));
        }
        result
    }

    fn exec_kind(&mut self, frame: &mut Frame, op: &Op) -> Result<Flow, Fault> {
        match &op.kind {
            OpKind::Eval(node) => {
                self.eval(frame, node)?;
            }
            OpKind::Assign { target, value, set } => {
                let value = self.eval(frame, value)?;
                let value = if *set {
                    match value {
                        Value::Object(_) | Value::Nothing => value,
                        _ => return Err(RuntimeError::object_required("Set").into()),
                    }
                } else {
                    self.plain_value(value)?
                };
                self.assign(frame, target, value)?;
            }
            OpKind::If { branches, else_body } => {
                for (cond, body) in branches {
                    if self.truthy(frame, cond)? {
                        return self.exec_block(frame, body);
                    }
                }
                return self.exec_block(frame, else_body);
            }
            OpKind::For {
                var,
                from,
                to,
                step,
                body,
            } => return self.exec_for(frame, *var, from, to, step.as_ref(), body),
            OpKind::ForEach { var, collection, body } => {
                let collection = self.eval(frame, collection)?;
                for item in self.items(&collection)? {
                    self.check_abort()?;
                    self.store(frame, *var, item)?;
                    match self.exec_block(frame, body)? {
                        Flow::Exit(ExitKind::For) => break,
                        Flow::Exit(kind) => return Ok(Flow::Exit(kind)),
                        Flow::Normal => {}
                    }
                }
            }
            OpKind::Loop { pre, post, body } => loop {
                self.check_abort()?;
                if let Some(test) = pre {
                    if !self.loop_continues(frame, test)? {
                        break;
                    }
                }
                match self.exec_block(frame, body)? {
                    Flow::Exit(ExitKind::Do) => break,
                    Flow::Exit(kind) => return Ok(Flow::Exit(kind)),
                    Flow::Normal => {}
                }
                if let Some(test) = post {
                    if !self.loop_continues(frame, test)? {
                        break;
                    }
                }
            },
            OpKind::Select {
                selector,
                cases,
                else_body,
            } => {
                let selector = self.eval(frame, selector)?;
                let selector = self.scalar(selector)?;
                for (values, body) in cases {
                    for candidate in values {
                        let candidate = self.eval(frame, candidate)?;
                        let candidate = self.scalar(candidate)?;
                        let equal = ops::binary_op(BinaryOp::Equal, &selector, &candidate)?;
                        if value::is_truthy(&equal)? {
                            return self.exec_block(frame, body);
                        }
                    }
                }
                return self.exec_block(frame, else_body);
            }
            OpKind::With { object, body } => {
                let object = self.eval(frame, object)?;
                frame.with.push(object);
                let result = self.exec_block(frame, body);
                frame.with.pop();
                return result;
            }
            OpKind::Exit(kind) => return Ok(Flow::Exit(*kind)),
            OpKind::OnErrorResumeNext => {
                frame.resume_next = true;
                self.err.clear();
            }
            OpKind::OnErrorGoto0 => {
                frame.resume_next = false;
                self.err.clear();
            }
            OpKind::ReDim { preserve, place, bounds } => {
                let mut upper = Vec::with_capacity(bounds.len());
                for bound in bounds {
                    let bound = self.eval(frame, bound)?;
                    let bound = self.scalar(bound)?;
                    upper.push(value::to_i64(&bound)?);
                }
                let resized = match self.load(frame, *place)? {
                    Value::Array(current) => {
                        let current = current.borrow();
                        if current.is_fixed() {
                            return Err(RuntimeError::new(FaultKind::ArrayLocked).into());
                        }
                        if *preserve {
                            current.redim_preserve(&upper)?
                        } else {
                            VbArray::redim(&upper)?
                        }
                    }
                    _ => VbArray::redim(&upper)?,
                };
                self.store(frame, *place, Value::array(resized))?;
            }
            OpKind::Erase(place) => match self.load(frame, *place)? {
                Value::Array(array) => {
                    array.borrow_mut().erase();
                }
                other => return Err(RuntimeError::type_mismatch(format!("Erase {}", other.type_name())).into()),
            },
            OpKind::Declare { place, array } => {
                if let Place::Global(index) = place {
                    self.global_slot(&frame.unit, *index, true);
                }
                if let Some(bounds) = array {
                    let array = if bounds.is_empty() {
                        VbArray::default()
                    } else {
                        VbArray::fixed(bounds)?
                    };
                    self.store(frame, *place, Value::array(array))?;
                }
            }
            OpKind::Guarded(inner) => match self.exec(frame, inner) {
                Err(Fault::Script(error)) if frame.resume_next => {
                    debug!(number = error.number, "fault resumed");
                    self.err.record(&error);
                    self.fault_at = None;
                }
                other => return other,
            },
            OpKind::Traced { point, op } => {
                let Some(sink) = self.trace else {
                    return self.exec(frame, op);
                };
                sink.statement(point);
                let result = self.exec(frame, op);
                sink.clear();
                return result;
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &mut self,
        frame: &mut Frame,
        var: Place,
        from: &Node,
        to: &Node,
        step: Option<&Node>,
        body: &[Op],
    ) -> Result<Flow, Fault> {
        let start = self.eval(frame, from)?;
        let mut current = self.scalar(start)?;
        let end = self.eval(frame, to)?;
        let end = value::to_f64(&self.scalar(end)?)?;
        let step = match step {
            Some(node) => {
                let step = self.eval(frame, node)?;
                self.scalar(step)?
            }
            None => Value::Integer(1),
        };
        let ascending = value::to_f64(&step)? >= 0.0;
        loop {
            self.check_abort()?;
            let position = value::to_f64(&current)?;
            self.store(frame, var, current)?;
            if (ascending && position > end) || (!ascending && position < end) {
                break;
            }
            match self.exec_block(frame, body)? {
                Flow::Exit(ExitKind::For) => break,
                Flow::Exit(kind) => return Ok(Flow::Exit(kind)),
                Flow::Normal => {}
            }
            let counter = self.load(frame, var)?;
            current = ops::binary_op(BinaryOp::Add, &counter, &step)?;
        }
        Ok(Flow::Normal)
    }

    fn loop_continues(&mut self, frame: &mut Frame, test: &LoopTest) -> Result<bool, Fault> {
        Ok(self.truthy(frame, &test.expr)? != test.until)
    }

    fn items(&self, collection: &Value) -> Result<Vec<Value>, Fault> {
        match collection {
            Value::Array(array) => Ok(array.borrow().iter().cloned().collect()),
            Value::Object(ObjectRef::Host(host)) => match host.enumerate() {
                Some(items) => Ok(items?),
                None => Err(RuntimeError::with_detail(FaultKind::NotACollection, host.type_name()).into()),
            },
            other => Err(RuntimeError::with_detail(FaultKind::NotACollection, other.type_name()).into()),
        }
    }

    fn assign(&mut self, frame: &mut Frame, target: &Target, value: Value) -> Result<(), Fault> {
        match target {
            Target::Place(place) => self.store(frame, *place, value),
            Target::Index { place, indices, site } => {
                let container = self.load(frame, *place)?;
                let mut operands = vec![container];
                for index in indices {
                    operands.push(self.eval(frame, index)?);
                }
                operands.push(value);
                let unit = Arc::clone(&frame.unit);
                self.dispatch(frame, &unit.sites[*site], operands, &[])?;
                Ok(())
            }
            Target::Member { object, args, site } | Target::Dynamic { target: object, args, site } => {
                let mut operands = vec![self.eval(frame, object)?];
                for arg in args {
                    operands.push(self.eval(frame, arg)?);
                }
                operands.push(value);
                let unit = Arc::clone(&frame.unit);
                self.dispatch(frame, &unit.sites[*site], operands, &[])?;
                Ok(())
            }
            Target::Property { proc, args } => {
                let me = Rc::clone(frame.me()?);
                let mut values = Vec::with_capacity(args.len() + 1);
                for arg in args {
                    values.push(self.eval(frame, arg)?);
                }
                values.push(value);
                let unit = Arc::clone(&frame.unit);
                self.invoke_proc(&unit, *proc, Some(me), values)?;
                Ok(())
            }
        }
    }

    // ── Variables ────────────────────────────────────────────────

    fn global_slot(&mut self, unit: &CompiledUnit, index: usize, create: bool) -> Option<usize> {
        if let Some(&slot) = self.global_slots.get(&(unit.id, index)) {
            return Some(slot);
        }
        let name = unit.globals.get(index)?;
        let slot = if create {
            self.scope.declare(name)
        } else {
            self.scope.lookup(name)?
        };
        self.global_slots.insert((unit.id, index), slot);
        Some(slot)
    }

    fn undefined(unit: &CompiledUnit, index: usize) -> Fault {
        let name = unit.globals.get(index).map_or("", String::as_str);
        RuntimeError::undefined_variable(name).into()
    }

    fn load(&mut self, frame: &Frame, place: Place) -> Result<Value, Fault> {
        match place {
            Place::Local(slot) => Ok(frame.local(slot)),
            Place::Field(field) => Ok(frame.me()?.fields.borrow().get(field).cloned().unwrap_or_default()),
            Place::Global(index) => match self.global_slot(&frame.unit, index, false) {
                Some(slot) => Ok(self.scope.load(slot)),
                None if frame.unit.option_explicit => Err(Self::undefined(&frame.unit, index)),
                None => Ok(Value::Empty),
            },
            Place::Implicit { global, local } => match self.global_slot(&frame.unit, global, false) {
                Some(slot) => Ok(self.scope.load(slot)),
                None if frame.unit.option_explicit => Err(Self::undefined(&frame.unit, global)),
                None => Ok(frame.local(local)),
            },
        }
    }

    fn store(&mut self, frame: &mut Frame, place: Place, value: Value) -> Result<(), Fault> {
        match place {
            Place::Local(slot) => frame.set_local(slot, value),
            Place::Field(field) => {
                let me = frame.me()?;
                let mut fields = me.fields.borrow_mut();
                match fields.get_mut(field) {
                    Some(slot) => *slot = value,
                    None => return Err(RuntimeError::subscript_out_of_range().into()),
                }
            }
            Place::Global(index) => {
                let create = !frame.unit.option_explicit;
                match self.global_slot(&frame.unit, index, create) {
                    Some(slot) => self.scope.store(slot, value),
                    None => return Err(Self::undefined(&frame.unit, index)),
                }
            }
            Place::Implicit { global, local } => match self.global_slot(&frame.unit, global, false) {
                Some(slot) => self.scope.store(slot, value),
                None if frame.unit.option_explicit => return Err(Self::undefined(&frame.unit, global)),
                None => frame.set_local(local, value),
            },
        }
        Ok(())
    }

    fn write_back(&mut self, frame: &mut Frame, target: &Ref, value: Value) -> Result<(), Fault> {
        match target {
            Ref::Place(place) => self.store(frame, *place, value),
            Ref::Element { array, indices } => {
                if let Value::Array(array) = self.load(frame, *array)? {
                    array.borrow_mut().set(indices, value)?;
                }
                Ok(())
            }
        }
    }

    // ── Expressions ──────────────────────────────────────────────

    fn eval(&mut self, frame: &mut Frame, node: &Node) -> Result<Value, Fault> {
        match node {
            Node::Const(lit) => Ok(literal_value(lit)),
            Node::Load(place) => self.load(frame, *place),
            Node::Me => Ok(Value::Object(ObjectRef::Instance(Rc::clone(frame.me()?)))),
            Node::WithTarget => frame
                .with
                .last()
                .cloned()
                .ok_or_else(|| RuntimeError::object_required("With").into()),
            Node::GetMember { object, site } => {
                let object = self.eval(frame, object)?;
                let unit = Arc::clone(&frame.unit);
                self.dispatch(frame, &unit.sites[*site], vec![object], &[])
            }
            Node::InvokeMember { object, args, site } | Node::Invoke { target: object, args, site } => {
                let object = self.eval(frame, object)?;
                let (values, refs) = self.eval_args(frame, args)?;
                let mut operands = Vec::with_capacity(values.len() + 1);
                operands.push(object);
                operands.extend(values);
                let unit = Arc::clone(&frame.unit);
                self.dispatch(frame, &unit.sites[*site], operands, &refs)
            }
            Node::CallProc { proc, args, me } => {
                let (values, refs) = self.eval_args(frame, args)?;
                let me = if *me { frame.me.clone() } else { None };
                let unit = Arc::clone(&frame.unit);
                self.call_proc(frame, &unit, *proc, me, values, &refs)
            }
            Node::Builtin { index, args } => self.call_builtin(frame, *index, args),
            Node::CreateObject { args, site } => {
                let [name] = args.as_slice() else {
                    return Err(RuntimeError::wrong_argument_count("CreateObject").into());
                };
                let name = self.eval(frame, name)?;
                let name = value::to_str(&self.scalar(name)?)?;
                let unit = Arc::clone(&frame.unit);
                self.create_host(&unit.sites[*site], &name)
            }
            Node::NewHost { name, site } => {
                let unit = Arc::clone(&frame.unit);
                self.create_host(&unit.sites[*site], name)
            }
            Node::NewClass(class) => {
                let unit = Arc::clone(&frame.unit);
                self.new_instance(&unit, *class)
            }
            Node::Binary { op, left, right, site } => {
                let left = self.eval(frame, left)?;
                let right = self.eval(frame, right)?;
                if *op == BinaryOp::Equal && left.same_object(&right) {
                    return Ok(Value::Boolean(true));
                }
                let unit = Arc::clone(&frame.unit);
                self.dispatch(frame, &unit.sites[*site], vec![left, right], &[])
            }
            Node::Unary { operand, site, .. } => {
                let operand = self.eval(frame, operand)?;
                let unit = Arc::clone(&frame.unit);
                self.dispatch(frame, &unit.sites[*site], vec![operand], &[])
            }
            Node::Fault(error) => Err(error.clone().into()),
        }
    }

    fn eval_args(&mut self, frame: &mut Frame, args: &[Arg]) -> Result<(Vec<Value>, Vec<Option<Ref>>), Fault> {
        let mut values = Vec::with_capacity(args.len());
        let mut refs = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Arg::Value(node) => {
                    values.push(self.eval(frame, node)?);
                    refs.push(None);
                }
                Arg::Ref(place) => {
                    values.push(self.load(frame, *place)?);
                    refs.push(Some(Ref::Place(*place)));
                }
                Arg::Element { array, indices, site } => {
                    let container = self.load(frame, *array)?;
                    let mut index_values = Vec::with_capacity(indices.len());
                    for index in indices {
                        let index = self.eval(frame, index)?;
                        index_values.push(self.scalar(index)?);
                    }
                    if let Value::Array(elements) = &container {
                        let ints = index_values
                            .iter()
                            .map(value::to_i64)
                            .collect::<Result<Vec<_>, _>>()?;
                        values.push(elements.borrow().get(&ints)?);
                        refs.push(Some(Ref::Element {
                            array: *array,
                            indices: ints,
                        }));
                    } else {
                        let mut operands = Vec::with_capacity(index_values.len() + 1);
                        operands.push(container);
                        operands.extend(index_values);
                        let unit = Arc::clone(&frame.unit);
                        values.push(self.dispatch(frame, &unit.sites[*site], operands, &[])?);
                        refs.push(None);
                    }
                }
            }
        }
        Ok((values, refs))
    }

    fn truthy(&mut self, frame: &mut Frame, node: &Node) -> Result<bool, Fault> {
        let value = self.eval(frame, node)?;
        let value = self.scalar(value)?;
        Ok(value::is_truthy(&value)?)
    }

    /// Reduce an object to its default value, leaving other values alone.
    fn scalar(&mut self, value: Value) -> Result<Value, Fault> {
        match value {
            Value::Object(_) => self.default_value(value),
            other => Ok(other),
        }
    }

    /// The value a non-`Set` assignment stores: objects reduce to their
    /// default value, arrays are copied.
    fn plain_value(&mut self, value: Value) -> Result<Value, Fault> {
        Ok(self.scalar(value)?.assigned())
    }

    fn default_value(&mut self, value: Value) -> Result<Value, Fault> {
        let mut current = value;
        for _ in 0..MAX_DEFAULT_CHAIN {
            current = match &current {
                Value::Object(ObjectRef::Host(host)) => match host_default_value(host.as_ref()) {
                    Some(result) => result?,
                    None => return Err(RuntimeError::member_not_found(host.type_name()).into()),
                },
                Value::Object(ObjectRef::Instance(instance)) => self.instance_default(instance)?,
                _ => return Ok(current),
            };
        }
        Err(RuntimeError::type_mismatch("default member").into())
    }

    /// One reduction step for an operator operand. An instance without a
    /// default member takes part through its printed form.
    fn operator_operand(&mut self, value: Value) -> Result<Value, Fault> {
        let Value::Object(ObjectRef::Instance(instance)) = &value else {
            return Ok(value);
        };
        let class = &instance.unit.classes[instance.class];
        let has_default = class
            .default_member
            .as_deref()
            .is_some_and(|key| class.members.contains_key(key));
        if has_default {
            self.instance_default(instance)
        } else {
            Ok(Value::from(value.repr_string()))
        }
    }

    fn instance_default(&mut self, instance: &Rc<Instance>) -> Result<Value, Fault> {
        let unit = Arc::clone(&instance.unit);
        let class = &unit.classes[instance.class];
        let slots = class
            .default_member
            .as_deref()
            .and_then(|key| class.members.get(key))
            .ok_or_else(|| RuntimeError::member_not_found(&class.name))?;
        if let Some(field) = slots.field {
            return Ok(instance.fields.borrow().get(field).cloned().unwrap_or_default());
        }
        match slots.get.or(slots.method) {
            Some(proc) => self.invoke_proc(&unit, proc, Some(Rc::clone(instance)), Vec::new()),
            None => Err(RuntimeError::member_not_found(&class.name).into()),
        }
    }

    fn call_builtin(&mut self, frame: &mut Frame, index: usize, args: &[Node]) -> Result<Value, Fault> {
        let builtin = &BUILTINS[index];
        if args.len() < builtin.min_args || args.len() > builtin.max_args {
            return Err(RuntimeError::wrong_argument_count(builtin.name).into());
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.eval(frame, arg)?;
            values.push(if builtin.accepts_objects {
                value
            } else {
                self.scalar(value)?
            });
        }
        Ok((builtin.call)(&values)?)
    }

    // ── Dispatch ─────────────────────────────────────────────────

    fn dispatch(
        &mut self,
        frame: &mut Frame,
        site: &CallSite,
        mut operands: Vec<Value>,
        refs: &[Option<Ref>],
    ) -> Result<Value, Fault> {
        for _ in 0..MAX_DEFAULT_CHAIN {
            match site.resolve(&operands)? {
                Resolution::Defer(pending) => {
                    for i in pending {
                        let operand = std::mem::take(&mut operands[i]);
                        operands[i] = self.operator_operand(operand)?;
                    }
                }
                Resolution::Bound(action) => return self.perform(frame, action, operands, refs),
            }
        }
        Err(RuntimeError::type_mismatch(format!("{:?}", site.binder().key())).into())
    }

    fn perform(
        &mut self,
        frame: &mut Frame,
        action: Action,
        operands: Vec<Value>,
        refs: &[Option<Ref>],
    ) -> Result<Value, Fault> {
        let mut operands = operands.into_iter();
        let target = operands.next().unwrap_or_default();
        let rest: Vec<Value> = operands.collect();
        match action {
            Action::Binary(op) => {
                let right = rest.into_iter().next().unwrap_or_default();
                Ok(ops::binary_op(op, &target, &right)?)
            }
            Action::Unary(op) => Ok(ops::unary_op(op, &target)?),
            Action::Host {
                member,
                kind,
                then_index,
            } => {
                let Value::Object(ObjectRef::Host(host)) = &target else {
                    return Err(RuntimeError::object_required(target.type_name()).into());
                };
                if then_index {
                    let value = host.invoke(member, kind, &[])?;
                    self.index(frame, value, rest)
                } else {
                    Ok(host.invoke(member, kind, &rest)?)
                }
            }
            Action::ScriptProc { proc, then_index } => {
                let instance = Self::instance(&target)?;
                let unit = Arc::clone(&instance.unit);
                if then_index {
                    let value = self.invoke_proc(&unit, proc, Some(instance), Vec::new())?;
                    self.index(frame, value, rest)
                } else {
                    self.call_proc(frame, &unit, proc, Some(instance), rest, refs)
                }
            }
            Action::ScriptFieldGet { field, then_index } => {
                let instance = Self::instance(&target)?;
                let value = instance.fields.borrow().get(field).cloned().unwrap_or_default();
                if then_index {
                    self.index(frame, value, rest)
                } else {
                    Ok(value)
                }
            }
            Action::ScriptFieldSet { field } => {
                let instance = Self::instance(&target)?;
                let value = rest.into_iter().last().unwrap_or_default();
                if let Some(slot) = instance.fields.borrow_mut().get_mut(field) {
                    *slot = value;
                }
                Ok(Value::Empty)
            }
            Action::ArrayGet => {
                let Value::Array(array) = &target else {
                    return Err(RuntimeError::type_mismatch(target.type_name()).into());
                };
                let indices = rest.iter().map(value::to_i64).collect::<Result<Vec<_>, _>>()?;
                let value = array.borrow().get(&indices)?;
                Ok(value)
            }
            Action::ArraySet => {
                let Value::Array(array) = &target else {
                    return Err(RuntimeError::type_mismatch(target.type_name()).into());
                };
                let mut rest = rest;
                let value = rest.pop().unwrap_or_default();
                let indices = rest.iter().map(value::to_i64).collect::<Result<Vec<_>, _>>()?;
                array.borrow_mut().set(&indices, value)?;
                Ok(Value::Empty)
            }
            Action::HostConstruct { .. } => Err(RuntimeError::type_mismatch("New").into()),
        }
    }

    fn instance(value: &Value) -> Result<Rc<Instance>, Fault> {
        match value {
            Value::Object(ObjectRef::Instance(instance)) => Ok(Rc::clone(instance)),
            other => Err(RuntimeError::object_required(other.type_name()).into()),
        }
    }

    /// Apply arguments to a member's result: `obj.Items(2)`.
    fn index(&mut self, frame: &mut Frame, value: Value, args: Vec<Value>) -> Result<Value, Fault> {
        if args.is_empty() {
            return Ok(value);
        }
        let site = self.factory.site(BinderKey::Invoke { argc: args.len() });
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(value);
        operands.extend(args);
        self.dispatch(frame, &site, operands, &[])
    }

    // ── Calls and construction ───────────────────────────────────

    fn call_proc(
        &mut self,
        caller: &mut Frame,
        unit: &Arc<CompiledUnit>,
        proc: usize,
        me: Option<Rc<Instance>>,
        args: Vec<Value>,
        refs: &[Option<Ref>],
    ) -> Result<Value, Fault> {
        let (result, params) = self.run_proc(unit, proc, me, args)?;
        let by_ref = unit.procs[proc].params.iter().map(|p| p.by_ref);
        for ((param, by_ref), target) in params.into_iter().zip(by_ref).zip(refs) {
            if let (true, Some(target)) = (by_ref, target) {
                self.write_back(caller, target, param)?;
            }
        }
        Ok(result)
    }

    fn invoke_proc(
        &mut self,
        unit: &Arc<CompiledUnit>,
        proc: usize,
        me: Option<Rc<Instance>>,
        args: Vec<Value>,
    ) -> Result<Value, Fault> {
        Ok(self.run_proc(unit, proc, me, args)?.0)
    }

    /// Returns the result and the final values of the parameters.
    fn run_proc(
        &mut self,
        unit: &Arc<CompiledUnit>,
        proc: usize,
        me: Option<Rc<Instance>>,
        args: Vec<Value>,
    ) -> Result<(Value, Vec<Value>), Fault> {
        let compiled = &unit.procs[proc];
        if args.len() != compiled.params.len() {
            return Err(RuntimeError::wrong_argument_count(&compiled.name).into());
        }
        if self.depth >= self.max_depth {
            return Err(RuntimeError::with_detail(FaultKind::OutOfStack, &compiled.name).into());
        }
        let mut locals = vec![Value::Empty; compiled.locals.max(args.len())];
        for (slot, (arg, param)) in args.into_iter().zip(&compiled.params).enumerate() {
            locals[slot] = if param.by_ref { arg } else { arg.assigned() };
        }
        let mut frame = Frame::new(Arc::clone(unit), locals, me);
        self.depth += 1;
        let result = self
            .exec_block(&mut frame, &compiled.prologue)
            .and_then(|_| self.exec_block(&mut frame, &compiled.body));
        self.depth -= 1;
        result?;
        let value = compiled.result.map(|slot| frame.local(slot)).unwrap_or_default();
        frame.locals.truncate(compiled.params.len());
        Ok((value, frame.locals))
    }

    fn create_host(&mut self, site: &CallSite, name: &str) -> Result<Value, Fault> {
        let class = self
            .scope
            .class(name)
            .ok_or_else(|| RuntimeError::with_detail(FaultKind::CannotCreateObject, name))?;
        match site.resolve_create(class.as_ref(), &[])? {
            Resolution::Bound(Action::HostConstruct { constructor }) => Ok(class.create(constructor, &[])?),
            _ => Err(RuntimeError::with_detail(FaultKind::CannotCreateObject, name).into()),
        }
    }

    fn new_instance(&mut self, unit: &Arc<CompiledUnit>, class: usize) -> Result<Value, Fault> {
        let compiled = &unit.classes[class];
        let mut fields = Vec::with_capacity(compiled.fields.len());
        for field in &compiled.fields {
            fields.push(match &field.array {
                None => Value::Empty,
                Some(bounds) if bounds.is_empty() => Value::array(VbArray::default()),
                Some(bounds) => Value::array(VbArray::fixed(bounds)?),
            });
        }
        let instance = Rc::new(Instance {
            unit: Arc::clone(unit),
            class,
            fields: fields.into(),
        });
        if let Some(initialize) = compiled.initialize {
            self.invoke_proc(unit, initialize, Some(Rc::clone(&instance)), Vec::new())?;
        }
        Ok(Value::Object(ObjectRef::Instance(instance)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::script::compile_script;
    use crate::script::compiler::CompileOptions;
    use crate::script::trace::RecordingTraceSink;

    #[derive(Default)]
    struct Run<'t> {
        options: CompileOptions,
        max_depth: Option<usize>,
        abort: Option<&'t AtomicBool>,
        trace: Option<&'t dyn TraceSink>,
    }

    fn execute(source: &str, scope: &ModuleScope) -> Result<Rc<ErrObject>, ScriptException> {
        execute_with(source, scope, Run::default())
    }

    fn execute_with(source: &str, scope: &ModuleScope, run: Run<'_>) -> Result<Rc<ErrObject>, ScriptException> {
        let factory = BinderFactory::new();
        let unit = compile_script("test.vbs", source, run.options, &factory).unwrap();
        let err = Rc::new(ErrObject::new());
        scope.add_object("Err", Rc::clone(&err) as Rc<dyn crate::runtime::object::HostObject>);
        let mut vm = Vm::new(scope, Rc::clone(&err), &factory).with_trace(run.trace);
        if let Some(depth) = run.max_depth {
            vm = vm.with_max_depth(depth);
        }
        if let Some(flag) = run.abort {
            vm = vm.with_abort(flag);
        }
        vm.run(&unit)?;
        Ok(err)
    }

    fn get(scope: &ModuleScope, name: &str) -> Value {
        scope.get(name).unwrap_or_else(|| panic!("{name} is not defined"))
    }

    fn number(value: &Value) -> i64 {
        value::to_i64(value).unwrap()
    }

    #[test]
    fn numeric_strings_add() {
        let scope = ModuleScope::new();
        execute("a = 1\r\nb = \"2\"\r\nc = a + b\r\n", &scope).unwrap();
        assert_eq!(get(&scope, "c"), Value::Integer(3));
    }

    #[test]
    fn for_loops_count_and_exit() {
        let scope = ModuleScope::new();
        let source = "total = 0
For i = 1 To 10
    If i > 4 Then Exit For
    total = total + i
Next
s = \"\"
For j = 3 To 1 Step -1
    s = s & j
Next
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "total")), 10);
        assert_eq!(number(&get(&scope, "i")), 5);
        assert_eq!(get(&scope, "s"), Value::from("321"));
        assert_eq!(number(&get(&scope, "j")), 0);
    }

    #[test]
    fn do_loops_test_before_and_after() {
        let scope = ModuleScope::new();
        let source = "n = 0
Do While n < 5
    n = n + 1
Loop
m = 0
Do
    m = m + 2
Loop Until m >= 6
k = 0
Do
    k = k + 1
    If k = 3 Then Exit Do
Loop
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "n")), 5);
        assert_eq!(number(&get(&scope, "m")), 6);
        assert_eq!(number(&get(&scope, "k")), 3);
    }

    #[test]
    fn select_case_picks_the_first_match() {
        let scope = ModuleScope::new();
        let source = "Select Case 3
Case 1, 2
    r = \"low\"
Case 3, 3
    r = \"three\"
Case Else
    r = \"other\"
End Select
";
        execute(source, &scope).unwrap();
        assert_eq!(get(&scope, "r"), Value::from("three"));
    }

    #[test]
    fn procedures_pass_by_reference_and_by_value() {
        let scope = ModuleScope::new();
        let source = "Function Twice(x)
    Twice = x * 2
End Function
Sub Bump(ByRef n)
    n = n + 1
End Sub
Sub Keep(ByVal n)
    n = n + 1
End Sub
a = Twice(4)
b = 1
Bump b
c = 1
Keep c
Bump (c)
Dim arr(2)
arr(1) = 5
Bump arr(1)
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "a")), 8);
        assert_eq!(number(&get(&scope, "b")), 2);
        assert_eq!(number(&get(&scope, "c")), 1);
        let Value::Array(arr) = get(&scope, "arr") else { panic!("not an array") };
        assert_eq!(number(&arr.borrow().get(&[1]).unwrap()), 6);
    }

    #[test]
    fn redim_preserve_keeps_the_prefix() {
        let scope = ModuleScope::new();
        let source = "ReDim arr(4)
arr(2) = \"x\"
ReDim Preserve arr(2)
u = UBound(arr)
v = arr(2)
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "u")), 2);
        assert_eq!(get(&scope, "v"), Value::from("x"));
    }

    #[test]
    fn fixed_arrays_cannot_be_redimensioned() {
        let scope = ModuleScope::new();
        let e = execute("Dim a(3)\nReDim a(5)\n", &scope).unwrap_err();
        assert_eq!(e.number, 10);
    }

    #[test]
    fn array_assignment_copies() {
        let scope = ModuleScope::new();
        let source = "Dim a(1)
a(0) = 1
b = a
b(0) = 2
x = a(0)
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "x")), 1);
    }

    #[test]
    fn resume_next_records_the_fault_and_continues() {
        let scope = ModuleScope::new();
        let source = "On Error Resume Next
x = 1 / 0
n = Err.Number
y = 2
";
        let err = execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "n")), 11);
        assert_eq!(number(&get(&scope, "y")), 2);
        assert_eq!(err.number(), 11);
    }

    #[test]
    fn faults_propagate_with_their_location() {
        let scope = ModuleScope::new();
        let e = execute("x = 1\nOn Error Resume Next\nOn Error GoTo 0\nz = 1 / 0\n", &scope).unwrap_err();
        assert_eq!(e.number, 11);
        let location = e.location.unwrap();
        assert_eq!(location.span.start.line, 4);
        assert!(!e.aborted);
    }

    #[test]
    fn a_callee_fault_resumes_in_the_caller() {
        let scope = ModuleScope::new();
        let source = "Sub Risky()
    x = 1 / 0
    reached = True
End Sub
On Error Resume Next
Risky
after = True
";
        let err = execute(source, &scope).unwrap();
        assert_eq!(get(&scope, "after"), Value::Boolean(true));
        assert!(scope.get("reached").is_none());
        assert_eq!(err.number(), 11);
    }

    #[test]
    fn classes_construct_and_use_default_members() {
        let scope = ModuleScope::new();
        let source = "Class Counter
    Private count
    Public Default Property Get Value
        Value = count
    End Property
    Public Sub Add(n)
        count = count + n
    End Sub
    Private Sub Class_Initialize
        count = 10
    End Sub
End Class
Set c = New Counter
c.Add 5
total = c + 1
v = c.Value
plain = c
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "total")), 16);
        assert_eq!(number(&get(&scope, "v")), 15);
        assert_eq!(number(&get(&scope, "plain")), 15);
        assert!(get(&scope, "c").is_object());
    }

    #[test]
    fn instances_without_a_default_compare_by_class_name() {
        let scope = ModuleScope::new();
        let source = "Class Box
End Class
Set o = New Box
same = (o = \"Box\")
label = o & \"!\"
On Error Resume Next
plain = o
missing = Err.Number
";
        execute(source, &scope).unwrap();
        assert_eq!(get(&scope, "same"), Value::Boolean(true));
        assert_eq!(get(&scope, "label"), Value::from("Box!"));
        assert_eq!(number(&get(&scope, "missing")), 438);
    }

    #[test]
    fn set_requires_an_object() {
        let scope = ModuleScope::new();
        let e = execute("Set x = 5\n", &scope).unwrap_err();
        assert_eq!(e.number, 424);
    }

    #[test]
    fn option_explicit_rejects_undeclared_names() {
        let scope = ModuleScope::new();
        let e = execute("Option Explicit\nDim a\na = 1\nb = 2\n", &scope).unwrap_err();
        assert_eq!(e.number, 500);
        assert_eq!(number(&get(&scope, "a")), 1);
    }

    #[test]
    fn runaway_recursion_is_out_of_stack() {
        let scope = ModuleScope::new();
        let source = "Function F(n)\n    F = F(n + 1)\nEnd Function\nx = F(1)\n";
        let e = execute_with(
            source,
            &scope,
            Run {
                max_depth: Some(40),
                ..Run::default()
            },
        ).unwrap_err();
        assert_eq!(e.number, 28);
    }

    #[test]
    fn abort_is_not_resumable() {
        let scope = ModuleScope::new();
        let flag = AtomicBool::new(true);
        let run = Run {
            abort: Some(&flag),
            ..Run::default()
        };
        let e = execute_with("On Error Resume Next\nx = 1\n", &scope, run).unwrap_err();
        assert!(e.aborted);
        assert!(scope.get("x").map_or(true, |v| v == Value::Empty));
    }

    #[test]
    fn trace_reports_top_level_statements() {
        let scope = ModuleScope::new();
        let sink = RecordingTraceSink::new();
        let run = Run {
            options: CompileOptions {
                trace: true,
                ..CompileOptions::default()
            },
            trace: Some(&sink),
            ..Run::default()
        };
        execute_with("a = 1\nIf a = 1 Then\n    b = 2\nEnd If\n", &scope, run).unwrap();
        let points = sink.points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].start_line, points[0].start_line + 1);
        assert_eq!(sink.events().len(), 4);
    }

    #[test]
    fn dictionaries_are_created_and_enumerated() {
        let scope = ModuleScope::new();
        let source = "Set d = CreateObject(\"Scripting.Dictionary\")
d.Add \"a\", 1
d(\"b\") = 2
n = d.Count
v = d(\"b\")
keys = \"\"
For Each k In d
    keys = keys & k
Next
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "n")), 2);
        assert_eq!(number(&get(&scope, "v")), 2);
        assert_eq!(get(&scope, "keys"), Value::from("ab"));
    }

    #[test]
    fn unknown_classes_cannot_be_created() {
        let scope = ModuleScope::new();
        let e = execute("Set x = CreateObject(\"No.Such\")\n", &scope).unwrap_err();
        assert_eq!(e.number, 429);
    }

    #[test]
    fn with_blocks_address_the_object() {
        let scope = ModuleScope::new();
        let source = "Class Point
    Public X, Y
End Class
Set p = New Point
With p
    .X = 3
    .Y = .X * 2
End With
y = p.Y
";
        execute(source, &scope).unwrap();
        assert_eq!(number(&get(&scope, "y")), 6);
    }
}
