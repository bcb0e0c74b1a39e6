use super::{
    opcodes as op,
    reader::{decode_long, latin1_decode, latin1_encode, malformed, raw_unicode_unescape, unquote_string, Reader},
    registry::{StubFactory, StubRegistry},
    resolver::{self, Builtin, Callable, Global},
    value::{QualifiedName, RawValue, Scalar},
};
use crate::{
    error::{Result, SmplError},
    tensor::{ArrayData, ByteOrder, DType, DenseArray, SparseFormat, SparseMatrix},
};
use log::{debug, info};
use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
};

/// A numpy dtype as far as it was restored: the type descriptor and, once the
/// dtype state has been applied, its byte order
#[derive(Clone, Debug)]
struct DtypeSpec {
    descr: String,
    order: Option<ByteOrder>,
}
impl DtypeSpec {
    fn parse(descr: &str) -> Self {
        let order = match descr.chars().next() {
            Some('>') => Some(ByteOrder::Big),
            Some('<') => Some(ByteOrder::Little),
            _ => None,
        };
        Self {
            descr: descr.to_string(),
            order,
        }
    }
    fn is_object(&self) -> bool {
        self.descr.trim_start_matches(|c| matches!(c, '<' | '>' | '|' | '=')).starts_with('O')
    }
}

#[derive(Clone, Debug)]
enum ArrayPayload {
    /// allocated by ``_reconstruct`` but not yet restored
    Unset,
    Dense(DenseArray),
    /// ``dtype=object`` arrays keep their elements as python objects
    Object(Vec<Value>),
}

#[derive(Clone, Debug)]
struct PendingStub {
    name: QualifiedName,
    factory: StubFactory,
    args: Vec<Value>,
    kwargs: Vec<(Value, Value)>,
    states: Vec<Value>,
}

/// Objects on the machine stack. Anything that went through the memo lives in
/// the arena and is referred to by ``Ref`` so that later mutation is visible
/// through every alias.
#[derive(Clone, Debug)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global(Global),
    Dtype(DtypeSpec),
    Array(ArrayPayload),
    Sparse { format: SparseFormat, state: Option<Box<Value>> },
    Stub(Box<PendingStub>),
    Ref(usize),
}
impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::Dict(_) => "dict",
            Self::Global(_) => "type",
            Self::Dtype(_) => "numpy.dtype",
            Self::Array(_) => "numpy.ndarray",
            Self::Sparse { .. } => "scipy.sparse matrix",
            Self::Stub(_) => "stub",
            Self::Ref(_) => "reference",
        }
    }

    fn for_each_child(&self, f: &mut impl FnMut(&Value)) {
        match self {
            Self::List(items) | Self::Tuple(items) | Self::Set(items) | Self::Array(ArrayPayload::Object(items)) => items.iter().for_each(f),
            Self::Dict(entries) => entries.iter().for_each(|(k, v)| {
                f(k);
                f(v);
            }),
            Self::Sparse { state: Some(state), .. } => f(state),
            Self::Stub(stub) => {
                stub.args.iter().for_each(&mut *f);
                stub.kwargs.iter().for_each(|(k, v)| {
                    f(k);
                    f(v);
                });
                stub.states.iter().for_each(f);
            }
            _ => {}
        }
    }
}

/// Reconstructs the object graph of a pickle stream and returns its top-level
/// mapping. Only the types ``registry`` stubs out, numpy/scipy arrays and a
/// small set of builtins can be instantiated; no code from the stream is run.
///
/// # Errors
/// ``MalformedStream`` for truncated or inconsistent streams and for a
/// top-level object that is not a mapping, ``UnsupportedOpcode`` for stream
/// features outside the supported subset, ``UnresolvedType`` for any other
/// type reference.
pub fn deserialize(bytes: &[u8], registry: &StubRegistry) -> Result<BTreeMap<String, RawValue>> {
    let mut machine = Unpickler::new(bytes, registry);
    let root = machine.run()?;
    let end = machine.reader.pos();
    let mut materializer = Materializer::new(&machine.arena, &root, end);
    match materializer.materialize(&root)? {
        RawValue::Mapping(fields) => {
            info!("deserialized {} fields from {} bytes", fields.len(), bytes.len());
            Ok(fields)
        }
        other => Err(malformed(end, format!("top-level object is a {}, expected a mapping", other.type_name()))),
    }
}

/// Deepest container nesting a stream may build. Memo references count as
/// leaves here; the materializer bounds chains of them separately.
const MAX_NESTING: usize = 128;

struct Unpickler<'a> {
    reader: Reader<'a>,
    registry: &'a StubRegistry,
    stack: Vec<Value>,
    // stack lengths at each MARK
    marks: Vec<usize>,
    arena: Vec<Value>,
    memo: HashMap<u32, usize>,
    // start of the opcode being executed
    offset: usize,
}

impl<'a> Unpickler<'a> {
    fn new(bytes: &'a [u8], registry: &'a StubRegistry) -> Self {
        Self {
            reader: Reader::new(bytes),
            registry,
            stack: Vec::new(),
            marks: Vec::new(),
            arena: Vec::new(),
            memo: HashMap::new(),
            offset: 0,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> SmplError {
        malformed(self.offset, reason)
    }

    fn run(&mut self) -> Result<Value> {
        loop {
            self.offset = self.reader.pos();
            if self.reader.at_end() {
                return Err(self.malformed("stream ended without STOP"));
            }
            let code = self.reader.u8()?;
            if code == op::STOP {
                return self.pop();
            }
            self.step(code)?;
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, code: u8) -> Result<()> {
        match code {
            op::PROTO => {
                let proto = self.reader.u8()?;
                if proto > op::HIGHEST_PROTOCOL {
                    return Err(self.unsupported(code));
                }
            }
            op::FRAME => {
                self.reader.u64()?;
            }
            op::MARK => self.marks.push(self.stack.len()),
            op::POP => {
                if self.marks.last() == Some(&self.stack.len()) {
                    self.pop_mark()?;
                } else {
                    self.pop()?;
                }
            }
            op::POP_MARK => {
                self.pop_mark()?;
            }
            op::DUP => {
                let top = self.stack.last().cloned().ok_or_else(|| self.malformed("DUP on an empty stack"))?;
                self.stack.push(top);
            }

            op::NONE => self.stack.push(Value::None),
            op::NEWTRUE => self.stack.push(Value::Bool(true)),
            op::NEWFALSE => self.stack.push(Value::Bool(false)),
            op::INT => {
                let line = self.reader.line()?;
                let value = match line {
                    b"00" => Value::Bool(false),
                    b"01" => Value::Bool(true),
                    _ => Value::Int(self.parse_int(line)?),
                };
                self.stack.push(value);
            }
            op::LONG => {
                let line = self.reader.line()?;
                let digits = line.strip_suffix(b"L").unwrap_or(line);
                let value = self.parse_int(digits)?;
                self.stack.push(Value::Int(value));
            }
            op::BININT => {
                let value = self.reader.i32()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            op::BININT1 => {
                let value = self.reader.u8()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            op::BININT2 => {
                let value = self.reader.u16()?;
                self.stack.push(Value::Int(i64::from(value)));
            }
            op::LONG1 | op::LONG4 => {
                let len = if code == op::LONG1 {
                    i64::from(self.reader.u8()?)
                } else {
                    i64::from(self.reader.i32()?)
                };
                if len < 0 {
                    return Err(self.malformed(format!("negative long length {len}")));
                }
                // wider integers have no 64 bit representation
                if len > 8 {
                    return Err(self.unsupported(code));
                }
                let bytes = self.reader.counted(len.unsigned_abs())?;
                self.stack.push(Value::Int(decode_long(bytes)));
            }
            op::FLOAT => {
                let line = self.reader.line()?;
                let value = std::str::from_utf8(line)
                    .ok()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .ok_or_else(|| self.malformed(format!("invalid float literal {:?}", latin1_decode(line))))?;
                self.stack.push(Value::Float(value));
            }
            op::BINFLOAT => {
                let value = self.reader.f64_be()?;
                self.stack.push(Value::Float(value));
            }

            // python 2 byte strings are read as latin-1 text, the way numpy expects them
            op::STRING => {
                let line = self.reader.line()?;
                let bytes = unquote_string(line).ok_or_else(|| self.malformed("invalid quoted string"))?;
                self.stack.push(Value::Str(latin1_decode(&bytes)));
            }
            op::BINSTRING => {
                let len = self.reader.i32()?;
                let len = u64::try_from(len).map_err(|_| self.malformed(format!("negative string length {len}")))?;
                let bytes = self.reader.counted(len)?;
                self.stack.push(Value::Str(latin1_decode(bytes)));
            }
            op::SHORT_BINSTRING => {
                let len = self.reader.u8()?;
                let bytes = self.reader.counted(u64::from(len))?;
                self.stack.push(Value::Str(latin1_decode(bytes)));
            }
            op::UNICODE => {
                let line = self.reader.line()?;
                let text = raw_unicode_unescape(line).ok_or_else(|| self.malformed("invalid unicode escape"))?;
                self.stack.push(Value::Str(text));
            }
            op::BINUNICODE | op::SHORT_BINUNICODE | op::BINUNICODE8 => {
                let len = match code {
                    op::SHORT_BINUNICODE => u64::from(self.reader.u8()?),
                    op::BINUNICODE => u64::from(self.reader.u32()?),
                    _ => self.reader.u64()?,
                };
                let bytes = self.reader.counted(len)?;
                let text = std::str::from_utf8(bytes).map_err(|e| self.malformed(format!("invalid utf-8 text: {e}")))?;
                self.stack.push(Value::Str(text.to_string()));
            }
            op::BINBYTES | op::SHORT_BINBYTES | op::BINBYTES8 | op::BYTEARRAY8 => {
                let len = match code {
                    op::SHORT_BINBYTES => u64::from(self.reader.u8()?),
                    op::BINBYTES => u64::from(self.reader.u32()?),
                    _ => self.reader.u64()?,
                };
                let bytes = self.reader.counted(len)?;
                self.stack.push(Value::Bytes(bytes.to_vec()));
            }

            op::EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
            op::TUPLE => {
                let items = self.pop_mark()?;
                self.nestable(&items)?;
                self.stack.push(Value::Tuple(items));
            }
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                let n = usize::from(code - op::TUPLE1) + 1;
                if self.stack.len() < n + self.marks.last().copied().unwrap_or(0) {
                    return Err(self.malformed("stack underflow"));
                }
                let items = self.stack.split_off(self.stack.len() - n);
                self.nestable(&items)?;
                self.stack.push(Value::Tuple(items));
            }
            op::EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
            op::LIST => {
                let items = self.pop_mark()?;
                self.nestable(&items)?;
                self.stack.push(Value::List(items));
            }
            op::EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
            op::DICT => {
                let items = self.pop_mark()?;
                self.nestable(&items)?;
                let entries = self.pairs(items)?;
                self.stack.push(Value::Dict(entries));
            }
            op::EMPTY_SET => self.stack.push(Value::Set(Vec::new())),
            op::FROZENSET => {
                let items = self.pop_mark()?;
                self.nestable(&items)?;
                self.stack.push(Value::Set(items));
            }

            op::APPEND => {
                let item = self.pop()?;
                self.nestable([&item])?;
                self.update_top(|m, target| match target {
                    Value::List(mut items) => {
                        items.push(item);
                        Ok(Value::List(items))
                    }
                    other => Err(m.malformed(format!("APPEND to a {}", other.kind()))),
                })?;
            }
            op::APPENDS => {
                let new_items = self.pop_mark()?;
                self.nestable(&new_items)?;
                self.update_top(|m, target| match target {
                    Value::List(mut items) => {
                        items.extend(new_items);
                        Ok(Value::List(items))
                    }
                    other => Err(m.malformed(format!("APPENDS to a {}", other.kind()))),
                })?;
            }
            op::ADDITEMS => {
                let new_items = self.pop_mark()?;
                self.nestable(&new_items)?;
                self.update_top(|m, target| match target {
                    Value::Set(mut items) => {
                        items.extend(new_items);
                        Ok(Value::Set(items))
                    }
                    other => Err(m.malformed(format!("ADDITEMS to a {}", other.kind()))),
                })?;
            }
            op::SETITEM | op::SETITEMS => {
                let new_entries = if code == op::SETITEM {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.nestable([&key, &value])?;
                    vec![(key, value)]
                } else {
                    let items = self.pop_mark()?;
                    self.nestable(&items)?;
                    self.pairs(items)?
                };
                self.update_top(|m, target| match target {
                    Value::Dict(mut entries) => {
                        entries.extend(new_entries);
                        Ok(Value::Dict(entries))
                    }
                    other => Err(m.malformed(format!("SETITEM on a {}", other.kind()))),
                })?;
            }

            op::PUT => {
                let line = self.reader.line()?;
                let slot = self.parse_slot(line)?;
                self.memo_put(slot)?;
            }
            op::BINPUT => {
                let slot = self.reader.u8()?;
                self.memo_put(u32::from(slot))?;
            }
            op::LONG_BINPUT => {
                let slot = self.reader.u32()?;
                self.memo_put(slot)?;
            }
            op::MEMOIZE => {
                let slot = u32::try_from(self.memo.len()).map_err(|_| self.malformed("memo overflow"))?;
                self.memo_put(slot)?;
            }
            op::GET => {
                let line = self.reader.line()?;
                let slot = self.parse_slot(line)?;
                self.memo_get(slot)?;
            }
            op::BINGET => {
                let slot = self.reader.u8()?;
                self.memo_get(u32::from(slot))?;
            }
            op::LONG_BINGET => {
                let slot = self.reader.u32()?;
                self.memo_get(slot)?;
            }

            op::GLOBAL => {
                let module = latin1_decode(self.reader.line()?);
                let name = latin1_decode(self.reader.line()?);
                let global = self.resolve(&module, &name)?;
                self.stack.push(Value::Global(global));
            }
            op::STACK_GLOBAL => {
                let name = self.pop()?;
                let module = self.pop()?;
                let name = self.text(&name, "STACK_GLOBAL name")?;
                let module = self.text(&module, "STACK_GLOBAL module")?;
                let global = self.resolve(&module, &name)?;
                self.stack.push(Value::Global(global));
            }
            op::REDUCE => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let callable = self.global(&callable)?;
                let args = self.items(&args, "REDUCE arguments")?;
                let value = self.call(&callable, args, Vec::new())?;
                self.stack.push(value);
            }
            op::NEWOBJ | op::NEWOBJ_EX => {
                let kwargs = if code == op::NEWOBJ_EX {
                    let kwargs = self.pop()?;
                    self.entries(&kwargs, "NEWOBJ_EX keyword arguments")?
                } else {
                    Vec::new()
                };
                let args = self.pop()?;
                let cls = self.pop()?;
                let cls = self.global(&cls)?;
                let args = self.items(&args, "NEWOBJ arguments")?;
                let value = self.call(&cls, args, kwargs)?;
                self.stack.push(value);
            }
            op::OBJ => {
                let items = self.pop_mark()?;
                self.nestable(&items)?;
                let mut items = items.into_iter();
                let cls = items.next().ok_or_else(|| self.malformed("OBJ without a class"))?;
                let cls = self.global(&cls)?;
                let value = self.call(&cls, items.collect(), Vec::new())?;
                self.stack.push(value);
            }
            op::INST => {
                let module = latin1_decode(self.reader.line()?);
                let name = latin1_decode(self.reader.line()?);
                let cls = self.resolve(&module, &name)?;
                let args = self.pop_mark()?;
                self.nestable(&args)?;
                let value = self.call(&cls, args, Vec::new())?;
                self.stack.push(value);
            }
            op::BUILD => {
                let state = self.pop()?;
                self.nestable([&state])?;
                self.update_top(|m, target| m.build(target, state))?;
            }

            op::PERSID | op::BINPERSID | op::EXT1 | op::EXT2 | op::EXT4 | op::NEXT_BUFFER | op::READONLY_BUFFER => {
                return Err(self.unsupported(code));
            }
            _ => return Err(self.malformed(format!("unknown opcode 0x{code:02x}"))),
        }
        Ok(())
    }

    fn unsupported(&self, opcode: u8) -> SmplError {
        SmplError::UnsupportedOpcode { opcode, offset: self.offset }
    }

    fn resolve(&self, module: &str, name: &str) -> Result<Global> {
        let global = resolver::resolve(module, name, self.registry)?;
        if matches!(global.callable, Callable::Stub(_)) {
            debug!("substituting a stub for {}", global.name);
        }
        Ok(global)
    }

    // ---------------------------------------------------------------- stack
    fn pop(&mut self) -> Result<Value> {
        if self.marks.last() == Some(&self.stack.len()) {
            return Err(self.malformed("stack underflow: popped past a MARK"));
        }
        self.stack.pop().ok_or_else(|| self.malformed("stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self.marks.pop().ok_or_else(|| self.malformed("no MARK on the stack"))?;
        if mark > self.stack.len() {
            return Err(self.malformed("MARK lies above the top of the stack"));
        }
        Ok(self.stack.split_off(mark))
    }

    /// Applies ``f`` to the top of the stack, or to the memoized object it
    /// refers to
    fn update_top(&mut self, f: impl FnOnce(&Self, Value) -> Result<Value>) -> Result<()> {
        let top = self.pop()?;
        match top {
            Value::Ref(idx) => {
                let slot = self.arena.get_mut(idx).ok_or_else(|| malformed(self.offset, "dangling memo reference"))?;
                let target = std::mem::replace(slot, Value::None);
                let updated = f(self, target)?;
                if let Some(slot) = self.arena.get_mut(idx) {
                    *slot = updated;
                }
                self.stack.push(Value::Ref(idx));
            }
            target => {
                let updated = f(self, target)?;
                self.stack.push(updated);
            }
        }
        Ok(())
    }

    /// Refuses children that would push a container past ``MAX_NESTING``
    fn nestable<'v>(&self, children: impl IntoIterator<Item = &'v Value>) -> Result<()> {
        if children.into_iter().any(|child| nesting(child, MAX_NESTING) >= MAX_NESTING) {
            return Err(self.malformed(format!("containers nest deeper than {MAX_NESTING} levels")));
        }
        Ok(())
    }

    fn pairs(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
        if items.len() % 2 != 0 {
            return Err(self.malformed("odd number of items for a dict"));
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            entries.push((k, v));
        }
        Ok(entries)
    }

    // ----------------------------------------------------------------- memo
    fn memo_put(&mut self, slot: u32) -> Result<()> {
        let next = self.arena.len();
        let top = self.stack.last_mut().ok_or_else(|| malformed(self.offset, "PUT on an empty stack"))?;
        let idx = match top {
            Value::Ref(idx) => *idx,
            _ => {
                let value = std::mem::replace(top, Value::Ref(next));
                self.arena.push(value);
                next
            }
        };
        self.memo.insert(slot, idx);
        Ok(())
    }

    fn memo_get(&mut self, slot: u32) -> Result<()> {
        let idx = *self.memo.get(&slot).ok_or_else(|| self.malformed(format!("memo slot {slot} is empty")))?;
        self.stack.push(Value::Ref(idx));
        Ok(())
    }

    fn parse_slot(&self, line: &[u8]) -> Result<u32> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| self.malformed(format!("invalid memo slot {:?}", latin1_decode(line))))
    }

    fn parse_int(&self, line: &[u8]) -> Result<i64> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| self.malformed(format!("invalid integer literal {:?}", latin1_decode(line))))
    }

    // ----------------------------------------------------- value inspection
    fn deref<'v>(&'v self, mut value: &'v Value) -> &'v Value {
        while let Value::Ref(idx) = value {
            match self.arena.get(*idx) {
                Some(target) => value = target,
                None => break,
            }
        }
        value
    }

    fn global(&self, value: &Value) -> Result<Global> {
        match self.deref(value) {
            Value::Global(global) => Ok(global.clone()),
            other => Err(self.malformed(format!("a {} is not callable", other.kind()))),
        }
    }

    fn items(&self, value: &Value, what: &str) -> Result<Vec<Value>> {
        match self.deref(value) {
            Value::Tuple(items) | Value::List(items) => Ok(items.clone()),
            other => Err(self.malformed(format!("{what} must be a tuple, got a {}", other.kind()))),
        }
    }

    fn entries(&self, value: &Value, what: &str) -> Result<Vec<(Value, Value)>> {
        match self.deref(value) {
            Value::Dict(entries) => Ok(entries.clone()),
            other => Err(self.malformed(format!("{what} must be a dict, got a {}", other.kind()))),
        }
    }

    fn text(&self, value: &Value, what: &str) -> Result<String> {
        match self.deref(value) {
            Value::Str(s) => Ok(s.clone()),
            Value::Bytes(b) => Ok(latin1_decode(b)),
            other => Err(self.malformed(format!("{what} must be a string, got a {}", other.kind()))),
        }
    }

    /// Byte payload of a numpy buffer; python 2 streams carry it as latin-1 text
    fn bytes<'v>(&'v self, value: &'v Value, what: &str) -> Result<Cow<'v, [u8]>> {
        match self.deref(value) {
            Value::Bytes(b) => Ok(Cow::Borrowed(b)),
            Value::Str(s) => latin1_encode(s).map(Cow::Owned).map_err(|e| self.malformed(format!("{what}: {e}"))),
            other => Err(self.malformed(format!("{what} must be bytes, got a {}", other.kind()))),
        }
    }

    fn shape(&self, value: &Value) -> Result<Vec<usize>> {
        let dims = match self.deref(value) {
            Value::Tuple(items) | Value::List(items) => items.iter().map(|v| self.deref(v)).collect(),
            Value::Int(_) => vec![self.deref(value)],
            other => return Err(self.malformed(format!("array shape must be a tuple, got a {}", other.kind()))),
        };
        dims.into_iter()
            .map(|d| match d {
                Value::Int(n) => usize::try_from(*n).map_err(|_| self.malformed(format!("negative array dimension {n}"))),
                other => Err(self.malformed(format!("array dimension must be an int, got a {}", other.kind()))),
            })
            .collect()
    }

    fn dtype(&self, value: &Value) -> Result<DtypeSpec> {
        match self.deref(value) {
            Value::Dtype(spec) => Ok(spec.clone()),
            Value::Str(descr) => Ok(DtypeSpec::parse(descr)),
            other => Err(self.malformed(format!("expected a numpy.dtype, got a {}", other.kind()))),
        }
    }

    fn numeric_dtype(&self, spec: &DtypeSpec) -> Result<DType> {
        DType::from_descr(&spec.descr).ok_or_else(|| self.malformed(format!("unsupported array dtype {:?}", spec.descr)))
    }

    fn truthy(&self, value: &Value) -> bool {
        match self.deref(value) {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            _ => false,
        }
    }

    // -------------------------------------------------------------- calling
    fn call(&self, callable: &Global, args: Vec<Value>, kwargs: Vec<(Value, Value)>) -> Result<Value> {
        match callable.callable {
            Callable::Stub(factory) => Ok(Value::Stub(Box::new(PendingStub {
                name: callable.name.clone(),
                factory,
                args,
                kwargs,
                states: Vec::new(),
            }))),
            Callable::Sparse(format) => Ok(Value::Sparse { format, state: None }),
            Callable::ArrayReconstruct => Ok(Value::Array(ArrayPayload::Unset)),
            Callable::Dtype => {
                let descr = args.first().ok_or_else(|| self.malformed("numpy.dtype without a descriptor"))?;
                let descr = self.text(descr, "dtype descriptor")?;
                Ok(Value::Dtype(DtypeSpec::parse(&descr)))
            }
            Callable::NumpyScalar => self.numpy_scalar(&args),
            Callable::ArrayFromBuffer => self.from_buffer(&args),
            Callable::NewObj => {
                let mut args = args.into_iter();
                let cls = args.next().ok_or_else(|| self.malformed("__newobj__ without a class"))?;
                let cls = self.global(&cls)?;
                self.call(&cls, args.collect(), kwargs)
            }
            Callable::CopyRegReconstructor => {
                // (cls, base, state): state only feeds base.__init__
                let cls = args.first().ok_or_else(|| self.malformed("_reconstructor without a class"))?;
                let cls = self.global(cls)?;
                let init = match args.get(2) {
                    Some(state) if !matches!(self.deref(state), Value::None) => vec![state.clone()],
                    _ => Vec::new(),
                };
                self.call(&cls, init, Vec::new())
            }
            Callable::CodecsEncode => {
                let text = args.first().ok_or_else(|| self.malformed("_codecs.encode without text"))?;
                let text = self.text(text, "_codecs.encode text")?;
                let encoding = match args.get(1) {
                    Some(enc) => self.text(enc, "_codecs.encode encoding")?,
                    None => "utf-8".to_string(),
                };
                self.encode(&text, &encoding).map(Value::Bytes)
            }
            Callable::Builtin(builtin) => self.builtin(builtin, &args),
        }
    }

    fn encode(&self, text: &str, encoding: &str) -> Result<Vec<u8>> {
        match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => latin1_encode(text).map_err(|e| self.malformed(e)),
            "utf8" | "utf-8" | "ascii" => Ok(text.as_bytes().to_vec()),
            other => Err(self.malformed(format!("unsupported text encoding {other:?}"))),
        }
    }

    fn builtin(&self, builtin: Builtin, args: &[Value]) -> Result<Value> {
        let first = args.first().map(|v| self.deref(v));
        let value = match (builtin, first) {
            (Builtin::Object | Builtin::Dict, None) => Value::Dict(Vec::new()),
            (Builtin::Dict, Some(Value::Dict(entries))) => Value::Dict(entries.clone()),
            (Builtin::Dict, Some(Value::List(items) | Value::Tuple(items))) => {
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    match self.deref(item) {
                        Value::Tuple(pair) | Value::List(pair) if pair.len() == 2 => entries.push((pair[0].clone(), pair[1].clone())),
                        other => return Err(self.malformed(format!("dict() item must be a pair, got a {}", other.kind()))),
                    }
                }
                Value::Dict(entries)
            }
            (Builtin::List, None) => Value::List(Vec::new()),
            (Builtin::Tuple, None) => Value::Tuple(Vec::new()),
            (Builtin::Set, None) => Value::Set(Vec::new()),
            (Builtin::List | Builtin::Tuple | Builtin::Set, Some(Value::List(items) | Value::Tuple(items) | Value::Set(items))) => {
                let items = items.clone();
                match builtin {
                    Builtin::List => Value::List(items),
                    Builtin::Tuple => Value::Tuple(items),
                    _ => Value::Set(items),
                }
            }
            (Builtin::Bytearray, None) => Value::Bytes(Vec::new()),
            (Builtin::Bytearray, Some(Value::Bytes(b))) => Value::Bytes(b.clone()),
            (Builtin::Bytearray, Some(Value::Str(s))) => {
                let encoding = match args.get(1) {
                    Some(enc) => self.text(enc, "bytearray encoding")?,
                    None => "latin-1".to_string(),
                };
                Value::Bytes(self.encode(s, &encoding)?)
            }
            (_, Some(other)) => return Err(self.malformed(format!("cannot build a {builtin:?} from a {}", other.kind()))),
        };
        Ok(value)
    }

    fn numpy_scalar(&self, args: &[Value]) -> Result<Value> {
        let (Some(dtype), Some(raw)) = (args.first(), args.get(1)) else {
            return Err(self.malformed("numpy scalar needs a dtype and a buffer"));
        };
        let spec = self.dtype(dtype)?;
        let dtype = self.numeric_dtype(&spec)?;
        let bytes = self.bytes(raw, "numpy scalar buffer")?;
        let array = DenseArray::decode(dtype, spec.order.unwrap_or_default(), &[], false, &bytes).map_err(|e| self.malformed(e))?;
        let value = match array.data() {
            ArrayData::Float(a) => a.iter().next().copied().map(Value::Float),
            ArrayData::Int(a) => a.iter().next().copied().map(|i| if dtype == DType::Bool { Value::Bool(i != 0) } else { Value::Int(i) }),
        };
        value.ok_or_else(|| self.malformed("empty numpy scalar"))
    }

    fn from_buffer(&self, args: &[Value]) -> Result<Value> {
        let [buf, dtype, shape, order, ..] = args else {
            return Err(self.malformed("_frombuffer needs a buffer, dtype, shape and order"));
        };
        let spec = self.dtype(dtype)?;
        let dtype = self.numeric_dtype(&spec)?;
        let shape = self.shape(shape)?;
        let fortran = self.text(order, "_frombuffer order")? == "F";
        let bytes = self.bytes(buf, "_frombuffer buffer")?;
        let array = DenseArray::decode(dtype, spec.order.unwrap_or_default(), &shape, fortran, &bytes).map_err(|e| self.malformed(e))?;
        Ok(Value::Array(ArrayPayload::Dense(array)))
    }

    // ------------------------------------------------------------ restoring
    fn build(&self, target: Value, state: Value) -> Result<Value> {
        match target {
            Value::Array(_) => Ok(Value::Array(self.array_state(&state)?)),
            Value::Dtype(spec) => Ok(Value::Dtype(self.dtype_state(spec, &state))),
            Value::Sparse { format, .. } => Ok(Value::Sparse {
                format,
                state: Some(Box::new(state)),
            }),
            Value::Stub(mut stub) => {
                stub.states.push(state);
                Ok(Value::Stub(stub))
            }
            Value::Dict(mut entries) => {
                match self.deref(&state) {
                    Value::None => {}
                    Value::Dict(attrs) => entries.extend(attrs.iter().cloned()),
                    Value::Tuple(parts) if parts.len() == 2 => {
                        for part in parts {
                            match self.deref(part) {
                                Value::Dict(attrs) => entries.extend(attrs.iter().cloned()),
                                Value::None => {}
                                other => return Err(self.malformed(format!("object state slot must be a dict, got a {}", other.kind()))),
                            }
                        }
                    }
                    other => return Err(self.malformed(format!("object state must be a dict, got a {}", other.kind()))),
                }
                Ok(Value::Dict(entries))
            }
            other => Err(self.malformed(format!("BUILD on a {}", other.kind()))),
        }
    }

    /// ``ndarray.__setstate__``: ``([version,] shape, dtype, is_fortran, rawdata)``
    fn array_state(&self, state: &Value) -> Result<ArrayPayload> {
        let items = match self.deref(state) {
            Value::Tuple(items) | Value::List(items) => items,
            other => return Err(self.malformed(format!("ndarray state must be a tuple, got a {}", other.kind()))),
        };
        let fields = match items.len() {
            5 => &items[1..],
            4 => &items[..],
            n => return Err(self.malformed(format!("ndarray state has {n} fields"))),
        };
        let shape = self.shape(&fields[0])?;
        let spec = self.dtype(&fields[1])?;
        let fortran = self.truthy(&fields[2]);
        let nr_elems = shape
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d))
            .ok_or_else(|| self.malformed(format!("ndarray shape {shape:?} overflows")))?;
        if spec.is_object() {
            return match self.deref(&fields[3]) {
                Value::List(elems) | Value::Tuple(elems) if elems.len() == nr_elems => Ok(ArrayPayload::Object(elems.clone())),
                other => Err(self.malformed(format!("object array of {nr_elems} elements restored from a {}", other.kind()))),
            };
        }
        let dtype = self.numeric_dtype(&spec)?;
        let bytes = self.bytes(&fields[3], "ndarray data")?;
        DenseArray::decode(dtype, spec.order.unwrap_or_default(), &shape, fortran, &bytes)
            .map(ArrayPayload::Dense)
            .map_err(|e| self.malformed(e))
    }

    /// ``dtype.__setstate__``: the byte order character sits at index 1
    fn dtype_state(&self, mut spec: DtypeSpec, state: &Value) -> DtypeSpec {
        if let Value::Tuple(items) = self.deref(state) {
            if let Some(Value::Str(order)) = items.get(1).map(|v| self.deref(v)) {
                if order == "<" || order == ">" {
                    spec.order = Some(ByteOrder::from_char(order));
                }
            }
        }
        spec
    }
}

/// Container nesting below ``value``, capped at ``limit``. Memo references
/// are leaves.
fn nesting(value: &Value, limit: usize) -> usize {
    if limit == 0 {
        return 0;
    }
    let mut deepest = 0;
    value.for_each_child(&mut |child| deepest = deepest.max(1 + nesting(child, limit - 1)));
    deepest
}

/// Turns the machine's values into owned ``RawValue`` trees. Shared objects
/// are converted once; the last reference takes the converted value instead
/// of a copy.
struct Materializer<'a> {
    arena: &'a [Value],
    cache: Vec<Option<RawValue>>,
    remaining_uses: Vec<usize>,
    visiting: Vec<bool>,
    // current recursion depth, memo hops included
    depth: usize,
    offset: usize,
}

impl<'a> Materializer<'a> {
    fn new(arena: &'a [Value], root: &Value, offset: usize) -> Self {
        let mut remaining_uses = vec![0usize; arena.len()];
        let mut count = |value: &Value| {
            fn walk(value: &Value, counts: &mut [usize]) {
                if let Value::Ref(idx) = value {
                    if let Some(n) = counts.get_mut(*idx) {
                        *n += 1;
                    }
                }
                value.for_each_child(&mut |child| walk(child, counts));
            }
            walk(value, &mut remaining_uses);
        };
        count(root);
        arena.iter().for_each(&mut count);
        Self {
            arena,
            cache: vec![None; arena.len()],
            remaining_uses,
            visiting: vec![false; arena.len()],
            depth: 0,
            offset,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> SmplError {
        malformed(self.offset, reason)
    }

    fn materialize(&mut self, value: &Value) -> Result<RawValue> {
        if self.depth >= 2 * MAX_NESTING {
            return Err(self.malformed(format!("object graph nests deeper than {} levels", 2 * MAX_NESTING)));
        }
        self.depth += 1;
        let raw = self.convert(value);
        self.depth -= 1;
        raw
    }

    fn convert(&mut self, value: &Value) -> Result<RawValue> {
        let raw = match value {
            Value::None => RawValue::Scalar(Scalar::None),
            Value::Bool(b) => RawValue::Scalar(Scalar::Bool(*b)),
            Value::Int(i) => RawValue::Scalar(Scalar::Int(*i)),
            Value::Float(f) => RawValue::Scalar(Scalar::Float(*f)),
            Value::Str(s) => RawValue::Scalar(Scalar::Str(s.clone())),
            Value::Bytes(b) => RawValue::Scalar(Scalar::Bytes(b.clone())),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) | Value::Array(ArrayPayload::Object(items)) => {
                RawValue::Sequence(self.sequence(items)?)
            }
            Value::Dict(entries) => RawValue::Mapping(self.mapping(entries)?),
            Value::Global(global) => RawValue::Scalar(Scalar::Str(global.name.to_string())),
            Value::Dtype(spec) => RawValue::Scalar(Scalar::Str(spec.descr.clone())),
            Value::Array(ArrayPayload::Dense(array)) => RawValue::DenseArray(array.clone()),
            Value::Array(ArrayPayload::Unset) => return Err(self.malformed("ndarray was never restored")),
            Value::Sparse { format, state } => RawValue::SparseMatrix(self.sparse(*format, state.as_deref())?),
            Value::Stub(pending) => {
                let mut stub = (pending.factory)(&pending.name);
                let args = self.sequence(&pending.args)?;
                let kwargs = self.mapping(&pending.kwargs)?;
                stub.construct(args, kwargs);
                for state in &pending.states {
                    let state = self.materialize(state)?;
                    stub.set_state(state);
                }
                RawValue::Stub(stub)
            }
            Value::Ref(idx) => self.shared(*idx)?,
        };
        Ok(raw)
    }

    fn shared(&mut self, idx: usize) -> Result<RawValue> {
        let arena = self.arena;
        let value = arena.get(idx).ok_or_else(|| self.malformed("dangling memo reference"))?;
        if self.cache[idx].is_none() {
            if self.visiting[idx] {
                return Err(self.malformed(format!("object graph refers to itself through a {}", value.kind())));
            }
            self.visiting[idx] = true;
            let raw = self.materialize(value)?;
            self.visiting[idx] = false;
            self.cache[idx] = Some(raw);
        }
        self.remaining_uses[idx] = self.remaining_uses[idx].saturating_sub(1);
        let cached = if self.remaining_uses[idx] == 0 {
            self.cache[idx].take()
        } else {
            self.cache[idx].clone()
        };
        cached.ok_or_else(|| self.malformed("memoized object used after release"))
    }

    fn sequence(&mut self, items: &[Value]) -> Result<Vec<RawValue>> {
        items.iter().map(|item| self.materialize(item)).collect()
    }

    fn mapping(&mut self, entries: &[(Value, Value)]) -> Result<BTreeMap<String, RawValue>> {
        let mut out = BTreeMap::new();
        for (key, value) in entries {
            let key = match self.materialize(key)? {
                RawValue::Scalar(Scalar::Str(s)) => s,
                RawValue::Scalar(Scalar::Bytes(b)) => latin1_decode(&b),
                RawValue::Scalar(Scalar::Int(i)) => i.to_string(),
                RawValue::Scalar(Scalar::Bool(b)) => if b { "True" } else { "False" }.to_string(),
                RawValue::Scalar(Scalar::None) => "None".to_string(),
                other => return Err(self.malformed(format!("unsupported mapping key of type {}", other.type_name()))),
            };
            let value = self.materialize(value)?;
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Rebuilds a scipy matrix from its ``__dict__``
    fn sparse(&mut self, format: SparseFormat, state: Option<&Value>) -> Result<SparseMatrix> {
        let state = state.ok_or_else(|| self.malformed(format!("{format} matrix was never restored")))?;
        let attrs = match self.materialize(state)? {
            RawValue::Mapping(attrs) => attrs,
            other => return Err(self.malformed(format!("{format} matrix state is a {}", other.type_name()))),
        };
        let shape = match attrs.get("_shape").or_else(|| attrs.get("shape")) {
            Some(RawValue::Sequence(dims)) => match dims.as_slice() {
                [RawValue::Scalar(Scalar::Int(r)), RawValue::Scalar(Scalar::Int(c))] => {
                    (usize::try_from(*r).map_err(|e| self.malformed(e.to_string()))?, usize::try_from(*c).map_err(|e| self.malformed(e.to_string()))?)
                }
                _ => return Err(self.malformed(format!("{format} matrix shape is not two ints"))),
            },
            _ => return Err(self.malformed(format!("{format} matrix has no shape"))),
        };
        let offset = self.offset;
        let array = |key: &str| sparse_component(&attrs, key, format, offset);
        let indices = |a: &DenseArray| index_values(a, format, offset);
        let data: Vec<f64> = array("data")?.to_f64().iter().copied().collect();
        let matrix = match format {
            SparseFormat::Csc | SparseFormat::Csr => {
                let minor = indices(array("indices")?)?;
                let major = indices(array("indptr")?)?;
                SparseMatrix::from_compressed(format, shape, &data, &minor, &major)
            }
            SparseFormat::Coo => {
                let (rows, cols) = match attrs.get("coords") {
                    Some(RawValue::Sequence(coords)) => match coords.as_slice() {
                        [RawValue::DenseArray(r), RawValue::DenseArray(c)] => (indices(r)?, indices(c)?),
                        _ => return Err(self.malformed("coo matrix coords are not two arrays")),
                    },
                    _ => (indices(array("row")?)?, indices(array("col")?)?),
                };
                SparseMatrix::from_coo(shape, &rows, &cols, &data)
            }
        };
        matrix.map_err(|e| self.malformed(e))
    }
}

fn sparse_component<'m>(attrs: &'m BTreeMap<String, RawValue>, key: &str, format: SparseFormat, offset: usize) -> Result<&'m DenseArray> {
    match attrs.get(key) {
        Some(RawValue::DenseArray(a)) => Ok(a),
        Some(other) => Err(malformed(offset, format!("{format} matrix `{key}` is a {}", other.type_name()))),
        None => Err(malformed(offset, format!("{format} matrix has no `{key}`"))),
    }
}

fn index_values(array: &DenseArray, format: SparseFormat, offset: usize) -> Result<Vec<i64>> {
    match array.data() {
        ArrayData::Int(values) => Ok(values.iter().copied().collect()),
        ArrayData::Float(_) => Err(malformed(offset, format!("{format} matrix index array has dtype {}", array.dtype()))),
    }
}
