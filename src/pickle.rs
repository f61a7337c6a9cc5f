// A small unpickler covering what `np.save` emits for object arrays: the
// opcodes of pickle protocols 2 through 4, plus numpy's ndarray and dtype
// reconstruction. Anything else that is called during unpickling (numpy
// scalars, arbitrary classes) becomes an opaque `Value::Object`.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PickleError {
    #[error("unexpected end of pickle data")]
    UnexpectedEof,

    #[error("unsupported pickle opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("pickle stack underflow")]
    StackUnderflow,

    #[error("pickle mark not found")]
    MissingMark,

    #[error("pickle memo key {0} not found")]
    MissingMemo(u32),

    #[error("invalid utf-8 string in pickle")]
    InvalidUtf8,

    #[error("malformed pickle: {0}")]
    Malformed(&'static str),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dtype {
    // numpy type string without byte order, e.g. "u2", "f4", "O8"
    pub descr: String,
    // '<', '>', '|' or '=' (not yet known)
    pub byte_order: char,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    Raw(Vec<u8>),
    Objects(Vec<Value>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Option<Dtype>,
    pub fortran_order: bool,
    pub data: ArrayData,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global { module: String, name: String },
    Dtype(Dtype),
    Array(NdArray),
    Object(String),
}

// opcodes
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const REDUCE: u8 = b'R';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const EMPTY_DICT: u8 = b'}';
const APPENDS: u8 = b'e';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const LIST: u8 = b'l';
const EMPTY_LIST: u8 = b']';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';
const BINFLOAT: u8 = b'G';
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const EMPTY_SET: u8 = 0x8f;
const ADDITEMS: u8 = 0x90;
const FROZENSET: u8 = 0x91;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;
const BYTEARRAY8: u8 = 0x96;

// A stack entry remembers its memo key so later BUILD / SETITEMS / APPENDS
// on it are visible to subsequent memo lookups.
struct Slot {
    value: Value,
    memo: Option<u32>,
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

pub fn loads(data: &[u8]) -> Result<Value, PickleError> {
    Unpickler {
        data,
        pos: 0,
        stack: Vec::new(),
        marks: Vec::new(),
        memo: HashMap::new(),
    }
    .run()
}

impl<'a> Unpickler<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self.pos.checked_add(n).ok_or(PickleError::UnexpectedEof)?;
        let bytes = self.data.get(self.pos..end).ok_or(PickleError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, PickleError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn read_len8(&mut self) -> Result<usize, PickleError> {
        usize::try_from(u64::from_le_bytes(self.take_array()?))
            .map_err(|_| PickleError::Malformed("length overflow"))
    }

    fn read_line(&mut self) -> Result<String, PickleError> {
        let rest = self.data.get(self.pos..).ok_or(PickleError::UnexpectedEof)?;
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::UnexpectedEof)?;
        let line = self.take(len)?;
        self.pos += 1;
        String::from_utf8(line.to_vec()).map_err(|_| PickleError::InvalidUtf8)
    }

    fn read_str(&mut self, n: usize) -> Result<String, PickleError> {
        String::from_utf8(self.take(n)?.to_vec()).map_err(|_| PickleError::InvalidUtf8)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Slot { value, memo: None });
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        self.stack
            .pop()
            .map(|slot| slot.value)
            .ok_or(PickleError::StackUnderflow)
    }

    fn top(&mut self) -> Result<&mut Slot, PickleError> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark)?;
        if mark > self.stack.len() {
            return Err(PickleError::MissingMark);
        }
        Ok(self.stack.drain(mark..).map(|slot| slot.value).collect())
    }

    fn memoize(&mut self, key: u32) -> Result<(), PickleError> {
        let slot = self.top()?;
        slot.memo = Some(key);
        let value = slot.value.clone();
        self.memo.insert(key, value);
        Ok(())
    }

    fn memo_get(&mut self, key: u32) -> Result<(), PickleError> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(Slot {
            value,
            memo: Some(key),
        });
        Ok(())
    }

    // Apply `f` to the top of the stack, keeping its memo entry current.
    fn update_top<F>(&mut self, f: F) -> Result<(), PickleError>
    where
        F: FnOnce(&mut Value) -> Result<(), PickleError>,
    {
        let slot = self.stack.last_mut().ok_or(PickleError::StackUnderflow)?;
        f(&mut slot.value)?;
        if let Some(key) = slot.memo {
            self.memo.insert(key, slot.value.clone());
        }
        Ok(())
    }

    fn extend_top(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        self.update_top(|top| match top {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            _ => Err(PickleError::Malformed("append to a non-list")),
        })
    }

    fn set_items(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        if items.len() % 2 != 0 {
            return Err(PickleError::Malformed("odd number of dict items"));
        }
        self.update_top(|top| match top {
            Value::Dict(dict) => {
                let mut items = items.into_iter();
                while let (Some(k), Some(v)) = (items.next(), items.next()) {
                    dict.push((k, v));
                }
                Ok(())
            }
            _ => Err(PickleError::Malformed("setitem on a non-dict")),
        })
    }

    fn read_long(&mut self, n: usize) -> Result<Value, PickleError> {
        let bytes = self.take(n)?;
        if n > 8 {
            return Ok(Value::Object("int".to_string()));
        }
        let mut buf = if bytes.last().is_some_and(|&b| b & 0x80 != 0) {
            [0xffu8; 8]
        } else {
            [0u8; 8]
        };
        buf[..n].copy_from_slice(bytes);
        Ok(Value::Int(i64::from_le_bytes(buf)))
    }

    fn run(mut self) -> Result<Value, PickleError> {
        loop {
            let op = self.read_u8()?;
            match op {
                PROTO => {
                    self.read_u8()?;
                }
                FRAME => {
                    self.take(8)?;
                }
                STOP => return self.pop(),
                MARK => self.marks.push(self.stack.len()),
                POP => {
                    self.pop()?;
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let value = self.top()?.value.clone();
                    self.push(value);
                }
                NONE => self.push(Value::None),
                NEWTRUE => self.push(Value::Bool(true)),
                NEWFALSE => self.push(Value::Bool(false)),
                BININT => {
                    let v = i32::from_le_bytes(self.take_array()?);
                    self.push(Value::Int(i64::from(v)));
                }
                BININT1 => {
                    let v = self.read_u8()?;
                    self.push(Value::Int(i64::from(v)));
                }
                BININT2 => {
                    let v = u16::from_le_bytes(self.take_array()?);
                    self.push(Value::Int(i64::from(v)));
                }
                LONG1 => {
                    let n = self.read_u8()? as usize;
                    let v = self.read_long(n)?;
                    self.push(v);
                }
                LONG4 => {
                    let n = self.read_u32()? as usize;
                    let v = self.read_long(n)?;
                    self.push(v);
                }
                BINFLOAT => {
                    let v = f64::from_be_bytes(self.take_array()?);
                    self.push(Value::Float(v));
                }
                SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    let s = self.read_str(n)?;
                    self.push(Value::Str(s));
                }
                BINUNICODE => {
                    let n = self.read_u32()? as usize;
                    let s = self.read_str(n)?;
                    self.push(Value::Str(s));
                }
                BINUNICODE8 => {
                    let n = self.read_len8()?;
                    let s = self.read_str(n)?;
                    self.push(Value::Str(s));
                }
                SHORT_BINSTRING | SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                BINSTRING | BINBYTES => {
                    let n = self.read_u32()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let n = self.read_len8()?;
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                EMPTY_LIST | EMPTY_SET => self.push(Value::List(Vec::new())),
                EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                DICT => {
                    let items = self.pop_mark()?;
                    self.push(Value::Dict(Vec::new()));
                    self.set_items(items)?;
                }
                LIST | FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Value::List(items));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Value::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let n = (op - TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::StackUnderflow);
                    }
                    let start = self.stack.len() - n;
                    let items = self.stack.drain(start..).map(|slot| slot.value).collect();
                    self.push(Value::Tuple(items));
                }
                APPEND => {
                    let item = self.pop()?;
                    self.extend_top(vec![item])?;
                }
                APPENDS | ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                SETITEM => {
                    let v = self.pop()?;
                    let k = self.pop()?;
                    self.set_items(vec![k, v])?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    self.set_items(items)?;
                }
                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.push(Value::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.push(Value::Global { module, name })
                        }
                        _ => return Err(PickleError::Malformed("STACK_GLOBAL needs strings")),
                    }
                }
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = call(callable, args)?;
                    self.push(value);
                }
                NEWOBJ => {
                    self.pop()?;
                    let cls = self.pop()?;
                    self.push(Value::Object(global_name(&cls)));
                }
                NEWOBJ_EX => {
                    self.pop()?;
                    self.pop()?;
                    let cls = self.pop()?;
                    self.push(Value::Object(global_name(&cls)));
                }
                BUILD => {
                    let state = self.pop()?;
                    self.update_top(|top| build(top, state))?;
                }
                BINPUT => {
                    let key = u32::from(self.read_u8()?);
                    self.memoize(key)?;
                }
                LONG_BINPUT => {
                    let key = self.read_u32()?;
                    self.memoize(key)?;
                }
                MEMOIZE => {
                    let key = u32::try_from(self.memo.len())
                        .map_err(|_| PickleError::Malformed("memo overflow"))?;
                    self.memoize(key)?;
                }
                BINGET => {
                    let key = u32::from(self.read_u8()?);
                    self.memo_get(key)?;
                }
                LONG_BINGET => {
                    let key = self.read_u32()?;
                    self.memo_get(key)?;
                }
                _ => return Err(PickleError::UnsupportedOpcode(op)),
            }
        }
    }
}

fn global_name(value: &Value) -> String {
    match value {
        Value::Global { module, name } => format!("{}.{}", module, name),
        _ => "object".to_string(),
    }
}

fn call(callable: Value, args: Value) -> Result<Value, PickleError> {
    let Value::Tuple(args) = args else {
        return Err(PickleError::Malformed("REDUCE arguments are not a tuple"));
    };
    let Value::Global { module, name } = &callable else {
        return Ok(Value::Object("object".to_string()));
    };

    match (module.as_str(), name.as_str()) {
        // numpy.core.multiarray (numpy < 2) or numpy._core.multiarray
        (m, "_reconstruct") if m.ends_with("multiarray") => Ok(Value::Array(NdArray {
            shape: Vec::new(),
            dtype: None,
            fortran_order: false,
            data: ArrayData::Raw(Vec::new()),
        })),
        ("numpy", "dtype") => match args.first() {
            Some(Value::Str(descr)) => Ok(Value::Dtype(Dtype {
                descr: descr.clone(),
                byte_order: '=',
            })),
            _ => Err(PickleError::Malformed("dtype without a type string")),
        },
        // protocol 2 stores bytes as latin-1 text
        ("_codecs", "encode") => match args.first() {
            Some(Value::Str(text)) => Ok(Value::Bytes(text.chars().map(|c| c as u8).collect())),
            _ => Err(PickleError::Malformed("encode without text")),
        },
        _ => Ok(Value::Object(global_name(&callable))),
    }
}

fn build(target: &mut Value, state: Value) -> Result<(), PickleError> {
    match target {
        Value::Array(array) => {
            let Value::Tuple(mut state) = state else {
                return Err(PickleError::Malformed("ndarray state is not a tuple"));
            };
            // (version, shape, dtype, is_fortran, data); older pickles omit version
            if state.len() == 5 {
                state.remove(0);
            }
            let mut state = state.into_iter();
            let (Some(shape), Some(dtype), Some(fortran), Some(data)) =
                (state.next(), state.next(), state.next(), state.next())
            else {
                return Err(PickleError::Malformed("short ndarray state"));
            };

            array.shape = match shape {
                Value::Tuple(dims) => dims
                    .into_iter()
                    .map(|d| match d {
                        Value::Int(d) => usize::try_from(d)
                            .map_err(|_| PickleError::Malformed("negative dimension")),
                        _ => Err(PickleError::Malformed("non-integer dimension")),
                    })
                    .collect::<Result<_, _>>()?,
                _ => return Err(PickleError::Malformed("ndarray shape is not a tuple")),
            };
            array.dtype = match dtype {
                Value::Dtype(dtype) => Some(dtype),
                _ => None,
            };
            array.fortran_order = matches!(fortran, Value::Bool(true) | Value::Int(1));
            array.data = match data {
                Value::Bytes(bytes) => ArrayData::Raw(bytes),
                Value::List(items) => ArrayData::Objects(items),
                _ => return Err(PickleError::Malformed("unsupported ndarray data")),
            };
            Ok(())
        }
        Value::Dtype(dtype) => {
            if let Value::Tuple(state) = state {
                if let Some(Value::Str(order)) = state.get(1) {
                    if let Some(c) = order.chars().next() {
                        dtype.byte_order = c;
                    }
                }
            }
            Ok(())
        }
        // instance state of objects we do not model
        _ => Ok(()),
    }
}
