//! Decoder for the pickled records of the Gaia sidecar index.
//!
//! Only the data-carrying subset of the pickle machine is implemented:
//! containers, strings, numbers, the memo, and the handful of globals that
//! numpy and Python's `bytes` use to serialise scalars. Anything else
//! (persistent ids, extension registry, out-of-band buffers) is rejected.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::data::model::FieldValue;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A decoded pickle object.
#[derive(Debug, Clone, PartialEq)]
pub enum PickleValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PickleValue>),
    Tuple(Vec<PickleValue>),
    Dict(Vec<(PickleValue, PickleValue)>),
    Global {
        module: String,
        name: String,
    },
    /// `numpy.dtype(code)`; `byte_order` is set by its `BUILD` state.
    Dtype {
        code: String,
        byte_order: char,
    },
    /// Any other reconstructed object, kept opaque.
    Object {
        class: Box<PickleValue>,
        args: Vec<PickleValue>,
        state: Option<Box<PickleValue>>,
    },
}

impl PickleValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PickleValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_seq(&self) -> Option<&[PickleValue]> {
        match self {
            PickleValue::List(items) | PickleValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn to_field_value(&self) -> FieldValue {
        match self {
            PickleValue::None => FieldValue::Null,
            PickleValue::Bool(b) => FieldValue::Bool(*b),
            PickleValue::Int(i) => FieldValue::Integer(*i),
            PickleValue::Float(v) => FieldValue::Float(*v),
            PickleValue::Str(s) => FieldValue::String(s.clone()),
            PickleValue::Bytes(b) => FieldValue::String(String::from_utf8_lossy(b).into_owned()),
            PickleValue::List(items) | PickleValue::Tuple(items) => {
                FieldValue::Array(items.iter().map(Self::to_field_value).collect())
            }
            PickleValue::Dict(pairs) => FieldValue::Array(
                pairs
                    .iter()
                    .map(|(k, v)| FieldValue::Array(vec![k.to_field_value(), v.to_field_value()]))
                    .collect(),
            ),
            PickleValue::Global { module, name } => FieldValue::String(format!("{module}.{name}")),
            PickleValue::Dtype { code, byte_order } => {
                FieldValue::String(format!("{byte_order}{code}"))
            }
            PickleValue::Object { class, .. } => class.to_field_value(),
        }
    }
}

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decode one pickle from the start of `data`. Bytes after `STOP` are
/// ignored, so a zero-padded header block decodes as-is.
pub fn loads(data: &[u8]) -> Result<PickleValue> {
    Unpickler {
        data,
        pos: 0,
        stack: Vec::new(),
        marks: Vec::new(),
        memo: HashMap::new(),
    }
    .run()
}

fn err(msg: impl Into<String>) -> Error {
    Error::Pickle(msg.into())
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<PickleValue>,
    marks: Vec<usize>,
    memo: HashMap<u64, PickleValue>,
}

impl<'a> Unpickler<'a> {
    fn run(mut self) -> Result<PickleValue> {
        loop {
            let code = self.byte()?;
            match code {
                op::PROTO => {
                    let version = self.byte()?;
                    if version > 5 {
                        return Err(err(format!("unsupported protocol {version}")));
                    }
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }

                op::NONE => self.stack.push(PickleValue::None),
                op::NEWTRUE => self.stack.push(PickleValue::Bool(true)),
                op::NEWFALSE => self.stack.push(PickleValue::Bool(false)),
                op::INT => {
                    let line = self.line()?;
                    let value = match line {
                        "01" => PickleValue::Bool(true),
                        "00" => PickleValue::Bool(false),
                        _ => PickleValue::Int(parse_int(line)?),
                    };
                    self.stack.push(value);
                }
                op::LONG => {
                    let line = self.line()?;
                    let value = parse_int(line.trim_end_matches('L'))?;
                    self.stack.push(PickleValue::Int(value));
                }
                op::BININT => {
                    let v = LittleEndian::read_i32(self.take(4)?);
                    self.stack.push(PickleValue::Int(v as i64));
                }
                op::BININT1 => {
                    let v = self.byte()?;
                    self.stack.push(PickleValue::Int(v as i64));
                }
                op::BININT2 => {
                    let v = LittleEndian::read_u16(self.take(2)?);
                    self.stack.push(PickleValue::Int(v as i64));
                }
                op::LONG1 => {
                    let n = self.byte()? as usize;
                    let v = decode_long(self.take(n)?)?;
                    self.stack.push(PickleValue::Int(v));
                }
                op::LONG4 => {
                    let n = self.len4()?;
                    let v = decode_long(self.take(n)?)?;
                    self.stack.push(PickleValue::Int(v));
                }
                op::FLOAT => {
                    let line = self.line()?;
                    let v = line
                        .parse::<f64>()
                        .map_err(|_| err(format!("bad float literal {line:?}")))?;
                    self.stack.push(PickleValue::Float(v));
                }
                op::BINFLOAT => {
                    let v = BigEndian::read_f64(self.take(8)?);
                    self.stack.push(PickleValue::Float(v));
                }

                op::STRING => {
                    let line = self.line()?;
                    let s = line
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| line.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                        .ok_or_else(|| err("unquoted STRING argument"))?;
                    self.stack.push(PickleValue::Str(s.to_string()));
                }
                op::BINSTRING => {
                    let n = self.len4()?;
                    let raw = self.take(n)?;
                    self.stack.push(PickleValue::Str(latin1_to_string(raw)));
                }
                op::SHORT_BINSTRING => {
                    let n = self.byte()? as usize;
                    let raw = self.take(n)?;
                    self.stack.push(PickleValue::Str(latin1_to_string(raw)));
                }
                op::UNICODE => {
                    let line = self.line()?.to_string();
                    self.stack.push(PickleValue::Str(line));
                }
                op::BINUNICODE => {
                    let n = self.len4()?;
                    self.push_utf8(n)?;
                }
                op::SHORT_BINUNICODE => {
                    let n = self.byte()? as usize;
                    self.push_utf8(n)?;
                }
                op::BINUNICODE8 => {
                    let n = self.len8()?;
                    self.push_utf8(n)?;
                }
                op::SHORT_BINBYTES => {
                    let n = self.byte()? as usize;
                    let raw = self.take(n)?.to_vec();
                    self.stack.push(PickleValue::Bytes(raw));
                }
                op::BINBYTES => {
                    let n = self.len4()?;
                    let raw = self.take(n)?.to_vec();
                    self.stack.push(PickleValue::Bytes(raw));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let n = self.len8()?;
                    let raw = self.take(n)?.to_vec();
                    self.stack.push(PickleValue::Bytes(raw));
                }

                op::EMPTY_LIST => self.stack.push(PickleValue::List(Vec::new())),
                op::EMPTY_TUPLE => self.stack.push(PickleValue::Tuple(Vec::new())),
                op::EMPTY_DICT => self.stack.push(PickleValue::Dict(Vec::new())),
                op::EMPTY_SET => self.stack.push(PickleValue::List(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::List(items));
                }
                op::TUPLE | op::FROZENSET => {
                    let items = self.pop_mark()?;
                    let value = match code {
                        op::TUPLE => PickleValue::Tuple(items),
                        _ => PickleValue::List(items),
                    };
                    self.stack.push(value);
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (code - op::TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(err("stack underflow building tuple"));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(PickleValue::Tuple(items));
                }
                op::DICT => {
                    let items = self.pop_mark()?;
                    self.stack.push(PickleValue::Dict(pairs(items)?));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.extend_top(vec![item])?;
                }
                op::APPENDS | op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.insert_top(vec![(key, value)])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    self.insert_top(pairs(items)?)?;
                }

                op::PUT => {
                    let idx = parse_int(self.line()?)? as u64;
                    self.put(idx)?;
                }
                op::BINPUT => {
                    let idx = self.byte()? as u64;
                    self.put(idx)?;
                }
                op::LONG_BINPUT => {
                    let idx = LittleEndian::read_u32(self.take(4)?) as u64;
                    self.put(idx)?;
                }
                op::MEMOIZE => {
                    let idx = self.memo.len() as u64;
                    self.put(idx)?;
                }
                op::GET => {
                    let idx = parse_int(self.line()?)? as u64;
                    self.get(idx)?;
                }
                op::BINGET => {
                    let idx = self.byte()? as u64;
                    self.get(idx)?;
                }
                op::LONG_BINGET => {
                    let idx = LittleEndian::read_u32(self.take(4)?) as u64;
                    self.get(idx)?;
                }

                op::GLOBAL => {
                    let module = self.line()?.to_string();
                    let name = self.line()?.to_string();
                    self.stack.push(PickleValue::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (PickleValue::Str(module), PickleValue::Str(name)) => {
                            self.stack.push(PickleValue::Global { module, name })
                        }
                        _ => return Err(err("STACK_GLOBAL needs two strings")),
                    }
                }
                op::REDUCE => {
                    let args = match self.pop()? {
                        PickleValue::Tuple(args) => args,
                        other => return Err(err(format!("REDUCE arguments {other:?}"))),
                    };
                    let callable = self.pop()?;
                    self.stack.push(reduce(callable, args)?);
                }
                op::NEWOBJ => {
                    let args = match self.pop()? {
                        PickleValue::Tuple(args) => args,
                        other => return Err(err(format!("NEWOBJ arguments {other:?}"))),
                    };
                    let class = self.pop()?;
                    self.stack.push(PickleValue::Object {
                        class: Box::new(class),
                        args,
                        state: None,
                    });
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = match self.pop()? {
                        PickleValue::Tuple(args) => args,
                        other => return Err(err(format!("NEWOBJ_EX arguments {other:?}"))),
                    };
                    let class = self.pop()?;
                    self.stack.push(PickleValue::Object {
                        class: Box::new(class),
                        args,
                        state: None,
                    });
                }
                op::BUILD => {
                    let state = self.pop()?;
                    self.build(state)?;
                }

                other => {
                    return Err(err(format!(
                        "unsupported opcode 0x{other:02x} at offset {}",
                        self.pos - 1
                    )))
                }
            }
        }
    }

    // -- input --

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| err("truncated pickle (no STOP)"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| err(format!("truncated pickle: need {n} bytes at {}", self.pos)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn len4(&mut self) -> Result<usize> {
        Ok(LittleEndian::read_u32(self.take(4)?) as usize)
    }

    fn len8(&mut self) -> Result<usize> {
        let n = LittleEndian::read_u64(self.take(8)?);
        usize::try_from(n).map_err(|_| err("length overflows usize"))
    }

    fn line(&mut self) -> Result<&'a str> {
        let rest = &self.data[self.pos..];
        let n = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| err("unterminated text argument"))?;
        let line = std::str::from_utf8(&rest[..n]).map_err(|_| err("non UTF-8 text argument"))?;
        self.pos += n + 1;
        Ok(line)
    }

    fn push_utf8(&mut self, n: usize) -> Result<()> {
        let raw = self.take(n)?;
        let s = std::str::from_utf8(raw).map_err(|_| err("invalid UTF-8 in string"))?;
        self.stack.push(PickleValue::Str(s.to_string()));
        Ok(())
    }

    // -- stack --

    fn pop(&mut self) -> Result<PickleValue> {
        self.stack.pop().ok_or_else(|| err("stack underflow"))
    }

    fn top(&mut self) -> Result<&mut PickleValue> {
        self.stack.last_mut().ok_or_else(|| err("stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<PickleValue>> {
        let mark = self.marks.pop().ok_or_else(|| err("no MARK on the stack"))?;
        if mark > self.stack.len() {
            return Err(err("MARK above stack top"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn extend_top(&mut self, items: Vec<PickleValue>) -> Result<()> {
        match self.top()? {
            PickleValue::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(err(format!("cannot append to {other:?}"))),
        }
    }

    fn insert_top(&mut self, items: Vec<(PickleValue, PickleValue)>) -> Result<()> {
        match self.top()? {
            PickleValue::Dict(dict) => {
                dict.extend(items);
                Ok(())
            }
            other => Err(err(format!("cannot set items on {other:?}"))),
        }
    }

    // -- memo --

    fn put(&mut self, idx: u64) -> Result<()> {
        let top = self.top()?.clone();
        self.memo.insert(idx, top);
        Ok(())
    }

    fn get(&mut self, idx: u64) -> Result<()> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| err(format!("memo key {idx} not found")))?;
        self.stack.push(value);
        Ok(())
    }

    // -- objects --

    fn build(&mut self, state: PickleValue) -> Result<()> {
        let order = state
            .as_seq()
            .and_then(|s| s.get(1))
            .and_then(PickleValue::as_str)
            .and_then(|s| s.chars().next());
        let top = self
            .stack
            .last_mut()
            .ok_or_else(|| err("BUILD on an empty stack"))?;
        match top {
            PickleValue::Dtype { .. } => {
                let before = top.clone();
                if let (PickleValue::Dtype { byte_order, .. }, Some(order)) = (&mut *top, order) {
                    *byte_order = order;
                }
                // A dtype is memoised before its state is applied; later
                // references must see the built value.
                let after = top.clone();
                for entry in self.memo.values_mut() {
                    if *entry == before {
                        *entry = after.clone();
                    }
                }
            }
            PickleValue::Object { state: slot, .. } => *slot = Some(Box::new(state)),
            _ => {}
        }
        Ok(())
    }
}

fn parse_int(s: &str) -> Result<i64> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| err(format!("bad integer literal {s:?}")))
}

fn pairs(items: Vec<PickleValue>) -> Result<Vec<(PickleValue, PickleValue)>> {
    if items.len() % 2 != 0 {
        return Err(err("odd number of dict items"));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

/// Little-endian two's complement, as written by `LONG1`/`LONG4`.
fn decode_long(bytes: &[u8]) -> Result<i64> {
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    let negative = last & 0x80 != 0;
    let fill = if negative { 0xff } else { 0x00 };
    if bytes.len() > 8 && bytes[8..].iter().any(|&b| b != fill) {
        return Err(err("integer does not fit in 64 bits"));
    }
    let mut buf = [fill; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    let value = i64::from_le_bytes(buf);
    if (value < 0) != negative {
        return Err(err("integer does not fit in 64 bits"));
    }
    Ok(value)
}

fn latin1_to_string(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

fn string_to_latin1(s: &str) -> Result<Vec<u8>> {
    s.chars()
        .map(|c| u8::try_from(c as u32).map_err(|_| err("non latin-1 character in bytes payload")))
        .collect()
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

fn reduce(callable: PickleValue, mut args: Vec<PickleValue>) -> Result<PickleValue> {
    let PickleValue::Global { module, name } = &callable else {
        return Ok(PickleValue::Object {
            class: Box::new(callable),
            args,
            state: None,
        });
    };

    match (module.as_str(), name.as_str()) {
        // Protocol 2 writes `bytes` as `_codecs.encode(text, "latin1")`.
        ("_codecs", "encode") => match args.first() {
            Some(PickleValue::Str(text)) => Ok(PickleValue::Bytes(string_to_latin1(text)?)),
            _ => Err(err("_codecs.encode without a string")),
        },
        ("__builtin__" | "builtins", "bytes" | "bytearray") => match args.first() {
            None => Ok(PickleValue::Bytes(Vec::new())),
            Some(PickleValue::Str(text)) => Ok(PickleValue::Bytes(string_to_latin1(text)?)),
            Some(PickleValue::Bytes(raw)) => Ok(PickleValue::Bytes(raw.clone())),
            Some(PickleValue::List(items)) => items
                .iter()
                .map(|v| match v {
                    PickleValue::Int(i) => {
                        u8::try_from(*i).map_err(|_| err("byte value out of range"))
                    }
                    _ => Err(err("bytes from a non-integer list")),
                })
                .collect::<Result<Vec<u8>>>()
                .map(PickleValue::Bytes),
            Some(other) => Err(err(format!("bytes({other:?})"))),
        },
        ("__builtin__" | "builtins", "set" | "frozenset") => match args.pop() {
            Some(PickleValue::List(items)) => Ok(PickleValue::List(items)),
            None => Ok(PickleValue::List(Vec::new())),
            Some(other) => Err(err(format!("set({other:?})"))),
        },
        ("numpy", "dtype") => match args.first() {
            Some(PickleValue::Str(code)) => Ok(PickleValue::Dtype {
                code: code.clone(),
                byte_order: '=',
            }),
            _ => Err(err("numpy.dtype without a type code")),
        },
        (m, "scalar") if m.starts_with("numpy") => numpy_scalar(args),
        _ => Ok(PickleValue::Object {
            class: Box::new(PickleValue::Global {
                module: module.clone(),
                name: name.clone(),
            }),
            args,
            state: None,
        }),
    }
}

/// `numpy.core.multiarray.scalar(dtype, payload)` → a plain value.
fn numpy_scalar(args: Vec<PickleValue>) -> Result<PickleValue> {
    let mut args = args.into_iter();
    let (code, byte_order) = match args.next() {
        Some(PickleValue::Dtype { code, byte_order }) => (code, byte_order),
        other => return Err(err(format!("numpy scalar with dtype {other:?}"))),
    };
    let payload = match args.next() {
        Some(PickleValue::Bytes(raw)) => raw,
        Some(PickleValue::Str(text)) => string_to_latin1(&text)?,
        other => return Err(err(format!("numpy scalar with payload {other:?}"))),
    };
    if byte_order == '>' {
        decode_scalar::<BigEndian>(&code, &payload)
    } else {
        decode_scalar::<LittleEndian>(&code, &payload)
    }
}

fn decode_scalar<B: ByteOrder>(code: &str, payload: &[u8]) -> Result<PickleValue> {
    let mut chars = code.chars();
    let kind = chars.next().ok_or_else(|| err("empty dtype code"))?;
    let size: usize = chars
        .as_str()
        .parse()
        .map_err(|_| err(format!("unsupported dtype {code:?}")))?;
    let expected = if kind == 'U' { size * 4 } else { size };
    if payload.len() != expected {
        return Err(err(format!(
            "dtype {code} needs {expected} bytes, payload has {}",
            payload.len()
        )));
    }

    let value = match (kind, size) {
        ('b', 1) => PickleValue::Bool(payload[0] != 0),
        ('i', 1) => PickleValue::Int(payload[0] as i8 as i64),
        ('i', 2) => PickleValue::Int(B::read_i16(payload) as i64),
        ('i', 4) => PickleValue::Int(B::read_i32(payload) as i64),
        ('i', 8) => PickleValue::Int(B::read_i64(payload)),
        ('u', 1) => PickleValue::Int(payload[0] as i64),
        ('u', 2) => PickleValue::Int(B::read_u16(payload) as i64),
        ('u', 4) => PickleValue::Int(B::read_u32(payload) as i64),
        ('u', 8) => PickleValue::Int(
            i64::try_from(B::read_u64(payload)).map_err(|_| err("uint64 overflows i64"))?,
        ),
        ('f', 4) => PickleValue::Float(B::read_f32(payload) as f64),
        ('f', 8) => PickleValue::Float(B::read_f64(payload)),
        ('U', _) => {
            let text: String = payload
                .chunks_exact(4)
                .map(B::read_u32)
                .take_while(|&c| c != 0)
                .map(|c| char::from_u32(c).ok_or_else(|| err("invalid UCS-4 code point")))
                .collect::<Result<String>>()?;
            PickleValue::Str(text)
        }
        ('S', _) => {
            let end = payload.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
            PickleValue::Bytes(payload[..end].to_vec())
        }
        _ => return Err(err(format!("unsupported dtype {code:?}"))),
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Writes protocol-2 pickles, the format of the sidecar record files.
#[derive(Debug, Default)]
pub struct Pickler {
    out: Vec<u8>,
    numpy_scalars: bool,
}

impl Pickler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write integers, floats, booleans and non-empty strings as numpy
    /// scalars, the way records built from numpy arrays are pickled.
    pub fn numpy_scalars(mut self, enabled: bool) -> Self {
        self.numpy_scalars = enabled;
        self
    }

    pub fn dumps(mut self, value: &PickleValue) -> Vec<u8> {
        self.out.extend_from_slice(&[op::PROTO, 2]);
        self.write(value);
        self.out.push(op::STOP);
        self.out
    }

    fn write(&mut self, value: &PickleValue) {
        match value {
            PickleValue::None => self.out.push(op::NONE),
            PickleValue::Bool(b) if self.numpy_scalars => {
                self.write_scalar("b1", '|', &[*b as u8])
            }
            PickleValue::Bool(b) => self.out.push(if *b { op::NEWTRUE } else { op::NEWFALSE }),
            PickleValue::Int(i) if self.numpy_scalars => {
                self.write_scalar("i8", '<', &i.to_le_bytes())
            }
            PickleValue::Int(i) => self.write_int(*i),
            PickleValue::Float(v) if self.numpy_scalars => {
                self.write_scalar("f8", '<', &v.to_le_bytes())
            }
            PickleValue::Float(v) => {
                self.out.push(op::BINFLOAT);
                self.out.extend_from_slice(&v.to_be_bytes());
            }
            PickleValue::Str(s) if self.numpy_scalars && !s.is_empty() => {
                let payload: Vec<u8> = s.chars().flat_map(|c| (c as u32).to_le_bytes()).collect();
                self.write_scalar(&format!("U{}", s.chars().count()), '<', &payload);
            }
            PickleValue::Str(s) => self.write_str(s),
            PickleValue::Bytes(raw) => self.write_bytes(raw),
            PickleValue::List(items) => {
                self.out.push(op::EMPTY_LIST);
                if !items.is_empty() {
                    self.out.push(op::MARK);
                    for item in items {
                        self.write(item);
                    }
                    self.out.push(op::APPENDS);
                }
            }
            PickleValue::Tuple(items) => match items.len() {
                0 => self.out.push(op::EMPTY_TUPLE),
                n @ 1..=3 => {
                    for item in items {
                        self.write(item);
                    }
                    self.out.push(op::TUPLE1 + n as u8 - 1);
                }
                _ => {
                    self.out.push(op::MARK);
                    for item in items {
                        self.write(item);
                    }
                    self.out.push(op::TUPLE);
                }
            },
            PickleValue::Dict(pairs) => {
                self.out.push(op::EMPTY_DICT);
                if !pairs.is_empty() {
                    self.out.push(op::MARK);
                    for (k, v) in pairs {
                        self.write(k);
                        self.write(v);
                    }
                    self.out.push(op::SETITEMS);
                }
            }
            PickleValue::Global { module, name } => self.write_global(module, name),
            PickleValue::Dtype { code, byte_order } => self.write_dtype(code, *byte_order),
            PickleValue::Object { class, args, state } => {
                self.write(class);
                self.write(&PickleValue::Tuple(args.clone()));
                self.out.push(op::REDUCE);
                if let Some(state) = state {
                    self.write(state);
                    self.out.push(op::BUILD);
                }
            }
        }
    }

    fn write_int(&mut self, i: i64) {
        match i {
            0..=0xff => self.out.extend_from_slice(&[op::BININT1, i as u8]),
            0x100..=0xffff => {
                self.out.push(op::BININT2);
                self.out.extend_from_slice(&(i as u16).to_le_bytes());
            }
            _ if i32::try_from(i).is_ok() => {
                self.out.push(op::BININT);
                self.out.extend_from_slice(&(i as i32).to_le_bytes());
            }
            _ => {
                self.out.extend_from_slice(&[op::LONG1, 8]);
                self.out.extend_from_slice(&i.to_le_bytes());
            }
        }
    }

    fn write_str(&mut self, s: &str) {
        self.out.push(op::BINUNICODE);
        self.out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.out.extend_from_slice(s.as_bytes());
    }

    fn write_bytes(&mut self, raw: &[u8]) {
        if raw.is_empty() {
            self.write_global("__builtin__", "bytes");
            self.out.extend_from_slice(&[op::EMPTY_TUPLE, op::REDUCE]);
            return;
        }
        self.write_global("_codecs", "encode");
        self.write_str(&latin1_to_string(raw));
        self.write_str("latin1");
        self.out.extend_from_slice(&[op::TUPLE2, op::REDUCE]);
    }

    fn write_global(&mut self, module: &str, name: &str) {
        self.out.push(op::GLOBAL);
        self.out.extend_from_slice(module.as_bytes());
        self.out.push(b'\n');
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'\n');
    }

    fn write_dtype(&mut self, code: &str, byte_order: char) {
        self.write_global("numpy", "dtype");
        self.write_str(code);
        self.out
            .extend_from_slice(&[op::NEWFALSE, op::NEWTRUE, op::TUPLE3, op::REDUCE]);
        // (3, byte_order, None, None, None, -1, -1, 0)
        self.out.push(op::MARK);
        self.write_int(3);
        self.write_str(&byte_order.to_string());
        self.out.extend_from_slice(&[op::NONE, op::NONE, op::NONE]);
        self.write_int(-1);
        self.write_int(-1);
        self.write_int(0);
        self.out.extend_from_slice(&[op::TUPLE, op::BUILD]);
    }

    fn write_scalar(&mut self, code: &str, byte_order: char, payload: &[u8]) {
        self.write_global("numpy.core.multiarray", "scalar");
        self.write_dtype(code, byte_order);
        self.write_bytes(payload);
        self.out.extend_from_slice(&[op::TUPLE2, op::REDUCE]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> PickleValue {
        PickleValue::Str(v.into())
    }

    #[test]
    fn decodes_protocol2_column_list() {
        // pickle.dumps(['SURVEY', 'PROGRAM'], protocol=2)
        let data = b"\x80\x02]q\x00(X\x06\x00\x00\x00SURVEYq\x01X\x07\x00\x00\x00PROGRAMq\x02e.";
        assert_eq!(
            loads(data).unwrap(),
            PickleValue::List(vec![s("SURVEY"), s("PROGRAM")])
        );
    }

    #[test]
    fn trailing_padding_after_stop_is_ignored() {
        let mut data = b"\x80\x02]q\x00X\x03\x00\x00\x00hpxq\x01a.".to_vec();
        data.resize(1000, 0);
        assert_eq!(loads(&data).unwrap(), PickleValue::List(vec![s("hpx")]));
    }

    #[test]
    fn decodes_protocol4_framed_tuple() {
        // pickle.dumps((1, 'a', None, 2.5, True), protocol=4)
        let data = b"\x80\x04\x95\x15\x00\x00\x00\x00\x00\x00\x00(K\x01\x8c\x01a\x94NG@\x04\x00\x00\x00\x00\x00\x00\x88t\x94.";
        assert_eq!(
            loads(data).unwrap(),
            PickleValue::Tuple(vec![
                PickleValue::Int(1),
                s("a"),
                PickleValue::None,
                PickleValue::Float(2.5),
                PickleValue::Bool(true),
            ])
        );
    }

    #[test]
    fn decodes_long_integers() {
        // 39627793289890840 and -2**40
        assert_eq!(
            decode_long(&39627793289890840i64.to_le_bytes()).unwrap(),
            39627793289890840
        );
        assert_eq!(decode_long(&[0, 0, 0, 0, 0, 0xff]).unwrap(), -(1i64 << 40));
        assert_eq!(decode_long(&[0xff, 0x00]).unwrap(), 255);
        assert!(decode_long(&[0, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn memoised_dtype_sees_built_byte_order() {
        // Two scalars sharing one big-endian int32 dtype via BINGET.
        let mut data = vec![op::PROTO, 2, op::MARK];
        let mut first = Vec::new();
        first.extend_from_slice(b"cnumpy.core.multiarray\nscalar\n");
        first.extend_from_slice(b"cnumpy\ndtype\nX\x02\x00\x00\x00i4\x89\x88\x87R");
        first.extend_from_slice(b"q\x05");
        first.extend_from_slice(
            b"(K\x03X\x01\x00\x00\x00>NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb",
        );
        first.extend_from_slice(b"C\x04\x00\x00\x01\x00\x86R");
        data.extend_from_slice(&first);
        data.extend_from_slice(b"cnumpy.core.multiarray\nscalar\nh\x05C\x04\x00\x00\x00\x07\x86R");
        data.extend_from_slice(&[op::TUPLE, op::STOP]);

        assert_eq!(
            loads(&data).unwrap(),
            PickleValue::Tuple(vec![PickleValue::Int(256), PickleValue::Int(7)])
        );
    }

    #[test]
    fn numpy_record_decodes_to_plain_values() {
        let record = PickleValue::Tuple(vec![
            s("main"),
            s("bright"),
            PickleValue::Int(10378),
            PickleValue::Int(39627793289890840),
            PickleValue::Float(0.25),
        ]);
        let bytes = Pickler::new().numpy_scalars(true).dumps(&record);
        assert!(bytes.windows(6).any(|w| w == b"scalar"));
        assert_eq!(loads(&bytes).unwrap(), record);
    }

    #[test]
    fn protocol2_bytes_use_codecs_encode() {
        let value = PickleValue::Bytes(vec![0x00, 0xe9, 0x41]);
        let bytes = Pickler::new().dumps(&value);
        assert!(bytes.windows(7).any(|w| w == b"_codecs"));
        assert_eq!(loads(&bytes).unwrap(), value);
    }

    #[test]
    fn unicode_scalar_strips_padding() {
        let payload: Vec<u8> = "ab\0\0"
            .chars()
            .flat_map(|c| (c as u32).to_le_bytes())
            .collect();
        assert_eq!(
            decode_scalar::<LittleEndian>("U4", &payload).unwrap(),
            s("ab")
        );
        assert!(decode_scalar::<LittleEndian>("i8", &[0; 4]).is_err());
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(matches!(
            loads(b"\x80\x02X\x06\x00\x00\x00SUR"),
            Err(Error::Pickle(_))
        ));
        assert!(matches!(loads(b"\x80\x02N"), Err(Error::Pickle(_))));
        assert!(matches!(loads(b"\x80\x02P"), Err(Error::Pickle(_))));
    }

    #[test]
    fn record_values_map_to_field_values() {
        let v = PickleValue::Tuple(vec![PickleValue::Bytes(b"sv1".to_vec()), PickleValue::None]);
        assert_eq!(
            v.to_field_value(),
            FieldValue::Array(vec![FieldValue::String("sv1".into()), FieldValue::Null])
        );
    }
}
