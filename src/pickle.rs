//! A restricted unpickler
//!
//! Decodes the subset of Python's pickle protocols 0-4 (binary opcodes only) that plain
//! containers and `numpy` arrays are written with. Nothing is ever executed: calls to
//! unknown globals are kept as opaque [`Object::Reduce`] values, and the two numpy
//! callables are interpreted directly into [`NdArray`] and [`Dtype`].
//! <https://docs.python.org/3/library/pickle.html>

use std::{collections::HashMap, io::Read, rc::Rc, string::FromUtf8Error};

use thiserror::Error;

/// Errors while decoding a pickle stream
#[derive(Debug, Error)]
pub enum PickleError {
    #[error("Unexpected end of stream at offset {offset}")]
    UnexpectedEof { offset: usize },
    #[error("Unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("Stack underflow while executing opcode {opcode:#04x}")]
    StackUnderflow { opcode: u8 },
    #[error("No mark on the stack")]
    MissingMark,
    #[error("Memo has no entry {index}")]
    InvalidMemo { index: u32 },
    #[error("Invalid UTF-8 in string")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const BINFLOAT: u8 = b'G';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const REDUCE: u8 = b'R';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINUNICODE: u8 = b'X';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const EMPTY_LIST: u8 = b']';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const APPENDS: u8 = b'e';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const SETITEMS: u8 = b'u';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const EMPTY_DICT: u8 = b'}';
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
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
}

/// A decoded Python value
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Python 3 `bytes`, and Python 2 `str` which is kept undecoded
    Bytes(Rc<Vec<u8>>),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    Global { module: String, name: String },
    /// A call to a global the unpickler does not interpret
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
        state: Option<Box<Object>>,
    },
    Dtype(Dtype),
    NdArray(NdArray),
}

impl Object {
    pub fn as_tuple(&self) -> Option<&[Object]> {
        match self {
            Object::Tuple(items) | Object::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Object::Int(i) => Some(*i),
            Object::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Text of a `str`, or of a Python 2 byte string holding ASCII
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Str(s) => Some(s),
            Object::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_ndarray(&self) -> Option<&NdArray> {
        match self {
            Object::NdArray(array) => Some(array),
            _ => None,
        }
    }
}

/// Element type of an [`NdArray`], e.g. `f4` or `i8`
#[derive(Debug, Clone, PartialEq)]
pub struct Dtype {
    pub kind: char,
    pub size: usize,
    /// `'<'`, `'>'`, `'|'` or `'='`; only known once the dtype's state has been applied
    pub byteorder: Option<char>,
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self, PickleError> {
        let descr = descr.trim_start_matches(['<', '>', '|', '=']);
        let mut chars = descr.chars();
        let kind = chars
            .next()
            .ok_or_else(|| PickleError::Unsupported("empty dtype".to_string()))?;
        let size = chars
            .as_str()
            .parse()
            .map_err(|_| PickleError::Unsupported(format!("dtype '{}'", descr)))?;
        Ok(Self {
            kind,
            size,
            byteorder: None,
        })
    }

    fn is_big_endian(&self) -> bool {
        self.byteorder == Some('>')
    }
}

/// A numpy array: shape, element type and raw element bytes
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub fortran_order: bool,
    pub data: Rc<Vec<u8>>,
}

impl NdArray {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Elements in row-major order, converted to `f32`
    pub fn to_f32(&self) -> Result<Vec<f32>, PickleError> {
        let values = self.decode(|bytes, dtype| {
            let be = dtype.is_big_endian();
            Ok(match (dtype.kind, dtype.size) {
                ('f', 4) => f32::from_bits(uint(bytes, be) as u32),
                ('f', 8) => f64::from_bits(uint(bytes, be)) as f32,
                ('i', 1 | 2 | 4 | 8) => int(bytes, be) as f32,
                ('u', 1 | 2 | 4 | 8) | ('b', 1) => uint(bytes, be) as f32,
                _ => return Err(unsupported_dtype(dtype)),
            })
        })?;
        Ok(self.row_major(values))
    }

    /// Elements in row-major order, for integer and boolean arrays
    pub fn to_i64(&self) -> Result<Vec<i64>, PickleError> {
        let values = self.decode(|bytes, dtype| {
            let be = dtype.is_big_endian();
            Ok(match (dtype.kind, dtype.size) {
                ('i', 1 | 2 | 4 | 8) => int(bytes, be),
                ('u', 1 | 2 | 4) | ('b', 1) => uint(bytes, be) as i64,
                _ => return Err(unsupported_dtype(dtype)),
            })
        })?;
        Ok(self.row_major(values))
    }

    fn decode<T, F>(&self, f: F) -> Result<Vec<T>, PickleError>
    where
        F: Fn(&[u8], &Dtype) -> Result<T, PickleError>,
    {
        let size = self.dtype.size;
        if size == 0 || self.data.len() != self.numel() * size {
            return Err(PickleError::Unsupported(format!(
                "array of shape {:?} with {} data bytes",
                self.shape,
                self.data.len()
            )));
        }
        self.data
            .chunks_exact(size)
            .map(|bytes| f(bytes, &self.dtype))
            .collect()
    }

    fn row_major<T: Copy>(&self, values: Vec<T>) -> Vec<T> {
        if !self.fortran_order || self.shape.len() < 2 {
            return values;
        }
        // column-major storage: the first index varies fastest
        let n = values.len();
        let mut out = Vec::with_capacity(n);
        let mut col_strides = vec![1; self.shape.len()];
        for d in 1..self.shape.len() {
            col_strides[d] = col_strides[d - 1] * self.shape[d - 1];
        }
        let mut index = vec![0; self.shape.len()];
        for _ in 0..n {
            let offset: usize = index.iter().zip(&col_strides).map(|(i, s)| i * s).sum();
            out.push(values[offset]);
            for d in (0..self.shape.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        out
    }
}

fn unsupported_dtype(dtype: &Dtype) -> PickleError {
    PickleError::Unsupported(format!("dtype {}{}", dtype.kind, dtype.size))
}

fn uint(bytes: &[u8], big_endian: bool) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | *b as u64;
    if big_endian {
        bytes.iter().fold(0, fold)
    } else {
        bytes.iter().rev().fold(0, fold)
    }
}

fn int(bytes: &[u8], big_endian: bool) -> i64 {
    let bits = 8 * bytes.len() as u32;
    let value = uint(bytes, big_endian);
    if bits < 64 && value >> (bits - 1) & 1 == 1 {
        (value | (u64::MAX << bits)) as i64
    } else {
        value as i64
    }
}

/// Decodes a complete pickle held in memory
pub fn from_slice(data: &[u8]) -> Result<Object, PickleError> {
    Unpickler::new(data).load()
}

/// Reads the stream to its end and decodes it
pub fn from_reader<R: Read>(mut reader: R) -> Result<Object, PickleError> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    from_slice(&data)
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Object>,
    marks: Vec<usize>,
    memo: HashMap<u32, Object>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn load(mut self) -> Result<Object, PickleError> {
        loop {
            let offset = self.pos;
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    let proto = self.read_u8()?;
                    if proto > 5 {
                        return Err(PickleError::Unsupported(format!("protocol {}", proto)));
                    }
                }
                op::FRAME => {
                    // frames only group opcodes, the whole stream is in memory anyway
                    self.read_u64()?;
                }
                op::STOP => return self.pop(opcode),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop(opcode)?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.peek(opcode)?.clone();
                    self.stack.push(top);
                }
                op::NONE => self.stack.push(Object::None),
                op::NEWTRUE => self.stack.push(Object::Bool(true)),
                op::NEWFALSE => self.stack.push(Object::Bool(false)),
                op::BININT => {
                    let v = self.read_u32()? as i32;
                    self.stack.push(Object::Int(v as i64));
                }
                op::BININT1 => {
                    let v = self.read_u8()?;
                    self.stack.push(Object::Int(v as i64));
                }
                op::BININT2 => {
                    let v = self.read_u16()?;
                    self.stack.push(Object::Int(v as i64));
                }
                op::LONG1 | op::LONG4 => {
                    let n = if opcode == op::LONG1 {
                        self.read_u8()? as usize
                    } else {
                        self.read_u32()? as usize
                    };
                    let v = match n {
                        0 => 0,
                        1..=8 => int(self.read_bytes(n)?, false),
                        _ => return Err(PickleError::Unsupported(format!("{}-byte integer", n))),
                    };
                    self.stack.push(Object::Int(v));
                }
                op::BINFLOAT => {
                    let bytes = self.read_bytes(8)?;
                    self.stack.push(Object::Float(f64::from_bits(uint(bytes, true))));
                }
                op::SHORT_BINSTRING | op::SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    self.push_bytes(n)?;
                }
                op::BINSTRING | op::BINBYTES => {
                    let n = self.read_u32()? as usize;
                    self.push_bytes(n)?;
                }
                op::BINBYTES8 => {
                    let n = self.read_u64()? as usize;
                    self.push_bytes(n)?;
                }
                op::SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    self.push_str(n)?;
                }
                op::BINUNICODE => {
                    let n = self.read_u32()? as usize;
                    self.push_str(n)?;
                }
                op::BINUNICODE8 => {
                    let n = self.read_u64()? as usize;
                    self.push_str(n)?;
                }
                op::EMPTY_TUPLE => self.stack.push(Object::Tuple(vec![])),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Object::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::StackUnderflow { opcode });
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Object::Tuple(items));
                }
                op::EMPTY_LIST => self.stack.push(Object::List(vec![])),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Object::List(items));
                }
                op::APPEND => {
                    let item = self.pop(opcode)?;
                    self.extend_list(opcode, vec![item])?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    self.extend_list(opcode, items)?;
                }
                op::EMPTY_DICT => self.stack.push(Object::Dict(vec![])),
                op::DICT => {
                    let items = self.pop_mark()?;
                    let dict = pairs(items)?;
                    self.stack.push(Object::Dict(dict));
                }
                op::SETITEM => {
                    let value = self.pop(opcode)?;
                    let key = self.pop(opcode)?;
                    self.extend_dict(opcode, vec![(key, value)])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let items = pairs(items)?;
                    self.extend_dict(opcode, items)?;
                }
                op::GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Object::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop(opcode)?;
                    let module = self.pop(opcode)?;
                    match (module, name) {
                        (Object::Str(module), Object::Str(name)) => {
                            self.stack.push(Object::Global { module, name })
                        }
                        _ => return Err(PickleError::Unsupported("non-string STACK_GLOBAL".to_string())),
                    }
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop(opcode)?;
                    let callable = self.pop(opcode)?;
                    self.stack.push(reduce(callable, args)?);
                }
                op::BUILD => {
                    let state = self.pop(opcode)?;
                    let target = self.pop(opcode)?;
                    self.stack.push(build(target, state)?);
                }
                op::BINPUT => {
                    let index = self.read_u8()? as u32;
                    self.memoize(opcode, index)?;
                }
                op::LONG_BINPUT => {
                    let index = self.read_u32()?;
                    self.memoize(opcode, index)?;
                }
                op::MEMOIZE => {
                    let index = self.memo.len() as u32;
                    self.memoize(opcode, index)?;
                }
                op::BINGET => {
                    let index = self.read_u8()? as u32;
                    self.get_memo(index)?;
                }
                op::LONG_BINGET => {
                    let index = self.read_u32()?;
                    self.get_memo(index)?;
                }
                _ => return Err(PickleError::UnknownOpcode { opcode, offset }),
            }
        }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(PickleError::UnexpectedEof { offset: self.pos })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, PickleError> {
        Ok(uint(self.read_bytes(2)?, false) as u16)
    }

    fn read_u32(&mut self) -> Result<u32, PickleError> {
        Ok(uint(self.read_bytes(4)?, false) as u32)
    }

    fn read_u64(&mut self) -> Result<u64, PickleError> {
        Ok(uint(self.read_bytes(8)?, false))
    }

    fn read_line(&mut self) -> Result<String, PickleError> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::UnexpectedEof { offset: self.data.len() })?;
        let line = String::from_utf8(rest[..len].to_vec())?;
        self.pos += len + 1;
        Ok(line)
    }

    fn push_bytes(&mut self, n: usize) -> Result<(), PickleError> {
        let bytes = self.read_bytes(n)?.to_vec();
        self.stack.push(Object::Bytes(Rc::new(bytes)));
        Ok(())
    }

    fn push_str(&mut self, n: usize) -> Result<(), PickleError> {
        let s = String::from_utf8(self.read_bytes(n)?.to_vec())?;
        self.stack.push(Object::Str(s));
        Ok(())
    }

    fn pop(&mut self, opcode: u8) -> Result<Object, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow { opcode })
    }

    fn peek(&mut self, opcode: u8) -> Result<&mut Object, PickleError> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow { opcode })
    }

    fn pop_mark(&mut self) -> Result<Vec<Object>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark)?;
        if mark > self.stack.len() {
            return Err(PickleError::MissingMark);
        }
        Ok(self.stack.split_off(mark))
    }

    fn extend_list(&mut self, opcode: u8, items: Vec<Object>) -> Result<(), PickleError> {
        match self.peek(opcode)? {
            Object::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(PickleError::Unsupported(format!("append to {:?}", other))),
        }
    }

    fn extend_dict(&mut self, opcode: u8, items: Vec<(Object, Object)>) -> Result<(), PickleError> {
        match self.peek(opcode)? {
            Object::Dict(dict) => {
                dict.extend(items);
                Ok(())
            }
            other => Err(PickleError::Unsupported(format!("set item on {:?}", other))),
        }
    }

    // The memo holds a copy, so mutations after memoizing (appends, BUILD) are not seen
    // through it. Byte buffers are shared, which keeps copies of arrays cheap.
    fn memoize(&mut self, opcode: u8, index: u32) -> Result<(), PickleError> {
        let top = self.peek(opcode)?.clone();
        self.memo.insert(index, top);
        Ok(())
    }

    fn get_memo(&mut self, index: u32) -> Result<(), PickleError> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or(PickleError::InvalidMemo { index })?;
        self.stack.push(value);
        Ok(())
    }
}

fn pairs(items: Vec<Object>) -> Result<Vec<(Object, Object)>, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Unsupported("odd number of dict items".to_string()));
    }
    let mut iter = items.into_iter();
    let mut out = Vec::new();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}

fn is_numpy(module: &str) -> bool {
    module == "numpy" || module.starts_with("numpy.")
}

fn reduce(callable: Object, args: Object) -> Result<Object, PickleError> {
    if let Object::Global { module, name } = &callable {
        if is_numpy(module) && name == "_reconstruct" {
            // the real shape, dtype and data arrive with BUILD
            return Ok(Object::NdArray(NdArray {
                shape: vec![0],
                dtype: Dtype {
                    kind: 'u',
                    size: 1,
                    byteorder: None,
                },
                fortran_order: false,
                data: Rc::new(vec![]),
            }));
        }
        if is_numpy(module) && name == "dtype" {
            let descr = args
                .as_tuple()
                .and_then(|a| a.first())
                .and_then(Object::as_str)
                .ok_or_else(|| PickleError::Unsupported("dtype without descriptor".to_string()))?;
            return Ok(Object::Dtype(Dtype::parse(descr)?));
        }
    }
    Ok(Object::Reduce {
        callable: Box::new(callable),
        args: Box::new(args),
        state: None,
    })
}

fn build(target: Object, state: Object) -> Result<Object, PickleError> {
    match target {
        Object::Dtype(mut dtype) => {
            // (version, byteorder, subdescr, names, fields, elsize, alignment, flags)
            dtype.byteorder = state
                .as_tuple()
                .and_then(|s| s.get(1))
                .and_then(Object::as_str)
                .and_then(|s| s.chars().next());
            Ok(Object::Dtype(dtype))
        }
        Object::NdArray(_) => {
            // (version, shape, dtype, is_fortran, raw data)
            let invalid = || PickleError::Unsupported("ndarray state".to_string());
            let state = state.as_tuple().ok_or_else(invalid)?;
            let [_, shape, dtype, fortran_order, data] = state else {
                return Err(invalid());
            };
            let shape = shape
                .as_tuple()
                .ok_or_else(invalid)?
                .iter()
                .map(|d| d.as_int().and_then(|d| usize::try_from(d).ok()))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(invalid)?;
            let Object::Dtype(dtype) = dtype else {
                return Err(invalid());
            };
            let Object::Bytes(data) = data else {
                return Err(PickleError::Unsupported("ndarray of python objects".to_string()));
            };
            Ok(Object::NdArray(NdArray {
                shape,
                dtype: dtype.clone(),
                fortran_order: fortran_order.as_int().ok_or_else(invalid)? != 0,
                data: data.clone(),
            }))
        }
        Object::Reduce { callable, args, .. } => Ok(Object::Reduce {
            callable,
            args,
            state: Some(Box::new(state)),
        }),
        other => Err(PickleError::Unsupported(format!("BUILD on {:?}", other))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Writes pickles the way Python 2's protocol 2 does for numpy arrays
    pub(crate) struct Writer {
        bytes: Vec<u8>,
        next_memo: u8,
    }

    impl Writer {
        pub fn new() -> Self {
            Self {
                bytes: vec![op::PROTO, 2],
                next_memo: 0,
            }
        }

        pub fn op(&mut self, opcode: u8) -> &mut Self {
            self.bytes.push(opcode);
            self
        }

        pub fn put(&mut self) -> u8 {
            let index = self.next_memo;
            self.bytes.extend([op::BINPUT, index]);
            self.next_memo += 1;
            index
        }

        pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
            self.bytes.push(op::GLOBAL);
            self.bytes.extend(format!("{}\n{}\n", module, name).bytes());
            self
        }

        pub fn int(&mut self, v: u8) -> &mut Self {
            self.bytes.extend([op::BININT1, v]);
            self
        }

        pub fn string(&mut self, s: &[u8]) -> &mut Self {
            if s.len() < 256 {
                self.bytes.extend([op::SHORT_BINSTRING, s.len() as u8]);
            } else {
                self.bytes.push(op::BINSTRING);
                self.bytes.extend((s.len() as u32).to_le_bytes());
            }
            self.bytes.extend(s);
            self
        }

        /// An ndarray with a fresh dtype, leaving it on the stack
        pub fn ndarray(&mut self, shape: &[u16], descr: &str, data: &[u8]) -> &mut Self {
            self.global("numpy.core.multiarray", "_reconstruct");
            self.global("numpy", "ndarray");
            self.op(op::MARK).int(0).op(op::TUPLE);
            self.string(b"b").op(op::TUPLE3).op(op::REDUCE);
            self.put();
            self.op(op::MARK).int(1).op(op::MARK);
            for &d in shape {
                self.bytes.push(op::BININT2);
                self.bytes.extend(d.to_le_bytes());
            }
            self.op(op::TUPLE);
            self.global("numpy", "dtype");
            self.string(descr.as_bytes()).int(0).int(1).op(op::TUPLE3).op(op::REDUCE);
            self.put();
            self.op(op::MARK).int(3).string(b"<").op(op::NONE).op(op::NONE).op(op::NONE);
            self.int(255).int(255).int(0).op(op::TUPLE).op(op::BUILD);
            self.op(op::NEWFALSE).string(data).op(op::TUPLE).op(op::BUILD);
            self
        }

        pub fn finish(&mut self) -> Vec<u8> {
            self.bytes.push(op::STOP);
            self.bytes.clone()
        }
    }

    #[test]
    fn test_scalars_and_containers() {
        let mut data = vec![op::PROTO, 4, op::MARK];
        data.extend([op::BININT1, 7, op::BININT2, 0x34, 0x12]);
        data.push(op::BININT);
        data.extend((-5i32).to_le_bytes());
        data.extend([op::LONG1, 2, 0xff, 0x7f]);
        data.push(op::BINFLOAT);
        data.extend(1.5f64.to_be_bytes());
        data.extend([op::SHORT_BINUNICODE, 2, b'h', b'i']);
        data.extend([op::NONE, op::NEWTRUE, op::TUPLE]);
        data.push(op::STOP);

        let obj = from_slice(&data).unwrap();
        assert_eq!(
            obj,
            Object::Tuple(vec![
                Object::Int(7),
                Object::Int(0x1234),
                Object::Int(-5),
                Object::Int(0x7fff),
                Object::Float(1.5),
                Object::Str("hi".to_string()),
                Object::None,
                Object::Bool(true),
            ])
        );
    }

    #[test]
    fn test_lists_dicts_and_memo() {
        let mut data = vec![op::PROTO, 2, op::EMPTY_LIST, op::BINPUT, 0, op::MARK];
        data.extend([op::BININT1, 1, op::BININT1, 2, op::APPENDS]);
        data.extend([op::BININT1, 3, op::APPEND]);
        data.extend([op::EMPTY_DICT, op::SHORT_BINBYTES, 1, b'k', op::BINGET, 0, op::SETITEM]);
        data.extend([op::TUPLE2, op::STOP]);

        let obj = from_slice(&data).unwrap();
        let items = obj.as_tuple().unwrap();
        assert_eq!(
            items[0],
            Object::List(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
        );
        // memoized before the appends
        assert_eq!(
            items[1],
            Object::Dict(vec![(Object::Bytes(Rc::new(b"k".to_vec())), Object::List(vec![]))])
        );
    }

    #[test]
    fn test_numpy_arrays() {
        let floats = [0.5f32, -1.0, 2.0, 4.0, 8.0, 16.0];
        let float_bytes = floats.iter().flat_map(|f| f.to_le_bytes()).collect::<Vec<_>>();
        let labels = [3i64, -1];
        let label_bytes = labels.iter().flat_map(|l| l.to_le_bytes()).collect::<Vec<_>>();

        let mut w = Writer::new();
        w.ndarray(&[2, 3], "f4", &float_bytes);
        w.ndarray(&[2], "i8", &label_bytes);
        w.op(op::TUPLE2);
        let obj = from_slice(&w.finish()).unwrap();

        let items = obj.as_tuple().unwrap();
        let x = items[0].as_ndarray().unwrap();
        assert_eq!(x.shape, vec![2, 3]);
        assert_eq!(x.dtype.byteorder, Some('<'));
        assert_eq!(x.to_f32().unwrap(), floats.to_vec());
        let y = items[1].as_ndarray().unwrap();
        assert_eq!(y.to_i64().unwrap(), labels.to_vec());
        assert_eq!(y.to_f32().unwrap(), vec![3.0, -1.0]);
        assert!(x.to_i64().is_err());
    }

    #[test]
    fn test_fortran_order_and_big_endian() {
        let array = NdArray {
            shape: vec![2, 3],
            dtype: Dtype {
                kind: 'i',
                size: 2,
                byteorder: Some('>'),
            },
            fortran_order: true,
            // columns (1, 4), (2, 5), (3, 6)
            data: Rc::new([1i16, 4, 2, 5, 3, 6].iter().flat_map(|v| v.to_be_bytes()).collect()),
        };
        assert_eq!(array.to_i64().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_opaque_reduce() {
        let mut w = Writer::new();
        w.global("collections", "OrderedDict").op(op::EMPTY_TUPLE).op(op::REDUCE);
        let obj = from_slice(&w.finish()).unwrap();
        assert!(matches!(obj, Object::Reduce { state: None, .. }));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            from_slice(&[op::PROTO, 2, op::BININT1]),
            Err(PickleError::UnexpectedEof { offset: 3 })
        ));
        assert!(matches!(
            from_slice(&[op::PROTO, 2, 0xff]),
            Err(PickleError::UnknownOpcode { opcode: 0xff, offset: 2 })
        ));
        assert!(matches!(
            from_slice(&[op::STOP]),
            Err(PickleError::StackUnderflow { opcode: op::STOP })
        ));
        assert!(matches!(
            from_slice(&[op::BINGET, 3, op::STOP]),
            Err(PickleError::InvalidMemo { index: 3 })
        ));
        assert!(matches!(from_slice(&[op::TUPLE, op::STOP]), Err(PickleError::MissingMark)));

        // data length does not match the shape
        let mut w = Writer::new();
        w.ndarray(&[3], "f4", &[0; 8]);
        let obj = from_slice(&w.finish()).unwrap();
        assert!(obj.as_ndarray().unwrap().to_f32().is_err());
    }
}
