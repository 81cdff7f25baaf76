//! Reader for the subset of Python's pickle format needed to load numpy
//! arrays nested in tuples, lists and dicts.
//!
//! Python 2 byte strings (`STRING`, `BINSTRING`, `SHORT_BINSTRING`) are kept as
//! raw bytes. That is the same thing as decoding them as Latin-1, which is how
//! numpy data pickled under Python 2 has to be read. Python 3 pickles route
//! byte payloads through `_codecs.encode(text, "latin1")`, which is undone here.

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::collections::HashMap;
use std::io::{self, Read};
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Unsupported opcode 0x{0:02x}")]
    Opcode(u8),
    #[error("Unsupported protocol {0}")]
    Protocol(u8),
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Mark not found")]
    NoMark,
    #[error("Memo slot {0} is empty")]
    Memo(u32),
    #[error("Unsupported global: {module}.{name}")]
    Global { module: String, name: String },
    #[error("Unsupported dtype: {0}")]
    Dtype(String),
    #[error("Malformed pickle: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::Malformed(msg.into())
}

const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const FLOAT: u8 = b'F';
const INT: u8 = b'I';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const LONG: u8 = b'L';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const STRING: u8 = b'S';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const EMPTY_DICT: u8 = b'}';
const APPENDS: u8 = b'e';
const GET: u8 = b'g';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const LIST: u8 = b'l';
const EMPTY_LIST: u8 = b']';
const PUT: u8 = b'p';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';
const BINFLOAT: u8 = b'G';
const REDUCE: u8 = b'R';
const PROTO: u8 = 0x80;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;

const HIGHEST_PROTOCOL: u8 = 5;

/// Numpy scalar types that can be decoded from an array buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl Scalar {
    pub fn size(&self) -> usize {
        match self {
            Scalar::Bool | Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::I64 | Scalar::U64 | Scalar::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    scalar: Scalar,
    big_endian: bool,
}

impl Dtype {
    /// Parses a numpy type string such as `f4`, `<i8` or `|u1`.
    pub fn parse(code: &str) -> Result<Dtype, Error> {
        let bad = || Error::Dtype(code.to_string());
        let (big_endian, rest) = match code.as_bytes().first() {
            Some(b'>') => (true, &code[1..]),
            Some(b'<' | b'|') => (false, &code[1..]),
            Some(b'=') => (cfg!(target_endian = "big"), &code[1..]),
            _ => (cfg!(target_endian = "big"), code),
        };
        let scalar = match rest {
            "b1" | "?" => Scalar::Bool,
            "i1" => Scalar::I8,
            "i2" => Scalar::I16,
            "i4" => Scalar::I32,
            "i8" => Scalar::I64,
            "u1" => Scalar::U8,
            "u2" => Scalar::U16,
            "u4" => Scalar::U32,
            "u8" => Scalar::U64,
            "f4" => Scalar::F32,
            "f8" => Scalar::F64,
            _ => return Err(bad()),
        };
        Ok(Dtype { scalar, big_endian })
    }

    pub fn scalar(&self) -> Scalar {
        self.scalar
    }

    pub fn size(&self) -> usize {
        self.scalar.size()
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    fn set_order(&mut self, order: &[u8]) -> Result<(), Error> {
        match order {
            b">" => self.big_endian = true,
            b"<" => self.big_endian = false,
            b"=" => self.big_endian = cfg!(target_endian = "big"),
            // not applicable, single byte types
            b"|" => {}
            _ => return Err(malformed("dtype byte order")),
        }
        Ok(())
    }

    fn decode<T: Element>(&self, c: &[u8]) -> T {
        macro_rules! num {
            ($t:ty, $conv:ident) => {{
                let mut b = [0u8; std::mem::size_of::<$t>()];
                b.copy_from_slice(c);
                let v = if self.big_endian {
                    <$t>::from_be_bytes(b)
                } else {
                    <$t>::from_le_bytes(b)
                };
                T::$conv(v.into())
            }};
        }
        match self.scalar {
            Scalar::Bool => T::from_i64(i64::from(c[0] != 0)),
            Scalar::I8 => num!(i8, from_i64),
            Scalar::I16 => num!(i16, from_i64),
            Scalar::I32 => num!(i32, from_i64),
            Scalar::I64 => num!(i64, from_i64),
            Scalar::U8 => num!(u8, from_i64),
            Scalar::U16 => num!(u16, from_i64),
            Scalar::U32 => num!(u32, from_i64),
            Scalar::U64 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                let v = if self.big_endian {
                    u64::from_be_bytes(b)
                } else {
                    u64::from_le_bytes(b)
                };
                T::from_i64(v as i64)
            }
            Scalar::F32 => num!(f32, from_f64),
            Scalar::F64 => num!(f64, from_f64),
        }
    }
}

/// Element types a [`RawArray`] can be cast into. Casts follow `as` semantics.
pub trait Element: Copy {
    fn from_f64(v: f64) -> Self;
    fn from_i64(v: i64) -> Self;
}

impl Element for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn from_i64(v: i64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
    fn from_i64(v: i64) -> Self {
        v as f64
    }
}

impl Element for i64 {
    fn from_f64(v: f64) -> Self {
        v as i64
    }
    fn from_i64(v: i64) -> Self {
        v
    }
}

/// A numpy array as stored in the pickle: shape, element type, memory order
/// and the raw buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub fortran: bool,
    pub data: Vec<u8>,
}

impl RawArray {
    /// Number of elements, `None` when the shape overflows `usize`.
    pub fn len(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }

    pub fn is_empty(&self) -> bool {
        self.shape.contains(&0)
    }

    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>, Error> {
        let size = self.dtype.size();
        let bytes = self
            .len()
            .and_then(|n| n.checked_mul(size))
            .ok_or_else(|| malformed(format!("shape {:?} overflows", self.shape)))?;
        if self.data.len() != bytes {
            return Err(malformed(format!(
                "buffer of {} bytes for shape {:?} of {:?}",
                self.data.len(),
                self.shape,
                self.dtype.scalar
            )));
        }
        let values: Vec<T> = self
            .data
            .chunks_exact(size)
            .map(|c| self.dtype.decode(c))
            .collect();

        let dim = IxDyn(&self.shape);
        let arr = if self.fortran {
            ArrayD::from_shape_vec(dim.f(), values)
        } else {
            ArrayD::from_shape_vec(dim, values)
        };
        arr.map_err(|e| malformed(e.to_string()))
    }
}

/// Decoded pickle object tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Dtype(Dtype),
    Array(RawArray),
}

impl Value {
    pub fn into_tuple(self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<RawArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

/// Stack entries. Numpy objects live in an arena so that memo copies keep
/// sharing them when `BUILD` fills them in later.
#[derive(Debug, Clone)]
enum Node {
    Mark,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Rc<Vec<u8>>),
    Str(String),
    Tuple(Vec<Node>),
    List(Vec<Node>),
    Dict(Vec<(Node, Node)>),
    Global { module: String, name: String },
    Obj(usize),
}

impl Node {
    fn as_int(&self) -> Option<i64> {
        match self {
            Node::Int(i) => Some(*i),
            Node::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<Vec<u8>> {
        match self {
            Node::Bytes(b) => Some(b.to_vec()),
            Node::Str(s) => latin1_encode(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ArrayState {
    shape: Vec<usize>,
    dtype: Dtype,
    fortran: bool,
    data: Rc<Vec<u8>>,
}

#[derive(Debug)]
enum Object {
    Dtype(Dtype),
    /// `None` until `BUILD` provides the state, or once its last reference is resolved.
    Array(Option<ArrayState>),
}

fn latin1_encode(s: &str) -> Option<Vec<u8>> {
    s.chars().map(|c| u8::try_from(c).ok()).collect()
}

fn decode_long(bytes: &[u8]) -> Result<i64, Error> {
    if bytes.len() > 8 {
        return Err(malformed("integer wider than 64 bits"));
    }
    let fill = match bytes.last() {
        Some(b) if b & 0x80 != 0 => 0xff,
        _ => 0,
    };
    let mut b = [fill; 8];
    b[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(b))
}

/// Decodes a Python 2 `repr` string literal, as written by the text `STRING` opcode.
fn unescape(line: &[u8]) -> Result<Vec<u8>, Error> {
    let inner = match line {
        [q @ (b'\'' | b'"'), inner @ .., e] if q == e => inner,
        _ => return Err(malformed("unquoted STRING")),
    };
    let mut out = Vec::with_capacity(inner.len());
    let mut it = inner.iter().copied().peekable();
    while let Some(b) = it.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let esc = it.next().ok_or_else(|| malformed("dangling escape"))?;
        let v = match esc {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'\\' | b'\'' | b'"' => esc,
            b'x' => {
                let hex = [
                    it.next().ok_or_else(|| malformed("short \\x escape"))?,
                    it.next().ok_or_else(|| malformed("short \\x escape"))?,
                ];
                std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| malformed("bad \\x escape"))?
            }
            b'0'..=b'7' => {
                let mut v = u32::from(esc - b'0');
                for _ in 0..2 {
                    match it.peek() {
                        Some(d @ b'0'..=b'7') => {
                            v = v * 8 + u32::from(d - b'0');
                            it.next();
                        }
                        _ => break,
                    }
                }
                u8::try_from(v).map_err(|_| malformed("octal escape out of range"))?
            }
            _ => return Err(malformed(format!("unknown escape \\{}", esc as char))),
        };
        out.push(v);
    }
    Ok(out)
}

fn parse_text<T: std::str::FromStr>(line: &[u8], what: &str) -> Result<T, Error> {
    std::str::from_utf8(line)
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(format!("bad {what} literal")))
}

/// Stack machine executing pickle opcodes up to `STOP`.
pub struct Unpickler<R> {
    r: R,
    stack: Vec<Node>,
    memo: HashMap<u32, Node>,
    objects: Vec<Object>,
}

/// Reads one pickled object from `r`.
pub fn from_reader<R: Read>(r: R) -> Result<Value, Error> {
    Unpickler::new(r).load()
}

impl<R: Read> Unpickler<R> {
    pub fn new(r: R) -> Self {
        Self {
            r,
            stack: vec![],
            memo: Default::default(),
            objects: vec![],
        }
    }

    pub fn load(mut self) -> Result<Value, Error> {
        loop {
            let op = self.read_u8()?;
            if op == STOP {
                break;
            }
            self.step(op)?;
        }
        let root = self.pop()?;

        // Release memo references so array buffers can be moved out.
        self.memo.clear();
        self.stack.clear();
        Resolver::new(&root, self.objects).resolve(root)
    }

    fn step(&mut self, op: u8) -> Result<(), Error> {
        match op {
            PROTO => {
                let v = self.read_u8()?;
                if v > HIGHEST_PROTOCOL {
                    return Err(Error::Protocol(v));
                }
            }
            FRAME => {
                self.read_array::<8>()?;
            }
            MARK => self.stack.push(Node::Mark),
            POP => {
                self.pop()?;
            }
            POP_MARK => {
                self.pop_mark()?;
            }
            DUP => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }

            NONE => self.stack.push(Node::None),
            NEWTRUE => self.stack.push(Node::Bool(true)),
            NEWFALSE => self.stack.push(Node::Bool(false)),
            INT => {
                let line = self.read_line()?;
                let node = match line.as_slice() {
                    b"01" => Node::Bool(true),
                    b"00" => Node::Bool(false),
                    l => Node::Int(parse_text(l, "INT")?),
                };
                self.stack.push(node);
            }
            LONG => {
                let mut line = self.read_line()?;
                if line.last() == Some(&b'L') {
                    line.pop();
                }
                self.stack.push(Node::Int(parse_text(&line, "LONG")?));
            }
            BININT => {
                let v = i32::from_le_bytes(self.read_array()?);
                self.stack.push(Node::Int(v.into()));
            }
            BININT1 => {
                let v = self.read_u8()?;
                self.stack.push(Node::Int(v.into()));
            }
            BININT2 => {
                let v = u16::from_le_bytes(self.read_array()?);
                self.stack.push(Node::Int(v.into()));
            }
            LONG1 => {
                let n = self.read_u8()?;
                let bytes = self.read_bytes(n.into())?;
                self.stack.push(Node::Int(decode_long(&bytes)?));
            }
            LONG4 => {
                let n = self.read_len_i32()?;
                let bytes = self.read_bytes(n)?;
                self.stack.push(Node::Int(decode_long(&bytes)?));
            }
            FLOAT => {
                let line = self.read_line()?;
                self.stack.push(Node::Float(parse_text(&line, "FLOAT")?));
            }
            BINFLOAT => {
                let v = f64::from_be_bytes(self.read_array()?);
                self.stack.push(Node::Float(v));
            }

            STRING => {
                let line = self.read_line()?;
                self.push_bytes(unescape(&line)?);
            }
            BINSTRING => {
                let n = self.read_len_i32()?;
                let b = self.read_bytes(n)?;
                self.push_bytes(b);
            }
            SHORT_BINSTRING | SHORT_BINBYTES => {
                let n = self.read_u8()?;
                let b = self.read_bytes(n.into())?;
                self.push_bytes(b);
            }
            BINBYTES => {
                let n = u32::from_le_bytes(self.read_array()?);
                let b = self.read_bytes(n.into())?;
                self.push_bytes(b);
            }
            BINBYTES8 => {
                let n = u64::from_le_bytes(self.read_array()?);
                let b = self.read_bytes(n)?;
                self.push_bytes(b);
            }
            BINUNICODE => {
                let n = u32::from_le_bytes(self.read_array()?);
                self.push_unicode(n.into())?;
            }
            SHORT_BINUNICODE => {
                let n = self.read_u8()?;
                self.push_unicode(n.into())?;
            }
            BINUNICODE8 => {
                let n = u64::from_le_bytes(self.read_array()?);
                self.push_unicode(n)?;
            }

            EMPTY_TUPLE => self.stack.push(Node::Tuple(vec![])),
            TUPLE => {
                let items = self.pop_mark()?;
                self.stack.push(Node::Tuple(items));
            }
            TUPLE1 | TUPLE2 | TUPLE3 => {
                let n = usize::from(op - TUPLE1 + 1);
                if self.stack.len() < n {
                    return Err(Error::StackUnderflow);
                }
                let items = self.stack.split_off(self.stack.len() - n);
                if items.iter().any(|i| matches!(i, Node::Mark)) {
                    return Err(malformed("mark inside tuple"));
                }
                self.stack.push(Node::Tuple(items));
            }

            EMPTY_LIST => self.stack.push(Node::List(vec![])),
            LIST => {
                let items = self.pop_mark()?;
                self.stack.push(Node::List(items));
            }
            APPEND => {
                let v = self.pop()?;
                self.list_mut()?.push(v);
            }
            APPENDS => {
                let items = self.pop_mark()?;
                self.list_mut()?.extend(items);
            }

            EMPTY_DICT => self.stack.push(Node::Dict(vec![])),
            DICT => {
                let items = self.pop_mark()?;
                let pairs = pairs(items)?;
                self.stack.push(Node::Dict(pairs));
            }
            SETITEM => {
                let v = self.pop()?;
                let k = self.pop()?;
                self.dict_mut()?.push((k, v));
            }
            SETITEMS => {
                let items = self.pop_mark()?;
                let pairs = pairs(items)?;
                self.dict_mut()?.extend(pairs);
            }

            GLOBAL => {
                let module = String::from_utf8_lossy(&self.read_line()?).into_owned();
                let name = String::from_utf8_lossy(&self.read_line()?).into_owned();
                self.stack.push(Node::Global { module, name });
            }
            STACK_GLOBAL => {
                let name = self.pop()?;
                let module = self.pop()?;
                match (module, name) {
                    (Node::Str(module), Node::Str(name)) => {
                        self.stack.push(Node::Global { module, name })
                    }
                    _ => return Err(malformed("STACK_GLOBAL expects two strings")),
                }
            }
            REDUCE => {
                let args = self.pop()?;
                let callable = self.pop()?;
                let node = self.reduce(callable, args)?;
                self.stack.push(node);
            }
            BUILD => {
                let state = self.pop()?;
                let target = self.top()?.clone();
                self.build(target, state)?;
            }

            PUT => {
                let idx = parse_text(&self.read_line()?, "PUT")?;
                self.put(idx)?;
            }
            BINPUT => {
                let idx = self.read_u8()?;
                self.put(idx.into())?;
            }
            LONG_BINPUT => {
                let idx = u32::from_le_bytes(self.read_array()?);
                self.put(idx)?;
            }
            MEMOIZE => {
                let idx = self.memo.len() as u32;
                self.put(idx)?;
            }
            GET => {
                let idx = parse_text(&self.read_line()?, "GET")?;
                self.get(idx)?;
            }
            BINGET => {
                let idx = self.read_u8()?;
                self.get(idx.into())?;
            }
            LONG_BINGET => {
                let idx = u32::from_le_bytes(self.read_array()?);
                self.get(idx)?;
            }

            _ => return Err(Error::Opcode(op)),
        }
        Ok(())
    }

    fn reduce(&mut self, callable: Node, args: Node) -> Result<Node, Error> {
        let (module, name) = match callable {
            Node::Global { module, name } => (module, name),
            _ => return Err(malformed("REDUCE on a non-global")),
        };
        let args = match args {
            Node::Tuple(args) => args,
            _ => return Err(malformed("REDUCE arguments are not a tuple")),
        };

        match (module.as_str(), name.as_str()) {
            ("numpy.core.multiarray" | "numpy._core.multiarray", "_reconstruct") => {
                Ok(self.alloc(Object::Array(None)))
            }
            ("numpy", "dtype") => {
                let code = args
                    .first()
                    .and_then(Node::as_text)
                    .ok_or_else(|| malformed("dtype without a type string"))?;
                let code = String::from_utf8_lossy(&code).into_owned();
                Ok(self.alloc(Object::Dtype(Dtype::parse(&code)?)))
            }
            ("_codecs", "encode") => match args.as_slice() {
                [Node::Str(s), Node::Str(enc)] if matches!(enc.as_str(), "latin1" | "latin-1") => {
                    let b = latin1_encode(s).ok_or_else(|| malformed("text is not latin-1"))?;
                    Ok(Node::Bytes(Rc::new(b)))
                }
                _ => Err(malformed("unsupported _codecs.encode call")),
            },
            _ => Err(Error::Global { module, name }),
        }
    }

    fn build(&mut self, target: Node, state: Node) -> Result<(), Error> {
        let idx = match target {
            Node::Obj(idx) => idx,
            _ => return Err(malformed("BUILD on a plain value")),
        };
        let state = match state {
            Node::Tuple(s) => s,
            _ => return Err(malformed("BUILD state is not a tuple")),
        };

        let built = match &self.objects[idx] {
            Object::Dtype(d) => {
                let mut d = *d;
                let order = state
                    .get(1)
                    .and_then(Node::as_text)
                    .ok_or_else(|| malformed("dtype state without byte order"))?;
                d.set_order(&order)?;
                Object::Dtype(d)
            }
            Object::Array(_) => Object::Array(Some(self.array_state(state)?)),
        };
        self.objects[idx] = built;
        Ok(())
    }

    /// `(version, shape, dtype, is_fortran, rawdata)`, version being optional.
    fn array_state(&self, mut state: Vec<Node>) -> Result<ArrayState, Error> {
        if state.len() == 5 {
            state.remove(0);
        }
        let [shape, dtype, fortran, data]: [Node; 4] = state
            .try_into()
            .map_err(|_| malformed("array state has the wrong arity"))?;

        let shape = match shape {
            Node::Tuple(dims) => dims
                .iter()
                .map(|d| d.as_int().and_then(|d| usize::try_from(d).ok()))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| malformed("array shape"))?,
            _ => return Err(malformed("array shape is not a tuple")),
        };
        let dtype = match dtype {
            Node::Obj(i) => match &self.objects[i] {
                Object::Dtype(d) => *d,
                _ => return Err(malformed("array dtype is not a dtype")),
            },
            _ => return Err(malformed("array dtype is not a dtype")),
        };
        let fortran = fortran
            .as_int()
            .map(|f| f != 0)
            .ok_or_else(|| malformed("array order flag"))?;
        let data = match data {
            Node::Bytes(b) => b,
            Node::Str(s) => Rc::new(latin1_encode(&s).ok_or_else(|| malformed("text is not latin-1"))?),
            _ => return Err(malformed("object arrays are not supported")),
        };

        Ok(ArrayState {
            shape,
            dtype,
            fortran,
            data,
        })
    }

    fn alloc(&mut self, o: Object) -> Node {
        self.objects.push(o);
        Node::Obj(self.objects.len() - 1)
    }

    fn put(&mut self, idx: u32) -> Result<(), Error> {
        let top = self.top()?.clone();
        self.memo.insert(idx, top);
        Ok(())
    }

    fn get(&mut self, idx: u32) -> Result<(), Error> {
        let v = self.memo.get(&idx).ok_or(Error::Memo(idx))?.clone();
        self.stack.push(v);
        Ok(())
    }

    fn top(&self) -> Result<&Node, Error> {
        self.stack.last().ok_or(Error::StackUnderflow)
    }

    fn pop(&mut self) -> Result<Node, Error> {
        match self.stack.pop() {
            Some(Node::Mark) => Err(malformed("unexpected mark")),
            Some(n) => Ok(n),
            None => Err(Error::StackUnderflow),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Node>, Error> {
        let pos = self
            .stack
            .iter()
            .rposition(|n| matches!(n, Node::Mark))
            .ok_or(Error::NoMark)?;
        let items = self.stack.split_off(pos + 1);
        self.stack.pop();
        Ok(items)
    }

    fn list_mut(&mut self) -> Result<&mut Vec<Node>, Error> {
        match self.stack.last_mut() {
            Some(Node::List(l)) => Ok(l),
            _ => Err(malformed("append to a non-list")),
        }
    }

    fn dict_mut(&mut self) -> Result<&mut Vec<(Node, Node)>, Error> {
        match self.stack.last_mut() {
            Some(Node::Dict(d)) => Ok(d),
            _ => Err(malformed("set item on a non-dict")),
        }
    }

    fn push_bytes(&mut self, b: Vec<u8>) {
        self.stack.push(Node::Bytes(Rc::new(b)));
    }

    fn push_unicode(&mut self, n: u64) -> Result<(), Error> {
        let b = self.read_bytes(n)?;
        let s = String::from_utf8(b).map_err(|_| malformed("invalid utf-8 string"))?;
        self.stack.push(Node::Str(s));
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut b = [0u8; N];
        self.r.read_exact(&mut b)?;
        Ok(b)
    }

    fn read_len_i32(&mut self) -> Result<u64, Error> {
        let n = i32::from_le_bytes(self.read_array()?);
        u64::try_from(n).map_err(|_| malformed("negative length"))
    }

    fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>, Error> {
        let mut buf = vec![];
        (&mut self.r).take(n).read_to_end(&mut buf)?;
        if buf.len() as u64 != n {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(buf)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut line = vec![];
        loop {
            match self.read_u8()? {
                b'\n' => break,
                b => line.push(b),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }
}

fn pairs(items: Vec<Node>) -> Result<Vec<(Node, Node)>, Error> {
    if items.len() % 2 != 0 {
        return Err(malformed("odd number of dict items"));
    }
    let mut it = items.into_iter();
    let mut out = vec![];
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        out.push((k, v));
    }
    Ok(out)
}

/// Number of times each object is referenced from `node`.
fn count_refs(node: &Node, refs: &mut [usize]) {
    match node {
        Node::Obj(i) => {
            if let Some(r) = refs.get_mut(*i) {
                *r += 1;
            }
        }
        Node::Tuple(items) | Node::List(items) => {
            items.iter().for_each(|n| count_refs(n, refs));
        }
        Node::Dict(d) => {
            for (k, v) in d {
                count_refs(k, refs);
                count_refs(v, refs);
            }
        }
        _ => {}
    }
}

/// Turns the finished node tree into values. An array referenced from several
/// places is copied for all but its last reference, which takes the buffer.
struct Resolver {
    objects: Vec<Object>,
    refs: Vec<usize>,
}

impl Resolver {
    fn new(root: &Node, objects: Vec<Object>) -> Self {
        let mut refs = vec![0; objects.len()];
        count_refs(root, &mut refs);
        Self { objects, refs }
    }

    fn resolve_all(&mut self, nodes: Vec<Node>) -> Result<Vec<Value>, Error> {
        nodes.into_iter().map(|n| self.resolve(n)).collect()
    }

    fn resolve(&mut self, node: Node) -> Result<Value, Error> {
        Ok(match node {
            Node::Mark => return Err(malformed("mark left on the stack")),
            Node::None => Value::None,
            Node::Bool(b) => Value::Bool(b),
            Node::Int(i) => Value::Int(i),
            Node::Float(f) => Value::Float(f),
            Node::Bytes(b) => Value::Bytes(Rc::try_unwrap(b).unwrap_or_else(|b| b.to_vec())),
            Node::Str(s) => Value::Str(s),
            Node::Tuple(t) => Value::Tuple(self.resolve_all(t)?),
            Node::List(l) => Value::List(self.resolve_all(l)?),
            Node::Dict(d) => {
                let mut out = Vec::with_capacity(d.len());
                for (k, v) in d {
                    out.push((self.resolve(k)?, self.resolve(v)?));
                }
                Value::Dict(out)
            }
            Node::Global { module, name } => return Err(Error::Global { module, name }),
            Node::Obj(i) => match self.objects.get_mut(i) {
                Some(Object::Dtype(d)) => Value::Dtype(*d),
                Some(Object::Array(state)) => {
                    self.refs[i] = self.refs[i].saturating_sub(1);
                    let s = if self.refs[i] == 0 {
                        state.take()
                    } else {
                        state.clone()
                    };
                    let s = s.ok_or_else(|| malformed("array without state"))?;
                    Value::Array(RawArray {
                        shape: s.shape,
                        dtype: s.dtype,
                        fortran: s.fortran,
                        data: Rc::try_unwrap(s.data).unwrap_or_else(|d| d.to_vec()),
                    })
                }
                None => return Err(malformed("dangling object reference")),
            },
        })
    }
}

#[cfg(test)]
mod test {
    use crate::data::fixture::Pickler;
    use crate::data::pickle::{from_reader, Dtype, Error, RawArray, Scalar, Value};
    use ndarray::{arr2, ArrayD};

    fn load(bytes: &[u8]) -> Result<Value, Error> {
        from_reader(bytes)
    }

    #[test]
    fn test_dtype_parse() {
        let d = Dtype::parse("<f4").unwrap();
        assert_eq!(d.scalar(), Scalar::F32);
        assert!(!d.is_big_endian());
        assert_eq!(Dtype::parse(">i8").unwrap().size(), 8);
        assert!(Dtype::parse(">i8").unwrap().is_big_endian());
        assert_eq!(Dtype::parse("|u1").unwrap().scalar(), Scalar::U8);
        assert!(matches!(Dtype::parse("c16"), Err(Error::Dtype(_))));
    }

    #[test]
    fn test_scalars_and_containers() {
        let mut p = Pickler::new(2);
        p.mark();
        p.int(7);
        p.int(300);
        p.int(-2);
        p.raw(&[0x8a, 0x02, 0x00, 0x80]); // LONG1 -32768
        p.raw(b"G");
        p.raw(&1.5f64.to_be_bytes());
        p.raw(b"N\x88");
        p.unicode("h\u{e9}llo");
        p.raw(b"t");
        p.raw(b"}q\x01");
        p.unicode("k");
        p.raw(b"]K\x01\x86s\x86");
        p.stop();

        let expected = Value::Tuple(vec![
            Value::Tuple(vec![
                Value::Int(7),
                Value::Int(300),
                Value::Int(-2),
                Value::Int(-32768),
                Value::Float(1.5),
                Value::None,
                Value::Bool(true),
                Value::Str("h\u{e9}llo".into()),
            ]),
            Value::Dict(vec![(
                Value::Str("k".into()),
                Value::Tuple(vec![Value::List(vec![]), Value::Int(1)]),
            )]),
        ]);
        assert_eq!(load(p.bytes()).unwrap(), expected);
    }

    #[test]
    fn test_py2_array_latin1_bytes() {
        let data: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut p = Pickler::new(2);
        p.array(&[2, 3], "f4", "<", &data);
        p.stop();

        let arr = load(p.bytes()).unwrap().into_array().unwrap();
        assert_eq!(arr.shape, vec![2, 3]);
        assert_eq!(arr.dtype.scalar(), Scalar::F32);
        let a: ArrayD<f32> = arr.to_array().unwrap();
        assert_eq!(a, arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn());
    }

    #[test]
    fn test_shared_dtype_keeps_byte_order() {
        let be: Vec<u8> = [1i64, -2].iter().flat_map(|v| v.to_be_bytes()).collect();
        let mut p = Pickler::new(2);
        p.mark();
        p.array(&[2], "i8", ">", &be);
        // second array refers to the memoized dtype
        p.array_with_memo_dtype(&[2], &be);
        p.raw(b"t");
        p.stop();

        let v = load(p.bytes()).unwrap().into_tuple().unwrap();
        for a in v {
            let a: ArrayD<i64> = a.into_array().unwrap().to_array().unwrap();
            assert_eq!(a.as_slice().unwrap(), &[1, -2]);
        }
    }

    #[test]
    fn test_codecs_encode_latin1() {
        let mut p = Pickler::new(2);
        p.global("_codecs", "encode");
        p.unicode("\u{ff}\u{0}A");
        p.unicode("latin1");
        p.raw(b"\x86R.");
        assert_eq!(load(p.bytes()).unwrap(), Value::Bytes(vec![0xff, 0x00, b'A']));
    }

    #[test]
    fn test_protocol0_string() {
        let bytes = b"(S'a\\x00\\n\\'b'\np0\nI01\ng0\ntp1\n.";
        let v = load(bytes).unwrap();
        assert_eq!(
            v,
            Value::Tuple(vec![
                Value::Bytes(b"a\x00\n'b".to_vec()),
                Value::Bool(true),
                Value::Bytes(b"a\x00\n'b".to_vec()),
            ])
        );
    }

    #[test]
    fn test_fortran_order() {
        let data: Vec<u8> = [1u8, 2, 3, 4, 5, 6].to_vec();
        let raw = RawArray {
            shape: vec![2, 3],
            dtype: Dtype::parse("|u1").unwrap(),
            fortran: true,
            data,
        };
        let a: ArrayD<f64> = raw.to_array().unwrap();
        assert_eq!(a, arr2(&[[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]).into_dyn());
    }

    #[test]
    fn test_buffer_size_mismatch() {
        let raw = RawArray {
            shape: vec![3],
            dtype: Dtype::parse("<f4").unwrap(),
            fortran: false,
            data: vec![0; 8],
        };
        assert!(matches!(raw.to_array::<f32>(), Err(Error::Malformed(_))));
        assert_eq!(raw.len(), Some(3));
    }

    #[test]
    fn test_huge_shape_is_rejected() {
        let mut p = Pickler::new(2);
        p.array(&[1 << 40, 1 << 40], "f4", "<", &[0; 16]);
        p.stop();
        let arr = load(p.bytes()).unwrap().into_array().unwrap();
        assert_eq!(arr.len(), None);
        assert!(matches!(arr.to_array::<f32>(), Err(Error::Malformed(_))));

        // element count fits, byte count does not
        let raw = RawArray {
            shape: vec![1 << 62],
            dtype: Dtype::parse("<f4").unwrap(),
            fortran: false,
            data: vec![0; 16],
        };
        assert!(matches!(raw.to_array::<f32>(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_array_referenced_twice() {
        let data: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut p = Pickler::new(2);
        p.array(&[2], "f4", "<", &data);
        p.raw(b"q\x10h\x10\x86");
        p.stop();

        let v = load(p.bytes()).unwrap().into_tuple().unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0], v[1]);
        let a: ArrayD<f32> = v[1].clone().into_array().unwrap().to_array().unwrap();
        assert_eq!(a.as_slice().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(load(b"\x80\x02K\x01"), Err(Error::Io(_))));
        assert!(matches!(load(b"\x80\x09."), Err(Error::Protocol(9))));
        assert!(matches!(load(b"\xff"), Err(Error::Opcode(0xff))));
        assert!(matches!(load(b"h\x05."), Err(Error::Memo(5))));
        assert!(matches!(load(b"t."), Err(Error::NoMark)));
        assert!(matches!(
            load(b"cos\nsystem\n(S'ls'\ntR."),
            Err(Error::Global { .. })
        ));
    }
}
