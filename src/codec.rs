//! Binary serialization of code objects.
//!
//! ## Wire format
//!
//! All words are 32-bit little-endian.
//!
//! ```text
//! File:        magic(word = 0x0001_0B0B) | code object
//! Null:        '0'
//! Boolean:     'b' | 0x00 or 0x01
//! Number:      'n' | word (two's complement)
//! String:      's' | byte length(word) | UTF-8 bytes     (names and symbols)
//! Pair:        'p' | car | cdr
//! Instruction: 'i' | word = opcode << 24 | arg & 0xFF_FFFF
//! Sequence:    '[' | payload byte length(word) | elements
//! Code object: 'c' | name(string, "" = none) | args[string]
//!              | constants[value or code object] | varnames[string]
//!              | code[instruction]
//! ```
//!
//! The high half of the magic word is the format version.
//!
//! List spines are written and read in a loop. Car nesting and nested code
//! objects recurse, and both are capped at [`MAX_DEPTH`] levels.
use std::rc::Rc;

use tracing::debug;

use crate::{
    compiler::bytecode::{CodeObject, Constant, Instruction, InvalidCode, Opcode},
    value::Value,
};

pub const MAGIC: u32 = 0x0001_0B0B;
const MAGIC_MARKER: u32 = 0x0B0B;
const VERSION: u32 = 1;

const TAG_NULL: u8 = b'0';
const TAG_BOOLEAN: u8 = b'b';
const TAG_STRING: u8 = b's';
const TAG_NUMBER: u8 = b'n';
const TAG_PAIR: u8 = b'p';
const TAG_INSTR: u8 = b'i';
const TAG_SEQUENCE: u8 = b'[';
const TAG_CODEOBJECT: u8 = b'c';

/// Deepest car nesting, and deepest code object nesting, either direction accepts
pub const MAX_DEPTH: usize = 512;

// Instruction arguments are 24-bit two's complement
const ARG_MIN: i32 = -(1 << 23);
const ARG_MAX: i32 = (1 << 23) - 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("not bytecode: bad magic word {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of input at byte {0}")]
    Truncated(usize),
    #[error("expected {expected} at byte {offset}, found tag {found:#04x}")]
    BadTag {
        expected: &'static str,
        found: u8,
        offset: usize,
    },
    #[error("invalid boolean byte {found:#04x} at byte {offset}")]
    BadBoolean { found: u8, offset: usize },
    #[error("unknown opcode {opcode:#04x} at byte {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("string at byte {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("{0} trailing bytes after the code object")]
    TrailingBytes(usize),
    #[error(transparent)]
    InvalidCode(#[from] InvalidCode),
    #[error("argument {arg} of {opcode} does not fit in 24 bits")]
    ArgumentOutOfRange { opcode: Opcode, arg: i32 },
    #[error("cannot serialize the procedure {0}")]
    UnencodableConstant(String),
    #[error("{0} bytes do not fit a length word")]
    TooLong(usize),
    #[error("nesting deeper than {MAX_DEPTH} levels at byte {offset}")]
    TooDeep { offset: usize },
}

/// Serializes a top-level code object, magic word included
pub fn serialize(code: &CodeObject) -> Result<Vec<u8>, FormatError> {
    code.validate()?;
    let mut writer = Writer::default();
    writer.word(MAGIC);
    writer.code_object(code, 0)?;
    debug!(bytes = writer.buf.len(), "serialized code object");
    Ok(writer.buf)
}

/// Deserializes bytes produced by [`serialize`]. Nothing is returned unless
/// the whole input decodes to a valid code object.
pub fn deserialize(bytes: &[u8]) -> Result<CodeObject, FormatError> {
    let mut reader = Reader::new(bytes);
    let magic = reader.word()?;
    if magic & 0xFFFF != MAGIC_MARKER {
        return Err(FormatError::BadMagic(magic));
    }
    if magic >> 16 != VERSION {
        return Err(FormatError::UnsupportedVersion(magic >> 16));
    }
    let code = reader.code_object(0)?;
    let rest = reader.remaining();
    if rest > 0 {
        return Err(FormatError::TrailingBytes(rest));
    }
    code.validate()?;
    debug!(bytes = bytes.len(), "deserialized code object");
    Ok(code)
}

fn length(len: usize) -> Result<u32, FormatError> {
    u32::try_from(len).map_err(|_| FormatError::TooLong(len))
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn word(&mut self, word: u32) {
        self.buf.extend_from_slice(&word.to_le_bytes());
    }

    fn string(&mut self, string: &str) -> Result<(), FormatError> {
        self.buf.push(TAG_STRING);
        self.word(length(string.len())?);
        self.buf.extend_from_slice(string.as_bytes());
        Ok(())
    }

    // Writes the tag and a placeholder length, patched once the elements are in
    fn sequence<T>(
        &mut self,
        items: &[T],
        mut element: impl FnMut(&mut Self, &T) -> Result<(), FormatError>,
    ) -> Result<(), FormatError> {
        self.buf.push(TAG_SEQUENCE);
        let len_at = self.buf.len();
        self.word(0);
        let start = self.buf.len();
        for item in items {
            element(self, item)?;
        }
        let len = length(self.buf.len() - start)?;
        self.buf[len_at..start].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn value(&mut self, value: &Value, depth: usize) -> Result<(), FormatError> {
        if depth > MAX_DEPTH {
            return Err(FormatError::TooDeep {
                offset: self.buf.len(),
            });
        }
        let mut value = value;
        loop {
            match value {
                Value::Pair(pair) => {
                    self.buf.push(TAG_PAIR);
                    self.value(&pair.car, depth + 1)?;
                    value = &pair.cdr;
                    continue;
                }
                Value::Null => self.buf.push(TAG_NULL),
                Value::Boolean(b) => {
                    self.buf.push(TAG_BOOLEAN);
                    self.buf.push(u8::from(*b));
                }
                Value::Number(n) => {
                    self.buf.push(TAG_NUMBER);
                    self.buf.extend_from_slice(&n.to_le_bytes());
                }
                Value::Symbol(sym) => self.string(sym)?,
                Value::Procedure(proc) => {
                    return Err(FormatError::UnencodableConstant(proc.to_string()))
                }
            }
            return Ok(());
        }
    }

    fn instruction(&mut self, instr: &Instruction) -> Result<(), FormatError> {
        let arg = instr.arg.unwrap_or(0);
        if !(ARG_MIN..=ARG_MAX).contains(&arg) {
            return Err(FormatError::ArgumentOutOfRange {
                opcode: instr.opcode,
                arg,
            });
        }
        self.buf.push(TAG_INSTR);
        // reinterpreting the sign bits is the point of the mask
        let packed = (arg as u32) & 0xFF_FFFF;
        self.word(u32::from(instr.opcode as u8) << 24 | packed);
        Ok(())
    }

    fn code_object(&mut self, code: &CodeObject, depth: usize) -> Result<(), FormatError> {
        if depth > MAX_DEPTH {
            return Err(FormatError::TooDeep {
                offset: self.buf.len(),
            });
        }
        self.buf.push(TAG_CODEOBJECT);
        self.string(code.name.as_deref().unwrap_or(""))?;
        self.sequence(&code.args, |w, arg| w.string(arg))?;
        self.sequence(&code.constants, |w, constant| match constant {
            Constant::Value(value) => w.value(value, 0),
            Constant::Code(code) => w.code_object(code, depth + 1),
        })?;
        self.sequence(&code.varnames, |w, name| w.string(name))?;
        self.sequence(&code.code, Self::instruction)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    // offset of `data` in the whole input, for error reporting
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            base: 0,
        }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(FormatError::Truncated(self.base + self.data.len()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn word(&mut self) -> Result<u32, FormatError> {
        let mut word = [0; 4];
        word.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(word))
    }

    fn tag(&mut self, expected: &'static str, tag: u8) -> Result<(), FormatError> {
        let offset = self.offset();
        match self.u8()? {
            found if found == tag => Ok(()),
            found => Err(FormatError::BadTag {
                expected,
                found,
                offset,
            }),
        }
    }

    // The string payload, after its tag
    fn string_body(&mut self) -> Result<String, FormatError> {
        let len = self.word()? as usize;
        let offset = self.offset();
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| FormatError::InvalidUtf8(offset))
    }

    fn string(&mut self) -> Result<String, FormatError> {
        self.tag("string", TAG_STRING)?;
        self.string_body()
    }

    fn sequence<T>(
        &mut self,
        mut element: impl FnMut(&mut Reader<'a>) -> Result<T, FormatError>,
    ) -> Result<Vec<T>, FormatError> {
        self.tag("sequence", TAG_SEQUENCE)?;
        let len = self.word()? as usize;
        let base = self.offset();
        let mut payload = Reader {
            data: self.take(len)?,
            pos: 0,
            base,
        };
        let mut items = vec![];
        while payload.remaining() > 0 {
            items.push(element(&mut payload)?);
        }
        Ok(items)
    }

    fn value(&mut self, depth: usize) -> Result<Value, FormatError> {
        let offset = self.offset();
        let tag = self.u8()?;
        self.value_body(tag, offset, depth)
    }

    // Collects the cars of a pair chain, then reads whatever ends it
    fn value_body(&mut self, tag: u8, offset: usize, depth: usize) -> Result<Value, FormatError> {
        if depth > MAX_DEPTH {
            return Err(FormatError::TooDeep { offset });
        }
        let (mut tag, mut offset) = (tag, offset);
        let mut cars = vec![];
        while tag == TAG_PAIR {
            cars.push(self.value(depth + 1)?);
            offset = self.offset();
            tag = self.u8()?;
        }
        let tail = self.atom(tag, offset)?;
        Ok(Value::list_with_tail(cars, tail))
    }

    fn atom(&mut self, tag: u8, offset: usize) -> Result<Value, FormatError> {
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOLEAN => {
                let offset = self.offset();
                match self.u8()? {
                    0 => Ok(Value::Boolean(false)),
                    1 => Ok(Value::Boolean(true)),
                    found => Err(FormatError::BadBoolean { found, offset }),
                }
            }
            TAG_NUMBER => Ok(Value::Number(self.word()? as i32)),
            TAG_STRING => Ok(Value::symbol(self.string_body()?)),
            found => Err(FormatError::BadTag {
                expected: "value",
                found,
                offset,
            }),
        }
    }

    // `depth` is the nesting of the code object owning the constant
    fn constant(&mut self, depth: usize) -> Result<Constant, FormatError> {
        let offset = self.offset();
        match self.u8()? {
            TAG_CODEOBJECT => {
                let code = self.code_object_body(depth + 1, offset)?;
                Ok(Constant::Code(Rc::new(code)))
            }
            tag => self.value_body(tag, offset, 0).map(Constant::Value),
        }
    }

    fn instruction(&mut self) -> Result<Instruction, FormatError> {
        self.tag("instruction", TAG_INSTR)?;
        let offset = self.offset();
        let word = self.word()?;
        let byte = (word >> 24) as u8;
        let opcode =
            Opcode::from_byte(byte).ok_or(FormatError::UnknownOpcode { opcode: byte, offset })?;
        // shifting left then arithmetic right sign-extends the low 24 bits
        let arg = ((word << 8) as i32) >> 8;
        Ok(Instruction {
            opcode,
            arg: opcode.takes_arg().then_some(arg),
        })
    }

    fn code_object(&mut self, depth: usize) -> Result<CodeObject, FormatError> {
        let offset = self.offset();
        self.tag("code object", TAG_CODEOBJECT)?;
        self.code_object_body(depth, offset)
    }

    fn code_object_body(&mut self, depth: usize, offset: usize) -> Result<CodeObject, FormatError> {
        if depth > MAX_DEPTH {
            return Err(FormatError::TooDeep { offset });
        }
        let name = self.string()?;
        let args = self.sequence(Self::string)?;
        let constants = self.sequence(|r| r.constant(depth))?;
        let varnames = self.sequence(Self::string)?;
        let code = self.sequence(Self::instruction)?;
        Ok(CodeObject {
            name: (!name.is_empty()).then_some(name),
            args,
            code,
            constants,
            varnames,
        })
    }
}
