//! Format tokens carried by schema leaves
//!
//! A token is either a passthrough marker (`none`/`null`) for raw byte runs or
//! a struct-style layout such as `<H`, `<ff` or `16s`: an optional byte order
//! prefix followed by value codes with optional repeat counts.
//!
//! | prefix      | byte order |
//! |-------------|------------|
//! | `<`         | little     |
//! | `>` or `!`  | big        |
//! | `=` or `@`  | little     |
//! | (none)      | little     |
//!
//! Sizes are always the standard ones and no alignment padding is inserted.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{LanternError, LanternResult};
use crate::protocol::MAX_PACKET_SIZE;
use crate::types::Value;

/// Spellings accepted for the passthrough token and the "remainder" length
pub const PASSTHROUGH_NAMES: [&str; 4] = ["none", "null", "None", "Null"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A single value code of a packed layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Pad,
    Char,
    I8,
    U8,
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// `Ns`: a byte string of N bytes
    Bytes(usize),
}

impl Code {
    pub fn size(&self) -> usize {
        match self {
            Code::Pad | Code::Char | Code::I8 | Code::U8 | Code::Bool => 1,
            Code::I16 | Code::U16 => 2,
            Code::I32 | Code::U32 | Code::F32 => 4,
            Code::I64 | Code::U64 | Code::F64 => 8,
            Code::Bytes(n) => *n,
        }
    }

    fn carries_value(&self) -> bool {
        !matches!(self, Code::Pad)
    }

    fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            Code::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Code::U8 => Some((0, u8::MAX as i64)),
            Code::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Code::U16 => Some((0, u16::MAX as i64)),
            Code::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Code::U32 => Some((0, u32::MAX as i64)),
            Code::I64 => Some((i64::MIN, i64::MAX)),
            Code::U64 => Some((0, i64::MAX)),
            _ => None,
        }
    }

    fn from_char(c: char) -> Option<Self> {
        let code = match c {
            'x' => Code::Pad,
            'c' => Code::Char,
            'b' => Code::I8,
            'B' => Code::U8,
            '?' => Code::Bool,
            'h' => Code::I16,
            'H' => Code::U16,
            'i' | 'l' => Code::I32,
            'I' | 'L' => Code::U32,
            'q' => Code::I64,
            'Q' => Code::U64,
            'f' => Code::F32,
            'd' => Code::F64,
            _ => return None,
        };
        Some(code)
    }
}

/// Parsed format token of a schema leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatToken {
    /// Raw bytes copied as they are
    Passthrough,
    Packed { endian: Endian, codes: Vec<Code> },
}

impl FormatToken {
    pub fn parse(token: &str) -> LanternResult<Self> {
        let token = token.trim();
        if PASSTHROUGH_NAMES.contains(&token) {
            return Ok(FormatToken::Passthrough);
        }

        let mut chars = token.chars().peekable();
        let endian = match chars.peek() {
            Some('<') | Some('=') | Some('@') => {
                chars.next();
                Endian::Little
            }
            Some('>') | Some('!') => {
                chars.next();
                Endian::Big
            }
            _ => Endian::Little,
        };

        let mut codes = Vec::new();
        let mut count: Option<usize> = None;
        for c in chars {
            if c.is_whitespace() {
                continue;
            }
            if let Some(digit) = c.to_digit(10) {
                count = count
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(digit as usize))
                    .filter(|n| *n <= MAX_PACKET_SIZE)
                    .map(Some)
                    .ok_or_else(|| {
                        LanternError::schema(format!("repeat count too large in '{}'", token))
                    })?;
                continue;
            }
            let repeat = count.take().unwrap_or(1);
            if c == 's' {
                if repeat == 0 {
                    return Err(LanternError::schema(format!("zero-length string in '{}'", token)));
                }
                codes.push(Code::Bytes(repeat));
                continue;
            }
            let code = Code::from_char(c).ok_or_else(|| {
                LanternError::schema(format!("unsupported code '{}' in format '{}'", c, token))
            })?;
            codes.extend(std::iter::repeat(code).take(repeat));
        }

        if count.is_some() {
            return Err(LanternError::schema(format!("dangling repeat count in '{}'", token)));
        }
        if codes.iter().map(Code::size).sum::<usize>() > MAX_PACKET_SIZE {
            return Err(LanternError::schema(format!("format '{}' exceeds a packet", token)));
        }
        if !codes.iter().any(Code::carries_value) {
            return Err(LanternError::schema(format!("format '{}' carries no value", token)));
        }

        Ok(FormatToken::Packed { endian, codes })
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FormatToken::Passthrough)
    }

    /// Bytes consumed per encoded tuple (1 for passthrough)
    pub fn tuple_size(&self) -> usize {
        match self {
            FormatToken::Passthrough => 1,
            FormatToken::Packed { codes, .. } => codes.iter().map(Code::size).sum(),
        }
    }

    /// Values produced per encoded tuple
    pub fn value_count(&self) -> usize {
        match self {
            FormatToken::Passthrough => 1,
            FormatToken::Packed { codes, .. } => codes.iter().filter(|c| c.carries_value()).count(),
        }
    }

    /// True for a layout made of one byte string code. Its tuples are joined
    /// into a single byte run on decode.
    pub fn is_byte_run(&self) -> bool {
        matches!(self, FormatToken::Packed { codes, .. } if matches!(codes.as_slice(), [Code::Bytes(_)]))
    }

    /// Decode `bytes` as a run of whole tuples
    pub fn decode(&self, bytes: &[u8]) -> LanternResult<Vec<Vec<Value>>> {
        let (endian, codes) = match self {
            FormatToken::Passthrough => return Ok(vec![vec![Value::Bytes(bytes.to_vec())]]),
            FormatToken::Packed { endian, codes } => (*endian, codes),
        };

        let size = self.tuple_size();
        if bytes.len() % size != 0 {
            return Err(LanternError::malformed(format!(
                "{} bytes is not a whole number of '{}' tuples",
                bytes.len(),
                self
            )));
        }

        bytes
            .chunks(size)
            .map(|chunk| match endian {
                Endian::Little => decode_tuple::<LittleEndian>(codes, chunk),
                Endian::Big => decode_tuple::<BigEndian>(codes, chunk),
            })
            .collect()
    }

    /// Encode one tuple, appending to `out`
    pub fn encode_tuple(&self, values: &[&Value], out: &mut Vec<u8>) -> LanternResult<()> {
        let (endian, codes) = match self {
            FormatToken::Passthrough => {
                for v in values {
                    let bytes = v.as_bytes().ok_or_else(|| {
                        LanternError::encode(format!("passthrough field needs bytes, got {}", v))
                    })?;
                    out.extend_from_slice(bytes);
                }
                return Ok(());
            }
            FormatToken::Packed { endian, codes } => (*endian, codes),
        };

        if values.len() != self.value_count() {
            return Err(LanternError::encode(format!(
                "format '{}' takes {} values, got {}",
                self,
                self.value_count(),
                values.len()
            )));
        }

        match endian {
            Endian::Little => encode_tuple::<LittleEndian>(codes, values, out),
            Endian::Big => encode_tuple::<BigEndian>(codes, values, out),
        }
    }
}

impl FromStr for FormatToken {
    type Err = LanternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormatToken::parse(s)
    }
}

impl fmt::Display for FormatToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (endian, codes) = match self {
            FormatToken::Passthrough => return write!(f, "none"),
            FormatToken::Packed { endian, codes } => (endian, codes),
        };
        write!(f, "{}", if *endian == Endian::Big { '>' } else { '<' })?;
        for code in codes {
            match code {
                Code::Pad => write!(f, "x")?,
                Code::Char => write!(f, "c")?,
                Code::I8 => write!(f, "b")?,
                Code::U8 => write!(f, "B")?,
                Code::Bool => write!(f, "?")?,
                Code::I16 => write!(f, "h")?,
                Code::U16 => write!(f, "H")?,
                Code::I32 => write!(f, "i")?,
                Code::U32 => write!(f, "I")?,
                Code::I64 => write!(f, "q")?,
                Code::U64 => write!(f, "Q")?,
                Code::F32 => write!(f, "f")?,
                Code::F64 => write!(f, "d")?,
                Code::Bytes(n) => write!(f, "{}s", n)?,
            }
        }
        Ok(())
    }
}

fn decode_tuple<B: ByteOrder>(codes: &[Code], chunk: &[u8]) -> LanternResult<Vec<Value>> {
    let mut cur = Cursor::new(chunk);
    let mut values = Vec::with_capacity(codes.len());
    for code in codes {
        let value = match code {
            Code::Pad => {
                cur.read_u8()?;
                continue;
            }
            Code::Char => Value::Bytes(vec![cur.read_u8()?]),
            Code::I8 => Value::Int(cur.read_i8()? as i64),
            Code::U8 => Value::Int(cur.read_u8()? as i64),
            Code::Bool => Value::Bool(cur.read_u8()? != 0),
            Code::I16 => Value::Int(cur.read_i16::<B>()? as i64),
            Code::U16 => Value::Int(cur.read_u16::<B>()? as i64),
            Code::I32 => Value::Int(cur.read_i32::<B>()? as i64),
            Code::U32 => Value::Int(cur.read_u32::<B>()? as i64),
            Code::I64 => Value::Int(cur.read_i64::<B>()?),
            Code::U64 => {
                let v = cur.read_u64::<B>()?;
                let i = i64::try_from(v)
                    .map_err(|_| LanternError::malformed(format!("'Q' value {} out of range", v)))?;
                Value::Int(i)
            }
            Code::F32 => Value::Float(cur.read_f32::<B>()? as f64),
            Code::F64 => Value::Float(cur.read_f64::<B>()?),
            Code::Bytes(n) => {
                let start = cur.position() as usize;
                cur.set_position((start + n) as u64);
                Value::Bytes(chunk[start..start + n].to_vec())
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn encode_tuple<B: ByteOrder>(codes: &[Code], values: &[&Value], out: &mut Vec<u8>) -> LanternResult<()> {
    let mut values = values.iter();
    for code in codes {
        if *code == Code::Pad {
            out.write_u8(0)?;
            continue;
        }
        // value_count was checked by the caller
        let value = match values.next() {
            Some(v) => *v,
            None => return Err(LanternError::encode("ran out of values")),
        };

        match code {
            Code::Pad => {}
            Code::Char => {
                let b = value.as_bytes().filter(|b| b.len() == 1).ok_or_else(|| {
                    LanternError::encode(format!("'c' needs a single byte, got {}", value))
                })?;
                out.write_u8(b[0])?;
            }
            Code::Bool => {
                let b = value.as_bool().ok_or_else(|| {
                    LanternError::encode(format!("'?' needs a boolean, got {}", value))
                })?;
                out.write_u8(b as u8)?;
            }
            Code::F32 => out.write_f32::<B>(float_of(value)? as f32)?,
            Code::F64 => out.write_f64::<B>(float_of(value)?)?,
            Code::Bytes(n) => {
                let bytes = value.as_bytes().ok_or_else(|| {
                    LanternError::encode(format!("'{}s' needs bytes, got {}", n, value))
                })?;
                let mut field = bytes[..bytes.len().min(*n)].to_vec();
                field.resize(*n, 0);
                out.extend_from_slice(&field);
            }
            int_code => {
                let i = value.as_i64().ok_or_else(|| {
                    LanternError::encode(format!("integer expected, got {}", value))
                })?;
                if let Some((min, max)) = int_code.int_range() {
                    if i < min || i > max {
                        return Err(LanternError::encode(format!(
                            "{} out of range {}..={}",
                            i, min, max
                        )));
                    }
                }
                match int_code {
                    Code::I8 => out.write_i8(i as i8)?,
                    Code::U8 => out.write_u8(i as u8)?,
                    Code::I16 => out.write_i16::<B>(i as i16)?,
                    Code::U16 => out.write_u16::<B>(i as u16)?,
                    Code::I32 => out.write_i32::<B>(i as i32)?,
                    Code::U32 => out.write_u32::<B>(i as u32)?,
                    Code::I64 => out.write_i64::<B>(i)?,
                    Code::U64 => out.write_u64::<B>(i as u64)?,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn float_of(value: &Value) -> LanternResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| LanternError::encode(format!("number expected, got {}", value)))
}
