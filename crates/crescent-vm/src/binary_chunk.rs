//! Lua 5.3 binary chunk serialization (dump) and deserialization
//! (undump), byte-exact with the reference format.
//!
//! Multi-byte fields use the host's native byte order; the loader
//! verifies the header's test integer and test float and rejects
//! chunks from a different layout rather than translating them.

use crescent_compiler::opcode::Instruction;
use crescent_compiler::proto::{Constant, LocalVar, Proto, UpvalDesc};
use crescent_core::string::{StrId, StringPool};
use std::fmt;
use std::rc::Rc;

const SIGNATURE: &[u8; 4] = b"\x1bLua";
const VERSION: u8 = 0x53;
const FORMAT: u8 = 0;
const DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
const INT_SIZE: u8 = 4;
const SIZET_SIZE: u8 = 8;
const INSTRUCTION_SIZE: u8 = 4;
const LUA_INTEGER_SIZE: u8 = 8;
const LUA_NUMBER_SIZE: u8 = 8;
const TEST_INT: i64 = 0x5678;
const TEST_NUM: f64 = 370.5;

// Constant type tags.
const T_NIL: u8 = 0x00;
const T_BOOLEAN: u8 = 0x01;
const T_NUMFLT: u8 = 0x03;
const T_NUMINT: u8 = 0x13;
const T_SHRSTR: u8 = 0x04;
const T_LNGSTR: u8 = 0x14;

/// Short-string cutoff, as in the reference string representation.
const MAX_SHORT_LEN: usize = 40;

// ---- Dump ----

/// Serialize a prototype tree into a binary chunk.
pub fn dump(proto: &Proto, strings: &StringPool) -> Vec<u8> {
    let mut out = Vec::new();
    write_header(&mut out);
    out.push(proto.upvalues.len() as u8);
    write_function(&mut out, proto, strings);
    out
}

fn write_header(out: &mut Vec<u8>) {
    out.extend_from_slice(SIGNATURE);
    out.push(VERSION);
    out.push(FORMAT);
    out.extend_from_slice(DATA);
    out.push(INT_SIZE);
    out.push(SIZET_SIZE);
    out.push(INSTRUCTION_SIZE);
    out.push(LUA_INTEGER_SIZE);
    out.push(LUA_NUMBER_SIZE);
    out.extend_from_slice(&TEST_INT.to_ne_bytes());
    out.extend_from_slice(&TEST_NUM.to_ne_bytes());
}

fn write_int(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

/// Strings carry a length that counts a terminating byte which is
/// never actually written; empty strings are the single byte 0.
fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.is_empty() {
        out.push(0);
        return;
    }
    let size = bytes.len() + 1;
    if size < 0xFF {
        out.push(size as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(size as u64).to_ne_bytes());
    }
    out.extend_from_slice(bytes);
}

fn write_opt_string(out: &mut Vec<u8>, s: Option<StrId>, strings: &StringPool) {
    match s {
        Some(id) => write_string(out, strings.bytes(id)),
        None => out.push(0),
    }
}

fn write_function(out: &mut Vec<u8>, proto: &Proto, strings: &StringPool) {
    write_opt_string(out, proto.source, strings);
    write_int(out, proto.line_defined as i32);
    write_int(out, proto.last_line_defined as i32);
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    out.push(proto.max_stack_size);

    write_int(out, proto.code.len() as i32);
    for inst in &proto.code {
        out.extend_from_slice(&inst.0.to_ne_bytes());
    }

    write_int(out, proto.constants.len() as i32);
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(T_NIL),
            Constant::Boolean(b) => {
                out.push(T_BOOLEAN);
                out.push(*b as u8);
            }
            Constant::Float(f) => {
                out.push(T_NUMFLT);
                out.extend_from_slice(&f.to_ne_bytes());
            }
            Constant::Integer(i) => {
                out.push(T_NUMINT);
                out.extend_from_slice(&i.to_ne_bytes());
            }
            Constant::Str(id) => {
                let bytes = strings.bytes(*id);
                out.push(if bytes.len() <= MAX_SHORT_LEN {
                    T_SHRSTR
                } else {
                    T_LNGSTR
                });
                write_string(out, bytes);
            }
        }
    }

    write_int(out, proto.upvalues.len() as i32);
    for uv in &proto.upvalues {
        out.push(uv.in_stack as u8);
        out.push(uv.index);
    }

    write_int(out, proto.protos.len() as i32);
    for child in &proto.protos {
        write_function(out, child, strings);
    }

    // Debug info: line array, local variables, upvalue names.
    write_int(out, proto.line_info.len() as i32);
    for line in &proto.line_info {
        write_int(out, *line);
    }
    write_int(out, proto.local_vars.len() as i32);
    for lv in &proto.local_vars {
        write_string(out, strings.bytes(lv.name));
        write_int(out, lv.start_pc as i32);
        write_int(out, lv.end_pc as i32);
    }
    write_int(out, proto.upvalues.len() as i32);
    for uv in &proto.upvalues {
        write_opt_string(out, uv.name, strings);
    }
}

// ---- Undump ----

#[derive(Clone, Debug)]
pub struct UndumpError {
    pub message: String,
}

impl UndumpError {
    fn new(chunk: &str, what: &str) -> Self {
        UndumpError {
            message: format!("{chunk}: {what} in precompiled chunk"),
        }
    }
}

impl fmt::Display for UndumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UndumpError {}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    chunk: &'a str,
}

impl<'a> Reader<'a> {
    fn truncated(&self) -> UndumpError {
        UndumpError::new(self.chunk, "truncated")
    }

    fn read_byte(&mut self) -> Result<u8, UndumpError> {
        let b = *self.data.get(self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], UndumpError> {
        if self.pos + n > self.data.len() {
            return Err(self.truncated());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32, UndumpError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32(&mut self) -> Result<u32, UndumpError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, UndumpError> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_u64(&mut self) -> Result<u64, UndumpError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_ne_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f64(&mut self) -> Result<f64, UndumpError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// A string: the stored size includes the phantom terminator.
    fn read_string(&mut self, strings: &mut StringPool) -> Result<Option<StrId>, UndumpError> {
        let first = self.read_byte()?;
        let size = if first == 0xFF {
            self.read_u64()? as usize
        } else {
            first as usize
        };
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(size - 1)?;
        Ok(Some(strings.intern(bytes)))
    }

    fn read_count(&mut self) -> Result<usize, UndumpError> {
        let n = self.read_i32()?;
        if n < 0 || n as usize > self.data.len() {
            return Err(UndumpError::new(self.chunk, "corrupted"));
        }
        Ok(n as usize)
    }
}

/// Deserialize a binary chunk. `chunk_name` feeds error messages.
pub fn undump(
    data: &[u8],
    chunk_name: &str,
    strings: &mut StringPool,
) -> Result<Rc<Proto>, UndumpError> {
    let mut r = Reader {
        data,
        pos: 0,
        chunk: chunk_name,
    };
    check_header(&mut r)?;
    let _main_upvalue_count = r.read_byte()?;
    let proto = read_function(&mut r, strings)?;
    Ok(Rc::new(proto))
}

fn check_header(r: &mut Reader) -> Result<(), UndumpError> {
    if r.read_bytes(4)? != SIGNATURE {
        return Err(UndumpError::new(r.chunk, "not a"));
    }
    if r.read_byte()? != VERSION {
        return Err(UndumpError::new(r.chunk, "version mismatch"));
    }
    if r.read_byte()? != FORMAT {
        return Err(UndumpError::new(r.chunk, "format mismatch"));
    }
    if r.read_bytes(6)? != DATA {
        return Err(UndumpError::new(r.chunk, "corrupted"));
    }
    if r.read_byte()? != INT_SIZE {
        return Err(UndumpError::new(r.chunk, "int size mismatch"));
    }
    if r.read_byte()? != SIZET_SIZE {
        return Err(UndumpError::new(r.chunk, "size_t size mismatch"));
    }
    if r.read_byte()? != INSTRUCTION_SIZE {
        return Err(UndumpError::new(r.chunk, "instruction size mismatch"));
    }
    if r.read_byte()? != LUA_INTEGER_SIZE {
        return Err(UndumpError::new(r.chunk, "integer size mismatch"));
    }
    if r.read_byte()? != LUA_NUMBER_SIZE {
        return Err(UndumpError::new(r.chunk, "number size mismatch"));
    }
    if r.read_i64()? != TEST_INT {
        return Err(UndumpError::new(r.chunk, "endianness mismatch"));
    }
    if r.read_f64()? != TEST_NUM {
        return Err(UndumpError::new(r.chunk, "float format mismatch"));
    }
    Ok(())
}

fn read_function(r: &mut Reader, strings: &mut StringPool) -> Result<Proto, UndumpError> {
    let mut proto = Proto::new();
    proto.source = r.read_string(strings)?;
    proto.line_defined = r.read_i32()? as u32;
    proto.last_line_defined = r.read_i32()? as u32;
    proto.num_params = r.read_byte()?;
    proto.is_vararg = r.read_byte()? != 0;
    proto.max_stack_size = r.read_byte()?;

    let code_len = r.read_count()?;
    proto.code.reserve(code_len);
    for _ in 0..code_len {
        proto.code.push(Instruction(r.read_u32()?));
    }

    let const_len = r.read_count()?;
    proto.constants.reserve(const_len);
    for _ in 0..const_len {
        let tag = r.read_byte()?;
        let k = match tag {
            T_NIL => Constant::Nil,
            T_BOOLEAN => Constant::Boolean(r.read_byte()? != 0),
            T_NUMFLT => Constant::Float(r.read_f64()?),
            T_NUMINT => Constant::Integer(r.read_i64()?),
            T_SHRSTR | T_LNGSTR => {
                let s = r
                    .read_string(strings)?
                    .ok_or_else(|| UndumpError::new(r.chunk, "corrupted"))?;
                Constant::Str(s)
            }
            _ => return Err(UndumpError::new(r.chunk, "unknown constant type")),
        };
        proto.constants.push(k);
    }

    let upval_len = r.read_count()?;
    proto.upvalues.reserve(upval_len);
    for _ in 0..upval_len {
        let in_stack = r.read_byte()? != 0;
        let index = r.read_byte()?;
        proto.upvalues.push(UpvalDesc {
            name: None,
            in_stack,
            index,
        });
    }

    let proto_len = r.read_count()?;
    proto.protos.reserve(proto_len);
    for _ in 0..proto_len {
        proto.protos.push(Rc::new(read_function(r, strings)?));
    }

    // Debug info.
    let line_len = r.read_count()?;
    proto.line_info.reserve(line_len);
    for _ in 0..line_len {
        proto.line_info.push(r.read_i32()?);
    }
    let locals_len = r.read_count()?;
    proto.local_vars.reserve(locals_len);
    for _ in 0..locals_len {
        let name = r
            .read_string(strings)?
            .ok_or_else(|| UndumpError::new(r.chunk, "corrupted"))?;
        let start_pc = r.read_i32()? as u32;
        let end_pc = r.read_i32()? as u32;
        proto.local_vars.push(LocalVar {
            name,
            start_pc,
            end_pc,
        });
    }
    let upval_names = r.read_count()?;
    for i in 0..upval_names {
        let name = r.read_string(strings)?;
        if i < proto.upvalues.len() {
            proto.upvalues[i].name = name;
        }
    }

    Ok(proto)
}
