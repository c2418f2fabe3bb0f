/// Function prototype: compiled bytecode, constants, and debug info.
///
/// Prototypes are immutable after compilation and shared by reference;
/// every closure over the same function body points at the same `Rc`.
use crate::opcode::Instruction;
use crescent_core::string::StrId;
use std::rc::Rc;

/// An entry in the constant pool. Integer and float constants are
/// distinct even when numerically equal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(StrId),
}

/// Where a closure finds one of its upvalues.
#[derive(Clone, Debug, PartialEq)]
pub struct UpvalDesc {
    /// Debug name, if known.
    pub name: Option<StrId>,
    /// True when captured from a local slot of the enclosing function,
    /// false when copied from the enclosing closure's upvalues.
    pub in_stack: bool,
    /// Register index or enclosing-upvalue index, per `in_stack`.
    pub index: u8,
}

/// Scope record of one local variable.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalVar {
    pub name: StrId,
    /// First pc where the variable is live.
    pub start_pc: u32,
    /// First pc where the variable is dead.
    pub end_pc: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Rc<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
    /// Source line of each instruction, parallel to `code`.
    pub line_info: Vec<i32>,
    pub local_vars: Vec<LocalVar>,
    pub source: Option<StrId>,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            line_info: Vec::new(),
            local_vars: Vec::new(),
            source: None,
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2, // registers 0/1 always exist
        }
    }

    /// Append an instruction, recording its source line. Returns its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        let pc = self.code.len();
        self.code.push(inst);
        self.line_info.push(line as i32);
        pc
    }

    /// Add a constant, deduplicating. Integer and float never collapse
    /// into each other; floats dedup by bit pattern.
    pub fn add_constant(&mut self, k: Constant) -> usize {
        for (i, existing) in self.constants.iter().enumerate() {
            if constants_equal(existing, &k) {
                return i;
            }
        }
        self.constants.push(k);
        self.constants.len() - 1
    }

    /// Source line for a pc, 0 when unknown.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0).max(0) as u32
    }
}

impl Default for Proto {
    fn default() -> Self {
        Self::new()
    }
}

fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Nil, Constant::Nil) => true,
        (Constant::Boolean(x), Constant::Boolean(y)) => x == y,
        (Constant::Integer(x), Constant::Integer(y)) => x == y,
        (Constant::Float(x), Constant::Float(y)) => x.to_bits() == y.to_bits(),
        (Constant::Str(x), Constant::Str(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    #[test]
    fn test_empty_proto() {
        let p = Proto::new();
        assert!(p.code.is_empty());
        assert_eq!(p.max_stack_size, 2);
        assert!(!p.is_vararg);
    }

    #[test]
    fn test_emit_records_line() {
        let mut p = Proto::new();
        p.emit(Instruction::abc(OpCode::Move, 0, 1, 0), 3);
        p.emit(Instruction::abc(OpCode::Return, 0, 1, 0), 7);
        assert_eq!(p.line_at(0), 3);
        assert_eq!(p.line_at(1), 7);
        assert_eq!(p.line_at(99), 0);
    }

    #[test]
    fn test_constant_dedup() {
        let mut p = Proto::new();
        assert_eq!(
            p.add_constant(Constant::Integer(42)),
            p.add_constant(Constant::Integer(42))
        );
        assert_eq!(p.constants.len(), 1);
    }

    #[test]
    fn test_int_float_constants_distinct() {
        let mut p = Proto::new();
        let i = p.add_constant(Constant::Integer(1));
        let f = p.add_constant(Constant::Float(1.0));
        assert_ne!(i, f);
    }

    #[test]
    fn test_float_dedup_by_bits() {
        let mut p = Proto::new();
        assert_eq!(
            p.add_constant(Constant::Float(0.5)),
            p.add_constant(Constant::Float(0.5))
        );
        // -0.0 and 0.0 differ as constant bits.
        assert_ne!(
            p.add_constant(Constant::Float(0.0)),
            p.add_constant(Constant::Float(-0.0))
        );
    }
}
