//! Bytecode disassembler, for debugging and tests.

use crate::opcode::{self, Instruction, OpCode, OpFormat};
use crate::proto::{Constant, Proto};
use crescent_core::string::StringPool;
use std::fmt::Write;

/// Render a whole prototype tree as text.
pub fn disassemble(proto: &Proto, strings: &StringPool) -> String {
    let mut out = String::new();
    disasm_proto(proto, strings, &mut out, 0);
    out
}

fn disasm_proto(proto: &Proto, strings: &StringPool, out: &mut String, depth: usize) {
    let indent = "  ".repeat(depth);
    let source = proto
        .source
        .map(|s| strings.display(s).into_owned())
        .unwrap_or_else(|| "?".to_string());
    let _ = writeln!(
        out,
        "{indent}function <{source}:{}> ({} instructions, {} params{}, {} slots, {} upvalues, {} constants)",
        proto.line_defined,
        proto.code.len(),
        proto.num_params,
        if proto.is_vararg { "+" } else { "" },
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.constants.len(),
    );
    for (pc, inst) in proto.code.iter().enumerate() {
        let _ = writeln!(
            out,
            "{indent}  [{pc:4}] line {:<4} {}",
            proto.line_at(pc),
            format_instruction(*inst, proto, strings),
        );
    }
    for child in &proto.protos {
        disasm_proto(child, strings, out, depth + 1);
    }
}

/// One instruction with decoded operands and constant annotations.
pub fn format_instruction(inst: Instruction, proto: &Proto, strings: &StringPool) -> String {
    let op = inst.opcode();
    let mut s = format!("{:<10}", op.name());
    match op.format() {
        OpFormat::IABC => {
            let _ = write!(s, "{} {} {}", inst.a(), inst.b(), inst.c());
            let mut notes = Vec::new();
            for operand in [inst.b(), inst.c()] {
                if opcode::is_k(operand) {
                    let k = opcode::rk_index(operand) as usize;
                    notes.push(constant_text(proto, k, strings));
                }
            }
            if !notes.is_empty() {
                let _ = write!(s, "  ; {}", notes.join(" "));
            }
        }
        OpFormat::IABx => {
            let _ = write!(s, "{} {}", inst.a(), inst.bx());
            if op == OpCode::LoadK {
                let _ = write!(
                    s,
                    "  ; {}",
                    constant_text(proto, inst.bx() as usize, strings)
                );
            }
        }
        OpFormat::IAsBx => {
            let _ = write!(s, "{} {}", inst.a(), inst.sbx());
        }
        OpFormat::IAx => {
            let _ = write!(s, "{}", inst.ax());
        }
    }
    s
}

fn constant_text(proto: &Proto, k: usize, strings: &StringPool) -> String {
    match proto.constants.get(k) {
        Some(Constant::Nil) => "nil".to_string(),
        Some(Constant::Boolean(b)) => b.to_string(),
        Some(Constant::Integer(i)) => i.to_string(),
        Some(Constant::Float(f)) => f.to_string(),
        Some(Constant::Str(id)) => format!("\"{}\"", strings.display(*id)),
        None => format!("K[{k}]?"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn test_disassemble_smoke() {
        let mut strings = StringPool::new();
        let proto = compile(b"local x = 1 return x + 2", "=t", &mut strings).unwrap();
        let text = disassemble(&proto, &strings);
        assert!(text.contains("LOADK"));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn test_constants_annotated() {
        let mut strings = StringPool::new();
        let proto = compile(b"return x", "=t", &mut strings).unwrap();
        let text = disassemble(&proto, &strings);
        // The global name shows up as a constant annotation.
        assert!(text.contains("\"x\""));
    }

    #[test]
    fn test_nested_protos_included() {
        let mut strings = StringPool::new();
        let proto = compile(b"return function() return 1 end", "=t", &mut strings).unwrap();
        let text = disassemble(&proto, &strings);
        assert!(text.contains("CLOSURE"));
        assert!(text.matches("function <").count() >= 2);
    }
}
