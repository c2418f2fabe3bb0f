//! Arithmetic and bitwise operations with Lua 5.3 semantics.
//!
//! Integer operands use two's-complement wrapping arithmetic and stay
//! integers; any float operand, a true division, or an exponentiation
//! promotes to float. Bitwise operands must be integers or losslessly
//! integral floats.

use crate::coerce::{self, Numeral};
use crate::error::LuaError;
use crescent_core::string::StringPool;
use crescent_core::value::Value;
use crescent_compiler::compiler::{lua_float_mod, lua_int_floordiv, lua_int_mod, lua_shift_left};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

impl ArithOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
                | ArithOp::BNot
        )
    }
}

/// Outcome of a primitive arithmetic attempt.
pub enum ArithResult {
    Ok(Value),
    /// Operands are not numbers (after string coercion): the caller
    /// should try a metamethod.
    NeedMeta,
    /// A hard error, such as integer division by zero.
    Error(LuaError),
}

/// Binary arithmetic dispatch per the decision tree: integers stay
/// integral except for `/` and `^`.
pub fn arith_binary(op: ArithOp, a: Value, b: Value, strings: &StringPool) -> ArithResult {
    debug_assert!(!matches!(op, ArithOp::Unm | ArithOp::BNot));
    if op.is_bitwise() {
        return bitwise_binary(op, a, b, strings);
    }
    let (na, nb) = match (
        coerce::to_numeral(a, strings),
        coerce::to_numeral(b, strings),
    ) {
        (Some(x), Some(y)) => (x, y),
        _ => return ArithResult::NeedMeta,
    };
    if !matches!(op, ArithOp::Div | ArithOp::Pow) {
        if let (Numeral::Int(x), Numeral::Int(y)) = (na, nb) {
            return int_arith(op, x, y);
        }
    }
    let x = numeral_to_f64(na);
    let y = numeral_to_f64(nb);
    ArithResult::Ok(Value::Float(float_arith(op, x, y)))
}

/// Unary minus.
pub fn arith_unm(v: Value, strings: &StringPool) -> ArithResult {
    match coerce::to_numeral(v, strings) {
        Some(Numeral::Int(i)) => ArithResult::Ok(Value::Integer(i.wrapping_neg())),
        Some(Numeral::Flt(f)) => ArithResult::Ok(Value::Float(-f)),
        None => ArithResult::NeedMeta,
    }
}

/// Bitwise not.
pub fn arith_bnot(v: Value, strings: &StringPool) -> ArithResult {
    match operand_to_int(v, strings) {
        IntOperand::Ok(i) => ArithResult::Ok(Value::Integer(!i)),
        IntOperand::NotIntegral => ArithResult::Error(LuaError::Runtime(
            "number has no integer representation".to_string(),
        )),
        IntOperand::NotNumber => ArithResult::NeedMeta,
    }
}

fn bitwise_binary(op: ArithOp, a: Value, b: Value, strings: &StringPool) -> ArithResult {
    let x = match operand_to_int(a, strings) {
        IntOperand::Ok(i) => i,
        IntOperand::NotIntegral => {
            return ArithResult::Error(LuaError::Runtime(
                "number has no integer representation".to_string(),
            ))
        }
        IntOperand::NotNumber => return ArithResult::NeedMeta,
    };
    let y = match operand_to_int(b, strings) {
        IntOperand::Ok(i) => i,
        IntOperand::NotIntegral => {
            return ArithResult::Error(LuaError::Runtime(
                "number has no integer representation".to_string(),
            ))
        }
        IntOperand::NotNumber => return ArithResult::NeedMeta,
    };
    int_arith(op, x, y)
}

enum IntOperand {
    Ok(i64),
    /// A number with no exact integer representation.
    NotIntegral,
    NotNumber,
}

fn operand_to_int(v: Value, strings: &StringPool) -> IntOperand {
    match coerce::to_numeral(v, strings) {
        Some(Numeral::Int(i)) => IntOperand::Ok(i),
        Some(Numeral::Flt(f)) => match coerce::float_to_integer(f) {
            Some(i) => IntOperand::Ok(i),
            None => IntOperand::NotIntegral,
        },
        None => IntOperand::NotNumber,
    }
}

fn numeral_to_f64(n: Numeral) -> f64 {
    match n {
        Numeral::Int(i) => i as f64,
        Numeral::Flt(f) => f,
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> ArithResult {
    let r = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::IDiv => {
            if b == 0 {
                return ArithResult::Error(LuaError::Runtime(
                    "attempt to perform 'n//0'".to_string(),
                ));
            }
            lua_int_floordiv(a, b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return ArithResult::Error(LuaError::Runtime(
                    "attempt to perform 'n%%0'".to_string(),
                ));
            }
            lua_int_mod(a, b)
        }
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => lua_shift_left(a, b),
        ArithOp::Shr => lua_shift_left(a, b.wrapping_neg()),
        ArithOp::Div | ArithOp::Pow | ArithOp::Unm | ArithOp::BNot => {
            unreachable!("handled on other paths")
        }
    };
    ArithResult::Ok(Value::Integer(r))
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        // IEEE semantics on zero divisors: inf or NaN, never an error.
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => lua_float_mod(a, b),
        _ => unreachable!("bitwise handled on the integer path"),
    }
}
