//! Single-pass compiler: a recursive-descent parser that emits Lua 5.3
//! bytecode directly, with no AST.
//!
//! Expressions are `ExpDesc` values discharged into registers on
//! demand; register allocation is a per-function next-free counter.
//! Unresolved jumps are threaded as linked lists through the sBx
//! fields of JMP instructions and patched once the target is known.

pub mod expr;
pub mod scope;

use crate::lexer::{LexError, Lexer};
use crate::opcode::{
    self, int_to_fb, Instruction, OpCode, LFIELDS_PER_FLUSH, MAX_BX, MAX_C, MAX_INDEX_RK,
    MAX_SBX,
};
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc};
use crate::token::Token;
use crescent_core::string::{StrId, StringPool};
use expr::{BinOp, ExpDesc, ExpKind, Numeral, UnOp, NO_JUMP, UNARY_PRIORITY};
use scope::{GotoDesc, LabelDesc, ScopeManager};
use std::fmt;
use std::rc::Rc;

/// Register file limit; `NO_REG` marks "no destination" when patching
/// test instructions.
const MAX_REGS: u32 = 255;
const NO_REG: u32 = MAX_REGS;

/// Wanted-results marker for open calls.
const MULTRET: i32 = -1;

/// Parser recursion guard.
const MAX_SYNTAX_DEPTH: u32 = 200;

#[derive(Clone, Debug)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// Render a chunk name the way error messages expect: a leading `@` or
/// `=` is stripped and the rest shown verbatim (truncated with "...");
/// any other name is source text, shown as `[string "..."]` cut at its
/// first line.
pub fn chunk_id(name: &str) -> String {
    const ID_SIZE: usize = 60;
    if let Some(rest) = name.strip_prefix('=') {
        return rest.chars().take(ID_SIZE).collect();
    }
    if let Some(rest) = name.strip_prefix('@') {
        if rest.chars().count() <= ID_SIZE {
            return rest.to_string();
        }
        let tail: Vec<char> = rest.chars().collect();
        let keep = ID_SIZE - 3;
        let tail: String = tail[tail.len() - keep..].iter().collect();
        return format!("...{tail}");
    }
    let first_line = name.lines().next().unwrap_or("");
    let mut body: String = first_line.chars().take(ID_SIZE - 12).collect();
    if body.len() < name.len() {
        body.push_str("...");
    }
    format!("[string \"{body}\"]")
}

/// Compilation state of one function body.
struct FuncState {
    proto: Proto,
    parent: Option<usize>,
    /// First free register.
    free_reg: u32,
    /// List of pending jumps to the next instruction.
    jpc: i32,
    /// pc of the last jump target, guarding peephole merges.
    last_target: i32,
    scope: ScopeManager,
}

impl FuncState {
    fn new(parent: Option<usize>) -> Self {
        FuncState {
            proto: Proto::new(),
            parent,
            free_reg: 0,
            jpc: NO_JUMP,
            last_target: 0,
            scope: ScopeManager::new(),
        }
    }

    fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }
}

pub struct Compiler<'a, 's> {
    lexer: Lexer<'a>,
    strings: &'s mut StringPool,
    funcs: Vec<FuncState>,
    chunk: String,
    source_id: StrId,
    env_name: StrId,
    break_name: StrId,
    self_name: StrId,
    depth: u32,
}

/// Compile a chunk into its root prototype. The root function is
/// always a vararg function with `_ENV` as its single upvalue.
pub fn compile(
    source: &[u8],
    chunk_name: &str,
    strings: &mut StringPool,
) -> Result<Rc<Proto>, CompileError> {
    let source_id = strings.intern(chunk_name.as_bytes());
    let env_name = strings.intern(b"_ENV");
    let break_name = strings.intern(b"break");
    let self_name = strings.intern(b"self");
    let lexer = Lexer::new(source, strings);
    let mut c = Compiler {
        lexer,
        strings,
        funcs: Vec::new(),
        chunk: chunk_id(chunk_name),
        source_id,
        env_name,
        break_name,
        self_name,
        depth: 0,
    };
    c.main_func()
}

impl<'a, 's> Compiler<'a, 's> {
    // ---- Function-state plumbing ----

    fn fs(&self) -> &FuncState {
        self.funcs.last().expect("no active function")
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no active function")
    }

    fn line(&self) -> u32 {
        self.lexer
            .current()
            .map(|t| t.line)
            .unwrap_or_else(|e| e.line)
    }

    // ---- Errors ----

    fn error(&self, msg: impl Into<String>) -> CompileError {
        let line = self.line();
        CompileError {
            message: format!(
                "{}:{}: {} near '{}'",
                self.chunk,
                line,
                msg.into(),
                self.lexer.token_text
            ),
            line,
        }
    }

    fn error_at(&self, line: u32, msg: impl Into<String>) -> CompileError {
        CompileError {
            message: format!("{}:{}: {}", self.chunk, line, msg.into()),
            line,
        }
    }

    fn lex_error(&self, e: LexError) -> CompileError {
        CompileError {
            message: format!("{}:{}: {}", self.chunk, e.line, e.message),
            line: e.line,
        }
    }

    // ---- Token handling ----

    fn cur_tok(&self) -> Result<Token, CompileError> {
        match self.lexer.current() {
            Ok(t) => Ok(t.token.clone()),
            Err(e) => Err(self.lex_error(e)),
        }
    }

    fn next_token(&mut self) -> Result<Token, CompileError> {
        match self.lexer.advance(self.strings) {
            Ok(t) => Ok(t.token),
            Err(e) => Err(self.lex_error(e)),
        }
    }

    fn check(&self, expected: &Token) -> bool {
        matches!(self.lexer.current(), Ok(t) if &t.token == expected)
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.next_token()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if !self.test_next(expected)? {
            return Err(self.error(format!("'{expected}' expected")));
        }
        Ok(())
    }

    /// Like `expect`, but names the construct being closed.
    fn check_match(
        &mut self,
        what: &Token,
        who: &Token,
        where_line: u32,
    ) -> Result<(), CompileError> {
        if self.test_next(what)? {
            return Ok(());
        }
        if where_line == self.line() {
            Err(self.error(format!("'{what}' expected")))
        } else {
            Err(self.error(format!(
                "'{what}' expected (to close '{who}' at line {where_line})"
            )))
        }
    }

    fn expect_name(&mut self) -> Result<StrId, CompileError> {
        match self.cur_tok()? {
            Token::Name(id) => {
                self.next_token()?;
                Ok(id)
            }
            _ => Err(self.error("<name> expected")),
        }
    }

    /// Is the current position the end of a block?
    fn block_follow(&self, with_until: bool) -> bool {
        match self.lexer.current() {
            Ok(t) => matches!(
                t.token,
                Token::End | Token::Eof | Token::Else | Token::ElseIf
            ) || (with_until && t.token == Token::Until),
            Err(_) => false,
        }
    }

    // ---- Instruction emission ----

    fn emit(&mut self, inst: Instruction, line: u32) -> Result<i32, CompileError> {
        self.discharge_jpc()?;
        let fs = self.fs_mut();
        Ok(fs.proto.emit(inst, line) as i32)
    }

    fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, CompileError> {
        let line = self.lexer.lastline;
        self.emit(Instruction::abc(op, a, b, c), line)
    }

    fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32) -> Result<i32, CompileError> {
        let line = self.lexer.lastline;
        self.emit(Instruction::abx(op, a, bx), line)
    }

    fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> Result<i32, CompileError> {
        let line = self.lexer.lastline;
        self.emit(Instruction::asbx(op, a, sbx), line)
    }

    /// Load a constant, spilling to LOADKX + EXTRAARG for big pools.
    fn emit_load_k(&mut self, reg: u32, k: u32) -> Result<(), CompileError> {
        if k <= MAX_BX {
            self.emit_abx(OpCode::LoadK, reg, k)?;
        } else {
            self.emit_abx(OpCode::LoadKX, reg, 0)?;
            let line = self.lexer.lastline;
            self.emit(Instruction::new_ax(OpCode::ExtraArg, k), line)?;
        }
        Ok(())
    }

    /// Rewrite the line of the last emitted instruction.
    fn fix_line(&mut self, line: u32) {
        let fs = self.fs_mut();
        if let Some(li) = fs.proto.line_info.last_mut() {
            *li = line as i32;
        }
    }

    // ---- Jump lists ----

    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.fs().proto.code[pc as usize].sbx();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), CompileError> {
        let offset = dest - (pc + 1);
        if offset.abs() > MAX_SBX {
            return Err(self.error("control structure too long"));
        }
        self.fs_mut().proto.code[pc as usize].set_sbx(offset);
        Ok(())
    }

    /// Emit an unconditional jump with an unresolved target, absorbing
    /// any jumps pending to this position.
    fn emit_jump(&mut self) -> Result<i32, CompileError> {
        let save_jpc = {
            let fs = self.fs_mut();
            let j = fs.jpc;
            fs.jpc = NO_JUMP;
            j
        };
        let line = self.lexer.lastline;
        let mut j = self.emit(Instruction::asbx(OpCode::Jmp, 0, NO_JUMP), line)?;
        self.concat_jumps(&mut j, save_jpc)?;
        Ok(j)
    }

    fn concat_jumps(&mut self, l1: &mut i32, l2: i32) -> Result<(), CompileError> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)
    }

    /// The instruction controlling a jump: the preceding test, if any.
    fn jump_control(&self, pc: i32) -> Instruction {
        let code = &self.fs().proto.code;
        let pc = pc as usize;
        if pc >= 1 && code[pc - 1].opcode().is_test() {
            code[pc - 1]
        } else {
            code[pc]
        }
    }

    fn jump_control_set(&mut self, pc: i32, inst: Instruction) {
        let code = &mut self.fs_mut().proto.code;
        let pc = pc as usize;
        if pc >= 1 && code[pc - 1].opcode().is_test() {
            code[pc - 1] = inst;
        } else {
            code[pc] = inst;
        }
    }

    /// Give a TESTSET jump its destination register, or degrade it to
    /// TEST when no value is wanted. False for plain jumps.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let i = self.jump_control(node);
        if i.opcode() != OpCode::TestSet {
            return false;
        }
        let mut i = i;
        if reg != NO_REG && reg != i.b() {
            i.set_a(reg);
        } else {
            i = Instruction::abc(OpCode::Test, i.b(), 0, i.c());
        }
        self.jump_control_set(node, i);
        true
    }

    /// Does any jump in the list need a materialized boolean?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            if self.jump_control(list).opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> Result<(), CompileError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    fn patch_to_here(&mut self, list: i32) -> Result<(), CompileError> {
        self.get_label();
        let mut jpc = {
            let fs = self.fs_mut();
            let j = fs.jpc;
            fs.jpc = NO_JUMP;
            j
        };
        self.concat_jumps(&mut jpc, list)?;
        self.fs_mut().jpc = jpc;
        Ok(())
    }

    fn patch_list(&mut self, list: i32, target: i32) -> Result<(), CompileError> {
        if target == self.fs().pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.fs().pc());
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    /// Make jumps in the list close upvalues from `level` upward.
    fn patch_close(&mut self, mut list: i32, level: u32) {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            self.fs_mut().proto.code[list as usize].set_a(level + 1);
            list = next;
        }
    }

    /// Mark the current position as a jump target.
    fn get_label(&mut self) -> i32 {
        let fs = self.fs_mut();
        fs.last_target = fs.pc();
        fs.last_target
    }

    fn discharge_jpc(&mut self) -> Result<(), CompileError> {
        let jpc = {
            let fs = self.fs_mut();
            let j = fs.jpc;
            fs.jpc = NO_JUMP;
            j
        };
        if jpc != NO_JUMP {
            let here = self.fs().pc();
            self.patch_list_aux(jpc, here, NO_REG, here)?;
        }
        Ok(())
    }

    // ---- Registers ----

    fn check_stack(&mut self, n: u32) -> Result<(), CompileError> {
        let new_stack = self.fs().free_reg + n;
        if new_stack >= MAX_REGS {
            return Err(self.error("function or expression needs too many registers"));
        }
        let fs = self.fs_mut();
        if new_stack as u8 > fs.proto.max_stack_size {
            fs.proto.max_stack_size = new_stack as u8;
        }
        Ok(())
    }

    fn reserve_regs(&mut self, n: u32) -> Result<(), CompileError> {
        self.check_stack(n)?;
        self.fs_mut().free_reg += n;
        Ok(())
    }

    fn free_reg(&mut self, reg: u32) {
        let fs = self.fs_mut();
        if !opcode::is_k(reg) && reg >= fs.scope.nactive as u32 {
            fs.free_reg -= 1;
            debug_assert_eq!(reg, fs.free_reg);
        }
    }

    fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r);
        }
    }

    /// Free both operand registers, highest first.
    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = match e1.kind {
            ExpKind::NonReloc(r) => Some(r),
            _ => None,
        };
        let r2 = match e2.kind {
            ExpKind::NonReloc(r) => Some(r),
            _ => None,
        };
        match (r1, r2) {
            (Some(a), Some(b)) if a > b => {
                self.free_reg(a);
                self.free_reg(b);
            }
            (Some(a), Some(b)) => {
                self.free_reg(b);
                self.free_reg(a);
            }
            (Some(a), None) => self.free_reg(a),
            (None, Some(b)) => self.free_reg(b),
            (None, None) => {}
        }
    }

    // ---- Constants ----

    fn add_constant(&mut self, k: Constant) -> u32 {
        self.fs_mut().proto.add_constant(k) as u32
    }

    fn string_constant(&mut self, id: StrId) -> u32 {
        self.add_constant(Constant::Str(id))
    }

    // ---- Expression discharge ----

    /// Resolve variable kinds into computed values.
    fn discharge_vars(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Local(reg) => {
                e.kind = ExpKind::NonReloc(reg);
            }
            ExpKind::Upval(idx) => {
                let pc = self.emit_abc(OpCode::GetUpval, 0, idx, 0)?;
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed {
                table,
                key,
                table_is_upval,
            } => {
                self.free_reg(key);
                let op = if table_is_upval {
                    OpCode::GetTabUp
                } else {
                    self.free_reg(table);
                    OpCode::GetTable
                };
                let pc = self.emit_abc(op, 0, table, key)?;
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Call(_) => {
                self.set_one_ret(e);
            }
            ExpKind::Vararg(pc) => {
                self.fs_mut().proto.code[pc as usize].set_b(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
        Ok(())
    }

    /// Emit code to put the (discharged) expression into `reg`.
    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil => {
                self.emit_nil(reg, 1)?;
            }
            ExpKind::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0)?;
            }
            ExpKind::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0)?;
            }
            ExpKind::Int(i) => {
                let k = self.add_constant(Constant::Integer(i));
                self.emit_load_k(reg, k)?;
            }
            ExpKind::Flt(f) => {
                let k = self.add_constant(Constant::Float(f));
                self.emit_load_k(reg, k)?;
            }
            ExpKind::Str(s) => {
                let k = self.string_constant(s);
                self.emit_load_k(reg, k)?;
            }
            ExpKind::K(k) => {
                self.emit_load_k(reg, k)?;
            }
            ExpKind::Reloc(pc) => {
                self.fs_mut().proto.code[pc as usize].set_a(reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.emit_abc(OpCode::Move, reg, r, 0)?;
                }
            }
            ExpKind::Jump(_) => return Ok(()), // handled by exp_to_reg
            ExpKind::Void => unreachable!("void expression has no value"),
            _ => unreachable!("discharge_vars left {:?}", e.kind),
        }
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.fs().free_reg - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    /// Put the expression, with its jump lists resolved, into `reg`.
    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), CompileError> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jump(pc) = e.kind {
            let mut t = e.t;
            self.concat_jumps(&mut t, pc)?;
            e.t = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.emit_jump()?
                };
                p_f = self.emit_abc(OpCode::LoadBool, reg, 0, 1)?;
                p_t = self.emit_abc(OpCode::LoadBool, reg, 1, 0)?;
                self.patch_to_here(fj)?;
            }
            let final_pc = self.get_label();
            self.patch_list_aux(e.f, final_pc, reg, p_f)?;
            self.patch_list_aux(e.t, final_pc, reg, p_t)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs().free_reg - 1;
        self.exp_to_reg(e, reg)
    }

    /// Put the expression into some register and return it.
    fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc(reg) = e.kind {
            if !e.has_jumps() {
                return Ok(reg);
            }
            if reg >= self.fs().scope.nactive as u32 {
                self.exp_to_reg(e, reg)?;
                return Ok(reg);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc(reg) => Ok(reg),
            _ => unreachable!(),
        }
    }

    /// Leave upvalues in place; anything else goes to a register.
    fn exp_to_any_reg_up(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp_to_any_reg(e)?;
        }
        Ok(())
    }

    /// Make the expression a value, in a register or as a constant.
    fn exp_to_val(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
        } else {
            self.discharge_vars(e)?;
        }
        Ok(())
    }

    /// RK-encode: constant index when it fits, else a register.
    fn exp_to_rk(&mut self, e: &mut ExpDesc) -> Result<u32, CompileError> {
        self.exp_to_val(e)?;
        match e.kind {
            ExpKind::Nil => {
                if self.fs().proto.constants.len() as u32 <= MAX_INDEX_RK {
                    let k = self.add_constant(Constant::Nil);
                    e.kind = ExpKind::K(k);
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::True | ExpKind::False => {
                if self.fs().proto.constants.len() as u32 <= MAX_INDEX_RK {
                    let is_true = matches!(e.kind, ExpKind::True);
                    let k = self.add_constant(Constant::Boolean(is_true));
                    e.kind = ExpKind::K(k);
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::Int(i) => {
                let k = self.add_constant(Constant::Integer(i));
                e.kind = ExpKind::K(k);
                if k <= MAX_INDEX_RK {
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::Flt(f) => {
                let k = self.add_constant(Constant::Float(f));
                e.kind = ExpKind::K(k);
                if k <= MAX_INDEX_RK {
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::Str(s) => {
                let k = self.string_constant(s);
                e.kind = ExpKind::K(k);
                if k <= MAX_INDEX_RK {
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::K(k) => {
                if k <= MAX_INDEX_RK {
                    return Ok(opcode::rk_as_k(k));
                }
            }
            _ => {}
        }
        self.exp_to_any_reg(e)
    }

    /// Store the expression into a variable.
    fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> Result<(), CompileError> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.free_exp(ex);
                self.exp_to_reg(ex, reg)?;
            }
            ExpKind::Upval(idx) => {
                let r = self.exp_to_any_reg(ex)?;
                self.emit_abc(OpCode::SetUpval, r, idx, 0)?;
                self.free_exp(ex);
            }
            ExpKind::Indexed {
                table,
                key,
                table_is_upval,
            } => {
                let rk = self.exp_to_rk(ex)?;
                let op = if table_is_upval {
                    OpCode::SetTabUp
                } else {
                    OpCode::SetTable
                };
                self.emit_abc(op, table, key, rk)?;
                self.free_exp(ex);
            }
            _ => return Err(self.error("syntax error")),
        }
        Ok(())
    }

    /// `e:name`: emit SELF, leaving method and receiver in two fresh
    /// registers.
    fn emit_self(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), CompileError> {
        self.exp_to_any_reg(e)?;
        let e_reg = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.free_exp(e);
        let base = self.fs().free_reg;
        e.kind = ExpKind::NonReloc(base);
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        self.reserve_regs(2)?;
        let rk = self.exp_to_rk(key)?;
        self.emit_abc(OpCode::Self_, base, e_reg, rk)?;
        self.free_exp(key);
        Ok(())
    }

    /// LOADNIL with a peephole merge into a preceding LOADNIL.
    fn emit_nil(&mut self, from: u32, n: u32) -> Result<(), CompileError> {
        let last = from + n - 1;
        if self.fs().pc() > self.fs().last_target && self.fs().pc() > 0 {
            let pc = self.fs().pc() as usize - 1;
            let prev = self.fs().proto.code[pc];
            if prev.opcode() == OpCode::LoadNil {
                let pfrom = prev.a();
                let plast = pfrom + prev.b();
                if (pfrom <= from && from <= plast + 1) || (from <= pfrom && pfrom <= last + 1) {
                    let new_from = pfrom.min(from);
                    let new_last = plast.max(last);
                    let mut inst = prev;
                    inst.set_a(new_from);
                    inst.set_b(new_last - new_from);
                    self.fs_mut().proto.code[pc] = inst;
                    return Ok(());
                }
            }
        }
        self.emit_abc(OpCode::LoadNil, from, n - 1, 0)?;
        Ok(())
    }

    // ---- Calls and multiple returns ----

    /// Fix an open call/vararg to produce `nresults`.
    fn set_returns(&mut self, e: &ExpDesc, nresults: i32) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Call(pc) => {
                self.fs_mut().proto.code[pc as usize].set_c((nresults + 1) as u32);
            }
            ExpKind::Vararg(pc) => {
                let reg = self.fs().free_reg;
                {
                    let inst = &mut self.fs_mut().proto.code[pc as usize];
                    inst.set_b((nresults + 1) as u32);
                    inst.set_a(reg);
                }
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn set_multret(&mut self, e: &ExpDesc) -> Result<(), CompileError> {
        self.set_returns(e, MULTRET)
    }

    /// Fix an open call/vararg to produce exactly one value.
    fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                let a = self.fs().proto.code[pc as usize].a();
                e.kind = ExpKind::NonReloc(a);
            }
            ExpKind::Vararg(pc) => {
                self.fs_mut().proto.code[pc as usize].set_b(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    // ---- Conditions ----

    /// Emit a conditional test followed by its jump.
    fn cond_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, CompileError> {
        self.emit_abc(op, a, b, c)?;
        self.emit_jump()
    }

    fn invert_jump(&mut self, pc: i32) {
        let mut i = self.jump_control(pc);
        debug_assert!(matches!(
            i.opcode(),
            OpCode::Eq | OpCode::Lt | OpCode::Le
        ));
        i.set_a(if i.a() == 0 { 1 } else { 0 });
        self.jump_control_set(pc, i);
    }

    /// Jump when the expression's truth value equals `cond`.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> Result<i32, CompileError> {
        if let ExpKind::Reloc(pc) = e.kind {
            let inst = self.fs().proto.code[pc as usize];
            if inst.opcode() == OpCode::Not {
                // Fold `not x` into an inverted test on x.
                debug_assert_eq!(pc + 1, self.fs().pc());
                let fs = self.fs_mut();
                fs.proto.code.pop();
                fs.proto.line_info.pop();
                return self.cond_jump(OpCode::Test, inst.b(), 0, !cond as u32);
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let reg = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.cond_jump(OpCode::TestSet, NO_REG, reg, cond as u32)
    }

    /// Arrange for control to continue here only when `e` is true.
    fn go_if_true(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::K(_) | ExpKind::Flt(_) | ExpKind::Int(_) | ExpKind::Str(_)
            | ExpKind::True => NO_JUMP,
            ExpKind::Jump(pc) => {
                self.invert_jump(pc);
                pc
            }
            _ => self.jump_on_cond(e, false)?,
        };
        let mut f = e.f;
        self.concat_jumps(&mut f, pc)?;
        e.f = f;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Arrange for control to continue here only when `e` is false.
    fn go_if_false(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            ExpKind::Jump(pc) => pc,
            _ => self.jump_on_cond(e, true)?,
        };
        let mut t = e.t;
        self.concat_jumps(&mut t, pc)?;
        e.t = t;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    /// `not e`.
    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::K(_) | ExpKind::Int(_) | ExpKind::Flt(_) | ExpKind::Str(_)
            | ExpKind::True => e.kind = ExpKind::False,
            ExpKind::Jump(pc) => self.invert_jump(pc),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let reg = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                let pc = self.emit_abc(OpCode::Not, 0, reg, 0)?;
                e.kind = ExpKind::Reloc(pc);
            }
            _ => unreachable!(),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        // Values in the lists are no longer needed.
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    // ---- Constant folding ----

    /// Fold a binary operation on numeric literals. Folding is skipped
    /// for integer division by zero and for float results that are NaN
    /// or signed zero, which keep their runtime behavior.
    fn fold_binary(op: BinOp, a: Numeral, b: Numeral) -> Option<ExpKind> {
        use Numeral::*;
        let as_int = |n: Numeral| match n {
            Int(i) => Some(i),
            Flt(f) => {
                if f.floor() == f && f >= i64::MIN as f64 && f < -(i64::MIN as f64) {
                    Some(f as i64)
                } else {
                    None
                }
            }
        };
        let as_flt = |n: Numeral| match n {
            Int(i) => i as f64,
            Flt(f) => f,
        };
        let float_result = |f: f64| {
            if f.is_nan() || f == 0.0 {
                None
            } else {
                Some(ExpKind::Flt(f))
            }
        };
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul => {
                if let (Int(x), Int(y)) = (a, b) {
                    let r = match op {
                        BinOp::Add => x.wrapping_add(y),
                        BinOp::Sub => x.wrapping_sub(y),
                        _ => x.wrapping_mul(y),
                    };
                    return Some(ExpKind::Int(r));
                }
                let (x, y) = (as_flt(a), as_flt(b));
                float_result(match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    _ => x * y,
                })
            }
            BinOp::Div => float_result(as_flt(a) / as_flt(b)),
            BinOp::Pow => float_result(as_flt(a).powf(as_flt(b))),
            BinOp::IDiv => {
                if let (Int(x), Int(y)) = (a, b) {
                    if y == 0 {
                        return None;
                    }
                    return Some(ExpKind::Int(lua_int_floordiv(x, y)));
                }
                float_result((as_flt(a) / as_flt(b)).floor())
            }
            BinOp::Mod => {
                if let (Int(x), Int(y)) = (a, b) {
                    if y == 0 {
                        return None;
                    }
                    return Some(ExpKind::Int(lua_int_mod(x, y)));
                }
                float_result(lua_float_mod(as_flt(a), as_flt(b)))
            }
            BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
                let (x, y) = (as_int(a)?, as_int(b)?);
                Some(ExpKind::Int(match op {
                    BinOp::BAnd => x & y,
                    BinOp::BOr => x | y,
                    BinOp::BXor => x ^ y,
                    BinOp::Shl => lua_shift_left(x, y),
                    _ => lua_shift_left(x, y.wrapping_neg()),
                }))
            }
            _ => None,
        }
    }

    fn fold_unary(op: UnOp, n: Numeral) -> Option<ExpKind> {
        match (op, n) {
            (UnOp::Minus, Numeral::Int(i)) => Some(ExpKind::Int(i.wrapping_neg())),
            (UnOp::Minus, Numeral::Flt(f)) => {
                let r = -f;
                if r.is_nan() || r == 0.0 {
                    None
                } else {
                    Some(ExpKind::Flt(r))
                }
            }
            (UnOp::BNot, Numeral::Int(i)) => Some(ExpKind::Int(!i)),
            (UnOp::BNot, Numeral::Flt(f)) => {
                if f.floor() == f && f >= i64::MIN as f64 && f < -(i64::MIN as f64) {
                    Some(ExpKind::Int(!(f as i64)))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    // ---- Operator emission ----

    /// Emit a binary arithmetic/bitwise instruction over RK operands.
    fn code_bin_expval(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let rk2 = self.exp_to_rk(e2)?;
        let rk1 = self.exp_to_rk(e1)?;
        self.free_exps(e1, e2);
        let pc = self.emit_abc(op, 0, rk1, rk2)?;
        e1.kind = ExpKind::Reloc(pc);
        self.fix_line(line);
        Ok(())
    }

    fn code_comparison(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let rk1 = match e1.kind {
            ExpKind::K(k) => opcode::rk_as_k(k),
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("comparison operand not RK-discharged"),
        };
        let rk2 = self.exp_to_rk(e2)?;
        self.free_exps(e1, e2);
        let pc = match op {
            BinOp::Ne => self.cond_jump(OpCode::Eq, 0, rk1, rk2)?,
            BinOp::Gt => self.cond_jump(OpCode::Lt, 1, rk2, rk1)?,
            BinOp::Ge => self.cond_jump(OpCode::Le, 1, rk2, rk1)?,
            BinOp::Eq => self.cond_jump(OpCode::Eq, 1, rk1, rk2)?,
            BinOp::Lt => self.cond_jump(OpCode::Lt, 1, rk1, rk2)?,
            BinOp::Le => self.cond_jump(OpCode::Le, 1, rk1, rk2)?,
            _ => unreachable!(),
        };
        e1.kind = ExpKind::Jump(pc);
        Ok(())
    }

    /// Apply a unary operator.
    fn apply_prefix(&mut self, op: UnOp, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        match op {
            UnOp::Minus | UnOp::BNot => {
                if let Some(n) = e.as_numeral() {
                    if let Some(folded) = Self::fold_unary(op, n) {
                        e.kind = folded;
                        return Ok(());
                    }
                }
                let opcode = if op == UnOp::Minus {
                    OpCode::Unm
                } else {
                    OpCode::BNot
                };
                self.code_unary(opcode, e, line)?;
            }
            UnOp::Not => self.code_not(e)?,
            UnOp::Len => self.code_unary(OpCode::Len, e, line)?,
        }
        Ok(())
    }

    fn code_unary(&mut self, op: OpCode, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        let r = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let pc = self.emit_abc(op, 0, r, 0)?;
        e.kind = ExpKind::Reloc(pc);
        self.fix_line(line);
        Ok(())
    }

    /// Prepare the left operand before parsing the right one.
    fn apply_infix(&mut self, op: BinOp, e: &mut ExpDesc) -> Result<(), CompileError> {
        match op {
            BinOp::And => self.go_if_true(e)?,
            BinOp::Or => self.go_if_false(e)?,
            BinOp::Concat => self.exp_to_next_reg(e)?,
            op if op.is_foldable_arith() => {
                if e.as_numeral().is_none() {
                    self.exp_to_rk(e)?;
                }
            }
            _ => {
                self.exp_to_rk(e)?;
            }
        }
        Ok(())
    }

    /// Combine operands after the right side has been parsed.
    fn apply_posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        mut e2: ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.t, NO_JUMP);
                self.discharge_vars(&mut e2)?;
                let mut f = e2.f;
                self.concat_jumps(&mut f, e1.f)?;
                e2.f = f;
                *e1 = e2;
            }
            BinOp::Or => {
                debug_assert_eq!(e1.f, NO_JUMP);
                self.discharge_vars(&mut e2)?;
                let mut t = e2.t;
                self.concat_jumps(&mut t, e1.t)?;
                e2.t = t;
                *e1 = e2;
            }
            BinOp::Concat => {
                self.exp_to_val(&mut e2)?;
                let chained = match e2.kind {
                    ExpKind::Reloc(pc2)
                        if self.fs().proto.code[pc2 as usize].opcode() == OpCode::Concat =>
                    {
                        // `a .. (b .. c)` extends the rightmost concat.
                        let inst = self.fs().proto.code[pc2 as usize];
                        let b = match e1.kind {
                            ExpKind::NonReloc(r) => r,
                            _ => unreachable!("concat lhs not in a register"),
                        };
                        debug_assert_eq!(b + 1, inst.b());
                        self.free_exp(e1);
                        let mut inst = inst;
                        inst.set_b(b);
                        self.fs_mut().proto.code[pc2 as usize] = inst;
                        e1.kind = ExpKind::Reloc(pc2);
                        self.fix_line(line);
                        true
                    }
                    _ => false,
                };
                if !chained {
                    self.exp_to_next_reg(&mut e2)?;
                    self.code_bin_expval(OpCode::Concat, e1, &mut e2, line)?;
                }
            }
            op if op.is_comparison() => {
                self.code_comparison(op, e1, &mut e2)?;
            }
            _ => {
                if let (Some(a), Some(b)) = (e1.as_numeral(), e2.as_numeral()) {
                    if let Some(folded) = Self::fold_binary(op, a, b) {
                        e1.kind = folded;
                        return Ok(());
                    }
                }
                let opcode = match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Mod => OpCode::Mod,
                    BinOp::Pow => OpCode::Pow,
                    BinOp::Div => OpCode::Div,
                    BinOp::IDiv => OpCode::IDiv,
                    BinOp::BAnd => OpCode::BAnd,
                    BinOp::BOr => OpCode::BOr,
                    BinOp::BXor => OpCode::BXor,
                    BinOp::Shl => OpCode::Shl,
                    BinOp::Shr => OpCode::Shr,
                    _ => unreachable!(),
                };
                self.code_bin_expval(opcode, e1, &mut e2, line)?;
            }
        }
        Ok(())
    }

    /// Turn `t` into `t[k]`.
    fn index_expr(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> Result<(), CompileError> {
        debug_assert!(!t.has_jumps());
        let table_is_upval = matches!(t.kind, ExpKind::Upval(_));
        let table = match t.kind {
            ExpKind::Upval(u) => u,
            ExpKind::NonReloc(r) | ExpKind::Local(r) => r,
            _ => unreachable!("table expression not discharged"),
        };
        let key = self.exp_to_rk(k)?;
        t.kind = ExpKind::Indexed {
            table,
            key,
            table_is_upval,
        };
        Ok(())
    }

    // ---- Variables ----

    /// Resolve a name to a local, an upvalue, or `_ENV[name]`.
    fn single_var(&mut self, name: StrId) -> Result<ExpDesc, CompileError> {
        let level = self.funcs.len() - 1;
        if let Some(e) = self.resolve_var(level, name)? {
            return Ok(e);
        }
        let mut var = self
            .resolve_var(level, self.env_name)?
            .expect("_ENV is always reachable");
        let mut key = ExpDesc::new(ExpKind::Str(name));
        self.index_expr(&mut var, &mut key)?;
        Ok(var)
    }

    /// Find `name` as a local or upvalue of the function at `level`,
    /// creating capture chains through enclosing functions as needed.
    fn resolve_var(
        &mut self,
        level: usize,
        name: StrId,
    ) -> Result<Option<ExpDesc>, CompileError> {
        if let Some(reg) = self.funcs[level].scope.resolve_local(name) {
            if level < self.funcs.len() - 1 {
                // Captured by an inner function: its block must close
                // the upvalue on exit.
                self.funcs[level].scope.mark_upval(reg);
            }
            return Ok(Some(ExpDesc::new(ExpKind::Local(reg))));
        }
        if let Some(idx) = self.search_upvalue(level, name) {
            return Ok(Some(ExpDesc::new(ExpKind::Upval(idx))));
        }
        let parent = match self.funcs[level].parent {
            Some(p) => p,
            None => return Ok(None),
        };
        match self.resolve_var(parent, name)? {
            Some(e) => {
                let (in_stack, index) = match e.kind {
                    ExpKind::Local(reg) => (true, reg as u8),
                    ExpKind::Upval(idx) => (false, idx as u8),
                    _ => unreachable!(),
                };
                let idx = self.new_upvalue(level, name, in_stack, index)?;
                Ok(Some(ExpDesc::new(ExpKind::Upval(idx))))
            }
            None => Ok(None),
        }
    }

    fn search_upvalue(&self, level: usize, name: StrId) -> Option<u32> {
        self.funcs[level]
            .proto
            .upvalues
            .iter()
            .position(|u| u.name == Some(name))
            .map(|i| i as u32)
    }

    fn new_upvalue(
        &mut self,
        level: usize,
        name: StrId,
        in_stack: bool,
        index: u8,
    ) -> Result<u32, CompileError> {
        let ups = &mut self.funcs[level].proto.upvalues;
        if ups.len() >= 255 {
            return Err(self.error("too many upvalues"));
        }
        ups.push(UpvalDesc {
            name: Some(name),
            in_stack,
            index,
        });
        Ok((ups.len() - 1) as u32)
    }

    // ---- Locals ----

    fn new_local(&mut self, name: StrId) -> Result<(), CompileError> {
        let fs = self.fs_mut();
        if fs.scope.locals.len() >= 200 {
            return Err(self.error("too many local variables"));
        }
        let locvar_idx = fs.proto.local_vars.len();
        fs.proto.local_vars.push(LocalVar {
            name,
            start_pc: 0,
            end_pc: 0,
        });
        fs.scope.declare_local(name, locvar_idx);
        Ok(())
    }

    fn adjust_local_vars(&mut self, n: usize) {
        let fs = self.fs_mut();
        let pc = fs.proto.code.len() as u32;
        let total = fs.scope.nactive + n;
        for local in &fs.scope.locals[fs.scope.nactive..total] {
            fs.proto.local_vars[local.locvar_idx].start_pc = pc;
        }
        fs.scope.activate_locals(n);
    }

    fn remove_vars(&mut self, to_level: usize) {
        let fs = self.fs_mut();
        let pc = fs.proto.code.len() as u32;
        while fs.scope.nactive > to_level {
            fs.scope.nactive -= 1;
            let local = fs.scope.locals.pop().expect("active local");
            fs.proto.local_vars[local.locvar_idx].end_pc = pc;
        }
    }

    // ---- Blocks, labels, gotos ----

    fn enter_block(&mut self, is_loop: bool) {
        self.fs_mut().scope.enter_block(is_loop);
    }

    fn leave_block(&mut self) -> Result<(), CompileError> {
        let (has_upval, is_loop, first_local, inner_block) = {
            let fs = self.fs();
            let bl = fs.scope.current_block();
            (
                bl.has_upval,
                bl.is_loop,
                bl.first_local,
                fs.scope.blocks.len() > 1,
            )
        };
        if inner_block && has_upval {
            // A jump to the next instruction whose A operand closes the
            // block's upvalues.
            let j = self.emit_jump()?;
            self.patch_close(j, first_local as u32);
            self.patch_to_here(j)?;
        }
        if is_loop {
            // Pending breaks resolve here.
            let pc = self.get_label() as usize;
            let nactive = self.fs().scope.nactive;
            let label = LabelDesc {
                name: self.break_name,
                pc,
                nactive,
            };
            self.resolve_gotos_with(&label)?;
        }
        let bl = self.fs_mut().scope.blocks.pop().expect("block underflow");
        self.remove_vars(bl.first_local);
        debug_assert_eq!(self.fs().scope.nactive, bl.first_local);
        self.fs_mut().free_reg = bl.first_local as u32;
        self.fs_mut().scope.labels.truncate(bl.first_label);
        if !self.fs().scope.blocks.is_empty() {
            self.move_gotos_out(&bl)?;
        } else if bl.first_goto < self.fs().scope.gotos.len() {
            let g = self.fs().scope.gotos[bl.first_goto].clone();
            return Err(self.undefined_goto(&g));
        }
        Ok(())
    }

    fn undefined_goto(&self, g: &GotoDesc) -> CompileError {
        if g.is_break {
            self.error_at(g.line, "break outside a loop")
        } else {
            self.error_at(
                g.line,
                format!(
                    "no visible label '{}' for goto",
                    self.strings.display(g.name)
                ),
            )
        }
    }

    /// Resolve every pending goto of the current block that matches a
    /// new label.
    fn resolve_gotos_with(&mut self, label: &LabelDesc) -> Result<(), CompileError> {
        let first_goto = self.fs().scope.current_block().first_goto;
        let mut i = first_goto;
        while i < self.fs().scope.gotos.len() {
            if self.fs().scope.gotos[i].name == label.name {
                self.close_goto(i, label)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn close_goto(&mut self, g_idx: usize, label: &LabelDesc) -> Result<(), CompileError> {
        let g = self.fs().scope.gotos[g_idx].clone();
        if g.nactive < label.nactive {
            let local_name = {
                let fs = self.fs();
                self.strings.display(fs.scope.locals[g.nactive].name).into_owned()
            };
            return Err(self.error_at(
                g.line,
                format!(
                    "<goto {}> jumps into the scope of local '{}'",
                    self.strings.display(g.name),
                    local_name
                ),
            ));
        }
        self.patch_list(g.pc as i32, label.pc as i32)?;
        self.fs_mut().scope.gotos.remove(g_idx);
        Ok(())
    }

    /// Hand unresolved gotos of a finished block to the enclosing one,
    /// closing upvalues on the way out when needed.
    fn move_gotos_out(&mut self, bl: &scope::Block) -> Result<(), CompileError> {
        let mut i = bl.first_goto;
        while i < self.fs().scope.gotos.len() {
            if self.fs().scope.gotos[i].nactive > bl.first_local {
                let pc = self.fs().scope.gotos[i].pc;
                if bl.has_upval {
                    self.patch_close(pc as i32, bl.first_local as u32);
                }
                self.fs_mut().scope.gotos[i].nactive = bl.first_local;
            }
            let g_name = self.fs().scope.gotos[i].name;
            let label = {
                let fs = self.fs();
                let first_label = fs.scope.current_block().first_label;
                fs.scope.labels[first_label..]
                    .iter()
                    .find(|l| l.name == g_name)
                    .cloned()
            };
            match label {
                Some(l) => self.close_goto(i, &l)?,
                None => i += 1,
            }
        }
        Ok(())
    }

    // ---- Expressions (parser) ----

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_SYNTAX_DEPTH {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    fn expression(&mut self) -> Result<ExpDesc, CompileError> {
        self.sub_expression(0)
    }

    fn sub_expression(&mut self, limit: u8) -> Result<ExpDesc, CompileError> {
        self.enter_level()?;
        let mut e = if let Some(uop) = self.check_unary_op()? {
            let line = self.line();
            self.next_token()?;
            let mut operand = self.sub_expression(UNARY_PRIORITY)?;
            self.apply_prefix(uop, &mut operand, line)?;
            operand
        } else {
            self.simple_expression()?
        };
        while let Some(bop) = self.check_binary_op()? {
            let (left, right) = bop.priority();
            if left <= limit {
                break;
            }
            let line = self.line();
            self.next_token()?;
            self.apply_infix(bop, &mut e)?;
            let e2 = self.sub_expression(right)?;
            self.apply_posfix(bop, &mut e, e2, line)?;
        }
        self.leave_level();
        Ok(e)
    }

    fn check_unary_op(&self) -> Result<Option<UnOp>, CompileError> {
        Ok(match self.cur_tok()? {
            Token::Minus => Some(UnOp::Minus),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            Token::Tilde => Some(UnOp::BNot),
            _ => None,
        })
    }

    fn check_binary_op(&self) -> Result<Option<BinOp>, CompileError> {
        Ok(match self.cur_tok()? {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::FloorDiv => Some(BinOp::IDiv),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::DotDot => Some(BinOp::Concat),
            Token::Ampersand => Some(BinOp::BAnd),
            Token::Pipe => Some(BinOp::BOr),
            Token::Tilde => Some(BinOp::BXor),
            Token::ShiftLeft => Some(BinOp::Shl),
            Token::ShiftRight => Some(BinOp::Shr),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::Ne),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::Le),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::Ge),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        })
    }

    fn simple_expression(&mut self) -> Result<ExpDesc, CompileError> {
        let e = match self.cur_tok()? {
            Token::Integer(i) => ExpDesc::new(ExpKind::Int(i)),
            Token::Float(f) => ExpDesc::new(ExpKind::Flt(f)),
            Token::Str(s) => ExpDesc::new(ExpKind::Str(s)),
            Token::Nil => ExpDesc::new(ExpKind::Nil),
            Token::True => ExpDesc::new(ExpKind::True),
            Token::False => ExpDesc::new(ExpKind::False),
            Token::Ellipsis => {
                if !self.fs().proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                let pc = self.emit_abc(OpCode::Vararg, 0, 1, 0)?;
                ExpDesc::new(ExpKind::Vararg(pc))
            }
            Token::LBrace => return self.table_constructor(),
            Token::Function => {
                self.next_token()?;
                return self.function_body(false, self.lexer.lastline);
            }
            _ => return self.suffixed_expression(),
        };
        self.next_token()?;
        Ok(e)
    }

    fn primary_expression(&mut self) -> Result<ExpDesc, CompileError> {
        match self.cur_tok()? {
            Token::LParen => {
                let line = self.line();
                self.next_token()?;
                let mut e = self.expression()?;
                self.check_match(&Token::RParen, &Token::LParen, line)?;
                // Parentheses truncate to a single value.
                self.discharge_vars(&mut e)?;
                Ok(e)
            }
            Token::Name(id) => {
                self.next_token()?;
                self.single_var(id)
            }
            _ => Err(self.error("unexpected symbol")),
        }
    }

    fn suffixed_expression(&mut self) -> Result<ExpDesc, CompileError> {
        let line = self.line();
        let mut e = self.primary_expression()?;
        loop {
            match self.cur_tok()? {
                Token::Dot => {
                    self.next_token()?;
                    let name = self.expect_name()?;
                    self.exp_to_any_reg_up(&mut e)?;
                    let mut key = ExpDesc::new(ExpKind::Str(name));
                    self.index_expr(&mut e, &mut key)?;
                }
                Token::LBracket => {
                    self.next_token()?;
                    self.exp_to_any_reg_up(&mut e)?;
                    let mut key = self.expression()?;
                    self.exp_to_val(&mut key)?;
                    self.expect(&Token::RBracket)?;
                    self.index_expr(&mut e, &mut key)?;
                }
                Token::Colon => {
                    self.next_token()?;
                    let name = self.expect_name()?;
                    let mut key = ExpDesc::new(ExpKind::Str(name));
                    self.emit_self(&mut e, &mut key)?;
                    e = self.call_arguments(e, line)?;
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    self.exp_to_next_reg(&mut e)?;
                    e = self.call_arguments(e, line)?;
                }
                _ => return Ok(e),
            }
        }
    }

    fn call_arguments(&mut self, func: ExpDesc, line: u32) -> Result<ExpDesc, CompileError> {
        let base = match func.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!("callee not in a register"),
        };
        let mut args = ExpDesc::void();
        match self.cur_tok()? {
            Token::LParen => {
                self.next_token()?;
                if !self.check(&Token::RParen) {
                    args = self.expression_list_open()?;
                    if args.is_multiret() {
                        self.set_multret(&args)?;
                    }
                }
                self.check_match(&Token::RParen, &Token::LParen, line)?;
            }
            Token::Str(s) => {
                args = ExpDesc::new(ExpKind::Str(s));
                self.next_token()?;
            }
            Token::LBrace => {
                args = self.table_constructor()?;
            }
            _ => return Err(self.error("function arguments expected")),
        }
        let nparams = if args.is_multiret() {
            MULTRET
        } else {
            if !matches!(args.kind, ExpKind::Void) {
                self.exp_to_next_reg(&mut args)?;
            }
            (self.fs().free_reg - (base + 1)) as i32
        };
        let pc = self.emit_abc(OpCode::Call, base, (nparams + 1) as u32, 2)?;
        self.fix_line(line);
        // The call removes function and arguments; one result remains.
        self.fs_mut().free_reg = base + 1;
        Ok(ExpDesc::new(ExpKind::Call(pc)))
    }

    /// `e1, e2, ...` leaving the last expression open.
    fn expression_list_open(&mut self) -> Result<ExpDesc, CompileError> {
        let mut e = self.expression()?;
        while self.test_next(&Token::Comma)? {
            self.exp_to_next_reg(&mut e)?;
            e = self.expression()?;
        }
        Ok(e)
    }

    /// Expression list returning (count, last expression).
    fn expression_list(&mut self) -> Result<(usize, ExpDesc), CompileError> {
        let mut n = 1;
        let mut e = self.expression()?;
        while self.test_next(&Token::Comma)? {
            self.exp_to_next_reg(&mut e)?;
            e = self.expression()?;
            n += 1;
        }
        Ok((n, e))
    }

    /// Balance `nvars` assignment targets against `nexps` values.
    fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        e: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        let extra = nvars as i32 - nexps as i32;
        if e.is_multiret() {
            let wanted = (extra + 1).max(0);
            self.set_returns(e, wanted)?;
            if wanted > 1 {
                self.reserve_regs((wanted - 1) as u32)?;
            }
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                self.exp_to_next_reg(e)?;
            }
            if extra > 0 {
                let reg = self.fs().free_reg;
                self.reserve_regs(extra as u32)?;
                self.emit_nil(reg, extra as u32)?;
            }
        }
        if nexps > nvars {
            self.fs_mut().free_reg -= (nexps - nvars) as u32;
        }
        Ok(())
    }

    // ---- Table constructor ----

    fn table_constructor(&mut self) -> Result<ExpDesc, CompileError> {
        let line = self.line();
        let pc = self.emit_abc(OpCode::NewTable, 0, 0, 0)?;
        let mut table = ExpDesc::new(ExpKind::Reloc(pc));
        self.exp_to_next_reg(&mut table)?;
        let table_reg = match table.kind {
            ExpKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        let mut na = 0usize;
        let mut nh = 0usize;
        let mut to_store = 0usize;
        let mut pending = ExpDesc::void();

        self.expect(&Token::LBrace)?;
        loop {
            if self.check(&Token::RBrace) {
                break;
            }
            // Flush the previous list item.
            if !matches!(pending.kind, ExpKind::Void) {
                self.exp_to_next_reg(&mut pending)?;
                pending = ExpDesc::void();
                if to_store == LFIELDS_PER_FLUSH as usize {
                    self.flush_list(table_reg, na, to_store as i32)?;
                    to_store = 0;
                }
            }
            let is_record = match self.cur_tok()? {
                Token::Name(_) => self.peek_is_assign()?,
                Token::LBracket => true,
                _ => false,
            };
            if is_record {
                let mut key = match self.cur_tok()? {
                    Token::Name(name) => {
                        self.next_token()?;
                        self.expect(&Token::Assign)?;
                        let k = self.string_constant(name);
                        ExpDesc::new(ExpKind::K(k))
                    }
                    _ => {
                        self.next_token()?; // '['
                        let mut key = self.expression()?;
                        self.exp_to_val(&mut key)?;
                        self.expect(&Token::RBracket)?;
                        self.expect(&Token::Assign)?;
                        key
                    }
                };
                self.rec_field(table_reg, &mut key)?;
                nh += 1;
            } else {
                pending = self.expression()?;
                na += 1;
                to_store += 1;
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }
        self.check_match(&Token::RBrace, &Token::LBrace, line)?;

        if to_store > 0 {
            if pending.is_multiret() {
                self.set_multret(&pending)?;
                self.flush_list(table_reg, na, MULTRET)?;
                na -= 1; // the open element is not counted
            } else {
                if !matches!(pending.kind, ExpKind::Void) {
                    self.exp_to_next_reg(&mut pending)?;
                }
                self.flush_list(table_reg, na, to_store as i32)?;
            }
        }

        {
            let inst = &mut self.fs_mut().proto.code[pc as usize];
            inst.set_b(int_to_fb(na));
            inst.set_c(int_to_fb(nh));
        }
        Ok(table)
    }

    fn peek_is_assign(&mut self) -> Result<bool, CompileError> {
        match self.lexer.peek_ahead(self.strings) {
            Ok(t) => Ok(t.token == Token::Assign),
            Err(e) => Err(self.lex_error(e)),
        }
    }

    fn rec_field(&mut self, table_reg: u32, key: &mut ExpDesc) -> Result<(), CompileError> {
        let free = self.fs().free_reg;
        let rk_key = self.exp_to_rk(key)?;
        let mut val = self.expression()?;
        let rk_val = self.exp_to_rk(&mut val)?;
        self.emit_abc(OpCode::SetTable, table_reg, rk_key, rk_val)?;
        self.fs_mut().free_reg = free;
        Ok(())
    }

    fn flush_list(&mut self, base: u32, nelems: usize, to_store: i32) -> Result<(), CompileError> {
        debug_assert!(nelems >= 1);
        let c = ((nelems - 1) as u32 / LFIELDS_PER_FLUSH) + 1;
        let b = if to_store == MULTRET { 0 } else { to_store as u32 };
        if c <= MAX_C {
            self.emit_abc(OpCode::SetList, base, b, c)?;
        } else if c <= opcode::MAX_AX {
            self.emit_abc(OpCode::SetList, base, b, 0)?;
            let line = self.lexer.lastline;
            self.emit(Instruction::new_ax(OpCode::ExtraArg, c), line)?;
        } else {
            return Err(self.error("constructor too long"));
        }
        self.fs_mut().free_reg = base + 1;
        Ok(())
    }

    // ---- Function bodies ----

    fn function_body(&mut self, is_method: bool, line: u32) -> Result<ExpDesc, CompileError> {
        self.open_func();
        self.fs_mut().proto.line_defined = line;
        self.enter_block(false);
        self.expect(&Token::LParen)?;
        if is_method {
            self.new_local(self.self_name)?;
            self.adjust_local_vars(1);
        }
        self.param_list()?;
        self.expect(&Token::RParen)?;
        self.stat_list()?;
        let end_line = self.line();
        self.fs_mut().proto.last_line_defined = end_line;
        self.check_match(&Token::End, &Token::Function, line)?;
        let proto = self.close_func()?;
        // Create the closure in the enclosing function.
        let idx = {
            let parent = self.fs_mut();
            parent.proto.protos.push(proto);
            (parent.proto.protos.len() - 1) as u32
        };
        let pc = self.emit_abx(OpCode::Closure, 0, idx)?;
        self.fix_line(line);
        let mut e = ExpDesc::new(ExpKind::Reloc(pc));
        self.exp_to_next_reg(&mut e)?;
        Ok(e)
    }

    fn param_list(&mut self) -> Result<(), CompileError> {
        let mut nparams = 0usize;
        if !self.check(&Token::RParen) {
            loop {
                match self.cur_tok()? {
                    Token::Name(id) => {
                        self.next_token()?;
                        self.new_local(id)?;
                        nparams += 1;
                    }
                    Token::Ellipsis => {
                        self.next_token()?;
                        self.fs_mut().proto.is_vararg = true;
                        break;
                    }
                    _ => return Err(self.error("<name> or '...' expected")),
                }
                if !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let nactive = self.fs().scope.nactive as u32;
        self.fs_mut().proto.num_params = nactive as u8;
        self.reserve_regs(nactive)?;
        Ok(())
    }

    // ---- Statements ----

    fn stat_list(&mut self) -> Result<(), CompileError> {
        while !self.block_follow(true) {
            if self.check(&Token::Return) {
                self.return_statement()?;
                return Ok(());
            }
            self.statement()?;
        }
        Ok(())
    }

    /// A plain nested block.
    fn block(&mut self) -> Result<(), CompileError> {
        self.enter_block(false);
        self.stat_list()?;
        self.leave_block()
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        self.enter_level()?;
        let line = self.line();
        match self.cur_tok()? {
            Token::Semi => {
                self.next_token()?;
            }
            Token::If => self.if_statement(line)?,
            Token::While => self.while_statement(line)?,
            Token::Do => {
                self.next_token()?;
                self.block()?;
                self.check_match(&Token::End, &Token::Do, line)?;
            }
            Token::For => self.for_statement(line)?,
            Token::Repeat => self.repeat_statement(line)?,
            Token::Function => self.function_statement(line)?,
            Token::Local => {
                self.next_token()?;
                if self.test_next(&Token::Function)? {
                    self.local_function()?;
                } else {
                    self.local_statement()?;
                }
            }
            Token::DoubleColon => {
                self.next_token()?;
                self.label_statement()?;
            }
            Token::Break | Token::Goto => self.goto_statement()?,
            _ => self.expr_statement()?,
        }
        debug_assert!(self.fs().free_reg >= self.fs().scope.nactive as u32);
        self.fs_mut().free_reg = self.fs().scope.nactive as u32;
        self.leave_level();
        Ok(())
    }

    /// A condition expression; returns its false-branch jump list.
    fn condition(&mut self) -> Result<i32, CompileError> {
        let mut e = self.expression()?;
        if matches!(e.kind, ExpKind::Nil) {
            e.kind = ExpKind::False;
        }
        self.go_if_true(&mut e)?;
        Ok(e.f)
    }

    fn if_statement(&mut self, line: u32) -> Result<(), CompileError> {
        let mut escapes = NO_JUMP;
        self.next_token()?; // 'if'
        let mut jump_false = self.then_block()?;
        while self.check(&Token::ElseIf) {
            let j = self.emit_jump()?;
            self.concat_jumps(&mut escapes, j)?;
            self.patch_to_here(jump_false)?;
            self.next_token()?; // 'elseif'
            jump_false = self.then_block()?;
        }
        if self.check(&Token::Else) {
            let j = self.emit_jump()?;
            self.concat_jumps(&mut escapes, j)?;
            self.patch_to_here(jump_false)?;
            self.next_token()?; // 'else'
            self.block()?;
        } else {
            let mut e = escapes;
            self.concat_jumps(&mut e, jump_false)?;
            escapes = e;
        }
        self.check_match(&Token::End, &Token::If, line)?;
        self.patch_to_here(escapes)?;
        Ok(())
    }

    /// Parses `cond then block`; returns the false-branch jump list.
    fn then_block(&mut self) -> Result<i32, CompileError> {
        let jump_false = self.condition()?;
        self.expect(&Token::Then)?;
        self.block()?;
        Ok(jump_false)
    }

    fn while_statement(&mut self, line: u32) -> Result<(), CompileError> {
        self.next_token()?; // 'while'
        let init = self.get_label();
        let cond_exit = self.condition()?;
        self.enter_block(true);
        self.expect(&Token::Do)?;
        self.block()?;
        let back = self.emit_jump()?;
        self.patch_list(back, init)?;
        self.check_match(&Token::End, &Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(cond_exit)?;
        Ok(())
    }

    fn repeat_statement(&mut self, line: u32) -> Result<(), CompileError> {
        let init = self.get_label();
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.next_token()?; // 'repeat'
        self.stat_list()?;
        self.check_match(&Token::Until, &Token::Repeat, line)?;
        let cond_exit = self.condition()?;
        let (has_upval, first_local) = {
            let bl = self.fs().scope.current_block();
            (bl.has_upval, bl.first_local)
        };
        if has_upval {
            self.patch_close(cond_exit, first_local as u32);
        }
        self.leave_block()?; // scope
        self.patch_list(cond_exit, init)?;
        self.leave_block()?; // loop
        Ok(())
    }

    fn for_statement(&mut self, line: u32) -> Result<(), CompileError> {
        self.next_token()?; // 'for'
        self.enter_block(true); // scope for loop and control variables
        let name = self.expect_name()?;
        match self.cur_tok()? {
            Token::Assign => self.numeric_for(name, line)?,
            Token::Comma | Token::In => self.generic_for(name, line)?,
            _ => return Err(self.error("'=' or 'in' expected")),
        }
        self.check_match(&Token::End, &Token::For, line)?;
        self.leave_block()?;
        Ok(())
    }

    /// One expression confined to a single fresh register.
    fn exp1(&mut self) -> Result<(), CompileError> {
        let mut e = self.expression()?;
        self.exp_to_next_reg(&mut e)
    }

    fn numeric_for(&mut self, name: StrId, line: u32) -> Result<(), CompileError> {
        let base = self.fs().free_reg;
        let idx_name = self.strings.intern(b"(for index)");
        let limit_name = self.strings.intern(b"(for limit)");
        let step_name = self.strings.intern(b"(for step)");
        self.new_local(idx_name)?;
        self.new_local(limit_name)?;
        self.new_local(step_name)?;
        self.new_local(name)?;
        self.expect(&Token::Assign)?;
        self.exp1()?; // initial value
        self.expect(&Token::Comma)?;
        self.exp1()?; // limit
        if self.test_next(&Token::Comma)? {
            self.exp1()?; // step
        } else {
            let k = self.add_constant(Constant::Integer(1));
            let reg = self.fs().free_reg;
            self.emit_load_k(reg, k)?;
            self.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn generic_for(&mut self, first_name: StrId, line: u32) -> Result<(), CompileError> {
        let base = self.fs().free_reg;
        let gen_name = self.strings.intern(b"(for generator)");
        let state_name = self.strings.intern(b"(for state)");
        let ctrl_name = self.strings.intern(b"(for control)");
        self.new_local(gen_name)?;
        self.new_local(state_name)?;
        self.new_local(ctrl_name)?;
        self.new_local(first_name)?;
        let mut nvars = 1usize;
        while self.test_next(&Token::Comma)? {
            let n = self.expect_name()?;
            self.new_local(n)?;
            nvars += 1;
        }
        self.expect(&Token::In)?;
        let (nexps, mut e) = self.expression_list()?;
        self.adjust_assign(3, nexps, &mut e)?;
        // Room for the iterator call.
        self.check_stack(3)?;
        self.for_body(base, line, nvars, false)
    }

    fn for_body(
        &mut self,
        base: u32,
        line: u32,
        nvars: usize,
        is_numeric: bool,
    ) -> Result<(), CompileError> {
        self.adjust_local_vars(3);
        self.expect(&Token::Do)?;
        let prep = if is_numeric {
            self.emit_asbx(OpCode::ForPrep, base, NO_JUMP)?
        } else {
            self.emit_jump()?
        };
        self.enter_block(false);
        self.adjust_local_vars(nvars);
        self.reserve_regs(nvars as u32)?;
        self.stat_list()?;
        self.leave_block()?;
        self.patch_to_here(prep)?;
        let end = if is_numeric {
            self.emit_asbx(OpCode::ForLoop, base, NO_JUMP)?
        } else {
            self.emit_abc(OpCode::TForCall, base, 0, nvars as u32)?;
            self.fix_line(line);
            self.emit_asbx(OpCode::TForLoop, base + 2, NO_JUMP)?
        };
        self.patch_list(end, prep + 1)?;
        self.fix_line(line);
        Ok(())
    }

    fn function_statement(&mut self, line: u32) -> Result<(), CompileError> {
        self.next_token()?; // 'function'
        let mut is_method = false;
        let name = self.expect_name()?;
        let mut var = self.single_var(name)?;
        loop {
            match self.cur_tok()? {
                Token::Dot => {
                    self.next_token()?;
                    let field = self.expect_name()?;
                    self.exp_to_any_reg_up(&mut var)?;
                    let mut key = ExpDesc::new(ExpKind::Str(field));
                    self.index_expr(&mut var, &mut key)?;
                }
                Token::Colon => {
                    self.next_token()?;
                    let field = self.expect_name()?;
                    self.exp_to_any_reg_up(&mut var)?;
                    let mut key = ExpDesc::new(ExpKind::Str(field));
                    self.index_expr(&mut var, &mut key)?;
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }
        let mut body = self.function_body(is_method, line)?;
        self.store_var(&var, &mut body)?;
        self.fix_line(line);
        Ok(())
    }

    fn local_function(&mut self) -> Result<(), CompileError> {
        let line = self.lexer.lastline;
        let name = self.expect_name()?;
        self.new_local(name)?;
        // The name is in scope inside its own body, for recursion; the
        // closure lands in the local's register.
        self.adjust_local_vars(1);
        self.function_body(false, line)?;
        // Debug scope starts once the closure is in place.
        let fs = self.fs_mut();
        let pc = fs.proto.code.len() as u32;
        let locvar_idx = fs.scope.locals[fs.scope.nactive - 1].locvar_idx;
        fs.proto.local_vars[locvar_idx].start_pc = pc;
        Ok(())
    }

    fn local_statement(&mut self) -> Result<(), CompileError> {
        let mut nvars = 0usize;
        loop {
            let name = self.expect_name()?;
            self.new_local(name)?;
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let (nexps, mut e) = if self.test_next(&Token::Assign)? {
            self.expression_list()?
        } else {
            (0, ExpDesc::void())
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_local_vars(nvars);
        Ok(())
    }

    /// `:: name ::`; the leading '::' is already consumed.
    fn label_statement(&mut self) -> Result<(), CompileError> {
        let name = self.expect_name()?;
        self.expect(&Token::DoubleColon)?;
        {
            let fs = self.fs();
            let first = fs.scope.current_block().first_label;
            if fs.scope.labels[first..].iter().any(|l| l.name == name) {
                let text = self.strings.display(name).into_owned();
                return Err(self.error(format!("label '{text}' already defined")));
            }
        }
        let pc = self.get_label() as usize;
        let mut nactive = self.fs().scope.nactive;
        let label_idx = self.fs().scope.labels.len();
        self.fs_mut().scope.labels.push(LabelDesc { name, pc, nactive });
        // Skip following no-op statements; a trailing label may assume
        // the block's locals are already dead.
        loop {
            match self.cur_tok()? {
                Token::Semi => {
                    self.next_token()?;
                }
                Token::DoubleColon => {
                    self.next_token()?;
                    self.label_statement()?;
                }
                _ => break,
            }
        }
        if self.block_follow(false) {
            nactive = self.fs().scope.current_block().first_local;
            self.fs_mut().scope.labels[label_idx].nactive = nactive;
        }
        let label = self.fs().scope.labels[label_idx].clone();
        self.resolve_gotos_with(&label)?;
        Ok(())
    }

    fn goto_statement(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        let (name, is_break) = if self.test_next(&Token::Break)? {
            (self.break_name, true)
        } else {
            self.next_token()?; // 'goto'
            (self.expect_name()?, false)
        };
        let pc = self.emit_jump()?;
        let nactive = self.fs().scope.nactive;
        self.fs_mut().scope.gotos.push(GotoDesc {
            name,
            pc: pc as usize,
            line,
            nactive,
            is_break,
        });
        // A backward goto resolves against labels already visible in
        // the current block.
        let g_idx = self.fs().scope.gotos.len() - 1;
        let label = {
            let fs = self.fs();
            let first = fs.scope.current_block().first_label;
            fs.scope.labels[first..]
                .iter()
                .find(|l| l.name == name)
                .cloned()
        };
        if let Some(l) = label {
            self.close_goto(g_idx, &l)?;
        }
        Ok(())
    }

    fn expr_statement(&mut self) -> Result<(), CompileError> {
        let e = self.suffixed_expression()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            if !matches!(
                e.kind,
                ExpKind::Local(_) | ExpKind::Upval(_) | ExpKind::Indexed { .. }
            ) {
                return Err(self.error("syntax error"));
            }
            let mut lhs = vec![e];
            while self.test_next(&Token::Comma)? {
                let next = self.suffixed_expression()?;
                if !matches!(
                    next.kind,
                    ExpKind::Local(_) | ExpKind::Upval(_) | ExpKind::Indexed { .. }
                ) {
                    return Err(self.error("syntax error"));
                }
                if !matches!(next.kind, ExpKind::Indexed { .. }) {
                    self.check_conflict(&mut lhs, &next)?;
                }
                lhs.push(next);
            }
            self.expect(&Token::Assign)?;
            let (nexps, mut rhs) = self.expression_list()?;
            if nexps == lhs.len() {
                self.set_one_ret(&mut rhs);
                self.store_var(lhs.last().unwrap(), &mut rhs)?;
            } else {
                self.adjust_assign(lhs.len(), nexps, &mut rhs)?;
                let reg = self.fs().free_reg - 1;
                let mut top = ExpDesc::new(ExpKind::NonReloc(reg));
                self.store_var(lhs.last().unwrap(), &mut top)?;
            }
            // Remaining targets take the values below, right to left.
            for var in lhs[..lhs.len() - 1].iter().rev() {
                let reg = self.fs().free_reg - 1;
                let mut top = ExpDesc::new(ExpKind::NonReloc(reg));
                self.store_var(var, &mut top)?;
            }
            Ok(())
        } else {
            match e.kind {
                ExpKind::Call(pc) => {
                    // Statement call: discard all results.
                    self.fs_mut().proto.code[pc as usize].set_c(1);
                    Ok(())
                }
                _ => Err(self.error("syntax error")),
            }
        }
    }

    /// When later assignment targets alias the local or upvalue being
    /// assigned, previous targets switch to a safe copy.
    fn check_conflict(
        &mut self,
        lhs: &mut [ExpDesc],
        new_var: &ExpDesc,
    ) -> Result<(), CompileError> {
        let extra = self.fs().free_reg;
        let mut conflict = false;
        let (v_is_upval, v_info) = match new_var.kind {
            ExpKind::Local(r) => (false, r),
            ExpKind::Upval(u) => (true, u),
            _ => return Ok(()),
        };
        for prev in lhs.iter_mut() {
            if let ExpKind::Indexed {
                table,
                key,
                table_is_upval,
            } = prev.kind
            {
                if table_is_upval == v_is_upval && table == v_info {
                    conflict = true;
                    prev.kind = ExpKind::Indexed {
                        table: extra,
                        key,
                        table_is_upval: false,
                    };
                }
                if !v_is_upval && !opcode::is_k(key) && key == v_info {
                    conflict = true;
                    prev.kind = ExpKind::Indexed {
                        table,
                        key: extra,
                        table_is_upval,
                    };
                }
            }
        }
        if conflict {
            let op = if v_is_upval {
                OpCode::GetUpval
            } else {
                OpCode::Move
            };
            self.emit_abc(op, extra, v_info, 0)?;
            self.reserve_regs(1)?;
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        self.next_token()?; // 'return'
        let mut first = self.fs().scope.nactive as u32;
        let nret;
        if self.block_follow(true) || self.check(&Token::Semi) {
            nret = 0;
        } else {
            let (n, mut e) = self.expression_list()?;
            if e.is_multiret() {
                self.set_multret(&e)?;
                if let ExpKind::Call(pc) = e.kind {
                    if n == 1 {
                        // `return f(...)` becomes a tail call.
                        let inst = &mut self.fs_mut().proto.code[pc as usize];
                        let (a, b) = (inst.a(), inst.b());
                        *inst = Instruction::abc(OpCode::TailCall, a, b, 0);
                    }
                }
                nret = MULTRET;
            } else if n == 1 {
                first = self.exp_to_any_reg(&mut e)?;
                nret = 1;
            } else {
                self.exp_to_next_reg(&mut e)?;
                nret = n as i32;
                debug_assert_eq!(nret, self.fs().free_reg as i32 - first as i32);
            }
        }
        self.emit_ret(first, nret)?;
        self.test_next(&Token::Semi)?;
        Ok(())
    }

    fn emit_ret(&mut self, first: u32, nret: i32) -> Result<(), CompileError> {
        self.emit_abc(OpCode::Return, first, (nret + 1) as u32, 0)?;
        Ok(())
    }

    // ---- Function open/close ----

    fn open_func(&mut self) {
        let parent = if self.funcs.is_empty() {
            None
        } else {
            Some(self.funcs.len() - 1)
        };
        let mut fs = FuncState::new(parent);
        fs.proto.source = Some(self.source_id);
        self.funcs.push(fs);
    }

    fn close_func(&mut self) -> Result<Rc<Proto>, CompileError> {
        self.emit_ret(0, 0)?;
        self.leave_block()?;
        let fs = self.funcs.pop().expect("function underflow");
        debug_assert!(fs.scope.blocks.is_empty());
        Ok(Rc::new(fs.proto))
    }

    fn main_func(&mut self) -> Result<Rc<Proto>, CompileError> {
        self.open_func();
        {
            let env_name = self.env_name;
            let fs = self.fs_mut();
            fs.proto.is_vararg = true;
            // The chunk's single upvalue is its environment.
            fs.proto.upvalues.push(UpvalDesc {
                name: Some(env_name),
                in_stack: true,
                index: 0,
            });
        }
        self.enter_block(false);
        self.stat_list()?;
        if !self.check(&Token::Eof) {
            return Err(self.error("'<eof>' expected"));
        }
        self.close_func()
    }
}

// ---- Shared integer helpers (mirrored by the runtime) ----

/// Floor division on integers.
pub fn lua_int_floordiv(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        q.wrapping_sub(1)
    } else {
        q
    }
}

/// Modulo with the sign of the divisor.
pub fn lua_int_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Float modulo: `a - floor(a/b)*b`, via the sign-corrected remainder.
pub fn lua_float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// Shift left with Lua semantics: negative counts shift right, counts
/// past 63 in either direction produce 0.
pub fn lua_shift_left(a: i64, b: i64) -> i64 {
    if b < 0 {
        if b <= -64 {
            0
        } else {
            ((a as u64) >> (-b) as u32) as i64
        }
    } else if b >= 64 {
        0
    } else {
        ((a as u64) << b as u32) as i64
    }
}
