/// Scope bookkeeping for one function under compilation: active
/// locals, block nesting, and the label/goto lists used to resolve
/// `goto` and `break` at block exit.
use crescent_core::string::StrId;

/// A declared local. Its register is its position among the active
/// locals; `locvar_idx` points at the debug record in the prototype.
#[derive(Clone, Debug)]
pub struct ActiveLocal {
    pub name: StrId,
    pub locvar_idx: usize,
}

/// One lexical block.
#[derive(Clone, Debug)]
pub struct Block {
    /// Active-local count on entry.
    pub first_local: usize,
    /// Index of the first label belonging to this block.
    pub first_label: usize,
    /// Index of the first pending goto created inside this block.
    pub first_goto: usize,
    /// `break` targets this block.
    pub is_loop: bool,
    /// Some local of this block is captured by an inner closure, so
    /// leaving it must close upvalues.
    pub has_upval: bool,
}

/// A visible label.
#[derive(Clone, Debug)]
pub struct LabelDesc {
    pub name: StrId,
    pub pc: usize,
    /// Active locals at the label.
    pub nactive: usize,
}

/// A forward goto (or break) waiting for its label.
#[derive(Clone, Debug)]
pub struct GotoDesc {
    pub name: StrId,
    /// pc of the emitted JMP.
    pub pc: usize,
    pub line: u32,
    /// Active locals at the jump.
    pub nactive: usize,
    /// True for `break` (improves the unresolved-goto message).
    pub is_break: bool,
}

pub struct ScopeManager {
    /// Declared locals; entries past `nactive` are not yet visible.
    pub locals: Vec<ActiveLocal>,
    /// Count of locals currently in scope.
    pub nactive: usize,
    pub blocks: Vec<Block>,
    pub labels: Vec<LabelDesc>,
    pub gotos: Vec<GotoDesc>,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            nactive: 0,
            blocks: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
        }
    }

    /// Declare a local; it stays invisible until activated.
    pub fn declare_local(&mut self, name: StrId, locvar_idx: usize) {
        self.locals.push(ActiveLocal { name, locvar_idx });
    }

    /// Make the last `n` declared locals visible.
    pub fn activate_locals(&mut self, n: usize) {
        self.nactive += n;
        debug_assert!(self.nactive <= self.locals.len());
    }

    /// Register of a visible local by name, innermost first.
    pub fn resolve_local(&self, name: StrId) -> Option<u32> {
        self.locals[..self.nactive]
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| i as u32)
    }

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(Block {
            first_local: self.nactive,
            first_label: self.labels.len(),
            first_goto: self.gotos.len(),
            is_loop,
            has_upval: false,
        });
    }

    /// Mark the block owning register `level` as having a captured
    /// local.
    pub fn mark_upval(&mut self, level: u32) {
        for bl in self.blocks.iter_mut().rev() {
            if bl.first_local <= level as usize {
                bl.has_upval = true;
                return;
            }
        }
        // Captured local belongs to the function scope itself.
        if let Some(first) = self.blocks.first_mut() {
            first.has_upval = true;
        }
    }

    pub fn current_block(&self) -> &Block {
        self.blocks.last().expect("no active block")
    }

    pub fn current_block_mut(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("no active block")
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
