//! Expression evaluators.
//!
//! The plan instantiator lowers every expression into a straight-line
//! program over *roles*. A role names a tuple slot in the evaluation
//! context; the context binds at most one tuple per role, plus two buffers
//! it owns itself: the scratch tuple (intermediate results) and the
//! constant tuple (literals, filled once at instantiation).
//!
//! Three program kinds:
//! - [`AEval`] — arithmetic/copy instructions writing into bound tuples,
//! - [`BEval`] — a conjunction of comparisons, each side optionally
//!   prepared by a nested arithmetic program (predicates arrive in CNF),
//! - [`HEval`] — column hashing for the linear-hash index, xxh64 over the
//!   logical column bytes.
//!
//! Instructions are typed enum variants so the interpreter is a single
//! match with no runtime type checks.

use xxhash_rust::xxh64::Xxh64;

use crate::exec::store::{StorePool, TuplePtr};
use crate::layout::{bcol, ccol, cstr, fcol, icol, set_bcol, set_ccol, set_fcol, set_icol};
use crate::types::AttrType;

/// Seed for all engine-internal hashing.
const HASH_SEED: u64 = 0x517cc1b727220a95;

/// Named tuple slots an instruction can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Single-input operators' current input tuple.
    Input,
    /// Freshly allocated output tuple.
    Output,
    /// Left input of a binary operator.
    Left,
    /// Right input of a binary operator.
    Right,
    /// Destination of a whole-tuple copy.
    Copy,
    /// The constant tuple (context-owned).
    Const,
    /// The scratch tuple (context-owned).
    Scratch,
    /// Stored tuple during index maintenance / stored-row comparisons.
    Update,
}

pub const NUM_ROLES: usize = 8;

impl Role {
    #[inline]
    fn idx(self) -> usize {
        match self {
            Role::Input => 0,
            Role::Output => 1,
            Role::Left => 2,
            Role::Right => 3,
            Role::Copy => 4,
            Role::Const => 5,
            Role::Scratch => 6,
            Role::Update => 7,
        }
    }
}

/// A (role, column) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub role: Role,
    pub col: u32,
}

impl Operand {
    pub fn new(role: Role, col: u32) -> Self {
        Self { role, col }
    }
}

/// Binds roles to tuples for one evaluation. Owns the scratch and constant
/// buffers; everything else is read/written through the store pool.
#[derive(Debug, Default)]
pub struct EvalContext {
    bindings: [Option<TuplePtr>; NUM_ROLES],
    scratch: Vec<u8>,
    consts: Vec<u8>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision the scratch tuple.
    pub fn set_scratch(&mut self, len: usize) {
        self.scratch = vec![0u8; len];
    }

    /// Install the constant tuple.
    pub fn set_consts(&mut self, consts: Vec<u8>) {
        self.consts = consts;
    }

    /// Bind `role` to a tuple. Rebinding is the normal per-element pattern.
    #[inline]
    pub fn bind(&mut self, role: Role, tuple: TuplePtr) {
        debug_assert!(!matches!(role, Role::Const | Role::Scratch));
        self.bindings[role.idx()] = Some(tuple);
    }

    #[inline]
    fn bound(&self, role: Role) -> TuplePtr {
        match self.bindings[role.idx()] {
            Some(p) => p,
            None => panic!("evaluator role {role:?} is not bound"),
        }
    }

    #[inline]
    fn read<'a>(&'a self, stores: &'a StorePool, role: Role) -> &'a [u8] {
        match role {
            Role::Scratch => &self.scratch,
            Role::Const => &self.consts,
            _ => stores.tuple(self.bound(role)),
        }
    }

    #[inline]
    fn read_i32(&self, stores: &StorePool, op: Operand) -> i32 {
        icol(self.read(stores, op.role), op.col)
    }

    #[inline]
    fn read_f32(&self, stores: &StorePool, op: Operand) -> f32 {
        fcol(self.read(stores, op.role), op.col)
    }

    #[inline]
    fn read_u8(&self, stores: &StorePool, op: Operand) -> u8 {
        bcol(self.read(stores, op.role), op.col)
    }

    #[inline]
    fn write_i32(&mut self, stores: &mut StorePool, op: Operand, v: i32) {
        match op.role {
            Role::Scratch => set_icol(&mut self.scratch, op.col, v),
            Role::Const => panic!("write to CONST role"),
            _ => set_icol(stores.tuple_mut(self.bound(op.role)), op.col, v),
        }
    }

    #[inline]
    fn write_f32(&mut self, stores: &mut StorePool, op: Operand, v: f32) {
        match op.role {
            Role::Scratch => set_fcol(&mut self.scratch, op.col, v),
            Role::Const => panic!("write to CONST role"),
            _ => set_fcol(stores.tuple_mut(self.bound(op.role)), op.col, v),
        }
    }

    #[inline]
    fn write_u8(&mut self, stores: &mut StorePool, op: Operand, v: u8) {
        match op.role {
            Role::Scratch => set_bcol(&mut self.scratch, op.col, v),
            Role::Const => panic!("write to CONST role"),
            _ => set_bcol(stores.tuple_mut(self.bound(op.role)), op.col, v),
        }
    }

    fn write_bytes(&mut self, stores: &mut StorePool, op: Operand, v: &[u8]) {
        match op.role {
            Role::Scratch => set_ccol(&mut self.scratch, op.col, v),
            Role::Const => panic!("write to CONST role"),
            _ => set_ccol(stores.tuple_mut(self.bound(op.role)), op.col, v),
        }
    }
}

// ── Arithmetic programs ────────────────────────────────────────────────────

/// One arithmetic or copy instruction.
#[derive(Debug, Clone)]
pub enum AInstr {
    IntAdd(Operand, Operand, Operand),
    IntSub(Operand, Operand, Operand),
    IntMul(Operand, Operand, Operand),
    IntDiv(Operand, Operand, Operand),
    FltAdd(Operand, Operand, Operand),
    FltSub(Operand, Operand, Operand),
    FltMul(Operand, Operand, Operand),
    FltDiv(Operand, Operand, Operand),
    IntCpy(Operand, Operand),
    FltCpy(Operand, Operand),
    ByteCpy(Operand, Operand),
    CharCpy(Operand, Operand, u32),
}

/// A straight-line arithmetic program.
#[derive(Debug, Clone, Default)]
pub struct AEval {
    instrs: Vec<AInstr>,
}

impl AEval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: AInstr) {
        self.instrs.push(instr);
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn eval(&self, ctx: &mut EvalContext, stores: &mut StorePool) {
        for instr in &self.instrs {
            match *instr {
                AInstr::IntAdd(a, b, d) => {
                    let v = ctx.read_i32(stores, a).wrapping_add(ctx.read_i32(stores, b));
                    ctx.write_i32(stores, d, v);
                }
                AInstr::IntSub(a, b, d) => {
                    let v = ctx.read_i32(stores, a).wrapping_sub(ctx.read_i32(stores, b));
                    ctx.write_i32(stores, d, v);
                }
                AInstr::IntMul(a, b, d) => {
                    let v = ctx.read_i32(stores, a).wrapping_mul(ctx.read_i32(stores, b));
                    ctx.write_i32(stores, d, v);
                }
                AInstr::IntDiv(a, b, d) => {
                    let rhs = ctx.read_i32(stores, b);
                    let v = if rhs == 0 { 0 } else { ctx.read_i32(stores, a).wrapping_div(rhs) };
                    ctx.write_i32(stores, d, v);
                }
                AInstr::FltAdd(a, b, d) => {
                    let v = ctx.read_f32(stores, a) + ctx.read_f32(stores, b);
                    ctx.write_f32(stores, d, v);
                }
                AInstr::FltSub(a, b, d) => {
                    let v = ctx.read_f32(stores, a) - ctx.read_f32(stores, b);
                    ctx.write_f32(stores, d, v);
                }
                AInstr::FltMul(a, b, d) => {
                    let v = ctx.read_f32(stores, a) * ctx.read_f32(stores, b);
                    ctx.write_f32(stores, d, v);
                }
                AInstr::FltDiv(a, b, d) => {
                    let v = ctx.read_f32(stores, a) / ctx.read_f32(stores, b);
                    ctx.write_f32(stores, d, v);
                }
                AInstr::IntCpy(s, d) => {
                    let v = ctx.read_i32(stores, s);
                    ctx.write_i32(stores, d, v);
                }
                AInstr::FltCpy(s, d) => {
                    let v = ctx.read_f32(stores, s);
                    ctx.write_f32(stores, d, v);
                }
                AInstr::ByteCpy(s, d) => {
                    let v = ctx.read_u8(stores, s);
                    ctx.write_u8(stores, d, v);
                }
                AInstr::CharCpy(s, d, len) => {
                    let v = ccol(ctx.read(stores, s.role), s.col, len).to_vec();
                    ctx.write_bytes(stores, d, &v);
                }
            }
        }
    }
}

// ── Boolean programs ───────────────────────────────────────────────────────

/// Typed comparison kinds. CHAR comparisons are on the NUL-terminated
/// logical value within the declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    IntEq,
    IntNe,
    FltLt,
    FltLe,
    FltGt,
    FltGe,
    FltEq,
    FltNe,
    ByteLt,
    ByteLe,
    ByteGt,
    ByteGe,
    ByteEq,
    ByteNe,
    CharLt,
    CharLe,
    CharGt,
    CharGe,
    CharEq,
    CharNe,
}

/// One comparison, with optional arithmetic preparation of either side.
#[derive(Debug, Clone)]
pub struct BInstr {
    pub cmp: Cmp,
    pub left: Operand,
    pub right: Operand,
    /// Declared length for CHAR comparisons; 0 otherwise.
    pub char_len: u32,
    pub left_prep: Option<AEval>,
    pub right_prep: Option<AEval>,
}

/// A conjunction of comparisons.
#[derive(Debug, Clone, Default)]
pub struct BEval {
    instrs: Vec<BInstr>,
}

impl BEval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: BInstr) {
        self.instrs.push(instr);
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Evaluate the conjunction; short-circuits on the first false term.
    pub fn eval(&self, ctx: &mut EvalContext, stores: &mut StorePool) -> bool {
        for instr in &self.instrs {
            if let Some(prep) = &instr.left_prep {
                prep.eval(ctx, stores);
            }
            if let Some(prep) = &instr.right_prep {
                prep.eval(ctx, stores);
            }
            let ok = match instr.cmp {
                Cmp::IntLt => ctx.read_i32(stores, instr.left) < ctx.read_i32(stores, instr.right),
                Cmp::IntLe => ctx.read_i32(stores, instr.left) <= ctx.read_i32(stores, instr.right),
                Cmp::IntGt => ctx.read_i32(stores, instr.left) > ctx.read_i32(stores, instr.right),
                Cmp::IntGe => ctx.read_i32(stores, instr.left) >= ctx.read_i32(stores, instr.right),
                Cmp::IntEq => ctx.read_i32(stores, instr.left) == ctx.read_i32(stores, instr.right),
                Cmp::IntNe => ctx.read_i32(stores, instr.left) != ctx.read_i32(stores, instr.right),
                Cmp::FltLt => ctx.read_f32(stores, instr.left) < ctx.read_f32(stores, instr.right),
                Cmp::FltLe => ctx.read_f32(stores, instr.left) <= ctx.read_f32(stores, instr.right),
                Cmp::FltGt => ctx.read_f32(stores, instr.left) > ctx.read_f32(stores, instr.right),
                Cmp::FltGe => ctx.read_f32(stores, instr.left) >= ctx.read_f32(stores, instr.right),
                Cmp::FltEq => ctx.read_f32(stores, instr.left) == ctx.read_f32(stores, instr.right),
                Cmp::FltNe => ctx.read_f32(stores, instr.left) != ctx.read_f32(stores, instr.right),
                Cmp::ByteLt => ctx.read_u8(stores, instr.left) < ctx.read_u8(stores, instr.right),
                Cmp::ByteLe => ctx.read_u8(stores, instr.left) <= ctx.read_u8(stores, instr.right),
                Cmp::ByteGt => ctx.read_u8(stores, instr.left) > ctx.read_u8(stores, instr.right),
                Cmp::ByteGe => ctx.read_u8(stores, instr.left) >= ctx.read_u8(stores, instr.right),
                Cmp::ByteEq => ctx.read_u8(stores, instr.left) == ctx.read_u8(stores, instr.right),
                Cmp::ByteNe => ctx.read_u8(stores, instr.left) != ctx.read_u8(stores, instr.right),
                Cmp::CharLt | Cmp::CharLe | Cmp::CharGt | Cmp::CharGe | Cmp::CharEq
                | Cmp::CharNe => {
                    let l = cstr(ctx.read(stores, instr.left.role), instr.left.col, instr.char_len);
                    let r =
                        cstr(ctx.read(stores, instr.right.role), instr.right.col, instr.char_len);
                    match instr.cmp {
                        Cmp::CharLt => l < r,
                        Cmp::CharLe => l <= r,
                        Cmp::CharGt => l > r,
                        Cmp::CharGe => l >= r,
                        Cmp::CharEq => l == r,
                        Cmp::CharNe => l != r,
                        _ => unreachable!(),
                    }
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

// ── Hash programs ──────────────────────────────────────────────────────────

/// One column contributing to a hash value.
#[derive(Debug, Clone, Copy)]
pub struct HInstr {
    pub role: Role,
    pub col: u32,
    pub ty: AttrType,
    /// Declared length for CHAR columns; 0 otherwise.
    pub len: u32,
}

/// Hashes the logical bytes of a column list with xxh64.
#[derive(Debug, Clone, Default)]
pub struct HEval {
    instrs: Vec<HInstr>,
}

impl HEval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instr: HInstr) {
        self.instrs.push(instr);
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn eval(&self, ctx: &EvalContext, stores: &StorePool) -> u64 {
        let mut h = Xxh64::new(HASH_SEED);
        for instr in &self.instrs {
            let t = ctx.read(stores, instr.role);
            match instr.ty {
                AttrType::Int => h.update(&icol(t, instr.col).to_ne_bytes()),
                AttrType::Float => h.update(&fcol(t, instr.col).to_ne_bytes()),
                AttrType::Byte => h.update(&[bcol(t, instr.col)]),
                AttrType::Char => {
                    h.update(cstr(t, instr.col, instr.len));
                    // Separator so adjacent CHAR columns cannot collide.
                    h.update(&[0x1e]);
                }
            }
        }
        h.digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::memory::MemoryManager;

    fn fixture() -> (StorePool, MemoryManager, u32) {
        let mut pool = StorePool::new();
        let mm = MemoryManager::new(16 * 4096, 4096);
        let store = pool.add_store(16, 4096);
        (pool, mm, store)
    }

    #[test]
    fn test_arith_program_writes_output() {
        let (mut pool, mut mm, store) = fixture();
        let input = pool.new_tuple(store, &mut mm).unwrap();
        let output = pool.new_tuple(store, &mut mm).unwrap();
        set_icol(pool.tuple_mut(input), 0, 10);
        set_icol(pool.tuple_mut(input), 1, 32);

        let mut ctx = EvalContext::new();
        ctx.bind(Role::Input, input);
        ctx.bind(Role::Output, output);

        let mut prog = AEval::new();
        prog.push(AInstr::IntAdd(
            Operand::new(Role::Input, 0),
            Operand::new(Role::Input, 1),
            Operand::new(Role::Output, 0),
        ));
        prog.eval(&mut ctx, &mut pool);
        assert_eq!(icol(pool.tuple(output), 0), 42);
    }

    #[test]
    fn test_arith_through_scratch_and_const() {
        let (mut pool, mut mm, store) = fixture();
        let input = pool.new_tuple(store, &mut mm).unwrap();
        let output = pool.new_tuple(store, &mut mm).unwrap();
        set_icol(pool.tuple_mut(input), 0, 6);

        let mut consts = vec![0u8; 4];
        set_icol(&mut consts, 0, 7);

        let mut ctx = EvalContext::new();
        ctx.set_scratch(8);
        ctx.set_consts(consts);
        ctx.bind(Role::Input, input);
        ctx.bind(Role::Output, output);

        // out = (in.0 * const.0)
        let mut prog = AEval::new();
        prog.push(AInstr::IntMul(
            Operand::new(Role::Input, 0),
            Operand::new(Role::Const, 0),
            Operand::new(Role::Scratch, 0),
        ));
        prog.push(AInstr::IntCpy(
            Operand::new(Role::Scratch, 0),
            Operand::new(Role::Output, 0),
        ));
        prog.eval(&mut ctx, &mut pool);
        assert_eq!(icol(pool.tuple(output), 0), 42);
    }

    #[test]
    fn test_int_div_by_zero_yields_zero() {
        let (mut pool, mut mm, store) = fixture();
        let input = pool.new_tuple(store, &mut mm).unwrap();
        set_icol(pool.tuple_mut(input), 0, 5);
        set_icol(pool.tuple_mut(input), 1, 0);

        let mut ctx = EvalContext::new();
        ctx.set_scratch(4);
        ctx.bind(Role::Input, input);

        let mut prog = AEval::new();
        prog.push(AInstr::IntDiv(
            Operand::new(Role::Input, 0),
            Operand::new(Role::Input, 1),
            Operand::new(Role::Scratch, 0),
        ));
        prog.eval(&mut ctx, &mut pool);
        assert_eq!(icol(&ctx.scratch, 0), 0);
    }

    #[test]
    fn test_bool_conjunction_short_circuit() {
        let (mut pool, mut mm, store) = fixture();
        let input = pool.new_tuple(store, &mut mm).unwrap();
        set_icol(pool.tuple_mut(input), 0, 3);
        set_fcol(pool.tuple_mut(input), 1, 2.5);

        let mut consts = vec![0u8; 8];
        set_icol(&mut consts, 0, 5);
        set_fcol(&mut consts, 1, 2.5);

        let mut ctx = EvalContext::new();
        ctx.set_consts(consts);
        ctx.bind(Role::Input, input);

        let mut pred = BEval::new();
        pred.push(BInstr {
            cmp: Cmp::IntLt,
            left: Operand::new(Role::Input, 0),
            right: Operand::new(Role::Const, 0),
            char_len: 0,
            left_prep: None,
            right_prep: None,
        });
        pred.push(BInstr {
            cmp: Cmp::FltEq,
            left: Operand::new(Role::Input, 1),
            right: Operand::new(Role::Const, 1),
            char_len: 0,
            left_prep: None,
            right_prep: None,
        });
        assert!(pred.eval(&mut ctx, &mut pool));

        set_icol(pool.tuple_mut(input), 0, 9);
        assert!(!pred.eval(&mut ctx, &mut pool));
    }

    #[test]
    fn test_char_compare_ignores_padding() {
        let (mut pool, mut mm, store) = fixture();
        let a = pool.new_tuple(store, &mut mm).unwrap();
        let b = pool.new_tuple(store, &mut mm).unwrap();
        set_ccol(pool.tuple_mut(a), 0, b"hi\0\0\0\0");
        set_ccol(pool.tuple_mut(b), 0, b"hi\0xyz");

        let mut ctx = EvalContext::new();
        ctx.bind(Role::Left, a);
        ctx.bind(Role::Right, b);

        let mut pred = BEval::new();
        pred.push(BInstr {
            cmp: Cmp::CharEq,
            left: Operand::new(Role::Left, 0),
            right: Operand::new(Role::Right, 0),
            char_len: 6,
            left_prep: None,
            right_prep: None,
        });
        assert!(pred.eval(&mut ctx, &mut pool));
    }

    #[test]
    fn test_hash_equal_values_equal_hashes() {
        let (mut pool, mut mm, store) = fixture();
        let a = pool.new_tuple(store, &mut mm).unwrap();
        let b = pool.new_tuple(store, &mut mm).unwrap();
        set_icol(pool.tuple_mut(a), 0, 77);
        set_icol(pool.tuple_mut(b), 0, 77);

        let mut ha = EvalContext::new();
        ha.bind(Role::Update, a);
        let mut hb = EvalContext::new();
        hb.bind(Role::Update, b);

        let mut prog = HEval::new();
        prog.push(HInstr { role: Role::Update, col: 0, ty: AttrType::Int, len: 0 });
        assert_eq!(prog.eval(&ha, &pool), prog.eval(&hb, &pool));

        set_icol(pool.tuple_mut(b), 0, 78);
        assert_ne!(prog.eval(&ha, &pool), prog.eval(&hb, &pool));
    }

    #[test]
    fn test_char_copy_copies_declared_len() {
        let (mut pool, mut mm, store) = fixture();
        let src = pool.new_tuple(store, &mut mm).unwrap();
        let dst = pool.new_tuple(store, &mut mm).unwrap();
        set_ccol(pool.tuple_mut(src), 0, b"abc\0");

        let mut ctx = EvalContext::new();
        ctx.bind(Role::Input, src);
        ctx.bind(Role::Output, dst);
        let mut prog = AEval::new();
        prog.push(AInstr::CharCpy(
            Operand::new(Role::Input, 0),
            Operand::new(Role::Output, 0),
            4,
        ));
        prog.eval(&mut ctx, &mut pool);
        assert_eq!(cstr(pool.tuple(dst), 0, 4), b"abc");
    }
}
