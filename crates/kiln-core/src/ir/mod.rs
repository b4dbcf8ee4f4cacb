pub mod layout;
pub mod pretty;
pub mod ty;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use ty::Ty;

pub type ValueId = u32;
pub type BlockId = u32;
pub type FuncId = u32;
pub type GlobalId = u32;

/// A whole lowered program: the unit the evaluation engine executes against.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = self.functions.len() as FuncId;
        self.functions.push(function);
        id
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        let id = self.globals.len() as GlobalId;
        self.globals.push(global);
        id
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id as usize)
    }

    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(id as usize)
    }

    pub fn function_named(&self, name: &str) -> Option<(FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
            .map(|(id, f)| (id as FuncId, f))
    }

    /// Structural sanity check used by producers before handing a program to
    /// the evaluation engine: block ids must be unique, value-producing
    /// instructions must not reuse parameter or instruction ids, and branch
    /// targets must resolve.
    pub fn validate(&self) -> crate::Result<()> {
        for func in &self.functions {
            let mut block_ids = HashSet::new();
            let mut value_ids: HashSet<ValueId> =
                func.params.iter().map(|p| p.id).collect();
            for block in &func.blocks {
                if !block_ids.insert(block.id) {
                    return Err(Error::MalformedProgram(format!(
                        "duplicate block bb{} in @{}",
                        block.id, func.name
                    )));
                }
                for inst in &block.instructions {
                    if !inst.ty.is_void() && !value_ids.insert(inst.id) {
                        return Err(Error::MalformedProgram(format!(
                            "duplicate value id %{} in @{}",
                            inst.id, func.name
                        )));
                    }
                }
            }
            for block in &func.blocks {
                let mut targets = Vec::new();
                match &block.terminator {
                    Terminator::Br(target) => targets.push(*target),
                    Terminator::CondBr {
                        if_true, if_false, ..
                    } => targets.extend([*if_true, *if_false]),
                    Terminator::Switch { default, cases, .. } => {
                        targets.push(*default);
                        targets.extend(cases.iter().map(|(_, target)| *target));
                    }
                    Terminator::Ret(_) | Terminator::Unreachable => {}
                }
                for target in targets {
                    if !block_ids.contains(&target) {
                        return Err(Error::MalformedProgram(format!(
                            "bb{} of @{} branches to unknown block bb{}",
                            block.id, func.name, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Declared signature. `params` lists the source-visible parameter types; a
/// struct-return function additionally receives a hidden leading pointer to
/// the pre-allocated destination, described by `sret`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSig {
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub sret: Option<Ty>,
}

impl FunctionSig {
    pub fn new(params: Vec<Ty>, ret: Ty) -> Self {
        Self {
            params,
            ret,
            sret: None,
        }
    }

    pub fn with_sret(params: Vec<Ty>, sret: Ty) -> Self {
        Self {
            params,
            ret: Ty::Void,
            sret: Some(sret),
        }
    }

    /// The logical result type: the sret pointee when present, the declared
    /// return type otherwise.
    pub fn result_ty(&self) -> &Ty {
        self.sret.as_ref().unwrap_or(&self.ret)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub id: ValueId,
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub sig: FunctionSig,
    /// All runtime parameters in call order, hidden sret slot first when the
    /// signature declares one. Parameter ids start at 0; instruction ids must
    /// not collide with them.
    pub params: Vec<Param>,
    pub blocks: Vec<BasicBlock>,
    pub is_coroutine: bool,
}

impl Function {
    pub fn new(name: impl Into<String>, sig: FunctionSig) -> Self {
        let mut params = Vec::with_capacity(sig.params.len() + 1);
        if sig.sret.is_some() {
            params.push(Param {
                id: 0,
                ty: Ty::Ptr,
            });
        }
        for ty in &sig.params {
            params.push(Param {
                id: params.len() as ValueId,
                ty: ty.clone(),
            });
        }
        Self {
            name: name.into(),
            sig,
            params,
            blocks: Vec::new(),
            is_coroutine: false,
        }
    }

    pub fn coroutine(mut self) -> Self {
        self.is_coroutine = true;
        self
    }

    pub fn add_block(&mut self, block: BasicBlock) {
        self.blocks.push(block);
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_index(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    /// First free value id after the parameters; fresh instruction ids are
    /// conventionally allocated from here.
    pub fn first_instruction_id(&self) -> ValueId {
        self.params.len() as ValueId
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub label: Option<String>,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            label: None,
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn set_terminator(&mut self, terminator: Terminator) {
        self.terminator = terminator;
    }
}

/// One typed SSA instruction. `ty` is the declared result type; instructions
/// that produce nothing declare `Void`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: ValueId,
    pub kind: InstKind,
    pub ty: Ty,
}

impl Instruction {
    pub fn new(id: ValueId, kind: InstKind, ty: Ty) -> Self {
        Self { id, kind, ty }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    // Memory operations
    Alloca {
        ty: Ty,
    },
    Load {
        address: Operand,
    },
    Store {
        value: Operand,
        address: Operand,
        ty: Ty,
    },
    /// Element-address computation: resolves a chain of array/struct indices
    /// into one accumulated byte offset from `base`, without dereferencing.
    Gep {
        base: Operand,
        pointee: Ty,
        indices: Vec<Operand>,
    },

    // SSA plumbing
    Phi {
        incoming: Vec<(Operand, BlockId)>,
    },
    Select {
        cond: Operand,
        if_true: Operand,
        if_false: Operand,
    },
    ExtractValue {
        aggregate: Operand,
        indices: Vec<u32>,
    },

    // Integer arithmetic, two's-complement wraparound
    Add(Operand, Operand),
    Sub(Operand, Operand),
    Mul(Operand, Operand),
    SDiv(Operand, Operand),
    UDiv(Operand, Operand),
    SRem(Operand, Operand),
    URem(Operand, Operand),

    // Bitwise operations
    And(Operand, Operand),
    Or(Operand, Operand),
    Xor(Operand, Operand),
    Shl(Operand, Operand),
    LShr(Operand, Operand),
    AShr(Operand, Operand),

    // Floating point, IEEE-754
    FAdd(Operand, Operand),
    FSub(Operand, Operand),
    FMul(Operand, Operand),
    FDiv(Operand, Operand),
    FRem(Operand, Operand),
    FNeg(Operand),

    // Comparisons
    ICmp {
        pred: IntPredicate,
        lhs: Operand,
        rhs: Operand,
    },
    FCmp {
        pred: FloatPredicate,
        lhs: Operand,
        rhs: Operand,
    },

    // Type conversions; the destination type is the instruction result type
    SExt(Operand),
    ZExt(Operand),
    Trunc(Operand),
    FPExt(Operand),
    FPTrunc(Operand),
    SIToFP(Operand),
    UIToFP(Operand),
    FPToSI(Operand),
    FPToUI(Operand),
    PtrToInt(Operand),
    IntToPtr(Operand),
    Bitcast(Operand),

    // Atomics, single-threaded semantics
    AtomicRmw {
        op: RmwOp,
        address: Operand,
        value: Operand,
    },
    CmpXchg {
        address: Operand,
        expected: Operand,
        replacement: Operand,
        ty: Ty,
    },

    // Calls
    Call {
        callee: FuncId,
        args: Vec<Operand>,
    },
    Intrinsic {
        op: IntrinsicOp,
        args: Vec<Operand>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Uno,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Nand,
    Or,
    Xor,
}

/// Operations the engine services inline, without pushing a call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicOp {
    MemCopy,
    MemMove,
    SAddOverflow,
    UAddOverflow,
    SSubOverflow,
    USubOverflow,
    SMulOverflow,
    UMulOverflow,
    StackSave,
    StackRestore,
    Malloc,
    Realloc,
    Free,
    CoroCreate,
    CoroSuspend,
    CoroResume,
    CoroDestroy,
    CoroDone,
    CoroPromise,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Ret(Option<Operand>),
    Br(BlockId),
    CondBr {
        cond: Operand,
        if_true: BlockId,
        if_false: BlockId,
    },
    Switch {
        value: Operand,
        default: BlockId,
        cases: Vec<(u128, BlockId)>,
    },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// An SSA register: a parameter or the result of an instruction in the
    /// same function.
    Value(ValueId),
    /// An immediate constant.
    Const(ConstValue),
    /// The address of a materialized global.
    Global(GlobalId),
    /// A function reference. The engine rejects these wherever they would
    /// escape into constant data.
    FuncRef(FuncId),
    NullPtr,
}

/// The external constant representation: what callers feed in as arguments
/// and receive back as evaluated results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    /// Sign-extended two's-complement bits at the width of the carried
    /// integer type.
    Int(i128, Ty),
    Bool(bool),
    F32(f32),
    F64(f64),
    /// Byte-string constant, laid out as `[i8 x len]`.
    Str(String),
    /// Array elements plus the element type.
    Array(Vec<ConstValue>, Ty),
    /// Field values plus the full struct type.
    Struct(Vec<ConstValue>, Ty),
    GlobalRef(GlobalId),
    FunctionRef(FuncId),
    NullPtr,
    Undef(Ty),
}

impl ConstValue {
    pub fn ty(&self) -> Ty {
        match self {
            ConstValue::Int(_, ty) => ty.clone(),
            ConstValue::Bool(_) => Ty::I1,
            ConstValue::F32(_) => Ty::F32,
            ConstValue::F64(_) => Ty::F64,
            ConstValue::Str(s) => Ty::array(Ty::I8, s.len() as u64),
            ConstValue::Array(elems, elem_ty) => Ty::array(elem_ty.clone(), elems.len() as u64),
            ConstValue::Struct(_, ty) => ty.clone(),
            ConstValue::GlobalRef(_) | ConstValue::FunctionRef(_) | ConstValue::NullPtr => Ty::Ptr,
            ConstValue::Undef(ty) => ty.clone(),
        }
    }

    pub fn i32(v: i32) -> Self {
        ConstValue::Int(i128::from(v), Ty::I32)
    }

    pub fn i64(v: i64) -> Self {
        ConstValue::Int(i128::from(v), Ty::I64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
    /// `None` marks an incomplete global: it has no layout and materializes
    /// to the null address.
    pub init: Option<ConstValue>,
    pub is_const: bool,
}

impl Global {
    pub fn constant(name: impl Into<String>, init: ConstValue) -> Self {
        Self {
            name: name.into(),
            ty: init.ty(),
            init: Some(init),
            is_const: true,
        }
    }

    pub fn variable(name: impl Into<String>, init: ConstValue) -> Self {
        Self {
            name: name.into(),
            ty: init.ty(),
            init: Some(init),
            is_const: false,
        }
    }
}
