use std::fmt::{self, Display, Formatter, Write};

use itertools::Itertools;

use super::{
    ConstValue, FloatPredicate, Function, InstKind, IntPredicate, IntrinsicOp, Operand, Terminator,
    Ty,
};

impl Display for Ty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Ty::I1 => write!(f, "i1"),
            Ty::I8 => write!(f, "i8"),
            Ty::I16 => write!(f, "i16"),
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
            Ty::I128 => write!(f, "i128"),
            Ty::F32 => write!(f, "f32"),
            Ty::F64 => write!(f, "f64"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Array(elem, len) => write!(f, "[{} x {}]", len, elem),
            Ty::Struct {
                fields,
                packed,
                name,
            } => {
                if let Some(name) = name {
                    return write!(f, "%{}", name);
                }
                let body = fields.iter().map(|t| t.to_string()).join(", ");
                if *packed {
                    write!(f, "<{{ {} }}>", body)
                } else {
                    write!(f, "{{ {} }}", body)
                }
            }
            Ty::Void => write!(f, "void"),
        }
    }
}

impl Display for IntPredicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
        };
        write!(f, "{}", s)
    }
}

impl Display for FloatPredicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            FloatPredicate::False => "false",
            FloatPredicate::Oeq => "oeq",
            FloatPredicate::Ogt => "ogt",
            FloatPredicate::Oge => "oge",
            FloatPredicate::Olt => "olt",
            FloatPredicate::Ole => "ole",
            FloatPredicate::One => "one",
            FloatPredicate::Ord => "ord",
            FloatPredicate::Uno => "uno",
            FloatPredicate::Ueq => "ueq",
            FloatPredicate::Ugt => "ugt",
            FloatPredicate::Uge => "uge",
            FloatPredicate::Ult => "ult",
            FloatPredicate::Ule => "ule",
            FloatPredicate::Une => "une",
            FloatPredicate::True => "true",
        };
        write!(f, "{}", s)
    }
}

pub fn opcode_name(kind: &InstKind) -> &'static str {
    match kind {
        InstKind::Alloca { .. } => "alloca",
        InstKind::Load { .. } => "load",
        InstKind::Store { .. } => "store",
        InstKind::Gep { .. } => "getelementptr",
        InstKind::Phi { .. } => "phi",
        InstKind::Select { .. } => "select",
        InstKind::ExtractValue { .. } => "extractvalue",
        InstKind::Add(..) => "add",
        InstKind::Sub(..) => "sub",
        InstKind::Mul(..) => "mul",
        InstKind::SDiv(..) => "sdiv",
        InstKind::UDiv(..) => "udiv",
        InstKind::SRem(..) => "srem",
        InstKind::URem(..) => "urem",
        InstKind::And(..) => "and",
        InstKind::Or(..) => "or",
        InstKind::Xor(..) => "xor",
        InstKind::Shl(..) => "shl",
        InstKind::LShr(..) => "lshr",
        InstKind::AShr(..) => "ashr",
        InstKind::FAdd(..) => "fadd",
        InstKind::FSub(..) => "fsub",
        InstKind::FMul(..) => "fmul",
        InstKind::FDiv(..) => "fdiv",
        InstKind::FRem(..) => "frem",
        InstKind::FNeg(..) => "fneg",
        InstKind::ICmp { .. } => "icmp",
        InstKind::FCmp { .. } => "fcmp",
        InstKind::SExt(..) => "sext",
        InstKind::ZExt(..) => "zext",
        InstKind::Trunc(..) => "trunc",
        InstKind::FPExt(..) => "fpext",
        InstKind::FPTrunc(..) => "fptrunc",
        InstKind::SIToFP(..) => "sitofp",
        InstKind::UIToFP(..) => "uitofp",
        InstKind::FPToSI(..) => "fptosi",
        InstKind::FPToUI(..) => "fptoui",
        InstKind::PtrToInt(..) => "ptrtoint",
        InstKind::IntToPtr(..) => "inttoptr",
        InstKind::Bitcast(..) => "bitcast",
        InstKind::AtomicRmw { .. } => "atomicrmw",
        InstKind::CmpXchg { .. } => "cmpxchg",
        InstKind::Call { .. } => "call",
        InstKind::Intrinsic { op, .. } => intrinsic_name(*op),
    }
}

pub fn intrinsic_name(op: IntrinsicOp) -> &'static str {
    match op {
        IntrinsicOp::MemCopy => "memcpy",
        IntrinsicOp::MemMove => "memmove",
        IntrinsicOp::SAddOverflow => "sadd.with.overflow",
        IntrinsicOp::UAddOverflow => "uadd.with.overflow",
        IntrinsicOp::SSubOverflow => "ssub.with.overflow",
        IntrinsicOp::USubOverflow => "usub.with.overflow",
        IntrinsicOp::SMulOverflow => "smul.with.overflow",
        IntrinsicOp::UMulOverflow => "umul.with.overflow",
        IntrinsicOp::StackSave => "stacksave",
        IntrinsicOp::StackRestore => "stackrestore",
        IntrinsicOp::Malloc => "malloc",
        IntrinsicOp::Realloc => "realloc",
        IntrinsicOp::Free => "free",
        IntrinsicOp::CoroCreate => "coro.create",
        IntrinsicOp::CoroSuspend => "coro.suspend",
        IntrinsicOp::CoroResume => "coro.resume",
        IntrinsicOp::CoroDestroy => "coro.destroy",
        IntrinsicOp::CoroDone => "coro.done",
        IntrinsicOp::CoroPromise => "coro.promise",
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(id) => write!(f, "%{}", id),
            Operand::Const(c) => write!(f, "{}", c),
            Operand::Global(id) => write!(f, "@g{}", id),
            Operand::FuncRef(id) => write!(f, "@f{}", id),
            Operand::NullPtr => write!(f, "null"),
        }
    }
}

impl Display for ConstValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(v, ty) => write!(f, "{} {}", ty, v),
            ConstValue::Bool(b) => write!(f, "i1 {}", if *b { 1 } else { 0 }),
            ConstValue::F32(v) => write!(f, "f32 {}", v),
            ConstValue::F64(v) => write!(f, "f64 {}", v),
            ConstValue::Str(s) => write!(f, "c{:?}", s),
            ConstValue::Array(elems, _) => {
                write!(f, "[{}]", elems.iter().map(|e| e.to_string()).join(", "))
            }
            ConstValue::Struct(fields, _) => {
                write!(f, "{{ {} }}", fields.iter().map(|e| e.to_string()).join(", "))
            }
            ConstValue::GlobalRef(id) => write!(f, "@g{}", id),
            ConstValue::FunctionRef(id) => write!(f, "@f{}", id),
            ConstValue::NullPtr => write!(f, "null"),
            ConstValue::Undef(ty) => write!(f, "{} undef", ty),
        }
    }
}

impl Display for Terminator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Ret(None) => write!(f, "ret void"),
            Terminator::Ret(Some(op)) => write!(f, "ret {}", op),
            Terminator::Br(target) => write!(f, "br bb{}", target),
            Terminator::CondBr {
                cond,
                if_true,
                if_false,
            } => write!(f, "br {}, bb{}, bb{}", cond, if_true, if_false),
            Terminator::Switch {
                value,
                default,
                cases,
            } => {
                let cases = cases
                    .iter()
                    .map(|(v, target)| format!("{} => bb{}", v, target))
                    .join(", ");
                write!(f, "switch {}, default bb{} [{}]", value, default, cases)
            }
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Compact textual dump of one function, for diagnostics and test output.
pub fn function_to_string(func: &Function) -> String {
    let mut out = String::new();
    let params = func
        .params
        .iter()
        .map(|p| format!("{} %{}", p.ty, p.id))
        .join(", ");
    let _ = writeln!(out, "fn @{}({}) -> {} {{", func.name, params, func.sig.ret);
    for block in &func.blocks {
        match &block.label {
            Some(label) => {
                let _ = writeln!(out, "bb{} ({}):", block.id, label);
            }
            None => {
                let _ = writeln!(out, "bb{}:", block.id);
            }
        }
        for inst in &block.instructions {
            if inst.ty.is_void() {
                let _ = writeln!(out, "  {}", opcode_name(&inst.kind));
            } else {
                let _ = writeln!(out, "  %{} = {} {}", inst.id, opcode_name(&inst.kind), inst.ty);
            }
        }
        let _ = writeln!(out, "  {}", block.terminator);
    }
    out.push_str("}\n");
    out
}
