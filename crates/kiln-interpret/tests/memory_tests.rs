use std::sync::Arc;

use kiln_core::ir::layout::{LayoutOracle, TargetLayout};
use kiln_core::ir::{
    BasicBlock, ConstValue, FuncId, Function, FunctionSig, Global, InstKind, Instruction,
    IntPredicate, Operand, Program, Terminator, Ty,
};
use kiln_interpret::{EvalError, Interpreter, Value};
use pretty_assertions::assert_eq;

fn interp() -> Interpreter {
    Interpreter::new(Arc::new(TargetLayout::host()))
}

fn single_block_fn(
    program: &mut Program,
    name: &str,
    sig: FunctionSig,
    build: impl FnOnce(&mut BasicBlock),
) -> FuncId {
    let mut func = Function::new(name, sig);
    let mut block = BasicBlock::new(0);
    build(&mut block);
    func.add_block(block);
    program.add_function(func)
}

#[test]
fn store_then_load_round_trips_scalars() {
    for (ty, constant) in [
        (Ty::I8, ConstValue::Int(-100, Ty::I8)),
        (Ty::I16, ConstValue::Int(0x1234, Ty::I16)),
        (Ty::I64, ConstValue::Int(i128::from(i64::MIN), Ty::I64)),
        (Ty::I128, ConstValue::Int(i128::MIN + 1, Ty::I128)),
        (Ty::F32, ConstValue::F32(1.5)),
        (Ty::F64, ConstValue::F64(-0.25)),
    ] {
        let mut program = Program::new();
        let id = single_block_fn(
            &mut program,
            "round_trip",
            FunctionSig::new(vec![ty.clone()], ty.clone()),
            |block| {
                block.push(Instruction::new(1, InstKind::Alloca { ty: ty.clone() }, Ty::Ptr));
                block.push(Instruction::new(
                    2,
                    InstKind::Store {
                        value: Operand::Value(0),
                        address: Operand::Value(1),
                        ty: ty.clone(),
                    },
                    Ty::Void,
                ));
                block.push(Instruction::new(
                    3,
                    InstKind::Load {
                        address: Operand::Value(1),
                    },
                    ty.clone(),
                ));
                block.set_terminator(Terminator::Ret(Some(Operand::Value(3))));
            },
        );
        let result = interp().evaluate_const(&program, id, &[constant.clone()]);
        assert_eq!(result.errors, vec![]);
        assert_eq!(result.value, Some(constant));
    }
}

#[test]
fn gep_field_offsets_match_the_layout_oracle() {
    let layout = TargetLayout::host();
    let ty = Ty::anonymous_struct(vec![Ty::I8, Ty::I64, Ty::I16, Ty::F32]);
    for field in 0..4usize {
        let mut program = Program::new();
        let struct_ty = ty.clone();
        let id = single_block_fn(
            &mut program,
            "field_offset",
            FunctionSig::new(vec![], Ty::I64),
            |block| {
                block.push(Instruction::new(
                    0,
                    InstKind::Alloca {
                        ty: struct_ty.clone(),
                    },
                    Ty::Ptr,
                ));
                block.push(Instruction::new(
                    1,
                    InstKind::Gep {
                        base: Operand::Value(0),
                        pointee: struct_ty.clone(),
                        indices: vec![
                            Operand::Const(ConstValue::i32(0)),
                            Operand::Const(ConstValue::i32(field as i32)),
                        ],
                    },
                    Ty::Ptr,
                ));
                block.push(Instruction::new(2, InstKind::PtrToInt(Operand::Value(1)), Ty::I64));
                block.push(Instruction::new(3, InstKind::PtrToInt(Operand::Value(0)), Ty::I64));
                block.push(Instruction::new(
                    4,
                    InstKind::Sub(Operand::Value(2), Operand::Value(3)),
                    Ty::I64,
                ));
                block.set_terminator(Terminator::Ret(Some(Operand::Value(4))));
            },
        );
        let result = interp().evaluate_const(&program, id, &[]);
        assert_eq!(result.errors, vec![]);
        let expected = layout.field_offset(&ty, field).unwrap();
        assert_eq!(
            result.value,
            Some(ConstValue::Int(i128::from(expected), Ty::I64))
        );
    }
}

#[test]
fn gep_array_indices_scale_by_element_size() {
    let mut program = Program::new();
    let array_ty = Ty::array(Ty::I32, 8);
    let id = single_block_fn(
        &mut program,
        "third_element",
        FunctionSig::new(vec![], Ty::I32),
        |block| {
            block.push(Instruction::new(
                0,
                InstKind::Alloca {
                    ty: array_ty.clone(),
                },
                Ty::Ptr,
            ));
            block.push(Instruction::new(
                1,
                InstKind::Gep {
                    base: Operand::Value(0),
                    pointee: array_ty.clone(),
                    indices: vec![
                        Operand::Const(ConstValue::i32(0)),
                        Operand::Const(ConstValue::i32(3)),
                    ],
                },
                Ty::Ptr,
            ));
            block.push(Instruction::new(
                2,
                InstKind::Store {
                    value: Operand::Const(ConstValue::i32(77)),
                    address: Operand::Value(1),
                    ty: Ty::I32,
                },
                Ty::Void,
            ));
            block.push(Instruction::new(
                3,
                InstKind::Load {
                    address: Operand::Value(1),
                },
                Ty::I32,
            ));
            block.set_terminator(Terminator::Ret(Some(Operand::Value(3))));
        },
    );
    let result = interp().evaluate_const(&program, id, &[]);
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.value, Some(ConstValue::i32(77)));
}

#[test]
fn loading_past_the_end_of_a_segment_is_out_of_bounds() {
    let mut program = Program::new();
    let id = single_block_fn(
        &mut program,
        "overread",
        FunctionSig::new(vec![], Ty::I64),
        |block| {
            block.push(Instruction::new(0, InstKind::Alloca { ty: Ty::I32 }, Ty::Ptr));
            block.push(Instruction::new(
                1,
                InstKind::Load {
                    address: Operand::Value(0),
                },
                Ty::I64,
            ));
            block.set_terminator(Terminator::Ret(Some(Operand::Value(1))));
        },
    );
    let result = interp().evaluate_const(&program, id, &[]);
    assert_eq!(result.value, None);
    assert!(matches!(
        result.errors.as_slice(),
        [EvalError::OutOfBounds { size: 8, .. }]
    ));
}

#[test]
fn materializing_the_same_global_twice_yields_one_address() {
    let mut program = Program::new();
    let global = program.add_global(Global::constant("answer", ConstValue::i32(5)));
    let id = single_block_fn(
        &mut program,
        "same_address",
        FunctionSig::new(vec![], Ty::I1),
        |block| {
            block.push(Instruction::new(
                0,
                InstKind::PtrToInt(Operand::Global(global)),
                Ty::I64,
            ));
            block.push(Instruction::new(
                1,
                InstKind::PtrToInt(Operand::Global(global)),
                Ty::I64,
            ));
            block.push(Instruction::new(
                2,
                InstKind::ICmp {
                    pred: IntPredicate::Eq,
                    lhs: Operand::Value(0),
                    rhs: Operand::Value(1),
                },
                Ty::I1,
            ));
            block.set_terminator(Terminator::Ret(Some(Operand::Value(2))));
        },
    );
    let result = interp().evaluate_const(&program, id, &[]);
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.value, Some(ConstValue::Bool(true)));
}

#[test]
fn global_references_nested_in_constants_are_linked() {
    let mut program = Program::new();
    let inner = program.add_global(Global::constant("inner", ConstValue::i32(41)));
    let holder_ty = Ty::anonymous_struct(vec![Ty::Ptr]);
    let holder = program.add_global(Global::constant(
        "holder",
        ConstValue::Struct(vec![ConstValue::GlobalRef(inner)], holder_ty.clone()),
    ));

    let id = single_block_fn(
        &mut program,
        "chase",
        FunctionSig::new(vec![], Ty::I32),
        |block| {
            block.push(Instruction::new(
                0,
                InstKind::Load {
                    address: Operand::Global(holder),
                },
                Ty::Ptr,
            ));
            block.push(Instruction::new(
                1,
                InstKind::Load {
                    address: Operand::Value(0),
                },
                Ty::I32,
            ));
            block.push(Instruction::new(
                2,
                InstKind::Add(Operand::Value(1), Operand::Const(ConstValue::i32(1))),
                Ty::I32,
            ));
            block.set_terminator(Terminator::Ret(Some(Operand::Value(2))));
        },
    );
    let result = interp().evaluate_const(&program, id, &[]);
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.value, Some(ConstValue::i32(42)));
}

#[test]
fn by_reference_arguments_are_materialized_into_the_globals_segment() {
    let elem_sum_ty = Ty::array(Ty::I32, 3);
    let mut program = Program::new();
    let id = single_block_fn(
        &mut program,
        "sum3",
        FunctionSig::new(vec![Ty::Ptr], Ty::I32),
        |block| {
            let mut next = 1u32;
            let mut loaded = Vec::new();
            for i in 0..3 {
                block.push(Instruction::new(
                    next,
                    InstKind::Gep {
                        base: Operand::Value(0),
                        pointee: elem_sum_ty.clone(),
                        indices: vec![
                            Operand::Const(ConstValue::i32(0)),
                            Operand::Const(ConstValue::i32(i)),
                        ],
                    },
                    Ty::Ptr,
                ));
                block.push(Instruction::new(
                    next + 1,
                    InstKind::Load {
                        address: Operand::Value(next),
                    },
                    Ty::I32,
                ));
                loaded.push(next + 1);
                next += 2;
            }
            block.push(Instruction::new(
                next,
                InstKind::Add(Operand::Value(loaded[0]), Operand::Value(loaded[1])),
                Ty::I32,
            ));
            block.push(Instruction::new(
                next + 1,
                InstKind::Add(Operand::Value(next), Operand::Value(loaded[2])),
                Ty::I32,
            ));
            block.set_terminator(Terminator::Ret(Some(Operand::Value(next + 1))));
        },
    );

    let arg = ConstValue::Array(
        vec![
            ConstValue::i32(10),
            ConstValue::i32(13),
            ConstValue::i32(19),
        ],
        Ty::I32,
    );
    let result = interp().evaluate_const(&program, id, &[arg]);
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.value, Some(ConstValue::i32(42)));
}

#[test]
fn globals_persist_across_generic_calls_but_not_const_ones() {
    let mut program = Program::new();
    let counter = program.add_global(Global::variable("counter", ConstValue::i64(0)));
    let id = single_block_fn(
        &mut program,
        "bump",
        FunctionSig::new(vec![], Ty::I64),
        |block| {
            block.push(Instruction::new(
                0,
                InstKind::Load {
                    address: Operand::Global(counter),
                },
                Ty::I64,
            ));
            block.push(Instruction::new(
                1,
                InstKind::Add(Operand::Value(0), Operand::Const(ConstValue::i64(1))),
                Ty::I64,
            ));
            block.push(Instruction::new(
                2,
                InstKind::Store {
                    value: Operand::Value(1),
                    address: Operand::Global(counter),
                    ty: Ty::I64,
                },
                Ty::Void,
            ));
            block.set_terminator(Terminator::Ret(Some(Operand::Value(1))));
        },
    );

    let mut engine = interp();
    let first = engine.evaluate_generic(&program, id, vec![]);
    assert_eq!(first.value, Some(Value::int(64, 1)));
    let second = engine.evaluate_generic(&program, id, vec![]);
    assert_eq!(second.value, Some(Value::int(64, 2)));

    // Constant evaluation clears all engine state when it finishes, so the
    // next call rematerializes the global from its initializer.
    let as_const = engine.evaluate_const(&program, id, &[]);
    assert_eq!(as_const.value, Some(ConstValue::i64(3)));
    let again = engine.evaluate_const(&program, id, &[]);
    assert_eq!(again.value, Some(ConstValue::i64(1)));
}
