use std::sync::Arc;

use kiln_core::ir::layout::TargetLayout;
use kiln_core::ir::{
    BasicBlock, ConstValue, FuncId, Function, FunctionSig, InstKind, Instruction, IntrinsicOp,
    Operand, Program, Terminator, Ty,
};
use kiln_interpret::{EvalError, Interpreter, Value};
use pretty_assertions::assert_eq;

fn interp() -> Interpreter {
    Interpreter::new(Arc::new(TargetLayout::host()))
}

fn coro_op(id: u32, op: IntrinsicOp, args: Vec<Operand>, ty: Ty) -> Instruction {
    Instruction::new(id, InstKind::Intrinsic { op, args }, ty)
}

/// A coroutine that suspends once and then completes with 99.
fn generator(program: &mut Program) -> FuncId {
    let mut func = Function::new("generator", FunctionSig::new(vec![], Ty::Ptr)).coroutine();
    let mut block = BasicBlock::new(0);
    block.push(coro_op(
        0,
        IntrinsicOp::CoroCreate,
        vec![Operand::Const(ConstValue::i64(0))],
        Ty::Ptr,
    ));
    block.push(coro_op(1, IntrinsicOp::CoroSuspend, vec![], Ty::Void));
    block.set_terminator(Terminator::Ret(Some(Operand::Const(ConstValue::i64(99)))));
    func.add_block(block);
    program.add_function(func)
}

#[test]
fn suspend_resume_completes_with_the_promise() {
    let mut program = Program::new();
    let generator = generator(&mut program);

    let mut driver = Function::new("driver", FunctionSig::new(vec![], Ty::I64));
    let mut block = BasicBlock::new(0);
    block.push(Instruction::new(
        0,
        InstKind::Call {
            callee: generator,
            args: vec![],
        },
        Ty::Ptr,
    ));
    block.push(coro_op(
        1,
        IntrinsicOp::CoroDone,
        vec![Operand::Value(0)],
        Ty::I1,
    ));
    block.push(coro_op(
        2,
        IntrinsicOp::CoroResume,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.push(coro_op(
        3,
        IntrinsicOp::CoroDone,
        vec![Operand::Value(0)],
        Ty::I1,
    ));
    block.push(coro_op(
        4,
        IntrinsicOp::CoroPromise,
        vec![Operand::Value(0)],
        Ty::I64,
    ));
    // promise + (done_before ? 100 : 0) + (done_after ? 1000 : 0)
    block.push(Instruction::new(
        5,
        InstKind::Select {
            cond: Operand::Value(1),
            if_true: Operand::Const(ConstValue::i64(100)),
            if_false: Operand::Const(ConstValue::i64(0)),
        },
        Ty::I64,
    ));
    block.push(Instruction::new(
        6,
        InstKind::Select {
            cond: Operand::Value(3),
            if_true: Operand::Const(ConstValue::i64(1000)),
            if_false: Operand::Const(ConstValue::i64(0)),
        },
        Ty::I64,
    ));
    block.push(Instruction::new(
        7,
        InstKind::Add(Operand::Value(4), Operand::Value(5)),
        Ty::I64,
    ));
    block.push(Instruction::new(
        8,
        InstKind::Add(Operand::Value(7), Operand::Value(6)),
        Ty::I64,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Value(8))));
    driver.add_block(block);
    let driver = program.add_function(driver);

    // Not done before resume, done after, promise 99.
    let result = interp().evaluate_const(&program, driver, &[]);
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.value, Some(ConstValue::i64(1099)));
}

#[test]
fn resuming_a_completed_coroutine_is_an_error() {
    let mut program = Program::new();
    let generator = generator(&mut program);

    let mut driver = Function::new("driver", FunctionSig::new(vec![], Ty::I64));
    let mut block = BasicBlock::new(0);
    block.push(Instruction::new(
        0,
        InstKind::Call {
            callee: generator,
            args: vec![],
        },
        Ty::Ptr,
    ));
    block.push(coro_op(
        1,
        IntrinsicOp::CoroResume,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.push(coro_op(
        2,
        IntrinsicOp::CoroResume,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Const(ConstValue::i64(0)))));
    driver.add_block(block);
    let driver = program.add_function(driver);

    let result = interp().evaluate_const(&program, driver, &[]);
    assert_eq!(result.value, None);
    assert_eq!(result.errors, vec![EvalError::InvalidCoroutine(1)]);
}

#[test]
fn resuming_after_destroy_is_an_error() {
    let mut program = Program::new();
    let generator = generator(&mut program);

    let mut driver = Function::new("driver", FunctionSig::new(vec![], Ty::I64));
    let mut block = BasicBlock::new(0);
    block.push(Instruction::new(
        0,
        InstKind::Call {
            callee: generator,
            args: vec![],
        },
        Ty::Ptr,
    ));
    block.push(coro_op(
        1,
        IntrinsicOp::CoroDestroy,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.push(coro_op(
        2,
        IntrinsicOp::CoroResume,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Const(ConstValue::i64(0)))));
    driver.add_block(block);
    let driver = program.add_function(driver);

    let result = interp().evaluate_const(&program, driver, &[]);
    assert_eq!(result.errors, vec![EvalError::InvalidCoroutine(1)]);
}

#[test]
fn coroutine_locals_survive_suspension_on_the_heap() {
    let mut program = Program::new();

    // Stores 7 into a local before suspending, reads it back after resume.
    let mut coro = Function::new("stateful", FunctionSig::new(vec![], Ty::Ptr)).coroutine();
    let mut block = BasicBlock::new(0);
    block.push(coro_op(
        0,
        IntrinsicOp::CoroCreate,
        vec![Operand::Const(ConstValue::i64(0))],
        Ty::Ptr,
    ));
    block.push(Instruction::new(1, InstKind::Alloca { ty: Ty::I64 }, Ty::Ptr));
    block.push(Instruction::new(
        2,
        InstKind::Store {
            value: Operand::Const(ConstValue::i64(7)),
            address: Operand::Value(1),
            ty: Ty::I64,
        },
        Ty::Void,
    ));
    block.push(coro_op(3, IntrinsicOp::CoroSuspend, vec![], Ty::Void));
    block.push(Instruction::new(
        4,
        InstKind::Load {
            address: Operand::Value(1),
        },
        Ty::I64,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Value(4))));
    coro.add_block(block);
    let coro = program.add_function(coro);

    let mut driver = Function::new("driver", FunctionSig::new(vec![], Ty::I64));
    let mut block = BasicBlock::new(0);
    block.push(Instruction::new(
        0,
        InstKind::Call {
            callee: coro,
            args: vec![],
        },
        Ty::Ptr,
    ));
    block.push(coro_op(
        1,
        IntrinsicOp::CoroResume,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.push(coro_op(
        2,
        IntrinsicOp::CoroPromise,
        vec![Operand::Value(0)],
        Ty::I64,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Value(2))));
    driver.add_block(block);
    let driver = program.add_function(driver);

    let result = interp().evaluate_const(&program, driver, &[]);
    assert_eq!(result.errors, vec![]);
    assert_eq!(result.value, Some(ConstValue::i64(7)));
}

#[test]
fn coroutine_state_persists_across_generic_calls() {
    let mut program = Program::new();
    let generator = generator(&mut program);

    let mut resume = Function::new("resume_it", FunctionSig::new(vec![Ty::I64], Ty::I1));
    let mut block = BasicBlock::new(0);
    block.push(coro_op(
        1,
        IntrinsicOp::CoroResume,
        vec![Operand::Value(0)],
        Ty::Void,
    ));
    block.push(coro_op(
        2,
        IntrinsicOp::CoroDone,
        vec![Operand::Value(0)],
        Ty::I1,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Value(2))));
    resume.add_block(block);
    let resume = program.add_function(resume);

    let mut promise = Function::new("promise_of", FunctionSig::new(vec![Ty::I64], Ty::I64));
    let mut block = BasicBlock::new(0);
    block.push(coro_op(
        1,
        IntrinsicOp::CoroPromise,
        vec![Operand::Value(0)],
        Ty::I64,
    ));
    block.set_terminator(Terminator::Ret(Some(Operand::Value(1))));
    promise.add_block(block);
    let promise = program.add_function(promise);

    let mut engine = interp();
    let started = engine.evaluate_generic(&program, generator, vec![]);
    assert_eq!(started.errors, vec![]);
    let handle = started.value.expect("coroutine handle");
    assert_eq!(handle.as_address(), Some(1));

    // The handle is address-shaped; re-width it to the i64 parameter.
    let handle_arg = Value::int(64, u128::from(handle.as_address().unwrap()));

    let finished = engine.evaluate_generic(&program, resume, vec![handle_arg.clone()]);
    assert_eq!(finished.errors, vec![]);
    assert_eq!(finished.value, Some(Value::int(1, 1)));

    let value = engine.evaluate_generic(&program, promise, vec![handle_arg]);
    assert_eq!(value.errors, vec![]);
    assert_eq!(value.value, Some(Value::int(64, 99)));
}
