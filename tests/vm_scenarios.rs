//! The three concrete VM scenarios the spec calls out, driven through the
//! real parser/emitter pipeline rather than hand-assembled instructions,
//! plus the call-depth bound fib(10) implies.

use astc_emit::EmitOptions;
use astc_vm::{VmConfig, VmContext, VmError};

fn compile(src: &str) -> astc_format::Program {
    let unit = astc_parser::parse(src.as_bytes()).expect("source parses");
    astc_emit::emit_program(&unit, EmitOptions::default()).expect("program emits")
}

#[test]
fn constant_return_exits_with_that_value() {
    let program = compile("int main(void) { return 42; }");
    let mut vm = VmContext::new(VmConfig::default());
    vm.load_program(program).unwrap();
    assert_eq!(vm.execute(), Ok(42));
}

#[test]
fn recursive_fibonacci_of_ten_is_fifty_five_within_call_depth_eleven() {
    let program = compile(
        "int fib(int n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } \
         int main(void) { return fib(10); }",
    );
    let mut vm = VmContext::new(VmConfig::default());
    vm.load_program(program).unwrap();

    let mut max_depth = 0;
    loop {
        max_depth = max_depth.max(vm.call_depth());
        match vm.step().unwrap() {
            astc_vm::StepOutcome::Continued => {}
            astc_vm::StepOutcome::Halted(exit) => {
                assert_eq!(exit, 55);
                break;
            }
        }
    }
    assert!(max_depth <= 11, "fib(10) call depth {max_depth} exceeded 11");
}

#[test]
fn division_by_zero_reports_runtime_error_at_the_faulting_instruction() {
    let program = compile("int main(void) { int z; z = 0; return 1 / z; }");
    let mut vm = VmContext::new(VmConfig::default());
    vm.load_program(program).unwrap();
    let err = vm.execute().unwrap_err();
    match err {
        VmError::RuntimeError { message, .. } => assert_eq!(message, "division by zero"),
        other => panic!("expected a division-by-zero runtime error, got {other:?}"),
    }
    assert_eq!(vm.state(), astc_vm::VmState::Error);
}

#[test]
fn reset_clears_state_so_the_same_context_can_run_twice() {
    let program = compile("int main(void) { return 7; }");
    let mut vm = VmContext::new(VmConfig::default());
    vm.load_program(program).unwrap();
    assert_eq!(vm.execute(), Ok(7));
    vm.reset();
    assert_eq!(vm.execute(), Ok(7));
}

#[test]
fn instruction_limit_halts_the_vm_in_an_orderly_stopped_state() {
    let program = compile("int main(void) { int i; i = 0; while (1) { i = i + 1; } return i; }");
    let mut vm = VmContext::new(VmConfig::default());
    vm.load_program(program).unwrap();
    let err = vm.execute_with_limit(Some(50)).unwrap_err();
    assert!(matches!(err, VmError::LimitReached { executed: 50 }));
    assert_eq!(vm.state(), astc_vm::VmState::Stopped);
}
