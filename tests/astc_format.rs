//! ASTC container properties exercised against real compiler output, rather
//! than hand-built instruction lists (those live in `astc-format`'s own
//! inline tests).

use astc_emit::EmitOptions;
use astc_format::{read_program, write_program, AstcFormatError};
use std::io::Cursor;

fn compile(src: &str) -> astc_format::Program {
    let unit = astc_parser::parse(src.as_bytes()).expect("source parses");
    astc_emit::emit_program(&unit, EmitOptions::default()).expect("program emits")
}

#[test]
fn a_compiled_program_round_trips_through_the_container() {
    let program = compile(
        "int add(int a, int b) { return a + b; } int main(void) { return add(1, 2); }",
    );
    let mut buf = Vec::new();
    write_program(&mut buf, &program).unwrap();
    let decoded = read_program(&mut Cursor::new(buf)).unwrap();
    assert_eq!(decoded, program);
    assert!(decoded.validate_branches().is_ok());
}

#[test]
fn a_compiled_program_with_control_flow_has_only_in_range_branches() {
    let program = compile(
        "int main(void) { int i; int sum; sum = 0; \
         for (i = 0; i < 10; i = i + 1) { if (i == 5) { continue; } sum = sum + i; } \
         return sum; }",
    );
    assert!(program.validate_branches().is_ok());
    let mut buf = Vec::new();
    write_program(&mut buf, &program).unwrap();
    let decoded = read_program(&mut Cursor::new(buf)).unwrap();
    assert_eq!(decoded.instructions.len(), program.instructions.len());
}

#[test]
fn truncated_container_from_a_real_program_fails_cleanly() {
    let program = compile("int main(void) { return 1 + 2 * 3 - 4; }");
    let mut buf = Vec::new();
    write_program(&mut buf, &program).unwrap();
    buf.truncate(buf.len() / 2);
    assert_eq!(read_program(&mut Cursor::new(buf)), Err(AstcFormatError::Truncated));
}
