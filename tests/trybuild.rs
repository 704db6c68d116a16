//! The legal pre-exec order compiles. Illegal orders are `compile_fail`
//! doctests on `execbox::exec::preexec`, checked by error code.

#[test]
fn preexec_chain_in_order_compiles() {
    let t = trybuild::TestCases::new();
    t.pass("tests/typestate/full_chain.rs");
}
