//! The implicit-coercion and snippet-evaluation behavior embedders see.

use macrolens_vba_runtime::{Engine, Value};
use pretty_assertions::assert_eq;

fn eval(source: &str) -> Value {
    Engine::new()
        .eval_expression(source)
        .expect("expression should parse")
}

#[test]
fn hex_literal_evaluates() {
    assert_eq!(eval("&H2A"), Value::Int(42));
}

#[test]
fn concat_mixes_numbers_into_strings() {
    assert_eq!(eval("\"a\" & 1 & \"b\""), Value::str("a1b"));
}

#[test]
fn plus_prefers_numbers_then_falls_back_to_concat() {
    assert_eq!(eval("\"1\" + 2"), Value::Int(3));
    assert_eq!(eval("\"a\" + \"b\""), Value::str("ab"));
}

#[test]
fn chr_and_asc_are_inverses() {
    assert_eq!(eval("Chr(Asc(\"Q\"))"), Value::str("Q"));
    assert_eq!(eval("Asc(Chr(7))"), Value::Int(7));
}

#[test]
fn like_operator_wildcards() {
    assert_eq!(eval("\"payload.exe\" Like \"*.exe\""), Value::Bool(true));
    assert_eq!(eval("\"abc\" Like \"a#c\""), Value::Bool(false));
}

#[test]
fn eval_builtin_evaluates_strings() {
    assert_eq!(eval("Eval(\"2+2\")"), Value::Int(4));
}

#[test]
fn environ_reads_compare_equal_to_anything() {
    let mut engine = Engine::new();
    engine
        .load_module_source(
            "Dim hit\n\nSub AutoOpen()\n  If Environ(\"USERNAME\") = \"admin\" Then\n    hit = 1\n  End If\nEnd Sub\n",
        )
        .unwrap();
    engine.run_entry_points();
    assert_eq!(engine.context().get("hit"), Some(Value::Int(1)));
    assert!(engine.report().tested_wildcard);
}

#[test]
fn reevaluation_is_idempotent() {
    let mut engine = Engine::new();
    engine
        .load_module_source("Function F()\n  F = Chr(72) & \"i\"\nEnd Function\n")
        .unwrap();
    let first = engine.run_procedure("F", &[]);
    let second = engine.run_procedure("F", &[]);
    assert_eq!(first, Value::str("Hi"));
    assert_eq!(first, second);
}
