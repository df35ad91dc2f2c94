//! End-to-end emulation of representative malicious macro patterns.

use macrolens_vba_runtime::{Engine, Value};
use pretty_assertions::assert_eq;

fn engine_from(source: &str) -> Engine {
    let mut engine = Engine::new();
    engine
        .load_module_source(source)
        .expect("fixture macro should parse");
    engine
}

#[test]
fn dropper_writes_payload_and_shells_it() {
    let mut engine = engine_from(include_str!("fixtures/dropper.bas"));
    let ran = engine.run_entry_points();
    assert_eq!(ran, vec!["AutoOpen".to_string()]);

    let report = engine.report();
    assert_eq!(
        report.closed_files.get("c:/Users/Public/load.exe"),
        Some(&"MZmalware".to_string())
    );
    let shell = report
        .actions
        .iter()
        .find(|a| a.action == "Shell function")
        .expect("Shell call should be reported");
    assert_eq!(shell.params, "cmd /c c:\\Users\\Public\\load.exe");
    assert_eq!(shell.description, "Execute Command");
}

#[test]
fn billion_iteration_delay_loop_finishes_and_decodes() {
    let mut engine = engine_from(include_str!("fixtures/decoder.bas"));
    engine.run_entry_points();

    let report = engine.report();
    let shell = report
        .actions
        .iter()
        .find(|a| a.action == "Shell function")
        .expect("decoded Shell call should be reported");
    assert_eq!(shell.params, "calc.exe /x");
}

#[test]
fn declared_external_download_is_reported() {
    let mut engine = engine_from(include_str!("fixtures/downloader.bas"));
    engine.run_entry_points();

    let report = engine.report();
    let download = report
        .actions
        .iter()
        .find(|a| a.action == "Download URL")
        .expect("URLDownloadToFile should be reported");
    assert_eq!(download.params, "http://evil.example/p.bin");
    assert!(report
        .actions
        .iter()
        .any(|a| a.action == "Write File" && a.params == "c:\\temp\\p.bin"));
}

#[test]
fn goto_to_unknown_label_logs_without_crashing() {
    let mut engine = engine_from(include_str!("fixtures/downloader.bas"));
    engine.run_entry_points();
    // The bad jump at the end of AutoExec lands in the error tally.
    assert_eq!(engine.report().general_errors, 1);
}

#[test]
fn open_print_close_lands_in_closed_files() {
    let mut engine = engine_from(include_str!("fixtures/logger.bas"));
    engine.run_entry_points();

    let report = engine.report();
    assert_eq!(
        report.closed_files.get("c:/temp/log.txt"),
        Some(&"stolen data\r\n".to_string())
    );
    assert!(report
        .actions
        .iter()
        .any(|a| a.action == "OPEN" && a.params == "c:\\temp\\log.txt"));
}

#[test]
fn base64_stager_decodes_through_nodetypedvalue() {
    let mut engine = engine_from(include_str!("fixtures/stager.bas"));
    engine.run_entry_points();

    let report = engine.report();
    assert_eq!(
        report.closed_files.get("c:/temp/run.bat"),
        Some(&"cmd /c whoami".to_string())
    );
    let shell = report
        .actions
        .iter()
        .find(|a| a.action == "Shell function")
        .expect("staged Shell call should be reported");
    assert_eq!(shell.params, "cmd /c whoami");
}

#[test]
fn all_fixtures_load_together_and_every_entry_runs() {
    let mut engine = Engine::new();
    for source in [
        include_str!("fixtures/dropper.bas"),
        include_str!("fixtures/decoder.bas"),
        include_str!("fixtures/downloader.bas"),
        include_str!("fixtures/logger.bas"),
    ] {
        engine.load_module_source(source).unwrap();
    }
    let mut ran = engine.run_entry_points();
    ran.sort();
    assert_eq!(
        ran,
        vec![
            "AutoExec".to_string(),
            "AutoOpen".to_string(),
            "Document_Open".to_string(),
            "Workbook_Open".to_string(),
        ]
    );
}

#[test]
fn run_procedure_invokes_non_entry_subs() {
    let mut engine = engine_from(
        "Function Sum(a, b)\n  Sum = a + b\nEnd Function\n",
    );
    let value = engine.run_procedure("Sum", &[Value::Int(2), Value::Int(3)]);
    assert_eq!(value, Value::Int(5));
}
