//! Unit tests for the `brickwork` binary's output rendering.

use super::*;
use brickwork::pending::OperationStatus;
use clap::CommandFactory;
use rstest::rstest;

fn rendered(write: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
    let mut buf = Vec::new();
    write(&mut buf).expect("write");
    String::from_utf8(buf).expect("utf8")
}

fn report(correct: bool) -> BlockSizeReport {
    BlockSizeReport {
        volume: String::from("v1"),
        name: String::from("hosting"),
        size: 100,
        used: 10,
        free: if correct { 88 } else { 80 },
        reserved: 2,
        correct,
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[rstest]
#[case(&["brickwork", "pending", "clean", "--id", "a", "--id", "b"], 2)]
#[case(&["brickwork", "--db", "state", "pending", "clean"], 0)]
fn clean_accepts_repeated_ids(#[case] args: &[&str], #[case] expected: usize) {
    let cli = Cli::try_parse_from(args).expect("parse");
    let Command::Pending(PendingCommand::Clean(clean)) = cli.command else {
        panic!("expected pending clean");
    };
    assert_eq!(clean.ids.len(), expected);
}

#[test]
fn db_flag_is_global() {
    let cli = Cli::try_parse_from(["brickwork", "block-sizes", "check", "--db", "other-state"])
        .expect("parse");
    assert_eq!(cli.db.as_deref(), Some("other-state"));
}

#[test]
fn summary_lists_every_count() {
    let summary = CleanSummary {
        cleaned: 2,
        failed: 1,
        throttled: 0,
        skipped: 3,
    };
    assert_eq!(
        rendered(|buf| render_summary(buf, summary)),
        "cleaned 2, failed 1, throttled 0, skipped 3\n"
    );
}

#[rstest]
#[case(true, "would remove")]
#[case(false, "removed")]
fn plans_name_their_operations(#[case] dry_run: bool, #[case] verb: &str) {
    let mut plan = PurgePlan::default();
    plan.operations.insert(String::from("op1"));
    plan.volumes.insert(String::from("vol1"));
    let text = rendered(|buf| render_plan(buf, &plan, dry_run));
    assert!(text.starts_with(verb), "rendered: {text}");
    assert!(text.contains("1 operations, 1 volumes"), "rendered: {text}");
    assert!(text.contains("operation op1"), "rendered: {text}");
}

#[rstest]
#[case(true, "ok")]
#[case(false, "MISMATCH")]
fn reports_carry_a_verdict(#[case] correct: bool, #[case] verdict: &str) {
    let text = rendered(|buf| render_reports(buf, &[report(correct)]));
    assert!(text.starts_with("hosting (v1): size=100 used=10"), "rendered: {text}");
    assert!(text.trim_end().ends_with(verdict), "rendered: {text}");
}

#[test]
fn fixes_show_the_correction() {
    let fixes = [FixReport {
        before: report(false),
        outcome: FixOutcome::Fixed { from: 80, to: 88 },
    }];
    let text = rendered(|buf| render_fixes(buf, &fixes));
    assert!(text.contains("fixed free 80 -> 88"), "rendered: {text}");
}

#[test]
fn entries_render_as_json() {
    let mut entry = PendingOperationEntry::with_id("op1");
    entry.status = OperationStatus::Stale;
    let mut buf = Vec::new();
    render_entries(&mut buf, &[entry]).expect("render");
    let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
    assert_eq!(value.pointer("/0/id"), Some(&serde_json::json!("op1")));
    assert_eq!(value.pointer("/0/status"), Some(&serde_json::json!("stale")));
}

#[test]
fn write_error_writes_cli_error() {
    let mut buf = Vec::new();
    write_error(&mut buf, &CliError::CleanerDisabled);
    let text = String::from_utf8(buf).expect("utf8");
    assert!(text.contains("background cleaner is disabled"), "rendered: {text}");
}
