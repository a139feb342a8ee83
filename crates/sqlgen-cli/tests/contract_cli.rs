#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use rusqlite::Connection;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_dataset(root: &Path) {
    let db_dir = root.join("dev_databases").join("shop");
    fs::create_dir_all(&db_dir).unwrap();
    let conn = Connection::open(db_dir.join("shop.sqlite")).unwrap();
    conn.execute_batch(
        "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT, price REAL);
         INSERT INTO item VALUES (1, 'pen', 1.5), (2, 'ink', 3.0);",
    )
    .unwrap();
    let questions = serde_json::json!([
        {"question_id": 0, "db_id": "shop", "question": "Is there anything?", "evidence": "",
         "SQL": "SELECT 1", "difficulty": "simple"},
        {"question_id": 1, "db_id": "shop", "question": "How many items?", "evidence": "",
         "SQL": "SELECT COUNT(*) FROM item", "difficulty": "moderate"}
    ]);
    fs::write(root.join("dev.json"), questions.to_string()).unwrap();
}

fn write_config(root: &Path) -> std::path::PathBuf {
    let path = root.join("run.yaml");
    fs::write(
        &path,
        r#"
questions: dev.json
dataset:
  dataset_dir: dev_databases
output:
  output_dir: out
  preprocessed_dir: pre
  index_dir: idx
sql_timeout_secs: 5
generators:
  - config_id: 1
    model: [fake, canned]
    temperature: 0.0
    max_tokens: 256
    prompt_config: { type: code_repr, shots: 0, format_type: code }
    prune_schema: false
    add_evidence: true
    improve: null
"#,
    )
    .unwrap();
    path
}

#[test]
fn validate_missing_config_exits_2() {
    let dir = tempdir().unwrap();
    Command::cargo_bin("sqlgen")
        .unwrap()
        .args(["validate", "-c"])
        .arg(dir.path().join("nope.yaml"))
        .assert()
        .code(2);
}

#[test]
fn validate_rejects_duplicate_config_ids() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path());
    let cfg = write_config(dir.path());
    let raw = fs::read_to_string(&cfg).unwrap();
    let gen = &raw[raw.find("  - config_id").unwrap()..];
    fs::write(&cfg, format!("{raw}{gen}selector:\n  model: [fake, judge]\n")).unwrap();

    Command::cargo_bin("sqlgen")
        .unwrap()
        .args(["validate", "-c"])
        .arg(&cfg)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("duplicate config_id 1"));
}

#[test]
fn run_then_eval_with_canned_model() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path());
    let cfg = write_config(dir.path());

    Command::cargo_bin("sqlgen")
        .unwrap()
        .args(["run", "-c"])
        .arg(&cfg)
        .env("RUST_LOG", "warn")
        .assert()
        .success()
        .stderr(predicate::str::contains("answered: 2"));

    let out = dir.path().join("out");
    let predictions: Value =
        serde_json::from_str(&fs::read_to_string(out.join("predict_dev.json")).unwrap()).unwrap();
    assert_eq!(predictions.as_object().unwrap().len(), 2);
    assert!(predictions["0"]
        .as_str()
        .unwrap()
        .starts_with("SELECT 1\t----- bird -----\tshop"));
    let gold = fs::read_to_string(out.join("dev_gold.sql")).unwrap();
    assert_eq!(gold.lines().count(), 2);

    // Second run resumes and answers nothing new.
    Command::cargo_bin("sqlgen")
        .unwrap()
        .args(["run", "-c"])
        .arg(&cfg)
        .assert()
        .success()
        .stderr(predicate::str::contains("answered: 0"));

    let report = dir.path().join("report.json");
    Command::cargo_bin("sqlgen")
        .unwrap()
        .arg("eval")
        .arg("--predictions")
        .arg(out.join("predict_dev.json"))
        .arg("--questions")
        .arg(dir.path().join("dev.json"))
        .arg("--dataset-dir")
        .arg(dir.path().join("dev_databases"))
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("total"));

    let report: Value = serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(report["buckets"]["simple"]["correct"], 1);
    assert_eq!(report["buckets"]["moderate"]["correct"], 0);
    assert_eq!(report["buckets"]["total"]["count"], 2);
}

#[test]
fn schema_used_writes_output_file() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path());
    let out = dir.path().join("with_schema.json");
    Command::cargo_bin("sqlgen")
        .unwrap()
        .arg("schema-used")
        .arg("--questions")
        .arg(dir.path().join("dev.json"))
        .arg("--dataset-dir")
        .arg(dir.path().join("dev_databases"))
        .arg("--output")
        .arg(&out)
        .assert()
        .success();
    let questions: Value = serde_json::from_str(&fs::read_to_string(out).unwrap()).unwrap();
    assert!(questions[1]["schema_used"].to_string().contains("item"));
}
