mod support;

use regex::Regex;
use sqlgen_core::config::DatasetLayout;
use sqlgen_core::sql::runner::{ExecutionResult, SqlRunner, SqliteRunner};
use sqlgen_core::Question;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::*;
use tempfile::tempdir;

fn two_db_fixture(root: &std::path::Path) {
    toy_db(root);
    create_db(
        root,
        "zoo",
        "CREATE TABLE animal(id INTEGER PRIMARY KEY, species TEXT, legs INTEGER);
         INSERT INTO animal VALUES (1, 'cat', 4), (2, 'emu', 2);",
    );
    write_questions(
        root,
        serde_json::json!([
            {"question_id": 3, "db_id": "zoo", "question": "Which species have four legs?",
             "evidence": "legs = 4", "SQL": "SELECT species FROM animal WHERE legs = 4"},
            {"question_id": 1, "db_id": "toy", "question": "List all names.", "evidence": "",
             "SQL": "SELECT name FROM t"},
            {"question_id": 2, "db_id": "zoo", "question": "Count the animals.", "evidence": "",
             "SQL": "SELECT COUNT(*) FROM animal"},
            {"question_id": 4, "db_id": "missing", "question": "Anything?", "evidence": ""}
        ]),
    );
}

fn reply(prompt: &str) -> anyhow::Result<String> {
    Ok(if prompt.contains("animal") {
        "species FROM animal\nWHERE legs = 4".to_string()
    } else {
        "name FROM t".to_string()
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_inputs_give_identical_predictions() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    two_db_fixture(root);
    let gens = [
        generator(1, "a", "code", false, "null"),
        generator(2, "b", "openai", false, "{ client: null, prompt: xiyan, max_attempts: 2 }"),
    ];
    let extra = "selector:\n  model: [fake, judge]\n";

    for out in ["run_a", "run_b"] {
        let client = recording(Arc::default(), reply);
        let cfg = run_config(root, out, &gens, extra);
        let summary = orchestrator(cfg, |_, _| client.clone()).run().await.unwrap();
        assert_eq!(summary.skipped_databases, vec!["missing".to_string()]);
        assert_eq!(summary.answered, 3);
    }
    let a = std::fs::read(root.join("run_a/predict_dev.json")).unwrap();
    let b = std::fs::read(root.join("run_b/predict_dev.json")).unwrap();
    assert_eq!(a, b);

    // A rerun over a complete checkpoint rewrites the same bytes.
    let client = recording(Arc::default(), |_| anyhow::bail!("nothing left to answer"));
    let cfg = run_config(root, "run_a", &gens, extra);
    orchestrator(cfg, |_, _| client.clone()).run().await.unwrap();
    assert_eq!(std::fs::read(root.join("run_a/predict_dev.json")).unwrap(), a);

    let line = Regex::new(r"^.+\t----- bird -----\t.+$").unwrap();
    let preds = predictions(root, "run_a");
    assert_eq!(preds.keys().collect::<Vec<_>>(), ["1", "2", "3"]);
    for value in preds.values() {
        assert!(line.is_match(value), "{value:?}");
    }
    assert_eq!(preds["3"], "SELECT species FROM animal WHERE legs = 4\t----- bird -----\tzoo");

    let errors = read_json(&root.join("run_a/errors.json"));
    assert!(errors.to_string().contains("missing"));
}

#[tokio::test(flavor = "multi_thread")]
async fn linked_schema_only_names_existing_columns() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    toy_questions(root, &[(1, "List all names."), (2, "List the ids.")]);
    let cfg = run_config(
        root,
        "out",
        &[generator(1, "gen", "code", true, "null")],
        "linking:\n  enabled: true\n  pipeline: false\n  llm:\n    model: [fake, linker]\n",
    );
    let linker = recording(Arc::default(), |_| {
        let reply = concat!(
            r#"{"tables": {"T": {"NAME": "asked", "nickname": "made up"}, "#,
            r#""ghost": {"id": "?"}}}"#
        );
        Ok(reply.to_string())
    });
    let gen = recording(Arc::default(), |_| Ok("name FROM t".to_string()));
    let orch = orchestrator(cfg, |_, role| match role {
        "schema_linker" => linker.clone(),
        _ => gen.clone(),
    });
    orch.run().await.unwrap();

    let raw = std::fs::read_to_string(root.join("out/questions_with_runtime_schema.json")).unwrap();
    let questions: Vec<Question> = serde_json::from_str(&raw).unwrap();
    assert_eq!(questions.len(), 2);
    for q in &questions {
        let linked = q.runtime_schema_used.as_ref().unwrap();
        let pairs: Vec<(String, Vec<String>)> = linked
            .iter()
            .map(|(t, cols)| (t.to_string(), cols.to_vec()))
            .collect();
        assert_eq!(pairs, vec![("t".to_string(), vec!["name".to_string()])]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_honours_timeout() {
    let dir = tempdir().unwrap();
    toy_db(dir.path());
    let runner = SqliteRunner::new(DatasetLayout::new(dir.path().join("dev_databases")));
    let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                SELECT max(x) FROM c";
    let started = Instant::now();
    let res = runner.execute("toy", slow, Duration::from_millis(500)).await;
    assert_eq!(res, ExecutionResult::Timeout);
    assert!(started.elapsed() < Duration::from_millis(500) + Duration::from_secs(2));

    let fast = runner.execute("toy", "SELECT name FROM t", Duration::from_millis(500)).await;
    assert!(fast.is_ok());
}
