mod support;

use sqlgen_core::Question;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use support::*;
use tempfile::tempdir;
use tokio::sync::watch;

fn checkpoint_ids(root: &Path) -> Vec<i64> {
    let raw = std::fs::read_to_string(root.join("out/checkpoint.txt")).unwrap();
    let mut ids: Vec<i64> = raw.lines().map(|l| l.parse().unwrap()).collect();
    ids.sort_unstable();
    ids
}

fn keys(value: &serde_json::Value) -> BTreeSet<String> {
    value.as_object().unwrap().keys().cloned().collect()
}

fn linked_questions(root: &Path) -> Vec<Question> {
    let raw = std::fs::read_to_string(root.join("out/questions_with_runtime_schema.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

const LINKING: &str =
    "linking:\n  enabled: true\n  pipeline: false\n  llm:\n    model: [fake, linker]\n";

#[tokio::test(flavor = "multi_thread")]
async fn resumed_run_keeps_earlier_linked_schemas() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    let gens = [generator(1, "gen", "basic", true, "null")];
    let gen = recording(Arc::default(), |_| Ok("name FROM t".to_string()));

    toy_questions(root, &[(1, "alpha names")]);
    let linker_a = recording(Arc::default(), |_| Ok(r#"{"t": ["name"]}"#.to_string()));
    let orch = orchestrator(run_config(root, "out", &gens, LINKING), |_, role| match role {
        "schema_linker" => linker_a.clone(),
        _ => gen.clone(),
    });
    orch.run().await.unwrap();
    let first = linked_questions(root);
    let alpha_schema = first[0].runtime_schema_used.clone();
    assert!(alpha_schema.is_some());

    toy_questions(root, &[(1, "alpha names"), (2, "beta names")]);
    let linker_prompts = Arc::new(Mutex::new(Vec::new()));
    let linker_b = recording(linker_prompts.clone(), |_| Ok(r#"{"t": ["name"]}"#.to_string()));
    let orch = orchestrator(run_config(root, "out", &gens, LINKING), |_, role| match role {
        "schema_linker" => linker_b.clone(),
        _ => gen.clone(),
    });
    let summary = orch.run().await.unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.answered, 1);

    let prompts = linker_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].contains("alpha"));

    let second = linked_questions(root);
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].question_id, 1);
    assert_eq!(second[0].runtime_schema_used, alpha_schema);
    assert!(second[1].runtime_schema_used.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupt_records_the_generating_question_and_resume_finishes_the_rest() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    toy_questions(
        root,
        &[(1, "alpha names"), (2, "beta names"), (3, "gamma names"), (4, "delta names")],
    );
    let gens = [generator(1, "gen", "code", false, "null")];

    // Ctrl-C lands while question 2 is waiting on the model.
    let (tx, rx) = watch::channel(false);
    let client = recording(Arc::default(), move |prompt| {
        if prompt.contains("beta") {
            let _ = tx.send(true);
        }
        Ok("name FROM t".to_string())
    });
    let mut cfg = run_config(root, "out", &gens, "");
    cfg.concurrency.question_workers = 1;
    let summary = orchestrator(cfg, |_, _| client.clone())
        .with_shutdown(rx)
        .run()
        .await
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.answered, 2);
    assert!(summary.failed.is_empty());
    assert_eq!(checkpoint_ids(root), [1, 2]);
    let answered: BTreeSet<String> = ["1", "2"].iter().map(|s| s.to_string()).collect();
    assert_eq!(keys(&read_json(&root.join("out/selections.json"))), answered);
    assert_eq!(keys(&read_json(&root.join("out/predict_dev.json"))), answered);
    let metadata = read_json(&root.join("out/run_metadata.json"));
    assert_eq!(metadata["databases"]["toy"], "in_progress");

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let client = recording(prompts.clone(), |_| Ok("name FROM t".to_string()));
    let summary = orchestrator(run_config(root, "out", &gens, ""), |_, _| client.clone())
        .run()
        .await
        .unwrap();

    assert!(!summary.interrupted);
    assert_eq!(summary.resumed, 2);
    assert_eq!(summary.answered, 2);
    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    for done in ["alpha", "beta"] {
        assert!(prompts.iter().all(|p| !p.contains(done)), "{done} was asked again");
    }
    assert_eq!(checkpoint_ids(root), [1, 2, 3, 4]);
    assert_eq!(predictions(root, "out").len(), 4);
    let metadata = read_json(&root.join("out/run_metadata.json"));
    assert_eq!(metadata["databases"]["toy"], "completed");
}
