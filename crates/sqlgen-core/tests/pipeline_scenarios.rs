mod support;

use sqlgen_core::schema::PrunedSchema;
use sqlgen_core::Question;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use support::*;
use tempfile::tempdir;

const SLOW_SQL: &str = "WITH RECURSIVE c(x) AS \
                        (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000000000000) \
                        SELECT count(*) FROM c";

fn names() -> Vec<Vec<String>> {
    vec![
        vec![format!("{:?}", rusqlite::types::Value::Text("a".into()))],
        vec![format!("{:?}", rusqlite::types::Value::Text("b".into()))],
    ]
}

#[tokio::test(flavor = "multi_thread")]
async fn trivial_select_single_candidate() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    toy_questions(root, &[(0, "List all names.")]);
    let cfg = run_config(root, "out", &[generator(1, "gen", "code", false, "null")], "");

    let log = Arc::new(Mutex::new(Vec::new()));
    let client = recording(log.clone(), |_| Ok("name FROM t".to_string()));
    let summary = orchestrator(cfg, |_, _| client.clone()).run().await.unwrap();
    assert_eq!(summary.answered, 1);
    assert!(summary.failed.is_empty());

    let preds = predictions(root, "out");
    assert_eq!(preds["0"], "SELECT name FROM t\t----- bird -----\ttoy");
    assert_eq!(rows(root, "toy", "SELECT name FROM t"), names());
    assert!(log.lock().unwrap()[0].trim_end().ends_with("SELECT"));

    let gold = std::fs::read_to_string(root.join("out/dev_gold.sql")).unwrap();
    assert_eq!(gold, "SELECT name FROM t\ttoy\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn refiner_repairs_unknown_column() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    toy_questions(root, &[(0, "List all names.")]);
    let improve = "{ client: null, prompt: basic, max_attempts: 3 }";
    let cfg = run_config(root, "out", &[generator(1, "gen", "code", false, improve)], "");

    let log = Arc::new(Mutex::new(Vec::new()));
    let client = recording(log.clone(), |prompt| {
        Ok(if prompt.contains("Improve the following predicted SQLite SQL query") {
            "```sql\nSELECT name FROM t\n```".to_string()
        } else {
            "fullname FROM t".to_string()
        })
    });
    orchestrator(cfg, |_, _| client.clone()).run().await.unwrap();

    let selections = read_json(&root.join("out/selections.json"));
    let cand = &selections["0"]["candidates"][0];
    assert_eq!(cand["refine_status"], "OK_AFTER_REPAIR");
    assert_eq!(cand["final_status"], "ok");
    let trace = cand["trace"].as_array().unwrap();
    assert!(!trace.is_empty());
    assert_eq!(trace[0]["sql_before"], "SELECT fullname FROM t");
    assert_eq!(trace[0]["execution_outcome"]["kind"], "error");
    assert_eq!(trace[0]["sql_after"], "SELECT name FROM t");

    let chosen = selections["0"]["chosen_sql"].as_str().unwrap();
    assert_eq!(rows(root, "toy", chosen), names());
    let repair_prompt = log
        .lock()
        .unwrap()
        .iter()
        .find(|p| p.contains("Improve the following"))
        .cloned()
        .unwrap();
    assert!(repair_prompt.contains("no such column: fullname"), "{repair_prompt}");
}

#[tokio::test(flavor = "multi_thread")]
async fn selector_picks_between_disagreeing_candidates() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    toy_questions(root, &[(0, "List all names.")]);
    let cfg = run_config(
        root,
        "out",
        &[
            generator(1, "c1", "code", false, "null"),
            generator(2, "c2", "code", false, "null"),
        ],
        "selector:\n  model: [fake, judge]\n",
    );

    let judge_prompts = Arc::new(Mutex::new(Vec::new()));
    let judge = recording(judge_prompts.clone(), |_| Ok("A".to_string()));
    let c1 = recording(Arc::default(), |_| Ok("SELECT name FROM t ORDER BY id".to_string()));
    let c2 = recording(Arc::default(), |_| Ok("id FROM t".to_string()));
    let orch = orchestrator(cfg, |model, role| match (model, role) {
        (_, "selector") => judge.clone(),
        ("c1", _) => c1.clone(),
        _ => c2.clone(),
    });
    orch.run().await.unwrap();

    let selections = read_json(&root.join("out/selections.json"));
    let sel = &selections["0"];
    assert_eq!(sel["chosen_config_id"], 1);
    assert_eq!(sel["chosen_sql"], "SELECT name FROM t ORDER BY id");
    assert!(sel["judge_input_fingerprint"].is_string());

    let chosen = sel["chosen_sql"].as_str().unwrap();
    let matching = sel["candidates"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["sql"] == chosen)
        .count();
    assert_eq!(matching, 1);

    let prompts = judge_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Candidate A\n【SQL】\nSELECT name FROM t ORDER BY id"));
    assert!(prompts[0].contains("Candidate B\n【SQL】\nSELECT id FROM t"));
}

#[tokio::test(flavor = "multi_thread")]
async fn linking_prunes_unrelated_tables() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    create_db(
        root,
        "shop",
        "CREATE TABLE customer(id INTEGER PRIMARY KEY, name TEXT, email TEXT);
         CREATE TABLE \"order\"(
             id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customer(id), total REAL
         );
         CREATE TABLE product(id INTEGER PRIMARY KEY, title TEXT, price REAL);
         CREATE TABLE warehouse(id INTEGER PRIMARY KEY, city TEXT);
         INSERT INTO customer VALUES (1, 'Ann', 'ann@example.com');
         INSERT INTO \"order\" VALUES (10, 1, 9.5);",
    );
    write_questions(
        root,
        serde_json::json!([{
            "question_id": 7, "db_id": "shop",
            "question": "How many orders did each customer place?", "evidence": ""
        }]),
    );
    let cfg = run_config(
        root,
        "out",
        &[generator(1, "gen", "basic", true, "null")],
        "linking:\n  enabled: true\n  pipeline: false\n  llm:\n    model: [fake, linker]\n",
    );

    let linker_reply = r#"{"customer": ["id", "name"], "order": ["id", "customer_id"]}"#;
    let linker = recording(Arc::default(), move |_| Ok(linker_reply.to_string()));
    let gen_prompts = Arc::new(Mutex::new(Vec::new()));
    let gen = recording(gen_prompts.clone(), |_| {
        let sql = "c.name, COUNT(o.id) FROM customer c \
                   JOIN \"order\" o ON o.customer_id = c.id GROUP BY c.id";
        Ok(sql.to_string())
    });
    let orch = orchestrator(cfg, |_, role| match role {
        "schema_linker" => linker.clone(),
        _ => gen.clone(),
    });
    orch.run().await.unwrap();

    let mut expected = PrunedSchema::new();
    expected.push_table("customer", vec!["id".into(), "name".into()]);
    expected.push_table("order", vec!["id".into(), "customer_id".into()]);

    let raw = std::fs::read_to_string(root.join("out/questions_with_runtime_schema.json")).unwrap();
    let questions: Vec<Question> = serde_json::from_str(&raw).unwrap();
    assert_eq!(questions[0].runtime_schema_used.as_ref(), Some(&expected));

    let prompts = gen_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert!(prompt.contains("Table customer, columns = [ id, name ]"), "{prompt}");
    assert!(prompt.contains("Table order, columns = [ id, customer_id ]"), "{prompt}");
    for absent in ["product", "warehouse", "email", "total"] {
        assert!(!prompt.contains(absent), "{absent} leaked into {prompt}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_run_skips_checkpointed_questions() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    let first = [(1, "alpha names"), (2, "beta names"), (3, "gamma names")];
    toy_questions(root, &first);
    let gens = [generator(1, "gen", "code", false, "null")];

    let client_a = recording(Arc::default(), |_| Ok("name FROM t".to_string()));
    let cfg = run_config(root, "out", &gens, "");
    orchestrator(cfg, |_, _| client_a.clone()).run().await.unwrap();
    let before = predictions(root, "out");
    assert_eq!(before.len(), 3);
    let checkpoint = std::fs::read_to_string(root.join("out/checkpoint.txt")).unwrap();
    let mut done: Vec<&str> = checkpoint.lines().collect();
    done.sort_unstable();
    assert_eq!(done, ["1", "2", "3"]);

    // The interrupted run never reached question 4.
    toy_questions(root, &[first[0], first[1], first[2], (4, "delta names")]);
    let forbidden = Arc::new(AtomicUsize::new(0));
    let seen = forbidden.clone();
    let client_b = recording(Arc::default(), move |prompt| {
        if ["alpha", "beta", "gamma"].iter().any(|w| prompt.contains(w)) {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("question already answered");
        }
        Ok("id FROM t".to_string())
    });
    let cfg = run_config(root, "out", &gens, "");
    let summary = orchestrator(cfg, |_, _| client_b.clone()).run().await.unwrap();

    assert_eq!(forbidden.load(Ordering::SeqCst), 0);
    assert_eq!(summary.resumed, 3);
    assert_eq!(summary.answered, 1);
    let after = predictions(root, "out");
    for id in ["1", "2", "3"] {
        assert_eq!(after[id], before[id]);
    }
    assert_eq!(after["4"], "SELECT id FROM t\t----- bird -----\ttoy");
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_candidate_times_out_and_is_still_written() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    toy_db(root);
    toy_questions(root, &[(0, "List all names.")]);
    let improve = "{ client: null, prompt: basic, max_attempts: 1 }";
    let cfg = run_config(
        root,
        "out",
        &[generator(1, "gen", "code", false, improve)],
        "sql_timeout_secs: 1\n",
    );

    let log = Arc::new(Mutex::new(Vec::new()));
    let client = recording(log.clone(), |prompt| {
        Ok(if prompt.contains("Improve the following") {
            format!("```sql\n{SLOW_SQL}\n```")
        } else {
            SLOW_SQL.to_string()
        })
    });
    let started = Instant::now();
    let summary = orchestrator(cfg, |_, _| client.clone()).run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(summary.answered, 1);

    let selections = read_json(&root.join("out/selections.json"));
    let cand = &selections["0"]["candidates"][0];
    assert_eq!(cand["refine_status"], "EXHAUSTED");
    assert_eq!(cand["final_status"], "timeout");
    assert_eq!(cand["trace"][0]["execution_outcome"]["kind"], "timeout");

    let repair = log
        .lock()
        .unwrap()
        .iter()
        .find(|p| p.contains("Improve the following"))
        .cloned()
        .unwrap();
    assert!(repair.contains("Query timed out"), "{repair}");
    assert!(predictions(root, "out")["0"].starts_with("WITH RECURSIVE c(x)"));
}
