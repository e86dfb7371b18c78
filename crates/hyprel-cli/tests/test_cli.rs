use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

const FACTS: &str = "\
# subject,relation,object[,qualifier_relation,qualifier_entity]*
alice,works_at,acme,role,engineer
bob,works_at,acme
alice,knows,bob,since,y2019,via,carol
";

#[test]
fn test_cli_stats() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("facts.csv");
    fs::write(&file, FACTS)?;

    let mut cmd = Command::cargo_bin("hyprel")?;
    cmd.arg("stats").arg(&file);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Entities:       6"))
        .stdout(predicate::str::contains("Relations:      5"))
        .stdout(predicate::str::contains("Statements:     3"))
        .stdout(predicate::str::contains("Qualified:      2"))
        .stdout(predicate::str::contains("Qualifiers:     3"));
    Ok(())
}

#[test]
fn test_cli_stats_missing_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("hyprel")?;
    cmd.arg("stats").arg("does/not/exist.csv");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load"));
    Ok(())
}

#[test]
fn test_cli_stats_reports_bad_line() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("bad.csv");
    fs::write(&file, "a,r,b\na,r\n")?;

    let mut cmd = Command::cargo_bin("hyprel")?;
    cmd.arg("stats").arg(&file);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("line 2"));
    Ok(())
}

#[test]
fn test_cli_train_small() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let train = dir.path().join("train.csv");
    let valid = dir.path().join("valid.csv");
    let config = dir.path().join("config.json");
    fs::write(&train, FACTS)?;
    fs::write(&valid, "bob,knows,alice\n")?;
    fs::write(
        &config,
        r#"{
            "EMBEDDING_DIM": 8,
            "MAX_QPAIRS": 2,
            "MODEL": { "OPN": "sub", "TRIP_LAYERS": 1, "QUAL_LAYERS": 1,
                       "T_N_HEADS": 2, "T_HIDDEN": 16, "T_LAYERS": 1 },
            "TRAINING": { "BATCH_SIZE": 4, "EVAL_EVERY": 1 }
        }"#,
    )?;

    let mut cmd = Command::cargo_bin("hyprel")?;
    cmd.arg("train")
        .arg("--config")
        .arg(&config)
        .arg("--train")
        .arg(&train)
        .arg("--valid")
        .arg(&valid)
        .arg("--epochs")
        .arg("2");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Epochs run:     2"))
        .stdout(predicate::str::contains("Valid MRR:"));
    Ok(())
}

#[test]
fn test_cli_train_prints_predictions_and_keeps_vocab() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let train = dir.path().join("train.csv");
    let valid = dir.path().join("valid.csv");
    let config = dir.path().join("config.json");
    let vocab = dir.path().join("vocab.json");
    fs::write(&train, FACTS)?;
    fs::write(&valid, "bob,knows,alice\n")?;
    fs::write(
        &config,
        r#"{
            "EMBEDDING_DIM": 8,
            "MAX_QPAIRS": 2,
            "MODEL": { "OPN": "corr", "TRIP_LAYERS": 1, "QUAL_LAYERS": 1,
                       "T_N_HEADS": 2, "T_HIDDEN": 16, "T_LAYERS": 1 },
            "TRAINING": { "BATCH_SIZE": 4, "EVAL_EVERY": 1, "QUALIFIER_AWARE": false }
        }"#,
    )?;

    for _ in 0..2 {
        let mut cmd = Command::cargo_bin("hyprel")?;
        cmd.arg("train")
            .arg("--config")
            .arg(&config)
            .arg("--train")
            .arg(&train)
            .arg("--valid")
            .arg(&valid)
            .arg("--epochs")
            .arg("1")
            .arg("--vocab")
            .arg(&vocab)
            .arg("--predictions")
            .arg("1");
        cmd.assert()
            .success()
            .stdout(predicate::str::contains("Top predictions:"))
            .stdout(predicate::str::contains("bob knows ? ->"));
    }

    let saved = fs::read_to_string(&vocab)?;
    assert!(saved.contains("alice"));
    assert!(saved.contains("works_at"));
    Ok(())
}
