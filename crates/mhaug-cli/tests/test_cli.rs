use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_cli_generate_and_stats() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let graph = dir.path().join("graph.json");

    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("generate")
        .arg("-o")
        .arg(&graph)
        .arg("--nodes")
        .arg("50")
        .arg("--classes")
        .arg("3")
        .arg("--feature-dim")
        .arg("4");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Wrote 50 nodes"));
    assert!(graph.exists());

    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("stats").arg(&graph).arg("--num-parts").arg("2");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Nodes:          50"))
        .stdout(predicate::str::contains("Feature dim:    4"))
        .stdout(predicate::str::contains("Partitions:     2"))
        .stdout(predicate::str::contains("part 1: nodes 25..50"));
    Ok(())
}

#[test]
fn test_cli_train_writes_summary() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = dir.path().join("train.json");
    let summary = dir.path().join("summary.json");
    fs::write(
        &config,
        r#"{"num_hidden": 8, "eval_every": 1, "augment": {"max_attempts": 1000}}"#,
    )?;

    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("--log-level")
        .arg("warn")
        .arg("train")
        .arg("--config")
        .arg(&config)
        .arg("--nodes")
        .arg("60")
        .arg("--num-parts")
        .arg("2")
        .arg("--epochs")
        .arg("2")
        .arg("--batch-size")
        .arg("16")
        .arg("--fan-out")
        .arg("3,3")
        .arg("-o")
        .arg(&summary);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("TestAccuracy"));

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&summary)?)?;
    assert_eq!(json["commits"], 4);
    assert_eq!(json["epochs"].as_array().map(Vec::len), Some(4));
    Ok(())
}

#[test]
fn test_cli_rejects_bad_fan_out() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("train").arg("--nodes").arg("30").arg("--fan-out").arg("0,5");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid fan-out"));
    Ok(())
}

#[test]
fn test_cli_rejects_non_positive_learning_rate() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("train").arg("--nodes").arg("30").arg("--lr=-0.1");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid training config"));
    Ok(())
}

#[test]
fn test_cli_rejects_bad_log_level() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("--log-level").arg("loud").arg("stats").arg("missing.json");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
    Ok(())
}

#[test]
fn test_cli_missing_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("mhaug")?;
    cmd.arg("stats").arg("does-not-exist.json");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load dataset"));
    Ok(())
}
