use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[cfg(not(feature = "storage-postgres"))]
#[test]
fn test_postgres_fallback_warning() {
    let mut cmd = Command::new(cargo_bin!("ledgerwatch"));
    cmd.env("DB", "postgresql://root@localhost:26257/bank?sslmode=disable")
        .env_remove("RUST_LOG")
        .args(["-d", "0", "-a", "2", "--port", "0", "--exit-on-complete"]);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains(
            "WARNING: Persistent storage requested via DB, but 'storage-postgres' feature is not enabled. Falling back to in-memory storage.",
        ));
}

#[test]
fn test_memory_connection_string_has_no_warning() {
    let mut cmd = Command::new(cargo_bin!("ledgerwatch"));
    cmd.env("DB", "memory")
        .env_remove("RUST_LOG")
        .args(["-d", "0", "-a", "2", "--port", "0", "--exit-on-complete"]);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("WARNING").not());
}
