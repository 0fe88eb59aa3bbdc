use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

fn install_cmd(root: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sops-install-secrets").unwrap();
    cmd.env("XDG_RUNTIME_DIR", root.path());
    cmd.env_remove("NIXOS_ACTION");
    cmd.env_remove("SOPS_INSTALL_SECRETS_SOPS");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// A stand-in for sops that prints its last argument unchanged.
fn fake_sops(root: &TempDir) -> PathBuf {
    let path = root.path().join("fake-sops");
    fs::write(&path, "#!/bin/sh\nfor last; do :; done\ncat \"$last\"\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_manifest(root: &TempDir, sops_file: &Path, key: &str) -> PathBuf {
    let manifest = json!({
        "secrets": [{
            "name": "app/password",
            "key": key,
            "path": root.path().join("etc/app-password"),
            "sopsFile": sops_file,
            "format": "yaml",
            "mode": "0400"
        }],
        "secretsMountPoint": root.path().join("secrets.d"),
        "symlinkPath": root.path().join("secrets"),
        "keepGenerations": 1,
        "userMode": true,
        "logging": { "keyImport": false, "secretChanges": false }
    });
    let path = root.path().join("manifest.json");
    fs::write(&path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    path
}

fn write_source(root: &TempDir) -> PathBuf {
    let path = root.path().join("secrets.yaml");
    fs::write(&path, "password: hunter2\n").unwrap();
    path
}

#[test]
fn test_help() {
    let root = TempDir::new().unwrap();
    install_cmd(&root)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--check-mode"));
}

#[test]
fn test_no_arguments_prints_usage() {
    let root = TempDir::new().unwrap();
    install_cmd(&root)
        .assert()
        .success()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_missing_manifest() {
    let root = TempDir::new().unwrap();
    install_cmd(&root)
        .arg(root.path().join("nope.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "sops-install-secrets: Failed to open manifest",
        ));
}

#[test]
fn test_invalid_check_mode() {
    let root = TempDir::new().unwrap();
    let manifest = write_manifest(&root, &write_source(&root), "password");
    install_cmd(&root)
        .arg("-check-mode=everything")
        .arg(&manifest)
        .assert()
        .failure();
}

#[test]
fn test_check_mode_manifest() {
    let root = TempDir::new().unwrap();
    let manifest = write_manifest(&root, Path::new("/nonexistent/secrets.yaml"), "password");
    install_cmd(&root)
        .arg("-check-mode=manifest")
        .arg(&manifest)
        .assert()
        .success();
    assert!(!root.path().join("secrets.d").exists());
}

#[test]
fn test_check_mode_sopsfile() {
    let root = TempDir::new().unwrap();
    let source = write_source(&root);

    let manifest = write_manifest(&root, &source, "password");
    install_cmd(&root)
        .args(["--check-mode", "sopsfile"])
        .arg(&manifest)
        .assert()
        .success();

    let manifest = write_manifest(&root, &source, "missing");
    install_cmd(&root)
        .arg("-check-mode=sopsfile")
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not valid: The key"));
}

#[test]
fn test_install_with_external_sops() {
    let root = TempDir::new().unwrap();
    let sops = fake_sops(&root);
    let manifest = write_manifest(&root, &write_source(&root), "password");

    for _ in 0..2 {
        install_cmd(&root)
            .arg("--sops")
            .arg(&sops)
            .arg(&manifest)
            .assert()
            .success();
    }

    let link = root.path().join("secrets");
    assert_eq!(fs::read_link(&link).unwrap(), root.path().join("secrets.d/2"));
    assert!(!root.path().join("secrets.d/1").exists());
    assert_eq!(
        fs::read_to_string(root.path().join("etc/app-password")).unwrap(),
        "hunter2"
    );
}

#[test]
fn test_sops_failure_is_reported() {
    let root = TempDir::new().unwrap();
    let manifest = write_manifest(&root, &write_source(&root), "password");
    install_cmd(&root)
        .arg("--sops")
        .arg("/bin/false")
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to decrypt"));
    assert!(!root.path().join("secrets").exists());
}
