use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::json;
use sops_install::config::{Activation, CheckMode, InstallOptions};
use sops_install::decrypt::{Decrypt, DecryptionEnv};
use sops_install::error::{ErrorKind, InstallError, Result};
use sops_install::format::Format;
use sops_install::install::{Installer, Outcome};
use sops_install::keys::{KeyConverter, PgpKey};
use sops_install::manifest::Manifest;
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Serves plaintext from memory instead of running sops.
#[derive(Default)]
struct FixtureDecryptor {
    plaintext: HashMap<PathBuf, Vec<u8>>,
    calls: Cell<usize>,
}

impl FixtureDecryptor {
    fn with(mut self, path: &Path, content: &[u8]) -> Self {
        self.plaintext.insert(path.to_path_buf(), content.to_vec());
        self
    }
}

impl Decrypt for FixtureDecryptor {
    fn decrypt(&self, path: &Path, _format: Format, _env: &DecryptionEnv) -> Result<Vec<u8>> {
        self.calls.set(self.calls.get() + 1);
        self.plaintext
            .get(path)
            .cloned()
            .ok_or_else(|| InstallError::Decryption {
                path: path.to_path_buf(),
                reason: "no fixture".into(),
            })
    }
}

struct NoKeys;

impl KeyConverter for NoKeys {
    fn ssh_to_pgp(&self, key_path: &Path) -> Result<PgpKey> {
        Err(InstallError::KeyConversion {
            path: key_path.to_path_buf(),
            reason: "not available in tests".into(),
        })
    }

    fn ssh_to_age(&self, key_path: &Path) -> Result<Zeroizing<String>> {
        Err(InstallError::KeyConversion {
            path: key_path.to_path_buf(),
            reason: "not available in tests".into(),
        })
    }
}

struct Host {
    root: TempDir,
}

impl Host {
    fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn mount_point(&self) -> PathBuf {
        self.path("run/secrets.d")
    }

    fn symlink(&self) -> PathBuf {
        self.path("run/secrets")
    }

    /// A sops-shaped source file: key names in clear, values opaque.
    fn sops_yaml(&self, name: &str, keys: &[&str]) -> PathBuf {
        let path = self.path(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut body = String::new();
        for key in keys {
            body.push_str(&format!("{}: ENC[AES256_GCM,data:AAAA,type:str]\n", key));
        }
        body.push_str("sops:\n  version: 3.8.1\n");
        fs::write(&path, body).unwrap();
        path
    }

    fn manifest(&self, secrets: serde_json::Value, extra: serde_json::Value) -> Manifest {
        let mut value = json!({
            "secrets": secrets,
            "secretsMountPoint": self.mount_point(),
            "symlinkPath": self.symlink(),
            "keepGenerations": 0,
            "userMode": true,
            "logging": { "keyImport": false, "secretChanges": false }
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(value).unwrap()
    }
}

fn options() -> InstallOptions {
    InstallOptions {
        check_mode: CheckMode::Off,
        ..Default::default()
    }
}

fn published(outcome: Outcome) -> (PathBuf, Option<sops_install::changes::ChangeSet>) {
    match outcome {
        Outcome::Published { generation, changes } => (generation, changes),
        other => panic!("expected a published generation, got {:?}", other),
    }
}

#[test]
fn test_install_twice_is_idempotent() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let link_path = host.path("etc/app/password");
    let manifest = host.manifest(
        json!([{
            "name": "app-password",
            "key": "password",
            "path": link_path,
            "sopsFile": source,
            "format": "yaml",
            "mode": "0400",
            "restartUnits": ["app.service"]
        }]),
        json!({}),
    );
    let decryptor = FixtureDecryptor::default().with(&source, b"password: hunter2\n");
    let opts = options();
    let installer = Installer::new(&opts, &decryptor, &NoKeys);

    let (first, changes) = published(installer.install(manifest.clone()).unwrap());
    assert_eq!(first, host.mount_point().join("1"));
    assert!(changes.is_none());

    let secret = first.join("app-password");
    assert_eq!(fs::read_to_string(&secret).unwrap(), "hunter2");
    assert_eq!(fs::metadata(&secret).unwrap().permissions().mode() & 0o7777, 0o400);
    assert_eq!(fs::read_link(host.symlink()).unwrap(), first);
    assert_eq!(
        fs::read_link(&link_path).unwrap(),
        host.symlink().join("app-password")
    );
    assert_eq!(fs::read_to_string(&link_path).unwrap(), "hunter2");

    let (second, changes) = published(installer.install(manifest).unwrap());
    assert_eq!(second, host.mount_point().join("2"));
    assert_eq!(fs::read_link(host.symlink()).unwrap(), second);
    assert_eq!(
        fs::read(second.join("app-password")).unwrap(),
        fs::read(first.join("app-password")).unwrap()
    );

    let changes = changes.unwrap();
    assert!(changes.added.is_empty());
    assert!(changes.modified.is_empty());
    assert!(changes.restart.is_empty());

    // one decryption per run
    assert_eq!(decryptor.calls.get(), 2);
}

#[test]
fn test_binary_secret_is_copied_verbatim() {
    let host = Host::new();
    let source = host.path("etc/blob.bin");
    fs::create_dir_all(source.parent().unwrap()).unwrap();
    // sops stores binary files as a JSON envelope
    fs::write(&source, r#"{"data": "ENC[AES256_GCM,data:AAAA,type:str]", "sops": {}}"#).unwrap();

    let blob: Vec<u8> = (0..=255u8).rev().collect();
    let manifest = host.manifest(
        json!([{
            "name": "blob",
            "key": "does/not/matter",
            "sopsFile": source,
            "format": "binary",
            "mode": "0440"
        }]),
        json!({}),
    );
    let decryptor = FixtureDecryptor::default().with(&source, &blob);
    let opts = options();

    let (generation, _) = published(
        Installer::new(&opts, &decryptor, &NoKeys)
            .install(manifest)
            .unwrap(),
    );
    assert_eq!(fs::read(generation.join("blob")).unwrap(), blob);
}

#[test]
fn test_nested_names_and_shared_source() {
    let host = Host::new();
    let source = host.sops_yaml("etc/db.yaml", &["user", "password"]);
    let manifest = host.manifest(
        json!([
            { "name": "db/user", "key": "user", "sopsFile": source, "mode": "0444" },
            { "name": "db/password", "key": "password", "sopsFile": source, "mode": "0400" }
        ]),
        json!({}),
    );
    let decryptor = FixtureDecryptor::default().with(&source, b"user: admin\npassword: s3cret\n");
    let opts = options();

    let (generation, _) = published(
        Installer::new(&opts, &decryptor, &NoKeys)
            .install(manifest)
            .unwrap(),
    );
    assert_eq!(fs::read_to_string(generation.join("db/user")).unwrap(), "admin");
    assert_eq!(fs::read_to_string(host.symlink().join("db/password")).unwrap(), "s3cret");
    assert_eq!(decryptor.calls.get(), 1);
}

#[test]
fn test_template_is_rendered_and_linked() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let conf_link = host.path("etc/app/app.conf");
    let manifest = host.manifest(
        json!([{ "name": "pw", "key": "password", "sopsFile": source, "mode": "0400" }]),
        json!({
            "templates": [{
                "name": "app.conf",
                "content": "[db]\npassword = <SOPS:pw:PLACEHOLDER>\n",
                "path": conf_link,
                "mode": "0440"
            }],
            "placeholderBySecretName": { "pw": "<SOPS:pw:PLACEHOLDER>" }
        }),
    );
    let decryptor = FixtureDecryptor::default().with(&source, b"password: hunter2\n");
    let opts = options();

    let (generation, _) = published(
        Installer::new(&opts, &decryptor, &NoKeys)
            .install(manifest)
            .unwrap(),
    );
    let rendered = generation.join("rendered/app.conf");
    assert_eq!(
        fs::read_to_string(&rendered).unwrap(),
        "[db]\npassword = hunter2\n"
    );
    assert_eq!(fs::metadata(&rendered).unwrap().permissions().mode() & 0o7777, 0o440);
    assert_eq!(
        fs::read_link(&conf_link).unwrap(),
        host.symlink().join("rendered/app.conf")
    );
}

#[test]
fn test_dry_run_leaves_public_symlink() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let manifest = host.manifest(
        json!([{ "name": "pw", "key": "password", "sopsFile": source, "mode": "0400" }]),
        json!({}),
    );

    let opts = options();
    let v1 = FixtureDecryptor::default().with(&source, b"password: one\n");
    let (first, _) = published(Installer::new(&opts, &v1, &NoKeys).install(manifest.clone()).unwrap());

    let dry = InstallOptions {
        activation: Activation::Dry,
        ..options()
    };
    let v2 = FixtureDecryptor::default().with(&source, b"password: two\n");
    match Installer::new(&dry, &v2, &NoKeys).install(manifest).unwrap() {
        Outcome::DryRun { generation, changes } => {
            assert_eq!(generation, host.mount_point().join("2"));
            let changes = changes.unwrap();
            assert!(changes.modified.contains("pw"));
        }
        other => panic!("expected a dry run, got {:?}", other),
    }

    assert_eq!(fs::read_link(host.symlink()).unwrap(), first);
    assert_eq!(fs::read_to_string(host.symlink().join("pw")).unwrap(), "one");
}

#[test]
fn test_retention_prunes_old_generations() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let manifest = host.manifest(
        json!([{ "name": "pw", "key": "password", "sopsFile": source, "mode": "0400" }]),
        json!({ "keepGenerations": 1 }),
    );
    let decryptor = FixtureDecryptor::default().with(&source, b"password: x\n");
    let opts = options();
    let installer = Installer::new(&opts, &decryptor, &NoKeys);

    for _ in 0..3 {
        installer.install(manifest.clone()).unwrap();
    }

    let mount = host.mount_point();
    assert!(!mount.join("1").exists());
    assert!(!mount.join("2").exists());
    assert!(mount.join("3").is_dir());
    assert_eq!(fs::read_link(host.symlink()).unwrap(), mount.join("3"));
}

#[test]
fn test_failed_decryption_keeps_previous_generation() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let manifest = host.manifest(
        json!([{ "name": "pw", "key": "password", "sopsFile": source, "mode": "0400" }]),
        json!({}),
    );
    let opts = options();
    let good = FixtureDecryptor::default().with(&source, b"password: x\n");
    let (first, _) = published(Installer::new(&opts, &good, &NoKeys).install(manifest.clone()).unwrap());

    let broken = FixtureDecryptor::default();
    let err = Installer::new(&opts, &broken, &NoKeys)
        .install(manifest)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decryption);
    assert_eq!(fs::read_link(host.symlink()).unwrap(), first);
}

#[test]
fn test_missing_key_fails_before_mounting() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let manifest = host.manifest(
        json!([{ "name": "pw", "key": "nope", "sopsFile": source, "mode": "0400" }]),
        json!({}),
    );
    let opts = options();
    let decryptor = FixtureDecryptor::default().with(&source, b"password: x\n");

    let err = Installer::new(&opts, &decryptor, &NoKeys)
        .install(manifest)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err
        .to_string()
        .starts_with("Manifest is not valid: secret pw in"));
    assert!(!host.mount_point().exists());
    assert_eq!(decryptor.calls.get(), 0);
}

#[test]
fn test_escaping_names_write_nothing_outside() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let outside = host.path("outside/leaked");
    let decryptor = FixtureDecryptor::default().with(&source, b"password: hunter2\n");
    let opts = options();

    for name in [outside.to_string_lossy().into_owned(), "../../outside/leaked".to_string()] {
        let manifest = host.manifest(
            json!([{ "name": name, "key": "password", "sopsFile": source, "mode": "0400" }]),
            json!({}),
        );
        let err = Installer::new(&opts, &decryptor, &NoKeys)
            .install(manifest)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config, "{name}");
        assert!(err.to_string().contains("Invalid name"), "{name}");
    }

    assert!(!host.path("outside").exists());
    assert!(!host.mount_point().exists());
    assert_eq!(decryptor.calls.get(), 0);
}

#[test]
fn test_check_mode_touches_nothing() {
    let host = Host::new();
    let manifest = host.manifest(
        json!([{ "name": "pw", "key": "password", "sopsFile": "/nonexistent/s.yaml", "mode": "0400" }]),
        json!({}),
    );
    let opts = InstallOptions {
        check_mode: CheckMode::Manifest,
        ..Default::default()
    };
    let decryptor = FixtureDecryptor::default();

    let outcome = Installer::new(&opts, &decryptor, &NoKeys)
        .install(manifest)
        .unwrap();
    assert!(matches!(outcome, Outcome::Validated));
    assert!(!host.mount_point().exists());
    assert_eq!(decryptor.calls.get(), 0);
}

#[test]
fn test_runtime_dir_placeholder() {
    let host = Host::new();
    let source = host.sops_yaml("etc/secrets.yaml", &["password"]);
    let mut manifest = host.manifest(
        json!([{ "name": "pw", "key": "password", "sopsFile": source, "mode": "0400", "path": "%r/app/pw" }]),
        json!({}),
    );
    manifest.secrets_mount_point = PathBuf::from("%r/secrets.d");
    manifest.symlink_path = PathBuf::from("%r/secrets");

    let runtime = host.path("user-runtime");
    let opts = InstallOptions {
        runtime_dir: Some(runtime.clone()),
        ..options()
    };
    let decryptor = FixtureDecryptor::default().with(&source, b"password: x\n");

    let (generation, _) = published(
        Installer::new(&opts, &decryptor, &NoKeys)
            .install(manifest)
            .unwrap(),
    );
    assert_eq!(generation, runtime.join("secrets.d/1"));
    assert_eq!(
        fs::read_link(runtime.join("app/pw")).unwrap(),
        runtime.join("secrets/pw")
    );
}
