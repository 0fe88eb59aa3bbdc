use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use sops_install::config::CheckMode;

/// Long options that activation scripts pass with a single dash.
const LONG_FLAGS: &[&str] = &["check-mode", "ignore-passwd", "sops", "ssh-to-pgp", "ssh-to-age", "help", "version"];

#[derive(Parser, Debug)]
#[command(
    name = "sops-install-secrets",
    version,
    about = "Decrypt sops secrets into a new generation and atomically publish it",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Path to the JSON manifest
    pub manifest: PathBuf,

    /// Validate configuration without installing it
    #[arg(long, value_enum, default_value_t = CheckMode::Off)]
    pub check_mode: CheckMode,

    /// Don't look up anything in /etc/passwd. Causes everything to be owned
    /// by root:root or the user executing the tool in user mode
    #[arg(long)]
    pub ignore_passwd: bool,

    /// sops binary used for decryption
    #[arg(long, env = "SOPS_INSTALL_SECRETS_SOPS", default_value = "sops")]
    pub sops: PathBuf,

    /// ssh-to-pgp binary used to import sshKeyPaths
    #[arg(long, env = "SOPS_INSTALL_SECRETS_SSH_TO_PGP", default_value = "ssh-to-pgp")]
    pub ssh_to_pgp: PathBuf,

    /// ssh-to-age binary used to import ageSshKeyPaths
    #[arg(long, env = "SOPS_INSTALL_SECRETS_SSH_TO_AGE", default_value = "ssh-to-age")]
    pub ssh_to_age: PathBuf,
}

/// Rewrite Go-style `-check-mode=...` spellings to `--check-mode=...`.
/// Nothing after a bare `--` is touched.
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().enumerate() {
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        out.push(match arg.to_str() {
            Some(s) if is_single_dash_long(s) => OsString::from(format!("-{}", s)),
            _ => arg,
        });
    }
    out
}

fn is_single_dash_long(arg: &str) -> bool {
    let Some(rest) = arg.strip_prefix('-') else {
        return false;
    };
    if rest.starts_with('-') {
        return false;
    }
    let name = rest.split('=').next().unwrap_or_default();
    LONG_FLAGS.contains(&name)
}
