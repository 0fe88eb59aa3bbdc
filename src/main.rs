mod cli;

use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use cli::Cli;
use sops_install::config::{InstallOptions, ToolPaths, PROGRAM_NAME};
use sops_install::decrypt::SopsDecryptor;
use sops_install::error::Result;
use sops_install::install::Installer;
use sops_install::keys::ExternalKeyConverter;
use sops_install::logging;
use sops_install::manifest::Manifest;

fn main() {
    let cli = match Cli::try_parse_from(cli::normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
                _ => 1,
            };
            process::exit(code);
        }
    };

    logging::init();

    if let Err(e) = run(&cli) {
        eprintln!("{}: {}", PROGRAM_NAME, e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let tools = ToolPaths {
        sops: cli.sops.clone(),
        ssh_to_pgp: cli.ssh_to_pgp.clone(),
        ssh_to_age: cli.ssh_to_age.clone(),
    };
    let options = InstallOptions::from_env(cli.check_mode, cli.ignore_passwd);
    let decryptor = SopsDecryptor::new(&tools.sops);
    let converter = ExternalKeyConverter::new(&tools);

    let manifest = Manifest::load(&cli.manifest)?;
    Installer::new(&options, &decryptor, &converter).install(manifest)?;
    Ok(())
}
