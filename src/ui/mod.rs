//! The command-line surface: thin `clap` subcommands that wire user input
//! into the library's `Repository`/`Archiver` facade. Password prompting
//! and rich terminal rendering are out of scope here (external
//! collaborators per the library's own design); these commands read the
//! repository password from `CRATEPAK_PASSWORD` and print plain lines.

use camino::Utf8Path;
use clap::Parser;

use crate::settings::Settings;

mod backup;
mod cat;
mod init;

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Create a new, empty repository
    Init,
    /// Back up one or more paths into a new snapshot
    Backup(backup::Args),
    /// Print a stored object as JSON
    Cat(cat::Args),
}

pub fn run(repository: &Utf8Path, settings: &Settings, subcommand: Subcommand) -> anyhow::Result<()> {
    match subcommand {
        Subcommand::Init => init::run(repository, settings),
        Subcommand::Backup(args) => backup::run(repository, settings, args),
        Subcommand::Cat(args) => cat::run(repository, args),
    }
}

fn password() -> anyhow::Result<String> {
    std::env::var("CRATEPAK_PASSWORD")
        .map_err(|_| anyhow::anyhow!("Set CRATEPAK_PASSWORD to the repository's password"))
}
