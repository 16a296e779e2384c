use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use nctl_meta::MetaError;
use nctl_store::StoreError;
use tracing::Level;

mod cli;
mod commands;
mod config;

/// Exit status for failures that indicate a bug rather than bad input
/// (`EX_SOFTWARE`).
const EXIT_INTERNAL: u8 = 70;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    init_tracing(cli.debug);

    match commands::run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let lock_not_held = err.chain().any(|cause| {
        matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::LockNotHeld { .. }))
            || matches!(
                cause.downcast_ref::<MetaError>(),
                Some(MetaError::Store(StoreError::LockNotHeld { .. }))
            )
    });
    if lock_not_held {
        EXIT_INTERNAL
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn lock_not_held_is_internal() {
        let err = anyhow::Error::from(MetaError::Store(StoreError::LockNotHeld {
            path: "/x".into(),
        }))
        .context("claiming name");
        assert_eq!(exit_code(&err), EXIT_INTERNAL);
    }

    #[test]
    fn user_errors_exit_one() {
        let err = Err::<(), _>(MetaError::NameTaken {
            name: "web".into(),
            id: "abc".into(),
        })
        .context("claiming name")
        .unwrap_err();
        assert_eq!(exit_code(&err), 1);
    }
}
