use anyhow::Result;
use clap::{Parser, error::ErrorKind};
use log::LevelFilter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{env, io::Write, path::Path};

use jspack::compiler::RewriteToolchain;
use jspack::worker::CacheMode;
use jspack::{build, cli, config, watcher};

fn main() -> Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    let cli = parse_cli(raw_args).unwrap_or_else(|err| err.exit());

    let log_level_filter = cli.verbose.log_level_filter();

    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "{}:\n{}", record.level(), record.args()))
        .filter_level(log_level_filter)
        .target(env_logger::fmt::Target::Stdout)
        .init();

    let mut command = cli.command;

    if let cli::Command::Build(build_args) = &command {
        if build_args.watch {
            log::warn!("`jspack build -w` is deprecated. Please use `jspack watch` instead.");
            command = cli::Command::Watch(build_args.clone().into());
        }
    }

    // The 'normal run' mode shows the pretty formatted progress, but never
    // when the log level was turned down.
    let show_progress = log_level_filter == LevelFilter::Info;

    match command {
        cli::Command::Build(build_args) => {
            let config = read_config(&build_args.folder.folder);
            let ctx = match build::initialize_build(config, CacheMode::Cached) {
                Ok(ctx) => ctx,
                Err(e) => {
                    println!("{e:#}");
                    std::process::exit(1)
                }
            };

            let result = build::build(&ctx, &RewriteToolchain::new(), show_progress);
            ctx.pool.close();

            match result {
                Err(e) => {
                    println!("{e:#}");
                    std::process::exit(1)
                }
                Ok(()) => std::process::exit(0),
            }
        }
        cli::Command::Watch(watch_args) => {
            let config = read_config(&watch_args.folder.folder);
            // The probe caches are unsafe across watch triggers: content can
            // change under an unchanged path.
            let ctx = match build::initialize_build(config, CacheMode::Uncached) {
                Ok(ctx) => ctx,
                Err(e) => {
                    println!("{e:#}");
                    std::process::exit(1)
                }
            };

            let abort = Arc::new(AtomicBool::new(false));
            let abort_on_ctrlc = Arc::clone(&abort);
            ctrlc::set_handler(move || {
                abort_on_ctrlc.store(true, Ordering::SeqCst);
            })
            .expect("Error setting Ctrl-C handler");

            watcher::start(&ctx, &RewriteToolchain::new(), show_progress, abort);
            ctx.pool.close();
            Ok(())
        }
    }
}

fn read_config(folder: &str) -> config::BuildConfig {
    let config_path = Path::new(folder).join(config::CONFIG_FILENAME);
    match config::read_config(&config_path) {
        Ok(config) => config,
        Err(error) => {
            println!("Could not start jspack build: {error:#}");
            std::process::exit(1);
        }
    }
}

fn parse_cli(raw_args: Vec<String>) -> Result<cli::Cli, clap::Error> {
    match cli::Cli::try_parse_from(&raw_args) {
        Ok(cli) => Ok(cli),
        Err(err) => {
            if should_default_to_build(&err, &raw_args) {
                let mut fallback_args = raw_args.clone();
                let insert_at = index_after_global_flags(&fallback_args);
                fallback_args.insert(insert_at, "build".into());

                match cli::Cli::try_parse_from(&fallback_args) {
                    Ok(cli) => Ok(cli),
                    Err(fallback_err) => Err(fallback_err),
                }
            } else {
                Err(err)
            }
        }
    }
}

fn should_default_to_build(err: &clap::Error, args: &[String]) -> bool {
    match err.kind() {
        ErrorKind::MissingSubcommand | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => true,
        ErrorKind::UnknownArgument | ErrorKind::InvalidSubcommand => {
            args.iter().skip(1).any(|arg| !is_global_flag(arg))
        }
        _ => false,
    }
}

fn index_after_global_flags(args: &[String]) -> usize {
    let mut idx = 1;
    while let Some(arg) = args.get(idx) {
        if is_global_flag(arg) {
            idx += 1;
        } else {
            break;
        }
    }
    idx.min(args.len())
}

fn is_global_flag(arg: &str) -> bool {
    matches!(
        arg,
        "-v" | "-vv"
            | "-vvv"
            | "-vvvv"
            | "-q"
            | "-qq"
            | "-qqq"
            | "-qqqq"
            | "--verbose"
            | "--quiet"
            | "-h"
            | "--help"
            | "-V"
            | "--version"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<cli::Cli, clap::Error> {
        parse_cli(args.iter().map(|arg| arg.to_string()).collect())
    }

    #[test]
    fn defaults_to_build_without_args() {
        let cli = parse(&["jspack"]).expect("expected default build command");

        match cli.command {
            cli::Command::Build(build_args) => assert_eq!(build_args.folder.folder, "."),
            other => panic!("expected build command, got {other:?}"),
        }
    }

    #[test]
    fn defaults_to_build_with_folder_shortcut() {
        let cli = parse(&["jspack", "someFolder"]).expect("expected build command");

        match cli.command {
            cli::Command::Build(build_args) => assert_eq!(build_args.folder.folder, "someFolder"),
            other => panic!("expected build command, got {other:?}"),
        }
    }

    #[test]
    fn respects_global_flag_before_subcommand() {
        let cli = parse(&["jspack", "-v", "watch"]).expect("expected watch command");

        assert!(matches!(cli.command, cli::Command::Watch(_)));
    }

    #[test]
    fn help_flag_does_not_default_to_build() {
        let err = parse(&["jspack", "--help"]).expect_err("expected clap help error");
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn version_flag_does_not_default_to_build() {
        let err = parse(&["jspack", "--version"]).expect_err("expected clap version error");
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }
}
