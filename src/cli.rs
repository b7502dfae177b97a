use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Parser, Debug)]
#[command(version, about = "Multi-format JavaScript/TypeScript package builder", long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct FolderArg {
    /// The project folder containing `jspack.json`
    #[arg(default_value = ".")]
    pub folder: String,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub folder: FolderArg,

    /// Deprecated, use `jspack watch` instead
    #[arg(short, long, default_value_t = false)]
    pub watch: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub folder: FolderArg,
}

impl From<BuildArgs> for WatchArgs {
    fn from(build_args: BuildArgs) -> Self {
        WatchArgs {
            folder: build_args.folder,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the project once and exit
    Build(BuildArgs),

    /// Build the project and rebuild whenever a source file changes
    Watch(WatchArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_defaults_to_the_current_folder() {
        let cli = Cli::try_parse_from(["jspack", "build"]).unwrap();
        match cli.command {
            Command::Build(args) => assert_eq!(args.folder.folder, "."),
            other => panic!("expected build command, got {other:?}"),
        }
    }

    #[test]
    fn watch_accepts_a_folder_argument() {
        let cli = Cli::try_parse_from(["jspack", "watch", "pkg"]).unwrap();
        match cli.command {
            Command::Watch(args) => assert_eq!(args.folder.folder, "pkg"),
            other => panic!("expected watch command, got {other:?}"),
        }
    }
}
