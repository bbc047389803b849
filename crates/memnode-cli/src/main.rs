#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::fn_params_excessive_bools)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;
mod mount;

use clap::Parser;
use commands::install::InstallFlags;
use memnode_core::config::Channel;
use memnode_core::Config;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memnode")]
#[command(author, version, about = "Install npm packages through an in-memory filesystem", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Cache channel (stable, nightly, dev)
    #[arg(long, global = true, value_parser = parse_channel)]
    channel: Option<Channel>,

    /// npm registry URL; wins over .npmrc and MEMNODE_NPM_REGISTRY
    #[arg(long, global = true, value_name = "URL")]
    registry: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Install dependencies from the lockfile or package.json
    Install {
        /// Skip devDependencies
        #[arg(long)]
        production: bool,

        /// Skip optionalDependencies
        #[arg(long)]
        no_optional: bool,

        /// Ignore package-lock.json / bun.lock and resolve from package.json
        #[arg(long)]
        no_lockfile: bool,

        /// Use published packages for workspace members missing build output
        #[arg(long)]
        prefer_published: bool,
    },

    /// Add a dependency to package.json and install
    Add {
        /// Package to add (e.g. "react", "react@^18", "ui@workspace:*")
        package: String,

        /// Save to devDependencies
        #[arg(short = 'D', long)]
        dev: bool,

        /// Use published packages for workspace members missing build output
        #[arg(long)]
        prefer_published: bool,
    },

    /// Resolve the dependency tree without installing
    Resolve {
        /// Packages to resolve (name[@range]); defaults to package.json
        packages: Vec<String>,

        /// Skip devDependencies of package.json
        #[arg(long)]
        production: bool,
    },
}

fn parse_channel(raw: &str) -> Result<Channel, String> {
    match raw {
        "stable" => Ok(Channel::Stable),
        "nightly" => Ok(Channel::Nightly),
        "dev" => Ok(Channel::Dev),
        other => Err(format!("unknown channel '{other}' (expected stable, nightly or dev)")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::new(cwd)
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json)
        .with_registry(cli.registry);
    if let Some(channel) = cli.channel {
        config = config.with_channel(channel);
    }

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(cli.json),
        Some(Commands::Install {
            production,
            no_optional,
            no_lockfile,
            prefer_published,
        }) => {
            let flags = InstallFlags {
                production,
                no_optional,
                no_lockfile,
                prefer_published,
            };
            commands::install::run(&config, &flags, cli.json)
        }
        Some(Commands::Add {
            package,
            dev,
            prefer_published,
        }) => {
            let flags = InstallFlags {
                prefer_published,
                ..InstallFlags::default()
            };
            commands::add::run(&config, &package, dev, &flags, cli.json)
        }
        Some(Commands::Resolve {
            packages,
            production,
        }) => commands::resolve::run(&config, &packages, production, cli.json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(parse_channel("dev"), Ok(Channel::Dev));
        assert!(parse_channel("beta").is_err());
    }
}
