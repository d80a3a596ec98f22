//! Configuration and CLI surface.

use anyhow::{bail, Context, Result};
use clap::Parser;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

macro_rules! prefix {
    () => {
        "DIRSYNC_"
    };
}

/// Which side of the protocol this invocation plays.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// Walks and watches `source`, streaming it to `host:port`.
    Sender {
        /// Receiver hostname or address.
        host: String,
        /// Local directory to mirror.
        source: PathBuf,
    },
    /// Listens on `port` and applies requests to `target`.
    Receiver {
        /// Local directory requests are applied to.
        target: PathBuf,
    },
}

#[derive(CopyGetters, Debug, Getters, Parser)]
#[command(
    author,
    version,
    about = "One-way directory synchronizer",
    after_help = "Run with --client HOST SOURCE, or --server TARGET."
)]
/// Parsed command-line configuration, before role validation.
pub struct Config {
    /// Act as the sender.
    #[get_copy = "pub"]
    #[arg(short = 'C', long)]
    client: bool,

    /// Act as the receiver.
    #[get_copy = "pub"]
    #[arg(short = 'S', long)]
    server: bool,

    /// TCP port to connect to (client) or listen on (server).
    #[get_copy = "pub"]
    #[arg(
        short = 'p',
        long,
        env = concat!(prefix!(), "PORT"),
        default_value_t = 9090
    )]
    port: u16,

    /// Run the initial sync once and exit (client only); implies `--foreground`.
    #[get_copy = "pub"]
    #[arg(short = 'o', long = "one-shot")]
    one_shot: bool,

    /// Accept a non-empty target directory (server only).
    #[get_copy = "pub"]
    #[arg(short = 'f', long)]
    force: bool,

    /// Increase log verbosity to debug.
    #[get_copy = "pub"]
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Do not detach; stay attached to the controlling terminal.
    #[get_copy = "pub"]
    #[arg(short = 'n', long)]
    foreground: bool,

    /// Increase log verbosity to trace.
    #[get_copy = "pub"]
    #[arg(short = 'd', long)]
    debug: bool,

    /// Suppress all but error-level logging.
    #[get_copy = "pub"]
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Send all-zero write blocks as sparse holes instead of literal bytes.
    #[get_copy = "pub"]
    #[arg(short = 's', long)]
    sparse: bool,

    /// Positional arguments: `HOST SOURCE` for a client, `TARGET` for a server.
    #[get = "pub"]
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

impl Config {
    /// Validate flag combinations and build the concrete [`Role`] this invocation plays.
    pub fn validate(&self) -> Result<Role> {
        if self.client() == self.server() {
            bail!("exactly one of --client or --server must be given");
        }
        if self.one_shot() && !self.client() {
            bail!("--one-shot is only valid with --client");
        }
        if self.force() && !self.server() {
            bail!("--force is only valid with --server");
        }

        if self.client() {
            let [host, source]: [String; 2] = self
                .args()
                .clone()
                .try_into()
                .map_err(|_| anyhow::anyhow!("--client requires HOST and SOURCE arguments"))?;
            let source = PathBuf::from(source);
            if !source.is_dir() {
                bail!("source '{}' is not a directory", source.display());
            }
            Ok(Role::Sender { host, source })
        } else {
            let [target]: [String; 1] = self
                .args()
                .clone()
                .try_into()
                .map_err(|_| anyhow::anyhow!("--server requires a single TARGET argument"))?;
            let target = PathBuf::from(target);
            if !target.exists() {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("create target '{}'", target.display()))?;
            }
            if !self.force() && target.read_dir()?.next().is_some() {
                bail!(
                    "target '{}' is not empty; pass --force to accept it anyway",
                    target.display()
                );
            }
            Ok(Role::Receiver { target })
        }
    }

    /// The effective log level, derived from `--verbose`/`--debug`/`--quiet`.
    pub fn log_level(&self) -> LevelFilter {
        if self.debug() {
            LevelFilter::TRACE
        } else if self.verbose() {
            LevelFilter::DEBUG
        } else if self.quiet() {
            LevelFilter::ERROR
        } else {
            LevelFilter::INFO
        }
    }

    /// Path to the lock file guarding a receiver's target directory.
    pub fn lock_path(target: &std::path::Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = target.parent().unwrap_or_else(|| std::path::Path::new("."));
        dir.join(format!(".{name}.dropbox.lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut full = vec!["dirsyncd"];
        full.extend_from_slice(args);
        Config::try_parse_from(full).expect("parse")
    }

    #[test]
    fn rejects_both_roles() {
        let cfg = parse(&["--client", "--server", "x"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_no_role() {
        let cfg = parse(&["host", "src"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn one_shot_requires_client() {
        let cfg = parse(&["--server", "--one-shot", "/tmp"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn force_requires_server() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = parse(&[
            "--client",
            "--force",
            "host",
            dir.path().to_str().unwrap(),
        ]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_role_resolves_host_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = parse(&["--client", "host", dir.path().to_str().unwrap()]);
        let role = cfg.validate().unwrap();
        assert_eq!(
            role,
            Role::Sender {
                host: "host".into(),
                source: dir.path().to_path_buf(),
            }
        );
    }

    #[test]
    fn server_role_rejects_nonempty_target_without_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let cfg = parse(&["--server", dir.path().to_str().unwrap()]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_role_accepts_nonempty_target_with_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let cfg = parse(&["--server", "--force", dir.path().to_str().unwrap()]);
        assert!(cfg.validate().is_ok());
    }
}
