//! Command-line caller for the identity resolver.
//!
//! # Responsibility
//! - Parse one observation, call the core resolver, print the JSON view.
//! - Map resolver errors to exit codes without leaking store details.

use clap::{Args, Parser, Subcommand};
use contactlink_core::db::open_db;
use contactlink_core::{
    core_version, default_log_level, init_logging, ClusterLocks, ConsolidatedView, ContactId,
    IdentifyRequest, IdentityService, ResolveError, ResolverConfig, SqliteContactRepository,
};
use log::error;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const DEFAULT_DB_FILE_NAME: &str = "contactlink.sqlite3";

#[derive(Debug, Parser)]
#[command(name = "contactlink", version, about = "Resolve contact identities")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// SQLite database file. Defaults to a file in the system temp directory.
    #[arg(long, global = true, env = "CONTACTLINK_DB_PATH")]
    db: Option<PathBuf>,

    /// trace|debug|info|warn|error
    #[arg(long, global = true, env = "CONTACTLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Absolute directory for rolling log files. Logging is off when unset.
    #[arg(long, global = true, env = "CONTACTLINK_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve an email and/or phone number into its contact cluster.
    Identify {
        #[arg(long)]
        email: Option<String>,
        #[arg(long = "phone", alias = "phone-number")]
        phone_number: Option<String>,
    },
    /// Show the cluster containing a contact id.
    Show { contact_id: ContactId },
    /// Soft-delete a contact, promoting a successor when it is a primary.
    Remove { contact_id: ContactId },
    /// Print core crate health and version.
    Ping,
}

#[derive(Debug, Serialize)]
struct IdentifyResponse<'a> {
    contact: &'a ConsolidatedView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoveResponse {
    removed_contact_id: ContactId,
    promoted_contact_id: Option<ContactId>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(message) = start_logging(&cli.global) {
        eprintln!("{message}");
        return ExitCode::from(2);
    }

    match run(&cli) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(CliError::Usage(message)) => {
            eprintln!("{message}");
            ExitCode::from(2)
        }
        Err(CliError::Failed(message)) => {
            error!("event=cli_command module=cli status=error error={}", message);
            eprintln!("internal error");
            ExitCode::FAILURE
        }
    }
}

enum CliError {
    /// Caller mistake; safe to echo.
    Usage(String),
    /// Store or resolver failure; logged, shown opaquely.
    Failed(String),
}

impl From<ResolveError> for CliError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::InvalidInput | ResolveError::ContactNotFound(_) => {
                Self::Usage(value.to_string())
            }
            other => Self::Failed(other.to_string()),
        }
    }
}

fn run(cli: &Cli) -> Result<String, CliError> {
    let view = match &cli.command {
        Command::Remove { contact_id } => {
            let promoted = with_service(&cli.global, |service| {
                service.remove_contact(*contact_id)
            })?;
            return encode(&RemoveResponse {
                removed_contact_id: *contact_id,
                promoted_contact_id: promoted,
            });
        }
        Command::Ping => {
            return Ok(format!(
                "contactlink_core ping={} version={}",
                contactlink_core::ping(),
                core_version()
            ));
        }
        Command::Identify {
            email,
            phone_number,
        } => with_service(&cli.global, |service| {
            service.resolve(&IdentifyRequest {
                email: email.clone(),
                phone_number: phone_number.clone(),
            })
        })?,
        Command::Show { contact_id } => {
            with_service(&cli.global, |service| service.consolidated_view(*contact_id))?
        }
    };

    encode(&IdentifyResponse { contact: &view })
}

fn encode(response: &impl Serialize) -> Result<String, CliError> {
    serde_json::to_string_pretty(response)
        .map_err(|err| CliError::Failed(format!("failed to encode response: {err}")))
}

fn with_service<T>(
    global: &GlobalArgs,
    f: impl FnOnce(&IdentityService<SqliteContactRepository<'_>>) -> Result<T, ResolveError>,
) -> Result<T, CliError> {
    let config = ResolverConfig::from_env().map_err(|err| CliError::Usage(err.to_string()))?;
    let db_path = global
        .db
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DB_FILE_NAME));
    let conn =
        open_db(&db_path).map_err(|err| CliError::Failed(format!("db open failed: {err}")))?;
    let repo = SqliteContactRepository::try_new(&conn)
        .map_err(|err| CliError::Failed(format!("repo init failed: {err}")))?;
    let service = IdentityService::with_locks(repo, Arc::new(ClusterLocks::new()), config);
    f(&service).map_err(CliError::from)
}

fn start_logging(global: &GlobalArgs) -> Result<(), String> {
    let Some(log_dir) = &global.log_dir else {
        return Ok(());
    };
    let level = global.log_level.as_deref().unwrap_or(default_log_level());
    let log_dir = log_dir
        .to_str()
        .ok_or_else(|| format!("log dir is not valid UTF-8: {}", log_dir.display()))?;
    init_logging(level, log_dir).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command};
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn identify_accepts_partial_input() {
        let cli = Cli::parse_from(["contactlink", "identify", "--phone", "123456"]);
        match cli.command {
            Command::Identify {
                email,
                phone_number,
            } => {
                assert_eq!(email, None);
                assert_eq!(phone_number.as_deref(), Some("123456"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn remove_takes_contact_id() {
        let cli = Cli::parse_from(["contactlink", "remove", "42"]);
        assert!(matches!(cli.command, Command::Remove { contact_id: 42 }));
    }
}
