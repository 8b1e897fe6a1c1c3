//! Homeguard command-line client.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use auth_engine::{AuthClient, HttpBackend, ReqwestBackend};
use clap::{Parser, Subcommand};
use homeguard_core::{init_logging, Config, Paths};

#[derive(Parser)]
#[command(name = "homeguard")]
#[command(about = "Sign in to the home security platform and follow live events")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the config value
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config and logs. Defaults to ~/.homeguard
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password, completing MFA if required
    Login {
        #[arg(long)]
        email: String,
    },
    /// Stream realtime events as JSON lines until Ctrl-C
    Watch {
        #[arg(long, env = "HOMEGUARD_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,

        /// Only print these event types (repeatable). Prints everything if omitted
        #[arg(long = "type")]
        types: Vec<String>,
    },
    /// Call an API endpoint and print the JSON response
    Get {
        #[arg(long, env = "HOMEGUARD_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: String,

        /// Path relative to the API base URL, e.g. users/1234/subscriptions
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level));

    let backend: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new(&config.transport)?);
    let auth = Arc::new(AuthClient::new(backend.clone(), config.auth.clone()));

    match cli.command {
        Commands::Login { email } => {
            commands::login(&auth, &email, config.auth.mfa_poll_interval()).await
        }
        Commands::Watch {
            refresh_token,
            types,
        } => commands::watch(&config, auth, &refresh_token, types).await,
        Commands::Get {
            refresh_token,
            path,
        } => commands::get(auth, backend, &refresh_token, &path).await,
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
    fn test_watch_collects_repeated_types() {
        let cli = Cli::try_parse_from([
            "homeguard",
            "watch",
            "--refresh-token",
            "rt",
            "--type",
            "sensor.opened",
            "--type",
            "lock.unlocked",
        ])
        .unwrap();
        match cli.command {
            Commands::Watch {
                refresh_token,
                types,
            } => {
                assert_eq!(refresh_token, "rt");
                assert_eq!(types, vec!["sensor.opened", "lock.unlocked"]);
            }
            _ => panic!("expected watch"),
        }
    }
}
