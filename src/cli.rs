use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "shiftwise")]
#[command(version)]
#[command(about = "Identity, roles and tenant access for the ShiftWise platform", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn command_or_default(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP API (default)
    Serve,

    /// Create the schema, the system roles and the first superuser
    Init(InitArgs),

    /// Create the configured PostgreSQL database
    CreateDatabase {
        /// Terminate connections, drop and recreate an existing database
        #[arg(long)]
        recreate: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "admin@shiftwise.local")]
    pub email: String,

    #[arg(long, default_value = "admin")]
    pub username: String,

    #[arg(long, default_value = "Super")]
    pub first_name: String,

    #[arg(long, default_value = "Admin")]
    pub last_name: String,

    #[arg(long, env = "SHIFTWISE_ADMIN_PASSWORD", default_value = "Admin123!")]
    pub password: String,

    #[arg(long, default_value = "system")]
    pub tenant: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["shiftwise"]).expect("parse");
        assert!(matches!(cli.command_or_default(), Commands::Serve));
    }

    #[test]
    fn init_has_defaults() {
        let cli = Cli::try_parse_from(["shiftwise", "--config", "prod.yaml", "init"]).expect("parse");
        assert_eq!(cli.config.to_str(), Some("prod.yaml"));
        match cli.command_or_default() {
            Commands::Init(args) => {
                assert_eq!(args.email, "admin@shiftwise.local");
                assert_eq!(args.tenant, "system");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn create_database_accepts_recreate() {
        let cli = Cli::try_parse_from(["shiftwise", "create-database", "--recreate"]).expect("parse");
        assert!(matches!(
            cli.command_or_default(),
            Commands::CreateDatabase { recreate: true }
        ));
    }
}
