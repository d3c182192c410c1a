#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

mod cli;
mod config;
mod db;
mod rbac;
mod security;
mod service;
mod utils;
mod validation;
mod web;

use cli::{Cli, Commands, InitArgs};
use config::Config;
use db::{DatabaseCreation, DatabaseManager};
use service::{CreateUser, RoleService, SuperuserOutcome, UserService};
use web::{AppState, WebServer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Arc::new(
        Config::load_from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?,
    );
    utils::logging::init_tracing(&config.logging);

    let result = match cli.command_or_default() {
        Commands::Serve => serve(config).await,
        Commands::Init(args) => init(config, args).await,
        Commands::CreateDatabase { recreate } => create_database(&config, recreate).await,
    };
    if let Err(ref e) = result {
        error!("{e:#}");
    }
    result
}

async fn open_database(config: &Config) -> Result<DatabaseManager> {
    let db_manager = DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;
    Ok(db_manager)
}

async fn serve(config: Arc<Config>) -> Result<()> {
    info!(app = %config.app.name, "ShiftWise starting up");

    let db_manager = open_database(&config).await?;
    info!(backend = ?db_manager.db_type(), "database ready");

    let roles = RoleService::new(db_manager.role_store())
        .create_system_roles()
        .await?;
    info!(count = roles.len(), "system roles ensured");

    let state = Arc::new(AppState::new(config.clone(), &db_manager)?);
    WebServer::new(state).start().await?;

    info!(app = %config.app.name, "ShiftWise shutting down");
    Ok(())
}

async fn init(config: Arc<Config>, args: InitArgs) -> Result<()> {
    let db_manager = open_database(&config).await?;
    info!("database schema created");

    let roles = RoleService::new(db_manager.role_store())
        .create_system_roles()
        .await?;
    for role in &roles {
        info!(id = role.id, name = %role.name, "system role ready");
    }

    let users = UserService::new(
        db_manager.user_store(),
        db_manager.role_store(),
        config.security.bcrypt_cost,
    );
    let input = CreateUser {
        email: validation::email(&args.email)?,
        username: validation::username(&args.username)?,
        first_name: Some(args.first_name),
        last_name: Some(args.last_name),
        password: args.password,
        tenant_id: validation::tenant_id(&args.tenant)?,
        is_active: true,
        role_ids: Vec::new(),
    };

    match users.ensure_superuser(input).await? {
        SuperuserOutcome::Created(user) => {
            info!(email = %user.email, tenant = %user.tenant_id, "superuser created");
            warn!("change the superuser password after the first login");
        }
        SuperuserOutcome::Existing(user) => {
            info!(email = %user.email, "superuser already present, nothing created");
        }
    }
    Ok(())
}

async fn create_database(config: &Config, recreate: bool) -> Result<()> {
    match DatabaseManager::create_database(&config.database, recreate).await? {
        DatabaseCreation::Created => info!("database created"),
        DatabaseCreation::Recreated => info!("database dropped and recreated"),
        DatabaseCreation::AlreadyExists => {
            info!("database already exists; pass --recreate to drop it")
        }
    }
    Ok(())
}
