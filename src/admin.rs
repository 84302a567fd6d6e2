//! Administrative commands
//!
//! An explicit name → handler table over the manager. Each command takes
//! whitespace-separated arguments and answers with JSON.

use crate::config::{load_config, ColumnConfig, TableConfig};
use crate::error::{ConfigError, ManagerError};
use crate::manager::PersistenceManager;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unknown command '{0}', try 'help'")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot encode response: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AdminFuture<'a> = Pin<Box<dyn Future<Output = Result<String, AdminError>> + Send + 'a>>;

/// What a handler may touch besides its arguments
pub struct AdminContext<'a> {
    pub manager: &'a PersistenceManager,
    pub config_path: &'a Path,
    /// Usage line of every registered command
    pub usage: Vec<&'static str>,
}

/// Handler signature: context and the arguments after the command name
pub type Handler = for<'a> fn(AdminContext<'a>, Vec<String>) -> AdminFuture<'a>;

struct Command {
    handler: Handler,
    usage: &'static str,
}

/// Command table
pub struct AdminRegistry {
    commands: BTreeMap<&'static str, Command>,
    config_path: PathBuf,
}

impl AdminRegistry {
    /// Registry with the built-in commands; `reload` defaults to `config_path`
    pub fn new(config_path: PathBuf) -> Self {
        let mut registry = AdminRegistry {
            commands: BTreeMap::new(),
            config_path,
        };
        registry.register("help", "help", help);
        registry.register("status", "status [backend]", status);
        registry.register("flush", "flush <backend>", flush);
        registry.register("flush-all", "flush-all [wait_secs]", flush_all);
        registry.register("query", "query <backend> <sql>", query);
        registry.register("reset", "reset <backend>", reset);
        registry.register("remove", "remove <backend>", remove);
        registry.register("tables", "tables <backend>", tables);
        registry.register("addtable", ADD_TABLE_USAGE, add_table);
        registry.register("rollover", "rollover <backend>", rollover);
        registry.register("reload", "reload [config_path]", reload);
        registry
    }

    pub fn register(&mut self, name: &'static str, usage: &'static str, handler: Handler) {
        self.commands.insert(name, Command { handler, usage });
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        self.commands.keys().copied().collect()
    }

    /// Run one command line
    pub async fn dispatch(&self, manager: &PersistenceManager, line: &str) -> Result<String, AdminError> {
        let mut words = line.split_whitespace().map(str::to_string);
        let Some(name) = words.next() else {
            return Ok(String::new());
        };
        let command = self
            .commands
            .get(name.as_str())
            .ok_or(AdminError::UnknownCommand(name))?;
        let ctx = AdminContext {
            manager,
            config_path: &self.config_path,
            usage: self.commands.values().map(|c| c.usage).collect(),
        };
        (command.handler)(ctx, words.collect()).await
    }
}

const ADD_TABLE_USAGE: &str = "addtable <backend> <table> <column>:<type>...";

fn backend_arg(args: &[String], usage: &'static str) -> Result<String, AdminError> {
    args.first().cloned().ok_or(AdminError::Usage(usage))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, AdminError> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[derive(Serialize)]
struct Ack<'a> {
    backend: &'a str,
    done: bool,
}

fn status(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        match args.first() {
            Some(id) => to_json(&manager.backend_status(id)?),
            None => to_json(&manager.status()),
        }
    })
}

fn flush(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        let id = backend_arg(&args, "flush <backend>")?;
        manager.flush(&id)?;
        to_json(&Ack { backend: &id, done: true })
    })
}

fn flush_all(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        let wait = match args.first() {
            Some(secs) => secs
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64)
                .ok_or(AdminError::Usage("flush-all [wait_secs]"))?,
            None => Duration::from_secs(10),
        };
        let failed: BTreeMap<String, String> = manager
            .flush_all(wait)
            .await
            .into_iter()
            .map(|(id, e)| (id, e.to_string()))
            .collect();
        to_json(&failed)
    })
}

fn query(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        if args.len() < 2 {
            return Err(AdminError::Usage("query <backend> <sql>"));
        }
        let sql = args[1..].join(" ");
        to_json(&manager.run_query(&args[0], &sql).await?)
    })
}

fn reset(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        let id = backend_arg(&args, "reset <backend>")?;
        let done = manager.reset_access(&id)?;
        to_json(&Ack { backend: &id, done })
    })
}

fn remove(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        let id = backend_arg(&args, "remove <backend>")?;
        manager.remove_backend(&id).await?;
        to_json(&Ack { backend: &id, done: true })
    })
}

fn tables(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        let id = backend_arg(&args, "tables <backend>")?;
        to_json(&manager.tables(&id)?)
    })
}

fn rollover(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let manager = ctx.manager;
        let id = backend_arg(&args, "rollover <backend>")?;
        let path = manager.roll_over(&id).await?;
        to_json(&path.display().to_string())
    })
}

fn help(ctx: AdminContext<'_>, _args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move { to_json(&ctx.usage) })
}

fn reload(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        let path = args
            .first()
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.config_path.to_path_buf());
        let config = load_config(&path)?;
        to_json(&ctx.manager.reload(config).await?)
    })
}

#[derive(Serialize)]
struct TableAdded<'a> {
    backend: &'a str,
    table: &'a str,
    created: bool,
    added_columns: Vec<String>,
}

/// Create a table at runtime, or append columns to one not yet frozen
fn add_table(ctx: AdminContext<'_>, args: Vec<String>) -> AdminFuture<'_> {
    Box::pin(async move {
        if args.len() < 3 {
            return Err(AdminError::Usage(ADD_TABLE_USAGE));
        }
        let mut config = TableConfig::new(args[1].clone());
        for spec in &args[2..] {
            let (name, column_type) = spec
                .split_once(':')
                .filter(|(name, column_type)| !name.is_empty() && !column_type.is_empty())
                .ok_or(AdminError::Usage(ADD_TABLE_USAGE))?;
            config = config.column(ColumnConfig::new(name, column_type));
        }
        let table = config.build()?;
        let existed = ctx.manager.tables(&args[0])?.contains(&args[1]);
        let added_columns = ctx.manager.add_table(&args[0], table)?;
        to_json(&TableAdded {
            backend: &args[0],
            table: &args[1],
            created: !existed,
            added_columns,
        })
    })
}
