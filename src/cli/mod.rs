mod serve;
mod tenants;

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;

use crate::core::config::HivewatchConfig;
use crate::core::model::AccessLevel;
use crate::core::store::EventStore;
use crate::core::terminal::{self, GuideSection};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Server")
        .command("serve", "Run the ingest, query and live-stream API")
        .print();

    GuideSection::new("Tenants")
        .command("tenant create <name>", "Create a tenant with a default project and key")
        .command("tenant list", "List tenants")
        .print();

    GuideSection::new("API keys")
        .command(
            "key create <tenant_id> [--level full|test|read] [--name N]",
            "Issue a key (shown once)",
        )
        .command("key list <tenant_id>", "List a tenant's keys")
        .command("key revoke <key_id>", "Revoke a key")
        .print();

    GuideSection::new("Maintenance")
        .command("rebuild <tenant_id> <agent_id>", "Rebuild an agent profile from its events")
        .print();

    GuideSection::new("Global flags")
        .command("--config <path>", "Config file (default ./hivewatch.toml)")
        .command("--db <path>", "SQLite database path")
        .command("--host <host> / --port <port>", "Listen address for serve")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("hivewatch").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GlobalFlags {
    pub config: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Serve,
    TenantCreate { name: String },
    TenantList,
    KeyCreate {
        tenant_id: String,
        level: AccessLevel,
        name: String,
    },
    KeyList { tenant_id: String },
    KeyRevoke { key_id: String },
    Rebuild { tenant_id: String, agent_id: String },
    Version,
    Help,
}

/// Splits `--flag value` pairs out of the argument list, leaving positionals.
pub(crate) fn parse_args(args: &[String]) -> Result<(Command, GlobalFlags)> {
    let mut flags = GlobalFlags::default();
    let mut level = AccessLevel::Full;
    let mut key_name: Option<String> = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let takes_value = matches!(
            arg,
            "--config" | "--db" | "--host" | "--port" | "--level" | "--name"
        );
        if !takes_value {
            positional.push(arg);
            i += 1;
            continue;
        }
        let Some(value) = args.get(i + 1) else {
            bail!("{} needs a value", arg);
        };
        match arg {
            "--config" => flags.config = Some(PathBuf::from(value)),
            "--db" => flags.db = Some(PathBuf::from(value)),
            "--host" => flags.host = Some(value.clone()),
            "--port" => match value.parse() {
                Ok(port) => flags.port = Some(port),
                Err(_) => bail!("--port must be a number between 1 and 65535"),
            },
            "--level" => match AccessLevel::parse(value) {
                Some(l) => level = l,
                None => bail!("--level must be one of full, test, read"),
            },
            _ => key_name = Some(value.clone()),
        }
        i += 2;
    }

    let command = match positional.as_slice() {
        [] | ["help"] | ["--help"] | ["-h"] => Command::Help,
        ["version"] | ["--version"] | ["-V"] => Command::Version,
        ["serve"] => Command::Serve,
        ["tenant", "create", name @ ..] if !name.is_empty() => Command::TenantCreate {
            name: name.join(" "),
        },
        ["tenant", "list"] => Command::TenantList,
        ["key", "create", tenant_id] => Command::KeyCreate {
            tenant_id: tenant_id.to_string(),
            name: key_name.unwrap_or_else(|| level.as_str().to_string()),
            level,
        },
        ["key", "list", tenant_id] => Command::KeyList {
            tenant_id: tenant_id.to_string(),
        },
        ["key", "revoke", key_id] => Command::KeyRevoke {
            key_id: key_id.to_string(),
        },
        ["rebuild", tenant_id, agent_id] => Command::Rebuild {
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
        },
        other => bail!("unknown command '{}', try 'hivewatch help'", other.join(" ")),
    };
    Ok((command, flags))
}

async fn load_config(flags: &GlobalFlags) -> Result<HivewatchConfig> {
    let mut config = HivewatchConfig::load(flags.config.as_deref()).await?;
    if let Some(db) = &flags.db {
        config.storage.path = Some(db.clone());
    }
    if let Some(host) = &flags.host {
        config.server.host = host.clone();
    }
    if let Some(port) = flags.port {
        config.server.port = port;
    }
    Ok(config)
}

async fn open_store(config: &HivewatchConfig) -> Result<EventStore> {
    EventStore::open(
        config.database_path(),
        config.agents.stuck_threshold_seconds,
        config.storage.read_connections,
    )
    .await
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, flags) = parse_args(&args)?;

    match command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            println!("hivewatch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Serve => {
            crate::logging::init();
            let config = load_config(&flags).await?;
            serve::run_server(config).await
        }
        other => {
            let config = load_config(&flags).await?;
            let store = open_store(&config).await?;
            match other {
                Command::TenantCreate { name } => tenants::create_tenant(&store, &name).await,
                Command::TenantList => tenants::list_tenants(&store).await,
                Command::KeyCreate {
                    tenant_id,
                    level,
                    name,
                } => tenants::create_key(&store, &tenant_id, level, &name).await,
                Command::KeyList { tenant_id } => tenants::list_keys(&store, &tenant_id).await,
                Command::KeyRevoke { key_id } => tenants::revoke_key(&store, &key_id).await,
                Command::Rebuild {
                    tenant_id,
                    agent_id,
                } => tenants::rebuild_profile(&store, &tenant_id, &agent_id).await,
                Command::Serve | Command::Help | Command::Version => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn no_args_prints_help() {
        assert_eq!(parse_args(&[]).unwrap().0, Command::Help);
    }

    #[test]
    fn serve_flags_are_collected() {
        let (cmd, flags) =
            parse_args(&args("serve --port 9000 --host 0.0.0.0 --db /tmp/hw.db")).unwrap();
        assert_eq!(cmd, Command::Serve);
        assert_eq!(flags.port, Some(9000));
        assert_eq!(flags.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(flags.db, Some(PathBuf::from("/tmp/hw.db")));
    }

    #[test]
    fn key_create_takes_level_and_name() {
        let (cmd, _) = parse_args(&args("key create t-1 --level read --name grafana")).unwrap();
        assert_eq!(
            cmd,
            Command::KeyCreate {
                tenant_id: "t-1".to_string(),
                level: AccessLevel::Read,
                name: "grafana".to_string(),
            }
        );

        let (cmd, _) = parse_args(&args("key create t-1")).unwrap();
        assert!(matches!(cmd, Command::KeyCreate { level: AccessLevel::Full, .. }));
    }

    #[test]
    fn tenant_names_may_have_spaces() {
        let (cmd, _) = parse_args(&args("tenant create Acme Robotics")).unwrap();
        assert_eq!(
            cmd,
            Command::TenantCreate {
                name: "Acme Robotics".to_string()
            }
        );
    }

    #[test]
    fn bad_input_is_an_error() {
        assert!(parse_args(&args("serve --port huge")).is_err());
        assert!(parse_args(&args("key create t-1 --level admin")).is_err());
        assert!(parse_args(&args("serve --db")).is_err());
        assert!(parse_args(&args("launch")).is_err());
    }
}
