//! `stratactl`: admin CLI for a Strata data directory.
//!
//! Each invocation embeds a cluster over `--data-dir`, waits for the meta
//! table to come back, runs one operation, and exits 0 on success. Errors go
//! to stderr with a non-zero exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use strata_store::meta::TableSchema;
use strata_store::user_manager::user_token;
use strata_store::{ClusterOptions, EmbeddedCluster, StatusCode};

#[derive(Parser, Debug)]
#[command(name = "stratactl", about = "Strata admin CLI")]
struct CtlArgs {
    /// Data directory of the target cluster.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Tablet servers to host while the command runs.
    #[arg(long, default_value_t = 2)]
    nodes: usize,

    /// Caller identity: "user:password".
    #[arg(long, default_value = "root:root")]
    identity: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a table, optionally pre-split at the given keys.
    Create {
        table: String,
        #[arg(long = "split")]
        splits: Vec<String>,
    },
    /// Drop a disabled table.
    Drop { table: String },
    Enable { table: String },
    Disable { table: String },
    /// Update a table's schema from a JSON file.
    Update { schema_file: PathBuf },
    /// Report whether a schema update has reached every tablet.
    Updatecheck { table: String },
    /// Show tables and their tablets.
    Show {
        table: Option<String>,
    },
    /// Show tablet servers.
    Showts,
    /// Install an alias for a table.
    Rename { table: String, alias: String },
    Snapshot { table: String },
    Rollback {
        table: String,
        snapshot: u64,
        #[arg(long, default_value = "rollback")]
        name: String,
    },
    Delsnapshot { table: String, snapshot: u64 },
    /// User management.
    User {
        #[command(subcommand)]
        op: UserOp,
    },
    /// Enter or leave safe mode.
    Safemode {
        #[arg(value_parser = ["enter", "leave"])]
        action: String,
    },
    /// Evict a tablet server.
    Kick { addr: String },
    /// Major-compact every tablet of a table.
    Compact { table: String },
    /// Split the tablet containing ROW.
    Split { table: String, row: String },
    /// Merge the tablet containing ROW with a neighbor.
    Merge { table: String, row: String },
    /// Move the tablet containing ROW to TARGET (or a scheduler pick).
    Move {
        table: String,
        row: String,
        target: Option<String>,
    },
    /// Write one key (smoke helper).
    Put {
        table: String,
        key: String,
        value: String,
    },
    /// Read one key (smoke helper).
    Get { table: String, key: String },
}

#[derive(Subcommand, Debug)]
enum UserOp {
    Create { name: String, password: String },
    Delete { name: String },
    Passwd { name: String, password: String },
    Show,
    Addtogroup { name: String, group: String },
    Removefromgroup { name: String, group: String },
}

fn token_for(identity: &str) -> Result<String, String> {
    match identity.split_once(':') {
        Some((user, password)) => Ok(user_token(user, password)),
        None => Err("identity must be user:password".to_string()),
    }
}

async fn run(args: CtlArgs) -> Result<(), String> {
    let token = token_for(&args.identity)?;
    let options = ClusterOptions::new(&args.data_dir).with_nodes(args.nodes);
    let cluster = EmbeddedCluster::start(options)
        .await
        .map_err(|err| format!("cluster start failed: {err:#}"))?;
    let master = cluster.master().clone();
    let to_msg = |status: StatusCode| format!("{status}");

    match args.command {
        Command::Create { table, splits } => {
            let schema = TableSchema::kv(&table);
            let keys = splits.into_iter().map(String::into_bytes).collect();
            master
                .create_table(&token, schema, keys)
                .await
                .map_err(to_msg)?;
            cluster.wait_table_ready(&table, Duration::from_secs(10)).await;
            println!("created {table}");
        }
        Command::Drop { table } => {
            master.drop_table(&token, &table).await.map_err(to_msg)?;
            // Deletion is asynchronous; give it a moment to settle.
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("dropped {table}");
        }
        Command::Enable { table } => {
            master.enable_table(&token, &table).await.map_err(to_msg)?;
            cluster.wait_table_ready(&table, Duration::from_secs(10)).await;
            println!("enabled {table}");
        }
        Command::Disable { table } => {
            master.disable_table(&token, &table).await.map_err(to_msg)?;
            println!("disabled {table}");
        }
        Command::Update { schema_file } => {
            let data = std::fs::read_to_string(&schema_file)
                .map_err(|err| format!("read {}: {err}", schema_file.display()))?;
            let schema: TableSchema =
                serde_json::from_str(&data).map_err(|err| format!("parse schema: {err}"))?;
            let name = schema.name.clone();
            master
                .update_table(&token, &name, schema)
                .await
                .map_err(to_msg)?;
            println!("updated {name}");
        }
        Command::Updatecheck { table } => {
            let done = master.update_check(&table).map_err(to_msg)?;
            println!("{}", if done { "synced" } else { "syncing" });
            if !done {
                return Err("schema update still propagating".to_string());
            }
        }
        Command::Show { table } => {
            for (meta, tablets) in master.show_tables() {
                if table.as_deref().is_some_and(|t| t != meta.name) {
                    continue;
                }
                println!(
                    "{}  status={:?}  tablets={}  snapshots={:?}",
                    meta.name,
                    meta.status,
                    tablets.len(),
                    meta.snapshots
                );
                for tablet in tablets {
                    println!(
                        "  {}  {}  {:?}  {}B  @{}",
                        tablet.path,
                        tablet.key_range,
                        tablet.status,
                        tablet.data_size,
                        tablet.server_addr
                    );
                }
            }
        }
        Command::Showts => {
            for (addr, stat, ready) in master.show_tablet_nodes() {
                println!(
                    "{addr}  ready={ready}  tablets={}  size={}B  load={}",
                    stat.tablet_count, stat.data_size, stat.load_weight
                );
            }
        }
        Command::Rename { table, alias } => {
            master
                .rename_table(&token, &table, &alias)
                .await
                .map_err(to_msg)?;
            println!("renamed {table} -> {alias}");
        }
        Command::Snapshot { table } => {
            let id = master.snapshot_table(&token, &table).await.map_err(to_msg)?;
            println!("snapshot {id}");
        }
        Command::Rollback {
            table,
            snapshot,
            name,
        } => {
            master
                .rollback_table(&token, &table, snapshot, &name)
                .await
                .map_err(to_msg)?;
            println!("rolled back {table} to {snapshot}");
        }
        Command::Delsnapshot { table, snapshot } => {
            master
                .del_snapshot(&token, &table, snapshot)
                .await
                .map_err(to_msg)?;
            println!("deleted snapshot {snapshot}");
        }
        Command::User { op } => match op {
            UserOp::Create { name, password } => {
                master
                    .create_user(&token, &name, &password)
                    .await
                    .map_err(to_msg)?;
                println!("user {name} created");
            }
            UserOp::Delete { name } => {
                master.delete_user(&token, &name).await.map_err(to_msg)?;
                println!("user {name} deleted");
            }
            UserOp::Passwd { name, password } => {
                master
                    .change_password(&token, &name, &password)
                    .await
                    .map_err(to_msg)?;
                println!("password changed for {name}");
            }
            UserOp::Show => {
                for user in master.show_users() {
                    println!("{}  groups={:?}", user.name, user.groups);
                }
            }
            UserOp::Addtogroup { name, group } => {
                master
                    .add_user_to_group(&token, &name, &group)
                    .await
                    .map_err(to_msg)?;
                println!("{name} added to {group}");
            }
            UserOp::Removefromgroup { name, group } => {
                master
                    .remove_user_from_group(&token, &name, &group)
                    .await
                    .map_err(to_msg)?;
                println!("{name} removed from {group}");
            }
        },
        Command::Safemode { action } => {
            if action == "enter" {
                master.enter_safe_mode().map_err(|err| format!("{err:#}"))?;
                println!("safe mode entered");
            } else {
                master.leave_safe_mode().map_err(|err| format!("{err:#}"))?;
                println!("safe mode left");
            }
        }
        Command::Kick { addr } => {
            master.try_kick_tablet_node(&addr);
            println!("kick mark written for {addr}");
        }
        Command::Compact { table } => {
            master.compact_table(&token, &table).await.map_err(to_msg)?;
            println!("compacted {table}");
        }
        Command::Split { table, row } => {
            master
                .split_tablet_cmd(&table, row.as_bytes())
                .map_err(to_msg)?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("split requested for {table} at {row}");
        }
        Command::Merge { table, row } => {
            master
                .merge_tablet_cmd(&table, row.as_bytes())
                .map_err(to_msg)?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("merge requested for {table} at {row}");
        }
        Command::Move { table, row, target } => {
            master
                .move_tablet_cmd(&table, row.as_bytes(), target)
                .map_err(to_msg)?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("move requested for {table} at {row}");
        }
        Command::Put { table, key, value } => {
            cluster.wait_table_ready(&table, Duration::from_secs(10)).await;
            let client = cluster.client();
            let handle = client.open_table(&table).await;
            handle
                .put(key.as_bytes(), value.as_bytes())
                .await
                .map_err(to_msg)?;
            println!("ok");
        }
        Command::Get { table, key } => {
            cluster.wait_table_ready(&table, Duration::from_secs(10)).await;
            let client = cluster.client();
            let handle = client.open_table(&table).await;
            match handle.get(key.as_bytes()).await.map_err(to_msg)? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => return Err(format!("{key}: not found")),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CtlArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
