//! `appliance-ctl`: a read-only operator utility for inspecting volumes the
//! driver manages on the storage appliance. Never mutates appliance state.

use std::process::ExitCode;

use appliance_api::{ApplianceApi, DatasetHandle, CSI_NAME_PROPERTY};
use clap::{Parser, Subcommand, ValueEnum};
use prettytable::{format, row, Table};
use rpc_transport::Transport;
use serde::Serialize;

const DRIVER_ID: &str = "csi-appliance-driver";

#[derive(Debug, Parser)]
#[command(name = "appliance-ctl", about = "Read-only inspection of appliance-managed volumes")]
struct Cli {
    /// Base URL of the appliance's management socket.
    #[arg(long, env = "APPLIANCE_URL")]
    url: String,

    /// API key presented during the appliance's auth handshake.
    #[arg(long, env = "APPLIANCE_API_KEY")]
    api_key: String,

    /// How to render results.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every volume this driver manages on the appliance.
    Summary,
    /// Report health for every managed volume (mirrors ControllerGetVolume).
    Health,
    /// Report the appliance-side state of a single volume.
    GetVolume {
        /// The volume id, i.e. its dataset/zvol path on the appliance.
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct VolumeRow {
    path: String,
    capacity_bytes: u64,
    csi_name: String,
}

#[derive(Debug, Serialize)]
struct HealthRow {
    path: String,
    healthy: bool,
    message: String,
}

impl From<&DatasetHandle> for VolumeRow {
    fn from(handle: &DatasetHandle) -> Self {
        VolumeRow {
            path: handle.path.clone(),
            capacity_bytes: handle.capacity_bytes,
            csi_name: handle.properties.get(CSI_NAME_PROPERTY).cloned().unwrap_or_default(),
        }
    }
}

fn health_of(handle: &DatasetHandle) -> HealthRow {
    // Mirrors the driver's own ControllerGetVolume health check: an NFS
    // volume missing its share id is the one appliance-visible failure mode
    // we can detect without dialing the node plugin.
    let nfs_share_missing = handle.properties.get("csi.io/protocol").map(String::as_str) == Some("nfs")
        && !handle.properties.contains_key("csi.io/nfs-share-id");
    HealthRow {
        path: handle.path.clone(),
        healthy: !nfs_share_missing,
        message: if nfs_share_missing {
            "nfs share missing".to_string()
        } else {
            String::new()
        },
    }
}

fn render<T: Serialize>(format: OutputFormat, rows: &[T], table: impl FnOnce(&[T]) -> Table) {
    match format {
        OutputFormat::Table => {
            let mut tab = table(rows);
            tab.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
            tab.printstd();
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows).expect("serializable")),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(rows).expect("serializable")),
    }
}

fn volume_table(rows: &[VolumeRow]) -> Table {
    let mut tab = Table::new();
    tab.add_row(row!["PATH", "CAPACITY", "CSI NAME"]);
    for row in rows {
        tab.add_row(row![row.path, row.capacity_bytes, row.csi_name]);
    }
    tab
}

fn health_table(rows: &[HealthRow]) -> Table {
    let mut tab = Table::new();
    tab.add_row(row!["PATH", "HEALTHY", "MESSAGE"]);
    for row in rows {
        tab.add_row(row![row.path, row.healthy, row.message]);
    }
    tab
}

async fn run(cli: Cli) -> Result<(), String> {
    let url = cli.url.parse().map_err(|err| format!("invalid --url: {}", err))?;
    let transport = Transport::connect(url, cli.api_key.clone());
    let appliance = ApplianceApi::new(transport, DRIVER_ID);

    match cli.cmd {
        Command::Summary => {
            let handles = appliance.list_managed().await.map_err(|err| err.to_string())?;
            let rows: Vec<VolumeRow> = handles.iter().map(VolumeRow::from).collect();
            render(cli.output, &rows, volume_table);
        }
        Command::Health => {
            let handles = appliance.list_managed().await.map_err(|err| err.to_string())?;
            let rows: Vec<HealthRow> = handles.iter().map(health_of).collect();
            render(cli.output, &rows, health_table);
        }
        Command::GetVolume { id } => {
            let handle = appliance
                .find_by_path(&id)
                .await
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("volume '{}' not found", id))?;
            let rows = [VolumeRow::from(&handle)];
            render(cli.output, &rows, volume_table);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("appliance-ctl: {}", err);
            ExitCode::FAILURE
        }
    }
}
