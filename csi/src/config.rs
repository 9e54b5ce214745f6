//! Startup configuration for the `driver` binary.
//!
//! Flags are parsed once via `clap` derive and stashed in a process-wide
//! `OnceCell` snapshot; a small `parking_lot::Mutex` holds the handful of
//! knobs (NVMe queue tuning) that can be adjusted after parse from a
//! storage class's parameters rather than only from argv.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

#[derive(Debug, Parser, Clone)]
#[command(name = "driver", about = "CSI controller and node plugin")]
pub struct Cli {
    /// Name this node is known as to the orchestrator.
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Unix socket the CSI sidecars dial (identity/controller/node services).
    #[arg(long, env = "CSI_ENDPOINT", default_value = "/csi/csi.sock")]
    pub csi_endpoint: PathBuf,

    /// Loopback bind address for the auxiliary node-plugin gRPC server.
    #[arg(long, env = "GRPC_ENDPOINT", default_value = "127.0.0.1:50051")]
    pub grpc_endpoint: String,

    /// Base URL of the appliance's management socket.
    #[arg(long, env = "APPLIANCE_URL")]
    pub appliance_url: String,

    /// API key presented during the appliance's auth handshake.
    #[arg(long, env = "APPLIANCE_API_KEY")]
    pub appliance_api_key: String,

    /// Skip TLS certificate verification when dialing the appliance.
    #[arg(long, env = "APPLIANCE_TLS_INSECURE", default_value_t = false)]
    pub appliance_tls_insecure: bool,

    /// Tracing verbosity (error, warn, info, debug, trace).
    #[arg(short = 'v', long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Number of NVMe IO queues to request on connect; appliance default if unset.
    #[arg(long)]
    pub nvme_nr_io_queues: Option<u32>,

    /// Maximum number of volumes this node will publish concurrently.
    #[arg(long, default_value_t = 4)]
    pub max_volumes_per_node: u32,
}

#[derive(Debug, Default)]
pub struct NvmeConfig {
    nr_io_queues: Option<u32>,
}

impl NvmeConfig {
    pub fn nr_io_queues(&self) -> Option<u32> {
        self.nr_io_queues
    }

    pub fn set_nr_io_queues(&mut self, value: Option<u32>) {
        self.nr_io_queues = value;
    }
}

#[derive(Debug)]
pub struct Config {
    pub node_name: String,
    pub csi_endpoint: PathBuf,
    pub grpc_endpoint: String,
    pub appliance_url: String,
    pub appliance_api_key: String,
    pub appliance_tls_insecure: bool,
    pub max_volumes_per_node: u32,
    nvme: Mutex<NvmeConfig>,
}

impl Config {
    fn from_cli(cli: &Cli) -> Self {
        Config {
            node_name: cli.node_name.clone(),
            csi_endpoint: cli.csi_endpoint.clone(),
            grpc_endpoint: cli.grpc_endpoint.clone(),
            appliance_url: cli.appliance_url.clone(),
            appliance_api_key: cli.appliance_api_key.clone(),
            appliance_tls_insecure: cli.appliance_tls_insecure,
            max_volumes_per_node: cli.max_volumes_per_node,
            nvme: Mutex::new(NvmeConfig {
                nr_io_queues: cli.nvme_nr_io_queues,
            }),
        }
    }

    pub fn nvme(&self) -> parking_lot::MutexGuard<'_, NvmeConfig> {
        self.nvme.lock()
    }
}

static CONFIG: OnceCell<Arc<Config>> = OnceCell::new();

/// Parse argv/env once and stash the result for the rest of the process.
///
/// Panics if called more than once; `driver`'s `main` calls this exactly once.
pub fn init(cli: &Cli) -> Arc<Config> {
    let config = Arc::new(Config::from_cli(cli));
    CONFIG
        .set(config.clone())
        .expect("config::init called more than once");
    config
}

/// The process-wide configuration snapshot set up by `init`.
pub fn config() -> Arc<Config> {
    CONFIG.get().expect("config::init not called yet").clone()
}
