//! `xpn_controller`: sends one administrative action to a running
//! controller over its TCP channel and exits with the returned code.
//!
//! Wire framing grounded in the reference implementation's
//! `xpn_controller::send_action`: an `ACTION_CODE` marker, the action as
//! an `i32`, an action-specific payload, then an `i32` return code.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use xpn::error::{XpnError, XpnResult};
use xpn::{PartitionConfig, XpnConfig};

/// Marker sent before every action code, matching the reference
/// implementation's `socket::xpn_controller::ACTION_CODE`.
const ACTION_CODE: i32 = 0x5843_4c31; // "XCL1"

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ActionArg {
    Stop,
    StartServers,
    StopServers,
    PingServers,
    ExpandNew,
    ExpandChange,
    ShrinkNew,
    ShrinkChange,
}

impl ActionArg {
    fn code(self) -> i32 {
        match self {
            ActionArg::Stop => 0,
            ActionArg::StartServers => 1,
            ActionArg::StopServers => 2,
            ActionArg::PingServers => 3,
            ActionArg::ExpandNew => 4,
            ActionArg::ExpandChange => 5,
            ActionArg::ShrinkNew => 6,
            ActionArg::ShrinkChange => 7,
        }
    }
}

/// Administers an Expand partition's server fleet.
#[derive(Debug, Parser)]
#[command(name = "xpn_controller")]
struct Cli {
    action: ActionArg,

    /// Path to the TOML config carrying the partition's `controller_url`.
    #[arg(long, default_value = "xpn.toml")]
    config: std::path::PathBuf,

    /// Block until the action completes server-side.
    #[arg(long)]
    r#await: bool,

    /// Cores to reserve per server, for START_SERVERS.
    #[arg(long, default_value_t = 0)]
    server_cores: i32,

    /// Verbose server-side logging for the duration of this action.
    #[arg(long)]
    debug: bool,

    /// Comma-separated host list, required for EXPAND_*/SHRINK_*.
    #[arg(long)]
    hostlist: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(%err, "xpn_controller failed");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> XpnResult<i32> {
    let partition = load_partition(&cli.config)?;
    let url = partition
        .controller_url
        .as_deref()
        .ok_or_else(|| XpnError::InvalidArgument("partition has no controller_url configured".into()))?;

    let mut channel = xpn::transport::connect(url, Duration::from_secs(5)).await?;

    let mut header = Vec::with_capacity(8);
    header.write_i32::<LittleEndian>(ACTION_CODE).unwrap();
    header.write_i32::<LittleEndian>(cli.action.code()).unwrap();
    channel.send(&header).await?;

    let payload = encode_payload(&cli)?;
    channel.send(&payload).await?;

    let response = channel.recv(4).await?;
    let code = (&response[..]).read_i32::<LittleEndian>().map_err(|e| XpnError::Transport(e.to_string()))?;
    channel.close().await?;
    Ok(code)
}

fn load_partition(path: &std::path::Path) -> XpnResult<PartitionConfigWithUrl> {
    let text = std::fs::read_to_string(path).map_err(|e| XpnError::InvalidArgument(e.to_string()))?;
    let config = XpnConfig::parse(&text)?;
    let partition =
        config.partitions.into_iter().next().ok_or_else(|| XpnError::InvalidArgument("no partition configured".into()))?;
    Ok(PartitionConfigWithUrl { controller_url: config.controller_url, _partition: partition })
}

/// Only the controller URL is needed to send an action; the partition
/// itself is kept so a future multi-partition CLI can select by name.
struct PartitionConfigWithUrl {
    controller_url: Option<String>,
    _partition: PartitionConfig,
}

fn encode_payload(cli: &Cli) -> XpnResult<Vec<u8>> {
    let mut buf = Vec::new();
    match cli.action {
        ActionArg::Stop | ActionArg::StopServers => {
            buf.write_u8(cli.r#await as u8).unwrap();
        }
        ActionArg::StartServers => {
            buf.write_u8(cli.r#await as u8).unwrap();
            buf.write_i32::<LittleEndian>(cli.server_cores).unwrap();
            buf.write_u8(cli.debug as u8).unwrap();
        }
        ActionArg::PingServers => {}
        ActionArg::ExpandNew | ActionArg::ExpandChange | ActionArg::ShrinkNew | ActionArg::ShrinkChange => {
            let hostlist = cli
                .hostlist
                .as_deref()
                .ok_or_else(|| XpnError::InvalidArgument("expand/shrink requires --hostlist".into()))?;
            let bytes = hostlist.as_bytes();
            buf.write_u64::<LittleEndian>(bytes.len() as u64).unwrap();
            buf.extend_from_slice(bytes);
        }
    }
    Ok(buf)
}
