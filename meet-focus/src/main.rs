use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jid::BareJid;
use lib_meet_focus::{
  init_tracing, AllocationRequest, AllocationResponse, BridgeRpc, BridgeRpcError, BridgeSelector,
  BridgeStatus, EndpointUpdate, FocusConfig, FocusRegistry, FocusStats, IqSendError, JingleAddr,
  JingleSender, OutboundJingle,
};
use serde::Deserialize;
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
  name = "meet-focus",
  about = "A conference focus for SFU-based multiparty meetings."
)]
struct Opt {
  #[structopt(long, help = "Path to the JSON configuration file.")]
  config: Option<String>,

  #[structopt(long, short, parse(from_occurrences), help = "Increase verbosity.")]
  verbose: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
  focus: FocusConfig,
  bridges: Vec<BridgeEntry>,
}

#[derive(Debug, Deserialize)]
struct BridgeEntry {
  jid: String,
  region: Option<String>,
  version: Option<String>,
  relay_id: Option<String>,
  #[serde(default)]
  stress: f64,
}

/// Stands in until the deployment wires its room and bridge transports into
/// the registry. Every send reports the focus as not connected.
struct Offline;

#[async_trait]
impl JingleSender for Offline {
  async fn send(&self, addr: &JingleAddr, _message: OutboundJingle) -> Result<(), IqSendError> {
    warn!("no signaling transport; dropping stanza to {}", addr.jid);
    Err(IqSendError::NotConnected)
  }
}

#[async_trait]
impl BridgeRpc for Offline {
  async fn allocate_endpoint(
    &self,
    _bridge: &str,
    _conference_id: Option<&str>,
    _room: &BareJid,
    _endpoint_id: &str,
    _request: AllocationRequest,
  ) -> Result<AllocationResponse, BridgeRpcError> {
    Err(BridgeRpcError::Transport("no bridge transport".to_owned()))
  }

  async fn update_endpoint(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _endpoint_id: &str,
    _update: EndpointUpdate,
  ) -> Result<(), BridgeRpcError> {
    Err(BridgeRpcError::Transport("no bridge transport".to_owned()))
  }

  async fn expire_endpoint(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _endpoint_id: &str,
  ) -> Result<(), BridgeRpcError> {
    Err(BridgeRpcError::Transport("no bridge transport".to_owned()))
  }

  async fn expire_conference(
    &self,
    _bridge: &str,
    _conference_id: &str,
  ) -> Result<(), BridgeRpcError> {
    Err(BridgeRpcError::Transport("no bridge transport".to_owned()))
  }

  async fn set_relays(
    &self,
    _bridge: &str,
    _conference_id: &str,
    _relays: Vec<String>,
  ) -> Result<(), BridgeRpcError> {
    Err(BridgeRpcError::Transport("no bridge transport".to_owned()))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  let opt = Opt::from_args();
  init_tracing(match opt.verbose {
    0 => tracing::Level::INFO,
    1 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  });

  let file_config: FileConfig = match &opt.config {
    Some(path) => {
      let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path))?;
      serde_json::from_str(&raw).context("failed to parse config file")?
    },
    None => FileConfig::default(),
  };

  let config = Arc::new(file_config.focus);
  let selector = Arc::new(BridgeSelector::new(config.bridge.clone()));
  for bridge in &file_config.bridges {
    selector.bridge_discovered(
      &bridge.jid,
      BridgeStatus {
        region: bridge.region.clone(),
        version: bridge.version.clone(),
        relay_id: bridge.relay_id.clone(),
        stress: bridge.stress,
        packet_rate: 0,
        draining: false,
        graceful_shutdown: false,
        healthy: true,
      },
    );
  }
  info!(
    "{} bridge(s) configured, {} operational",
    file_config.bridges.len(),
    selector.operational_count()
  );

  let offline = Arc::new(Offline);
  let registry = FocusRegistry::new(
    config,
    selector,
    offline.clone(),
    offline,
    Arc::new(FocusStats::default()),
  );

  info!("meet-focus up; waiting for transports (ctrl-c to exit)");
  ctrl_c().await?;

  let snapshot = registry.debug_state().await;
  info!("final state: {}", snapshot);

  Ok(())
}
