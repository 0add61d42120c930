//! Session discovery across the container runtime and the VPN daemon.
//!
//! Two independent probes each produce a typed, partial view of the fleet:
//! [`LocalContainer`] records from `docker ps` and [`VpnPeer`] records from
//! `tailscale status --json`. A pure reconciliation pass joins them on the
//! advertised hostname into one deduplicated list of [`SessionView`]s. Either
//! probe failing degrades to an empty contribution so the dashboard stays
//! usable when one data source is down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::hostname::{self, SessionIdentity};
use crate::process::{CommandRunner, RunOptions};

/// Internal port every session's web service listens on.
const SERVICE_PORT: &str = "3000";

/// Timeout for the container runtime list probe.
const CONTAINER_LIST_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the VPN daemon status probe.
const VPN_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery tool configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Container runtime binary (`docker`).
    pub container_bin: String,
    /// VPN daemon CLI binary (`tailscale`).
    pub vpn_bin: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            container_bin: "docker".to_string(),
            vpn_bin: "tailscale".to_string(),
        }
    }
}

/// A session observed on the local container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContainer {
    pub identity: SessionIdentity,
    /// URL of the published service port, when one is mapped.
    pub local_url: Option<String>,
    pub online: bool,
}

/// A session observed as a VPN peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnPeer {
    pub identity: SessionIdentity,
    /// First IPv4-looking address advertised by the peer.
    pub address: Option<String>,
    pub online: bool,
}

/// Unified view of one session, merged from both sources.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub name: String,
    pub project: String,
    #[serde(rename = "type")]
    pub session_type: String,
    pub uid: String,
    pub local_url: Option<String>,
    pub vpn_address: Option<String>,
    pub is_local: bool,
    pub has_vpn: bool,
    pub online: bool,
}

/// One discovery pass over both sources.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySnapshot {
    pub generated_at: String,
    pub sessions: Vec<SessionView>,
}

/// VPN daemon status document. Only the peer fields we consume.
#[derive(Debug, Deserialize)]
struct VpnStatus {
    #[serde(rename = "Peer", default)]
    peers: HashMap<String, VpnNode>,
}

#[derive(Debug, Deserialize)]
struct VpnNode {
    #[serde(rename = "HostName", default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    addresses: Vec<String>,
    #[serde(rename = "Online", default)]
    online: bool,
}

/// Discovers sessions and reconciles the two sources.
#[derive(Clone)]
pub struct DiscoveryEngine {
    runner: Arc<dyn CommandRunner>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, config: DiscoveryConfig) -> Self {
        Self { runner, config }
    }

    /// Query the container runtime for sessions running on this host.
    ///
    /// Tool failure or malformed output yields an empty list, never an error.
    pub async fn get_local_containers(&self) -> Vec<LocalContainer> {
        let args = vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{.Names}}|{{.Ports}}|{{.Status}}".to_string(),
        ];
        let output = match self
            .runner
            .run(
                &self.config.container_bin,
                &args,
                RunOptions::with_timeout(CONTAINER_LIST_TIMEOUT),
            )
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(
                    "Container list failed ({}): {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                return Vec::new();
            }
            Err(e) => {
                warn!("Container list error: {}", e);
                return Vec::new();
            }
        };

        output
            .stdout
            .lines()
            .filter_map(parse_container_line)
            .collect()
    }

    /// Query the VPN daemon for session peers.
    ///
    /// Timeout, nonzero exit, or unparsable JSON yields an empty list.
    pub async fn get_vpn_peers(&self) -> Vec<VpnPeer> {
        let args = vec!["status".to_string(), "--json".to_string()];
        let output = match self
            .runner
            .run(
                &self.config.vpn_bin,
                &args,
                RunOptions::with_timeout(VPN_STATUS_TIMEOUT),
            )
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(
                    "VPN status failed ({}): {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                return Vec::new();
            }
            Err(e) => {
                warn!("VPN status error: {}", e);
                return Vec::new();
            }
        };

        let status: VpnStatus = match serde_json::from_str(&output.stdout) {
            Ok(status) => status,
            Err(e) => {
                warn!("Unparsable VPN status document: {}", e);
                return Vec::new();
            }
        };

        parse_vpn_peers(status)
    }

    /// Run both probes and unify the results.
    pub async fn snapshot(&self) -> DiscoverySnapshot {
        let local = self.get_local_containers().await;
        let vpn = self.get_vpn_peers().await;
        debug!(
            "Discovery: {} local container(s), {} VPN peer(s)",
            local.len(),
            vpn.len()
        );
        DiscoverySnapshot {
            generated_at: chrono::Utc::now().to_rfc3339(),
            sessions: unify(local, vpn),
        }
    }
}

/// Parse one `name|ports|status` record from the container runtime.
fn parse_container_line(line: &str) -> Option<LocalContainer> {
    let mut fields = line.splitn(3, '|');
    let name = fields.next()?;
    let ports = fields.next()?;
    let status = fields.next()?;

    let identity = hostname::decode(name)?;

    Some(LocalContainer {
        identity,
        local_url: published_service_url(ports),
        online: status.contains("Up"),
    })
}

/// Find the host port published for the session service port.
///
/// Port mappings look like `127.0.0.1:32768->3000/tcp`, comma separated.
/// The first mapping in enumeration order wins when several exist.
fn published_service_url(ports: &str) -> Option<String> {
    let needle = format!("->{}/tcp", SERVICE_PORT);
    for mapping in ports.split(',') {
        let mapping = mapping.trim();
        if !mapping.contains(&needle) {
            continue;
        }
        let bind = mapping.split("->").next()?;
        if let Some(host_port) = bind.rsplit(':').next() {
            return Some(format!("http://localhost:{}", host_port));
        }
    }
    None
}

/// Extract session peers from the VPN status document.
fn parse_vpn_peers(status: VpnStatus) -> Vec<VpnPeer> {
    let mut peers: Vec<VpnPeer> = status
        .peers
        .into_values()
        .filter_map(|node| {
            let identity = hostname::decode(&node.host_name)?;
            let address = node.addresses.iter().find(|a| a.contains('.')).cloned();
            Some(VpnPeer {
                identity,
                address,
                online: node.online,
            })
        })
        .collect();
    peers.sort_by(|a, b| a.identity.hostname.cmp(&b.identity.hostname));
    peers
}

/// Join both sources on hostname into one deduplicated session list.
///
/// Local records are authoritative for `online` and `local_url`; VPN records
/// supply the peer address. VPN-only peers survive even when the local probe
/// returned nothing, and no hostname ever appears twice.
pub fn unify(local: Vec<LocalContainer>, vpn: Vec<VpnPeer>) -> Vec<SessionView> {
    let mut vpn_by_host: HashMap<String, VpnPeer> = vpn
        .into_iter()
        .map(|peer| (peer.identity.hostname.clone(), peer))
        .collect();

    let mut views = Vec::new();
    for container in local {
        let peer = vpn_by_host.remove(&container.identity.hostname);
        views.push(SessionView {
            name: container.identity.hostname.clone(),
            project: container.identity.project.clone(),
            session_type: container.identity.session_type.clone(),
            uid: container.identity.uid.clone(),
            local_url: container.local_url,
            vpn_address: peer.as_ref().and_then(|p| p.address.clone()),
            is_local: true,
            has_vpn: peer.is_some(),
            online: container.online,
        });
    }

    for (_, peer) in vpn_by_host.drain() {
        views.push(SessionView {
            name: peer.identity.hostname.clone(),
            project: peer.identity.project.clone(),
            session_type: peer.identity.session_type.clone(),
            uid: peer.identity.uid.clone(),
            local_url: None,
            vpn_address: peer.address,
            is_local: false,
            has_vpn: true,
            online: peer.online,
        });
    }

    views.sort_by(|a, b| a.name.cmp(&b.name));
    views
}
