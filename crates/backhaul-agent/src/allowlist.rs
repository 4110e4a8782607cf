use backhaul_mux::ConnectAuthorizer;
use ipnetwork::IpNetwork;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::AgentError;

/// Networks and ports the agent is willing to dial
///
/// Only TCP targets given as a literal `IP:port` pass; hostnames and other
/// protocols are refused. An empty network or port list allows everything
/// on that axis.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    networks: Vec<IpNetwork>,
    ports: Vec<u16>,
}

impl Allowlist {
    /// Build an allowlist from CIDR strings (e.g. "10.0.0.0/8") and ports
    pub fn new<S: AsRef<str>>(networks: &[S], ports: Vec<u16>) -> Result<Self, AgentError> {
        let networks = networks
            .iter()
            .map(|network| {
                let network = network.as_ref();
                IpNetwork::from_str(network).map_err(|e| AgentError::InvalidNetwork {
                    network: network.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { networks, ports })
    }

    /// Check an `IP:port` address ("[::1]:22" for IPv6)
    pub fn is_allowed(&self, address: &str) -> bool {
        match SocketAddr::from_str(address) {
            Ok(addr) => self.is_ip_allowed(&addr) && self.is_port_allowed(addr.port()),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Refusing unparseable target address");
                false
            }
        }
    }

    fn is_ip_allowed(&self, addr: &SocketAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|net| net.contains(addr.ip()))
    }

    fn is_port_allowed(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }
}

impl ConnectAuthorizer for Allowlist {
    fn authorize(&self, proto: &str, address: &str) -> bool {
        let allowed = matches!(proto, "tcp" | "tcp4" | "tcp6") && self.is_allowed(address);
        if !allowed {
            tracing::info!(proto = %proto, address = %address, "Target not in allowlist");
        }
        allowed
    }
}
