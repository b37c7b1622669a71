//! Host network plumbing: the IP forwarding knob and the nat masquerade
//! rules that let VPN clients reach local networks (or the internet)
//! through this host.
//!
//! The plumber is diff-free: every call recomputes the full rule set from
//! the record and the live routing table, so repeated installs do not
//! duplicate rules and clears remove exactly the computed set.

use cidr::Ipv4Inet;
use thiserror::Error;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::sync::Arc;

const NAT_TABLE: &str = "nat";
const NAT_CHAIN: &str = "POSTROUTING";
/// Route target covering all client traffic when no local networks are pushed.
const WILDCARD_NETWORK: &str = "0.0.0.0/0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to enable IP forwarding [status: {0}]: {1}")]
    Forwarding(i32, String),
    #[error("failed to read routing table [status: {0}]: {1}")]
    RoutingTable(i32, String),
    #[error("no default route in the host routing table")]
    NoDefaultRoute,
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    #[error("iptables error: {0}")]
    Iptables(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Kernel knobs and routing table access outside the nat table.
pub trait HostOps: Send + Sync {
    fn enable_ip_forwarding(&self) -> Result<(), Error>;
    /// Raw `route -n` output.
    fn routing_table(&self) -> Result<String, Error>;
}

/// Rule operations on the nat POSTROUTING chain.
pub trait IptablesOps: Send + Sync {
    fn exists(&self, rule: &str) -> Result<bool, Error>;
    fn append(&self, rule: &str) -> Result<(), Error>;
    fn delete(&self, rule: &str) -> Result<(), Error>;
}

pub struct SystemHost;

impl HostOps for SystemHost {
    fn enable_ip_forwarding(&self) -> Result<(), Error> {
        let output = Command::new("sysctl")
            .arg("-w")
            .arg("net.ipv4.ip_forward=1")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Forwarding(
                output.status.code().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn routing_table(&self) -> Result<String, Error> {
        let output = Command::new("route").arg("-n").output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::RoutingTable(
                output.status.code().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

pub struct SystemIptables {
    inner: iptables::IPTables,
}

impl SystemIptables {
    pub fn new() -> Result<Self, Error> {
        let inner = iptables::new(false).map_err(ipt_error)?;
        Ok(SystemIptables { inner })
    }
}

impl IptablesOps for SystemIptables {
    fn exists(&self, rule: &str) -> Result<bool, Error> {
        self.inner.exists(NAT_TABLE, NAT_CHAIN, rule).map_err(ipt_error)
    }

    fn append(&self, rule: &str) -> Result<(), Error> {
        self.inner.append(NAT_TABLE, NAT_CHAIN, rule).map_err(ipt_error)
    }

    fn delete(&self, rule: &str) -> Result<(), Error> {
        self.inner.delete(NAT_TABLE, NAT_CHAIN, rule).map_err(ipt_error)
    }
}

fn ipt_error(e: Box<dyn std::error::Error>) -> Error {
    Error::Iptables(e.to_string())
}

/// One masquerade rule: traffic from the VPN subnet leaving through the
/// interface that owns the destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatRule {
    pub destination: Option<String>,
    pub source: String,
    pub interface: String,
}

impl NatRule {
    pub fn spec(&self) -> String {
        match &self.destination {
            Some(destination) => format!(
                "-d {destination} -s {} -o {} -j MASQUERADE",
                self.source, self.interface
            ),
            None => format!("-s {} -o {} -j MASQUERADE", self.source, self.interface),
        }
    }
}

/// Destination address -> owning interface, from `route -n` output.
/// Rows whose first column is not an IPv4 address are ignored.
pub fn parse_routes(output: &str) -> HashMap<String, String> {
    let mut routes = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[0].parse::<Ipv4Addr>().is_err() {
            continue;
        }
        routes.insert(fields[0].to_string(), fields[7].to_string());
    }
    routes
}

/// Compute the masquerade rule set for a server's virtual subnet. Targets
/// not present in the routing table fall back to the default-route
/// interface; the wildcard target gets no destination match.
pub fn nat_rules(
    virtual_network: &str,
    local_networks: &[String],
    routes: &HashMap<String, String>,
) -> Result<Vec<NatRule>, Error> {
    let default_interface = routes.get("0.0.0.0").ok_or(Error::NoDefaultRoute)?;

    let targets: Vec<String> = if local_networks.is_empty() {
        vec![WILDCARD_NETWORK.to_string()]
    } else {
        local_networks.to_vec()
    };

    let mut rules = Vec::with_capacity(targets.len());
    for target in &targets {
        let address = network_address(target)?;
        let interface = routes.get(&address).unwrap_or(default_interface);
        let destination = (address != "0.0.0.0").then(|| target.clone());
        rules.push(NatRule {
            destination,
            source: virtual_network.to_string(),
            interface: interface.clone(),
        });
    }
    Ok(rules)
}

fn network_address(network: &str) -> Result<String, Error> {
    let inet: Ipv4Inet = network
        .parse()
        .map_err(|_| Error::InvalidNetwork(network.to_string()))?;
    Ok(inet.address().to_string())
}

pub struct Firewall {
    host: Arc<dyn HostOps>,
    ipt: Arc<dyn IptablesOps>,
}

impl Firewall {
    pub fn system() -> Result<Self, Error> {
        Ok(Firewall {
            host: Arc::new(SystemHost),
            ipt: Arc::new(SystemIptables::new()?),
        })
    }

    pub fn new(host: Arc<dyn HostOps>, ipt: Arc<dyn IptablesOps>) -> Self {
        Firewall { host, ipt }
    }

    pub fn enable_ip_forwarding(&self) -> Result<(), Error> {
        self.host.enable_ip_forwarding()
    }

    pub fn rules(&self, virtual_network: &str, local_networks: &[String]) -> Result<Vec<NatRule>, Error> {
        let routes = parse_routes(&self.host.routing_table()?);
        nat_rules(virtual_network, local_networks, &routes)
    }

    /// True iff every computed rule is present. Probe failures read as
    /// "rule not present".
    pub fn rules_exist(&self, virtual_network: &str, local_networks: &[String]) -> Result<bool, Error> {
        for rule in self.rules(virtual_network, local_networks)? {
            if !self.ipt.exists(&rule.spec()).unwrap_or(false) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Append each computed rule that is not already present. A failed
    /// append surfaces immediately; earlier appends stay in place and are
    /// removed by the next clear.
    pub fn install_rules(&self, virtual_network: &str, local_networks: &[String]) -> Result<(), Error> {
        for rule in self.rules(virtual_network, local_networks)? {
            let spec = rule.spec();
            if self.ipt.exists(&spec).unwrap_or(false) {
                continue;
            }
            tracing::debug!(rule = %spec, "installing nat rule");
            self.ipt.append(&spec)?;
        }
        Ok(())
    }

    /// Delete each computed rule that is currently present.
    pub fn clear_rules(&self, virtual_network: &str, local_networks: &[String]) -> Result<(), Error> {
        for rule in self.rules(virtual_network, local_networks)? {
            let spec = rule.spec();
            if !self.ipt.exists(&spec).unwrap_or(false) {
                continue;
            }
            tracing::debug!(rule = %spec, "clearing nat rule");
            self.ipt.delete(&spec)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::{MockHost, MockIptables, ROUTE_TABLE};
    use super::*;

    fn firewall(ipt: Arc<MockIptables>) -> Firewall {
        Firewall::new(Arc::new(MockHost::new()), ipt)
    }

    #[test]
    fn parses_route_table() {
        let routes = parse_routes(ROUTE_TABLE);
        assert_eq!(routes.len(), 3);
        assert_eq!(routes["0.0.0.0"], "eth0");
        assert_eq!(routes["192.168.1.0"], "eth1");
    }

    #[test]
    fn wildcard_rule_has_no_destination_match() {
        let routes = parse_routes(ROUTE_TABLE);
        let rules = nat_rules("10.8.0.0/24", &[], &routes).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].spec(), "-s 10.8.0.0/24 -o eth0 -j MASQUERADE");
    }

    #[test]
    fn local_networks_route_through_owning_interface() {
        let routes = parse_routes(ROUTE_TABLE);
        let locals = vec!["192.168.1.0/24".to_string(), "10.20.0.0/16".to_string()];
        let rules = nat_rules("10.8.0.0/24", &locals, &routes).unwrap();
        assert_eq!(
            rules[0].spec(),
            "-d 192.168.1.0/24 -s 10.8.0.0/24 -o eth1 -j MASQUERADE"
        );
        // not in the routing table: falls back to the default interface
        assert_eq!(
            rules[1].spec(),
            "-d 10.20.0.0/16 -s 10.8.0.0/24 -o eth0 -j MASQUERADE"
        );
    }

    #[test]
    fn missing_default_route_is_fatal() {
        let routes = parse_routes("192.168.1.0  0.0.0.0  255.255.255.0  U 0 0 0 eth1\n");
        let res = nat_rules("10.8.0.0/24", &[], &routes);
        assert!(matches!(res, Err(Error::NoDefaultRoute)));
    }

    #[test]
    fn bad_network_is_rejected() {
        let routes = parse_routes(ROUTE_TABLE);
        let locals = vec!["not-a-network".to_string()];
        let res = nat_rules("10.8.0.0/24", &locals, &routes);
        assert!(matches!(res, Err(Error::InvalidNetwork(_))));
    }

    #[test]
    fn install_is_idempotent() {
        let ipt = Arc::new(MockIptables::new());
        let fw = firewall(ipt.clone());
        let locals = vec!["192.168.1.0/24".to_string(), "10.20.0.0/16".to_string()];

        fw.install_rules("10.8.0.0/24", &locals).unwrap();
        fw.install_rules("10.8.0.0/24", &locals).unwrap();
        assert_eq!(ipt.rule_specs().len(), 2);
        assert!(fw.rules_exist("10.8.0.0/24", &locals).unwrap());
    }

    #[test]
    fn install_then_clear_restores_the_table() {
        let ipt = Arc::new(MockIptables::new());
        let fw = firewall(ipt.clone());
        ipt.append("-s 172.16.0.0/16 -o eth0 -j MASQUERADE").unwrap();

        fw.install_rules("10.8.0.0/24", &[]).unwrap();
        assert_eq!(ipt.rule_specs().len(), 2);

        fw.clear_rules("10.8.0.0/24", &[]).unwrap();
        // a rule this server never computed is left untouched
        assert_eq!(
            ipt.rule_specs(),
            vec!["-s 172.16.0.0/16 -o eth0 -j MASQUERADE".to_string()]
        );
        assert!(!fw.rules_exist("10.8.0.0/24", &[]).unwrap());
    }

    #[test]
    fn probe_failure_reads_as_absent() {
        let ipt = Arc::new(MockIptables::new());
        let fw = firewall(ipt.clone());
        ipt.set_fail_on("exists", "iptables: permission denied");

        assert!(!fw.rules_exist("10.8.0.0/24", &[]).unwrap());
    }

    #[test]
    fn clear_removes_partial_leftovers() {
        let ipt = Arc::new(MockIptables::new());
        let fw = firewall(ipt.clone());
        let locals = vec!["192.168.1.0/24".to_string(), "10.20.0.0/16".to_string()];

        // only one of the two computed rules is present
        ipt.append("-d 192.168.1.0/24 -s 10.8.0.0/24 -o eth1 -j MASQUERADE")
            .unwrap();
        fw.clear_rules("10.8.0.0/24", &locals).unwrap();
        assert!(ipt.rule_specs().is_empty());
    }
}
