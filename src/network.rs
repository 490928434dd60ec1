use crate::error::{Result, TeamError};
use crate::peer::{MemberEndpoint, NetworkConfig, NetworkInterface};
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Interface name prefixes belonging to hypervisors, containers and tunnels.
const VIRTUAL_PREFIXES: &[&str] = &[
    "vmnet", "vboxnet", "veth", "docker", "br-", "virbr", "lxc", "lxd", "flannel", "cni",
    "calico", "weave", "tun", "tap", "utun", "awdl", "llw", "bridge", "parallels",
];

pub fn is_virtual_interface(name: &str) -> bool {
    let lower = name.to_lowercase();
    VIRTUAL_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Raw `(interface name, address)` pairs from the OS.
pub trait InterfaceSource: Send + Sync {
    fn addresses(&self) -> Result<Vec<(String, IpAddr)>>;
}

/// Enumerates interfaces through `local-ip-address`.
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn addresses(&self) -> Result<Vec<(String, IpAddr)>> {
        local_ip_address::list_afinet_netifas()
            .map_err(|e| TeamError::Io(std::io::Error::other(e.to_string())))
    }
}

/// A fixed interface list, for hosts where enumeration is not wanted.
pub struct StaticInterfaces(pub Vec<(String, IpAddr)>);

impl StaticInterfaces {
    pub fn single(name: &str, ip: Ipv4Addr) -> Self {
        Self(vec![(name.to_string(), IpAddr::V4(ip))])
    }
}

impl InterfaceSource for StaticInterfaces {
    fn addresses(&self) -> Result<Vec<(String, IpAddr)>> {
        Ok(self.0.clone())
    }
}

/// Picks the addresses this peer is reachable on.
#[derive(Clone)]
pub struct NetworkResolver {
    source: Arc<dyn InterfaceSource>,
}

impl Default for NetworkResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemInterfaces))
    }
}

impl NetworkResolver {
    pub fn new(source: Arc<dyn InterfaceSource>) -> Self {
        Self { source }
    }

    /// Usable private IPv4 interfaces, physical before virtual, then by name.
    pub fn list_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, addr) in self.source.addresses()? {
            let IpAddr::V4(v4) = addr else { continue };
            if !is_usable(&v4) {
                continue;
            }
            by_name.entry(name).or_default().push(v4.to_string());
        }

        let mut interfaces: Vec<NetworkInterface> = by_name
            .into_iter()
            .map(|(name, addresses)| NetworkInterface {
                is_virtual: is_virtual_interface(&name),
                name,
                addresses,
                // local-ip-address only reports configured interfaces
                is_up: true,
                is_loopback: false,
            })
            .collect();

        interfaces.sort_by(|a, b| {
            a.is_virtual
                .cmp(&b.is_virtual)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(interfaces)
    }

    /// Every usable address, in interface order.
    pub fn all_ips(&self) -> Result<Vec<String>> {
        Ok(self
            .list_interfaces()?
            .into_iter()
            .flat_map(|i| i.addresses)
            .collect())
    }

    /// Local address on the same /24 as `target_host`, else the first one available.
    pub fn select_matching_local_ip(&self, target_host: &str) -> Result<String> {
        let target: Ipv4Addr = target_host
            .parse()
            .map_err(|_| TeamError::InvalidEndpoint(format!("invalid target IP: {target_host}")))?;
        let subnet = Ipv4Network::new(target, 24)
            .map_err(|e| TeamError::InvalidEndpoint(e.to_string()))?;

        let ips = self.all_ips()?;
        let matching = ips.iter().find(|ip| {
            ip.parse::<Ipv4Addr>()
                .map(|addr| subnet.contains(addr))
                .unwrap_or(false)
        });
        match matching.or_else(|| ips.first()) {
            Some(ip) => Ok(ip.clone()),
            None => Err(TeamError::NoValidInterface),
        }
    }

    /// The preferred address if it still exists, else the first available.
    pub fn primary_ip(&self, config: Option<&NetworkConfig>) -> Result<String> {
        let interfaces = self.list_interfaces()?;
        if let Some(cfg) = config {
            if !cfg.preferred_ip.is_empty()
                && interfaces
                    .iter()
                    .any(|i| i.addresses.contains(&cfg.preferred_ip))
            {
                return Ok(cfg.preferred_ip.clone());
            }
            if !cfg.preferred_interface.is_empty() {
                if let Some(ip) = interfaces
                    .iter()
                    .find(|i| i.name == cfg.preferred_interface)
                    .and_then(|i| i.addresses.first())
                {
                    return Ok(ip.clone());
                }
            }
        }
        interfaces
            .into_iter()
            .find_map(|i| i.addresses.into_iter().next())
            .ok_or(TeamError::NoValidInterface)
    }

    pub fn build_endpoint(
        &self,
        config: Option<&NetworkConfig>,
        port: u16,
    ) -> Result<MemberEndpoint> {
        let primary_ip = self.primary_ip(config)?;
        Ok(MemberEndpoint {
            primary_ip,
            all_ips: self.all_ips()?,
            port,
            preferred_interface: config
                .map(|c| c.preferred_interface.clone())
                .unwrap_or_default(),
        })
    }
}

fn is_usable(addr: &Ipv4Addr) -> bool {
    addr.is_private() && !addr.is_loopback() && !addr.is_link_local()
}

/// Tries each `ip:port` in order and returns the first stream that connects.
pub async fn dial_addresses(addresses: &[String], timeout: Duration) -> Result<TcpStream> {
    let mut last_error = String::from("no addresses to dial");
    for addr in addresses {
        match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "dial failed");
                last_error = format!("{addr}: {e}");
            }
            Err(_) => {
                tracing::debug!(%addr, "dial timed out");
                last_error = format!("{addr}: timed out");
            }
        }
    }
    Err(TeamError::AllAddressesFailed(last_error))
}

/// Dials every address of `endpoint`, primary first.
pub async fn dial_with_fallback(endpoint: &MemberEndpoint, timeout: Duration) -> Result<TcpStream> {
    dial_addresses(&endpoint.all_addresses(), timeout).await
}

/// Binds the port on all interfaces and releases it straight away.
pub fn check_port_available(port: u16) -> Result<()> {
    std::net::TcpListener::bind(("0.0.0.0", port))
        .map(drop)
        .map_err(|_| TeamError::PortInUse(port))
}

/// Splits `host:port`.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| TeamError::InvalidEndpoint(endpoint.to_string()))?;
    if host.is_empty() {
        return Err(TeamError::InvalidEndpoint(endpoint.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| TeamError::InvalidEndpoint(endpoint.to_string()))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(list: Vec<(&'static str, &'static str)>) -> NetworkResolver {
        NetworkResolver::new(Arc::new(StaticInterfaces(
            list.into_iter()
                .map(|(n, ip)| (n.to_string(), ip.parse().unwrap()))
                .collect(),
        )))
    }

    #[test]
    fn filters_loopback_link_local_and_public() {
        let r = resolver(vec![
            ("lo", "127.0.0.1"),
            ("eth0", "169.254.3.4"),
            ("eth1", "8.8.8.8"),
            ("eth2", "fe80::1"),
            ("wlan0", "192.168.1.10"),
        ]);
        let ifaces = r.list_interfaces().unwrap();
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].name, "wlan0");
        assert_eq!(ifaces[0].addresses, vec!["192.168.1.10".to_string()]);
    }

    #[test]
    fn physical_sorted_before_virtual() {
        let r = resolver(vec![
            ("docker0", "172.17.0.1"),
            ("wlan0", "192.168.1.10"),
            ("eth0", "10.0.0.5"),
            ("VBoxNet0", "192.168.56.1"),
        ]);
        let names: Vec<_> = r
            .list_interfaces()
            .unwrap()
            .into_iter()
            .map(|i| (i.name, i.is_virtual))
            .collect();
        assert_eq!(
            names,
            vec![
                ("eth0".to_string(), false),
                ("wlan0".to_string(), false),
                ("VBoxNet0".to_string(), true),
                ("docker0".to_string(), true),
            ]
        );
    }

    #[test]
    fn prefers_same_subnet_regardless_of_order() {
        let r = resolver(vec![("eth0", "10.0.0.5"), ("wlan0", "192.168.1.10")]);
        assert_eq!(r.select_matching_local_ip("192.168.1.77").unwrap(), "192.168.1.10");
        assert_eq!(r.select_matching_local_ip("10.0.0.200").unwrap(), "10.0.0.5");
        // no match falls back to the first address
        assert_eq!(r.select_matching_local_ip("172.16.4.4").unwrap(), "10.0.0.5");
    }

    #[test]
    fn select_rejects_bad_target_and_empty_host() {
        let r = resolver(vec![("eth0", "10.0.0.5")]);
        assert!(matches!(
            r.select_matching_local_ip("not-an-ip"),
            Err(TeamError::InvalidEndpoint(_))
        ));
        let empty = resolver(vec![("lo", "127.0.0.1")]);
        assert!(matches!(
            empty.select_matching_local_ip("192.168.1.1"),
            Err(TeamError::NoValidInterface)
        ));
    }

    #[test]
    fn primary_ip_uses_preference_when_present() {
        let r = resolver(vec![("eth0", "10.0.0.5"), ("wlan0", "192.168.1.10")]);
        let mut cfg = NetworkConfig {
            preferred_ip: "192.168.1.10".into(),
            ..Default::default()
        };
        assert_eq!(r.primary_ip(Some(&cfg)).unwrap(), "192.168.1.10");

        cfg.preferred_ip = "192.168.9.9".into();
        assert_eq!(r.primary_ip(Some(&cfg)).unwrap(), "10.0.0.5");
        assert_eq!(r.primary_ip(None).unwrap(), "10.0.0.5");
    }

    #[test]
    fn build_endpoint_carries_every_address() {
        let r = resolver(vec![("eth0", "10.0.0.5"), ("wlan0", "192.168.1.10")]);
        let ep = r.build_endpoint(None, 19960).unwrap();
        assert_eq!(ep.primary_ip, "10.0.0.5");
        assert_eq!(ep.all_ips.len(), 2);
        assert_eq!(ep.address(), "10.0.0.5:19960");
    }

    #[test]
    fn parse_endpoint_splits_host_and_port() {
        assert_eq!(
            parse_endpoint("192.168.1.4:19960").unwrap(),
            ("192.168.1.4".to_string(), 19960)
        );
        assert!(parse_endpoint("192.168.1.4").is_err());
        assert!(parse_endpoint(":80").is_err());
        assert!(parse_endpoint("host:99999").is_err());
    }

    #[test]
    fn port_check_detects_bound_port() {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(matches!(check_port_available(port), Err(TeamError::PortInUse(p)) if p == port));
        drop(listener);
    }

    #[tokio::test]
    async fn dial_falls_through_to_working_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap().to_string();
        // a port from a dropped listener refuses connections
        let dead = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        let stream = dial_addresses(&[dead.clone(), good], Duration::from_secs(2))
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());

        let err = dial_addresses(&[dead], Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TeamError::AllAddressesFailed(_)));
    }
}
