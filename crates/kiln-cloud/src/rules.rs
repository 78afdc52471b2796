//! Provider-agnostic firewall rule table.
//!
//! Every provider translates these rules into its own security group or
//! firewall rule format; the table itself decides which ports a role opens.

use std::fmt;

use serde::{Deserialize, Serialize};

use kiln_common::{BootstrapProvider, Cni, Role, API_SERVER_PORT};

/// Matches every IPv4 address
pub const ANY_CIDR: &str = "0.0.0.0/0";

/// Transport protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

/// Traffic direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inbound
    Ingress,
    /// Outbound
    Egress,
}

/// Rule verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Permit matching traffic
    Allow,
    /// Drop matching traffic
    Deny,
}

/// Inclusive port range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port
    pub end: u16,
}

impl PortRange {
    /// A single port
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// `start..=end`
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One firewall rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Label shown in the provider console
    pub description: String,
    /// Protocol
    pub protocol: Protocol,
    /// Direction
    pub direction: Direction,
    /// Verdict
    pub action: RuleAction,
    /// Source (ingress) or destination (egress) range
    pub cidr: String,
    /// Ports
    pub ports: PortRange,
}

/// Port range Kubernetes allocates NodePort services from
pub const NODE_PORTS: PortRange = PortRange::new(30000, 35000);

fn ingress(description: &str, protocol: Protocol, cidr: &str, ports: PortRange) -> FirewallRule {
    FirewallRule {
        description: description.to_string(),
        protocol,
        direction: Direction::Ingress,
        action: RuleAction::Allow,
        cidr: cidr.to_string(),
        ports,
    }
}

fn egress_all(protocol: Protocol) -> FirewallRule {
    FirewallRule {
        description: format!("outbound {:?}", protocol).to_lowercase(),
        protocol,
        direction: Direction::Egress,
        action: RuleAction::Allow,
        cidr: ANY_CIDR.to_string(),
        ports: PortRange::new(1, 65535),
    }
}

fn ssh() -> FirewallRule {
    ingress("ssh", Protocol::Tcp, ANY_CIDR, PortRange::single(22))
}

fn api_server(cidr: &str) -> FirewallRule {
    ingress(
        "kubernetes api server",
        Protocol::Tcp,
        cidr,
        PortRange::single(API_SERVER_PORT),
    )
}

fn kubelet(cidr: &str) -> FirewallRule {
    ingress("kubelet", Protocol::Tcp, cidr, PortRange::single(10250))
}

fn vxlan(cidr: &str) -> FirewallRule {
    ingress("flannel vxlan", Protocol::Udp, cidr, PortRange::single(8472))
}

fn node_ports(cidr: &str) -> FirewallRule {
    ingress("nodeport services", Protocol::Tcp, cidr, NODE_PORTS)
}

fn kube_proxy(cidr: &str) -> FirewallRule {
    ingress("kube-proxy", Protocol::Tcp, cidr, PortRange::single(10256))
}

fn etcd(cidr: &str) -> FirewallRule {
    ingress("etcd", Protocol::Tcp, cidr, PortRange::new(2379, 2380))
}

/// Inputs the rule table depends on besides the role
#[derive(Clone, Debug)]
pub struct RuleContext<'a> {
    /// Network range allowed to reach internal ports
    pub network_cidr: &'a str,
    /// Distribution being installed
    pub bootstrap: BootstrapProvider,
    /// Network plugin requested
    pub cni: &'a Cni,
}

impl RuleContext<'_> {
    /// Flannel and Cilium both encapsulate pod traffic in VXLAN
    fn uses_vxlan(&self) -> bool {
        matches!(self.cni, Cni::Flannel | Cni::Cilium)
    }
}

/// Ordered rules for a role's firewall
pub fn rules_for(role: Role, ctx: &RuleContext<'_>) -> Vec<FirewallRule> {
    let cidr = ctx.network_cidr;
    let mut rules = match role {
        Role::ControlPlane => vec![
            api_server(cidr),
            kubelet(cidr),
            node_ports(cidr),
            ssh(),
            egress_all(Protocol::Udp),
            egress_all(Protocol::Tcp),
        ],
        Role::WorkerPlane => vec![
            kubelet(cidr),
            ssh(),
            node_ports(cidr),
            egress_all(Protocol::Udp),
            egress_all(Protocol::Tcp),
        ],
        Role::LoadBalancer => {
            return vec![
                api_server(ANY_CIDR),
                ssh(),
                egress_all(Protocol::Udp),
                egress_all(Protocol::Tcp),
            ]
        }
        Role::DataStore => {
            return vec![
                etcd(cidr),
                ssh(),
                egress_all(Protocol::Udp),
                egress_all(Protocol::Tcp),
            ]
        }
    };

    if ctx.uses_vxlan() {
        rules.push(vxlan(cidr));
    }
    if role == Role::WorkerPlane && ctx.bootstrap == BootstrapProvider::Kubeadm {
        rules.push(kube_proxy(cidr));
    }
    rules
}
