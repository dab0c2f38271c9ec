//! Shared API DTOs used across the control-plane and the universal agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Project scope owned by the platform itself; system resources live here.
pub const SERVICE_PROJECT_ID: Uuid = Uuid::nil();

/// Lifecycle status shared by every reconciled resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    /// Resource created, not yet claimed by the reconciler.
    New,
    /// Claimed by a reconciler worker; realization underway.
    InProgress,
    /// Agent-observed actual matches the target.
    Active,
    /// Realization failed permanently; reason recorded on the resource.
    Error,
    /// Marked for removal; terminal once every dependent is gone.
    Deleting,
}

impl ResourceStatus {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::New => "NEW",
            ResourceStatus::InProgress => "IN_PROGRESS",
            ResourceStatus::Active => "ACTIVE",
            ResourceStatus::Error => "ERROR",
            ResourceStatus::Deleting => "DELETING",
        }
    }
}

/// Closed enumeration of reconciled resource kinds.
///
/// New kinds are added by extending this enumeration and the driver registry
/// on the agent side; kinds are never registered dynamically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A managed compute host realized through a machine-pool driver.
    #[serde(rename = "em_core_compute_nodes")]
    ComputeNode,
    /// The projection of a service onto one node.
    #[serde(rename = "em_core_service_nodes")]
    ServiceNode,
    /// A systemd service declaration; fans out into service nodes.
    #[serde(rename = "em_core_services")]
    Service,
    /// A generated password secret.
    #[serde(rename = "password")]
    Password,
    /// An issued certificate bundle.
    #[serde(rename = "certificate")]
    Certificate,
    /// A load balancer; parent of vhosts.
    #[serde(rename = "lb_load_balancers")]
    LoadBalancer,
    /// A virtual host inside a load balancer.
    #[serde(rename = "lb_vhosts")]
    Vhost,
    /// A routing rule inside a vhost.
    #[serde(rename = "lb_routes")]
    Route,
    /// A pool of backends referenced by routes.
    #[serde(rename = "lb_backend_pools")]
    BackendPool,
    /// An allocatable machine group behind a pool driver.
    #[serde(rename = "em_core_machine_pools")]
    MachinePool,
    /// A named set of nodes usable as a service target.
    #[serde(rename = "em_core_node_sets")]
    NodeSet,
    /// A flat bridge or dummy network.
    #[serde(rename = "network_networks")]
    Network,
    /// An addressed segment of a network; the CIDR is immutable.
    #[serde(rename = "network_subnets")]
    Subnet,
    /// A node attachment to a subnet holding one exclusive lease.
    #[serde(rename = "network_interfaces")]
    Interface,
}

impl ResourceKind {
    /// Returns the capability label used on the wire and in the scheduler.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ComputeNode => "em_core_compute_nodes",
            ResourceKind::ServiceNode => "em_core_service_nodes",
            ResourceKind::Service => "em_core_services",
            ResourceKind::Password => "password",
            ResourceKind::Certificate => "certificate",
            ResourceKind::LoadBalancer => "lb_load_balancers",
            ResourceKind::Vhost => "lb_vhosts",
            ResourceKind::Route => "lb_routes",
            ResourceKind::BackendPool => "lb_backend_pools",
            ResourceKind::MachinePool => "em_core_machine_pools",
            ResourceKind::NodeSet => "em_core_node_sets",
            ResourceKind::Network => "network_networks",
            ResourceKind::Subnet => "network_subnets",
            ResourceKind::Interface => "network_interfaces",
        }
    }

    /// Parses a capability label back into a kind.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "em_core_compute_nodes" => Some(ResourceKind::ComputeNode),
            "em_core_service_nodes" => Some(ResourceKind::ServiceNode),
            "em_core_services" => Some(ResourceKind::Service),
            "password" => Some(ResourceKind::Password),
            "certificate" => Some(ResourceKind::Certificate),
            "lb_load_balancers" => Some(ResourceKind::LoadBalancer),
            "lb_vhosts" => Some(ResourceKind::Vhost),
            "lb_routes" => Some(ResourceKind::Route),
            "lb_backend_pools" => Some(ResourceKind::BackendPool),
            "em_core_machine_pools" => Some(ResourceKind::MachinePool),
            "em_core_node_sets" => Some(ResourceKind::NodeSet),
            "network_networks" => Some(ResourceKind::Network),
            "network_subnets" => Some(ResourceKind::Subnet),
            "network_interfaces" => Some(ResourceKind::Interface),
            _ => None,
        }
    }

    /// Kinds that are realized on a node by a capability driver.
    ///
    /// The remaining kinds (services and the load balancer tree) are expanded
    /// or validated entirely inside the orchestrator.
    pub fn is_agent_kind(&self) -> bool {
        matches!(
            self,
            ResourceKind::ComputeNode
                | ResourceKind::ServiceNode
                | ResourceKind::Password
                | ResourceKind::Certificate
        )
    }
}

/// The envelope every resource travels in between planes.
///
/// Targets and actuals share this shape; an actual's `version` records the
/// target version it converged against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEnvelope {
    /// Identifier shared by the target/actual pair.
    pub uuid: Uuid,
    /// Resource kind; immutable after creation.
    pub kind: ResourceKind,
    /// Owning project scope.
    pub project_id: Uuid,
    /// Monotone version counter; bumped by every successful update.
    pub version: i64,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Kind-specific payload.
    pub spec: Value,
    /// When this copy of the resource was last observed or written.
    pub observed_at: DateTime<Utc>,
}

/// Hardware profile of a compute node target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    /// Human-readable node name.
    pub name: String,
    /// CPU core count.
    pub cores: u32,
    /// RAM in megabytes.
    pub ram: u64,
    /// Root disk size in gigabytes.
    #[serde(default)]
    pub disk_size: u64,
    /// Machine pool the node is allocated from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<Uuid>,
    /// Image reference booted onto the machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Weak references to attached network interfaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Uuid>,
}

/// Target payload for a generated password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordSpec {
    /// Secret name; doubles as the file name in the agent store.
    pub name: String,
    /// Generated password length.
    #[serde(default = "default_password_length")]
    pub length: usize,
}

fn default_password_length() -> usize {
    24
}

/// Actual payload reported for a realized password.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordActual {
    /// Secret name.
    pub name: String,
    /// SHA-256 checksum of the stored secret material.
    pub checksum: String,
}

/// Target payload for an issued certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateSpec {
    /// Certificate common name.
    pub common_name: String,
    /// Additional DNS names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    /// Validity window in days.
    #[serde(default = "default_expire_days")]
    pub expire_days: u32,
}

fn default_expire_days() -> u32 {
    90
}

/// Actual payload reported for an issued certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateActual {
    /// Certificate common name.
    pub common_name: String,
    /// Expiry of the issued bundle.
    pub not_after: DateTime<Utc>,
    /// Fingerprint of the issued bundle.
    pub fingerprint: String,
}

/// Service replica semantics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// One replica per target node, restarted on exit.
    Simple,
    /// One replica per target node, terminated on first success.
    Oneshot,
    /// Exactly one replica globally, elected deterministically.
    Monopoly,
    /// Exactly one replica globally with one-shot semantics.
    MonopolyOneshot,
}

impl ServiceType {
    /// True for the two kinds that must have at most one replica fleet-wide.
    pub fn is_monopoly(&self) -> bool {
        matches!(self, ServiceType::Monopoly | ServiceType::MonopolyOneshot)
    }

    /// True for the two kinds terminated on first success.
    pub fn is_oneshot(&self) -> bool {
        matches!(self, ServiceType::Oneshot | ServiceType::MonopolyOneshot)
    }
}

/// A `before`/`after` hook attached to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceHook {
    /// Run a shell command.
    Shell {
        /// The command line to execute.
        cmd: String,
    },
    /// Order against another service. Not supported yet; rejected at
    /// validation time until the ordering subsystem lands.
    Service {
        /// Referenced service identifier.
        #[serde(rename = "ref")]
        reference: Uuid,
    },
}

/// Deployment target of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceTarget {
    /// Deploy onto a single node.
    Node {
        /// The node identifier.
        node: Uuid,
    },
    /// Deploy onto every member of a node set.
    NodeSet {
        /// Member node identifiers.
        nodes: Vec<Uuid>,
    },
}

impl ServiceTarget {
    /// Member nodes of the target in declaration order.
    pub fn members(&self) -> Vec<Uuid> {
        match self {
            ServiceTarget::Node { node } => vec![*node],
            ServiceTarget::NodeSet { nodes } => nodes.clone(),
        }
    }
}

/// A systemd service declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service name; becomes the unit name on the node.
    pub name: String,
    /// Replica semantics.
    pub service_type: ServiceType,
    /// Where the service is deployed.
    pub target: ServiceTarget,
    /// Command path executed by the unit.
    pub command: String,
    /// Unix user the unit runs as.
    #[serde(default = "default_service_user")]
    pub user: String,
    /// Unix group the unit runs as.
    #[serde(default = "default_service_user")]
    pub group: String,
    /// Hooks executed before the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<ServiceHook>,
    /// Hooks executed after the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<ServiceHook>,
}

fn default_service_user() -> String {
    "root".to_string()
}

/// Projection of a service onto one node; produced by the orchestrator and
/// consumed by the agent's service driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceNodeSpec {
    /// The parent service.
    pub service_id: Uuid,
    /// The node this replica lands on.
    pub node_id: Uuid,
    /// Service name; becomes the unit name.
    pub name: String,
    /// Replica semantics inherited from the parent.
    pub service_type: ServiceType,
    /// Command path executed by the unit.
    pub command: String,
    /// Unix user the unit runs as.
    pub user: String,
    /// Unix group the unit runs as.
    pub group: String,
    /// Hooks executed before the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<ServiceHook>,
    /// Hooks executed after the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<ServiceHook>,
}

/// Vhost protocol; raw route conditions are legal only for tcp/udp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VhostProtocol {
    /// HTTP termination.
    Http,
    /// HTTPS termination.
    Https,
    /// Raw TCP passthrough.
    Tcp,
    /// Raw UDP passthrough.
    Udp,
}

impl VhostProtocol {
    /// True for the stream protocols that admit raw route conditions.
    pub fn is_stream(&self) -> bool {
        matches!(self, VhostProtocol::Tcp | VhostProtocol::Udp)
    }
}

/// A virtual host inside a load balancer; (protocol, port) is unique per LB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VhostSpec {
    /// Parent load balancer.
    pub lb_id: Uuid,
    /// Listening protocol.
    pub protocol: VhostProtocol,
    /// Listening port.
    pub port: u16,
}

/// Route matching condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteCondition {
    /// Match a path prefix.
    Prefix {
        /// The prefix to match.
        value: String,
    },
    /// Match an exact path.
    Exact {
        /// The path to match.
        value: String,
    },
    /// Match a path regex.
    Regex {
        /// The pattern to match.
        value: String,
    },
    /// Raw stream match; legal only on tcp/udp vhosts.
    Raw {
        /// Opaque matcher payload.
        value: String,
    },
}

/// A routing rule inside a vhost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSpec {
    /// Parent vhost.
    pub vhost_id: Uuid,
    /// Matching condition.
    pub condition: RouteCondition,
    /// Backend pool receiving matched traffic.
    pub pool_id: Uuid,
}

/// A load balancer declaration; the root of the containment tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    /// Human-readable name.
    pub name: String,
}

/// A pool of backends referenced by routes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendPoolSpec {
    /// Parent load balancer.
    pub lb_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Backend addresses, `host:port`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// Machine-pool driver backends; immutable after creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolDriver {
    /// In-tree allocation stub.
    Dummy,
    /// Libvirt-backed hypervisor pool (out-of-tree driver).
    Libvirt,
}

/// An allocatable group of machines behind one pool driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachinePoolSpec {
    /// Human-readable name.
    pub name: String,
    /// Backing driver; immutable after creation.
    pub driver: PoolDriver,
}

/// A named set of nodes usable as a service deployment target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSetSpec {
    /// Human-readable name.
    pub name: String,
    /// Member node identifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Uuid>,
}

/// Network topology kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkDriver {
    /// Flat bridge topology.
    Flat,
    /// Dummy topology for development.
    Dummy,
}

/// A flat bridge or dummy network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Human-readable name.
    pub name: String,
    /// Topology driver.
    pub driver: NetworkDriver,
}

/// An addressed segment of a network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubnetSpec {
    /// Parent network.
    pub network_id: Uuid,
    /// IPv4 CIDR, immutable after creation.
    pub cidr: String,
}

/// A node attachment to a subnet. IP leases are exclusive per subnet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceSpec {
    /// The attached node.
    pub node_id: Uuid,
    /// The subnet leased from.
    pub subnet_id: Uuid,
    /// Leased address; allocated from the subnet when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Registration payload sent by an agent on startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRegistration {
    /// Node identifier; registration is idempotent on this value.
    pub uuid: Uuid,
    /// Human-readable agent name.
    pub name: String,
    /// Advertised capability labels, wildcards allowed (`em_core_*`).
    pub capabilities: Vec<String>,
}

/// Heartbeat payload sent periodically by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentHeartbeat {
    /// Node identifier.
    pub uuid: Uuid,
    /// Agent-side wall clock at send time.
    pub timestamp: DateTime<Utc>,
}

/// Targets assigned to one agent for one capability kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignedTargetsResponse {
    /// Assigned target envelopes.
    pub targets: Vec<ResourceEnvelope>,
}

/// Post-diff actual set pushed by an agent to the status endpoint.
///
/// The set is authoritative per (agent, kind): actuals the agent no longer
/// reports are removed from the actual plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    /// Reporting agent.
    pub agent_uuid: Uuid,
    /// Capability kind the report covers.
    pub kind: ResourceKind,
    /// Observed actual envelopes.
    pub actuals: Vec<ResourceEnvelope>,
}

/// Token issued by the user API against a static credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    /// Opaque bearer token.
    pub token: String,
    /// Expiry of the token.
    pub expires_at: DateTime<Utc>,
}

/// Kinds of domain events delivered through the outbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A user completed registration.
    #[serde(rename = "IamUserRegistration")]
    IamUserRegistration,
    /// A user requested a password reset.
    #[serde(rename = "IamUserResetPassword")]
    IamUserResetPassword,
    /// A certificate was issued for a target.
    #[serde(rename = "SecretCertificateIssued")]
    SecretCertificateIssued,
}

impl EventKind {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IamUserRegistration => "IamUserRegistration",
            EventKind::IamUserResetPassword => "IamUserResetPassword",
            EventKind::SecretCertificateIssued => "SecretCertificateIssued",
        }
    }

    /// Parses a wire representation back into a kind.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IamUserRegistration" => Some(EventKind::IamUserRegistration),
            "IamUserResetPassword" => Some(EventKind::IamUserResetPassword),
            "SecretCertificateIssued" => Some(EventKind::SecretCertificateIssued),
            _ => None,
        }
    }
}

/// Payload of [`EventKind::IamUserRegistration`], version 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationEventPayload {
    /// Site the confirmation link points at.
    pub site_endpoint: String,
    /// One-time confirmation code.
    pub confirmation_code: Uuid,
}

/// Payload of [`EventKind::IamUserResetPassword`], version 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetPasswordEventPayload {
    /// Site the reset link points at.
    pub site_endpoint: String,
    /// One-time reset code.
    pub reset_code: Uuid,
}

/// Payload of [`EventKind::SecretCertificateIssued`], version 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateIssuedPayload {
    /// The certificate target that converged.
    pub certificate_id: Uuid,
    /// Expiry of the issued bundle.
    pub not_after: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_labels_round_trip() {
        for kind in [
            ResourceKind::ComputeNode,
            ResourceKind::ServiceNode,
            ResourceKind::Service,
            ResourceKind::Password,
            ResourceKind::Certificate,
            ResourceKind::LoadBalancer,
            ResourceKind::Vhost,
            ResourceKind::Route,
            ResourceKind::BackendPool,
            ResourceKind::MachinePool,
            ResourceKind::NodeSet,
            ResourceKind::Network,
            ResourceKind::Subnet,
            ResourceKind::Interface,
        ] {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("em_core_unknown"), None);
    }

    #[test]
    fn envelope_wire_round_trip() {
        let envelope = ResourceEnvelope {
            uuid: Uuid::new_v4(),
            kind: ResourceKind::ComputeNode,
            project_id: Uuid::new_v4(),
            version: 3,
            status: ResourceStatus::Active,
            spec: serde_json::to_value(NodeSpec {
                name: "n1".into(),
                cores: 1,
                ram: 1024,
                disk_size: 10,
                pool_id: None,
                image: Some("ubuntu-24.04".into()),
                interfaces: vec![],
            })
            .unwrap(),
            observed_at: Utc::now(),
        };

        let json = serde_json::to_string(&envelope).unwrap();
        let back: ResourceEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn status_uses_screaming_snake_case_on_the_wire() {
        let json = serde_json::to_string(&ResourceStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn service_hook_is_a_tagged_union() {
        let shell: ServiceHook = serde_json::from_value(serde_json::json!({
            "kind": "shell",
            "cmd": "/usr/bin/true",
        }))
        .unwrap();
        assert_eq!(
            shell,
            ServiceHook::Shell {
                cmd: "/usr/bin/true".into()
            }
        );

        let reference = Uuid::new_v4();
        let service: ServiceHook = serde_json::from_value(serde_json::json!({
            "kind": "service",
            "ref": reference,
        }))
        .unwrap();
        assert_eq!(service, ServiceHook::Service { reference });
    }

    #[test]
    fn monopoly_types_are_flagged() {
        assert!(ServiceType::Monopoly.is_monopoly());
        assert!(ServiceType::MonopolyOneshot.is_monopoly());
        assert!(!ServiceType::Simple.is_monopoly());
        assert!(ServiceType::MonopolyOneshot.is_oneshot());
        assert!(!ServiceType::Monopoly.is_oneshot());
    }

    #[test]
    fn raw_conditions_belong_to_stream_protocols() {
        assert!(VhostProtocol::Tcp.is_stream());
        assert!(VhostProtocol::Udp.is_stream());
        assert!(!VhostProtocol::Http.is_stream());
        assert!(!VhostProtocol::Https.is_stream());
    }
}
