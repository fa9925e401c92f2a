use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

/// Root of the `terraform show --json` document.
#[derive(Deserialize, Debug)]
pub struct Snapshot {
    pub(crate) values: StateValues,
}

#[derive(Deserialize, Debug)]
pub struct StateValues {
    pub(crate) root_module: RootModule,
}

#[derive(Deserialize, Debug)]
pub struct RootModule {
    #[serde(default)]
    pub(crate) resources: Vec<Resource>,
}

/// A single resource record. The shape of `values` depends on `type`.
#[derive(Deserialize, Debug)]
pub struct Resource {
    #[serde(rename = "type")]
    pub(crate) resource_type: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) values: serde_json::Value,
}

impl Snapshot {
    pub(crate) fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = &'a Resource> + 'a {
        self.values
            .root_module
            .resources
            .iter()
            .filter(move |r| r.resource_type == resource_type)
    }
}

#[derive(Deserialize, Debug)]
pub struct SubnetworkValues {
    pub(crate) network: String,
}

#[derive(Deserialize, Debug)]
pub struct InstanceValues {
    pub(crate) zone: String,
    pub(crate) project: String,
    #[serde(default)]
    pub(crate) network_interface: Vec<NetworkInterface>,
}

#[derive(Deserialize, Debug)]
pub struct NetworkInterface {
    pub(crate) network_ip: String,
    pub(crate) subnetwork: String,
    #[serde(default)]
    pub(crate) access_config: Vec<AccessConfig>,
}

#[derive(Deserialize, Debug)]
pub struct AccessConfig {
    pub(crate) nat_ip: String,
}

/// Subnet name -> parent network name.
pub type SubnetMap = HashMap<String, String>;

/// VM name -> descriptor.
pub type VmTable = HashMap<String, VmDescriptor>;

#[derive(Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct VmDescriptor {
    pub(crate) name: String,
    pub(crate) project: String,
    pub(crate) zone: String,
    pub(crate) vpc: String,
    pub(crate) subnet: String,
    pub(crate) internal_address: String,
    pub(crate) external_address: Option<String>,
}

impl fmt::Display for VmDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VmDescriptor{{name:{}, project:{}, zone:{}, vpc:{}, subnet:{}, ip_int:{}, ip_ext:{}}}",
            self.name,
            self.project,
            self.zone,
            self.vpc,
            self.subnet,
            self.internal_address,
            self.external_address.as_deref().unwrap_or("None"),
        )
    }
}

/// Where a VM is expected to live.
#[derive(Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ExpectedEntry {
    pub(crate) vm: String,
    pub(crate) sub: String,
    pub(crate) vpc: String,
}

impl ExpectedEntry {
    pub(crate) fn new(vm: &str, sub: &str, vpc: &str) -> Self {
        Self {
            vm: vm.to_string(),
            sub: sub.to_string(),
            vpc: vpc.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Connected,
    Refused,
    TimedOut,
    /// Destination has no address of the requested kind.
    Unreachable,
    /// The client produced no classifying line: the remote execution itself
    /// most likely failed.
    Transport,
}

#[derive(Debug, Clone)]
pub struct ConnectivityOutcome {
    pub(crate) failed: bool,
    pub(crate) kind: OutcomeKind,
    pub(crate) detail: String,
}

impl ConnectivityOutcome {
    pub(crate) fn new(kind: OutcomeKind, detail: String) -> Self {
        Self {
            failed: kind != OutcomeKind::Connected,
            kind,
            detail,
        }
    }
}
