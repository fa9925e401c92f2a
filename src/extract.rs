use std::fs;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use log::debug;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::types::{InstanceValues, Resource, Snapshot, SubnetMap, SubnetworkValues, VmDescriptor, VmTable};

const SUBNETWORK_TYPE: &str = "google_compute_subnetwork";
const INSTANCE_TYPE: &str = "google_compute_instance";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("VM {vm} references subnet {subnet} which is not defined in the snapshot")]
    UnknownSubnet { vm: String, subnet: String },
    #[error("VM {vm} has no network interface")]
    MissingNetworkInterface { vm: String },
    #[error("Invalid values for resource {name}")]
    InvalidResource {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

pub(crate) fn load_snapshot(path: &str) -> Result<Snapshot, anyhow::Error> {
    let file = fs::File::open(Path::new(path)).with_context(|| format!("Opening {path}"))?;
    let snapshot = serde_json::from_reader(BufReader::new(file)).context("Parsing snapshot")?;

    Ok(snapshot)
}

/// Strip a resource URI down to its final path segment, e.g.
/// `https://www.googleapis.com/compute/v1/projects/p/global/networks/net1` -> `net1`.
pub(crate) fn resolve_id(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// Later duplicates of a subnet name overwrite earlier ones.
pub(crate) fn extract_subnet_map(snapshot: &Snapshot) -> Result<SubnetMap, ExtractError> {
    snapshot
        .resources_of_type(SUBNETWORK_TYPE)
        .map(|res| -> Result<(String, String), ExtractError> {
            let values: SubnetworkValues = typed_values(res)?;
            Ok((res.name.clone(), resolve_id(&values.network).to_string()))
        })
        .collect()
}

/// Only the first network interface of each instance is considered.
pub(crate) fn extract_vms(snapshot: &Snapshot, subnets: &SubnetMap) -> Result<VmTable, ExtractError> {
    let mut vms = VmTable::new();

    for res in snapshot.resources_of_type(INSTANCE_TYPE) {
        let values: InstanceValues = typed_values(res)?;

        let nic = values
            .network_interface
            .first()
            .ok_or_else(|| ExtractError::MissingNetworkInterface {
                vm: res.name.clone(),
            })?;

        let subnet = resolve_id(&nic.subnetwork);
        let vpc = subnets
            .get(subnet)
            .ok_or_else(|| ExtractError::UnknownSubnet {
                vm: res.name.clone(),
                subnet: subnet.to_string(),
            })?;

        let vm = VmDescriptor {
            name: res.name.clone(),
            project: values.project,
            zone: values.zone,
            vpc: vpc.clone(),
            subnet: subnet.to_string(),
            internal_address: nic.network_ip.clone(),
            external_address: nic.access_config.first().map(|ac| ac.nat_ip.clone()),
        };
        debug!("Extracted {vm}");

        vms.insert(vm.name.clone(), vm);
    }

    Ok(vms)
}

fn typed_values<T: DeserializeOwned>(res: &Resource) -> Result<T, ExtractError> {
    serde_json::from_value(res.values.clone()).map_err(|source| ExtractError::InvalidResource {
        name: res.name.clone(),
        source,
    })
}
