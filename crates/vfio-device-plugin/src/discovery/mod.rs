//! Maps configured PCI addresses to hardware facts and groups them by resource name.

mod sysfs;

use std::collections::BTreeMap;
use std::collections::HashMap;

use clap::ValueEnum;
use derive_more::Display;
use error_stack::Report;
use thiserror::Error;

use crate::config::ResourceSpec;

pub use sysfs::SysfsIntrospector;

/// Driver a device must be bound to before it can be passed through.
pub const VFIO_DRIVER: &str = "vfio-pci";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to read {attribute} of device {address}")]
    Attribute {
        address: String,
        attribute: &'static str,
    },
    #[error("Device {address} is not bound to vfio-pci (actual driver: {driver})")]
    WrongDriver { address: String, driver: String },
    #[error("{failed} configured devices failed discovery")]
    Incomplete { failed: usize },
}

/// Host introspection of a single PCI address.
pub trait PciIntrospector: Send + Sync {
    /// `vendor:device` identifier, e.g. `8086:1572`.
    fn pci_id(&self, address: &str) -> Result<String, Report<DiscoveryError>>;
    /// Name of the kernel driver the device is bound to.
    fn driver(&self, address: &str) -> Result<String, Report<DiscoveryError>>;
    fn iommu_group(&self, address: &str) -> Result<String, Report<DiscoveryError>>;
    /// NUMA node of the device, `-1` when the platform doesn't report one.
    fn numa_node(&self, address: &str) -> i64;
}

/// What to do with devices that fail discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, ValueEnum)]
pub enum DiscoveryPolicy {
    /// Any failing device blocks startup until a later attempt succeeds.
    #[default]
    #[display("strict")]
    Strict,
    /// Failing devices are logged and left out.
    #[display("best-effort")]
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DiscoveredDevice {
    pub address: String,
    pub vendor_device_id: String,
    pub driver: String,
    pub iommu_group: String,
    pub numa_node: i64,
}

#[derive(Debug)]
pub struct DiscoveryFailure {
    pub address: String,
    pub resource_name: String,
    pub error: Report<DiscoveryError>,
}

/// Outcome of one pass over every configured address.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub devices: BTreeMap<String, Vec<DiscoveredDevice>>,
    pub failures: Vec<DiscoveryFailure>,
}

impl DiscoveryReport {
    /// Apply `policy` to the report.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::Incomplete`] under [`DiscoveryPolicy::Strict`] when
    ///   at least one device failed
    pub fn accept(
        self,
        policy: DiscoveryPolicy,
    ) -> Result<BTreeMap<String, Vec<DiscoveredDevice>>, Report<DiscoveryError>> {
        if self.failures.is_empty() {
            return Ok(self.devices);
        }

        match policy {
            DiscoveryPolicy::Strict => Err(Report::new(DiscoveryError::Incomplete {
                failed: self.failures.len(),
            })),
            DiscoveryPolicy::BestEffort => {
                tracing::warn!(
                    "{} configured devices failed discovery and are skipped",
                    self.failures.len()
                );
                Ok(self.devices)
            }
        }
    }
}

/// All devices advertised under one resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroup {
    pub resource_name: String,
    pub devices: Vec<DiscoveredDevice>,
}

/// Look up every configured address through `introspector`.
///
/// Failing devices are logged and reported in [`DiscoveryReport::failures`],
/// never fabricated.
pub fn discover_devices(
    resources: &[ResourceSpec],
    introspector: &dyn PciIntrospector,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    let mut owners: HashMap<&str, &str> = HashMap::new();

    for resource in resources {
        for address in &resource.addresses {
            if let Some(owner) = owners.get(address.as_str()) {
                tracing::warn!(
                    "device {address} is configured for both {owner} and {}, keeping {owner}",
                    resource.name
                );
                continue;
            }
            owners.insert(address.as_str(), resource.name.as_str());

            match inspect_device(address, introspector) {
                Ok(device) => {
                    tracing::info!(
                        "Discovered configured device {address} with resource name {}",
                        resource.name
                    );
                    report
                        .devices
                        .entry(resource.name.clone())
                        .or_default()
                        .push(device);
                }
                Err(error) => {
                    tracing::error!("Device {address} failed discovery: {error:?}");
                    report.failures.push(DiscoveryFailure {
                        address: address.clone(),
                        resource_name: resource.name.clone(),
                        error,
                    });
                }
            }
        }
    }

    report
}

fn inspect_device(
    address: &str,
    introspector: &dyn PciIntrospector,
) -> Result<DiscoveredDevice, Report<DiscoveryError>> {
    let vendor_device_id = introspector.pci_id(address)?;

    let driver = introspector.driver(address)?;
    if driver != VFIO_DRIVER {
        return Err(Report::new(DiscoveryError::WrongDriver {
            address: address.to_string(),
            driver,
        }));
    }

    let iommu_group = introspector.iommu_group(address)?;
    let numa_node = introspector.numa_node(address);

    Ok(DiscoveredDevice {
        address: address.to_string(),
        vendor_device_id,
        driver,
        iommu_group,
        numa_node,
    })
}

/// Build one group per configured resource name, in configuration order.
///
/// A name without any discovered device still gets an empty group, so it is
/// advertised with zero units instead of not at all.
pub fn build_resource_groups(
    resources: &[ResourceSpec],
    mut devices: BTreeMap<String, Vec<DiscoveredDevice>>,
) -> Vec<ResourceGroup> {
    resources
        .iter()
        .map(|resource| {
            let mut devices = devices.remove(&resource.name).unwrap_or_default();
            devices.sort();
            tracing::info!(
                "Discovered {} PCI devices on the node for the resource: {}",
                devices.len(),
                resource.name
            );
            ResourceGroup {
                resource_name: resource.name.clone(),
                devices,
            }
        })
        .collect()
}
