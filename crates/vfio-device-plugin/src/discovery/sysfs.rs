use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;

use super::DiscoveryError;
use super::PciIntrospector;

/// Reads PCI device facts from sysfs, e.g. `/sys/bus/pci/devices/<address>`.
#[derive(Debug, Clone)]
pub struct SysfsIntrospector {
    base_path: PathBuf,
}

impl SysfsIntrospector {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn device_dir(&self, address: &str) -> PathBuf {
        self.base_path.join(address)
    }

    fn read_attribute(
        &self,
        address: &str,
        attribute: &'static str,
    ) -> Result<String, Report<DiscoveryError>> {
        let path = self.device_dir(address).join(attribute);
        let content = std::fs::read_to_string(&path)
            .change_context(DiscoveryError::Attribute {
                address: address.to_string(),
                attribute,
            })
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;
        Ok(content.trim().to_string())
    }

    /// Basename of the symlink `<device>/<attribute>`, e.g. the bound driver.
    fn link_name(
        &self,
        address: &str,
        attribute: &'static str,
    ) -> Result<String, Report<DiscoveryError>> {
        let path = self.device_dir(address).join(attribute);
        let error = || DiscoveryError::Attribute {
            address: address.to_string(),
            attribute,
        };
        let target = std::fs::read_link(&path)
            .change_context_lazy(error)
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;

        target
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Report::new(error())
                    .attach_printable(format!("unexpected link target: {}", target.display()))
            })
    }
}

fn strip_hex_prefix(value: &str) -> &str {
    value.strip_prefix("0x").unwrap_or(value)
}

impl PciIntrospector for SysfsIntrospector {
    fn pci_id(&self, address: &str) -> Result<String, Report<DiscoveryError>> {
        let vendor = self.read_attribute(address, "vendor")?;
        let device = self.read_attribute(address, "device")?;
        Ok(format!(
            "{}:{}",
            strip_hex_prefix(&vendor),
            strip_hex_prefix(&device)
        ))
    }

    fn driver(&self, address: &str) -> Result<String, Report<DiscoveryError>> {
        self.link_name(address, "driver")
    }

    fn iommu_group(&self, address: &str) -> Result<String, Report<DiscoveryError>> {
        self.link_name(address, "iommu_group")
    }

    fn numa_node(&self, address: &str) -> i64 {
        match self.read_attribute(address, "numa_node") {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!("device {address} reports an invalid NUMA node: {value}");
                -1
            }),
            Err(e) => {
                tracing::debug!("no NUMA node for device {address}: {e:?}");
                -1
            }
        }
    }
}
