use std::collections::HashSet;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading the resource configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read resource config: {path}")]
    Read { path: String },
    #[error("Failed to parse resource config")]
    Parse,
    #[error("Resource at position {index} has an empty name")]
    EmptyResourceName { index: usize },
    #[error("Resource name `{name}` is configured more than once")]
    DuplicateResourceName { name: String },
    #[error("Invalid device address `{address}`: {message}")]
    InvalidAddress { address: String, message: String },
}

/// A configured resource name and the fully expanded PCI addresses behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceFile {
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    resource_name: String,
    #[serde(default)]
    addresses: Vec<String>,
}

/// Read and expand the resource configuration at `path`.
///
/// # Errors
///
/// - [`ConfigError::Read`] if the file can't be read
/// - any error of [`parse_resource_config`]
pub fn load_resource_config(path: &Path) -> Result<Vec<ResourceSpec>, Report<ConfigError>> {
    let content = std::fs::read_to_string(path).change_context(ConfigError::Read {
        path: path.display().to_string(),
    })?;
    let resources = parse_resource_config(&content)?;

    tracing::info!(
        "Resource config loaded from {}: {:?}",
        path.display(),
        resources
    );
    Ok(resources)
}

/// Parse the YAML resource configuration and expand every address range.
///
/// # Errors
///
/// - [`ConfigError::Parse`] on malformed YAML
/// - [`ConfigError::EmptyResourceName`] and [`ConfigError::DuplicateResourceName`]
///   when resource names are missing or repeated
/// - [`ConfigError::InvalidAddress`] on a malformed range spec
pub fn parse_resource_config(content: &str) -> Result<Vec<ResourceSpec>, Report<ConfigError>> {
    let file: ResourceFile = serde_yaml::from_str(content).change_context(ConfigError::Parse)?;

    let mut seen = HashSet::new();
    let mut resources = Vec::with_capacity(file.resources.len());
    for (index, raw) in file.resources.into_iter().enumerate() {
        let name = raw.resource_name.trim().to_string();
        if name.is_empty() {
            return Err(Report::new(ConfigError::EmptyResourceName { index }));
        }
        if !seen.insert(name.clone()) {
            return Err(Report::new(ConfigError::DuplicateResourceName { name }));
        }

        let mut addresses = Vec::new();
        for address in &raw.addresses {
            addresses.extend(expand_address(address)?);
        }
        resources.push(ResourceSpec { name, addresses });
    }

    Ok(resources)
}

/// Expand `BASE#RANGESPEC` into concrete PCI addresses.
///
/// The trailing function digit of `BASE` is replaced by every integer of
/// `RANGESPEC`, e.g. `0000:86:00.0#0-1,3` yields `0000:86:00.0`,
/// `0000:86:00.1` and `0000:86:00.3`. Without a range spec only a trailing
/// `0` is dropped, so `0000:86:00.0` becomes `0000:86:00.` while
/// `0000:86:00.1` is kept as is.
///
/// # Errors
///
/// - [`ConfigError::InvalidAddress`] if a range bound isn't an integer or a
///   range is reversed
pub fn expand_address(address: &str) -> Result<Vec<String>, Report<ConfigError>> {
    let (device, range_spec) = match address.split_once('#') {
        Some((device, range_spec)) => (device.trim(), Some(range_spec.trim())),
        None => (address.trim(), None),
    };

    let Some(range_spec) = range_spec.filter(|spec| !spec.is_empty()) else {
        return Ok(vec![device.strip_suffix('0').unwrap_or(device).to_string()]);
    };

    let base = match device.strip_suffix('0') {
        Some(base) => base,
        None => {
            tracing::warn!(
                "{address}: function of {device} is not 0, each range entry replaces it"
            );
            device
                .strip_suffix(|c: char| c.is_ascii_digit())
                .unwrap_or(device)
        }
    };

    let invalid = |message: String| {
        Report::new(ConfigError::InvalidAddress {
            address: address.to_string(),
            message,
        })
    };
    let parse_bound = |bound: &str| {
        bound
            .trim()
            .parse::<u32>()
            .map_err(|e| invalid(format!("`{}` is not a function number: {e}", bound.trim())))
    };

    let mut addresses = Vec::new();
    for part in range_spec.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_bound(start)?;
                let end = parse_bound(end)?;
                if start > end {
                    return Err(invalid(format!("range {start}-{end} is reversed")));
                }
                addresses.extend((start..=end).map(|function| format!("{base}{function}")));
            }
            None => {
                let function = parse_bound(part)?;
                addresses.push(format!("{base}{function}"));
            }
        }
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn expands_ranges_and_single_functions() {
        let addresses = expand_address("0000:86:00.0#0-1,3,4").expect("should expand");
        assert_eq!(
            addresses,
            vec![
                "0000:86:00.0".to_string(),
                "0000:86:00.1".to_string(),
                "0000:86:00.3".to_string(),
                "0000:86:00.4".to_string(),
            ]
        );
    }

    #[test]
    fn address_without_range_drops_function_digit() {
        let addresses = expand_address("0000:86:00.0").expect("should expand");
        assert_eq!(addresses, vec!["0000:86:00.".to_string()]);
    }

    #[test]
    fn address_without_range_keeps_non_zero_function() {
        let addresses = expand_address("0000:86:00.1").expect("should expand");
        assert_eq!(addresses, vec!["0000:86:00.1".to_string()]);
    }

    #[test]
    fn range_replaces_non_zero_function() {
        let addresses = expand_address("0000:86:00.2#0-1").expect("should expand");
        assert_eq!(
            addresses,
            vec!["0000:86:00.0".to_string(), "0000:86:00.1".to_string()]
        );
    }

    #[test]
    fn empty_range_spec_behaves_like_no_range() {
        let addresses = expand_address("0000:3b:00.0#  ").expect("should expand");
        assert_eq!(addresses, vec!["0000:3b:00.".to_string()]);
    }

    #[test]
    fn rejects_malformed_ranges() {
        let err = expand_address("0000:86:00.0#a-2").expect_err("should reject");
        assert!(matches!(
            err.current_context(),
            ConfigError::InvalidAddress { .. }
        ));

        let err = expand_address("0000:86:00.0#4-1").expect_err("should reject reversed");
        assert!(matches!(
            err.current_context(),
            ConfigError::InvalidAddress { .. }
        ));
    }

    #[test]
    fn parses_resource_file() {
        let yaml = r#"
resources:
  - resourceName: nvidia.com/pci-8086
    addresses:
      - "0000:86:00.0#0-1"
  - resourceName: example.com/nic
    addresses:
      - "0000:3b:00.0#2"
      - "0000:3c:00.0#5"
"#;
        let resources = parse_resource_config(yaml).expect("should parse");
        assert_eq!(
            resources,
            vec![
                ResourceSpec {
                    name: "nvidia.com/pci-8086".to_string(),
                    addresses: vec!["0000:86:00.0".to_string(), "0000:86:00.1".to_string()],
                },
                ResourceSpec {
                    name: "example.com/nic".to_string(),
                    addresses: vec!["0000:3b:00.2".to_string(), "0000:3c:00.5".to_string()],
                },
            ]
        );
    }

    #[test]
    fn rejects_duplicate_resource_names() {
        let yaml = r#"
resources:
  - resourceName: example.com/nic
    addresses: ["0000:3b:00.0#0"]
  - resourceName: example.com/nic
    addresses: ["0000:3b:00.0#1"]
"#;
        let err = parse_resource_config(yaml).expect_err("should reject duplicates");
        assert!(matches!(
            err.current_context(),
            ConfigError::DuplicateResourceName { name } if name == "example.com/nic"
        ));
    }

    #[test]
    fn rejects_empty_resource_name() {
        let yaml = "resources:\n  - resourceName: \"\"\n    addresses: []\n";
        let err = parse_resource_config(yaml).expect_err("should reject empty name");
        assert!(matches!(
            err.current_context(),
            ConfigError::EmptyResourceName { index: 0 }
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let err = load_resource_config(&dir.path().join("missing.yaml"))
            .expect_err("should fail to read");
        assert!(matches!(err.current_context(), ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "resources:\n  - resourceName: example.com/nic\n    addresses: [\"0000:3b:00.0#1\"]\n",
        )
        .expect("should write config");

        let resources = load_resource_config(&path).expect("should load");
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].addresses, vec!["0000:3b:00.1".to_string()]);
    }
}
