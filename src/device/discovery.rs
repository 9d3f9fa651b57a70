use std::collections::{HashMap, HashSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::device::advertisement::{is_pairing_mode, manufacturer_payload};
use crate::device::constants::{COMPANY_ID, DEVICE_NAME_PREFIX};
use crate::device::types::{Advertisement, DeviceAddress};

/// Decides whether an advertisement comes from a shade.
pub trait CandidateFilter {
    fn is_candidate(&self, name: Option<&str>, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool;
}

pub struct ManufacturerIdFilter {
    pub company_id: u16,
}

impl CandidateFilter for ManufacturerIdFilter {
    fn is_candidate(&self, _name: Option<&str>, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
        manufacturer_payload(manufacturer_data, self.company_id).is_some()
    }
}

pub struct NamePrefixFilter {
    pub prefix: String,
}

impl CandidateFilter for NamePrefixFilter {
    fn is_candidate(&self, name: Option<&str>, _manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
        match name {
            Some(name) => !self.prefix.is_empty() && name.starts_with(&self.prefix),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryMode {
    ManufacturerId,
    NamePrefix,
    Any,
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            DiscoveryMode::ManufacturerId => "manufacturer id",
            DiscoveryMode::NamePrefix => "name prefix",
            DiscoveryMode::Any => "manufacturer id or name prefix",
        };

        write!(f, "{}", result)
    }
}

/// The filters a [`DiscoveryMode`] selects, with the identifiers to match on.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub mode: DiscoveryMode,
    pub company_id: u16,
    pub name_prefix: String,
}

impl Default for Discovery {
    fn default() -> Self {
        Discovery {
            mode: DiscoveryMode::Any,
            company_id: COMPANY_ID,
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
        }
    }
}

impl Discovery {
    fn filters(&self) -> Vec<Box<dyn CandidateFilter>> {
        let by_id = || -> Box<dyn CandidateFilter> {
            Box::new(ManufacturerIdFilter { company_id: self.company_id })
        };
        let by_name = || -> Box<dyn CandidateFilter> {
            Box::new(NamePrefixFilter { prefix: self.name_prefix.clone() })
        };

        match self.mode {
            DiscoveryMode::ManufacturerId => vec![by_id()],
            DiscoveryMode::NamePrefix => vec![by_name()],
            DiscoveryMode::Any => vec![by_id(), by_name()],
        }
    }

    /// True if the manufacturer payload has the pairing flag set.
    pub fn is_pairing(&self, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
        manufacturer_payload(manufacturer_data, self.company_id)
            .map(is_pairing_mode)
            .unwrap_or(false)
    }
}

impl CandidateFilter for Discovery {
    fn is_candidate(&self, name: Option<&str>, manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
        self.filters()
            .iter()
            .any(|filter| filter.is_candidate(name, manufacturer_data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub label: String,
    pub in_pairing: bool,
}

/// Builds the list of shades that could be set up, in the order they were first seen.
/// Later advertisements of the same address replace earlier ones.
pub fn discover_candidates<'a, I>(
    advertisements: I,
    discovery: &Discovery,
    exclude: &HashSet<DeviceAddress>,
) -> IndexMap<DeviceAddress, DiscoveredDevice>
where
    I: IntoIterator<Item = &'a Advertisement>,
{
    let mut discovered = IndexMap::new();

    for advertisement in advertisements {
        if exclude.contains(&advertisement.address) {
            continue;
        }
        if !discovery.is_candidate(advertisement.name.as_deref(), &advertisement.manufacturer_data) {
            continue;
        }

        let in_pairing = discovery.is_pairing(&advertisement.manufacturer_data);
        let mut label = format!(
            "{} ({})",
            advertisement.name.as_deref().unwrap_or("Unknown"),
            advertisement.address,
        );
        if in_pairing {
            label.push_str(" [Pairing mode]");
        }

        discovered.insert(advertisement.address.clone(), DiscoveredDevice { label, in_pairing });
    }

    discovered
}
