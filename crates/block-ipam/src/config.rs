//! Plugin and engine configuration
//!
//! Raw network configuration arrives as loosely typed JSON (CIDR strings,
//! booleans that may be strings). It is validated once into
//! [`AssignConfig`] and only the typed form travels into the engine.

use crate::limits;
use crate::models::IpFamily;
use crate::release::AffinityPolicy;
use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

/// Boolean accepted either as a JSON bool or as `"true"` / `"false"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlexBool {
    Bool(bool),
    Text(String),
}

impl FlexBool {
    fn resolve(&self, option: &str) -> Result<bool> {
        match self {
            FlexBool::Bool(value) => Ok(*value),
            FlexBool::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(Error::InvalidConfig(format!(
                    "{} must be true or false, got {:?}",
                    option, other
                ))),
            },
        }
    }
}

/// Network configuration handed to the plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub plugin_type: String,

    #[serde(default)]
    pub ipam: IpamSection,
}

/// The `ipam` section of [`NetConf`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamSection {
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// Defaults to true
    #[serde(default)]
    pub assign_ipv4: Option<FlexBool>,

    /// Defaults to false
    #[serde(default)]
    pub assign_ipv6: Option<FlexBool>,

    #[serde(default)]
    pub ipv4_pools: Option<Vec<String>>,

    #[serde(default)]
    pub ipv6_pools: Option<Vec<String>>,
}

impl NetConf {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Validate into the typed form, applying an out-of-band explicit
    /// address if one was given
    pub fn validate(&self, explicit_ip: Option<IpAddr>) -> Result<AssignConfig> {
        let ipam = &self.ipam;

        let assign_ipv4 = match &ipam.assign_ipv4 {
            Some(flag) => flag.resolve("assign_ipv4")?,
            None => true,
        };
        let assign_ipv6 = match &ipam.assign_ipv6 {
            Some(flag) => flag.resolve("assign_ipv6")?,
            None => false,
        };

        if !assign_ipv4 && !assign_ipv6 {
            return Err(Error::InvalidConfig(
                "at least one of assign_ipv4 and assign_ipv6 must be true".to_string(),
            ));
        }

        let ipv4_pools = parse_pools(ipam.ipv4_pools.as_deref(), IpFamily::V4)?;
        let ipv6_pools = parse_pools(ipam.ipv6_pools.as_deref(), IpFamily::V6)?;

        if let Some(ip) = explicit_ip {
            let requested = match IpFamily::of(&ip) {
                IpFamily::V4 => assign_ipv4,
                IpFamily::V6 => assign_ipv6,
            };
            if !requested {
                return Err(Error::InvalidConfig(format!(
                    "requested address {} but {} assignment is disabled",
                    ip,
                    IpFamily::of(&ip)
                )));
            }
        }

        Ok(AssignConfig {
            assign_ipv4,
            assign_ipv6,
            ipv4_pools,
            ipv6_pools,
            explicit_ip,
        })
    }
}

fn parse_pools(raw: Option<&[String]>, family: IpFamily) -> Result<Vec<IpNet>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.iter()
        .map(|entry| {
            let cidr = IpNet::from_str(entry.trim())
                .map_err(|e| Error::InvalidCidr(format!("{}: {}", entry, e)))?;
            if IpFamily::of_net(&cidr) != family {
                return Err(Error::InvalidConfig(format!(
                    "pool {} listed as {} but is not an {} range",
                    entry, family, family
                )));
            }
            // Host bits stay so errors name the pool as written
            Ok(cidr)
        })
        .collect()
}

/// Validated attach/detach configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignConfig {
    pub assign_ipv4: bool,
    pub assign_ipv6: bool,
    /// Ordered IPv4 pool hints; empty means every enabled pool
    pub ipv4_pools: Vec<IpNet>,
    /// Ordered IPv6 pool hints; empty means every enabled pool
    pub ipv6_pools: Vec<IpNet>,
    /// Caller-chosen address replacing automatic allocation
    pub explicit_ip: Option<IpAddr>,
}

impl Default for AssignConfig {
    fn default() -> Self {
        Self {
            assign_ipv4: true,
            assign_ipv6: false,
            ipv4_pools: Vec::new(),
            ipv6_pools: Vec::new(),
            explicit_ip: None,
        }
    }
}

impl AssignConfig {
    /// IPv4 and IPv6 together
    pub fn dual_stack() -> Self {
        Self {
            assign_ipv6: true,
            ..Self::default()
        }
    }

    pub fn with_explicit_ip(mut self, ip: IpAddr) -> Self {
        self.explicit_ip = Some(ip);
        self
    }

    pub fn with_pools(mut self, family: IpFamily, pools: Vec<IpNet>) -> Self {
        match family {
            IpFamily::V4 => self.ipv4_pools = pools,
            IpFamily::V6 => self.ipv6_pools = pools,
        }
        self
    }

    /// Pool hints for `family`, or `None` when the caller named none
    pub fn pool_hints(&self, family: IpFamily) -> Option<&[IpNet]> {
        let pools = match family {
            IpFamily::V4 => &self.ipv4_pools,
            IpFamily::V6 => &self.ipv6_pools,
        };
        (!pools.is_empty()).then_some(pools.as_slice())
    }

    /// Requested families, IPv4 first
    pub fn families(&self) -> Vec<IpFamily> {
        let mut families = Vec::with_capacity(2);
        if self.assign_ipv4 {
            families.push(IpFamily::V4);
        }
        if self.assign_ipv6 {
            families.push(IpFamily::V6);
        }
        families
    }
}

/// Parsed `CNI_ARGS` style string (`IP=10.0.0.5;K8S_POD_NAME=web`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniArgs {
    /// Explicit address override from the `IP` key
    pub ip: Option<IpAddr>,
    /// Every other key, as given
    pub extra: BTreeMap<String, String>,
}

/// Parse a `;`-separated `KEY=VALUE` argument string
pub fn parse_cni_args(args: &str) -> Result<CniArgs> {
    let mut parsed = CniArgs::default();

    for pair in args.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::InvalidConfig(format!("malformed argument {:?}", pair)))?;

        if key.trim() == "IP" {
            parsed.ip = Some(IpAddr::from_str(value.trim())?);
        } else {
            parsed
                .extra
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(parsed)
}

/// Engine tuning for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name recorded as block affinity owner
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Attempts per conditional block write
    #[serde(default = "default_cas_retries")]
    pub max_cas_retries: u32,

    /// Never allocate from blocks affine to other hosts
    #[serde(default)]
    pub strict_affinity: bool,

    #[serde(default)]
    pub affinity_policy: AffinityPolicy,

    /// Block claim attempts per pool per allocation
    #[serde(default = "default_max_block_claims")]
    pub max_block_claims: u32,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
fn default_cas_retries() -> u32 {
    limits::DEFAULT_CAS_RETRIES
}
fn default_max_block_claims() -> u32 {
    limits::DEFAULT_MAX_BLOCK_CLAIMS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            max_cas_retries: default_cas_retries(),
            strict_affinity: false,
            affinity_policy: AffinityPolicy::default(),
            max_block_claims: default_max_block_claims(),
        }
    }
}

impl EngineConfig {
    pub fn for_host(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(Error::InvalidConfig("hostname must not be empty".to_string()));
        }
        if self.max_cas_retries == 0 {
            return Err(Error::InvalidConfig(
                "max_cas_retries must be at least 1".to_string(),
            ));
        }
        if self.max_block_claims == 0 {
            return Err(Error::InvalidConfig(
                "max_block_claims must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
