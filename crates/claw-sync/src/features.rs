//! Optional backend subsystems discovered through `/health`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// An optional service that may run next to the core API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    /// DNS zone management.
    Dns,
    /// DHCP subnet management.
    Dhcp,
    /// Machine provisioner.
    Provisioner,
    /// Rule engine.
    Engine,
}

impl Subsystem {
    /// Every subsystem.
    pub const ALL: [Self; 4] = [Self::Dns, Self::Dhcp, Self::Provisioner, Self::Engine];

    /// Key the health map uses for this service.
    #[must_use]
    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Dns => "dns-mgmt-service",
            Self::Dhcp => "dhcp-mgmt-service",
            Self::Provisioner => "provisioner-mgmt-service",
            Self::Engine => "rule-engine-service",
        }
    }

    /// Endpoints loaded when the subsystem is present.
    #[must_use]
    pub const fn endpoints(self) -> &'static [&'static str] {
        match self {
            Self::Dns => &["/dns/zones"],
            Self::Dhcp => &["/dhcp/subnets"],
            Self::Provisioner => &[
                "/provisioner/machines",
                "/provisioner/templates",
                "/provisioner/bootenvs",
            ],
            Self::Engine => &["/rule-engine/api/v0/rulesets/"],
        }
    }
}

/// Which optional subsystems the backend reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// DNS management available.
    pub dns: bool,
    /// DHCP management available.
    pub dhcp: bool,
    /// Provisioner available.
    pub provisioner: bool,
    /// Rule engine available.
    pub engine: bool,
}

impl FeatureFlags {
    /// Read flags from a `/health` body of the form `{"Map": {service: ...}}`.
    pub fn from_health(health: &Value) -> SyncResult<Self> {
        let map = health
            .get("Map")
            .and_then(Value::as_object)
            .ok_or_else(|| SyncError::Decode("health response has no Map".to_string()))?;

        let mut flags = Self::default();
        for subsystem in Subsystem::ALL {
            flags.set(subsystem, map.contains_key(subsystem.service_name()));
        }
        Ok(flags)
    }

    /// Whether a subsystem is enabled.
    #[must_use]
    pub const fn enabled(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Dns => self.dns,
            Subsystem::Dhcp => self.dhcp,
            Subsystem::Provisioner => self.provisioner,
            Subsystem::Engine => self.engine,
        }
    }

    /// Enable or disable a subsystem.
    pub fn set(&mut self, subsystem: Subsystem, enabled: bool) {
        match subsystem {
            Subsystem::Dns => self.dns = enabled,
            Subsystem::Dhcp => self.dhcp = enabled,
            Subsystem::Provisioner => self.provisioner = enabled,
            Subsystem::Engine => self.engine = enabled,
        }
    }

    /// Enabled subsystems, in [`Subsystem::ALL`] order.
    pub fn iter_enabled(self) -> impl Iterator<Item = Subsystem> {
        Subsystem::ALL.into_iter().filter(move |s| self.enabled(*s))
    }
}

/// Provisioner collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerData {
    /// Known machines.
    pub machines: Value,
    /// Templates.
    pub templates: Value,
    /// Boot environments.
    pub bootenvs: Value,
}

/// Data loaded from the optional subsystems. Empty when disabled or when a
/// load failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryData {
    /// DNS zones.
    pub dns_zones: Value,
    /// DHCP subnets.
    pub dhcp_subnets: Value,
    /// Provisioner collections.
    pub provisioner: ProvisionerData,
    /// Rule engine rulesets.
    pub engine_rulesets: Value,
}

impl AuxiliaryData {
    /// Store a loaded endpoint body in its slot.
    pub fn put(&mut self, endpoint: &str, body: Value) {
        let slot = match endpoint {
            "/dns/zones" => &mut self.dns_zones,
            "/dhcp/subnets" => &mut self.dhcp_subnets,
            "/provisioner/machines" => &mut self.provisioner.machines,
            "/provisioner/templates" => &mut self.provisioner.templates,
            "/provisioner/bootenvs" => &mut self.provisioner.bootenvs,
            "/rule-engine/api/v0/rulesets/" => &mut self.engine_rulesets,
            _ => return,
        };
        *slot = body;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flags_from_health() {
        let health = json!({"Map": {"dns-mgmt-service": {}, "provisioner-mgmt-service": []}});
        let flags = FeatureFlags::from_health(&health).unwrap();

        assert!(flags.dns);
        assert!(!flags.dhcp);
        assert!(flags.provisioner);
        assert!(!flags.engine);
        assert_eq!(
            flags.iter_enabled().collect::<Vec<_>>(),
            vec![Subsystem::Dns, Subsystem::Provisioner]
        );
    }

    #[test]
    fn test_health_without_map_is_error() {
        assert!(FeatureFlags::from_health(&json!({"status": "ok"})).is_err());
    }

    #[test]
    fn test_every_endpoint_has_a_slot() {
        let mut data = AuxiliaryData::default();
        for subsystem in Subsystem::ALL {
            for endpoint in subsystem.endpoints() {
                data.put(endpoint, json!([endpoint]));
            }
        }

        assert_eq!(data.dns_zones, json!(["/dns/zones"]));
        assert_eq!(data.dhcp_subnets, json!(["/dhcp/subnets"]));
        assert_eq!(data.provisioner.bootenvs, json!(["/provisioner/bootenvs"]));
        assert_eq!(data.engine_rulesets, json!(["/rule-engine/api/v0/rulesets/"]));
    }
}
