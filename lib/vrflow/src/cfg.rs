// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Loading and validating the agent configuration.

use std::path::Path;
use thiserror::Error;
use vrflow_api::AgentCfg;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Parse and validate a TOML configuration. Absent keys take their
/// defaults.
pub fn from_toml_str(s: &str) -> Result<AgentCfg, ConfigError> {
    let cfg: AgentCfg = toml::from_str(s)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Load a configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<AgentCfg, ConfigError> {
    let s = std::fs::read_to_string(path)?;
    from_toml_str(&s)
}

pub fn validate(cfg: &AgentCfg) -> Result<(), ConfigError> {
    if cfg.partitions == 0 {
        return Err(ConfigError::Invalid("partitions must be non-zero".into()));
    }

    let range = cfg.linklocal_port_range;
    if range.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "link-local port range {}-{} is empty",
            range.start, range.end
        )));
    }

    if cfg.max_vm_flows != 0
        && cfg.max_system_flows != 0
        && cfg.max_vm_flows > cfg.max_system_flows
    {
        return Err(ConfigError::Invalid(format!(
            "per-VM flow limit {} exceeds the system limit {}",
            cfg.max_vm_flows, cfg.max_system_flows
        )));
    }

    if cfg.linklocal_vm_flows != 0
        && cfg.linklocal_system_flows != 0
        && cfg.linklocal_vm_flows > cfg.linklocal_system_flows
    {
        return Err(ConfigError::Invalid(format!(
            "per-VM link-local limit {} exceeds the system limit {}",
            cfg.linklocal_vm_flows, cfg.linklocal_system_flows
        )));
    }

    for svc in &cfg.linklocal_services {
        if svc.fabric.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "link-local service {} has no fabric servers",
                svc.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = from_toml_str(
            r#"
            partitions = 2
            max_vm_flows = 100
            "#,
        )
        .unwrap();
        assert_eq!(cfg.partitions, 2);
        assert_eq!(cfg.max_vm_flows, 100);
        assert_eq!(cfg.flow_age_ms, AgentCfg::default().flow_age_ms);
    }

    #[test]
    fn zero_ceiling_is_unlimited() {
        let cfg = from_toml_str("linklocal_system_flows = 0").unwrap();
        assert_eq!(cfg.linklocal_system_flows, 0);
        assert_eq!(
            cfg.linklocal_vm_flows,
            AgentCfg::default().linklocal_vm_flows
        );

        let cfg = from_toml_str("max_system_flows = 0
max_vm_flows = 10").unwrap();
        assert_eq!(cfg.max_system_flows, 0);

        assert!(
            from_toml_str("linklocal_vm_flows = 0
linklocal_system_flows = 5")
                .is_ok()
        );
    }

    #[test]
    fn services_parse() {
        let cfg = from_toml_str(
            r#"
            router_id = "172.16.0.1"

            [[linklocal_services]]
            name = "metadata"
            vip = "169.254.169.254"
            vport = 80
            fabric = [{ ip = "172.16.0.1", port = 8775 }]
            "#,
        )
        .unwrap();
        let svc = cfg
            .linklocal_service("169.254.169.254".parse().unwrap(), 80)
            .unwrap();
        assert_eq!(svc.fabric[0].port, 8775);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            from_toml_str("partitions = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_toml_str("[linklocal_port_range]\nstart = 200\nend = 100"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_toml_str("max_vm_flows = 10\nmax_system_flows = 5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            from_toml_str("linklocal_vm_flows = 10\nlinklocal_system_flows = 5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(from_toml_str("partitions = \"x\""), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            load("/nonexistent/vrflow.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
