//! Plugin configuration.
//!
//! Loaded once at startup from a JSON document. Inline `floatingips`
//! definitions take precedence; when absent, the pool is fetched from the
//! named configmap instead. Unknown fields are ignored.

use fip_ipam::FipConf;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conf {
    /// Inline pool definitions; when non-empty the configmap watcher stays
    /// inactive.
    #[serde(default)]
    pub floatingips: Vec<FipConf>,

    /// Allocation database.
    pub database: DbConf,

    /// Resync period in minutes, minimum 1.
    #[serde(default = "default_resync_interval")]
    pub resync_interval: u64,

    #[serde(default = "default_config_map_name")]
    pub config_map_name: String,

    #[serde(default = "default_config_map_namespace")]
    pub config_map_namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConf {
    /// Connection URL, e.g. `sqlite:///var/lib/floatingip/fip.db`.
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_resync_interval() -> u64 {
    1
}

fn default_config_map_name() -> String {
    "floatingip-config".to_string()
}

fn default_config_map_namespace() -> String {
    "kube-system".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Conf {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let mut conf: Conf = serde_json::from_str(raw)?;
        if conf.resync_interval < 1 {
            conf.resync_interval = 1;
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let conf = Conf::parse(r#"{"database": {"url": "sqlite::memory:"}}"#).unwrap();
        assert!(conf.floatingips.is_empty());
        assert_eq!(conf.resync_interval, 1);
        assert_eq!(conf.config_map_name, "floatingip-config");
        assert_eq!(conf.config_map_namespace, "kube-system");
        assert_eq!(conf.database.max_connections, 5);
    }

    #[test]
    fn resync_interval_is_clamped_to_one() {
        let conf = Conf::parse(
            r#"{"database": {"url": "sqlite::memory:"}, "resyncInterval": 0}"#,
        )
        .unwrap();
        assert_eq!(conf.resync_interval, 1);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let conf = Conf::parse(
            r#"{"database": {"url": "sqlite::memory:"}, "schedulerName": "default"}"#,
        )
        .unwrap();
        assert_eq!(conf.database.url, "sqlite::memory:");
    }

    #[test]
    fn inline_pool_parses() {
        let conf = Conf::parse(
            r#"{
                "floatingips": [
                    {"routableSubnet": "10.0.0.0/24", "ips": ["10.0.0.2~10.0.0.10"], "gateway": "10.0.0.1", "vlan": 3}
                ],
                "database": {"url": "sqlite::memory:"}
            }"#,
        )
        .unwrap();
        assert_eq!(conf.floatingips.len(), 1);
        assert_eq!(conf.floatingips[0].vlan, 3);
    }
}
