//! Invocation of the external routing/DNS helper.
//!
//! The helper (a vpnc-script compatible executable) is spawned once with
//! `reason=connect` when the tunnel comes up and once with
//! `reason=disconnect` when it goes down. All tunnel parameters travel as
//! environment variables; a non-zero exit status is fatal to the session.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{SplitInclude, TunnelConfig};
use crate::error::{Error, Result};
use crate::ppp::NetworkParams;

/// Helper configuration supplied by the hosting application.
#[derive(Debug, Clone, Default)]
pub struct HelperConfig {
    /// Path to the helper executable. `None` disables invocation (the host
    /// handles routing itself).
    pub program: Option<PathBuf>,
    /// How long the helper may run before the session gives up on it.
    pub timeout: Option<Duration>,
}

impl HelperConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(30))
    }
}

fn mask_len(mask: Ipv4Addr) -> u32 {
    u32::from(mask).count_ones()
}

/// Build the helper environment for one invocation.
///
/// With no split-include routes the tunnel takes the default route:
/// `CISCO_SPLIT_INC` stays unset and the netmask collapses to `0.0.0.0`.
pub fn build_env(
    reason: &str,
    gateway: &str,
    tundev: &str,
    config: &TunnelConfig,
    net: &NetworkParams,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut put = |k: &str, v: String| env.push((k.to_string(), v));

    put("reason", reason.to_string());
    put("VPNGATEWAY", gateway.to_string());
    put("TUNDEV", tundev.to_string());

    if let Some(addr) = net.addr.or(config.addr) {
        put("INTERNAL_IP4_ADDRESS", addr.to_string());
        let netmask = config.netmask.unwrap_or(if config.default_route() {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::BROADCAST
        });
        put("INTERNAL_IP4_NETMASK", netmask.to_string());
    }

    let dns: Vec<String> = net
        .dns
        .map(|d| vec![d.to_string()])
        .unwrap_or_else(|| config.dns.iter().map(|d| d.to_string()).collect());
    if !dns.is_empty() {
        put("INTERNAL_IP4_DNS", dns.join(" "));
    }

    if let Some(addr6) = config.addr6 {
        put("INTERNAL_IP6_ADDRESS", addr6.to_string());
        let prefix = config.prefix6.unwrap_or(128);
        put("INTERNAL_IP6_NETMASK", format!("{addr6}/{prefix}"));
    }

    if !config.search_domains.is_empty() {
        put("CISCO_DEF_DOMAIN", config.search_domains.clone());
    }

    let v4_routes: Vec<(Ipv4Addr, Ipv4Addr)> = config
        .split_includes
        .iter()
        .filter_map(|r| match r {
            SplitInclude::V4 { addr, mask } => Some((*addr, *mask)),
            SplitInclude::V6 { .. } => None,
        })
        .collect();
    if !v4_routes.is_empty() {
        put("CISCO_SPLIT_INC", v4_routes.len().to_string());
        for (i, (addr, mask)) in v4_routes.iter().enumerate() {
            put(&format!("CISCO_SPLIT_INC_{i}_ADDR"), addr.to_string());
            put(&format!("CISCO_SPLIT_INC_{i}_MASK"), mask.to_string());
            put(
                &format!("CISCO_SPLIT_INC_{i}_MASKLEN"),
                mask_len(*mask).to_string(),
            );
        }
    }

    let v6_routes: Vec<(std::net::Ipv6Addr, u8)> = config
        .split_includes
        .iter()
        .filter_map(|r| match r {
            SplitInclude::V6 { addr, prefix_len } => Some((*addr, *prefix_len)),
            SplitInclude::V4 { .. } => None,
        })
        .collect();
    if !v6_routes.is_empty() {
        put("CISCO_IPV6_SPLIT_INC", v6_routes.len().to_string());
        for (i, (addr, prefix)) in v6_routes.iter().enumerate() {
            put(&format!("CISCO_IPV6_SPLIT_INC_{i}_ADDR"), addr.to_string());
            put(
                &format!("CISCO_IPV6_SPLIT_INC_{i}_MASKLEN"),
                prefix.to_string(),
            );
        }
    }

    put("IDLE_TIMEOUT", config.idle_timeout_secs.to_string());

    env
}

/// Run the helper once. Exit status 0 is required.
pub async fn run_helper(cfg: &HelperConfig, env: &[(String, String)]) -> Result<()> {
    let program = match &cfg.program {
        Some(p) => p,
        None => {
            debug!("no helper configured, skipping");
            return Ok(());
        }
    };

    let reason = env
        .iter()
        .find(|(k, _)| k == "reason")
        .map(|(_, v)| v.as_str())
        .unwrap_or("?");
    info!(helper = %program.display(), reason, "running helper");

    let mut cmd = Command::new(program);
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let status = tokio::time::timeout(cfg.timeout(), cmd.status())
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::config(format!("helper spawn failed: {e}")))?;

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        warn!(code, "helper exited non-zero");
        return Err(Error::HelperFailed(code));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn get<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn default_route_leaves_split_inc_unset() {
        let config = TunnelConfig {
            addr: Some(Ipv4Addr::new(172, 16, 1, 1)),
            ..Default::default()
        };
        let net = NetworkParams {
            addr: Some(Ipv4Addr::new(172, 16, 1, 1)),
            ..Default::default()
        };
        let env = build_env("connect", "vpn.example.com", "tun0", &config, &net);

        assert_eq!(get(&env, "reason"), Some("connect"));
        assert_eq!(get(&env, "VPNGATEWAY"), Some("vpn.example.com"));
        assert_eq!(get(&env, "TUNDEV"), Some("tun0"));
        assert_eq!(get(&env, "INTERNAL_IP4_ADDRESS"), Some("172.16.1.1"));
        assert_eq!(get(&env, "INTERNAL_IP4_NETMASK"), Some("0.0.0.0"));
        assert_eq!(get(&env, "CISCO_SPLIT_INC"), None);
    }

    #[test]
    fn split_includes_are_enumerated() {
        let config = TunnelConfig {
            addr: Some(Ipv4Addr::new(172, 16, 1, 1)),
            split_includes: vec![
                SplitInclude::V4 {
                    addr: Ipv4Addr::new(10, 11, 10, 10),
                    mask: Ipv4Addr::new(255, 255, 255, 255),
                },
                SplitInclude::V4 {
                    addr: Ipv4Addr::new(10, 11, 1, 0),
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                },
                SplitInclude::V6 {
                    addr: "fdff:ffff::".parse::<Ipv6Addr>().unwrap(),
                    prefix_len: 120,
                },
            ],
            ..Default::default()
        };
        let env = build_env(
            "connect",
            "gw",
            "tun0",
            &config,
            &NetworkParams::default(),
        );

        assert_eq!(get(&env, "CISCO_SPLIT_INC"), Some("2"));
        assert_eq!(get(&env, "CISCO_SPLIT_INC_0_ADDR"), Some("10.11.10.10"));
        assert_eq!(get(&env, "CISCO_SPLIT_INC_0_MASK"), Some("255.255.255.255"));
        assert_eq!(get(&env, "CISCO_SPLIT_INC_0_MASKLEN"), Some("32"));
        assert_eq!(get(&env, "CISCO_SPLIT_INC_1_MASKLEN"), Some("24"));
        assert_eq!(get(&env, "CISCO_IPV6_SPLIT_INC"), Some("1"));
        assert_eq!(get(&env, "CISCO_IPV6_SPLIT_INC_0_ADDR"), Some("fdff:ffff::"));
        assert_eq!(get(&env, "CISCO_IPV6_SPLIT_INC_0_MASKLEN"), Some("120"));
        // Split routes present: the netmask is host-specific, not 0.0.0.0.
        assert_eq!(get(&env, "INTERNAL_IP4_NETMASK"), Some("255.255.255.255"));
    }

    #[test]
    fn negotiated_values_win_over_config() {
        let config = TunnelConfig {
            addr: Some(Ipv4Addr::new(172, 16, 1, 1)),
            dns: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            search_domains: "foo.com bar.com".into(),
            ..Default::default()
        };
        let net = NetworkParams {
            addr: Some(Ipv4Addr::new(172, 16, 9, 9)),
            dns: Some(Ipv4Addr::new(10, 0, 0, 53)),
            ..Default::default()
        };
        let env = build_env("connect", "gw", "tun1", &config, &net);
        assert_eq!(get(&env, "INTERNAL_IP4_ADDRESS"), Some("172.16.9.9"));
        assert_eq!(get(&env, "INTERNAL_IP4_DNS"), Some("10.0.0.53"));
        assert_eq!(get(&env, "CISCO_DEF_DOMAIN"), Some("foo.com bar.com"));
        assert_eq!(get(&env, "IDLE_TIMEOUT"), Some("0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_exit_status_is_checked() {
        let ok = HelperConfig {
            program: Some("/bin/true".into()),
            timeout: None,
        };
        run_helper(&ok, &[]).await.unwrap();

        let bad = HelperConfig {
            program: Some("/bin/false".into()),
            timeout: None,
        };
        assert!(matches!(
            run_helper(&bad, &[]).await,
            Err(Error::HelperFailed(1))
        ));
    }

    #[tokio::test]
    async fn missing_helper_is_skipped() {
        run_helper(&HelperConfig::default(), &[]).await.unwrap();
    }
}
