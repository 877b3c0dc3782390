use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{bail, Context};

use crate::config::RuleSettings;

/// The rule a target matched and the upstreams allowed to serve it.
///
/// An empty upstream list is an explicit deny.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    pub rule: &'a str,
    pub upstreams: &'a [String],
}

/// Reserved rule name applied when nothing else matches.
const DEFAULT_RULE: &str = "default";

struct Rule {
    name: String,
    domains: Vec<String>,
    networks: Vec<IpNet>,
    upstreams: Vec<String>,
}

/// Maps target addresses to rules. Built once at startup, read-only after.
pub struct RuleMatcher {
    rules: Vec<Rule>,
    default_rule: Option<Rule>,
}

impl RuleMatcher {
    pub fn new(settings: &BTreeMap<String, RuleSettings>) -> anyhow::Result<Self> {
        let mut rules = Vec::new();
        let mut default_rule = None;
        for (name, rs) in settings {
            let networks = rs
                .ips
                .iter()
                .map(|s| IpNet::parse(s))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("invalid IP list in rule '{name}'"))?;
            let rule = Rule {
                name: name.clone(),
                domains: rs.domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
                networks,
                upstreams: rs.upstreams.clone(),
            };
            if name == DEFAULT_RULE {
                if !rule.domains.is_empty() || !rule.networks.is_empty() {
                    bail!("the '{DEFAULT_RULE}' rule must not list domains or IPs");
                }
                default_rule = Some(rule);
            } else {
                rules.push(rule);
            }
        }
        Ok(Self {
            rules,
            default_rule,
        })
    }

    /// Every upstream name referenced by any rule, for startup validation.
    pub fn all_upstreams(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .chain(self.default_rule.iter())
            .flat_map(|r| r.upstreams.iter())
            .map(String::as_str)
    }

    pub fn match_ip(&self, ip: IpAddr) -> Option<RuleMatch<'_>> {
        self.rules
            .iter()
            .find(|r| r.networks.iter().any(|n| n.contains(ip)))
            .or(self.default_rule.as_ref())
            .map(Rule::as_match)
    }

    pub fn match_domain(&self, domain: &str) -> Option<RuleMatch<'_>> {
        let domain = domain.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|r| r.domains.iter().any(|d| domain_matches(&domain, d)))
            .or(self.default_rule.as_ref())
            .map(Rule::as_match)
    }
}

impl Rule {
    fn as_match(&self) -> RuleMatch<'_> {
        RuleMatch {
            rule: &self.name,
            upstreams: &self.upstreams,
        }
    }
}

/// `rule` matches itself and any subdomain of itself.
fn domain_matches(target: &str, rule: &str) -> bool {
    target == rule
        || (target.len() > rule.len()
            && target.ends_with(rule)
            && target.as_bytes()[target.len() - rule.len() - 1] == b'.')
}

/// An IP network in CIDR notation. A bare address is a host network.
struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    fn parse(s: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().with_context(|| format!("invalid IP: {s}"))?;
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("invalid prefix length: {s}"))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().with_context(|| format!("invalid IP: {s}"))?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix)
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            bail!("prefix length out of range: {s}");
        }
        Ok(Self { addr, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn matcher(toml: &str) -> RuleMatcher {
        let settings: Settings = toml::from_str(&format!(
            r#"
            [downstreams.d]
            protocol = "socks5"
            listen = "127.0.0.1:0"
            [upstreams.u1]
            protocol = "direct"
            {toml}
            "#
        ))
        .unwrap();
        RuleMatcher::new(&settings.rules).unwrap()
    }

    #[test]
    fn cidr_parsing_and_containment() {
        let net = IpNet::parse("10.0.0.0/8").unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));

        let host = IpNet::parse("192.168.1.1").unwrap();
        assert!(host.contains("192.168.1.1".parse().unwrap()));
        assert!(!host.contains("192.168.1.2".parse().unwrap()));

        let v6 = IpNet::parse("fd00::/16").unwrap();
        assert!(v6.contains("fd00::1234".parse().unwrap()));
        assert!(!v6.contains("fe80::1".parse().unwrap()));

        assert!(IpNet::parse("10.0.0.0/33").is_err());
        assert!(IpNet::parse("not-an-ip/8").is_err());
    }

    #[test]
    fn ip_match_picks_first_matching_rule() {
        let m = matcher(
            r#"
            [rules.internal]
            ips = ["10.0.0.0/8"]
            upstreams = []
            [rules.lan]
            ips = ["192.168.0.0/16"]
            upstreams = ["u1"]
            "#,
        );
        let hit = m.match_ip("10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(hit.rule, "internal");
        assert!(hit.upstreams.is_empty());

        let hit = m.match_ip("192.168.3.4".parse().unwrap()).unwrap();
        assert_eq!(hit.rule, "lan");
        assert_eq!(hit.upstreams, ["u1".to_owned()]);

        assert!(m.match_ip("8.8.8.8".parse().unwrap()).is_none());
    }

    #[test]
    fn domain_suffix_match() {
        let m = matcher(
            r#"
            [rules.ads]
            domains = ["ads.example.com"]
            upstreams = []
            "#,
        );
        assert!(m.match_domain("ads.example.com").is_some());
        assert!(m.match_domain("tracker.ads.example.com").is_some());
        assert!(m.match_domain("ADS.Example.COM").is_some());
        // Suffix match stops at label boundaries.
        assert!(m.match_domain("bads.example.com").is_none());
        assert!(m.match_domain("example.com").is_none());
    }

    #[test]
    fn default_rule_catches_everything_unmatched() {
        let m = matcher(
            r#"
            [rules.block]
            domains = ["blocked.example.com"]
            upstreams = []
            [rules.default]
            upstreams = ["u1"]
            "#,
        );
        let hit = m.match_domain("anything.org").unwrap();
        assert_eq!(hit.rule, "default");
        assert_eq!(hit.upstreams, ["u1".to_owned()]);

        let hit = m.match_ip("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(hit.rule, "default");

        // Explicit rules still win over the default.
        assert_eq!(m.match_domain("blocked.example.com").unwrap().rule, "block");
    }

    #[test]
    fn default_rule_may_not_carry_matchers() {
        let settings: Settings = toml::from_str(
            r#"
            [downstreams.d]
            protocol = "socks5"
            listen = "127.0.0.1:0"
            [upstreams.u1]
            protocol = "direct"
            [rules.default]
            domains = ["example.com"]
            upstreams = ["u1"]
            "#,
        )
        .unwrap();
        assert!(RuleMatcher::new(&settings.rules).is_err());
    }

    #[test]
    fn all_upstreams_lists_rule_references() {
        let m = matcher(
            r#"
            [rules.a]
            domains = ["a.com"]
            upstreams = ["u1", "u2"]
            [rules.default]
            upstreams = ["u3"]
            "#,
        );
        let mut names: Vec<_> = m.all_upstreams().collect();
        names.sort();
        assert_eq!(names, ["u1", "u2", "u3"]);
    }
}
