//! Routing rule data model (§3, §4.5).

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{Datelike, Timelike};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderCondition {
    pub pattern: String,
    pub use_regex: bool,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeCondition {
    pub weekdays: Vec<chrono::Weekday>,
    /// Seconds since local midnight, in the rule's declared time zone.
    pub start_of_day_secs: u32,
    pub end_of_day_secs: u32,
    pub timezone_offset_minutes: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    pub uri_pattern: Option<String>,
    pub uri_use_regex: bool,
    pub uri_case_insensitive: bool,
    pub source_cidrs: Option<Vec<IpNet>>,
    pub headers: Option<HashMap<String, HeaderCondition>>,
    pub time: Option<TimeCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderMutations {
    pub add: HashMap<String, String>,
    pub set: HashMap<String, String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextHopAction {
    pub destination_uri: String,
    pub outbound_proxy: Option<String>,
    pub transport_override: Option<String>,
    pub request_timeout_override_secs: Option<u64>,
    pub headers: HeaderMutations,
    pub media_relay_flags: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectAction {
    pub status_code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuleAction {
    NextHop(NextHopAction),
    Reject(RejectAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub priority: i64,
    pub enabled: bool,
    pub conditions: RuleConditions,
    pub action: RuleAction,
}

/// Context a request is evaluated against (§4.5).
pub struct RequestContext<'a> {
    pub request_uri: &'a str,
    pub method: &'a str,
    pub source_ip: IpAddr,
    pub headers: &'a HashMap<String, String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RoutingRule {
    /// Validates the rule's regular expressions so a malformed rule is
    /// rejected before it enters the sorted index (§4.5 determinism
    /// guarantees).
    pub fn validate(&self) -> Result<()> {
        if self.conditions.uri_use_regex {
            if let Some(pattern) = &self.conditions.uri_pattern {
                Regex::new(pattern).map_err(|e| Error::configuration(format!("rule {}: bad URI regex: {e}", self.id)))?;
            }
        }
        if let Some(headers) = &self.conditions.headers {
            for (name, cond) in headers {
                if cond.use_regex {
                    Regex::new(&cond.pattern)
                        .map_err(|e| Error::configuration(format!("rule {}: bad header regex for {name}: {e}", self.id)))?;
                }
            }
        }
        if let RuleAction::Reject(reject) = &self.action {
            if reject.status_code < 100 || reject.status_code > 699 {
                return Err(Error::configuration(format!("rule {}: reject status out of range", self.id)));
            }
        }
        Ok(())
    }

    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.enabled {
            return false;
        }
        self.matches_uri(ctx.request_uri) && self.matches_source_ip(ctx.source_ip) && self.matches_headers(ctx.headers) && self.matches_time(ctx.timestamp)
    }

    fn matches_uri(&self, request_uri: &str) -> bool {
        let Some(pattern) = &self.conditions.uri_pattern else { return true };
        if self.conditions.uri_use_regex {
            let built = if self.conditions.uri_case_insensitive {
                Regex::new(&format!("(?i){pattern}"))
            } else {
                Regex::new(pattern)
            };
            built.map(|re| re.is_match(request_uri)).unwrap_or(false)
        } else if self.conditions.uri_case_insensitive {
            request_uri.eq_ignore_ascii_case(pattern)
        } else {
            request_uri == pattern
        }
    }

    fn matches_source_ip(&self, source_ip: IpAddr) -> bool {
        let Some(cidrs) = &self.conditions.source_cidrs else { return true };
        cidrs.iter().any(|net| net.contains(&source_ip))
    }

    fn matches_headers(&self, headers: &HashMap<String, String>) -> bool {
        let Some(conditions) = &self.conditions.headers else { return true };
        conditions.iter().all(|(name, cond)| {
            headers.get(name).map(|value| Self::header_matches(cond, value)).unwrap_or(false)
        })
    }

    fn header_matches(cond: &HeaderCondition, value: &str) -> bool {
        if cond.use_regex {
            let built = if cond.case_sensitive { Regex::new(&cond.pattern) } else { Regex::new(&format!("(?i){}", cond.pattern)) };
            built.map(|re| re.is_match(value)).unwrap_or(false)
        } else if cond.case_sensitive {
            value == cond.pattern
        } else {
            value.eq_ignore_ascii_case(&cond.pattern)
        }
    }

    fn matches_time(&self, timestamp: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(time) = &self.conditions.time else { return true };
        let local = timestamp + chrono::Duration::minutes(time.timezone_offset_minutes as i64);
        if !time.weekdays.is_empty() && !time.weekdays.contains(&local.weekday()) {
            return false;
        }
        let seconds_of_day = local.hour() * 3600 + local.minute() * 60 + local.second();
        seconds_of_day >= time.start_of_day_secs && seconds_of_day <= time.end_of_day_secs
    }
}

/// Total order over rules for deterministic evaluation: priority descending,
/// then identifier ascending (§3, §4.5, §8 boundary behavior).
pub fn rule_order(a: &RoutingRule, b: &RoutingRule) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn bare_rule(id: &str, priority: i64) -> RoutingRule {
        RoutingRule {
            id: id.to_string(),
            priority,
            enabled: true,
            conditions: RuleConditions::default(),
            action: RuleAction::Reject(RejectAction { status_code: 403, reason: "no".into() }),
        }
    }

    #[test]
    fn rule_order_breaks_ties_by_identifier() {
        let mut rules = vec![bare_rule("b", 100), bare_rule("a", 100), bare_rule("z", 200)];
        rules.sort_by(rule_order);
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[test]
    fn priority_zero_sorts_last() {
        let mut rules = vec![bare_rule("a", 0), bare_rule("b", 50)];
        rules.sort_by(rule_order);
        assert_eq!(rules[0].id, "b");
        assert_eq!(rules[1].id, "a");
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut rule = bare_rule("a", 10);
        rule.enabled = false;
        let ctx = RequestContext {
            request_uri: "sip:anything@x",
            method: "INVITE",
            source_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            headers: &HashMap::new(),
            timestamp: chrono::Utc::now(),
        };
        assert!(!rule.matches(&ctx));
    }

    #[test]
    fn uri_regex_with_case_insensitivity() {
        let mut rule = bare_rule("a", 10);
        rule.conditions.uri_pattern = Some(r"^SIP:\+?1[2-9]\d{9}@".to_string());
        rule.conditions.uri_use_regex = true;
        rule.conditions.uri_case_insensitive = true;
        let ctx = RequestContext {
            request_uri: "sip:+15551234567@proxy",
            method: "INVITE",
            source_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            headers: &HashMap::new(),
            timestamp: chrono::Utc::now(),
        };
        assert!(rule.matches(&ctx));
    }

    #[test]
    fn source_ip_cidr_v4() {
        let mut rule = bare_rule("sec", 1500);
        rule.conditions.source_cidrs = Some(vec!["192.0.2.0/24".parse().unwrap()]);
        let ctx = RequestContext {
            request_uri: "sip:anyone@x",
            method: "INVITE",
            source_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            headers: &HashMap::new(),
            timestamp: chrono::Utc::now(),
        };
        assert!(rule.matches(&ctx));
        let ctx_outside = RequestContext { source_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 3, 10)), ..ctx };
        assert!(!rule.matches(&ctx_outside));
    }

    #[test]
    fn malformed_regex_fails_validation() {
        let mut rule = bare_rule("bad", 1);
        rule.conditions.uri_pattern = Some("(unterminated".to_string());
        rule.conditions.uri_use_regex = true;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn header_condition_requires_every_named_header() {
        let mut rule = bare_rule("h", 10);
        let mut headers = HashMap::new();
        headers.insert("X-Trunk".to_string(), HeaderCondition { pattern: "peer1".into(), use_regex: false, case_sensitive: false });
        rule.conditions.headers = Some(headers);
        let mut req_headers = HashMap::new();
        let ctx_missing = RequestContext {
            request_uri: "sip:x@y",
            method: "INVITE",
            source_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            headers: &req_headers,
            timestamp: chrono::Utc::now(),
        };
        assert!(!rule.matches(&ctx_missing));
        req_headers.insert("X-Trunk".to_string(), "PEER1".to_string());
        let ctx_present = RequestContext { headers: &req_headers, ..ctx_missing };
        assert!(rule.matches(&ctx_present));
    }
}
