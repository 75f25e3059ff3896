//! SPF record parsing (RFC 7208 Section 4.6): the text after `v=spf1` is
//! split on ASCII space and every term becomes a mechanism directive, a
//! `redirect=`/`exp=` modifier, or a discarded unknown modifier.
//!
//! The parser is family-aware: `ip4`/`ip6` terms for the other address
//! family, and `a`/`mx` terms whose only CIDR prefix is for the other
//! family, are syntax-checked and then silently dropped.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::common::cidr::IpFamily;
use crate::common::domain::validate_domain;

use super::macro_exp;
use super::mechanism::{Directive, DualCidr, Mechanism, Qualifier, SpfParseError, Task};

/// Parsed SPF record: the evaluation plan for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRecord {
    pub tasks: Vec<Task>,
    pub redirect: Option<String>,
    pub exp: Option<String>,
    pub raw: String,
}

/// Check if a TXT string is an SPF record (case-insensitive v=spf1 prefix).
pub fn is_spf_record(txt: &str) -> bool {
    let lower = txt.trim().to_ascii_lowercase();
    lower == "v=spf1" || lower.starts_with("v=spf1 ")
}

impl SpfRecord {
    /// Parse an SPF record string (the TXT value, starting with "v=spf1").
    /// Any syntax error invalidates the whole record.
    pub fn parse(txt: &str, family: IpFamily) -> Result<Self, SpfParseError> {
        let txt = txt.trim();
        if !is_spf_record(txt) {
            return Err(SpfParseError::InvalidVersion);
        }
        let body = &txt[6..];

        let mut tasks = Vec::new();
        let mut redirect: Option<String> = None;
        let mut exp: Option<String> = None;

        for term in body.split(' ') {
            if term.is_empty() {
                continue;
            }

            if let Some((name, value)) = split_modifier(term) {
                match name.to_ascii_lowercase().as_str() {
                    "redirect" => {
                        if redirect.is_some() {
                            return Err(SpfParseError::DuplicateModifier("redirect".into()));
                        }
                        check_domain_spec(value, "redirect")?;
                        redirect = Some(value.to_string());
                    }
                    "exp" => {
                        if exp.is_some() {
                            return Err(SpfParseError::DuplicateModifier("exp".into()));
                        }
                        check_domain_spec(value, "exp")?;
                        exp = Some(value.to_string());
                    }
                    _ => {
                        // Unknown modifier: the macro-string must still
                        // parse, the modifier itself is discarded.
                        if !value.is_empty() {
                            macro_exp::check(value, false)
                                .map_err(|e| SpfParseError::InvalidMacro(e.to_string()))?;
                        }
                    }
                }
                continue;
            }

            let (qualifier, rest) = Qualifier::parse_prefix(term);
            if rest.is_empty() {
                return Err(SpfParseError::InvalidArgument(term.to_string()));
            }
            let (mechanism, explicit) = parse_mechanism(rest)?;
            if skipped_for_family(&mechanism, explicit, family) {
                continue;
            }
            if needs_ptr(&mechanism) {
                tasks.push(Task::ResolvePtr);
            }
            tasks.push(Task::Directive(Directive {
                qualifier,
                mechanism,
            }));
        }

        Ok(SpfRecord {
            tasks,
            redirect,
            exp,
            raw: txt.to_string(),
        })
    }

    /// Directives only, in record order. Test convenience.
    #[cfg(test)]
    fn directives(&self) -> Vec<&Directive> {
        self.tasks
            .iter()
            .filter_map(|t| match t {
                Task::Directive(d) => Some(d),
                Task::ResolvePtr => None,
            })
            .collect()
    }
}

/// Try to split a term as a modifier (name=value). A modifier name is
/// alphabetic; known mechanism names (with or without qualifier prefix)
/// are never modifiers.
fn split_modifier(term: &str) -> Option<(&str, &str)> {
    let eq_pos = term.find('=')?;
    let name = &term[..eq_pos];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let name_lower = name.to_ascii_lowercase();
    if is_known_mechanism_name(&name_lower) {
        return None;
    }
    Some((name, &term[eq_pos + 1..]))
}

fn is_known_mechanism_name(name: &str) -> bool {
    matches!(
        name,
        "all" | "include" | "a" | "mx" | "ptr" | "ip4" | "ip6" | "exists"
    )
}

/// Which CIDR prefixes the term spelled out explicitly. Needed for the
/// family-skip rule on `a`/`mx`.
#[derive(Debug, Clone, Copy, Default)]
struct CidrFlags {
    v4: bool,
    v6: bool,
}

/// Split "name:arg", "name/cidr..." or bare "name".
fn split_term(s: &str) -> (&str, Option<&str>) {
    match s.find([':', '/']) {
        Some(pos) if s.as_bytes()[pos] == b':' => (&s[..pos], Some(&s[pos + 1..])),
        Some(pos) => (&s[..pos], Some(&s[pos..])),
        None => (s, None),
    }
}

fn parse_mechanism(term: &str) -> Result<(Mechanism, CidrFlags), SpfParseError> {
    let (name, arg) = split_term(term);
    let flags = CidrFlags::default();
    match name.to_ascii_lowercase().as_str() {
        "all" => {
            if arg.is_some() {
                return Err(SpfParseError::InvalidArgument(
                    "all takes no argument".into(),
                ));
            }
            Ok((Mechanism::All, flags))
        }
        "include" => {
            let domain = required_domain(arg, "include")?;
            Ok((Mechanism::Include(domain), flags))
        }
        "exists" => {
            let domain = required_domain(arg, "exists")?;
            Ok((Mechanism::Exists(domain), flags))
        }
        "ptr" => {
            let domain = match arg.filter(|a| !a.is_empty()) {
                Some(spec) => {
                    check_domain_spec(spec, "ptr")?;
                    Some(spec.to_string())
                }
                None => None,
            };
            Ok((Mechanism::Ptr(domain), flags))
        }
        "a" | "mx" => {
            let is_a = name.eq_ignore_ascii_case("a");
            let (domain_part, cidr4, cidr6) = split_dual_cidr(arg.unwrap_or(""))?;
            if !domain_part.is_empty() {
                check_domain_spec(&domain_part, name)?;
            }
            let cidr = DualCidr {
                v4: cidr4.unwrap_or(32),
                v6: cidr6.unwrap_or(128),
            };
            let flags = CidrFlags {
                v4: cidr4.is_some(),
                v6: cidr6.is_some(),
            };
            let domain = (!domain_part.is_empty()).then_some(domain_part);
            let mechanism = if is_a {
                Mechanism::A { domain, cidr }
            } else {
                Mechanism::Mx { domain, cidr }
            };
            Ok((mechanism, flags))
        }
        "ip4" => {
            let raw = arg
                .filter(|a| !a.is_empty())
                .ok_or_else(|| SpfParseError::MissingArgument("ip4".into()))?;
            let (addr_str, prefix_len) = match raw.find('/') {
                Some(pos) => (&raw[..pos], parse_prefix(&raw[pos + 1..], 32)?),
                None => (raw, 32),
            };
            let addr: Ipv4Addr = addr_str
                .parse()
                .map_err(|_| SpfParseError::InvalidArgument(format!("invalid IPv4: {addr_str}")))?;
            Ok((Mechanism::Ip4 { addr, prefix_len }, flags))
        }
        "ip6" => {
            let raw = arg
                .filter(|a| !a.is_empty())
                .ok_or_else(|| SpfParseError::MissingArgument("ip6".into()))?;
            let (addr_str, prefix_len) = match raw.find('/') {
                Some(pos) => (&raw[..pos], parse_prefix(&raw[pos + 1..], 128)?),
                None => (raw, 128),
            };
            let addr: Ipv6Addr = addr_str
                .parse()
                .map_err(|_| SpfParseError::InvalidArgument(format!("invalid IPv6: {addr_str}")))?;
            Ok((Mechanism::Ip6 { addr, prefix_len }, flags))
        }
        other => Err(SpfParseError::UnknownMechanism(other.to_string())),
    }
}

/// `exists` and `include` take a mandatory domain-spec and no CIDR suffix.
fn required_domain(arg: Option<&str>, mech: &str) -> Result<String, SpfParseError> {
    let domain = arg
        .filter(|a| !a.is_empty())
        .ok_or_else(|| SpfParseError::MissingArgument(mech.into()))?;
    if domain.contains('/') {
        return Err(SpfParseError::InvalidArgument(format!(
            "{mech} takes no CIDR suffix"
        )));
    }
    check_domain_spec(domain, mech)?;
    Ok(domain.to_string())
}

/// Validate a domain-spec before expansion: macro strings must parse, and
/// macro-free specs must already be well-formed DNS names.
fn check_domain_spec(spec: &str, context: &str) -> Result<(), SpfParseError> {
    if spec.is_empty() {
        return Err(SpfParseError::MissingArgument(context.into()));
    }
    if spec.contains('%') {
        macro_exp::check(spec, false).map_err(|e| SpfParseError::InvalidMacro(e.to_string()))
    } else {
        validate_domain(spec)
            .map_err(|e| SpfParseError::InvalidArgument(format!("{context}: {e}")))
    }
}

/// Split "domain/cidr4//cidr6" (any part optional) into its components.
fn split_dual_cidr(s: &str) -> Result<(String, Option<u8>, Option<u8>), SpfParseError> {
    let (before, cidr6) = match s.find("//") {
        Some(pos) => (&s[..pos], Some(parse_prefix(&s[pos + 2..], 128)?)),
        None => (s, None),
    };
    let (domain, cidr4) = match before.rfind('/') {
        Some(pos) => (&before[..pos], Some(parse_prefix(&before[pos + 1..], 32)?)),
        None => (before, None),
    };
    Ok((domain.to_string(), cidr4, cidr6))
}

fn parse_prefix(s: &str, max: u8) -> Result<u8, SpfParseError> {
    let prefix: u8 = s
        .parse()
        .map_err(|_| SpfParseError::InvalidCidr(s.to_string()))?;
    if prefix > max {
        return Err(SpfParseError::InvalidCidr(format!(
            "prefix {prefix} exceeds {max}"
        )));
    }
    Ok(prefix)
}

fn skipped_for_family(mechanism: &Mechanism, explicit: CidrFlags, family: IpFamily) -> bool {
    match mechanism {
        Mechanism::Ip4 { .. } => family == IpFamily::V6,
        Mechanism::Ip6 { .. } => family == IpFamily::V4,
        Mechanism::A { .. } | Mechanism::Mx { .. } => match family {
            IpFamily::V4 => explicit.v6 && !explicit.v4,
            IpFamily::V6 => explicit.v4 && !explicit.v6,
        },
        _ => false,
    }
}

fn needs_ptr(mechanism: &Mechanism) -> bool {
    let spec = match mechanism {
        Mechanism::Include(s) | Mechanism::Exists(s) => Some(s),
        Mechanism::A { domain, .. } | Mechanism::Mx { domain, .. } => domain.as_ref(),
        Mechanism::Ptr(domain) => domain.as_ref(),
        _ => None,
    };
    spec.is_some_and(|s| contains_p_macro(s))
}

fn contains_p_macro(spec: &str) -> bool {
    spec.as_bytes()
        .windows(3)
        .any(|w| w[0] == b'%' && w[1] == b'{' && (w[2] == b'p' || w[2] == b'P'))
}
