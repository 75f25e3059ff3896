//! SPF mechanism and directive types (RFC 7208 Section 5).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::SpfResult;

/// Qualifier prefix on a directive. Defaults to Pass if omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,     // +
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    /// Parse a single-char qualifier prefix. Returns (Qualifier, remaining str).
    /// If no qualifier prefix, defaults to Pass.
    pub fn parse_prefix(s: &str) -> (Qualifier, &str) {
        match s.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &s[1..]),
            Some(b'-') => (Qualifier::Fail, &s[1..]),
            Some(b'~') => (Qualifier::SoftFail, &s[1..]),
            Some(b'?') => (Qualifier::Neutral, &s[1..]),
            _ => (Qualifier::Pass, s),
        }
    }

    /// The result a matching mechanism with this qualifier yields.
    pub fn result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Pass => write!(f, "+"),
            Qualifier::Fail => write!(f, "-"),
            Qualifier::SoftFail => write!(f, "~"),
            Qualifier::Neutral => write!(f, "?"),
        }
    }
}

/// CIDR prefix length pair for A and MX mechanisms.
/// `v4` defaults to 32, `v6` to 128 when not specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

/// SPF mechanism (RFC 7208 Section 5). Domain-spec arguments are kept raw;
/// macros inside them are expanded at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    /// `all`
    All,
    /// `include:<domain-spec>`
    Include(String),
    /// `a[:<domain-spec>][/cidr4][//cidr6]`
    A {
        domain: Option<String>,
        cidr: DualCidr,
    },
    /// `mx[:<domain-spec>][/cidr4][//cidr6]`
    Mx {
        domain: Option<String>,
        cidr: DualCidr,
    },
    /// `ptr[:<domain-spec>]`
    Ptr(Option<String>),
    /// `ip4:<ip4-network>[/cidr]`
    Ip4 { addr: Ipv4Addr, prefix_len: u8 },
    /// `ip6:<ip6-network>[/cidr]`
    Ip6 { addr: Ipv6Addr, prefix_len: u8 },
    /// `exists:<domain-spec>`
    Exists(String),
}

/// A directive = qualifier + mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

/// One step of a record's evaluation plan. A directive containing a `%{p}`
/// macro is preceded by a `ResolvePtr` task so the validated client name is
/// known before the directive dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Directive(Directive),
    /// Run PTR validation for the client IP so `%{p}` can expand.
    ResolvePtr,
}

/// Error type for SPF record parsing. All parse failures map to PermError
/// in evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpfParseError {
    #[error("invalid SPF version: expected 'v=spf1'")]
    InvalidVersion,
    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),
    #[error("invalid mechanism argument: {0}")]
    InvalidArgument(String),
    #[error("duplicate modifier: {0}")]
    DuplicateModifier(String),
    #[error("missing required argument for {0}")]
    MissingArgument(String),
    #[error("invalid CIDR prefix: {0}")]
    InvalidCidr(String),
    #[error("invalid macro string: {0}")]
    InvalidMacro(String),
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::All => write!(f, "all"),
            Mechanism::Include(d) => write!(f, "include:{d}"),
            Mechanism::A { domain, cidr } => {
                write!(f, "a")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                if cidr.v4 != 32 {
                    write!(f, "/{}", cidr.v4)?;
                }
                if cidr.v6 != 128 {
                    write!(f, "//{}", cidr.v6)?;
                }
                Ok(())
            }
            Mechanism::Mx { domain, cidr } => {
                write!(f, "mx")?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                if cidr.v4 != 32 {
                    write!(f, "/{}", cidr.v4)?;
                }
                if cidr.v6 != 128 {
                    write!(f, "//{}", cidr.v6)?;
                }
                Ok(())
            }
            Mechanism::Ptr(d) => {
                write!(f, "ptr")?;
                if let Some(d) = d {
                    write!(f, ":{d}")?;
                }
                Ok(())
            }
            Mechanism::Ip4 { addr, prefix_len } => {
                write!(f, "ip4:{addr}")?;
                if *prefix_len != 32 {
                    write!(f, "/{prefix_len}")?;
                }
                Ok(())
            }
            Mechanism::Ip6 { addr, prefix_len } => {
                write!(f, "ip6:{addr}")?;
                if *prefix_len != 128 {
                    write!(f, "/{prefix_len}")?;
                }
                Ok(())
            }
            Mechanism::Exists(d) => write!(f, "exists:{d}"),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only print qualifier if not Pass (the default)
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier)?;
        }
        write!(f, "{}", self.mechanism)
    }
}
