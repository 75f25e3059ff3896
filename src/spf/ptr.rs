//! PTR validation (RFC 7208 Section 5.5): reverse-map the client IP, then
//! confirm each candidate name with a forward lookup that must return the
//! client IP. Used by the `ptr` mechanism and the `%{p}` macro.

use std::collections::VecDeque;
use std::net::IpAddr;

use crate::common::domain::{domains_equal, is_subdomain_of};

use super::mechanism::Qualifier;

/// At most this many PTR names are considered per validation pass.
pub const MAX_PTR_NAMES: usize = 10;

/// The reverse-mapping zone name for an address:
/// dotted-octet `in-addr.arpa` for IPv4, dotted-nibble `ip6.arpa` for IPv6.
pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa")
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", byte & 0xf));
                nibbles.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

/// Why a validation pass was started; decides what happens when it ends.
#[derive(Debug)]
pub(crate) enum PtrPurpose {
    /// A `ptr` mechanism: verification success is a match.
    Mechanism { qualifier: Qualifier, text: String },
    /// A deferred `%{p}` macro: resume the task list once the pass is done.
    Macro,
}

/// An in-flight PTR validation pass.
#[derive(Debug)]
pub(crate) struct PtrCheck {
    /// Only names equal to or under this domain are considered.
    pub restrict: Option<String>,
    /// Candidate names awaiting forward verification, in answer order.
    pub queue: VecDeque<String>,
    /// The name whose forward lookup is outstanding.
    pub current: Option<String>,
    /// First name whose forward lookup returned the client IP.
    pub verified: Option<String>,
    pub purpose: PtrPurpose,
}

impl PtrCheck {
    pub fn new(restrict: Option<String>, purpose: PtrPurpose) -> Self {
        Self {
            restrict,
            queue: VecDeque::new(),
            current: None,
            verified: None,
            purpose,
        }
    }

    /// Queue PTR answer names for forward verification: filter against the
    /// restricting domain, then cap at [`MAX_PTR_NAMES`].
    pub fn accept_names(&mut self, names: Vec<String>) {
        let restrict = self.restrict.as_deref();
        self.queue = names
            .into_iter()
            .filter(|name| match restrict {
                Some(domain) => domains_equal(name, domain) || is_subdomain_of(name, domain),
                None => true,
            })
            .take(MAX_PTR_NAMES)
            .collect();
    }
}
