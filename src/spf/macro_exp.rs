//! SPF macro expansion (RFC 7208 Section 7).
//!
//! `%{p}` is special: it substitutes the validated PTR name of the client
//! IP. Until a PTR validation pass has run, expansion of a string that
//! reaches `%{p}` is *deferred*; the evaluator interposes PTR validation
//! and retries.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::common::domain::{domains_equal, is_subdomain_of, normalize};

/// Characters a transformer may name as split delimiters.
const DELIMITERS: &str = ".-+,/_=";

/// Context for SPF macro expansion.
pub struct MacroContext<'a> {
    pub sender: &'a str,
    pub local_part: &'a str,
    pub sender_domain: &'a str,
    pub client_ip: IpAddr,
    pub helo: &'a str,
    /// Current domain being evaluated (changes during include/redirect).
    pub domain: &'a str,
    /// Local host name for `%{r}`; `unknown` when absent.
    pub hostname: Option<&'a str>,
    /// PTR-validation results so far: name -> forward lookup confirmed.
    pub validated: &'a BTreeMap<String, bool>,
    /// True once an unrestricted PTR validation pass has completed.
    pub ptr_resolved: bool,
}

/// Result of expanding a macro string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    Ready(String),
    /// The string contains `%{p}` and no PTR validation has run yet.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacroError {
    #[error("trailing '%' in macro string")]
    TrailingPercent,
    #[error("invalid macro escape: %{0}")]
    BadEscape(char),
    #[error("unterminated macro expression")]
    Unterminated,
    #[error("empty macro expression")]
    Empty,
    #[error("unknown macro letter: {0}")]
    UnknownLetter(char),
    #[error("macro %{{{0}}} only allowed in exp text")]
    ExpOnly(char),
    #[error("zero-count transform in macro")]
    ZeroCount,
    #[error("invalid delimiter: {0}")]
    BadDelimiter(char),
}

struct MacroTerm {
    letter: char,
    uppercase: bool,
    count: Option<usize>,
    reverse: bool,
    delimiters: String,
}

/// Validate a macro string without expanding it. Used by the record parser
/// for domain-specs and unknown-modifier values.
pub fn check(spec: &str, exp_context: bool) -> Result<(), MacroError> {
    walk(spec, |body| {
        let term = parse_macro_body(body)?;
        letter_allowed(term.letter, exp_context)
    })
}

/// Expand SPF macros in `spec`.
/// `exp_context`: true when expanding explanation TXT (allows c, r, t).
pub fn expand(
    spec: &str,
    ctx: &MacroContext<'_>,
    exp_context: bool,
) -> Result<Expansion, MacroError> {
    let mut out = String::with_capacity(spec.len());
    let mut deferred = false;
    walk_with(spec, &mut out, |body, out| {
        let term = parse_macro_body(body)?;
        letter_allowed(term.letter, exp_context)?;
        let raw = match term.letter {
            's' => ctx.sender.to_string(),
            'l' => ctx.local_part.to_string(),
            'o' => ctx.sender_domain.to_string(),
            'd' => ctx.domain.to_string(),
            'h' => ctx.helo.to_string(),
            'i' => ip_dotted(ctx.client_ip),
            'v' => match ctx.client_ip {
                IpAddr::V4(_) => "in-addr".to_string(),
                IpAddr::V6(_) => "ip6".to_string(),
            },
            'p' => match pick_validated(ctx) {
                Some(name) => name,
                None if !ctx.ptr_resolved => {
                    deferred = true;
                    return Ok(());
                }
                None => "unknown".to_string(),
            },
            'c' => ctx.client_ip.to_string(),
            'r' => ctx.hostname.unwrap_or("unknown").to_string(),
            't' => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string(),
            other => return Err(MacroError::UnknownLetter(other)),
        };
        let transformed = apply_transforms(&raw, &term);
        if term.uppercase {
            out.push_str(&uri_escape(&transformed));
        } else {
            out.push_str(&transformed);
        }
        Ok(())
    })?;
    if deferred {
        Ok(Expansion::Deferred)
    } else {
        Ok(Expansion::Ready(out))
    }
}

/// Walk the macro grammar, invoking `on_macro` for each `%{...}` body.
fn walk(spec: &str, mut on_macro: impl FnMut(&str) -> Result<(), MacroError>) -> Result<(), MacroError> {
    let mut sink = String::new();
    walk_with(spec, &mut sink, |body, _| on_macro(body))
}

fn walk_with(
    spec: &str,
    out: &mut String,
    mut on_macro: impl FnMut(&str, &mut String) -> Result<(), MacroError>,
) -> Result<(), MacroError> {
    let mut chars = spec.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => return Err(MacroError::TrailingPercent),
            Some('%') => out.push('%'),
            Some('_') => out.push(' '),
            Some('-') => out.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => return Err(MacroError::Unterminated),
                    }
                }
                on_macro(&body, out)?;
            }
            Some(other) => return Err(MacroError::BadEscape(other)),
        }
    }
    Ok(())
}

fn parse_macro_body(body: &str) -> Result<MacroTerm, MacroError> {
    let mut chars = body.chars().peekable();
    let letter = chars.next().ok_or(MacroError::Empty)?;
    let uppercase = letter.is_ascii_uppercase();
    let letter = letter.to_ascii_lowercase();

    let mut digit_str = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digit_str.push(c);
            chars.next();
        } else {
            break;
        }
    }
    let count = if digit_str.is_empty() {
        None
    } else {
        let n: usize = digit_str.parse().map_err(|_| MacroError::ZeroCount)?;
        if n == 0 {
            return Err(MacroError::ZeroCount);
        }
        Some(n)
    };

    let reverse = matches!(chars.peek(), Some(&'r') | Some(&'R'));
    if reverse {
        chars.next();
    }

    let mut delimiters = String::new();
    for c in chars {
        if DELIMITERS.contains(c) {
            delimiters.push(c);
        } else {
            return Err(MacroError::BadDelimiter(c));
        }
    }

    Ok(MacroTerm {
        letter,
        uppercase,
        count,
        reverse,
        delimiters,
    })
}

fn letter_allowed(letter: char, exp_context: bool) -> Result<(), MacroError> {
    match letter {
        's' | 'l' | 'o' | 'd' | 'i' | 'p' | 'v' | 'h' => Ok(()),
        'c' | 'r' | 't' if exp_context => Ok(()),
        'c' | 'r' | 't' => Err(MacroError::ExpOnly(letter)),
        other => Err(MacroError::UnknownLetter(other)),
    }
}

/// Choose the `%{p}` substitution from the validated-name table: the
/// current domain itself, else a validated sub-domain of it, else any
/// other validated name.
fn pick_validated(ctx: &MacroContext<'_>) -> Option<String> {
    let names: Vec<&String> = ctx
        .validated
        .iter()
        .filter(|(_, &ok)| ok)
        .map(|(name, _)| name)
        .collect();
    if let Some(name) = names.iter().find(|n| domains_equal(n, ctx.domain)) {
        return Some(normalize(name));
    }
    if let Some(name) = names.iter().find(|n| is_subdomain_of(n, ctx.domain)) {
        return Some(normalize(name));
    }
    names.first().map(|n| normalize(n))
}

/// `%{i}`: dotted-quad for IPv4, dot-separated nibbles for IPv6.
fn ip_dotted(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for seg in v6.segments() {
                nibbles.push(format!("{:x}", (seg >> 12) & 0xf));
                nibbles.push(format!("{:x}", (seg >> 8) & 0xf));
                nibbles.push(format!("{:x}", (seg >> 4) & 0xf));
                nibbles.push(format!("{:x}", seg & 0xf));
            }
            nibbles.join(".")
        }
    }
}

/// Split by the delimiter set, optionally reverse, keep the last N parts,
/// rejoin with dots.
fn apply_transforms(value: &str, term: &MacroTerm) -> String {
    if term.count.is_none() && !term.reverse && (term.delimiters.is_empty() || term.delimiters == ".")
    {
        return value.to_string();
    }
    let delims: Vec<char> = if term.delimiters.is_empty() {
        vec!['.']
    } else {
        term.delimiters.chars().collect()
    };
    let mut parts: Vec<&str> = value.split(|c: char| delims.contains(&c)).collect();
    if term.reverse {
        parts.reverse();
    }
    if let Some(n) = term.count {
        if n < parts.len() {
            parts = parts[parts.len() - n..].to_vec();
        }
    }
    parts.join(".")
}

/// Percent-encode everything outside the URI unreserved set.
fn uri_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ctx(validated: &BTreeMap<String, bool>) -> MacroContext<'_> {
        MacroContext {
            sender: "user@example.com",
            local_part: "user",
            sender_domain: "example.com",
            client_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            helo: "mail.example.com",
            domain: "example.com",
            hostname: Some("mta.receiver.example"),
            validated,
            ptr_resolved: false,
        }
    }

    fn ready(spec: &str, ctx: &MacroContext<'_>, exp: bool) -> String {
        match expand(spec, ctx, exp).unwrap() {
            Expansion::Ready(s) => s,
            Expansion::Deferred => panic!("unexpected deferral for {spec}"),
        }
    }

    #[test]
    fn expand_sender() {
        let v = BTreeMap::new();
        assert_eq!(ready("%{s}", &ctx(&v), false), "user@example.com");
    }

    #[test]
    fn expand_local_and_domain_parts() {
        let v = BTreeMap::new();
        let c = ctx(&v);
        assert_eq!(ready("%{l}", &c, false), "user");
        assert_eq!(ready("%{o}", &c, false), "example.com");
        assert_eq!(ready("%{d}", &c, false), "example.com");
        assert_eq!(ready("%{h}", &c, false), "mail.example.com");
    }

    #[test]
    fn expand_ip_v4() {
        let v = BTreeMap::new();
        assert_eq!(ready("%{i}", &ctx(&v), false), "192.0.2.1");
    }

    #[test]
    fn expand_ip_v6_nibbles() {
        let v = BTreeMap::new();
        let mut c = ctx(&v);
        c.client_ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        assert_eq!(
            ready("%{i}", &c, false),
            "2.0.0.1.0.d.b.8.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.1"
        );
    }

    #[test]
    fn expand_ip_version() {
        let v = BTreeMap::new();
        let mut c = ctx(&v);
        assert_eq!(ready("%{v}", &c, false), "in-addr");
        c.client_ip = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(ready("%{v}", &c, false), "ip6");
    }

    #[test]
    fn expand_reversed_ip() {
        let v = BTreeMap::new();
        assert_eq!(
            ready("%{ir}.origin.example.com", &ctx(&v), false),
            "1.2.0.192.origin.example.com"
        );
    }

    #[test]
    fn expand_rightmost_labels() {
        let v = BTreeMap::new();
        assert_eq!(ready("%{d2}", &ctx(&v), false), "example.com");
    }

    #[test]
    fn expand_reverse_then_count() {
        // split, reverse, then keep the last N
        let v = BTreeMap::new();
        assert_eq!(ready("%{d1r}", &ctx(&v), false), "example");
    }

    #[test]
    fn expand_custom_delimiter() {
        let v = BTreeMap::new();
        let mut c = ctx(&v);
        c.local_part = "foo-bar";
        assert_eq!(ready("%{l-}", &c, false), "foo.bar");
    }

    #[test]
    fn expand_uppercase_uri_escapes() {
        let v = BTreeMap::new();
        assert_eq!(ready("%{S}", &ctx(&v), false), "user%40example.com");
    }

    #[test]
    fn uppercase_equals_escaped_lowercase() {
        let v = BTreeMap::new();
        let c = ctx(&v);
        for (upper, lower) in [("%{S}", "%{s}"), ("%{L}", "%{l}"), ("%{D2}", "%{d2}")] {
            assert_eq!(ready(upper, &c, false), uri_escape(&ready(lower, &c, false)));
        }
    }

    #[test]
    fn expand_escapes() {
        let v = BTreeMap::new();
        let c = ctx(&v);
        assert_eq!(ready("%%", &c, false), "%");
        assert_eq!(ready("%_", &c, false), " ");
        assert_eq!(ready("%-", &c, false), "%20");
        assert_eq!(
            ready("hello%_world%%foo%-bar", &c, false),
            "hello world%foo%20bar"
        );
    }

    #[test]
    fn expand_zero_count_rejected() {
        let v = BTreeMap::new();
        assert_eq!(expand("%{d0}", &ctx(&v), false), Err(MacroError::ZeroCount));
    }

    #[test]
    fn expand_bad_escape_rejected() {
        let v = BTreeMap::new();
        assert_eq!(expand("%x", &ctx(&v), false), Err(MacroError::BadEscape('x')));
        assert_eq!(expand("50%", &ctx(&v), false), Err(MacroError::TrailingPercent));
    }

    #[test]
    fn expand_unknown_letter_rejected() {
        let v = BTreeMap::new();
        assert_eq!(
            expand("%{z}", &ctx(&v), false),
            Err(MacroError::UnknownLetter('z'))
        );
    }

    #[test]
    fn exp_macros_gated() {
        let v = BTreeMap::new();
        let c = ctx(&v);
        assert_eq!(expand("%{c}", &c, false), Err(MacroError::ExpOnly('c')));
        assert_eq!(expand("%{r}", &c, false), Err(MacroError::ExpOnly('r')));
        assert_eq!(expand("%{t}", &c, false), Err(MacroError::ExpOnly('t')));
        assert_eq!(ready("%{c}", &c, true), "192.0.2.1");
        assert_eq!(ready("%{r}", &c, true), "mta.receiver.example");
        let ts: u64 = ready("%{t}", &c, true).parse().unwrap();
        assert!(ts > 1_000_000_000);
    }

    #[test]
    fn exp_hostname_defaults_to_unknown() {
        let v = BTreeMap::new();
        let mut c = ctx(&v);
        c.hostname = None;
        assert_eq!(ready("%{r}", &c, true), "unknown");
    }

    #[test]
    fn p_defers_before_validation() {
        let v = BTreeMap::new();
        assert_eq!(expand("%{p}", &ctx(&v), false), Ok(Expansion::Deferred));
        assert_eq!(
            expand("a.%{p}.b", &ctx(&v), false),
            Ok(Expansion::Deferred)
        );
    }

    #[test]
    fn p_unknown_after_empty_validation() {
        let v = BTreeMap::new();
        let mut c = ctx(&v);
        c.ptr_resolved = true;
        assert_eq!(ready("%{p}", &c, false), "unknown");
    }

    #[test]
    fn p_prefers_current_domain() {
        let mut v = BTreeMap::new();
        v.insert("other.test".to_string(), true);
        v.insert("example.com".to_string(), true);
        v.insert("mail.example.com".to_string(), true);
        assert_eq!(ready("%{p}", &ctx(&v), false), "example.com");
    }

    #[test]
    fn p_falls_back_to_subdomain() {
        let mut v = BTreeMap::new();
        v.insert("other.test".to_string(), true);
        v.insert("mail.example.com".to_string(), true);
        assert_eq!(ready("%{p}", &ctx(&v), false), "mail.example.com");
    }

    #[test]
    fn p_falls_back_to_any_validated() {
        let mut v = BTreeMap::new();
        v.insert("other.test".to_string(), true);
        v.insert("failed.test".to_string(), false);
        assert_eq!(ready("%{p}", &ctx(&v), false), "other.test");
    }

    #[test]
    fn p_ignores_unverified_names() {
        // Only names whose forward lookup confirmed count; an all-false
        // table behaves like an empty one.
        let mut v = BTreeMap::new();
        v.insert("failed.test".to_string(), false);
        assert_eq!(expand("%{p}", &ctx(&v), false), Ok(Expansion::Deferred));
    }

    #[test]
    fn check_accepts_valid_specs() {
        assert!(check("%{ir}.%{v}._spf.%{d2}", false).is_ok());
        assert!(check("plain.example.com", false).is_ok());
        assert!(check("%%literal", false).is_ok());
    }

    #[test]
    fn check_rejects_bad_specs() {
        assert!(check("%{q}", false).is_err());
        assert!(check("%{d0}", false).is_err());
        assert!(check("%{", false).is_err());
        assert!(check("%{c}", false).is_err());
        assert!(check("%{c}", true).is_ok());
        assert!(check("%{d!}", false).is_err());
    }

    #[test]
    fn expand_complex_string() {
        let v = BTreeMap::new();
        assert_eq!(
            ready("%{ir}.%{v}.arpa", &ctx(&v), false),
            "1.2.0.192.in-addr.arpa"
        );
    }
}
