//! The call/response contract between the evaluator and the caller's
//! resolver. The engine emits [`Question`]s tagged with a [`CallbackId`];
//! the caller answers with a [`DnsReply`] carrying either a parsed packet
//! or a resolver-side failure. Class is always IN and is not represented.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::domain::normalize;

/// DNS record types the engine queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Txt,
    Spf,
    Mx,
    Ptr,
}

/// An outbound DNS question descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: String,
    pub qtype: QueryType,
}

impl Question {
    /// Names are normalized (lowercased, trailing dot stripped) so replies
    /// built from the echoed question always match the pending entry.
    pub fn new(name: &str, qtype: QueryType) -> Self {
        Self {
            name: normalize(name),
            qtype,
        }
    }
}

/// Response code. Only NOERROR and NXDOMAIN are interpreted; everything
/// else is treated as a transient resolver condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NxDomain,
    Other(u16),
}

/// Type-specific payload of a resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Txt(String),
    Spf(String),
    Mx { preference: u16, exchange: String },
    Ptr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub data: RecordData,
}

/// A parsed DNS response: the original question, the rcode, and the answer
/// and additional sections.
#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub question: Question,
    pub rcode: Rcode,
    pub answers: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl DnsPacket {
    /// An empty NOERROR response to `question`.
    pub fn answer(question: Question) -> Self {
        Self {
            question,
            rcode: Rcode::NoError,
            answers: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// An NXDOMAIN response to `question`.
    pub fn nxdomain(question: Question) -> Self {
        Self {
            question,
            rcode: Rcode::NxDomain,
            answers: Vec::new(),
            additional: Vec::new(),
        }
    }

    pub fn with_answer(mut self, name: &str, data: RecordData) -> Self {
        self.answers.push(ResourceRecord {
            name: name.to_string(),
            data,
        });
        self
    }

    pub fn with_additional(mut self, name: &str, data: RecordData) -> Self {
        self.additional.push(ResourceRecord {
            name: name.to_string(),
            data,
        });
        self
    }

    /// TXT/SPF character strings in the answer section.
    pub fn texts(&self) -> Vec<&str> {
        self.answers
            .iter()
            .filter_map(|rr| match &rr.data {
                RecordData::Txt(s) | RecordData::Spf(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    /// PTR target names in the answer section, normalized.
    pub fn ptr_names(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter_map(|rr| match &rr.data {
                RecordData::Ptr(name) => Some(normalize(name)),
                _ => None,
            })
            .collect()
    }

    /// MX exchange names in the answer section, normalized, in answer order.
    pub fn mx_exchanges(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter_map(|rr| match &rr.data {
                RecordData::Mx { exchange, .. } => Some(normalize(exchange)),
                _ => None,
            })
            .collect()
    }

    /// Addresses for `name`, following CNAME chains and collecting A/AAAA
    /// payloads from both the answer and additional sections.
    pub fn addresses_for(&self, name: &str) -> Vec<IpAddr> {
        let origin = normalize(name);
        let mut target = origin.clone();
        let mut hops = 0;
        'chase: while hops < 10 {
            for rr in self.answers.iter().chain(self.additional.iter()) {
                if let RecordData::Cname(next) = &rr.data {
                    if normalize(&rr.name) == target {
                        target = normalize(next);
                        hops += 1;
                        continue 'chase;
                    }
                }
            }
            break;
        }
        self.answers
            .iter()
            .chain(self.additional.iter())
            .filter(|rr| {
                let owner = normalize(&rr.name);
                owner == target || owner == origin
            })
            .filter_map(|rr| match rr.data {
                RecordData::A(addr) => Some(IpAddr::V4(addr)),
                RecordData::Aaaa(addr) => Some(IpAddr::V6(addr)),
                _ => None,
            })
            .collect()
    }
}

/// What the caller feeds back into [`crate::Evaluator::step`]: either a
/// parsed packet or a resolver-side failure for the named question.
#[derive(Debug, Clone)]
pub enum DnsReply {
    Packet(DnsPacket),
    Failed { question: Question, reason: String },
}

impl DnsReply {
    pub fn question(&self) -> &Question {
        match self {
            DnsReply::Packet(packet) => &packet.question,
            DnsReply::Failed { question, .. } => question,
        }
    }
}

/// Monotonic token pairing outbound queries with inbound responses.
/// Responses carrying a stale token are silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_normalizes_name() {
        let q = Question::new("Mail.Example.COM.", QueryType::A);
        assert_eq!(q.name, "mail.example.com");
    }

    #[test]
    fn texts_collects_txt_and_spf() {
        let packet = DnsPacket::answer(Question::new("example.com", QueryType::Txt))
            .with_answer("example.com", RecordData::Txt("v=spf1 -all".into()))
            .with_answer("example.com", RecordData::Spf("v=spf1 +all".into()))
            .with_answer("example.com", RecordData::A("1.2.3.4".parse().unwrap()));
        assert_eq!(packet.texts(), vec!["v=spf1 -all", "v=spf1 +all"]);
    }

    #[test]
    fn addresses_for_direct() {
        let packet = DnsPacket::answer(Question::new("host.test", QueryType::A))
            .with_answer("host.test", RecordData::A("192.0.2.5".parse().unwrap()));
        assert_eq!(
            packet.addresses_for("host.test"),
            vec!["192.0.2.5".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn addresses_for_follows_cname() {
        let packet = DnsPacket::answer(Question::new("www.test", QueryType::A))
            .with_answer("www.test", RecordData::Cname("real.test".into()))
            .with_additional("real.test", RecordData::A("203.0.113.9".parse().unwrap()));
        assert_eq!(
            packet.addresses_for("www.test"),
            vec!["203.0.113.9".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn addresses_for_cname_chain_in_answers() {
        let packet = DnsPacket::answer(Question::new("a.test", QueryType::A))
            .with_answer("a.test", RecordData::Cname("b.test".into()))
            .with_answer("b.test", RecordData::Cname("c.test".into()))
            .with_answer("c.test", RecordData::A("198.51.100.1".parse().unwrap()));
        assert_eq!(
            packet.addresses_for("a.test"),
            vec!["198.51.100.1".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn addresses_for_cname_loop_terminates() {
        let packet = DnsPacket::answer(Question::new("a.test", QueryType::A))
            .with_answer("a.test", RecordData::Cname("b.test".into()))
            .with_answer("b.test", RecordData::Cname("a.test".into()));
        assert!(packet.addresses_for("a.test").is_empty());
    }

    #[test]
    fn mx_exchanges_in_order() {
        let packet = DnsPacket::answer(Question::new("example.com", QueryType::Mx))
            .with_answer(
                "example.com",
                RecordData::Mx {
                    preference: 10,
                    exchange: "MX1.Example.com.".into(),
                },
            )
            .with_answer(
                "example.com",
                RecordData::Mx {
                    preference: 20,
                    exchange: "mx2.example.com".into(),
                },
            );
        assert_eq!(packet.mx_exchanges(), vec!["mx1.example.com", "mx2.example.com"]);
    }
}
