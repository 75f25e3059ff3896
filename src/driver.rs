//! Async driver for callers that do not need the engine's inversion of
//! control: a [`DnsClient`] resolves one [`Question`] at a time and
//! [`check_host`] loops the evaluator to completion.
//!
//! [`HickoryClient`] is the production client. Because the engine expects
//! the `mx` additional section to carry the exchanges' addresses, the
//! client resolves them itself and synthesizes that section.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioResolver;

use crate::common::dns::{
    DnsPacket, DnsReply, Question, QueryType, RecordData, ResourceRecord,
};
use crate::common::domain::normalize;
use crate::spf::{CheckParams, Evaluator, SpfOutcome, SpfResult, Step};

/// Resolves one DNS question into a wire-shaped reply.
pub trait DnsClient: Send + Sync {
    fn query(&self, question: &Question) -> impl Future<Output = DnsReply> + Send;
}

/// Run a full SPF check, driving the evaluator against `client`.
pub async fn check_host<C: DnsClient>(client: &C, params: CheckParams<'_>) -> SpfOutcome {
    let mut evaluator = Evaluator::new(params);
    let mut step = evaluator.start();
    loop {
        match step {
            Step::Done(outcome) => return outcome,
            Step::Query { queries, callback } => {
                let mut next = None;
                for question in queries {
                    tracing::trace!(name = %question.name, qtype = ?question.qtype, "resolving");
                    let reply = client.query(&question).await;
                    match evaluator.step(callback, reply) {
                        Step::Pending => continue,
                        other => {
                            next = Some(other);
                            break;
                        }
                    }
                }
                // With every pending query answered the engine always
                // produces a definite step.
                step = next.unwrap_or_else(|| {
                    Step::Done(SpfOutcome {
                        result: SpfResult::TempError,
                        comment: "resolver made no progress".into(),
                        problem: Some("evaluation stalled".into()),
                    })
                });
            }
            Step::Pending => {
                return SpfOutcome {
                    result: SpfResult::TempError,
                    comment: "resolver made no progress".into(),
                    problem: Some("evaluation stalled".into()),
                }
            }
        }
    }
}

/// [`DnsClient`] backed by `hickory-resolver`.
#[derive(Clone)]
pub struct HickoryClient {
    resolver: TokioResolver,
}

impl HickoryClient {
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { resolver }
    }

    async fn query_mx(&self, question: &Question) -> DnsReply {
        let lookup = match self.resolver.mx_lookup(question.name.as_str()).await {
            Ok(lookup) => lookup,
            Err(error) => return failure_reply(question, error),
        };
        let exchanges: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_string()))
            .collect();
        let mut packet = DnsPacket::answer(question.clone());
        for (preference, exchange) in &exchanges {
            packet.answers.push(ResourceRecord {
                name: question.name.clone(),
                data: RecordData::Mx {
                    preference: *preference,
                    exchange: exchange.clone(),
                },
            });
        }
        // The engine matches mx against the additional section only.
        for (_, exchange) in exchanges.iter().take(10) {
            if let Ok(lookup) = self.resolver.ipv4_lookup(exchange.as_str()).await {
                for a in lookup.iter() {
                    packet.additional.push(ResourceRecord {
                        name: exchange.clone(),
                        data: RecordData::A(a.0),
                    });
                }
            }
            if let Ok(lookup) = self.resolver.ipv6_lookup(exchange.as_str()).await {
                for aaaa in lookup.iter() {
                    packet.additional.push(ResourceRecord {
                        name: exchange.clone(),
                        data: RecordData::Aaaa(aaaa.0),
                    });
                }
            }
        }
        DnsReply::Packet(packet)
    }
}

impl Default for HickoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsClient for HickoryClient {
    async fn query(&self, question: &Question) -> DnsReply {
        let name = question.name.as_str();
        let records: Result<Vec<RecordData>, _> = match question.qtype {
            QueryType::A => self
                .resolver
                .ipv4_lookup(name)
                .await
                .map(|l| l.iter().map(|a| RecordData::A(a.0)).collect()),
            QueryType::Aaaa => self
                .resolver
                .ipv6_lookup(name)
                .await
                .map(|l| l.iter().map(|aaaa| RecordData::Aaaa(aaaa.0)).collect()),
            // The SPF RR type is history (RFC 7208 Section 3.1); answer
            // both record questions from TXT.
            QueryType::Txt | QueryType::Spf => self
                .resolver
                .txt_lookup(name)
                .await
                .map(|l| l.iter().map(|txt| RecordData::Txt(txt.to_string())).collect()),
            QueryType::Ptr => self
                .resolver
                .lookup(name, RecordType::PTR)
                .await
                .map(|l| {
                    l.iter()
                        .filter_map(|rdata| match rdata {
                            RData::PTR(ptr) => Some(RecordData::Ptr(ptr.0.to_string())),
                            _ => None,
                        })
                        .collect()
                }),
            QueryType::Mx => return self.query_mx(question).await,
        };
        match records {
            Ok(records) => {
                let mut packet = DnsPacket::answer(question.clone());
                for data in records {
                    packet.answers.push(ResourceRecord {
                        name: question.name.clone(),
                        data,
                    });
                }
                DnsReply::Packet(packet)
            }
            Err(error) => failure_reply(question, error),
        }
    }
}

fn failure_reply(question: &Question, error: hickory_resolver::ResolveError) -> DnsReply {
    if error.is_nx_domain() {
        DnsReply::Packet(DnsPacket::nxdomain(question.clone()))
    } else if error.is_no_records_found() {
        DnsReply::Packet(DnsPacket::answer(question.clone()))
    } else {
        DnsReply::Failed {
            question: question.clone(),
            reason: error.to_string(),
        }
    }
}

/// In-memory [`DnsClient`] for tests: unknown names answer NXDOMAIN,
/// registered failures surface as resolver errors, and every question is
/// logged.
#[derive(Clone, Default)]
pub struct MockClient {
    records: Arc<RwLock<HashMap<(String, QueryType), (Vec<ResourceRecord>, Vec<ResourceRecord>)>>>,
    failures: Arc<RwLock<HashMap<(String, QueryType), String>>>,
    log: Arc<RwLock<Vec<Question>>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(
        &self,
        name: &str,
        qtype: QueryType,
        answers: Vec<ResourceRecord>,
        additional: Vec<ResourceRecord>,
    ) {
        self.records
            .write()
            .unwrap()
            .insert((normalize(name), qtype), (answers, additional));
    }

    pub fn add_txt(&self, name: &str, records: &[&str]) {
        let answers = records
            .iter()
            .map(|txt| ResourceRecord {
                name: name.to_string(),
                data: RecordData::Txt(txt.to_string()),
            })
            .collect();
        self.put(name, QueryType::Txt, answers, Vec::new());
    }

    pub fn add_a(&self, name: &str, addrs: &[Ipv4Addr]) {
        let answers = addrs
            .iter()
            .map(|addr| ResourceRecord {
                name: name.to_string(),
                data: RecordData::A(*addr),
            })
            .collect();
        self.put(name, QueryType::A, answers, Vec::new());
    }

    pub fn add_aaaa(&self, name: &str, addrs: &[Ipv6Addr]) {
        let answers = addrs
            .iter()
            .map(|addr| ResourceRecord {
                name: name.to_string(),
                data: RecordData::Aaaa(*addr),
            })
            .collect();
        self.put(name, QueryType::Aaaa, answers, Vec::new());
    }

    /// Register MX exchanges with their addresses; the addresses land in
    /// the additional section, as the engine expects of a resolver.
    pub fn add_mx(&self, name: &str, exchanges: &[(&str, &[std::net::IpAddr])]) {
        let mut answers = Vec::new();
        let mut additional = Vec::new();
        for (index, (exchange, addrs)) in exchanges.iter().enumerate() {
            answers.push(ResourceRecord {
                name: name.to_string(),
                data: RecordData::Mx {
                    preference: (index as u16 + 1) * 10,
                    exchange: exchange.to_string(),
                },
            });
            for addr in addrs.iter() {
                additional.push(ResourceRecord {
                    name: exchange.to_string(),
                    data: match addr {
                        std::net::IpAddr::V4(v4) => RecordData::A(*v4),
                        std::net::IpAddr::V6(v6) => RecordData::Aaaa(*v6),
                    },
                });
            }
        }
        self.put(name, QueryType::Mx, answers, additional);
    }

    /// Register PTR names for a client address, keyed by its arpa name.
    pub fn add_ptr(&self, ip: std::net::IpAddr, names: &[&str]) {
        let arpa = crate::spf::ptr::reverse_name(ip);
        let answers = names
            .iter()
            .map(|name| ResourceRecord {
                name: arpa.clone(),
                data: RecordData::Ptr(name.to_string()),
            })
            .collect();
        self.put(&arpa, QueryType::Ptr, answers, Vec::new());
    }

    /// Make a (name, type) pair fail with a resolver error.
    pub fn fail(&self, name: &str, qtype: QueryType, reason: &str) {
        self.failures
            .write()
            .unwrap()
            .insert((normalize(name), qtype), reason.to_string());
    }

    /// Every question asked so far, in order.
    pub fn queries(&self) -> Vec<Question> {
        self.log.read().unwrap().clone()
    }
}

impl DnsClient for MockClient {
    async fn query(&self, question: &Question) -> DnsReply {
        self.log.write().unwrap().push(question.clone());
        let key = (question.name.clone(), question.qtype);
        if let Some(reason) = self.failures.read().unwrap().get(&key) {
            return DnsReply::Failed {
                question: question.clone(),
                reason: reason.clone(),
            };
        }
        match self.records.read().unwrap().get(&key) {
            Some((answers, additional)) => {
                let mut packet = DnsPacket::answer(question.clone());
                packet.answers = answers.clone();
                packet.additional = additional.clone();
                DnsReply::Packet(packet)
            }
            None => DnsReply::Packet(DnsPacket::nxdomain(question.clone())),
        }
    }
}
