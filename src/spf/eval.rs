//! The SPF evaluator state machine (RFC 7208 `check_host()`).
//!
//! One [`Evaluator`] handles one check. The engine never blocks: every DNS
//! round-trip is a suspension point where [`Evaluator::step`] returns the
//! outbound [`Question`]s plus a fresh [`CallbackId`], and the caller feeds
//! the answers back. Responses with a stale callback id, duplicate answers,
//! and answers still awaiting a concurrent peer query are swallowed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;
use std::net::IpAddr;

use crate::common::cidr::{ip4_in_network, ip6_in_network, IpFamily};
use crate::common::dns::{CallbackId, DnsPacket, DnsReply, Question, QueryType, Rcode};
use crate::common::domain::{
    domains_equal, is_subdomain_of, normalize, truncate_labels, validate_domain,
};

use super::macro_exp::{self, Expansion, MacroContext, MacroError};
use super::mechanism::{Directive, DualCidr, Mechanism, Qualifier, Task};
use super::ptr::{reverse_name, PtrCheck, PtrPurpose};
use super::record::{is_spf_record, SpfRecord};
use super::SpfResult;

/// DNS mechanisms (`a`, `mx`, `ptr`, `exists`, `include`) plus `redirect`
/// and explanation dispatches allowed per evaluation.
const DNS_MECHANISM_BUDGET: u8 = 10;

/// Exchanges considered per `mx` mechanism.
const MAX_MX_EXCHANGES: usize = 10;

/// Inputs for one SPF check. `mail_from` is the bare `local@domain`
/// (angle brackets and parameters already stripped); empty denotes a
/// bounce, in which case the HELO identity is the sender.
#[derive(Debug, Clone, Copy)]
pub struct CheckParams<'a> {
    pub client_ip: IpAddr,
    pub mail_from: &'a str,
    pub helo: &'a str,
    /// Local host name, substituted for `%{r}` in explanations.
    pub hostname: Option<&'a str>,
}

/// Final result triple: the SPF result, a human-readable comment, and on
/// `Fail`/`TempError`/`PermError` a problem description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfOutcome {
    pub result: SpfResult,
    pub comment: String,
    pub problem: Option<String>,
}

/// What one `step` produced.
#[derive(Debug)]
pub enum Step {
    /// The evaluation is finished.
    Done(SpfOutcome),
    /// Resolve these questions and feed each reply to `step` with `callback`.
    Query {
        queries: Vec<Question>,
        callback: CallbackId,
    },
    /// The input was ignored (stale, duplicate) or a concurrent peer query
    /// is still awaited.
    Pending,
}

struct PendingQuery {
    question: Question,
    done: bool,
}

/// Saved evaluation state for one active `include`. `redirect` never
/// pushes a frame.
struct Frame {
    domain: String,
    tasks: VecDeque<Task>,
    redirect: Option<String>,
    explain: Option<String>,
    qualifier: Qualifier,
}

/// What the next response will be applied to.
enum State {
    Idle,
    AwaitingRecord,
    AwaitingAddr {
        qualifier: Qualifier,
        cidr: DualCidr,
        text: String,
    },
    AwaitingMx {
        qualifier: Qualifier,
        cidr: DualCidr,
        text: String,
    },
    AwaitingExists {
        qualifier: Qualifier,
        text: String,
    },
    AwaitingPtrNames(PtrCheck),
    AwaitingPtrAddr(PtrCheck),
    AwaitingExplainTxt {
        outcome: SpfOutcome,
    },
    Done,
}

enum Answer {
    Packet(DnsPacket),
    Transient(String),
}

/// One SPF evaluation: the iterative `check_host()` state machine.
pub struct Evaluator {
    client_ip: IpAddr,
    sender: String,
    local_part: String,
    sender_domain: String,
    helo: String,
    hostname: Option<String>,
    /// Current evaluation domain; mutated by `redirect` and `include`.
    domain: String,
    tasks: VecDeque<Task>,
    redirect: Option<String>,
    explain: Option<String>,
    include_stack: Vec<Frame>,
    state: State,
    pending: Vec<PendingQuery>,
    callback: u64,
    /// PTR-validation results: name -> forward lookup returned the client IP.
    validated: BTreeMap<String, bool>,
    /// Restricting domains whose validation pass already completed.
    ptr_runs: BTreeSet<String>,
    /// True once an unrestricted validation pass (for `%{p}`) completed.
    ptr_resolved: bool,
    budget: u8,
}

impl Evaluator {
    /// An IPv4-mapped IPv6 client address is normalized to IPv4 here.
    pub fn new(params: CheckParams<'_>) -> Self {
        let client_ip = match params.client_ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            },
            v4 => v4,
        };
        let sender = if params.mail_from.is_empty() {
            params.helo
        } else {
            params.mail_from
        };
        let (local_part, sender_domain) = match sender.rsplit_once('@') {
            Some((local, domain)) if !local.is_empty() => (local.to_string(), domain.to_string()),
            Some((_, domain)) => ("postmaster".to_string(), domain.to_string()),
            None => ("postmaster".to_string(), sender.to_string()),
        };
        let domain = normalize(&sender_domain);
        Self {
            client_ip,
            sender: sender.to_string(),
            local_part,
            sender_domain,
            helo: params.helo.to_string(),
            hostname: params.hostname.map(str::to_string),
            domain,
            tasks: VecDeque::new(),
            redirect: None,
            explain: None,
            include_stack: Vec::new(),
            state: State::Idle,
            pending: Vec::new(),
            callback: 0,
            validated: BTreeMap::new(),
            ptr_runs: BTreeSet::new(),
            ptr_resolved: false,
            budget: DNS_MECHANISM_BUDGET,
        }
    }

    /// Begin the evaluation: emits the SPF+TXT query pair for the sender
    /// domain, or a final result if the domain is not even a DNS name.
    pub fn start(&mut self) -> Step {
        if !matches!(self.state, State::Idle) {
            return Step::Pending;
        }
        if validate_domain(&self.domain).is_err() {
            // An unusable initial domain is None, not PermError.
            return self.finish_outcome(SpfOutcome {
                result: SpfResult::None,
                comment: self.domain.clone(),
                problem: Some("not a domain name".into()),
            });
        }
        self.begin_record_fetch()
    }

    /// Feed one DNS reply. `id` must be the callback id returned with the
    /// queries being answered; anything else is silently discarded.
    pub fn step(&mut self, id: CallbackId, reply: DnsReply) -> Step {
        if matches!(self.state, State::Idle | State::Done) {
            return Step::Pending;
        }
        if id.0 != self.callback {
            tracing::trace!(got = id.0, current = self.callback, "stale callback id");
            return Step::Pending;
        }
        let question = reply.question().clone();
        let Some(slot) = self.pending.iter_mut().find(|p| p.question == question) else {
            return self.finalize(SpfOutcome {
                result: SpfResult::TempError,
                comment: question.name,
                problem: Some("response does not match any pending query".into()),
            });
        };
        if slot.done {
            tracing::trace!(name = %question.name, "duplicate response");
            return Step::Pending;
        }
        slot.done = true;

        let answer = match reply {
            DnsReply::Failed { reason, .. } => Answer::Transient(reason),
            DnsReply::Packet(packet) => match packet.rcode {
                Rcode::Other(code) => Answer::Transient(format!("DNS rcode {code}")),
                _ => Answer::Packet(packet),
            },
        };
        if matches!(answer, Answer::Transient(_)) && self.pending.iter().any(|p| !p.done) {
            // A concurrent peer query may still produce a usable answer.
            return Step::Pending;
        }

        match mem::replace(&mut self.state, State::Idle) {
            State::AwaitingRecord => match answer {
                Answer::Packet(packet) => self.on_record(packet),
                Answer::Transient(reason) => self.temperror(self.domain.clone(), reason),
            },
            State::AwaitingAddr {
                qualifier,
                cidr,
                text,
            } => match answer {
                Answer::Packet(packet) => self.on_addr(qualifier, cidr, text, packet),
                Answer::Transient(reason) => self.temperror(text, reason),
            },
            State::AwaitingMx {
                qualifier,
                cidr,
                text,
            } => match answer {
                Answer::Packet(packet) => self.on_mx(qualifier, cidr, text, packet),
                Answer::Transient(reason) => self.temperror(text, reason),
            },
            State::AwaitingExists { qualifier, text } => match answer {
                Answer::Packet(packet) => self.on_exists(qualifier, text, packet),
                Answer::Transient(reason) => self.temperror(text, reason),
            },
            // A resolver failure during PTR validation silently converts
            // the calling mechanism into a non-match.
            State::AwaitingPtrNames(check) => match answer {
                Answer::Packet(packet) => self.on_ptr_names(check, packet),
                Answer::Transient(_) => self.conclude_ptr(check),
            },
            State::AwaitingPtrAddr(check) => match answer {
                Answer::Packet(packet) => self.on_ptr_addr(check, packet),
                Answer::Transient(_) => self.conclude_ptr(check),
            },
            // Explanation failures never override the Fail.
            State::AwaitingExplainTxt { outcome } => match answer {
                Answer::Packet(packet) => self.on_explain(outcome, packet),
                Answer::Transient(_) => self.finish_outcome(outcome),
            },
            State::Idle | State::Done => Step::Pending,
        }
    }

    // --- record acquisition -------------------------------------------------

    fn begin_record_fetch(&mut self) -> Step {
        tracing::debug!(domain = %self.domain, "fetching SPF record");
        self.state = State::AwaitingRecord;
        self.issue(vec![
            Question::new(&self.domain, QueryType::Spf),
            Question::new(&self.domain, QueryType::Txt),
        ])
    }

    fn on_record(&mut self, packet: DnsPacket) -> Step {
        let records: Vec<&str> = packet
            .texts()
            .into_iter()
            .filter(|txt| is_spf_record(txt))
            .collect();
        match records.len() {
            0 => {
                if self.pending.iter().any(|p| !p.done) {
                    // The peer of the SPF/TXT pair may still carry a record.
                    self.state = State::AwaitingRecord;
                    return Step::Pending;
                }
                self.finalize(SpfOutcome {
                    result: SpfResult::None,
                    comment: format!("no SPF record for {}", self.domain),
                    problem: None,
                })
            }
            1 => match SpfRecord::parse(records[0], IpFamily::of(self.client_ip)) {
                Ok(record) => {
                    tracing::debug!(domain = %self.domain, record = %record.raw, "SPF record installed");
                    self.tasks = record.tasks.into();
                    self.redirect = record.redirect;
                    self.explain = record.exp;
                    self.advance()
                }
                Err(err) => self.permerror(self.domain.clone(), err.to_string()),
            },
            _ => self.permerror(self.domain.clone(), "multiple SPF records".into()),
        }
    }

    // --- the result-propagation loop ---------------------------------------

    /// Shift and dispatch mechanism tasks until one needs DNS, one matches,
    /// or the record (and the include stack) is exhausted.
    fn advance(&mut self) -> Step {
        loop {
            let Some(task) = self.tasks.pop_front() else {
                if let Some(spec) = self.redirect.take() {
                    return self.do_redirect(spec);
                }
                match self.include_stack.pop() {
                    Some(frame) => {
                        // Included record matched nothing: a non-match for
                        // the include mechanism itself.
                        self.restore(frame);
                        continue;
                    }
                    None => {
                        return self.finalize(SpfOutcome {
                            result: SpfResult::Neutral,
                            comment: "no mechanism matched".into(),
                            problem: None,
                        })
                    }
                }
            };
            match task {
                Task::ResolvePtr if self.ptr_resolved => continue,
                Task::ResolvePtr => return self.start_ptr(None, PtrPurpose::Macro),
                Task::Directive(directive) => {
                    if let Some(step) = self.dispatch(directive) {
                        return step;
                    }
                }
            }
        }
    }

    /// Dispatch one directive. `None` means non-match: keep advancing.
    fn dispatch(&mut self, directive: Directive) -> Option<Step> {
        let text = directive.mechanism.to_string();
        tracing::trace!(mechanism = %text, domain = %self.domain, "dispatching");
        match &directive.mechanism {
            Mechanism::All => {
                Some(self.matched(directive.qualifier, "matches default".into()))
            }
            Mechanism::Ip4 { addr, prefix_len } => {
                if let IpAddr::V4(client) = self.client_ip {
                    if ip4_in_network(client, *addr, *prefix_len) {
                        return Some(self.matched(directive.qualifier, format!("matches {text}")));
                    }
                }
                None
            }
            Mechanism::Ip6 { addr, prefix_len } => {
                if let IpAddr::V6(client) = self.client_ip {
                    if ip6_in_network(client, *addr, *prefix_len) {
                        return Some(self.matched(directive.qualifier, format!("matches {text}")));
                    }
                }
                None
            }
            Mechanism::A { domain, cidr } => {
                let cidr = *cidr;
                let target = match self.expand_target(domain.as_deref(), &directive, &text) {
                    Ok(target) => target,
                    Err(step) => return Some(step),
                };
                if !self.take_budget() {
                    return Some(self.budget_exceeded(text));
                }
                self.state = State::AwaitingAddr {
                    qualifier: directive.qualifier,
                    cidr,
                    text,
                };
                Some(self.issue(vec![Question::new(&target, self.address_qtype())]))
            }
            Mechanism::Mx { domain, cidr } => {
                let cidr = *cidr;
                let target = match self.expand_target(domain.as_deref(), &directive, &text) {
                    Ok(target) => target,
                    Err(step) => return Some(step),
                };
                if !self.take_budget() {
                    return Some(self.budget_exceeded(text));
                }
                self.state = State::AwaitingMx {
                    qualifier: directive.qualifier,
                    cidr,
                    text,
                };
                Some(self.issue(vec![Question::new(&target, QueryType::Mx)]))
            }
            Mechanism::Exists(spec) => {
                let target = match self.expand_target(Some(spec.as_str()), &directive, &text) {
                    Ok(target) => target,
                    Err(step) => return Some(step),
                };
                if !self.take_budget() {
                    return Some(self.budget_exceeded(text));
                }
                self.state = State::AwaitingExists {
                    qualifier: directive.qualifier,
                    text,
                };
                // exists always queries A, regardless of client family.
                Some(self.issue(vec![Question::new(&target, QueryType::A)]))
            }
            Mechanism::Ptr(spec) => {
                let qualifier = directive.qualifier;
                let target = match self.expand_target(spec.as_deref(), &directive, &text) {
                    Ok(target) => target,
                    Err(step) => return Some(step),
                };
                if !self.take_budget() {
                    return Some(self.budget_exceeded(text));
                }
                let restrict = normalize(&target);
                if self.has_validated_match(&restrict) {
                    return Some(self.matched(qualifier, format!("matches {text}")));
                }
                if self.ptr_runs.contains(&restrict) {
                    // Validation for this domain already ran and verified
                    // nothing usable.
                    return None;
                }
                Some(self.start_ptr(Some(restrict), PtrPurpose::Mechanism { qualifier, text }))
            }
            Mechanism::Include(spec) => {
                let target = match self.expand_target(Some(spec.as_str()), &directive, &text) {
                    Ok(target) => target,
                    Err(step) => return Some(step),
                };
                if !self.take_budget() {
                    return Some(self.budget_exceeded(text));
                }
                let frame = Frame {
                    domain: mem::replace(&mut self.domain, target),
                    tasks: mem::take(&mut self.tasks),
                    redirect: self.redirect.take(),
                    explain: self.explain.take(),
                    qualifier: directive.qualifier,
                };
                self.include_stack.push(frame);
                Some(self.begin_record_fetch())
            }
        }
    }

    /// Fold a sub-result. Inside an include, Pass becomes a match with the
    /// include's qualifier, None is promoted to PermError, errors
    /// propagate, and everything else is a non-match. At top level a Fail
    /// without a problem consults `exp=` first.
    fn finalize(&mut self, mut outcome: SpfOutcome) -> Step {
        let Some(frame) = self.include_stack.pop() else {
            if outcome.result == SpfResult::Fail && outcome.problem.is_none() {
                if let Some(spec) = self.explain.take() {
                    return self.begin_explain(spec, outcome);
                }
            }
            return self.finish_outcome(outcome);
        };
        match outcome.result {
            SpfResult::Pass => {
                let qualifier = frame.qualifier;
                self.restore(frame);
                self.matched(qualifier, "included".into())
            }
            SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => {
                self.restore(frame);
                self.advance()
            }
            SpfResult::None => {
                outcome.result = SpfResult::PermError;
                outcome
                    .problem
                    .get_or_insert_with(|| "no SPF record for included domain".into());
                self.finish_outcome(outcome)
            }
            SpfResult::TempError | SpfResult::PermError => self.finish_outcome(outcome),
        }
    }

    fn matched(&mut self, qualifier: Qualifier, comment: String) -> Step {
        self.finalize(SpfOutcome {
            result: qualifier.result(),
            comment,
            problem: None,
        })
    }

    fn restore(&mut self, frame: Frame) {
        self.domain = frame.domain;
        self.tasks = frame.tasks;
        self.redirect = frame.redirect;
        self.explain = frame.explain;
    }

    fn do_redirect(&mut self, spec: String) -> Step {
        let target = match self.expand_domain(&spec) {
            Err(err) => return self.permerror(format!("redirect={spec}"), err.to_string()),
            Ok(Expansion::Deferred) => {
                self.redirect = Some(spec);
                return self.start_ptr(None, PtrPurpose::Macro);
            }
            Ok(Expansion::Ready(target)) => target,
        };
        if let Err(err) = validate_domain(&target) {
            return self.permerror(
                format!("redirect={spec}"),
                format!("invalid domain name '{target}': {err}"),
            );
        }
        if !self.take_budget() {
            return self.budget_exceeded(format!("redirect={spec}"));
        }
        tracing::debug!(from = %self.domain, to = %target, "following redirect");
        self.tasks.clear();
        self.explain = None;
        self.domain = target;
        self.begin_record_fetch()
    }

    // --- mechanism callbacks ------------------------------------------------

    fn on_addr(
        &mut self,
        qualifier: Qualifier,
        cidr: DualCidr,
        text: String,
        packet: DnsPacket,
    ) -> Step {
        let target = packet.question.name.clone();
        let hit = packet
            .addresses_for(&target)
            .into_iter()
            .any(|addr| self.cidr_match(addr, cidr));
        if hit {
            self.matched(qualifier, format!("matches {text}"))
        } else {
            self.advance()
        }
    }

    /// The resolver is expected to ship the exchanges' addresses in the
    /// additional section; exchanges it did not cover cannot match.
    fn on_mx(
        &mut self,
        qualifier: Qualifier,
        cidr: DualCidr,
        text: String,
        packet: DnsPacket,
    ) -> Step {
        for exchange in packet.mx_exchanges().iter().take(MAX_MX_EXCHANGES) {
            if packet
                .addresses_for(exchange)
                .into_iter()
                .any(|addr| self.cidr_match(addr, cidr))
            {
                return self.matched(qualifier, format!("matches {text}"));
            }
        }
        self.advance()
    }

    fn on_exists(&mut self, qualifier: Qualifier, text: String, packet: DnsPacket) -> Step {
        let target = packet.question.name.clone();
        // Any address at all is a match, whatever its value.
        if packet.addresses_for(&target).is_empty() {
            self.advance()
        } else {
            self.matched(qualifier, format!("matches {text}"))
        }
    }

    // --- PTR validation -----------------------------------------------------

    fn start_ptr(&mut self, restrict: Option<String>, purpose: PtrPurpose) -> Step {
        let check = PtrCheck::new(restrict, purpose);
        let question = Question::new(&reverse_name(self.client_ip), QueryType::Ptr);
        self.state = State::AwaitingPtrNames(check);
        self.issue(vec![question])
    }

    fn on_ptr_names(&mut self, mut check: PtrCheck, packet: DnsPacket) -> Step {
        if packet.rcode == Rcode::NxDomain {
            return self.conclude_ptr(check);
        }
        check.accept_names(packet.ptr_names());
        self.ptr_continue(check)
    }

    /// Issue the forward lookup for the next unverified candidate name.
    fn ptr_continue(&mut self, mut check: PtrCheck) -> Step {
        while let Some(name) = check.queue.pop_front() {
            match self.validated.get(&name) {
                Some(true) => {
                    check.verified = Some(name);
                    return self.conclude_ptr(check);
                }
                Some(false) => continue,
                None => {
                    let question = Question::new(&name, self.address_qtype());
                    check.current = Some(name);
                    self.state = State::AwaitingPtrAddr(check);
                    return self.issue(vec![question]);
                }
            }
        }
        self.conclude_ptr(check)
    }

    fn on_ptr_addr(&mut self, mut check: PtrCheck, packet: DnsPacket) -> Step {
        let Some(name) = check.current.take() else {
            return self.conclude_ptr(check);
        };
        let verified = packet.addresses_for(&name).contains(&self.client_ip);
        self.validated.insert(name.clone(), verified);
        if verified {
            check.verified = Some(name);
            return self.conclude_ptr(check);
        }
        self.ptr_continue(check)
    }

    fn conclude_ptr(&mut self, check: PtrCheck) -> Step {
        match &check.restrict {
            Some(domain) => {
                self.ptr_runs.insert(domain.clone());
            }
            None => self.ptr_resolved = true,
        }
        match check.purpose {
            PtrPurpose::Mechanism { qualifier, text } => {
                if check.verified.is_some() {
                    self.matched(qualifier, format!("matches {text}"))
                } else {
                    self.advance()
                }
            }
            PtrPurpose::Macro => self.advance(),
        }
    }

    // --- explanation --------------------------------------------------------

    /// Fetch the `exp=` TXT for a top-level Fail. Every failure here
    /// (deferred `%{p}`, bad domain, exhausted budget, DNS trouble) leaves
    /// the Fail outcome untouched.
    fn begin_explain(&mut self, spec: String, outcome: SpfOutcome) -> Step {
        let target = match self.expand_domain(&spec) {
            Ok(Expansion::Ready(target)) => target,
            _ => return self.finish_outcome(outcome),
        };
        if validate_domain(&target).is_err() || !self.take_budget() {
            return self.finish_outcome(outcome);
        }
        tracing::debug!(domain = %target, "fetching explanation");
        self.state = State::AwaitingExplainTxt { outcome };
        self.issue(vec![Question::new(&target, QueryType::Txt)])
    }

    fn on_explain(&mut self, mut outcome: SpfOutcome, packet: DnsPacket) -> Step {
        if let Some(&text) = packet.texts().first() {
            if let Ok(Expansion::Ready(explanation)) = self.expand_spec(text, true) {
                outcome.comment = explanation
                    .chars()
                    .filter(|c| matches!(c, ' '..='~'))
                    .collect();
            }
        }
        self.finish_outcome(outcome)
    }

    // --- plumbing -----------------------------------------------------------

    fn issue(&mut self, queries: Vec<Question>) -> Step {
        self.pending = queries
            .iter()
            .map(|question| PendingQuery {
                question: question.clone(),
                done: false,
            })
            .collect();
        self.callback += 1;
        Step::Query {
            queries,
            callback: CallbackId(self.callback),
        }
    }

    fn finish_outcome(&mut self, outcome: SpfOutcome) -> Step {
        tracing::debug!(result = %outcome.result, comment = %outcome.comment, "evaluation finished");
        self.state = State::Done;
        self.pending.clear();
        Step::Done(outcome)
    }

    fn permerror(&mut self, comment: String, problem: String) -> Step {
        self.finalize(SpfOutcome {
            result: SpfResult::PermError,
            comment,
            problem: Some(problem),
        })
    }

    fn temperror(&mut self, comment: String, problem: String) -> Step {
        self.finalize(SpfOutcome {
            result: SpfResult::TempError,
            comment,
            problem: Some(problem),
        })
    }

    fn budget_exceeded(&mut self, comment: String) -> Step {
        self.finalize(SpfOutcome {
            result: SpfResult::PermError,
            comment,
            problem: Some("Number of DNS mechanism exceeded".into()),
        })
    }

    fn take_budget(&mut self) -> bool {
        if self.budget == 0 {
            return false;
        }
        self.budget -= 1;
        true
    }

    fn address_qtype(&self) -> QueryType {
        match self.client_ip {
            IpAddr::V4(_) => QueryType::A,
            IpAddr::V6(_) => QueryType::Aaaa,
        }
    }

    fn cidr_match(&self, addr: IpAddr, cidr: DualCidr) -> bool {
        match (self.client_ip, addr) {
            (IpAddr::V4(client), IpAddr::V4(network)) => ip4_in_network(client, network, cidr.v4),
            (IpAddr::V6(client), IpAddr::V6(network)) => ip6_in_network(client, network, cidr.v6),
            _ => false,
        }
    }

    fn has_validated_match(&self, domain: &str) -> bool {
        self.validated
            .iter()
            .any(|(name, &ok)| ok && (domains_equal(name, domain) || is_subdomain_of(name, domain)))
    }

    /// Expand a mechanism domain-spec. A deferral re-queues the directive
    /// behind an unrestricted PTR pass; post-expansion names must still be
    /// DNS names.
    fn expand_target(
        &mut self,
        spec: Option<&str>,
        directive: &Directive,
        text: &str,
    ) -> Result<String, Step> {
        let Some(spec) = spec else {
            return Ok(self.domain.clone());
        };
        match self.expand_domain(spec) {
            Err(err) => Err(self.permerror(text.to_string(), err.to_string())),
            Ok(Expansion::Deferred) => Err(self.defer(directive.clone())),
            Ok(Expansion::Ready(target)) => {
                if let Err(err) = validate_domain(&target) {
                    return Err(self.permerror(
                        text.to_string(),
                        format!("invalid domain name '{target}': {err}"),
                    ));
                }
                Ok(target)
            }
        }
    }

    fn defer(&mut self, directive: Directive) -> Step {
        self.tasks.push_front(Task::Directive(directive));
        self.start_ptr(None, PtrPurpose::Macro)
    }

    fn expand_spec(&self, spec: &str, exp_context: bool) -> Result<Expansion, MacroError> {
        let ctx = MacroContext {
            sender: &self.sender,
            local_part: &self.local_part,
            sender_domain: &self.sender_domain,
            client_ip: self.client_ip,
            helo: &self.helo,
            domain: &self.domain,
            hostname: self.hostname.as_deref(),
            validated: &self.validated,
            ptr_resolved: self.ptr_resolved,
        };
        macro_exp::expand(spec, &ctx, exp_context)
    }

    /// Expansion for names that will be queried: over-long results shed
    /// leftmost labels.
    fn expand_domain(&self, spec: &str) -> Result<Expansion, MacroError> {
        Ok(match self.expand_spec(spec, false)? {
            Expansion::Ready(name) => Expansion::Ready(truncate_labels(&name).to_string()),
            Expansion::Deferred => Expansion::Deferred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::RecordData;

    fn evaluator(ip: &str, mail_from: &str) -> Evaluator {
        Evaluator::new(CheckParams {
            client_ip: ip.parse().unwrap(),
            mail_from,
            helo: "helo.example.com",
            hostname: None,
        })
    }

    fn txt_reply(question: &Question, records: &[&str]) -> DnsReply {
        let mut packet = DnsPacket::answer(question.clone());
        for record in records {
            packet.answers.push(crate::common::dns::ResourceRecord {
                name: question.name.clone(),
                data: RecordData::Txt(record.to_string()),
            });
        }
        DnsReply::Packet(packet)
    }

    fn empty_reply(question: &Question) -> DnsReply {
        DnsReply::Packet(DnsPacket::answer(question.clone()))
    }

    fn expect_query(step: Step) -> (Vec<Question>, CallbackId) {
        match step {
            Step::Query { queries, callback } => (queries, callback),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    fn expect_done(step: Step) -> SpfOutcome {
        match step {
            Step::Done(outcome) => outcome,
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn initial_invalid_domain_is_none() {
        let mut eval = evaluator("192.0.2.1", "alice@192.0.2.9");
        let outcome = expect_done(eval.start());
        assert_eq!(outcome.result, SpfResult::None);
        assert_eq!(outcome.problem.as_deref(), Some("not a domain name"));
    }

    #[test]
    fn start_emits_spf_and_txt_pair() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, _) = expect_query(eval.start());
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0], Question::new("example.com", QueryType::Spf));
        assert_eq!(queries[1], Question::new("example.com", QueryType::Txt));
    }

    #[test]
    fn spf_rr_answer_wins_without_waiting() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        let packet = DnsPacket::answer(queries[0].clone())
            .with_answer("example.com", RecordData::Spf("v=spf1 +all".into()));
        let outcome = expect_done(eval.step(id, DnsReply::Packet(packet)));
        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.comment, "matches default");
    }

    #[test]
    fn waits_for_peer_before_concluding_none() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        assert!(matches!(
            eval.step(id, empty_reply(&queries[0])),
            Step::Pending
        ));
        let outcome = expect_done(eval.step(id, empty_reply(&queries[1])));
        assert_eq!(outcome.result, SpfResult::None);
    }

    #[test]
    fn resolver_failure_waits_for_usable_peer() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        let failed = DnsReply::Failed {
            question: queries[0].clone(),
            reason: "connection refused".into(),
        };
        assert!(matches!(eval.step(id, failed), Step::Pending));
        let outcome = expect_done(eval.step(id, txt_reply(&queries[1], &["v=spf1 ?all"])));
        assert_eq!(outcome.result, SpfResult::Neutral);
    }

    #[test]
    fn temperror_when_all_queries_fail() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        let fail =
            |q: &Question| DnsReply::Failed { question: q.clone(), reason: "timeout".into() };
        assert!(matches!(eval.step(id, fail(&queries[0])), Step::Pending));
        let outcome = expect_done(eval.step(id, fail(&queries[1])));
        assert_eq!(outcome.result, SpfResult::TempError);
    }

    #[test]
    fn other_rcode_is_transient() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        let servfail = |q: &Question| {
            let mut packet = DnsPacket::answer(q.clone());
            packet.rcode = Rcode::Other(2);
            DnsReply::Packet(packet)
        };
        assert!(matches!(eval.step(id, servfail(&queries[0])), Step::Pending));
        let outcome = expect_done(eval.step(id, servfail(&queries[1])));
        assert_eq!(outcome.result, SpfResult::TempError);
    }

    #[test]
    fn stale_callback_id_leaves_state_unchanged() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, first_id) = expect_query(eval.start());
        let txt = txt_reply(&queries[1], &["v=spf1 a -all"]);
        let (addr_queries, second_id) = expect_query(eval.step(first_id, txt.clone()));
        assert_eq!(addr_queries, vec![Question::new("example.com", QueryType::A)]);

        // Replaying the old callback id must be swallowed.
        assert!(matches!(eval.step(first_id, txt), Step::Pending));

        // The evaluation is still waiting on the A answer and completes.
        let packet = DnsPacket::answer(addr_queries[0].clone())
            .with_answer("example.com", RecordData::A("192.0.2.1".parse().unwrap()));
        let outcome = expect_done(eval.step(second_id, DnsReply::Packet(packet)));
        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.comment, "matches a");
    }

    #[test]
    fn duplicate_response_ignored() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        assert!(matches!(eval.step(id, empty_reply(&queries[0])), Step::Pending));
        assert!(matches!(eval.step(id, empty_reply(&queries[0])), Step::Pending));
        let outcome = expect_done(eval.step(id, empty_reply(&queries[1])));
        assert_eq!(outcome.result, SpfResult::None);
    }

    #[test]
    fn unexpected_question_is_temperror() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (_, id) = expect_query(eval.start());
        let stray = Question::new("unrelated.test", QueryType::A);
        let outcome = expect_done(eval.step(id, empty_reply(&stray)));
        assert_eq!(outcome.result, SpfResult::TempError);
    }

    #[test]
    fn ipv4_mapped_client_treated_as_ipv4() {
        let mut eval = evaluator("::ffff:192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        let outcome = expect_done(eval.step(
            id,
            txt_reply(&queries[1], &["v=spf1 ip4:192.0.2.0/24 -all"]),
        ));
        assert_eq!(outcome.result, SpfResult::Pass);
        assert_eq!(outcome.comment, "matches ip4:192.0.2.0/24");
    }

    #[test]
    fn bounce_uses_helo_as_sender() {
        let mut eval = Evaluator::new(CheckParams {
            client_ip: "192.0.2.1".parse().unwrap(),
            mail_from: "",
            helo: "helo.example.com",
            hostname: None,
        });
        let (queries, _) = expect_query(eval.start());
        assert_eq!(queries[0].name, "helo.example.com");
    }

    #[test]
    fn steps_after_completion_are_ignored() {
        let mut eval = evaluator("192.0.2.1", "alice@example.com");
        let (queries, id) = expect_query(eval.start());
        let outcome = expect_done(eval.step(id, txt_reply(&queries[1], &["v=spf1 +all"])));
        assert_eq!(outcome.result, SpfResult::Pass);
        assert!(matches!(
            eval.step(id, txt_reply(&queries[1], &["v=spf1 -all"])),
            Step::Pending
        ));
    }
}
