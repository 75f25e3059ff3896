//! Iterative SPF evaluation engine (RFC 4408 / RFC 7208).
//!
//! The engine performs no I/O of its own. [`Evaluator::step`] hands DNS
//! question descriptors to the caller and consumes the answers the caller
//! feeds back; the caller owns the event loop and the resolver. The
//! [`driver`] module provides a ready-made async loop on top of
//! `hickory-resolver` for callers that do not need the inversion of control.

pub mod common;
pub mod driver;
pub mod spf;

pub use common::dns::{
    CallbackId, DnsPacket, DnsReply, Question, QueryType, Rcode, RecordData, ResourceRecord,
};
pub use driver::{check_host, DnsClient, HickoryClient, MockClient};
pub use spf::{CheckParams, Evaluator, SpfOutcome, SpfResult, Step};
