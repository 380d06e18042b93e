//! Parsed DNS answer shapes and the query kinds the resolver accepts.
//!
//! Wire decoding itself is delegated to `hickory-proto` (see `ratchet-io`);
//! this module only defines the post-processed, application-facing result
//! shapes, grounded in the record-type callbacks of
//! `original_source/src/dns.c` (`query_finished_a4/a6/mx/ptrv4/ptrv6/txt`).

use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Mx,
    Ptr,
    Txt,
    Cname,
}

impl QueryType {
    pub fn name(self) -> &'static str {
        match self {
            QueryType::A => "a",
            QueryType::Aaaa => "aaaa",
            QueryType::Mx => "mx",
            QueryType::Ptr => "ptr",
            QueryType::Txt => "txt",
            QueryType::Cname => "cname",
        }
    }
}

/// One mail-exchanger record, ordered for iteration as priority-then-order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxRecord {
    pub priority: u16,
    pub exchange: String,
}

/// The parsed, post-processed result of one query.
#[derive(Clone, Debug, PartialEq)]
pub enum DnsAnswer {
    Addresses(Vec<IpAddr>),
    /// Bucketed by priority ascending, source order preserved within a
    /// bucket, already flattened into final iteration order — see
    /// [`order_mx_records`].
    MailExchangers(Vec<MxRecord>),
    Names(Vec<String>),
    Text(Vec<String>),
}

/// Bucket MX records by priority ascending, preserving arrival order within
/// each bucket, then flatten — grounded in `query_finished_mx()`
/// (`original_source/src/dns.c`), which builds one Lua sub-table per
/// priority value and appends in answer order.
pub fn order_mx_records(mut records: Vec<MxRecord>) -> Vec<MxRecord> {
    records.sort_by_key(|r| r.priority);
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mx_ordering_buckets_by_priority_then_preserves_arrival_order() {
        let records = vec![
            MxRecord {
                priority: 20,
                exchange: "mx2.example".into(),
            },
            MxRecord {
                priority: 10,
                exchange: "mx1.example".into(),
            },
            MxRecord {
                priority: 10,
                exchange: "mx1b.example".into(),
            },
        ];
        let ordered = order_mx_records(records);
        let names: Vec<&str> = ordered.iter().map(|r| r.exchange.as_str()).collect();
        assert_eq!(names, ["mx1.example", "mx1b.example", "mx2.example"]);
    }
}
