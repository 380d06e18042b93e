//! Asynchronous stub-resolver client (§4.5), grounded in
//! `original_source/src/dns.c` (`mydns_submit`/`query_finished_*`/
//! `return_error`): owns the UDP socket, the retry loop, and the
//! record-shape post-processing. Wire encode/decode is delegated to
//! `hickory-proto`'s `Message`/`Record` types.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use ratchet_core::{ErrorKind, RatchetError, TaskHandle, Waitable};
use ratchet_types::{DnsAnswer, MxRecord, QueryType, order_mx_records};
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::socket::{AddressFamily, Socket};

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(1);

fn next_query_id() -> u16 {
    NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed)
}

struct Waited {
    fd: RawFd,
    deadline: Option<Instant>,
}

impl Waitable for Waited {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// A stub resolver client: one per scheduler, shared by every `query`/
/// `query_all` call. Each call opens its own UDP socket (§9's "one
/// resolver instance per query type" fan-out note) so parallel queries
/// never contend on a shared fd.
pub struct Resolver {
    config: ResolverConfig,
    nameserver: SocketAddr,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Result<Self, RatchetError> {
        let nameserver = read_nameserver(&config)?;
        Ok(Self { config, nameserver })
    }

    /// `query(name, type, …)` (§4.5).
    pub async fn query(&self, handle: &TaskHandle, name: &str, query_type: QueryType) -> Result<DnsAnswer, RatchetError> {
        if let Some(answer) = wildcard_shortcut(name, query_type) {
            return Ok(answer);
        }
        if let Some(answer) = literal_address_shortcut(name, query_type) {
            return Ok(answer);
        }

        let query_name = if query_type == QueryType::Ptr {
            normalize_ptr_query(name)
        } else {
            name.to_string()
        };

        let deadline = Instant::now() + self.config.expire();
        self.run_one(handle, &query_name, query_type, deadline).await
    }

    /// `query_all(name, type-list, …)` (§4.5): one resolver instance per
    /// requested type, run as sibling tasks and joined with `wait_all` —
    /// `hickory-proto` has no multi-query wire format, so per-type fan-out
    /// via the scheduler's own concurrency is the only parallelism
    /// available (§9 "Multiple-resolver fan-out").
    pub async fn query_all(
        &self,
        handle: &TaskHandle,
        name: &str,
        types: Vec<QueryType>,
    ) -> HashMap<QueryType, Result<DnsAnswer, RatchetError>> {
        let results: Rc<RefCell<HashMap<QueryType, Result<DnsAnswer, RatchetError>>>> = Rc::new(RefCell::new(HashMap::new()));
        let nameserver = self.nameserver;
        let expire = self.config.expire();
        let name = name.to_string();
        let mut joined = Vec::with_capacity(types.len());

        for query_type in types {
            let results = results.clone();
            let name = name.clone();
            let task_id = handle.spawn(move |child| {
                async move {
                    let resolver = Resolver { config: ResolverConfig::default(), nameserver };
                    let outcome = if let Some(answer) = wildcard_shortcut(&name, query_type).or(literal_address_shortcut(&name, query_type)) {
                        Ok(answer)
                    } else {
                        let query_name = if query_type == QueryType::Ptr { normalize_ptr_query(&name) } else { name.clone() };
                        let deadline = Instant::now() + expire;
                        resolver.run_one(&child, &query_name, query_type, deadline).await
                    };
                    results.borrow_mut().insert(query_type, outcome);
                    Ok(())
                }
            });
            joined.push(task_id);
        }

        let _ = handle.wait_all(joined).await;
        Rc::try_unwrap(results).map(RefCell::into_inner).unwrap_or_default()
    }

    /// The per-query retry loop (§4.5): send, then wait with `2^t` backoff
    /// racing the kernel read, until the message arrives or `deadline`
    /// (the hard expire) is reached.
    async fn run_one(
        &self,
        handle: &TaskHandle,
        name: &str,
        query_type: QueryType,
        deadline: Instant,
    ) -> Result<DnsAnswer, RatchetError> {
        let socket = Socket::new_udp(match self.nameserver {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        })?;
        socket.connect(handle, self.nameserver).await?;

        let query_id = next_query_id();
        let wire = encode_query(query_id, name, query_type)?;
        socket.send(handle, &wire).await?;

        let mut tries: u32 = 0;
        loop {
            if Instant::now() >= deadline {
                return Err(RatchetError::new("Resolver::query", ErrorKind::TempFail, "expire deadline reached"));
            }

            let backoff_deadline = Instant::now() + Duration::from_secs(1u64 << tries.min(6));
            let wait_deadline = backoff_deadline.min(deadline);
            let ready = handle.wait_read(&Waited { fd: socket.get_fd(), deadline: Some(wait_deadline) }).await?;
            if !ready {
                tries += 1;
                debug!(name, query_type = query_type.name(), tries, "dns query timed out, resending");
                socket.send(handle, &wire).await?;
                continue;
            }

            let buf = socket.recv(handle, 4096).await?;
            match decode_response(&buf, query_id, query_type) {
                Ok(answer) => return Ok(answer),
                Err(RetryOrFail::Retry) => {
                    tries += 1;
                    continue;
                }
                Err(RetryOrFail::Fail(e)) => {
                    warn!(name, query_type = query_type.name(), error = %e, "dns query failed");
                    return Err(e);
                }
            }
        }
    }
}

enum RetryOrFail {
    /// A reply arrived that doesn't match this query (wrong id) — keep
    /// waiting for the real one rather than failing the whole query.
    Retry,
    Fail(RatchetError),
}

fn encode_query(id: u16, name: &str, query_type: QueryType) -> Result<Vec<u8>, RatchetError> {
    let fqdn = if name.ends_with('.') { name.to_string() } else { format!("{name}.") };
    let dns_name = Name::from_ascii(&fqdn)
        .map_err(|e| RatchetError::new("Resolver::query", ErrorKind::BadQuery, e.to_string()))?;
    let record_type = match query_type {
        QueryType::A => RecordType::A,
        QueryType::Aaaa => RecordType::AAAA,
        QueryType::Mx => RecordType::MX,
        QueryType::Ptr => RecordType::PTR,
        QueryType::Txt => RecordType::TXT,
        QueryType::Cname => RecordType::CNAME,
    };

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(dns_name, record_type));

    message
        .to_bytes()
        .map_err(|e| RatchetError::new("Resolver::query", ErrorKind::BadQuery, e.to_string()))
}

fn decode_response(buf: &[u8], expected_id: u16, query_type: QueryType) -> Result<DnsAnswer, RetryOrFail> {
    let message = Message::from_bytes(buf)
        .map_err(|e| RetryOrFail::Fail(RatchetError::new("Resolver::query", ErrorKind::Protocol, e.to_string())))?;

    if message.id() != expected_id {
        return Err(RetryOrFail::Retry);
    }

    use hickory_proto::op::ResponseCode;
    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Err(RetryOrFail::Fail(RatchetError::new("Resolver::query", ErrorKind::NxDomain, "no such domain"))),
        ResponseCode::ServFail => return Err(RetryOrFail::Fail(RatchetError::new("Resolver::query", ErrorKind::TempFail, "server failure"))),
        _ => return Err(RetryOrFail::Fail(RatchetError::new("Resolver::query", ErrorKind::Protocol, "malformed response"))),
    }

    if message.answers().is_empty() {
        return Err(RetryOrFail::Fail(RatchetError::new("Resolver::query", ErrorKind::NoData, "no records of requested type")));
    }

    let answer = match query_type {
        QueryType::A | QueryType::Aaaa => {
            let addrs: Vec<IpAddr> = message
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect();
            DnsAnswer::Addresses(addrs)
        }
        QueryType::Mx => {
            let records: Vec<MxRecord> = message
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    Some(RData::MX(mx)) => Some(MxRecord {
                        priority: mx.preference(),
                        exchange: mx.exchange().to_utf8(),
                    }),
                    _ => None,
                })
                .collect();
            DnsAnswer::MailExchangers(order_mx_records(records))
        }
        QueryType::Ptr => {
            let names: Vec<String> = message
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    Some(RData::PTR(ptr)) => Some(ptr.0.to_utf8()),
                    _ => None,
                })
                .collect();
            DnsAnswer::Names(names)
        }
        QueryType::Cname => {
            let names: Vec<String> = message
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    Some(RData::CNAME(cname)) => Some(cname.0.to_utf8()),
                    _ => None,
                })
                .collect();
            DnsAnswer::Names(names)
        }
        QueryType::Txt => {
            let texts: Vec<String> = message
                .answers()
                .iter()
                .filter_map(|r| match r.data() {
                    Some(RData::TXT(txt)) => Some(
                        txt.txt_data()
                            .iter()
                            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                            .collect::<Vec<_>>()
                            .join(""),
                    ),
                    _ => None,
                })
                .collect();
            DnsAnswer::Text(texts)
        }
    };

    Ok(answer)
}

/// A query name of `"*"` short-circuits to the wildcard address of the
/// matching family, without any packet traffic (§4.5 Specials).
fn wildcard_shortcut(name: &str, query_type: QueryType) -> Option<DnsAnswer> {
    if name != "*" {
        return None;
    }
    match query_type {
        QueryType::A => Some(DnsAnswer::Addresses(vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)])),
        QueryType::Aaaa => Some(DnsAnswer::Addresses(vec![IpAddr::V6(Ipv6Addr::UNSPECIFIED)])),
        _ => None,
    }
}

/// A literal address for an address query short-circuits similarly
/// (§4.5 Specials) — the source has no network round-trip for a name
/// that already parses as the answer it would produce.
fn literal_address_shortcut(name: &str, query_type: QueryType) -> Option<DnsAnswer> {
    let addr: IpAddr = name.parse().ok()?;
    match (query_type, addr) {
        (QueryType::A, IpAddr::V4(_)) | (QueryType::Aaaa, IpAddr::V6(_)) => Some(DnsAnswer::Addresses(vec![addr])),
        _ => None,
    }
}

/// PTR input normalization (§4.5, DESIGN.md Open Question (a)): literal
/// addresses become the reverse-DNS name; anything else, including an
/// already-`.arpa`'d name, is submitted unchanged.
pub fn normalize_ptr_query(name: &str) -> String {
    match name.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        Ok(IpAddr::V6(v6)) => {
            let mut nibbles = String::with_capacity(64);
            for byte in v6.octets().iter().rev() {
                nibbles.push_str(&format!("{:x}.{:x}.", byte & 0xf, byte >> 4));
            }
            format!("{nibbles}ip6.arpa.")
        }
        Err(_) => name.to_string(),
    }
}

fn read_nameserver(config: &ResolverConfig) -> Result<SocketAddr, RatchetError> {
    let contents = std::fs::read_to_string(config.resolv_conf())
        .unwrap_or_default();
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            if let Ok(addr) = rest.trim().parse::<IpAddr>() {
                return Ok(SocketAddr::new(addr, 53));
            }
        }
    }
    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr_normalization_reverses_a_literal_ipv4_address() {
        assert_eq!(normalize_ptr_query("192.0.2.1"), "1.2.0.192.in-addr.arpa.");
    }

    #[test]
    fn ptr_normalization_leaves_an_already_arpad_name_unchanged() {
        assert_eq!(normalize_ptr_query("1.2.0.192.in-addr.arpa"), "1.2.0.192.in-addr.arpa");
    }

    #[test]
    fn ptr_normalization_leaves_an_ordinary_hostname_unchanged() {
        assert_eq!(normalize_ptr_query("example.com"), "example.com");
    }

    #[test]
    fn wildcard_query_short_circuits_to_the_unspecified_address() {
        let answer = wildcard_shortcut("*", QueryType::A).unwrap();
        assert_eq!(answer, DnsAnswer::Addresses(vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]));
    }

    #[test]
    fn literal_address_query_short_circuits_without_a_lookup() {
        let answer = literal_address_shortcut("203.0.113.5", QueryType::A).unwrap();
        assert_eq!(answer, DnsAnswer::Addresses(vec!["203.0.113.5".parse().unwrap()]));
    }

    #[test_log::test]
    fn wildcard_query_through_the_resolver_never_touches_the_network() {
        let scheduler = ratchet_core::Scheduler::new(|handle| async move {
            let resolver = Resolver::new(ResolverConfig::default().resolv_conf_path("/dev/null"))?;
            let answer = resolver.query(&handle, "*", QueryType::A).await?;
            assert_eq!(answer, DnsAnswer::Addresses(vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]));
            Ok(())
        })
        .unwrap();
        scheduler.run_until_done().unwrap();
    }
}
