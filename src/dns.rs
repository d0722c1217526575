//! DNS message parsing and construction.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub(crate) const HEADER_LEN: usize = 12;

/// Upper bound on answer records copied into one reply.
pub const MAX_ANSWERS: usize = 14;

/// Class IN.
pub const CLASS_IN: u16 = 1;

/// Resource record type codes used by the router.
pub mod rtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const HTTPS: u16 = 65;
}

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

/// Maximum compression pointers followed while decoding a single name.
const MAX_POINTER_HOPS: usize = 16;

/// Query types the router distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    A,
    Aaaa,
    Https,
    Other(u16),
}

impl QueryType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            rtype::A => QueryType::A,
            rtype::AAAA => QueryType::Aaaa,
            rtype::HTTPS => QueryType::Https,
            other => QueryType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            QueryType::A => rtype::A,
            QueryType::Aaaa => rtype::AAAA,
            QueryType::Https => rtype::HTTPS,
            QueryType::Other(value) => value,
        }
    }

    /// Name used in DoH `type=` parameters. Unknown types use their number.
    pub fn name(self) -> String {
        match self {
            QueryType::A => "A".to_string(),
            QueryType::Aaaa => "AAAA".to_string(),
            QueryType::Https => "HTTPS".to_string(),
            QueryType::Other(value) => value.to_string(),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryType::Other(value) => write!(f, "TYPE{value}"),
            known => f.write_str(&known.name()),
        }
    }
}

/// DNS response code (RCODE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other),
        }
    }

    /// Map a DoH JSON `Status` onto an RCODE. Out of range values become SERVFAIL.
    pub fn from_status(status: i64) -> Self {
        match u8::try_from(status) {
            Ok(value) if value < 16 => Self::from_u8(value),
            _ => ResponseCode::ServFail,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormErr => 1,
            ResponseCode::ServFail => 2,
            ResponseCode::NxDomain => 3,
            ResponseCode::NotImp => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Other(value) => value & 0x0F,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::NoError => f.write_str("NOERROR"),
            ResponseCode::FormErr => f.write_str("FORMERR"),
            ResponseCode::ServFail => f.write_str("SERVFAIL"),
            ResponseCode::NxDomain => f.write_str("NXDOMAIN"),
            ResponseCode::NotImp => f.write_str("NOTIMP"),
            ResponseCode::Refused => f.write_str("REFUSED"),
            ResponseCode::Other(value) => write!(f, "RCODE{value}"),
        }
    }
}

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    /// Lowercased name used for classification and cache keys.
    pub domain: String,
    /// Name exactly as received, echoed back in the reply.
    pub raw_name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if flags & FLAG_QR != 0 || qdcount == 0 {
            return None;
        }

        // Parse domain name
        let mut pos = HEADER_LEN;
        let mut domain_parts = Vec::new();

        while pos < data.len() {
            let label_len = data[pos] as usize;
            if label_len == 0 {
                pos += 1;
                break;
            }
            if label_len > 63 {
                return None;
            }
            pos += 1;
            if pos + label_len > data.len() {
                return None;
            }
            let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
            domain_parts.push(label.to_string());
            pos += label_len;
        }

        if domain_parts.is_empty() {
            return None;
        }

        // Parse QTYPE and QCLASS
        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        let raw_name = domain_parts.join(".");
        Some(Self {
            id,
            domain: raw_name.to_lowercase(),
            raw_name,
            qtype: QueryType::from_u16(qtype),
            qclass,
        })
    }

    /// The question as the client sent it.
    pub fn question(&self) -> DnsQuestion {
        DnsQuestion {
            domain: self.raw_name.clone(),
            qtype: self.qtype.to_u16(),
            qclass: self.qclass,
        }
    }
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Encode a recursive query for `question` carrying transaction `id`.
pub fn encode_query(id: u16, question: &DnsQuestion) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + question.domain.len() + 6);

    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&FLAG_RD.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    encode_domain(&mut data, &question.domain);
    data.extend_from_slice(&question.qtype.to_be_bytes());
    data.extend_from_slice(&question.qclass.to_be_bytes());

    data
}

/// A DNS resource record.
///
/// `rdata` never contains compression pointers, so a record can be copied
/// between messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn a(name: impl Into<String>, address: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.into(),
            rtype: rtype::A,
            class: CLASS_IN,
            ttl,
            rdata: address.octets().to_vec(),
        }
    }

    pub fn aaaa(name: impl Into<String>, address: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.into(),
            rtype: rtype::AAAA,
            class: CLASS_IN,
            ttl,
            rdata: address.octets().to_vec(),
        }
    }

    pub fn cname(name: impl Into<String>, target: &str, ttl: u32) -> Self {
        let mut rdata = Vec::with_capacity(target.len() + 2);
        encode_domain(&mut rdata, target);
        Self {
            name: name.into(),
            rtype: rtype::CNAME,
            class: CLASS_IN,
            ttl,
            rdata,
        }
    }

    /// The address of an A record.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != rtype::A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// Smallest TTL across `records`.
pub fn min_ttl(records: &[DnsRecord]) -> Option<u32> {
    records.iter().map(|r| r.ttl).min()
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

impl DnsResponse {
    /// Build a reply to `query` with the given code and answers.
    ///
    /// Answers beyond [`MAX_ANSWERS`] are dropped.
    pub fn reply(query: &DnsQuery, code: ResponseCode, mut answers: Vec<DnsRecord>) -> Self {
        answers.truncate(MAX_ANSWERS);
        Self {
            id: query.id,
            flags: FLAG_QR | FLAG_RD | FLAG_RA | code.to_u8() as u16,
            questions: vec![query.question()],
            answers,
        }
    }

    pub fn code(&self) -> ResponseCode {
        ResponseCode::from_u8((self.flags & 0x000F) as u8)
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        // Questions
        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        // Answers
        for a in &self.answers {
            // Use compression pointer if this is the first question's domain
            if !self.questions.is_empty() && a.name.eq_ignore_ascii_case(&self.questions[0].domain)
            {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }

    /// Parse a response message. Authority and additional sections are ignored.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        if flags & FLAG_QR == 0 {
            return None;
        }
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (domain, next) = read_name(data, pos)?;
            let fixed = data.get(next..next + 4)?;
            questions.push(DnsQuestion {
                domain,
                qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
                qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
            });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(ancount.min(MAX_ANSWERS));
        for _ in 0..ancount {
            let (record, next) = read_record(data, pos)?;
            answers.push(record);
            pos = next;
        }

        Some(Self {
            id,
            flags,
            questions,
            answers,
        })
    }
}

pub(crate) fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = &label.as_bytes()[..label.len().min(63)];
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
}

/// Decode a possibly compressed name starting at `pos`.
///
/// Returns the dotted name and the offset just past the name in the
/// original byte stream.
fn read_name(data: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        if len & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1)? as usize;
            if end.is_none() {
                end = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1;
        if len == 0 {
            break;
        }
        let label = data.get(pos..pos + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += len;
    }

    Some((labels.join("."), end.unwrap_or(pos)))
}

fn read_record(data: &[u8], pos: usize) -> Option<(DnsRecord, usize)> {
    let (name, pos) = read_name(data, pos)?;
    let fixed = data.get(pos..pos + 10)?;
    let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let class = u16::from_be_bytes([fixed[2], fixed[3]]);
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
    let start = pos + 10;
    let raw = data.get(start..start + rdlength)?;

    // Names inside RDATA may point elsewhere in the message; expand them.
    let rdata = match rtype {
        rtype::CNAME | rtype::NS | rtype::PTR => {
            let (target, _) = read_name(data, start)?;
            let mut out = Vec::with_capacity(target.len() + 2);
            encode_domain(&mut out, &target);
            out
        }
        rtype::MX => {
            let (exchange, _) = read_name(data, start + 2)?;
            let mut out = raw.get(..2)?.to_vec();
            encode_domain(&mut out, &exchange);
            out
        }
        rtype::SRV => {
            let (target, _) = read_name(data, start + 6)?;
            let mut out = raw.get(..6)?.to_vec();
            encode_domain(&mut out, &target);
            out
        }
        rtype::SOA => {
            let (mname, next) = read_name(data, start)?;
            let (rname, next) = read_name(data, next)?;
            let tail = data.get(next..next + 20)?;
            let mut out = Vec::with_capacity(mname.len() + rname.len() + 24);
            encode_domain(&mut out, &mname);
            encode_domain(&mut out, &rname);
            out.extend_from_slice(tail);
            out
        }
        _ => raw.to_vec(),
    };

    Some((
        DnsRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        },
        start + rdlength,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_bytes(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
        encode_query(
            id,
            &DnsQuestion {
                domain: domain.to_string(),
                qtype,
                qclass: CLASS_IN,
            },
        )
    }

    #[test]
    fn parse_query_lowercases_domain() {
        let bytes = query_bytes(0x1234, "WWW.Example.COM", rtype::A);

        let query = DnsQuery::parse(&bytes).unwrap();

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.domain, "www.example.com");
        assert_eq!(query.raw_name, "WWW.Example.COM");
        assert_eq!(query.qtype, QueryType::A);
        assert_eq!(query.qclass, CLASS_IN);
    }

    #[test]
    fn parse_query_rejects_truncated_packet() {
        let bytes = query_bytes(1, "example.com", rtype::A);

        assert!(DnsQuery::parse(&bytes[..bytes.len() - 3]).is_none());
        assert!(DnsQuery::parse(&bytes[..8]).is_none());
    }

    #[test]
    fn parse_query_rejects_responses() {
        let mut bytes = query_bytes(1, "example.com", rtype::A);
        bytes[2] |= 0x80;

        assert!(DnsQuery::parse(&bytes).is_none());
    }

    #[test]
    fn reply_echoes_question_and_code() {
        let query = DnsQuery::parse(&query_bytes(77, "example.com", rtype::AAAA)).unwrap();
        let reply = DnsResponse::reply(&query, ResponseCode::NxDomain, vec![]);

        let parsed = DnsResponse::parse(&reply.to_bytes()).unwrap();

        assert_eq!(parsed.id, 77);
        assert_eq!(parsed.code(), ResponseCode::NxDomain);
        assert_eq!(parsed.questions, vec![query.question()]);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn reply_echoes_mixed_case_question_bytes() {
        let request = query_bytes(0x4242, "WwW.ExAmple.CoM", rtype::A);
        let query = DnsQuery::parse(&request).unwrap();
        let answers = vec![DnsRecord::a(query.domain.clone(), Ipv4Addr::new(1, 2, 3, 4), 60)];

        let reply = DnsResponse::reply(&query, ResponseCode::NoError, answers).to_bytes();

        let question = &request[HEADER_LEN..];
        assert_eq!(&reply[HEADER_LEN..HEADER_LEN + question.len()], question);
        let parsed = DnsResponse::parse(&reply).unwrap();
        assert_eq!(parsed.answers[0].ipv4(), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn reply_caps_answer_count() {
        let query = DnsQuery::parse(&query_bytes(1, "example.com", rtype::A)).unwrap();
        let answers = (0..20u8)
            .map(|i| DnsRecord::a("example.com", Ipv4Addr::new(10, 0, 0, i), 60))
            .collect();

        let reply = DnsResponse::reply(&query, ResponseCode::NoError, answers);

        assert_eq!(reply.answers.len(), MAX_ANSWERS);
        let bytes = reply.to_bytes();
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), MAX_ANSWERS as u16);
    }

    #[test]
    fn parse_expands_compressed_cname_target() {
        let query = DnsQuery::parse(&query_bytes(9, "www.example.com", rtype::A)).unwrap();
        let mut bytes = DnsResponse::reply(&query, ResponseCode::NoError, vec![]).to_bytes();
        bytes[7] = 2; // ANCOUNT
        // www.example.com CNAME example.com (pointer into the question)
        bytes.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x05, 0x00, 0x01]);
        bytes.extend_from_slice(&300u32.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x02, 0xC0, 0x10]);
        // example.com A 1.2.3.4
        bytes.extend_from_slice(&[0xC0, 0x10, 0x00, 0x01, 0x00, 0x01]);
        bytes.extend_from_slice(&60u32.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x04, 1, 2, 3, 4]);

        let parsed = DnsResponse::parse(&bytes).unwrap();

        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(
            parsed.answers[0],
            DnsRecord::cname("www.example.com", "example.com", 300)
        );
        assert_eq!(parsed.answers[1].name, "example.com");
        assert_eq!(parsed.answers[1].ipv4(), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(min_ttl(&parsed.answers), Some(60));
    }

    #[test]
    fn parse_rejects_pointer_loops() {
        let query = DnsQuery::parse(&query_bytes(9, "example.com", rtype::A)).unwrap();
        let mut bytes = DnsResponse::reply(&query, ResponseCode::NoError, vec![]).to_bytes();
        bytes[7] = 1;
        let at = bytes.len();
        bytes.extend_from_slice(&[0xC0, at as u8]);
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0, 0, 0, 1, 0x00, 0x04, 1, 2, 3, 4]);

        assert!(DnsResponse::parse(&bytes).is_none());
    }

    #[test]
    fn response_code_from_doh_status() {
        assert_eq!(ResponseCode::from_status(0), ResponseCode::NoError);
        assert_eq!(ResponseCode::from_status(3), ResponseCode::NxDomain);
        assert_eq!(ResponseCode::from_status(-1), ResponseCode::ServFail);
        assert_eq!(ResponseCode::from_status(4096), ResponseCode::ServFail);
    }

    #[test]
    fn query_type_names() {
        assert_eq!(QueryType::from_u16(65), QueryType::Https);
        assert_eq!(QueryType::Aaaa.name(), "AAAA");
        assert_eq!(QueryType::Other(99).name(), "99");
        assert_eq!(QueryType::Other(99).to_string(), "TYPE99");
    }
}
