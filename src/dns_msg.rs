/*
DNS message wire format (RFC 1035 §4), big-endian throughout.

Header:
                                1  1  1  1  1  1
  0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                      ID                       |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    QDCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ANCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    NSCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
|                    ARCOUNT                    |
+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+

Question: QNAME (length-prefixed labels, zero terminated), QTYPE, QCLASS.

Answer records are assumed to be A records whose name is the 2-byte
pointer/offset form, giving a fixed 16-byte layout:
name(2) type(2) class(2) ttl(4) rdlength(2) rdata(4).
*/

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32},
    sequence::tuple,
};
use thiserror::Error;

use nom::bits::complete::take as take_bits;

pub const HEADER_SIZE: usize = 12;
pub const RECORD_SIZE: usize = 16;
pub const MAX_LABEL_LEN: usize = 63;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

/// Top two bits of a length byte mark a compression pointer.
const POINTER_MASK: u8 = 0b1100_0000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid hostname: labels must be 1-63 bytes")]
    InvalidHostname,
    #[error("name runs past the end of the message")]
    MalformedName,
    #[error("compressed names are not supported")]
    UnsupportedCompression,
    #[error("message shorter than the {HEADER_SIZE} byte header")]
    TruncatedHeader,
    #[error("question section cut short")]
    TruncatedQuestion,
    #[error("answer record cut short")]
    TruncatedRecord,
    #[error("unsupported record type {0}, only A records are handled")]
    UnsupportedRecordType(u16),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Flags {
    pub qr: u8,
    pub opcode: u8,
    pub aa: u8,
    pub tc: u8,
    pub rd: u8,
    pub ra: u8,
    pub rcode: u8,
}

impl Flags {
    /// Packs into the 16-bit flags word. Z bits stay zero.
    pub fn to_u16(self) -> u16 {
        let hi: u8 = (self.qr << 7) | (self.opcode << 3) | (self.aa << 2) | (self.tc << 1) | self.rd;
        let lo: u8 = (self.ra << 7) | self.rcode;

        (hi as u16) << 8 | lo as u16
    }

    fn parse<'a>(input: (&'a [u8], usize)) -> nom::IResult<(&'a [u8], usize), Flags> {
        let (rest, (qr, opcode, aa, tc, rd, ra, _z, rcode)): (_, (u8, u8, u8, u8, u8, u8, u8, u8)) =
            tuple((
                take_bits(1u8),
                take_bits(4u8),
                take_bits(1u8),
                take_bits(1u8),
                take_bits(1u8),
                take_bits(1u8),
                take_bits(3u8),
                take_bits(4u8),
            ))(input)?;

        Ok((
            rest,
            Flags {
                qr,
                opcode,
                aa,
                tc,
                rd,
                ra,
                rcode,
            },
        ))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: Flags,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    /// The outbound header for a recursive A query: everything zero
    /// except RD and a question count of one.
    pub fn query(id: u16) -> Self {
        Header {
            id,
            flags: Flags {
                qr: 0,
                opcode: 0,
                aa: 0,
                tc: 0,
                rd: 1,
                ra: 0,
                rcode: 0,
            },
            qd_count: 1,
            an_count: 0,
            ns_count: 0,
            ar_count: 0,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags.to_u16());
        buf.put_u16(self.qd_count);
        buf.put_u16(self.an_count);
        buf.put_u16(self.ns_count);
        buf.put_u16(self.ar_count);
    }

    fn parse<'a>(buf: &'a [u8]) -> nom::IResult<&'a [u8], Header> {
        let (rest, (id, flags, qd_count, an_count, ns_count, ar_count)) = tuple((
            be_u16,
            nom::bits::bits(Flags::parse),
            be_u16,
            be_u16,
            be_u16,
            be_u16,
        ))(buf)?;

        Ok((
            rest,
            Header {
                id,
                flags,
                qd_count,
                an_count,
                ns_count,
                ar_count,
            },
        ))
    }

    /// Decodes the fixed header at the front of `buf`, returning the
    /// offset of the first byte after it.
    pub fn decode(buf: &[u8]) -> Result<(Header, usize), WireError> {
        let (rest, header) = Self::parse(buf).map_err(|_| WireError::TruncatedHeader)?;
        Ok((header, buf.len() - rest.len()))
    }
}

/// Appends `hostname` as length-prefixed labels plus the terminating
/// zero byte, exactly sum(1 + label_len) + 1 bytes.
pub fn encode_name(hostname: &str, buf: &mut BytesMut) -> Result<(), WireError> {
    if hostname.is_empty() {
        return Err(WireError::InvalidHostname);
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(WireError::InvalidHostname);
        }
        buf.put_u8(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.put_u8(0);

    Ok(())
}

/// Reads a label sequence starting at `start`, joining labels with `.`.
/// Returns the name and the offset one past the terminating zero.
///
/// A length byte with its top two bits set is a compression pointer;
/// those are out of scope and rejected outright rather than misread as
/// a literal length.
pub fn decode_name(buf: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;

    loop {
        let len = *buf.get(pos).ok_or(WireError::MalformedName)?;
        pos += 1;
        if len == 0 {
            break;
        }
        if len & POINTER_MASK != 0 {
            return Err(WireError::UnsupportedCompression);
        }
        let label = buf
            .get(pos..pos + len as usize)
            .ok_or(WireError::MalformedName)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += len as usize;
    }

    Ok((labels.join("."), pos))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

fn parse_question_tail<'a>(buf: &'a [u8]) -> nom::IResult<&'a [u8], (u16, u16)> {
    tuple((be_u16, be_u16))(buf)
}

impl Question {
    pub fn for_host(hostname: &str) -> Self {
        Question {
            name: hostname.to_string(),
            qtype: TYPE_A,
            qclass: CLASS_IN,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        encode_name(&self.name, buf)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);

        Ok(())
    }

    pub fn decode(buf: &[u8], start: usize) -> Result<(Question, usize), WireError> {
        let (name, after_name) = decode_name(buf, start)?;
        let (_, (qtype, qclass)) =
            parse_question_tail(&buf[after_name..]).map_err(|_| WireError::TruncatedQuestion)?;

        Ok((
            Question {
                name,
                qtype,
                qclass,
            },
            after_name + 4,
        ))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Raw 2-byte name field: top two bits flag a compression pointer,
    /// the low 14 are an offset into the message. Parsed, never
    /// dereferenced.
    pub name_ref: u16,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rd_length: u16,
    pub addr: Ipv4Addr,
}

impl ResourceRecord {
    pub fn is_pointer(&self) -> bool {
        self.name_ref & 0xC000 == 0xC000
    }

    pub fn name_offset(&self) -> u16 {
        self.name_ref & 0x3FFF
    }
}

fn parse_record<'a>(buf: &'a [u8]) -> nom::IResult<&'a [u8], ResourceRecord> {
    let (rest, (name_ref, rtype, rclass, ttl, rd_length, rdata)) =
        tuple((be_u16, be_u16, be_u16, be_u32, be_u16, take(4usize)))(buf)?;

    Ok((
        rest,
        ResourceRecord {
            name_ref,
            rtype,
            rclass,
            ttl,
            rd_length,
            addr: Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]),
        },
    ))
}

/// Lazy walk over the answer section: `count` records at a fixed
/// 16-byte stride from `start`. Stops for good after the first record
/// that is short or not an A record, since a record of any other shape
/// would desynchronize the stride.
pub struct Answers<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: u16,
    failed: bool,
}

impl<'a> Answers<'a> {
    pub fn new(buf: &'a [u8], start: usize, count: u16) -> Self {
        Answers {
            buf,
            pos: start,
            remaining: count,
            failed: false,
        }
    }
}

impl Iterator for Answers<'_> {
    type Item = Result<ResourceRecord, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }

        let chunk = match self.buf.get(self.pos..self.pos + RECORD_SIZE) {
            Some(chunk) => chunk,
            None => {
                self.failed = true;
                return Some(Err(WireError::TruncatedRecord));
            }
        };
        let record = match parse_record(chunk) {
            Ok((_, record)) => record,
            Err(_) => {
                self.failed = true;
                return Some(Err(WireError::TruncatedRecord));
            }
        };
        if record.rtype != TYPE_A {
            // The next offset would be wrong anyway.
            self.failed = true;
            return Some(Err(WireError::UnsupportedRecordType(record.rtype)));
        }

        self.pos += RECORD_SIZE;
        self.remaining -= 1;
        Some(Ok(record))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub header: Header,
    pub question: Question,
    pub answers: Vec<ResourceRecord>,
}

/// Serializes one recursive A query for `hostname`: header then
/// question, contiguous.
pub fn build_query(id: u16, hostname: &str) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + hostname.len() + 2 + 4);
    Header::query(id).encode(&mut buf);
    Question::for_host(hostname).encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Decodes a reply datagram: header, echoed question, then
/// `an_count` answer records.
pub fn decode_response(buf: &[u8]) -> Result<DnsResponse, WireError> {
    let (header, after_header) = Header::decode(buf)?;
    let (question, after_question) = Question::decode(buf, after_header)?;
    let answers = Answers::new(buf, after_question, header.an_count)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DnsResponse {
        header,
        question,
        answers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_name(host: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_name(host, &mut buf).unwrap();
        buf
    }

    #[test]
    fn name_encoding_matches_wire_layout() {
        let buf = encoded_name("example.com");
        assert_eq!(&buf[..], b"\x07example\x03com\x00");
        assert_eq!(buf.len(), 13);
    }

    #[test]
    fn name_round_trip() {
        for host in ["example.com", "a.bc.def", "localhost", "x.y"] {
            let buf = encoded_name(host);
            let (name, end) = decode_name(&buf, 0).unwrap();
            assert_eq!(name, host);
            assert_eq!(end, buf.len());
        }
    }

    #[test]
    fn rejects_bad_hostnames() {
        let mut buf = BytesMut::new();
        for host in ["", "a..b", ".", ".com", "trailing."] {
            assert_eq!(
                encode_name(host, &mut buf),
                Err(WireError::InvalidHostname),
                "{host:?}"
            );
        }
        let long = "a".repeat(64);
        assert_eq!(encode_name(&long, &mut buf), Err(WireError::InvalidHostname));
        // 63 is still fine
        assert!(encode_name(&"a".repeat(63), &mut buf).is_ok());
    }

    #[test]
    fn name_decode_rejects_compression_pointer() {
        assert_eq!(
            decode_name(&[0xC0, 0x0C], 0),
            Err(WireError::UnsupportedCompression)
        );
    }

    #[test]
    fn name_decode_rejects_overrun() {
        // length byte claims 5, only 2 bytes follow
        assert_eq!(
            decode_name(&[5, b'a', b'b'], 0),
            Err(WireError::MalformedName)
        );
        // missing terminator
        assert_eq!(decode_name(b"\x02ab", 0), Err(WireError::MalformedName));
    }

    #[test]
    fn header_round_trip() {
        let header = Header {
            id: 0xBEEF,
            flags: Flags {
                qr: 1,
                opcode: 15,
                aa: 1,
                tc: 0,
                rd: 1,
                ra: 1,
                rcode: 15,
            },
            qd_count: 1,
            an_count: 2,
            ns_count: 3,
            ar_count: 4,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let (decoded, end) = Header::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(end, HEADER_SIZE);
    }

    #[test]
    fn header_too_short() {
        assert_eq!(
            Header::decode(&[0u8; HEADER_SIZE - 1]),
            Err(WireError::TruncatedHeader)
        );
    }

    #[test]
    fn query_header_defaults() {
        let header = Header::query(7);
        assert_eq!(header.id, 7);
        assert_eq!(header.qd_count, 1);
        assert_eq!(header.an_count, 0);
        // only RD set: 0x0100
        assert_eq!(header.flags.to_u16(), 0x0100);
    }

    #[test]
    fn question_round_trip() {
        let question = Question::for_host("example.com");
        let mut buf = BytesMut::new();
        question.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 13 + 4);

        let (decoded, end) = Question::decode(&buf, 0).unwrap();
        assert_eq!(decoded, question);
        assert_eq!(end, buf.len());
        assert_eq!(decoded.qtype, TYPE_A);
        assert_eq!(decoded.qclass, CLASS_IN);
    }

    #[test]
    fn question_cut_short() {
        let mut buf = encoded_name("example.com");
        buf.put_u16(TYPE_A); // qclass missing
        assert_eq!(
            Question::decode(&buf, 0),
            Err(WireError::TruncatedQuestion)
        );
    }

    fn record_bytes(rtype: u16, addr: [u8; 4]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(0xC00C); // pointer to the question name
        buf.put_u16(rtype);
        buf.put_u16(CLASS_IN);
        buf.put_u32(300);
        buf.put_u16(4);
        buf.extend_from_slice(&addr);
        buf
    }

    #[test]
    fn zero_answers_is_empty_and_clean() {
        let answers: Vec<_> = Answers::new(&[], 0, 0).collect();
        assert!(answers.is_empty());
    }

    #[test]
    fn answer_record_fields() {
        let buf = record_bytes(TYPE_A, [93, 184, 216, 34]);
        let records: Result<Vec<_>, _> = Answers::new(&buf, 0, 1).collect();
        let records = records.unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.is_pointer());
        assert_eq!(record.name_offset(), 12);
        assert_eq!(record.rtype, TYPE_A);
        assert_eq!(record.ttl, 300);
        assert_eq!(record.rd_length, 4);
        assert_eq!(record.addr, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[test]
    fn truncated_record_halts_iteration() {
        let buf = record_bytes(TYPE_A, [1, 2, 3, 4]);
        // one byte short of a full record
        let mut answers = Answers::new(&buf[..RECORD_SIZE - 1], 0, 1);
        assert_eq!(answers.next(), Some(Err(WireError::TruncatedRecord)));
        assert_eq!(answers.next(), None);
    }

    #[test]
    fn non_a_record_halts_before_next_stride() {
        let mut buf = record_bytes(5, [0, 0, 0, 0]); // CNAME
        buf.extend_from_slice(&record_bytes(TYPE_A, [1, 2, 3, 4]));

        let mut answers = Answers::new(&buf, 0, 2);
        assert_eq!(
            answers.next(),
            Some(Err(WireError::UnsupportedRecordType(5)))
        );
        assert_eq!(answers.next(), None);
    }

    fn example_reply() -> BytesMut {
        let mut buf = BytesMut::new();
        Header {
            id: 1,
            flags: Flags {
                qr: 1,
                opcode: 0,
                aa: 0,
                tc: 0,
                rd: 1,
                ra: 0,
                rcode: 0,
            },
            qd_count: 1,
            an_count: 1,
            ns_count: 0,
            ar_count: 0,
        }
        .encode(&mut buf);
        Question::for_host("example.com").encode(&mut buf).unwrap();
        buf.extend_from_slice(&record_bytes(TYPE_A, [93, 184, 216, 34]));
        buf
    }

    #[test]
    fn decodes_crafted_reply_end_to_end() {
        let response = decode_response(&example_reply()).unwrap();

        assert_eq!(response.header.id, 1);
        assert_eq!(response.header.flags.qr, 1);
        assert_eq!(response.header.an_count, 1);
        assert_eq!(response.question.name, "example.com");
        assert_eq!(response.answers.len(), 1);
        assert_eq!(
            response.answers[0].addr,
            "93.184.216.34".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn compressed_question_name_is_rejected() {
        let mut buf = BytesMut::new();
        Header::query(1).encode(&mut buf);
        // question name starts with a compression pointer
        buf.put_u16(0xC00C);
        buf.put_u16(TYPE_A);
        buf.put_u16(CLASS_IN);

        assert_eq!(
            decode_response(&buf),
            Err(WireError::UnsupportedCompression)
        );
    }

    #[test]
    fn reply_missing_answer_bytes() {
        let buf = example_reply();
        assert_eq!(
            decode_response(&buf[..buf.len() - 1]),
            Err(WireError::TruncatedRecord)
        );
    }

    #[test]
    fn built_query_layout() {
        let query = build_query(0x0102, "example.com").unwrap();
        assert_eq!(query.len(), HEADER_SIZE + 13 + 4);
        assert_eq!(&query[..4], &[0x01, 0x02, 0x01, 0x00]);
        assert_eq!(&query[4..6], &[0x00, 0x01]); // qd_count
        assert_eq!(&query[HEADER_SIZE..HEADER_SIZE + 13], b"\x07example\x03com\x00");
        assert_eq!(&query[HEADER_SIZE + 13..], &[0x00, 0x01, 0x00, 0x01]);
    }
}
