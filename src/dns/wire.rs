//! Minimal DNS wire-format reader: enough of RFC 1035 to pull questions and
//! answer records out of sniffed UDP payloads. Transport agnostic; the
//! caller hands in the raw message bytes.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 8;

/// Numeric RR type to its mnemonic; unknown types render as `TYPE<n>`.
pub fn qtype_name(qtype: u16) -> String {
    match qtype {
        1 => "A".to_string(),
        2 => "NS".to_string(),
        5 => "CNAME".to_string(),
        6 => "SOA".to_string(),
        12 => "PTR".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        33 => "SRV".to_string(),
        n => format!("TYPE{n}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Txt(String),
    Soa { mname: String },
    Srv { port: u16, target: String },
    Other(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub data: RecordData,
}

#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::InputMalformed("dns message truncated".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let hi = self.read_u8()? as u16;
        let lo = self.read_u8()? as u16;
        Ok(hi << 8 | lo)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Ok(hi << 16 | lo)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::InputMalformed("dns message truncated".into()))?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.read_slice(len).map(|_| ())
    }

    /// Reads a possibly-compressed domain name starting at the cursor and
    /// leaves the cursor after the name (after the pointer, if one was
    /// followed). Jump count is bounded so a pointer loop cannot hang us.
    fn read_name(&mut self) -> Result<String> {
        let mut name = String::new();
        let mut pos = self.pos;
        let mut jumps = 0usize;
        let mut cursor_after: Option<usize> = None;

        loop {
            let len = *self
                .buf
                .get(pos)
                .ok_or_else(|| Error::InputMalformed("dns name truncated".into()))?;
            if len & 0xC0 == 0xC0 {
                let lo = *self
                    .buf
                    .get(pos + 1)
                    .ok_or_else(|| Error::InputMalformed("dns pointer truncated".into()))?;
                if cursor_after.is_none() {
                    cursor_after = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(Error::InputMalformed("dns pointer loop".into()));
                }
                pos = ((len as usize & 0x3F) << 8) | lo as usize;
                continue;
            }
            if len == 0 {
                pos += 1;
                break;
            }
            let start = pos + 1;
            let end = start + len as usize;
            let label = self
                .buf
                .get(start..end)
                .ok_or_else(|| Error::InputMalformed("dns label truncated".into()))?;
            if !name.is_empty() {
                name.push('.');
            }
            for &b in label {
                name.push(b.to_ascii_lowercase() as char);
            }
            if name.len() > MAX_NAME_LEN {
                return Err(Error::InputMalformed("dns name too long".into()));
            }
            pos = end;
        }

        self.pos = cursor_after.unwrap_or(pos);
        Ok(name)
    }
}

/// Parses one DNS message. Authority and additional sections are skipped; a
/// malformed record mid-answers keeps whatever decoded before it.
pub fn parse_message(buf: &[u8]) -> Result<DnsMessage> {
    let mut r = Reader::new(buf);

    let id = r.read_u16()?;
    let flags = r.read_u16()?;
    let is_response = flags & 0x8000 != 0;
    let qdcount = r.read_u16()?;
    let ancount = r.read_u16()?;
    let _nscount = r.read_u16()?;
    let _arcount = r.read_u16()?;

    let mut questions = Vec::with_capacity(qdcount.min(16) as usize);
    for _ in 0..qdcount {
        let name = r.read_name()?;
        let qtype = r.read_u16()?;
        let _class = r.read_u16()?;
        questions.push(Question { name, qtype });
    }

    let mut answers = Vec::with_capacity(ancount.min(32) as usize);
    for _ in 0..ancount {
        // One bad record ends the answer walk but keeps what decoded so far.
        match parse_record(&mut r) {
            Ok(rec) => answers.push(rec),
            Err(_) => break,
        }
    }

    Ok(DnsMessage {
        id,
        is_response,
        questions,
        answers,
    })
}

fn parse_record(r: &mut Reader<'_>) -> Result<Record> {
    let name = r.read_name()?;
    let rtype = r.read_u16()?;
    let _class = r.read_u16()?;
    let _ttl = r.read_u32()?;
    let rdlen = r.read_u16()? as usize;
    let rdata_start = r.pos;
    let rdata_end = rdata_start
        .checked_add(rdlen)
        .filter(|end| *end <= r.buf.len())
        .ok_or_else(|| Error::InputMalformed("dns rdata truncated".into()))?;

    let data = match rtype {
        1 if rdlen == 4 => {
            let s = r.read_slice(4)?;
            RecordData::A(Ipv4Addr::new(s[0], s[1], s[2], s[3]))
        }
        28 if rdlen == 16 => {
            let s = r.read_slice(16)?;
            let mut o = [0u8; 16];
            o.copy_from_slice(s);
            RecordData::Aaaa(Ipv6Addr::from(o))
        }
        2 => RecordData::Ns(r.read_name()?),
        5 => RecordData::Cname(r.read_name()?),
        12 => RecordData::Ptr(r.read_name()?),
        6 => {
            let mname = r.read_name()?;
            RecordData::Soa { mname }
        }
        15 => {
            let preference = r.read_u16()?;
            let exchange = r.read_name()?;
            RecordData::Mx {
                preference,
                exchange,
            }
        }
        33 => {
            let _priority = r.read_u16()?;
            let _weight = r.read_u16()?;
            let port = r.read_u16()?;
            let target = r.read_name()?;
            RecordData::Srv { port, target }
        }
        16 => {
            // TXT is one or more <len><chars> strings, concatenated.
            let mut text = String::new();
            while r.pos < rdata_end {
                let len = r.read_u8()? as usize;
                let chunk = r.read_slice(len.min(rdata_end - r.pos))?;
                text.push_str(&String::from_utf8_lossy(chunk));
            }
            RecordData::Txt(text)
        }
        _ => RecordData::Other(r.read_slice(rdlen)?.to_vec()),
    };

    // Name compression inside rdata can leave the cursor short of rdlen;
    // records are always rdlen-delimited on the wire.
    if r.pos < rdata_end {
        r.skip(rdata_end - r.pos)?;
    } else if r.pos > rdata_end {
        return Err(Error::InputMalformed("dns rdata overrun".into()));
    }

    Ok(Record { name, rtype, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_name(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    fn header(id: u16, response: bool, qd: u16, an: u16) -> Vec<u8> {
        let flags: u16 = if response { 0x8180 } else { 0x0100 };
        let mut b = Vec::new();
        b.extend_from_slice(&id.to_be_bytes());
        b.extend_from_slice(&flags.to_be_bytes());
        b.extend_from_slice(&qd.to_be_bytes());
        b.extend_from_slice(&an.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b.extend_from_slice(&0u16.to_be_bytes());
        b
    }

    #[test]
    fn parses_query_with_two_questions() {
        let mut b = header(0x1234, false, 2, 0);
        push_name(&mut b, "Example.COM");
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());
        push_name(&mut b, "mail.example.com");
        b.extend_from_slice(&28u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());

        let msg = parse_message(&b).unwrap();
        assert!(!msg.is_response);
        assert_eq!(msg.questions.len(), 2);
        assert_eq!(msg.questions[0].name, "example.com");
        assert_eq!(msg.questions[0].qtype, 1);
        assert_eq!(msg.questions[1].name, "mail.example.com");
        assert_eq!(msg.questions[1].qtype, 28);
    }

    #[test]
    fn parses_response_with_compressed_answer_names() {
        let mut b = header(7, true, 1, 2);
        push_name(&mut b, "example.com"); // question name at offset 12
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());

        // answer 1: pointer to offset 12, A 93.184.216.34
        b.extend_from_slice(&[0xC0, 12]);
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&300u32.to_be_bytes());
        b.extend_from_slice(&4u16.to_be_bytes());
        b.extend_from_slice(&[93, 184, 216, 34]);

        // answer 2: CNAME whose target compresses back to the question name
        b.extend_from_slice(&[0xC0, 12]);
        b.extend_from_slice(&5u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&300u32.to_be_bytes());
        let rdata_len_pos = b.len();
        b.extend_from_slice(&0u16.to_be_bytes());
        let rdata_start = b.len();
        b.push(3);
        b.extend_from_slice(b"www");
        b.extend_from_slice(&[0xC0, 12]);
        let rdlen = (b.len() - rdata_start) as u16;
        b[rdata_len_pos..rdata_len_pos + 2].copy_from_slice(&rdlen.to_be_bytes());

        let msg = parse_message(&b).unwrap();
        assert!(msg.is_response);
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].name, "example.com");
        assert_eq!(
            msg.answers[0].data,
            RecordData::A("93.184.216.34".parse().unwrap())
        );
        assert_eq!(
            msg.answers[1].data,
            RecordData::Cname("www.example.com".to_string())
        );
    }

    #[test]
    fn empty_answer_section_is_fine() {
        let mut b = header(9, true, 1, 0);
        push_name(&mut b, "nxdomain.test");
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());

        let msg = parse_message(&b).unwrap();
        assert!(msg.answers.is_empty());
        assert_eq!(msg.questions[0].name, "nxdomain.test");
    }

    #[test]
    fn unknown_rr_type_keeps_raw_rdata() {
        let mut b = header(3, true, 1, 1);
        push_name(&mut b, "example.com");
        b.extend_from_slice(&65u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());

        b.extend_from_slice(&[0xC0, 12]);
        b.extend_from_slice(&65u16.to_be_bytes()); // HTTPS
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&60u32.to_be_bytes());
        b.extend_from_slice(&3u16.to_be_bytes());
        b.extend_from_slice(&[0xAB, 0xCD, 0xEF]);

        let msg = parse_message(&b).unwrap();
        assert_eq!(msg.answers[0].rtype, 65);
        assert_eq!(
            msg.answers[0].data,
            RecordData::Other(vec![0xAB, 0xCD, 0xEF])
        );
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut b = header(1, false, 1, 0);
        // name is a pointer to itself
        let loop_pos = b.len() as u8;
        b.extend_from_slice(&[0xC0, loop_pos]);
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(&1u16.to_be_bytes());
        assert!(parse_message(&b).is_err());
    }

    #[test]
    fn truncated_message_is_rejected() {
        let b = header(1, false, 1, 0);
        // promised one question, delivered none
        assert!(parse_message(&b).is_err());
    }

    #[test]
    fn qtype_mnemonics() {
        assert_eq!(qtype_name(1), "A");
        assert_eq!(qtype_name(28), "AAAA");
        assert_eq!(qtype_name(33), "SRV");
        assert_eq!(qtype_name(65), "TYPE65");
    }
}
