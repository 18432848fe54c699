use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::dns::wire::{self, DnsMessage, RecordData};
use crate::model::{DnsEventRecord, DnsEventType};

/// Turns one decoded DNS message into event records.
///
/// A query yields one event per question. A response yields exactly one
/// event carrying the first question's qtype and every answer in wire
/// order; responses with no question section carry no domain and are
/// dropped by the caller as malformed.
pub fn extract(
    msg: &DnsMessage,
    source_ip: IpAddr,
    destination_ip: IpAddr,
    ts: DateTime<Utc>,
) -> Vec<DnsEventRecord> {
    if !msg.is_response {
        return msg
            .questions
            .iter()
            .filter(|q| !q.name.is_empty())
            .map(|q| DnsEventRecord {
                event_type: DnsEventType::Query,
                domain: q.name.clone(),
                query_type: wire::qtype_name(q.qtype),
                source_ip,
                destination_ip,
                answers: Vec::new(),
                ts,
            })
            .collect();
    }

    let Some(question) = msg.questions.first().filter(|q| !q.name.is_empty()) else {
        return Vec::new();
    };

    let answers = msg.answers.iter().map(serialize_answer).collect();

    vec![DnsEventRecord {
        event_type: DnsEventType::Response,
        domain: question.name.clone(),
        query_type: wire::qtype_name(question.qtype),
        source_ip,
        destination_ip,
        answers,
        ts,
    }]
}

/// A/AAAA as the bare address, known types as `"<QTYPE>:<data>"`, unknown
/// types as `"TYPE<n>:<hex rdata>"`.
fn serialize_answer(rec: &wire::Record) -> String {
    match &rec.data {
        RecordData::A(a) => a.to_string(),
        RecordData::Aaaa(a) => a.to_string(),
        RecordData::Cname(t) => format!("CNAME:{t}"),
        RecordData::Ns(t) => format!("NS:{t}"),
        RecordData::Ptr(t) => format!("PTR:{t}"),
        RecordData::Mx { exchange, .. } => format!("MX:{exchange}"),
        RecordData::Txt(t) => format!("TXT:{t}"),
        RecordData::Soa { mname } => format!("SOA:{mname}"),
        RecordData::Srv { target, .. } => format!("SRV:{target}"),
        RecordData::Other(raw) => format!("{}:{}", wire::qtype_name(rec.rtype), hex::encode(raw)),
    }
}

/// Plain-IP answers out of a serialized answer set: A/AAAA entries parse as
/// addresses, everything else carries a type prefix and is skipped.
pub fn answer_ips(answers: &[String]) -> Vec<String> {
    answers
        .iter()
        .filter(|a| a.parse::<IpAddr>().is_ok())
        .cloned()
        .collect()
}
