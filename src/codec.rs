//! DNS wire codec: query construction, datagram and stream framing, answer normalization.
//!
//! Messages are modelled with `hickory-proto`; this module only adds the two
//! framings the probes speak (bare datagram for DoH, 2-byte length prefix for
//! DoT) and the conversion from resource records into [`DnsAnswer`]s.

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ProbeError;

/// Size of the fixed DNS header; nothing shorter can be a message.
pub const DNS_HEADER_LEN: usize = 12;

/// Size of the stream length prefix.
pub const STREAM_PREFIX_LEN: usize = 2;

/// Record types the probes will resolve.
pub const SUPPORTED_RECORD_TYPES: [RecordType; 12] = [
    RecordType::A,
    RecordType::AAAA,
    RecordType::CAA,
    RecordType::CNAME,
    RecordType::MX,
    RecordType::NAPTR,
    RecordType::NS,
    RecordType::PTR,
    RecordType::SOA,
    RecordType::SRV,
    RecordType::TLSA,
    RecordType::TXT,
];

/// Parse a record type mnemonic, accepting only [`SUPPORTED_RECORD_TYPES`].
pub fn parse_record_type(s: &str) -> Result<RecordType, ProbeError> {
    let upper = s.trim().to_ascii_uppercase();
    let record_type: RecordType = upper
        .parse()
        .map_err(|_| ProbeError::InvalidRecordType(s.to_string()))?;
    if SUPPORTED_RECORD_TYPES.contains(&record_type) {
        Ok(record_type)
    } else {
        Err(ProbeError::InvalidRecordType(s.to_string()))
    }
}

/// Normalized answer payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerData {
    /// Single textual value (addresses, names, stringified rdata).
    String(String),
    /// Segmented text, always used for TXT.
    StringList(Vec<String>),
    /// Structured rdata such as MX or SOA.
    Structured(serde_json::Value),
}

impl AnswerData {
    /// One-line summary suitable for listings.
    pub fn describe(&self) -> String {
        match self {
            AnswerData::String(s) => s.clone(),
            AnswerData::StringList(list) => match list.first() {
                Some(first) => first.clone(),
                None => "Empty response".to_string(),
            },
            AnswerData::Structured(serde_json::Value::Null) => "No response".to_string(),
            AnswerData::Structured(value) => value.to_string(),
        }
    }
}

/// Payload shapes as they come off the wire or out of a JSON envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Already-textual payload.
    Text(String),
    /// One opaque binary blob.
    Binary(Vec<u8>),
    /// Several binary segments (character-strings).
    Segments(Vec<Vec<u8>>),
    /// Structured sub-object.
    Object(serde_json::Value),
}

/// Normalize a raw payload for the given record type.
///
/// TXT always becomes a list of strings; every other type becomes its single value.
pub fn normalize(record_type: RecordType, raw: RawPayload) -> AnswerData {
    if record_type == RecordType::TXT {
        let segments = match raw {
            RawPayload::Segments(segments) => segments.iter().map(|s| lossy(s)).collect(),
            RawPayload::Binary(bytes) => vec![lossy(&bytes)],
            RawPayload::Text(text) => vec![text],
            RawPayload::Object(value) => vec![value.to_string()],
        };
        return AnswerData::StringList(segments);
    }

    match raw {
        RawPayload::Segments(segments) => {
            AnswerData::String(segments.iter().map(|s| lossy(s)).collect())
        }
        RawPayload::Binary(bytes) => AnswerData::String(lossy(&bytes)),
        RawPayload::Object(value) => AnswerData::Structured(value),
        RawPayload::Text(text) => AnswerData::String(text),
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// One normalized answer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsAnswer {
    /// Owner name.
    pub name: String,
    /// Record type of this answer (may differ from the query, e.g. CNAME).
    #[serde(rename = "type", with = "record_type_str")]
    pub record_type: RecordType,
    /// Time to live in seconds.
    pub ttl: u32,
    /// Normalized payload.
    pub data: AnswerData,
}

mod record_type_str {
    use hickory_proto::rr::RecordType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(rt: &RecordType, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(rt)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RecordType, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Build a recursive query with a random transaction id in `[1, 65536)`.
pub fn build_query(name: &str, record_type: RecordType) -> Result<Message, ProbeError> {
    let mut name = Name::from_ascii(name)?;
    name.set_fqdn(true);

    let id = rand::thread_rng().gen_range(1..=u16::MAX);

    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    Ok(message)
}

/// Encode a message in datagram (DoH) wire format.
pub fn encode_datagram(message: &Message) -> Result<Vec<u8>, ProbeError> {
    Ok(message.to_vec()?)
}

/// Encode a message in stream (DoT) wire format: big-endian length, then the message.
pub fn encode_stream(message: &Message) -> Result<Vec<u8>, ProbeError> {
    let body = message.to_vec()?;
    let len = u16::try_from(body.len())
        .map_err(|_| ProbeError::malformed(format!("query of {} bytes exceeds stream frame", body.len())))?;

    let mut framed = Vec::with_capacity(STREAM_PREFIX_LEN + body.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode a datagram wire-format message.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message, ProbeError> {
    Message::from_vec(bytes).map_err(|e| ProbeError::ProtocolMalformed {
        message: format!("undecodable DNS message: {e}"),
        body: Some(hex::encode(bytes)),
    })
}

/// Decode one complete stream wire-format frame.
pub fn decode_stream(bytes: &[u8]) -> Result<Message, ProbeError> {
    let mut accumulator = StreamFrameAccumulator::new();
    match accumulator.push(bytes)? {
        Some(frame) => decode_datagram(&frame),
        None => Err(ProbeError::ProtocolMalformed {
            message: format!(
                "truncated stream frame: {} of {:?} bytes",
                accumulator.received(),
                accumulator.expected()
            ),
            body: Some(hex::encode(bytes)),
        }),
    }
}

/// Reassembles one length-prefixed DNS message from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct StreamFrameAccumulator {
    buf: Vec<u8>,
    declared: Option<usize>,
}

impl StreamFrameAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes. Returns the message body once `declared + 2` bytes arrived.
    ///
    /// A declared length below [`DNS_HEADER_LEN`] is rejected as soon as the
    /// prefix is visible, before any decoding is attempted.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, ProbeError> {
        self.buf.extend_from_slice(chunk);

        if self.declared.is_none() && self.buf.len() >= STREAM_PREFIX_LEN {
            let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if declared < DNS_HEADER_LEN {
                return Err(ProbeError::ProtocolMalformed {
                    message: format!(
                        "declared response length {declared} is below the {DNS_HEADER_LEN}-byte DNS header"
                    ),
                    body: Some(hex::encode(&self.buf)),
                });
            }
            self.declared = Some(declared);
        }

        match self.declared {
            Some(declared) if self.buf.len() >= declared + STREAM_PREFIX_LEN => Ok(Some(
                self.buf[STREAM_PREFIX_LEN..declared + STREAM_PREFIX_LEN].to_vec(),
            )),
            _ => Ok(None),
        }
    }

    /// Bytes received so far, prefix included.
    pub fn received(&self) -> usize {
        self.buf.len()
    }

    /// Total frame size once the prefix has been read.
    pub fn expected(&self) -> Option<usize> {
        self.declared.map(|d| d + STREAM_PREFIX_LEN)
    }
}

/// Convert the answer section of a response into normalized answers.
pub fn answers_from_message(message: &Message) -> Vec<DnsAnswer> {
    message.answers().iter().map(answer_from_record).collect()
}

fn answer_from_record(record: &Record) -> DnsAnswer {
    let record_type = record.record_type();
    DnsAnswer {
        name: record.name().to_string(),
        record_type,
        ttl: record.ttl(),
        data: normalize(record_type, raw_payload(record.data())),
    }
}

fn raw_payload(rdata: &RData) -> RawPayload {
    match rdata {
        RData::TXT(txt) => RawPayload::Segments(txt.txt_data().iter().map(|s| s.to_vec()).collect()),
        RData::MX(mx) => RawPayload::Object(json!({
            "preference": mx.preference(),
            "exchange": mx.exchange().to_string(),
        })),
        RData::SRV(srv) => RawPayload::Object(json!({
            "priority": srv.priority(),
            "weight": srv.weight(),
            "port": srv.port(),
            "target": srv.target().to_string(),
        })),
        RData::SOA(soa) => RawPayload::Object(json!({
            "mname": soa.mname().to_string(),
            "rname": soa.rname().to_string(),
            "serial": soa.serial(),
            "refresh": soa.refresh(),
            "retry": soa.retry(),
            "expire": soa.expire(),
            "minimum": soa.minimum(),
        })),
        RData::NULL(null) => RawPayload::Binary(null.anything().to_vec()),
        RData::Unknown { rdata, .. } => RawPayload::Binary(rdata.anything().to_vec()),
        other => RawPayload::Text(other.to_string()),
    }
}

/// Split a presentation-format TXT string (`"a" "b"`) into its segments.
pub fn split_txt_presentation(data: &str) -> Vec<Vec<u8>> {
    let trimmed = data.trim();
    if !trimmed.starts_with('"') {
        return vec![trimmed.as_bytes().to_vec()];
    }

    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for b in trimmed.bytes() {
        match (in_quotes, escaped, b) {
            (true, true, _) => {
                current.push(b);
                escaped = false;
            }
            (true, false, b'\\') => escaped = true,
            (true, false, b'"') => {
                segments.push(std::mem::take(&mut current));
                in_quotes = false;
            }
            (true, false, _) => current.push(b),
            (false, _, b'"') => in_quotes = true,
            (false, _, _) => {}
        }
    }
    if in_quotes {
        segments.push(current);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, MX, TXT};
    use std::net::Ipv4Addr;

    fn response_for(query: &Message, answers: Vec<Record>) -> Message {
        let mut response = Message::new();
        response.set_id(query.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(true);
        response.set_recursion_available(true);
        for q in query.queries() {
            response.add_query(q.clone());
        }
        for answer in answers {
            response.add_answer(answer);
        }
        response
    }

    #[test]
    fn test_build_query_sets_flags() {
        let query = build_query("example.com", RecordType::A).unwrap();
        assert!(query.id() >= 1);
        assert!(query.recursion_desired());
        assert_eq!(query.message_type(), MessageType::Query);
        assert_eq!(query.queries().len(), 1);
        assert_eq!(query.queries()[0].query_type(), RecordType::A);
        assert_eq!(query.queries()[0].name().to_string(), "example.com.");
    }

    #[test]
    fn test_query_ids_are_never_zero() {
        for _ in 0..2000 {
            assert_ne!(build_query("example.com", RecordType::A).unwrap().id(), 0);
        }
    }

    #[test]
    fn test_stream_prefix_excludes_itself() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        let datagram = encode_datagram(&query).unwrap();
        let framed = encode_stream(&query).unwrap();

        assert_eq!(framed.len(), datagram.len() + 2);
        assert_eq!(u16::from_be_bytes([framed[0], framed[1]]) as usize, datagram.len());
        assert_eq!(&framed[2..], &datagram[..]);
    }

    #[test]
    fn test_stream_roundtrip_preserves_transaction_id() {
        let query = build_query("example.com", RecordType::A).unwrap();
        let name = Name::from_ascii("example.com.").unwrap();
        let answer = Record::from_rdata(name, 300, RData::A(A(Ipv4Addr::new(192, 0, 2, 1))));
        let response = response_for(&query, vec![answer]);

        let framed = encode_stream(&response).unwrap();
        let decoded = decode_stream(&framed).unwrap();

        assert_eq!(decoded.id(), query.id());
        let answers = answers_from_message(&decoded);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].data, AnswerData::String("192.0.2.1".into()));
        assert_eq!(answers[0].ttl, 300);
    }

    #[test]
    fn test_declared_length_below_header_is_rejected() {
        let mut accumulator = StreamFrameAccumulator::new();
        let mut chunk = 11u16.to_be_bytes().to_vec();
        chunk.extend_from_slice(&[0u8; 11]);

        let err = accumulator.push(&chunk).unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_declared_length_checked_before_body_arrives() {
        let mut accumulator = StreamFrameAccumulator::new();
        let err = accumulator.push(&11u16.to_be_bytes()).unwrap_err();
        assert!(matches!(err, ProbeError::ProtocolMalformed { .. }));
    }

    #[test]
    fn test_accumulator_reassembles_split_frame() {
        let query = build_query("example.org", RecordType::TXT).unwrap();
        let framed = encode_stream(&query).unwrap();

        let mut accumulator = StreamFrameAccumulator::new();
        assert!(accumulator.push(&framed[..1]).unwrap().is_none());
        assert!(accumulator.expected().is_none());
        assert!(accumulator.push(&framed[1..7]).unwrap().is_none());
        assert_eq!(accumulator.expected(), Some(framed.len()));

        let body = accumulator.push(&framed[7..]).unwrap().unwrap();
        assert_eq!(decode_datagram(&body).unwrap().id(), query.id());
    }

    #[test]
    fn test_truncated_stream_frame_fails() {
        let query = build_query("example.org", RecordType::A).unwrap();
        let framed = encode_stream(&query).unwrap();
        assert!(decode_stream(&framed[..framed.len() - 1]).is_err());
    }

    #[test]
    fn test_txt_single_string_normalizes_to_list() {
        let query = build_query("example.com", RecordType::TXT).unwrap();
        let name = Name::from_ascii("example.com.").unwrap();
        let txt = Record::from_rdata(name, 60, RData::TXT(TXT::new(vec!["v=spf1 -all".into()])));
        let answers = answers_from_message(&response_for(&query, vec![txt]));

        assert_eq!(answers[0].data, AnswerData::StringList(vec!["v=spf1 -all".into()]));
    }

    #[test]
    fn test_a_single_string_is_not_wrapped() {
        assert_eq!(
            normalize(RecordType::A, RawPayload::Text("198.51.100.7".into())),
            AnswerData::String("198.51.100.7".into())
        );
        assert_eq!(
            normalize(RecordType::TXT, RawPayload::Text("hello".into())),
            AnswerData::StringList(vec!["hello".into()])
        );
    }

    #[test]
    fn test_segments_join_outside_txt() {
        let raw = RawPayload::Segments(vec![b"ab".to_vec(), b"cd".to_vec()]);
        assert_eq!(normalize(RecordType::CAA, raw), AnswerData::String("abcd".into()));
    }

    #[test]
    fn test_mx_is_structured() {
        let query = build_query("example.com", RecordType::MX).unwrap();
        let name = Name::from_ascii("example.com.").unwrap();
        let exchange = Name::from_ascii("mail.example.com.").unwrap();
        let mx = Record::from_rdata(name, 120, RData::MX(MX::new(10, exchange)));
        let answers = answers_from_message(&response_for(&query, vec![mx]));

        match &answers[0].data {
            AnswerData::Structured(value) => {
                assert_eq!(value["preference"], 10);
                assert_eq!(value["exchange"], "mail.example.com.");
            }
            other => panic!("expected structured MX, got {other:?}"),
        }
    }

    #[test]
    fn test_split_txt_presentation() {
        assert_eq!(
            split_txt_presentation(r#""v=spf1" "include:x \"y\"""#),
            vec![b"v=spf1".to_vec(), b"include:x \"y\"".to_vec()]
        );
        assert_eq!(split_txt_presentation("bare"), vec![b"bare".to_vec()]);
    }

    #[test]
    fn test_parse_record_type() {
        assert_eq!(parse_record_type("txt").unwrap(), RecordType::TXT);
        assert!(parse_record_type("AXFR").is_err());
        assert!(parse_record_type("bogus").is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(AnswerData::StringList(vec![]).describe(), "Empty response");
        assert_eq!(AnswerData::StringList(vec!["a".into(), "b".into()]).describe(), "a");
        assert_eq!(AnswerData::Structured(serde_json::Value::Null).describe(), "No response");
        assert_eq!(AnswerData::String("x".into()).describe(), "x");
    }

    #[test]
    fn test_answer_serializes_record_type_as_mnemonic() {
        let answer = DnsAnswer {
            name: "example.com.".into(),
            record_type: RecordType::AAAA,
            ttl: 5,
            data: AnswerData::String("::1".into()),
        };
        let value = serde_json::to_value(&answer).unwrap();
        assert_eq!(value["type"], "AAAA");
        let back: DnsAnswer = serde_json::from_value(value).unwrap();
        assert_eq!(back, answer);
    }
}
