use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};

use quiver_dns_domain::ResolveError;

use crate::rng::RandomSource;

/// EDNS0 advertised UDP payload size for outbound queries.
const EDNS_UDP_PAYLOAD: u16 = 1232;

/// Build an outbound query for one question. The transaction id is left at
/// zero; the channel stamps it at submission.
pub fn build_query(
    domain: &str,
    record_type: RecordType,
    use_edns: bool,
) -> Result<Message, ResolveError> {
    let name = Name::from_str(domain)
        .map_err(|e| ResolveError::Encode(format!("invalid domain '{}': {}", domain, e)))?;

    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);

    let mut message = Message::new();
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(query);

    if use_edns {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_UDP_PAYLOAD);
        edns.set_version(0);
        *message.extensions_mut() = Some(edns);
    }

    Ok(message)
}

/// Serialize a message in the stream format: two-byte big-endian length,
/// then the wire message. UDP connections carry the same framing in their
/// buffers; the transport strips the prefix per datagram.
pub(crate) fn write_framed(message: &Message, out: &mut BytesMut) -> Result<(), ResolveError> {
    let wire = message
        .to_vec()
        .map_err(|e| ResolveError::Encode(e.to_string()))?;
    if wire.len() > u16::MAX as usize {
        return Err(ResolveError::Encode(format!(
            "message of {} bytes exceeds the framed limit",
            wire.len()
        )));
    }
    out.reserve(2 + wire.len());
    out.put_u16(wire.len() as u16);
    out.extend_from_slice(&wire);
    Ok(())
}

/// Compare the question sections of the outbound query and a response.
///
/// Type and class must match exactly. Names compare case-sensitively when
/// the case-randomization check is in force (the server must echo our
/// randomized spelling verbatim); otherwise ASCII case is ignored.
pub(crate) fn same_questions(query: &Message, response: &Message, case_sensitive: bool) -> bool {
    let qqs = query.queries();
    let aqs = response.queries();
    if qqs.len() != aqs.len() {
        return false;
    }

    qqs.iter().zip(aqs.iter()).all(|(q, a)| {
        q.query_type() == a.query_type()
            && q.query_class() == a.query_class()
            && names_equal(q.name(), a.name(), case_sensitive)
    })
}

fn names_equal(a: &Name, b: &Name, case_sensitive: bool) -> bool {
    if a.num_labels() != b.num_labels() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(la, lb)| {
        if case_sensitive {
            la == lb
        } else {
            la.eq_ignore_ascii_case(lb)
        }
    })
}

/// Randomize the letter case of every question name in place, drawing one
/// bit per ASCII letter. The response validator then requires the server
/// to echo the exact spelling.
pub(crate) fn randomize_question_case(message: &mut Message, rng: &mut dyn RandomSource) {
    let queries = message.take_queries();
    for mut query in queries {
        let name = query.name();
        if name.num_labels() > 0 {
            let scrambled = scramble_name(name, rng);
            query.set_name(scrambled);
        }
        message.add_query(query);
    }
}

fn scramble_name(name: &Name, rng: &mut dyn RandomSource) -> Name {
    let labels: Vec<Vec<u8>> = name
        .iter()
        .map(|label| {
            label
                .iter()
                .map(|&b| {
                    if b.is_ascii_alphabetic() {
                        let mut coin = [0u8; 1];
                        rng.fill(&mut coin);
                        if coin[0] & 1 == 1 {
                            b.to_ascii_uppercase()
                        } else {
                            b.to_ascii_lowercase()
                        }
                    } else {
                        b
                    }
                })
                .collect()
        })
        .collect();

    match Name::from_labels(labels) {
        Ok(mut scrambled) => {
            scrambled.set_fqdn(name.is_fqdn());
            scrambled
        }
        // A name that round-trips through its own labels cannot fail to
        // rebuild; keep the original if it somehow does.
        Err(_) => name.clone(),
    }
}
