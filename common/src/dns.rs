use std::net::Ipv4Addr;

use log::debug;

pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const OPCODE_MASK: u16 = 0x7800;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const NAME_POINTER: u16 = 0xC000 | HEADER_LEN as u16;
const ANSWER_TTL_SECS: u32 = 60;

fn read_u16(packet: &[u8], at: usize) -> Option<u16> {
    let bytes = packet.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

// Offset just past the QNAME starting at `at`. Compressed names are refused.
fn skip_name(packet: &[u8], mut at: usize) -> Option<usize> {
    loop {
        let len = usize::from(*packet.get(at)?);
        at += 1;
        match len {
            0 => return Some(at),
            1..=63 => at += len,
            _ => return None,
        }
    }
}

/// Reply to a standard query naming the gateway as the address of every
/// host. Only the first question is answered, and only A/ANY questions of
/// class IN get a record; anything else gets an empty answer section.
/// Responses and malformed packets yield `None`.
pub fn captive_answer(query: &[u8], gateway: Ipv4Addr) -> Option<Vec<u8>> {
    let flags = read_u16(query, 2)?;
    if flags & (FLAG_RESPONSE | OPCODE_MASK) != 0 || read_u16(query, 4)? == 0 {
        return None;
    }

    let name_end = skip_name(query, HEADER_LEN)?;
    let qtype = read_u16(query, name_end)?;
    let qclass = read_u16(query, name_end + 2)?;
    let question_end = name_end + 4;
    let answered = qclass == CLASS_IN && matches!(qtype, TYPE_A | TYPE_ANY);

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[..2]);
    reply.extend_from_slice(
        &(FLAG_RESPONSE | FLAG_AUTHORITATIVE | (flags & FLAG_RECURSION_DESIRED)).to_be_bytes(),
    );
    reply.extend_from_slice(&1_u16.to_be_bytes());
    reply.extend_from_slice(&u16::from(answered).to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answered {
        reply.extend_from_slice(&NAME_POINTER.to_be_bytes());
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        reply.extend_from_slice(&4_u16.to_be_bytes());
        reply.extend_from_slice(&gateway.octets());
    } else {
        debug!("dns: no record for qtype {qtype} class {qclass}");
    }

    Some(reply)
}
