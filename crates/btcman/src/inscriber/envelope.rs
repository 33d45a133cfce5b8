//! The inscription envelope: a provably unexecuted `OP_FALSE OP_IF ..
//! OP_ENDIF` block carrying the payload in push operations.
//!
//! Layout: `OP_FALSE OP_IF <"ord"> <0x01> <content-type> <> <payload chunks>
//! OP_ENDIF`, with every push at most 520 bytes.

use bitcoin::{
    blockdata::script,
    opcodes::{
        all::{OP_ENDIF, OP_IF},
        OP_FALSE,
    },
    script::{Instruction, Instructions, PushBytesBuf},
    Script, ScriptBuf,
};

use crate::error::InscriberError;

/// Maximum data length of a single script push.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Payload ceiling keeping the reveal transaction within the standard
/// 400k-weight-unit transaction cap.
pub const MAX_PAYLOAD_SIZE: usize = 390_000;

/// Envelope protocol marker, pushed right after `OP_IF`.
const PROTOCOL_ID: [u8; 3] = *b"ord";

/// Tag announcing that the next push is the content type.
const CONTENT_TYPE_TAG: [u8; 1] = [1];

/// Builds the envelope script for one payload.
pub fn build_envelope_script(
    content_type: &str,
    payload: &[u8],
) -> Result<ScriptBuf, InscriberError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(InscriberError::EnvelopeTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let content_type =
        PushBytesBuf::try_from(content_type.as_bytes().to_vec()).map_err(|_| {
            InscriberError::EnvelopeTooLarge {
                size: content_type.len(),
                max: MAX_SCRIPT_ELEMENT_SIZE,
            }
        })?;

    let mut builder = script::Builder::new()
        .push_opcode(OP_FALSE)
        .push_opcode(OP_IF)
        .push_slice(PROTOCOL_ID)
        .push_slice(CONTENT_TYPE_TAG)
        .push_slice(content_type)
        // Empty push separates the header from the payload body.
        .push_slice(PushBytesBuf::new());

    for chunk in payload.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
        let chunk = PushBytesBuf::try_from(chunk.to_vec()).map_err(|_| {
            InscriberError::EnvelopeTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
        })?;
        builder = builder.push_slice(chunk);
    }

    Ok(builder.push_opcode(OP_ENDIF).into_script())
}

/// Walks an envelope (or envelope fragment) and returns the concatenated
/// payload pushes that follow the empty body separator.
///
/// Accepts both a whole envelope script and the fragment that
/// [`extract_inscription_script`](super::extract_inscription_script) cuts
/// out of a reveal witness. A whole envelope is recognized by its `"ord"`
/// header (`OP_FALSE` itself disassembles to an empty push, so the body
/// separator is the empty push *after* the content type); a fragment starts
/// at the separator directly.
pub fn parse_envelope_payload(script: &Script) -> Result<Vec<u8>, InscriberError> {
    let mut instructions = script.instructions();

    // Both forms lead with an empty push: OP_FALSE for a whole envelope,
    // the body separator for a fragment.
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) if bytes.is_empty() => {}
        _ => return Err(InscriberError::MarkerNotFound),
    }

    let mut payload = Vec::new();
    match instructions.next() {
        // Whole envelope: OP_IF and the header follow the OP_FALSE.
        Some(Ok(Instruction::Op(op))) if op == OP_IF => {
            skip_envelope_header(&mut instructions)?;
        }
        // Fragment: payload chunks follow the separator directly.
        Some(Ok(Instruction::PushBytes(bytes))) => payload.extend_from_slice(bytes.as_bytes()),
        Some(Ok(Instruction::Op(op))) if op == OP_ENDIF => return Ok(payload),
        None => return Ok(payload),
        _ => return Err(InscriberError::MarkerNotFound),
    }

    collect_payload(&mut instructions, &mut payload)?;
    Ok(payload)
}

/// Consumes `<"ord"> <0x01> <content-type> <empty separator>`.
fn skip_envelope_header(instructions: &mut Instructions<'_>) -> Result<(), InscriberError> {
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) if bytes.as_bytes() == PROTOCOL_ID.as_slice() => {}
        _ => return Err(InscriberError::MarkerNotFound),
    }
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes)))
            if bytes.as_bytes() == CONTENT_TYPE_TAG.as_slice() => {}
        _ => return Err(InscriberError::MarkerNotFound),
    }
    // Content type, then the body separator.
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(_))) => {}
        _ => return Err(InscriberError::MarkerNotFound),
    }
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) if bytes.is_empty() => Ok(()),
        _ => Err(InscriberError::MarkerNotFound),
    }
}

fn collect_payload(
    instructions: &mut Instructions<'_>,
    payload: &mut Vec<u8>,
) -> Result<(), InscriberError> {
    for instruction in instructions {
        match instruction {
            Ok(Instruction::Op(op)) if op == OP_ENDIF => return Ok(()),
            Ok(Instruction::PushBytes(bytes)) => payload.extend_from_slice(bytes.as_bytes()),
            _ => return Err(InscriberError::MarkerNotFound),
        }
    }
    // Fragment form has the trailing OP_ENDIF already stripped.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT_TYPE: &str = "application/octet-stream";

    #[test]
    fn test_envelope_structure() {
        let script = build_envelope_script(CONTENT_TYPE, b"hello").unwrap();
        let bytes = script.as_bytes();

        // OP_FALSE OP_IF, then the "ord" push.
        assert_eq!(&bytes[..2], &[0x00, 0x63]);
        assert_eq!(&bytes[2..6], &[0x03, b'o', b'r', b'd']);
        // Content-type tag and content type.
        assert_eq!(&bytes[6..8], &[0x01, 0x01]);
        assert_eq!(bytes[8] as usize, CONTENT_TYPE.len());
        assert_eq!(&bytes[9..9 + CONTENT_TYPE.len()], CONTENT_TYPE.as_bytes());
        // Body separator, payload push, OP_ENDIF.
        let rest = &bytes[9 + CONTENT_TYPE.len()..];
        assert_eq!(rest, &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0x68]);
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = vec![7u8; 5];
        let script = build_envelope_script(CONTENT_TYPE, &payload).unwrap();
        assert_eq!(parse_envelope_payload(&script).unwrap(), payload);
    }

    #[test]
    fn test_large_payload_is_chunked_and_roundtrips() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let script = build_envelope_script(CONTENT_TYPE, &payload).unwrap();

        // 2000 bytes split into 520-byte pushes: 3 full chunks + remainder.
        let chunk_count = script
            .instructions()
            .filter(|i| {
                matches!(i, Ok(Instruction::PushBytes(b)) if b.len() == MAX_SCRIPT_ELEMENT_SIZE)
            })
            .count();
        assert_eq!(chunk_count, 3);

        assert_eq!(parse_envelope_payload(&script).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload_roundtrips() {
        let script = build_envelope_script(CONTENT_TYPE, &[]).unwrap();
        assert_eq!(parse_envelope_payload(&script).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = build_envelope_script(CONTENT_TYPE, &payload).unwrap_err();
        assert!(matches!(err, InscriberError::EnvelopeTooLarge { .. }));
    }

    #[test]
    fn test_script_without_envelope_is_rejected() {
        let script = ScriptBuf::from_bytes(vec![0x51, 0x52]); // OP_1 OP_2
        assert!(parse_envelope_payload(&script).is_err());
    }
}
