//! Minimal redeem-script language for pay-to-script-hash outputs.
//!
//! Only the opcodes needed by commit/reveal envelopes are understood. A
//! standard redeem script has the shape
//!
//! ```text
//! <pubkey:32> OP_CHECKSIG OP_FALSE OP_IF <push>* OP_ENDIF
//! ```
//!
//! where the pushes inside the never-executed conditional carry the
//! protocol marker followed by the payload.

use crate::constants::MAX_SCRIPT_ELEMENT_SIZE;
use crate::error::ScriptError;
use crate::types::Hash256;

pub const OP_FALSE: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_IF: u8 = 0x63;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_CHECKSIG: u8 = 0xac;

/// Largest push encoded with a single length-prefix opcode.
const MAX_DIRECT_PUSH: usize = 0x4b;

/// One parsed script element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Push(Vec<u8>),
    Op(u8),
}

/// Incremental script assembler.
#[derive(Clone, Debug, Default)]
pub struct ScriptBuilder {
    script: Vec<u8>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a data push using the shortest length encoding.
    ///
    /// Empty data is not a push; use `add_op(OP_FALSE)` instead.
    pub fn add_data(&mut self, data: &[u8]) -> Result<&mut Self, ScriptError> {
        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::ElementTooLarge(data.len()));
        }
        match data.len() {
            0 => self.script.push(OP_FALSE),
            n if n <= MAX_DIRECT_PUSH => self.script.push(n as u8),
            n if n <= u8::MAX as usize => {
                self.script.push(OP_PUSHDATA1);
                self.script.push(n as u8);
            }
            n => {
                self.script.push(OP_PUSHDATA2);
                self.script.extend_from_slice(&(n as u16).to_le_bytes());
            }
        }
        self.script.extend_from_slice(data);
        Ok(self)
    }

    pub fn add_op(&mut self, op: u8) -> &mut Self {
        self.script.push(op);
        self
    }

    pub fn script(&self) -> &[u8] {
        &self.script
    }

    pub fn into_script(self) -> Vec<u8> {
        self.script
    }
}

/// Parse a script into instructions.
pub fn parse(script: &[u8]) -> Result<Vec<Instruction>, ScriptError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < script.len() {
        let op = script[pos];
        let start = pos;
        pos += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => read_len(script, &mut pos, 1, start)?,
            OP_PUSHDATA2 => read_len(script, &mut pos, 2, start)?,
            OP_PUSHDATA4 => read_len(script, &mut pos, 4, start)?,
            OP_FALSE | OP_IF | OP_ENDIF | OP_CHECKSIG => {
                out.push(Instruction::Op(op));
                continue;
            }
            other => return Err(ScriptError::UnknownOpcode(other)),
        };
        if len > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::ElementTooLarge(len));
        }
        let end = pos
            .checked_add(len)
            .filter(|&end| end <= script.len())
            .ok_or(ScriptError::TruncatedPush(start))?;
        out.push(Instruction::Push(script[pos..end].to_vec()));
        pos = end;
    }
    Ok(out)
}

fn read_len(script: &[u8], pos: &mut usize, width: usize, start: usize) -> Result<usize, ScriptError> {
    let bytes = script
        .get(*pos..*pos + width)
        .ok_or(ScriptError::TruncatedPush(start))?;
    *pos += width;
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(bytes);
    Ok(u32::from_le_bytes(buf) as usize)
}

/// BLAKE3 hash of a redeem script, as committed to by a script-hash lock.
pub fn script_hash(script: &[u8]) -> Hash256 {
    Hash256(blake3::hash(script).into())
}

/// A redeem script that passed the standardness check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandardRedeemScript {
    /// Key whose signature unlocks the script.
    pub public_key: [u8; 32],
    /// Pushes inside the `OP_FALSE OP_IF ... OP_ENDIF` envelope, in order.
    pub envelope: Vec<Vec<u8>>,
}

/// Parse and check a redeem script against the standard envelope shape.
pub fn parse_standard_redeem_script(script: &[u8]) -> Result<StandardRedeemScript, ScriptError> {
    let instructions = parse(script)?;
    let mut iter = instructions.into_iter();

    let public_key: [u8; 32] = match iter.next() {
        Some(Instruction::Push(key)) => key
            .try_into()
            .map_err(|_| ScriptError::NonStandard("first push must be a 32-byte key".into()))?,
        _ => return Err(ScriptError::NonStandard("missing public key push".into())),
    };
    for expected in [OP_CHECKSIG, OP_FALSE, OP_IF] {
        match iter.next() {
            Some(Instruction::Op(op)) if op == expected => {}
            _ => {
                return Err(ScriptError::NonStandard(format!(
                    "expected opcode 0x{expected:02x}"
                )));
            }
        }
    }

    let mut envelope = Vec::new();
    loop {
        match iter.next() {
            Some(Instruction::Push(data)) => envelope.push(data),
            Some(Instruction::Op(OP_ENDIF)) => break,
            Some(Instruction::Op(OP_IF)) => return Err(ScriptError::UnbalancedConditional),
            Some(Instruction::Op(op)) => {
                return Err(ScriptError::NonStandard(format!(
                    "opcode 0x{op:02x} inside envelope"
                )));
            }
            None => return Err(ScriptError::UnbalancedConditional),
        }
    }
    if iter.next().is_some() {
        return Err(ScriptError::NonStandard("trailing data after envelope".into()));
    }

    Ok(StandardRedeemScript { public_key, envelope })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_script(pubkey: [u8; 32], pushes: &[&[u8]]) -> Vec<u8> {
        let mut b = ScriptBuilder::new();
        b.add_data(&pubkey).unwrap();
        b.add_op(OP_CHECKSIG).add_op(OP_FALSE).add_op(OP_IF);
        for p in pushes {
            b.add_data(p).unwrap();
        }
        b.add_op(OP_ENDIF);
        b.into_script()
    }

    #[test]
    fn push_encodings() {
        let mut b = ScriptBuilder::new();
        b.add_data(&[1; 10]).unwrap();
        assert_eq!(b.script()[0], 10);

        let mut b = ScriptBuilder::new();
        b.add_data(&[1; 100]).unwrap();
        assert_eq!(&b.script()[..2], &[OP_PUSHDATA1, 100]);

        let mut b = ScriptBuilder::new();
        b.add_data(&[1; 300]).unwrap();
        assert_eq!(&b.script()[..3], &[OP_PUSHDATA2, 0x2c, 0x01]);
    }

    #[test]
    fn oversized_push_rejected() {
        let mut b = ScriptBuilder::new();
        let err = b.add_data(&[0; MAX_SCRIPT_ELEMENT_SIZE + 1]).unwrap_err();
        assert_eq!(err, ScriptError::ElementTooLarge(MAX_SCRIPT_ELEMENT_SIZE + 1));
    }

    #[test]
    fn parse_roundtrips_builder() {
        let script = envelope_script([7; 32], &[b"bzr", &[9; 300]]);
        let parsed = parse(&script).unwrap();
        assert_eq!(parsed.len(), 7);
        assert_eq!(parsed[0], Instruction::Push(vec![7; 32]));
        assert_eq!(parsed[5], Instruction::Push(vec![9; 300]));
        assert_eq!(parsed[6], Instruction::Op(OP_ENDIF));
    }

    #[test]
    fn parse_truncated_push() {
        assert_eq!(parse(&[0x05, 1, 2]), Err(ScriptError::TruncatedPush(0)));
        assert_eq!(parse(&[OP_PUSHDATA2, 1]), Err(ScriptError::TruncatedPush(0)));
    }

    #[test]
    fn parse_unknown_opcode() {
        assert_eq!(parse(&[0x99]), Err(ScriptError::UnknownOpcode(0x99)));
    }

    #[test]
    fn standard_script_accepted() {
        let script = envelope_script([3; 32], &[b"bzr", b"{}"]);
        let parsed = parse_standard_redeem_script(&script).unwrap();
        assert_eq!(parsed.public_key, [3; 32]);
        assert_eq!(parsed.envelope, vec![b"bzr".to_vec(), b"{}".to_vec()]);
    }

    #[test]
    fn missing_endif_is_unbalanced() {
        let mut script = envelope_script([3; 32], &[b"bzr"]);
        script.pop();
        assert_eq!(
            parse_standard_redeem_script(&script),
            Err(ScriptError::UnbalancedConditional)
        );
    }

    #[test]
    fn trailing_ops_are_non_standard() {
        let mut script = envelope_script([3; 32], &[b"bzr"]);
        script.push(OP_CHECKSIG);
        assert!(matches!(
            parse_standard_redeem_script(&script),
            Err(ScriptError::NonStandard(_))
        ));
    }

    #[test]
    fn short_key_is_non_standard() {
        let mut b = ScriptBuilder::new();
        b.add_data(&[1; 20]).unwrap();
        b.add_op(OP_CHECKSIG);
        assert!(matches!(
            parse_standard_redeem_script(b.script()),
            Err(ScriptError::NonStandard(_))
        ));
    }

    #[test]
    fn script_hash_differs_per_script() {
        let a = envelope_script([1; 32], &[b"a"]);
        let b = envelope_script([1; 32], &[b"b"]);
        assert_ne!(script_hash(&a), script_hash(&b));
    }

    proptest::proptest! {
        #[test]
        fn parse_never_panics(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..256)) {
            let _ = parse(&bytes);
            let _ = parse_standard_redeem_script(&bytes);
        }
    }
}
