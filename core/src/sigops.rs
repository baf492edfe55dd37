//! Signature-operation counting for the block-level DoS limit.
//!
//! The legacy counter walks raw script bytes the way the reference node
//! does: push payloads are skipped, a truncated push ends the walk with the
//! count so far, and a bare CHECKMULTISIG always counts as twenty. Consensus
//! has historically depended on these exact quirks.

use bitcoin::Script;

use crate::constants::MAX_PUBKEYS_PER_MULTISIG;

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

fn count_sigops_bytes(bytes: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_op: Option<u8> = None;
    let mut i = 0usize;

    while i < bytes.len() {
        let op = bytes[i];
        i += 1;

        let push_len = match op {
            len @ 0x01..=0x4b => Some(len as usize),
            OP_PUSHDATA1 => {
                let Some(&len) = bytes.get(i) else { break };
                i += 1;
                Some(len as usize)
            }
            OP_PUSHDATA2 => {
                let Some(slice) = bytes.get(i..i + 2) else {
                    break;
                };
                i += 2;
                Some(u16::from_le_bytes([slice[0], slice[1]]) as usize)
            }
            OP_PUSHDATA4 => {
                let Some(slice) = bytes.get(i..i + 4) else {
                    break;
                };
                i += 4;
                Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]) as usize)
            }
            _ => None,
        };

        if let Some(len) = push_len {
            if i + len > bytes.len() {
                break;
            }
            i += len;
            last_op = Some(op);
            continue;
        }

        match op {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_op {
                    Some(n @ OP_1..=OP_16) if accurate => (n - OP_1 + 1) as u32,
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last_op = Some(op);
    }

    count
}

/// Legacy sig-op count: applied to every script in the block, with the
/// conservative twenty-key CHECKMULTISIG rule.
pub fn count_legacy_sigops(script: &Script) -> u32 {
    count_sigops_bytes(script.as_bytes(), false)
}

/// The last datum a push-only script signature leaves on the stack; for a
/// P2SH spend, the redeem script. None when the script signature contains a
/// non-push opcode.
fn last_pushed_datum(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut datum: Vec<u8> = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let op = bytes[i];
        i += 1;
        if op > OP_16 {
            return None;
        }
        let push_len = match op {
            len @ 0x01..=0x4b => len as usize,
            OP_PUSHDATA1 => {
                let &len = bytes.get(i)?;
                i += 1;
                len as usize
            }
            OP_PUSHDATA2 => {
                let slice = bytes.get(i..i + 2)?;
                i += 2;
                u16::from_le_bytes([slice[0], slice[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let slice = bytes.get(i..i + 4)?;
                i += 4;
                u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]) as usize
            }
            _ => continue,
        };
        let payload = bytes.get(i..i + push_len)?;
        i += push_len;
        datum = payload.to_vec();
    }
    Some(datum)
}

/// Accurate sig-op count of the redeem script carried by a P2SH spend; zero
/// when the previous output is not P2SH or the script signature is not
/// push-only.
pub fn count_p2sh_sigops(prev_script_pubkey: &Script, script_sig: &Script) -> u32 {
    if !prev_script_pubkey.is_p2sh() {
        return 0;
    }
    match last_pushed_datum(script_sig.as_bytes()) {
        Some(redeem) => count_sigops_bytes(&redeem, true),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::{hash160, Hash};
    use bitcoin::{ScriptBuf, ScriptHash};

    fn script(bytes: Vec<u8>) -> ScriptBuf {
        ScriptBuf::from_bytes(bytes)
    }

    fn p2sh_of(redeem: &[u8]) -> ScriptBuf {
        ScriptBuf::new_p2sh(&ScriptHash::from_raw_hash(hash160::Hash::hash(redeem)))
    }

    #[test]
    fn checksig_counts_one() {
        assert_eq!(count_legacy_sigops(&script(vec![OP_CHECKSIG])), 1);
        assert_eq!(count_legacy_sigops(&script(vec![OP_CHECKSIGVERIFY])), 1);
    }

    #[test]
    fn bare_multisig_counts_twenty_even_with_op_n_prefix() {
        // legacy counting ignores the key-count prefix
        assert_eq!(
            count_legacy_sigops(&script(vec![OP_1 + 1, OP_CHECKMULTISIG])),
            20
        );
        assert_eq!(count_legacy_sigops(&script(vec![OP_CHECKMULTISIGVERIFY])), 20);
    }

    #[test]
    fn push_payloads_are_skipped() {
        // a pushed 0xac byte is data, not a CHECKSIG
        assert_eq!(count_legacy_sigops(&script(vec![0x01, OP_CHECKSIG])), 0);
        assert_eq!(
            count_legacy_sigops(&script(vec![0x02, OP_CHECKSIG, OP_CHECKSIG, OP_CHECKSIG])),
            1
        );
    }

    #[test]
    fn truncated_push_stops_the_walk() {
        // claims five bytes, provides one: counting stops at the bad push
        assert_eq!(
            count_legacy_sigops(&script(vec![OP_CHECKSIG, 0x05, OP_CHECKSIG])),
            1
        );
    }

    #[test]
    fn p2sh_redeem_script_counts_accurately() {
        let redeem = vec![OP_1 + 2, OP_CHECKMULTISIG]; // 3-key multisig
        let p2sh = p2sh_of(&redeem);
        let mut sig = vec![redeem.len() as u8];
        sig.extend_from_slice(&redeem);
        assert_eq!(count_p2sh_sigops(&p2sh, &script(sig)), 3);
    }

    #[test]
    fn p2sh_counting_requires_push_only_script_sig() {
        let redeem = vec![OP_CHECKMULTISIG];
        let p2sh = p2sh_of(&redeem);
        let mut sig = vec![0x75]; // OP_DROP: not a push
        sig.push(redeem.len() as u8);
        sig.extend_from_slice(&redeem);
        assert_eq!(count_p2sh_sigops(&p2sh, &script(sig)), 0);
    }

    #[test]
    fn non_p2sh_prev_output_counts_nothing() {
        let plain = script(vec![OP_CHECKSIG]);
        assert_eq!(count_p2sh_sigops(&plain, &script(vec![0x01, 0xff])), 0);
    }
}
