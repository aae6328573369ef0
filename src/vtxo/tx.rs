//! Scripts and transaction templates shared by the client and the server.
//!
//! Every VTXO output is P2WSH with two branches: a cooperative
//! `user + server` branch used for off-chain transfers and rounds, and a
//! unilateral branch the user can take alone after `exit_delta` blocks.
//! Exit-chain transactions are version 3 with a zero-value pay-to-anchor
//! output so the exiting party can bump them with CPFP.

use bitcoin::absolute::LockTime;
use bitcoin::ecdsa::Signature;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF, OP_SHA256,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Weight, Witness};

use super::{VtxoPolicy, VtxoRequest};
use crate::error::{Result, WalletError};

/// Pay-to-anchor: `OP_1 <0x4e73>`.
pub const P2A_SCRIPT: [u8; 4] = [0x51, 0x02, 0x4e, 0x73];

/// Upper bound on the weight of a signed claim transaction
/// (one P2WSH input through the largest branch, one P2TR output).
pub const CLAIM_TX_WEIGHT: Weight = Weight::from_wu(680);

/// Virtual size of an output paying to `script_pubkey`.
pub fn output_vbytes(script_pubkey: &Script) -> u64 {
    // 8 value + 1 length + script
    9 + script_pubkey.len() as u64
}

pub fn fee_anchor() -> TxOut {
    TxOut { value: Amount::ZERO, script_pubkey: ScriptBuf::from_bytes(P2A_SCRIPT.to_vec()) }
}

pub fn is_fee_anchor(txout: &TxOut) -> bool {
    txout.script_pubkey.as_bytes() == P2A_SCRIPT
}

pub fn p2wsh(witness_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&witness_script.wscript_hash())
}

fn key(pk: &PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey::new(*pk)
}

fn cosign_branch(builder: Builder, user: &PublicKey, server: &PublicKey) -> Builder {
    builder
        .push_key(&key(user))
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_key(&key(server))
        .push_opcode(OP_CHECKSIG)
}

/// Onchain anchor of a board or round leaf: cosigned, or swept by the
/// server once the VTXO expired.
pub fn anchor_script(user: &PublicKey, server: &PublicKey, expiry_height: u32) -> ScriptBuf {
    let b = cosign_branch(Builder::new().push_opcode(OP_IF), user, server);
    b.push_opcode(OP_ELSE)
        .push_int(expiry_height as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(&key(server))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// Anchor of a VTXO the server issues on its own (Lightning receives).
pub fn server_anchor_script(server: &PublicKey) -> ScriptBuf {
    Builder::new().push_key(&key(server)).push_opcode(OP_CHECKSIG).into_script()
}

/// Witness script of a VTXO output.
pub fn policy_script(policy: &VtxoPolicy, server: &PublicKey, exit_delta: u16) -> ScriptBuf {
    let user = policy.user_pubkey();
    let b = cosign_branch(Builder::new().push_opcode(OP_IF), &user, server).push_opcode(OP_ELSE);
    let b = match policy {
        VtxoPolicy::Pubkey { .. } => b,
        VtxoPolicy::ServerHtlcSend { htlc_expiry, .. } => {
            b.push_int(*htlc_expiry as i64).push_opcode(OP_CLTV).push_opcode(OP_DROP)
        }
        VtxoPolicy::ServerHtlcRecv { payment_hash, .. } => {
            b.push_opcode(OP_SHA256).push_slice(payment_hash.to_byte_array()).push_opcode(OP_EQUALVERIFY)
        }
    };
    b.push_int(exit_delta as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_key(&key(&user))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

pub fn vtxo_txout(request: &VtxoRequest, server: &PublicKey, exit_delta: u16) -> TxOut {
    TxOut {
        value: request.amount,
        script_pubkey: p2wsh(&policy_script(&request.policy, server, exit_delta)),
    }
}

/// Version 3 exit-chain transaction spending `prevout`.
pub fn exit_tx(prevout: OutPoint, outputs: Vec<TxOut>) -> Transaction {
    let mut output = outputs;
    output.push(fee_anchor());
    Transaction {
        version: Version(3),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prevout,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output,
    }
}

/// Out-of-round transfer: spends one VTXO into the requested outputs.
pub fn arkoor_tx(input: OutPoint, outputs: &[VtxoRequest], server: &PublicKey, exit_delta: u16) -> Transaction {
    exit_tx(input, outputs.iter().map(|o| vtxo_txout(o, server, exit_delta)).collect())
}

/// Forfeit of a VTXO to the server, signed by the user when it joins a round.
pub fn forfeit_tx(input: OutPoint, amount: Amount, server: &PublicKey) -> Transaction {
    exit_tx(input, vec![TxOut { value: amount, script_pubkey: server_anchor_script(server) }])
}

/// Unilateral claim of an exited VTXO through its timeout branch.
pub fn claim_tx(
    point: OutPoint,
    policy: &VtxoPolicy,
    exit_delta: u16,
    destination: ScriptBuf,
    value: Amount,
) -> Result<Transaction> {
    let lock_time = match policy.htlc_expiry() {
        Some(expiry) if matches!(policy, VtxoPolicy::ServerHtlcSend { .. }) => LockTime::from_height(expiry)
            .map_err(|e| WalletError::Protocol(format!("htlc expiry: {}", e)))?,
        _ => LockTime::ZERO,
    };
    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: point,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(exit_delta),
            witness: Witness::new(),
        }],
        output: vec![TxOut { value, script_pubkey: destination }],
    })
}

pub fn sighash(tx: &Transaction, input: usize, witness_script: &Script, value: Amount) -> Result<Message> {
    let hash = SighashCache::new(tx)
        .p2wsh_signature_hash(input, witness_script, value, EcdsaSighashType::All)
        .map_err(|e| WalletError::Protocol(format!("sighash: {}", e)))?;
    Ok(Message::from_digest(hash.to_byte_array()))
}

pub fn sign_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input: usize,
    witness_script: &Script,
    value: Amount,
    secret: &SecretKey,
) -> Result<Signature> {
    let msg = sighash(tx, input, witness_script, value)?;
    Ok(Signature { signature: secp.sign_ecdsa(&msg, secret), sighash_type: EcdsaSighashType::All })
}

pub fn verify_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input: usize,
    witness_script: &Script,
    value: Amount,
    signature: &Signature,
    pubkey: &PublicKey,
) -> bool {
    match sighash(tx, input, witness_script, value) {
        Ok(msg) => {
            signature.sighash_type == EcdsaSighashType::All
                && secp.verify_ecdsa(&msg, &signature.signature, pubkey).is_ok()
        }
        Err(_) => false,
    }
}

/// Witness for the cooperative branch of [anchor_script] / [policy_script].
pub fn cosign_witness(user_sig: &Signature, server_sig: &Signature, witness_script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push(server_sig.to_vec());
    w.push(user_sig.to_vec());
    w.push([1u8]);
    w.push(witness_script.as_bytes());
    w
}

pub fn server_only_witness(server_sig: &Signature, witness_script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push(server_sig.to_vec());
    w.push(witness_script.as_bytes());
    w
}

/// Witness for the unilateral branch of [policy_script].
pub fn claim_witness(user_sig: &Signature, preimage: Option<&[u8; 32]>, witness_script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push(user_sig.to_vec());
    if let Some(preimage) = preimage {
        w.push(preimage);
    }
    w.push([] as [u8; 0]);
    w.push(witness_script.as_bytes());
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::PaymentHash;
    use bitcoin::hashes::sha256;

    fn keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        (sk, sk.public_key(&secp))
    }

    #[test]
    fn test_policy_scripts_differ() {
        let (_, user) = keypair(1);
        let (_, server) = keypair(2);
        let hash = PaymentHash::from(sha256::Hash::hash(b"preimage"));
        let plain = policy_script(&VtxoPolicy::new_pubkey(user), &server, 12);
        let send = policy_script(
            &VtxoPolicy::ServerHtlcSend { user_pubkey: user, payment_hash: hash, htlc_expiry: 500 },
            &server,
            12,
        );
        let recv = policy_script(
            &VtxoPolicy::ServerHtlcRecv { user_pubkey: user, payment_hash: hash, htlc_expiry: 500 },
            &server,
            12,
        );
        assert_ne!(plain, send);
        assert_ne!(send, recv);
        assert_ne!(policy_script(&VtxoPolicy::new_pubkey(user), &server, 13), plain);
    }

    #[test]
    fn test_exit_tx_shape() {
        let (_, user) = keypair(1);
        let (_, server) = keypair(2);
        let out = vtxo_txout(&VtxoRequest { policy: VtxoPolicy::new_pubkey(user), amount: Amount::from_sat(5000) }, &server, 12);
        let tx = exit_tx(OutPoint::null(), vec![out.clone()]);
        assert_eq!(tx.version, Version(3));
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0], out);
        assert!(is_fee_anchor(&tx.output[1]));
    }

    #[test]
    fn test_sign_and_verify_cosign_input() {
        let secp = Secp256k1::new();
        let (user_sk, user) = keypair(1);
        let (server_sk, server) = keypair(2);
        let script = anchor_script(&user, &server, 1000);
        let value = Amount::from_sat(10_000);
        let tx = exit_tx(OutPoint::null(), vec![TxOut { value, script_pubkey: p2wsh(&script) }]);

        let user_sig = sign_input(&secp, &tx, 0, &script, value, &user_sk).unwrap();
        let server_sig = sign_input(&secp, &tx, 0, &script, value, &server_sk).unwrap();
        assert!(verify_input(&secp, &tx, 0, &script, value, &user_sig, &user));
        assert!(verify_input(&secp, &tx, 0, &script, value, &server_sig, &server));
        assert!(!verify_input(&secp, &tx, 0, &script, value, &user_sig, &server));
        assert!(!verify_input(&secp, &tx, 0, &script, Amount::from_sat(1), &user_sig, &user));

        let witness = cosign_witness(&user_sig, &server_sig, &script);
        assert_eq!(witness.len(), 4);
    }

    #[test]
    fn test_claim_tx_relative_lock() {
        let (_, user) = keypair(1);
        let tx = claim_tx(OutPoint::null(), &VtxoPolicy::new_pubkey(user), 24, ScriptBuf::new(), Amount::from_sat(900)).unwrap();
        assert_eq!(tx.input[0].sequence, Sequence::from_height(24));
        assert_eq!(tx.lock_time, LockTime::ZERO);
    }
}
