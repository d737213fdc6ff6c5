//! WireGuard handshake probe (Noise_IKpsk2), as spoken by WARP endpoints.
//!
//! Only the first round trip is performed: a 148-byte initiation goes out
//! and a 92-byte response must come back that decrypts under the keys we
//! derived. No transport data is ever sent.
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use blake2::digest::generic_array::GenericArray;
use blake2::digest::{consts::U16, KeyInit, Mac};
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::SimpleHmac;
use tokio::time::{self, Instant};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::{ScanConfig, TunnelKeys};
use crate::error::{ProbeError, TimeoutStage};
use crate::probe::dial::Dialer;

const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";
const LABEL_MAC1: &[u8] = b"mac1----";

pub const INITIATION_LEN: usize = 148;
pub const RESPONSE_LEN: usize = 92;
const MSG_INITIATION: u8 = 1;
const MSG_RESPONSE: u8 = 2;
const MSG_COOKIE_REPLY: u8 = 3;

/// TAI64 label for the Unix epoch, as WireGuard uses it.
const TAI64_EPOCH: u64 = 0x4000_0000_0000_000a;

type Hash = [u8; 32];

fn hash(parts: &[&[u8]]) -> Hash {
    let mut d = Blake2s256::new();
    for p in parts {
        Digest::update(&mut d, p);
    }
    d.finalize().into()
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<Hash, ProbeError> {
    let mut m = <SimpleHmac<Blake2s256> as KeyInit>::new_from_slice(key)
        .map_err(|e| ProbeError::Handshake(format!("hmac key: {e}")))?;
    for p in parts {
        Mac::update(&mut m, p);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&m.finalize().into_bytes());
    Ok(out)
}

/// HKDF over HMAC-BLAKE2s, returning the first `N` outputs.
fn kdf<const N: usize>(chaining_key: &Hash, input: &[u8]) -> Result<[Hash; N], ProbeError> {
    let prk = hmac(chaining_key, &[input])?;
    let mut out = [[0u8; 32]; N];
    for i in 0..N {
        let counter = [i as u8 + 1];
        out[i] = match i {
            0 => hmac(&prk, &[&counter])?,
            _ => {
                let prev = out[i - 1];
                hmac(&prk, &[&prev, &counter])?
            }
        };
    }
    Ok(out)
}

fn mac(key: &Hash, data: &[u8]) -> [u8; 16] {
    let mut m = <Blake2sMac<U16> as KeyInit>::new(GenericArray::from_slice(key));
    Mac::update(&mut m, data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&m.finalize().into_bytes());
    out
}

fn seal(key: &Hash, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, ProbeError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: plaintext, aad })
        .map_err(|_| ProbeError::Handshake("sealing failed".into()))
}

fn open(key: &Hash, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, ProbeError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: ciphertext, aad })
        .map_err(|_| ProbeError::Handshake("response failed authentication".into()))
}

fn dh(secret: &StaticSecret, public: &PublicKey) -> Result<Hash, ProbeError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(ProbeError::Handshake("low-order public key".into()));
    }
    Ok(shared.to_bytes())
}

fn tai64n(now: SystemTime) -> [u8; 12] {
    let since = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(&(TAI64_EPOCH + since.as_secs()).to_be_bytes());
    out[8..].copy_from_slice(&since.subsec_nanos().to_be_bytes());
    out
}

/// Initiator state kept between sending the initiation and reading the response.
pub struct Handshake {
    packet: [u8; INITIATION_LEN],
    sender_index: u32,
    chaining_key: Hash,
    hash: Hash,
    ephemeral: StaticSecret,
    static_secret: StaticSecret,
    static_public: PublicKey,
    preshared_key: Hash,
}

impl Handshake {
    pub fn initiate(
        keys: &TunnelKeys,
        ephemeral: StaticSecret,
        sender_index: u32,
        now: SystemTime,
    ) -> Result<Self, ProbeError> {
        let static_secret = StaticSecret::from(keys.private_key);
        let static_public = PublicKey::from(&static_secret);
        let peer = PublicKey::from(keys.peer_public_key);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let mut ck = hash(&[CONSTRUCTION]);
        let mut h = hash(&[&ck, IDENTIFIER]);
        h = hash(&[&h, peer.as_bytes()]);

        [ck] = kdf::<1>(&ck, ephemeral_public.as_bytes())?;
        h = hash(&[&h, ephemeral_public.as_bytes()]);

        let [next, key] = kdf::<2>(&ck, &dh(&ephemeral, &peer)?)?;
        ck = next;
        let encrypted_static = seal(&key, static_public.as_bytes(), &h)?;
        h = hash(&[&h, &encrypted_static]);

        let [next, key] = kdf::<2>(&ck, &dh(&static_secret, &peer)?)?;
        ck = next;
        let encrypted_timestamp = seal(&key, &tai64n(now), &h)?;
        h = hash(&[&h, &encrypted_timestamp]);

        let mut packet = [0u8; INITIATION_LEN];
        packet[0] = MSG_INITIATION;
        packet[4..8].copy_from_slice(&sender_index.to_le_bytes());
        packet[8..40].copy_from_slice(ephemeral_public.as_bytes());
        packet[40..88].copy_from_slice(&encrypted_static);
        packet[88..116].copy_from_slice(&encrypted_timestamp);
        let mac1 = mac(&hash(&[LABEL_MAC1, peer.as_bytes()]), &packet[..116]);
        packet[116..132].copy_from_slice(&mac1);

        Ok(Self {
            packet,
            sender_index,
            chaining_key: ck,
            hash: h,
            ephemeral,
            static_secret,
            static_public,
            preshared_key: keys.preshared_key.unwrap_or([0u8; 32]),
        })
    }

    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Accept only a response addressed to us that decrypts under our keys.
    pub fn verify_response(&self, msg: &[u8]) -> Result<(), ProbeError> {
        match msg.first() {
            Some(&MSG_RESPONSE) if msg.len() == RESPONSE_LEN => {}
            Some(&MSG_COOKIE_REPLY) => {
                return Err(ProbeError::Handshake("endpoint is under load (cookie reply)".into()))
            }
            _ => {
                return Err(ProbeError::Handshake(format!(
                    "unexpected {}-byte message",
                    msg.len()
                )))
            }
        }
        let receiver = u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]);
        if receiver != self.sender_index {
            return Err(ProbeError::Handshake("response for another session".into()));
        }
        let expected_mac1 = mac(&hash(&[LABEL_MAC1, self.static_public.as_bytes()]), &msg[..60]);
        if msg[60..76] != expected_mac1 {
            return Err(ProbeError::Handshake("bad mac1".into()));
        }

        let mut responder_ephemeral = [0u8; 32];
        responder_ephemeral.copy_from_slice(&msg[12..44]);
        let responder_ephemeral = PublicKey::from(responder_ephemeral);

        let [mut ck] = kdf::<1>(&self.chaining_key, responder_ephemeral.as_bytes())?;
        let h = hash(&[&self.hash, responder_ephemeral.as_bytes()]);
        [ck] = kdf::<1>(&ck, &dh(&self.ephemeral, &responder_ephemeral)?)?;
        [ck] = kdf::<1>(&ck, &dh(&self.static_secret, &responder_ephemeral)?)?;
        let [_, tau, key] = kdf::<3>(&ck, &self.preshared_key)?;
        let h = hash(&[&h, &tau]);

        let empty = open(&key, &msg[44..60], &h)?;
        if !empty.is_empty() {
            return Err(ProbeError::Handshake("non-empty response payload".into()));
        }
        Ok(())
    }
}

/// One initiation/response round trip against `target`.
pub async fn probe(
    dialer: &dyn Dialer,
    keys: &TunnelKeys,
    config: &ScanConfig,
    target: SocketAddr,
) -> Result<Duration, ProbeError> {
    let handshake = Handshake::initiate(
        keys,
        StaticSecret::from(rand::random::<[u8; 32]>()),
        rand::random(),
        SystemTime::now(),
    )?;
    let socket = dialer.dial_udp(target).await?;

    let start = Instant::now();
    socket.send(handshake.packet()).await?;

    let mut buf = [0u8; 256];
    let n = time::timeout(config.handshake_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| ProbeError::Timeout { stage: TimeoutStage::Handshake })??;
    let rtt = start.elapsed();

    handshake.verify_response(&buf[..n])?;
    Ok(rtt)
}
