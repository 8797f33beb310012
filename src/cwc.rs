//! CWC-AES authenticated encryption.
//!
//! The wire protocol frames every encrypted datagram as
//! `IV(11) || TAG(16) || CT`, with the 11-byte nonce doubling as the
//! additional authenticated data. CWC (Carter-Wegman + Counter) is not
//! available as a registry crate, so the mode is assembled here from the
//! RustCrypto `aes` block cipher: a CTR keystream over counter blocks
//! `0x80 || nonce || ctr`, and a polynomial universal hash over
//! GF(2^127 - 1) for the tag.
//!
//! The 11-byte nonce size is wire-visible and must not change: the counter
//! block layout is one type byte, 11 nonce bytes and a 32-bit block counter.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{Result, StreamError};

/// Per-packet nonce length. Wire-visible.
pub const NONCE_LEN: usize = 11;

/// Authentication tag length. Wire-visible.
pub const TAG_LEN: usize = 16;

/// Bytes the cipher adds in front of the ciphertext.
pub const ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;

/// The hash field modulus, 2^127 - 1.
const P127: u128 = (1 << 127) - 1;

const MASK64: u128 = (1 << 64) - 1;

/// 96-bit hash block size in bytes.
const HASH_BLOCK_LEN: usize = 12;

enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    fn encrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesKey::Aes128(cipher) => cipher.encrypt_block(block),
            AesKey::Aes192(cipher) => cipher.encrypt_block(block),
            AesKey::Aes256(cipher) => cipher.encrypt_block(block),
        }
    }
}

/// One stream's cipher context: the AES key schedule plus the derived
/// Carter-Wegman hash key. Created with the stream, dropped with it, never
/// shared across streams.
pub struct CwcCipher {
    aes: AesKey,
    hash_key: u128,
}

impl CwcCipher {
    pub fn new(key: &[u8]) -> Result<CwcCipher> {
        let aes = match key.len() {
            16 => AesKey::Aes128(Aes128::new(GenericArray::from_slice(key))),
            24 => AesKey::Aes192(Aes192::new(GenericArray::from_slice(key))),
            32 => AesKey::Aes256(Aes256::new(GenericArray::from_slice(key))),
            n => {
                return Err(StreamError::crypto(format!(
                    "unsupported CWC key length {n}, expected 16, 24 or 32 bytes"
                )))
            }
        };

        // Hash subkey: AES of a type-0xC0 block, reduced into the field.
        let mut block = [0u8; 16];
        block[0] = 0xC0;
        aes.encrypt_block(&mut block);
        let hash_key = reduce(u128::from_be_bytes(block));

        Ok(CwcCipher { aes, hash_key })
    }

    /// Encrypt `plaintext` under a fresh random nonce, producing the full
    /// `IV || TAG || CT` wire frame.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Ok(self.encrypt_with_nonce(&nonce, plaintext))
    }

    /// Encrypt under a caller-chosen nonce. The datagram framing pins the
    /// leading nonce byte; everything else uses [`CwcCipher::encrypt`].
    pub(crate) fn encrypt_with_nonce(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
        let mut wire = vec![0u8; ENVELOPE_LEN + plaintext.len()];
        wire[..NONCE_LEN].copy_from_slice(nonce);

        let ciphertext = &mut wire[ENVELOPE_LEN..];
        ciphertext.copy_from_slice(plaintext);
        self.apply_keystream(nonce, ciphertext);

        let tag = self.compute_tag(nonce, &wire[ENVELOPE_LEN..]);
        wire[NONCE_LEN..ENVELOPE_LEN].copy_from_slice(&tag);
        wire
    }

    /// Verify and decrypt a full `IV || TAG || CT` wire frame.
    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() < ENVELOPE_LEN + 1 {
            return Err(StreamError::crypto(format!(
                "encrypted frame of {} bytes is below the {} byte minimum",
                wire.len(),
                ENVELOPE_LEN + 1
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&wire[..NONCE_LEN]);
        let tag = &wire[NONCE_LEN..ENVELOPE_LEN];
        let ciphertext = &wire[ENVELOPE_LEN..];

        let expected = self.compute_tag(&nonce, ciphertext);
        if expected.ct_eq(tag).unwrap_u8() == 0 {
            return Err(StreamError::crypto("authentication tag mismatch"));
        }

        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(&nonce, &mut plaintext);
        Ok(plaintext)
    }

    fn counter_block(nonce: &[u8; NONCE_LEN], counter: u32) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[0] = 0x80;
        block[1..1 + NONCE_LEN].copy_from_slice(nonce);
        block[12..].copy_from_slice(&counter.to_be_bytes());
        block
    }

    /// CTR keystream xor, counter starting at 1 (block 0 is reserved for the
    /// tag).
    fn apply_keystream(&self, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        for (index, chunk) in data.chunks_mut(16).enumerate() {
            let mut block = Self::counter_block(nonce, index as u32 + 1);
            self.aes.encrypt_block(&mut block);
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }

    /// Tag over `(aad, ciphertext)` where the AAD is the nonce itself:
    /// `AES(hash) XOR AES(counter_block_0)`.
    fn compute_tag(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let hash = self.cw_hash(nonce, ciphertext);

        let mut hash_block = hash.to_be_bytes();
        self.aes.encrypt_block(&mut hash_block);

        let mut pad = Self::counter_block(nonce, 0);
        self.aes.encrypt_block(&mut pad);

        let mut tag = [0u8; TAG_LEN];
        for (out, (h, p)) in tag.iter_mut().zip(hash_block.iter().zip(pad.iter())) {
            *out = h ^ p;
        }
        tag
    }

    /// Carter-Wegman polynomial hash over the padded AAD and ciphertext,
    /// closed with a length block, evaluated by Horner's rule:
    /// `B1*K^(n+1) + ... + Bn*K^2 + (len_aad*2^64 + len_ct)*K  (mod 2^127-1)`.
    fn cw_hash(&self, aad: &[u8], ciphertext: &[u8]) -> u128 {
        let mut acc = 0u128;
        for block in HashBlocks::new(aad).chain(HashBlocks::new(ciphertext)) {
            acc = add_mod(mul_mod(acc, self.hash_key), block);
        }
        let length_block = ((aad.len() as u128) << 64) | ciphertext.len() as u128;
        acc = add_mod(mul_mod(acc, self.hash_key), length_block);
        mul_mod(acc, self.hash_key)
    }
}

/// Iterator over 96-bit big-endian hash blocks, zero-padding the tail.
struct HashBlocks<'a> {
    data: &'a [u8],
}

impl<'a> HashBlocks<'a> {
    fn new(data: &'a [u8]) -> HashBlocks<'a> {
        HashBlocks { data }
    }
}

impl Iterator for HashBlocks<'_> {
    type Item = u128;

    fn next(&mut self) -> Option<u128> {
        if self.data.is_empty() {
            return None;
        }
        let take = self.data.len().min(HASH_BLOCK_LEN);
        let mut padded = [0u8; HASH_BLOCK_LEN];
        padded[..take].copy_from_slice(&self.data[..take]);
        self.data = &self.data[take..];

        let mut wide = [0u8; 16];
        wide[4..].copy_from_slice(&padded);
        Some(u128::from_be_bytes(wide))
    }
}

/// Fold a value below 2^128 into the field.
fn reduce(x: u128) -> u128 {
    let folded = (x & P127) + (x >> 127);
    if folded >= P127 {
        folded - P127
    } else {
        folded
    }
}

fn add_mod(a: u128, b: u128) -> u128 {
    reduce(a + b)
}

/// Schoolbook 64-bit limb multiplication, folded with `2^127 == 1 (mod p)`.
fn mul_mod(a: u128, b: u128) -> u128 {
    let (a_hi, a_lo) = (a >> 64, a & MASK64);
    let (b_hi, b_lo) = (b >> 64, b & MASK64);

    let low = a_lo * b_lo;
    let mid = a_hi * b_lo + a_lo * b_hi;
    let high = a_hi * b_hi;

    // full product = high*2^128 + mid*2^64 + low, with 2^128 == 2 (mod p)
    let mut acc = reduce(low);
    acc = add_mod(acc, reduce((mid & MASK64) << 64));
    acc = add_mod(acc, reduce((mid >> 64) << 1));
    add_mod(acc, reduce(high << 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ZERO_KEY: [u8; 16] = [0u8; 16];

    fn cipher() -> CwcCipher {
        CwcCipher::new(&ZERO_KEY).unwrap()
    }

    #[rstest]
    #[case::single_byte(1)]
    #[case::below_block(15)]
    #[case::exact_block(16)]
    #[case::above_block(17)]
    #[case::two_blocks(32)]
    #[case::odd(333)]
    #[case::large(1400)]
    fn test_round_trip(#[case] len: usize) {
        let cipher = cipher();
        let plaintext = (0..len).map(|i| i as u8).collect::<Vec<_>>();

        let wire = cipher.encrypt(&plaintext).unwrap();
        assert_eq!(wire.len(), ENVELOPE_LEN + len);

        let decrypted = cipher.decrypt(&wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[rstest]
    #[case(24)]
    #[case(32)]
    fn test_round_trip_longer_keys(#[case] key_len: usize) {
        let key = (0..key_len).map(|i| i as u8).collect::<Vec<_>>();
        let cipher = CwcCipher::new(&key).unwrap();

        let wire = cipher.encrypt(b"reliable transport").unwrap();
        assert_eq!(cipher.decrypt(&wire).unwrap(), b"reliable transport");
    }

    #[rstest]
    #[case(0)]
    #[case(15)]
    #[case(17)]
    #[case(33)]
    fn test_rejects_unsupported_key_length(#[case] key_len: usize) {
        let key = vec![0u8; key_len];
        assert!(matches!(CwcCipher::new(&key), Err(StreamError::Crypto(_))));
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let cipher = cipher();
        let wire = cipher.encrypt(b"hello").unwrap();

        for byte in 0..wire.len() {
            for bit in 0..8 {
                let mut tampered = wire.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(cipher.decrypt(&tampered), Err(StreamError::Crypto(_))),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_rejects_short_frames() {
        let cipher = cipher();
        for len in 0..=ENVELOPE_LEN {
            assert!(cipher.decrypt(&vec![0u8; len]).is_err());
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same message").unwrap();
        let b = cipher.encrypt(b"same message").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_encryption_is_deterministic_for_fixed_nonce() {
        let cipher = cipher();
        let nonce = [7u8; NONCE_LEN];
        let a = cipher.encrypt_with_nonce(&nonce, b"payload");
        let b = cipher.encrypt_with_nonce(&nonce, b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let wire = cipher().encrypt(b"for someone else").unwrap();
        let other = CwcCipher::new(&[1u8; 16]).unwrap();
        assert!(matches!(other.decrypt(&wire), Err(StreamError::Crypto(_))));
    }

    #[rstest]
    #[case(0, 0, 0)]
    #[case(1, P127 - 1, P127 - 1)]
    #[case(2, P127 - 1, P127 - 2)] // 2*(p-1) = 2p - 2 == p - 2
    #[case(1 << 96, 1 << 40, 512)] // 2^136 == 2^9 (mod p)
    fn test_mul_mod(#[case] a: u128, #[case] b: u128, #[case] expected: u128) {
        assert_eq!(mul_mod(a, b), expected);
        assert_eq!(mul_mod(b, a), expected);
    }

    #[test]
    fn test_reduce_folds_top_bit() {
        assert_eq!(reduce(P127), 0);
        assert_eq!(reduce(P127 + 5), 5);
        assert_eq!(reduce(u128::MAX), 1); // 2^128 - 1 = 2p + 1 == 1
    }
}
