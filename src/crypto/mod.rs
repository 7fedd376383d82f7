//! Packet crypto for the datagram encapsulation.
//!
//! Dialects that protect datagram traffic themselves (rather than relying on
//! a record layer) wrap each packet ESP-style: block cipher in CBC mode for
//! confidentiality, truncated HMAC for integrity, monotonic sequence numbers
//! with a sliding replay window against duplication.
//!
//! ## Packet layout
//! ```text
//! +---------+---------+----------+------------------+--------+
//! | SPI     | SeqNo   | IV       | Ciphertext       | Tag    |
//! | 4B BE   | 4B BE   | 16B      | n*16B            | 12B    |
//! +---------+---------+----------+------------------+--------+
//! ```
//! The ciphertext ends with `1,2,…,padlen ‖ padlen ‖ next-header`. The HMAC
//! is computed over `SPI ‖ SeqNo ‖ IV ‖ Ciphertext` and truncated to 12
//! bytes. The last ciphertext block becomes the IV of the next outbound
//! packet.

mod replay;

pub use replay::{ReplayWindow, WINDOW_SIZE};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;

use crate::error::{Error, Result};
use crate::packet::Packet;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size; the padded plaintext is a multiple of this.
pub const BLOCK_SIZE: usize = 16;

/// Bytes of HMAC output appended to each packet.
pub const TAG_SIZE: usize = 12;

/// SPI + sequence number + IV.
pub const HEADER_SIZE: usize = 4 + 4 + 16;

/// Next-header value for Legacy IP payloads.
pub const NEXT_HEADER_IPV4: u8 = 0x04;

/// Next-header value for IPv6 payloads.
pub const NEXT_HEADER_IPV6: u8 = 0x29;

/// Supported block ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlg {
    Aes128Cbc,
    Aes256Cbc,
}

impl CipherAlg {
    pub fn key_len(&self) -> usize {
        match self {
            CipherAlg::Aes128Cbc => 16,
            CipherAlg::Aes256Cbc => 32,
        }
    }
}

/// Supported MAC algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacAlg {
    HmacMd5,
    HmacSha1,
}

impl MacAlg {
    pub fn key_len(&self) -> usize {
        match self {
            MacAlg::HmacMd5 => 16,
            MacAlg::HmacSha1 => 20,
        }
    }
}

/// Keying material for both directions of the datagram crypto layer, as
/// delivered inside the tunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramCryptoParams {
    pub cipher: CipherAlg,
    pub mac: MacAlg,
    pub spi_out: u32,
    pub spi_in: u32,
    pub enc_key_out: Vec<u8>,
    pub mac_key_out: Vec<u8>,
    pub enc_key_in: Vec<u8>,
    pub mac_key_in: Vec<u8>,
    pub iv_out: [u8; 16],
    pub iv_in: [u8; 16],
}

impl DatagramCryptoParams {
    /// Split raw per-direction keying material (`enc_key ‖ hmac_key`) into
    /// typed keys, validating the lengths against the selected suite.
    #[allow(clippy::too_many_arguments)]
    pub fn from_key_material(
        cipher: CipherAlg,
        mac: MacAlg,
        spi_out: u32,
        spi_in: u32,
        material_out: &[u8],
        material_in: &[u8],
        iv_out: [u8; 16],
        iv_in: [u8; 16],
    ) -> Result<Self> {
        let want = cipher.key_len() + mac.key_len();
        if material_out.len() != want || material_in.len() != want {
            return Err(Error::UnsupportedSuite(format!(
                "keying material must be {want} bytes for {cipher:?}/{mac:?}, got {}/{}",
                material_out.len(),
                material_in.len()
            )));
        }
        let split = cipher.key_len();
        Ok(Self {
            cipher,
            mac,
            spi_out,
            spi_in,
            enc_key_out: material_out[..split].to_vec(),
            mac_key_out: material_out[split..].to_vec(),
            enc_key_in: material_in[..split].to_vec(),
            mac_key_in: material_in[split..].to_vec(),
            iv_out,
            iv_in,
        })
    }
}

/// A cipher key validated against its algorithm.
#[derive(Clone)]
enum CipherKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl CipherKey {
    fn new(alg: CipherAlg, key: &[u8]) -> Result<Self> {
        if key.len() != alg.key_len() {
            return Err(Error::UnsupportedSuite(format!(
                "{alg:?} needs a {}-byte key, got {}",
                alg.key_len(),
                key.len()
            )));
        }
        Ok(match alg {
            CipherAlg::Aes128Cbc => {
                let mut k = [0u8; 16];
                k.copy_from_slice(key);
                CipherKey::Aes128(k)
            }
            CipherAlg::Aes256Cbc => {
                let mut k = [0u8; 32];
                k.copy_from_slice(key);
                CipherKey::Aes256(k)
            }
        })
    }

    fn encrypt_in_place(&self, iv: &[u8; 16], buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        match self {
            CipherKey::Aes128(key) => Aes128CbcEnc::new_from_slices(key, iv)
                .map_err(|e| Error::config(format!("cipher init: {e}")))?
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(drop)
                .map_err(|_| Error::malformed("plaintext not block-aligned")),
            CipherKey::Aes256(key) => Aes256CbcEnc::new_from_slices(key, iv)
                .map_err(|e| Error::config(format!("cipher init: {e}")))?
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(drop)
                .map_err(|_| Error::malformed("plaintext not block-aligned")),
        }
    }

    fn decrypt_in_place(&self, iv: &[u8; 16], buf: &mut [u8]) -> Result<()> {
        match self {
            CipherKey::Aes128(key) => Aes128CbcDec::new_from_slices(key, iv)
                .map_err(|e| Error::config(format!("cipher init: {e}")))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(drop)
                .map_err(|_| Error::malformed("ciphertext not block-aligned")),
            CipherKey::Aes256(key) => Aes256CbcDec::new_from_slices(key, iv)
                .map_err(|e| Error::config(format!("cipher init: {e}")))?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(drop)
                .map_err(|_| Error::malformed("ciphertext not block-aligned")),
        }
    }
}

/// A ready-to-clone HMAC instance.
#[derive(Clone)]
enum MacKey {
    Md5(Hmac<Md5>),
    Sha1(Hmac<Sha1>),
}

impl MacKey {
    fn new(alg: MacAlg, key: &[u8]) -> Result<Self> {
        if key.len() != alg.key_len() {
            return Err(Error::UnsupportedSuite(format!(
                "{alg:?} needs a {}-byte key, got {}",
                alg.key_len(),
                key.len()
            )));
        }
        Ok(match alg {
            MacAlg::HmacMd5 => MacKey::Md5(
                Hmac::<Md5>::new_from_slice(key)
                    .map_err(|e| Error::UnsupportedSuite(e.to_string()))?,
            ),
            MacAlg::HmacSha1 => MacKey::Sha1(
                Hmac::<Sha1>::new_from_slice(key)
                    .map_err(|e| Error::UnsupportedSuite(e.to_string()))?,
            ),
        })
    }

    fn tag(&self, parts: &[&[u8]]) -> [u8; TAG_SIZE] {
        let mut out = [0u8; TAG_SIZE];
        match self {
            MacKey::Md5(mac) => {
                let mut m = mac.clone();
                for p in parts {
                    m.update(p);
                }
                out.copy_from_slice(&m.finalize().into_bytes()[..TAG_SIZE]);
            }
            MacKey::Sha1(mac) => {
                let mut m = mac.clone();
                for p in parts {
                    m.update(p);
                }
                out.copy_from_slice(&m.finalize().into_bytes()[..TAG_SIZE]);
            }
        }
        out
    }

    /// Constant-time comparison against the truncated tag.
    fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        match self {
            MacKey::Md5(mac) => {
                let mut m = mac.clone();
                for p in parts {
                    m.update(p);
                }
                m.verify_truncated_left(tag).is_ok()
            }
            MacKey::Sha1(mac) => {
                let mut m = mac.clone();
                for p in parts {
                    m.update(p);
                }
                m.verify_truncated_left(tag).is_ok()
            }
        }
    }
}

/// Outbound crypto context: cipher, HMAC, chained IV and sequence counter.
pub struct CryptoOut {
    spi: u32,
    seq: u32,
    iv: [u8; 16],
    cipher: CipherKey,
    mac: MacKey,
}

/// Inbound crypto context: cipher, HMAC and the replay window.
pub struct CryptoIn {
    spi: u32,
    window: ReplayWindow,
    cipher: CipherKey,
    mac: MacKey,
}

/// Initialize both directions from the negotiated parameters.
pub fn contexts(params: &DatagramCryptoParams) -> Result<(CryptoOut, CryptoIn)> {
    let out = CryptoOut {
        spi: params.spi_out,
        seq: 0,
        iv: params.iv_out,
        cipher: CipherKey::new(params.cipher, &params.enc_key_out)?,
        mac: MacKey::new(params.mac, &params.mac_key_out)?,
    };
    let inn = CryptoIn {
        spi: params.spi_in,
        window: ReplayWindow::new(),
        cipher: CipherKey::new(params.cipher, &params.enc_key_in)?,
        mac: MacKey::new(params.mac, &params.mac_key_in)?,
    };
    Ok((out, inn))
}

impl CryptoOut {
    /// Next sequence number to be used.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Encrypt the packet payload in place.
    ///
    /// On return the payload is the full encapsulation:
    /// `SPI ‖ seq ‖ IV ‖ ciphertext ‖ tag`.
    pub fn encrypt(&mut self, pkt: &mut Packet, next_header: u8) -> Result<()> {
        if self.seq == u32::MAX {
            return Err(Error::SeqWrapped);
        }
        let seq = self.seq;

        // Trailer: 1,2,…,padlen ‖ padlen ‖ next-header, to a block multiple.
        let len = pkt.len();
        let padlen = BLOCK_SIZE - 1 - ((len + 1) % BLOCK_SIZE);
        let trailer = pkt
            .extend_tail(padlen + 2)
            .ok_or_else(|| Error::malformed("packet tailroom exhausted"))?;
        for (i, b) in trailer[..padlen].iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        trailer[padlen] = padlen as u8;
        trailer[padlen + 1] = next_header;

        let iv = self.iv;
        self.cipher.encrypt_in_place(&iv, pkt.payload_mut())?;

        // Chain: the last ciphertext block is the next packet's IV.
        let ct = pkt.payload();
        self.iv.copy_from_slice(&ct[ct.len() - BLOCK_SIZE..]);

        let spi_be = self.spi.to_be_bytes();
        let seq_be = seq.to_be_bytes();
        let tag = self.mac.tag(&[&spi_be, &seq_be, &iv, pkt.payload()]);

        if !pkt.put_tail(&tag) {
            return Err(Error::malformed("packet tailroom exhausted"));
        }
        if !pkt.push_head(&iv) || !pkt.push_head(&seq_be) || !pkt.push_head(&spi_be) {
            return Err(Error::malformed("packet headroom exhausted"));
        }

        self.seq += 1;
        Ok(())
    }
}

impl CryptoIn {
    /// Verify and decrypt the packet payload in place, returning the
    /// next-header byte. The payload becomes the plaintext.
    pub fn decrypt(&mut self, pkt: &mut Packet) -> Result<u8> {
        let data = pkt.payload();
        if data.len() < HEADER_SIZE + BLOCK_SIZE + TAG_SIZE {
            return Err(Error::malformed("encrypted packet too short"));
        }
        let ct_len = data.len() - HEADER_SIZE - TAG_SIZE;
        if ct_len % BLOCK_SIZE != 0 {
            return Err(Error::malformed("ciphertext not block-aligned"));
        }

        let spi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if spi != self.spi {
            return Err(Error::malformed(format!(
                "unknown SPI {spi:#010x}, expected {:#010x}",
                self.spi
            )));
        }
        let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let (authed, tag) = data.split_at(data.len() - TAG_SIZE);
        if !self.mac.verify(&[authed], tag) {
            return Err(Error::BadHmac);
        }

        if !self.window.check_and_update(seq) {
            return Err(Error::Replay);
        }

        let mut iv = [0u8; 16];
        iv.copy_from_slice(&data[8..24]);

        pkt.truncate(HEADER_SIZE + ct_len);
        if !pkt.pull_head(HEADER_SIZE) {
            return Err(Error::malformed("encrypted packet too short"));
        }
        self.cipher.decrypt_in_place(&iv, pkt.payload_mut())?;

        let pt = pkt.payload();
        let next_header = pt[pt.len() - 1];
        let padlen = pt[pt.len() - 2] as usize;
        if padlen + 2 > pt.len() {
            return Err(Error::malformed("pad length exceeds packet"));
        }
        pkt.truncate(pt.len() - padlen - 2);
        Ok(next_header)
    }
}
