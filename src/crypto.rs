use crate::config::{AesSize, Encryption};
use crate::error::Error;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Header carried by HTTP messages whose body travels encrypted; the value is
/// the cipher size in bits.
pub const ENCRYPTION_HEADER: &str = "X-AWH-Encryption";

const PBKDF2_ROUNDS: u32 = 4096;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric payload cipher. The key and IV are derived once from
/// `(pass, salt)` with PBKDF2-HMAC-SHA256 sized for the configured AES
/// variant; every message is ciphered independently in CBC mode with PKCS#7
/// padding.
pub struct PayloadCrypto {
    cipher: AesSize,
    key: Vec<u8>,
    iv: [u8; 16],
}

impl PayloadCrypto {
    pub fn new(config: &Encryption) -> Self {
        let key_len = config.cipher.key_len();
        // One derivation covers key material plus the IV block
        let mut derived = vec![0u8; key_len + 16];
        pbkdf2_hmac::<Sha256>(
            config.pass.as_bytes(),
            config.salt.as_bytes(),
            PBKDF2_ROUNDS,
            &mut derived,
        );
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&derived[key_len..]);
        derived.truncate(key_len);
        Self {
            cipher: config.cipher,
            key: derived,
            iv,
        }
    }

    /// Cipher size in bits, the value advertised via [`ENCRYPTION_HEADER`].
    pub fn bits(&self) -> u16 {
        self.cipher.bits()
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        // key and iv lengths are fixed by the derivation above
        match self.cipher {
            AesSize::Aes128 => Aes128CbcEnc::new_from_slices(&self.key, &self.iv)
                .expect("derived key length")
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            AesSize::Aes192 => Aes192CbcEnc::new_from_slices(&self.key, &self.iv)
                .expect("derived key length")
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
            AesSize::Aes256 => Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
                .expect("derived key length")
                .encrypt_padded_vec_mut::<Pkcs7>(plain),
        }
    }

    pub fn decrypt(&self, cipher_text: &[u8]) -> Result<Vec<u8>, Error> {
        let decrypted = match self.cipher {
            AesSize::Aes128 => Aes128CbcDec::new_from_slices(&self.key, &self.iv)
                .expect("derived key length")
                .decrypt_padded_vec_mut::<Pkcs7>(cipher_text),
            AesSize::Aes192 => Aes192CbcDec::new_from_slices(&self.key, &self.iv)
                .expect("derived key length")
                .decrypt_padded_vec_mut::<Pkcs7>(cipher_text),
            AesSize::Aes256 => Aes256CbcDec::new_from_slices(&self.key, &self.iv)
                .expect("derived key length")
                .decrypt_padded_vec_mut::<Pkcs7>(cipher_text),
        };
        decrypted.map_err(|_| Error::DecryptFailed)
    }

    /// Decrypts only when the peer advertised a cipher; a payload without the
    /// header hint passes through untouched.
    pub fn decrypt_hinted(
        &self,
        hint: Option<u16>,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        match hint {
            Some(bits) if AesSize::from_bits(bits).is_some() => self.decrypt(payload),
            Some(_) => Err(Error::DecryptFailed),
            None => Ok(payload.to_vec()),
        }
    }

    /// In-band cipher hint carried as the first payload byte of a tagged
    /// websocket message.
    pub fn ws_tag(&self) -> u8 {
        match self.cipher {
            AesSize::Aes128 => WS_TAG_AES128,
            AesSize::Aes192 => WS_TAG_AES192,
            AesSize::Aes256 => WS_TAG_AES256,
        }
    }

    fn bits_for_ws_tag(tag: u8) -> Option<u16> {
        match tag {
            WS_TAG_AES128 => Some(128),
            WS_TAG_AES192 => Some(192),
            WS_TAG_AES256 => Some(256),
            _ => None,
        }
    }

    /// Ciphers a websocket payload and prefixes the tag byte.
    pub fn seal_ws(&self, plain: &[u8]) -> Vec<u8> {
        let cipher_text = self.encrypt(plain);
        let mut tagged = Vec::with_capacity(1 + cipher_text.len());
        tagged.push(self.ws_tag());
        tagged.extend_from_slice(&cipher_text);
        tagged
    }

    /// Reverses `seal_ws`. A payload without a recognized tag byte is left
    /// as-is, matching the absent-header behavior on the HTTP side.
    pub fn open_ws(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        match payload.first().copied().and_then(Self::bits_for_ws_tag) {
            Some(bits) => self.decrypt_hinted(Some(bits), &payload[1..]),
            None => Ok(payload.to_vec()),
        }
    }
}

const WS_TAG_AES128: u8 = 0x01;
const WS_TAG_AES192: u8 = 0x02;
const WS_TAG_AES256: u8 = 0x03;

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto(cipher: AesSize) -> PayloadCrypto {
        PayloadCrypto::new(&Encryption {
            pass: "correct horse battery staple".to_string(),
            salt: "pepper".to_string(),
            cipher,
        })
    }

    #[test]
    fn test_roundtrip_all_sizes() {
        for cipher in [AesSize::Aes128, AesSize::Aes192, AesSize::Aes256] {
            let crypto = crypto(cipher);
            for len in [0usize, 1, 15, 16, 17, 1000] {
                let plain = vec![0x5A; len];
                let encrypted = crypto.encrypt(&plain);
                assert_ne!(encrypted, plain);
                // CBC always pads up to a whole block
                assert_eq!(encrypted.len() % 16, 0);
                assert_eq!(crypto.decrypt(&encrypted).unwrap(), plain);
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = crypto(AesSize::Aes256);
        let b = PayloadCrypto::new(&Encryption {
            pass: "other".to_string(),
            salt: "pepper".to_string(),
            cipher: AesSize::Aes256,
        });
        let encrypted = a.encrypt(b"secret");
        // Either padding breaks or the payload differs, both count as failure
        match b.decrypt(&encrypted) {
            Ok(decrypted) => assert_ne!(decrypted, b"secret"),
            Err(err) => assert!(matches!(err, Error::DecryptFailed)),
        }
    }

    #[test]
    fn test_hint_passthrough() {
        let crypto = crypto(AesSize::Aes128);
        let payload = b"already plain".to_vec();
        assert_eq!(crypto.decrypt_hinted(None, &payload).unwrap(), payload);
        assert!(crypto.decrypt_hinted(Some(512), &payload).is_err());
    }

    #[test]
    fn test_bits_header_value() {
        assert_eq!(crypto(AesSize::Aes192).bits(), 192);
    }

    #[test]
    fn test_ws_tag_roundtrip() {
        for cipher in [AesSize::Aes128, AesSize::Aes192, AesSize::Aes256] {
            let crypto = crypto(cipher);
            let plain = b"frame payload".to_vec();
            let tagged = crypto.seal_ws(&plain);
            assert_eq!(tagged[0], crypto.ws_tag());
            assert_eq!(crypto.open_ws(&tagged).unwrap(), plain);
        }
    }

    #[test]
    fn test_ws_untagged_passthrough() {
        let crypto = crypto(AesSize::Aes128);
        // 0x04 and up are not cipher tags, the payload is left alone
        let payload = vec![0x04, 0xde, 0xad];
        assert_eq!(crypto.open_ws(&payload).unwrap(), payload);
        assert_eq!(crypto.open_ws(&[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_ws_tag_cipher_mismatch_fails() {
        let sealer = crypto(AesSize::Aes128);
        let opener = crypto(AesSize::Aes256);
        let tagged = sealer.seal_ws(b"secret");
        // a foreign tag decrypts with the wrong key and must not yield the
        // original bytes
        match opener.open_ws(&tagged) {
            Ok(opened) => assert_ne!(opened, b"secret"),
            Err(err) => assert!(matches!(err, Error::DecryptFailed)),
        }
    }
}
