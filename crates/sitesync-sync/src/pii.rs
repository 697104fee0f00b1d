//! Derivation of the local-only PII columns: keyed hashes for lookup,
//! authenticated ciphertext for storage, and the display-safe masked name.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use thiserror::Error;

use sitesync_store::types::ProtectedValue;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum PiiError {
    #[error("invalid HMAC key")]
    InvalidKey,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,
}

impl PiiError {
    pub fn code(&self) -> &'static str {
        match self {
            PiiError::InvalidKey => "PII_KEY_INVALID",
            PiiError::Encrypt => "PII_ENCRYPT_FAILED",
            PiiError::Decrypt => "PII_DECRYPT_FAILED",
        }
    }
}

/// Keep only ASCII digits: `"010-12 34-5678"` → `"01012345678"`.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// `김` → `김`, `박철` → `박*`, `강호동` → `강*동`, `남궁민수` → `남**수`.
pub fn mask_name(name: &str) -> String {
    let chars: Vec<char> = name.trim().chars().collect();
    match chars.len() {
        0 | 1 => chars.iter().collect(),
        2 => format!("{}*", chars[0]),
        n => {
            let mut out = String::with_capacity(n * 3);
            out.push(chars[0]);
            out.extend(std::iter::repeat('*').take(n - 2));
            out.push(chars[n - 1]);
            out
        }
    }
}

/// `YYMMDD` + century digit → `YYYYMMDD`.
///
/// The seventh character selects the century: 1,2,5,6 → 1900s; 3,4,7,8 →
/// 2000s; 9,0 → 1800s. Short input or a non-digit yields `None`.
pub fn national_id_to_dob(prefix: &str) -> Option<String> {
    let digits: Vec<char> = prefix.chars().take(7).collect();
    if digits.len() < 7 || !digits.iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let century = match digits[6] {
        '1' | '2' | '5' | '6' => "19",
        '3' | '4' | '7' | '8' => "20",
        '9' | '0' => "18",
        _ => return None,
    };
    let yymmdd: String = digits[..6].iter().collect();
    Some(format!("{century}{yymmdd}"))
}

/// HMAC-SHA256 lookup hashes and AES-256-GCM encryption under the configured secrets.
pub struct PiiProtector {
    hmac_secret: Vec<u8>,
    key: LessSafeKey,
    rng: SystemRandom,
}

impl PiiProtector {
    /// The AES key is the SHA-256 digest of `encryption_key`.
    pub fn new(hmac_secret: &str, encryption_key: &str) -> Result<Self, PiiError> {
        let digest = Sha256::digest(encryption_key.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, &digest).map_err(|_| PiiError::InvalidKey)?;
        Ok(Self {
            hmac_secret: hmac_secret.as_bytes().to_vec(),
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Lowercase hex HMAC-SHA256 of `value`.
    pub fn hash(&self, value: &str) -> Result<String, PiiError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.hmac_secret).map_err(|_| PiiError::InvalidKey)?;
        mac.update(value.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// `base64(nonce || ciphertext || tag)` with a fresh random 96-bit nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, PiiError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| PiiError::Encrypt)?;
        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| PiiError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    #[cfg(test)]
    pub fn decrypt(&self, encoded: &str) -> Result<String, PiiError> {
        let raw = STANDARD.decode(encoded).map_err(|_| PiiError::Decrypt)?;
        if raw.len() < NONCE_LEN {
            return Err(PiiError::Decrypt);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| PiiError::Decrypt)?;
        let mut buf = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| PiiError::Decrypt)?;
        String::from_utf8(plain.to_vec()).map_err(|_| PiiError::Decrypt)
    }

    /// Hash plus ciphertext of `value`.
    pub fn protect(&self, value: &str) -> Result<ProtectedValue, PiiError> {
        Ok(ProtectedValue {
            hash: self.hash(value)?,
            encrypted: self.encrypt(value)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_keeps_digits_only() {
        assert_eq!(normalize_phone("010-12 34-5678"), "01012345678");
        assert_eq!(normalize_phone(""), "");
        assert_eq!(normalize_phone("+82 (10) 1234"), "82101234");
    }

    #[test]
    fn masks_names_by_length() {
        assert_eq!(mask_name("김"), "김");
        assert_eq!(mask_name("박철"), "박*");
        assert_eq!(mask_name("강호동"), "강*동");
        assert_eq!(mask_name("남궁민수"), "남**수");
        assert_eq!(mask_name(""), "");
    }

    #[test]
    fn dob_century_digits() {
        assert_eq!(national_id_to_dob("7104101").as_deref(), Some("19710410"));
        assert_eq!(national_id_to_dob("8503252").as_deref(), Some("19850325"));
        assert_eq!(national_id_to_dob("9001015").as_deref(), Some("19900101"));
        assert_eq!(national_id_to_dob("7512316").as_deref(), Some("19751231"));
        assert_eq!(national_id_to_dob("0501153").as_deref(), Some("20050115"));
        assert_eq!(national_id_to_dob("1003074").as_deref(), Some("20100307"));
        assert_eq!(national_id_to_dob("0807017").as_deref(), Some("20080701"));
        assert_eq!(national_id_to_dob("9912318").as_deref(), Some("20991231"));
        assert_eq!(national_id_to_dob("9912319").as_deref(), Some("18991231"));
        assert_eq!(national_id_to_dob("9912310").as_deref(), Some("18991231"));
    }

    #[test]
    fn dob_rejects_bad_input() {
        assert_eq!(national_id_to_dob(""), None);
        assert_eq!(national_id_to_dob("710410"), None);
        assert_eq!(national_id_to_dob("710410-"), None);
        assert_eq!(national_id_to_dob("71A4101"), None);
    }

    #[test]
    fn hash_is_stable_and_keyed() {
        let a = PiiProtector::new("secret-a", "key").unwrap();
        let b = PiiProtector::new("secret-b", "key").unwrap();
        assert_eq!(a.hash("01012345678").unwrap(), a.hash("01012345678").unwrap());
        assert_ne!(a.hash("01012345678").unwrap(), b.hash("01012345678").unwrap());
        assert_eq!(a.hash("x").unwrap().len(), 64);
    }

    #[test]
    fn encryption_uses_fresh_nonce_and_decrypts() {
        let p = PiiProtector::new("s", "enc-key").unwrap();
        let c1 = p.encrypt("19900101").unwrap();
        let c2 = p.encrypt("19900101").unwrap();
        assert_ne!(c1, c2);
        assert_eq!(p.decrypt(&c1).unwrap(), "19900101");
        assert_eq!(p.decrypt(&c2).unwrap(), "19900101");

        let other = PiiProtector::new("s", "other-key").unwrap();
        assert!(other.decrypt(&c1).is_err());
        assert!(p.decrypt("not base64!").is_err());
    }
}
