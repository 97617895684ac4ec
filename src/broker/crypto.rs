use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Decrypts a Base64 AES-CBC execution-notice payload with the key/iv
/// negotiated during the stream handshake. The cipher width follows the key
/// length the server handed out (16 bytes -> AES-128, 32 -> AES-256).
pub fn aes_cbc_base64_decrypt(key: &str, iv: &str, payload: &str) -> Option<String> {
    let ciphertext = BASE64.decode(payload.trim()).ok()?;
    let key = key.as_bytes();
    let iv = iv.as_bytes();

    let plain = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .ok()?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .ok()?,
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .ok()?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .ok()?,
        _ => return None,
    };

    String::from_utf8(plain).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    fn encrypt(key: &str, iv: &str, plain: &str) -> String {
        let ct = Aes128CbcEnc::new_from_slices(key.as_bytes(), iv.as_bytes())
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        BASE64.encode(ct)
    }

    #[test]
    fn round_trips_with_negotiated_key() {
        let key = "0123456789abcdef";
        let iv = "fedcba9876543210";
        let notice = "000050^093015^0001234567^00^02^0^0^0^005930^10^70100^093015^0^2";
        let payload = encrypt(key, iv, notice);
        assert_eq!(aes_cbc_base64_decrypt(key, iv, &payload).as_deref(), Some(notice));
    }

    #[test]
    fn garbage_inputs_are_dropped_not_panicked() {
        assert!(aes_cbc_base64_decrypt("short", "fedcba9876543210", "AAAA").is_none());
        assert!(aes_cbc_base64_decrypt("0123456789abcdef", "fedcba9876543210", "not-base64!!").is_none());
        assert!(aes_cbc_base64_decrypt("0123456789abcdef", "fedcba9876543210", "AAAA").is_none());
    }
}
