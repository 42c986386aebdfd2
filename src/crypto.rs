use crate::error::DecryptError;

/// 解密 AES-128-CBC 分段
pub fn decrypt_data(
    encrypted_data: &[u8],
    key: &[u8],
    iv: &[u8; 16],
) -> Result<Vec<u8>, DecryptError> {
    use aes::cipher::block_padding::Pkcs7;
    use aes::cipher::{BlockDecryptMut, KeyIvInit};
    use cbc::Decryptor;

    if key.len() != 16 {
        return Err(DecryptError::KeyLength(key.len()));
    }

    let cipher = Decryptor::<aes::Aes128>::new(key.into(), iv.as_slice().into());
    let mut buf = encrypted_data.to_vec();
    let decrypted_slice = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| DecryptError::Padding(e.to_string()))?;

    Ok(decrypted_slice.to_vec())
}

/// 计算分段 IV：优先使用显式 IV，否则以媒体序列号作为 128 位大端整数
pub fn segment_iv(explicit: Option<&str>, sequence: u64) -> Result<[u8; 16], DecryptError> {
    let mut iv = [0u8; 16];
    match explicit {
        Some(hex_iv) => {
            let digits = hex_iv
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            let padded = format!("{:0>32}", digits);
            if padded.len() > 32 {
                return Err(DecryptError::Iv(hex_iv.to_string()));
            }
            hex::decode_to_slice(&padded, &mut iv)
                .map_err(|e| DecryptError::Iv(format!("{} ({})", hex_iv, e)))?;
        }
        None => iv[8..].copy_from_slice(&sequence.to_be_bytes()),
    }
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::block_padding::Pkcs7;
    use aes::cipher::{BlockEncryptMut, KeyIvInit};

    fn encrypt(plain: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let mut buf = vec![0u8; plain.len() + 16];
        buf[..plain.len()].copy_from_slice(plain);
        cbc::Encryptor::<aes::Aes128>::new(key.as_slice().into(), iv.as_slice().into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_decrypt_roundtrip() {
        let key = [7u8; 16];
        let iv = segment_iv(None, 3).unwrap();
        let cipher = encrypt(b"transport stream bytes", &key, &iv);
        let plain = decrypt_data(&cipher, &key, &iv).unwrap();
        assert_eq!(plain, b"transport stream bytes");
    }

    #[test]
    fn test_iv_from_sequence() {
        let iv = segment_iv(None, 0x0102).unwrap();
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    #[test]
    fn test_explicit_short_iv_is_left_padded() {
        let iv = segment_iv(Some("0x0A0B"), 99).unwrap();
        assert_eq!(iv[15], 0x0B);
        assert_eq!(iv[14], 0x0A);
        assert!(segment_iv(Some("0xZZ"), 0).is_err());
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(matches!(
            decrypt_data(&[0u8; 16], &[1u8; 8], &[0u8; 16]),
            Err(DecryptError::KeyLength(8))
        ));
    }
}
