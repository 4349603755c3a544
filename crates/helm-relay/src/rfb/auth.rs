use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};

pub const CHALLENGE_LEN: usize = 16;

/// VNC authentication response: the challenge DES-encrypted with the
/// password as key. Only the first eight password bytes count, and each key
/// byte is bit-mirrored as the protocol requires.
pub fn vnc_auth_response(password: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let cipher = Des::new(&GenericArray::from(vnc_key(password)));
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}

fn vnc_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.as_bytes()) {
        *slot = byte.reverse_bits();
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use des::cipher::BlockDecrypt;

    #[test]
    fn key_bytes_are_mirrored_and_truncated_to_eight() {
        assert_eq!(vnc_key("a"), [0x86, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(vnc_key("123456789"), vnc_key("12345678"));
    }

    #[test]
    fn response_decrypts_back_to_challenge_with_mirrored_key() {
        let challenge: [u8; CHALLENGE_LEN] = *b"0123456789abcdef";
        let response = vnc_auth_response("secret", &challenge);
        assert_ne!(response, challenge);

        let cipher = Des::new(&GenericArray::from(vnc_key("secret")));
        let mut decrypted = response;
        for block in decrypted.chunks_exact_mut(8) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        assert_eq!(decrypted, challenge);
    }

    #[test]
    fn blocks_are_encrypted_independently() {
        let mut challenge = [7u8; CHALLENGE_LEN];
        challenge[8..].copy_from_slice(&[7u8; 8]);
        let response = vnc_auth_response("pw", &challenge);
        assert_eq!(response[..8], response[8..]);
    }
}
