use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Short display fingerprint: hex of the first 8 bytes of sha256(sec1_point).
pub fn fingerprint(sec1_point: &[u8]) -> String {
    hex::encode(&sha256(sec1_point)[..8])
}
