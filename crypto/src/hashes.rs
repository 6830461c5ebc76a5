use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Number of leading `0` characters in the lowercase hex rendering of `digest`.
pub fn leading_zero_nibbles(digest: &[u8]) -> u32 {
    let mut count = 0u32;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

/// Short, non-reversible fingerprint for log lines.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(&sha256(data)[..6])
}
