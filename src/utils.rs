use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Salted hash of an identifier for log output.
///
/// Raw user/device identifiers never reach logs unless explicitly enabled;
/// the truncated hash is stable enough to correlate events within one
/// deployment.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

/// Stable partition index for a conversation.
///
/// SHA-256 keeps the distribution even regardless of how conversation ids
/// are generated; the partition count is fixed for the process lifetime.
pub fn partition_for(conversation_id: &Uuid, partition_count: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partition_count as u64) as usize
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len * 2);
    for byte in bytes.iter().take(len) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
