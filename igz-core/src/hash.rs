/// 32-bit FNV-1a over the UTF-8 bytes of a name.
///
/// Used for the name list, handle resolution and the trailer's
/// original-name records.
pub fn name_hash(name: &str) -> u32 {
    let mut hash = 0x811C_9DC5u32;
    for &b in name.as_bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(name_hash(""), 0x811C_9DC5);
        assert_eq!(name_hash("a"), 0xE40C_292C);
        assert_ne!(name_hash("root"), name_hash("leaf"));
    }
}
