// ============================
// roomchat-backend-lib/src/color.rs
// ============================
//! Display colors derived from usernames.
//!
//! The hash is 64-bit FNV-1a over the UTF-8 bytes of the name, so a name
//! keeps its color across restarts and builds. The low 24 bits become
//! `#RRGGBB`.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const RGB_MASK: u64 = 0x00FF_FFFF;

/// 64-bit FNV-1a
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Color for `name` as uppercase `#RRGGBB`
pub fn color_for(name: &str) -> String {
    format!("#{:06X}", fnv1a_64(name.as_bytes()) & RGB_MASK)
}
