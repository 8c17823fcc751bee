use chrono::Utc;
use rand::Rng;

const SUFFIX_LEN: usize = 6;
/// Ambiguous characters (0/O, 1/I/L) are excluded so the code survives being
/// read over the phone.
const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Generates a candidate order number: date-seeded plus a random suffix,
/// e.g. `SO-20260805-7FK3QX`. Collision-resistant, not collision-free:
/// uniqueness is only ever established inside the creation transaction,
/// whose bounded retry loop is this function's sole consumer.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("SO-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}
