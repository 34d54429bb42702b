//! Random identifier generation.

use rand::Rng;

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `prefix` followed by `len` random lowercase alphanumerics.
pub(crate) fn prefixed_id(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..len)
        .map(|_| LOWER_ALNUM[rng.gen_range(0..LOWER_ALNUM.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_id_shape() {
        let id = prefixed_id("sch_", 6);
        assert_eq!(id.len(), 10);
        assert!(id.starts_with("sch_"));
        assert!(id[4..].chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
