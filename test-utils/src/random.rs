//! Random test data generators.

use std::iter;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Generate a random alphanumeric string of the given size using the default `ThreadRng`.
pub fn string(len: usize) -> String {
    let mut rng = thread_rng();
    iter::repeat(()).map(|_| rng.sample(Alphanumeric) as char).take(len).collect()
}

/// Generate a random alphanumeric string of the given size with a fixed prefix.
pub fn prefixed_string(prefix: &str, len: usize) -> String {
    let rand_str = string(len);
    format!("{prefix}{rand_str}")
}

/// A pseudo-random payload of `len` bytes, useful for exercising Medium/Long
/// AM transfers without caring about the exact content.
pub fn bytes(len: usize) -> Vec<u8> {
    let mut rng = thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

#[cfg(test)]
mod tests {
    #[test]
    fn string_has_the_requested_length_and_varies() {
        let sample = super::string(8);
        assert_ne!(sample, super::string(8));
        assert_eq!(sample.len(), 8);
    }

    #[test]
    fn prefixed_string_keeps_the_prefix() {
        let sample = super::prefixed_string("node-", 4);
        assert!(sample.starts_with("node-"));
        assert_eq!(sample.len(), "node-".len() + 4);
    }
}
