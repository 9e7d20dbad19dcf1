use rand::Rng;

use super::origin::strip_port;

const NAME_LENGTH: usize = 10;
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Random lowercase tunnel identifier.
pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..NAME_LENGTH)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Whether `name` can be used as a single lowercase DNS label.
pub fn is_valid(name: &str) -> bool {
    (1..=63).contains(&name.len())
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-')
}

/// Tunnel identifier addressed by a Host header: its first DNS label.
pub fn from_host(host: &str) -> &str {
    let host = strip_port(host);
    host.split('.').next().unwrap_or(host)
}
