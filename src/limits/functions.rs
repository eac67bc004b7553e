//! Threshold functions over the current limit.
//!
//! Limit algorithms scale their increase/decrease steps with the size of the
//! current limit, so that large limits move in larger steps than small ones.

use std::sync::OnceLock;

const TABLE_SIZE: usize = 1000;

/// `max(1, log10(n))`.
///
/// Precomputed for `n < 1000`, falling back to [`f64::log10`] above.
pub fn log10_root(n: usize) -> f64 {
    static TABLE: OnceLock<[f64; TABLE_SIZE]> = OnceLock::new();

    let table = TABLE.get_or_init(|| {
        let mut table = [1.0_f64; TABLE_SIZE];
        for (n, entry) in table.iter_mut().enumerate() {
            *entry = (n as f64).log10().max(1.0);
        }
        table
    });

    if n < TABLE_SIZE {
        table[n]
    } else {
        (n as f64).log10()
    }
}

/// `max(1, sqrt(n))`.
///
/// Precomputed for `n < 1000`, falling back to [`f64::sqrt`] above.
pub fn square_root(n: usize) -> f64 {
    static TABLE: OnceLock<[f64; TABLE_SIZE]> = OnceLock::new();

    let table = TABLE.get_or_init(|| {
        let mut table = [1.0_f64; TABLE_SIZE];
        for (n, entry) in table.iter_mut().enumerate() {
            *entry = (n as f64).sqrt().max(1.0);
        }
        table
    });

    if n < TABLE_SIZE {
        table[n]
    } else {
        (n as f64).sqrt()
    }
}
