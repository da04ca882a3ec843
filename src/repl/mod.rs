use rand::{thread_rng, Rng};

pub mod master;
pub mod pubsub;
pub mod replica;

/// A fresh 40-character alphanumeric replication ID, generated once at
/// leader startup.
pub fn generate_repl_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = thread_rng();

    (0..40)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
