pub mod secret;

pub use secret::{derive_key_material, Expiration, Secret};
