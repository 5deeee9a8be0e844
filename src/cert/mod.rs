//! Certificate authority, leaf signing, and the on-disk store

mod authority;
mod store;

pub use authority::{
    remaining_validity, CaMaterial, LeafMaterial, CA_LIFETIME, CA_ROTATE_REMAINING, LEAF_LIFETIME,
    LEAF_ROTATE_REMAINING,
};
pub use store::{
    cache_key, storage_dir_name, CertStore, CertStoreMetrics, CA_CERT_FILE, CA_PRIVATE_FILE,
    CA_PUBLIC_FILE, LEAF_CERT_FILE, LEAF_PRIVATE_FILE, LEAF_PUBLIC_FILE,
};
