//! Manifest model: cluster object descriptions, their YAML encoding, and the
//! structural diff used to decide what changed between two rollouts.

pub mod change;
pub mod codec;
pub mod diff;
pub mod item;

pub use change::{ChangeSet, RemovalEntry};
pub use codec::{decode_all, decode_item, encode_all};
pub use diff::{changed_keys, diff, diff_items};
pub use item::{
    change_key, find, Manifest, ManifestItem, ObjectMeta, KIND_DEPLOYMENT, KIND_HPA,
    KIND_STATEFUL_SET, NAME_LABEL, REAL_NAME_LABEL,
};
