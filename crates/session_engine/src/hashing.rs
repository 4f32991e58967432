use sha2::{Digest, Sha256};

use crate::catalog::SceneGroup;

pub(crate) fn hash_scene_groups(groups: &[SceneGroup]) -> String {
    let mut hasher = Sha256::new();
    for group in groups {
        hasher.update(group.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(group.category.label().as_bytes());
        hasher.update([0u8]);
        for content in &group.content {
            hasher.update(content.0.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
    }
    to_hex_lower(&hasher.finalize())
}

fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}
