// src/keys.rs
//! Cache key types: the content-addressed [`OpKey`] and the cross-recompilation
//! [`PersistentKey`].

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

/// Pixel layout of a cached buffer. Determines the per-pixel channel count used to
/// size allocations and byte budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelType {
    /// Single-channel scalar buffer.
    Value = 0,
    /// Three-channel vector buffer.
    Vector = 1,
    /// Four-channel color buffer.
    Color = 2,
}

impl PixelType {
    /// Channels per pixel for this layout.
    #[inline]
    pub const fn channels(self) -> u32 {
        match self {
            PixelType::Value => 1,
            PixelType::Vector => 3,
            PixelType::Color => 4,
        }
    }
}

/// Content-addressed identity of a cached operation output.
///
/// Two keys are equal only if every field matches, but [`Hash`] is derived from
/// `content_hash` alone: it is already a well-distributed 64-bit digest of the
/// operation's type and inputs, so hashing the remaining geometry fields would only
/// waste cycles without meaningfully reducing collisions.
#[derive(Clone, Copy, Debug)]
pub struct OpKey {
    /// Stable hash of the operation's type (distinguishes e.g. blur from glow).
    pub op_type_hash: u64,
    /// Hash of the operation's content: its parameters plus the content hashes of
    /// its inputs, recursively.
    pub content_hash: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
}

impl OpKey {
    #[inline]
    pub fn new(
        op_type_hash: u64,
        content_hash: u64,
        width: u32,
        height: u32,
        pixel_type: PixelType,
    ) -> Self {
        Self {
            op_type_hash,
            content_hash,
            width,
            height,
            pixel_type,
        }
    }

    /// Total bytes of the buffer this key addresses, assuming 4-byte floats.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.pixel_type.channels() as u64 * 4
    }
}

impl PartialEq for OpKey {
    fn eq(&self, other: &Self) -> bool {
        self.op_type_hash == other.op_type_hash
            && self.content_hash == other.content_hash
            && self.width == other.width
            && self.height == other.height
            && self.pixel_type == other.pixel_type
    }
}

impl Eq for OpKey {}

impl Hash for OpKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_hash.hash(state);
    }
}

/// Ordered for use as the tie-break in a `BTreeSet<(u64, OpKey)>` recency index;
/// the ordering itself carries no semantic meaning beyond giving equal-timestamp
/// entries a deterministic position.
impl PartialOrd for OpKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.op_type_hash, self.content_hash, self.width, self.height, self.pixel_type as u8).cmp(
            &(
                other.op_type_hash,
                other.content_hash,
                other.width,
                other.height,
                other.pixel_type as u8,
            ),
        )
    }
}

/// Identity stable across graph recompilation: keyed by the node's position in the
/// graph rather than the content hash of its inputs, so a cache entry can be reused
/// for a node whose upstream operations were rebuilt but whose output didn't change
/// kind or size. The `hash` field is a precomputed 64-bit digest of the other
/// fields, used only for [`Hash`]; equality compares the fields it was built from,
/// not the digest itself, the same way two keys built from equal inputs are equal
/// even if one arrived with a stale precomputed digest.
#[derive(Clone, Copy, Debug)]
pub struct PersistentKey {
    pub frame_number: i32,
    pub node_identity: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub hash: u64,
}

impl PersistentKey {
    pub fn new(frame_number: i32, node_identity: u64, width: u32, height: u32, pixel_type: PixelType) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(&frame_number.to_le_bytes());
        hasher.update(&node_identity.to_le_bytes());
        hasher.update(&width.to_le_bytes());
        hasher.update(&height.to_le_bytes());
        hasher.update(&[pixel_type as u8]);
        let hash = hasher.digest();
        Self {
            frame_number,
            node_identity,
            width,
            height,
            pixel_type,
            hash,
        }
    }
}

impl PartialEq for PersistentKey {
    fn eq(&self, other: &Self) -> bool {
        self.frame_number == other.frame_number
            && self.node_identity == other.node_identity
            && self.width == other.width
            && self.height == other.height
            && self.pixel_type == other.pixel_type
    }
}

impl Eq for PersistentKey {}

impl Hash for PersistentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(content_hash: u64) -> OpKey {
        OpKey::new(1, content_hash, 64, 64, PixelType::Color)
    }

    #[test]
    fn equality_is_componentwise() {
        let a = OpKey::new(1, 99, 64, 64, PixelType::Color);
        let b = OpKey::new(1, 99, 32, 64, PixelType::Color);
        assert_ne!(a, b, "differing width must not be equal even with matching content_hash");
    }

    #[test]
    fn hash_depends_only_on_content_hash() {
        use std::collections::hash_map::DefaultHasher;
        let a = OpKey::new(1, 99, 64, 64, PixelType::Color);
        let b = OpKey::new(2, 99, 32, 32, PixelType::Value);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn total_bytes_scales_with_channels() {
        assert_eq!(key(1).total_bytes(), 64 * 64 * 4 * 4);
        let value_key = OpKey::new(1, 1, 64, 64, PixelType::Value);
        assert_eq!(value_key.total_bytes(), 64 * 64 * 1 * 4);
    }

    #[test]
    fn persistent_key_equality_ignores_precomputed_hash() {
        let a = PersistentKey::new(10, 5, 64, 64, PixelType::Value);
        let mut b = a;
        b.hash = a.hash.wrapping_add(1);
        assert_eq!(a, b);
    }
}
