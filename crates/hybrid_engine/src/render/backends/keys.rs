//! Slot-map keys behind the opaque `u64` handles
//!
//! Both backends store their objects in `SlotMap`s and hand out the key's
//! FFI value as the handle, so a destroyed handle never aliases a new object.

use slotmap::{new_key_type, Key, KeyData};

new_key_type! {
    pub(crate) struct BufferKey;
    pub(crate) struct ImageKey;
    pub(crate) struct SamplerKey;
    pub(crate) struct StructureKey;
    pub(crate) struct SetLayoutKey;
    pub(crate) struct SetKey;
    pub(crate) struct RenderPassKey;
    pub(crate) struct FramebufferKey;
    pub(crate) struct PipelineLayoutKey;
    pub(crate) struct PipelineKey;
}

pub(crate) fn to_key<K: From<KeyData>>(id: u64) -> K {
    K::from(KeyData::from_ffi(id))
}

pub(crate) fn to_id<K: Key>(key: K) -> u64 {
    key.data().as_ffi()
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_removed_handle_does_not_alias_new_object() {
        let mut map: SlotMap<BufferKey, u32> = SlotMap::with_key();
        let first = to_id(map.insert(1));
        map.remove(to_key::<BufferKey>(first));
        let second = to_id(map.insert(2));
        assert_ne!(first, second);
        assert!(map.get(to_key::<BufferKey>(first)).is_none());
    }
}
