//! Image save and restore, flatten and unflatten.
//!
//! Both directions share one buffer format: objects laid end to end, every
//! reference field and heap-resident behavior stored as the byte offset of its
//! target in the buffer. The first object sits at offset 0 and is never
//! referenced, so a 0 field reads back as null. An image file is that buffer
//! preceded by its length as a little-endian `u64`.

use std::collections::HashMap;
use std::ptr;

use sys_alloc::{Region, RegionOptions};

use crate::error::ImageError;
use crate::mark::{MarkHandler, MarkReason};
use crate::object::{
    Behavior, BehaviorWord, MarkWord, ObjectRef, MAXIMUM_OBJECT_SIZE, MINIMUM_OBJECT_SIZE,
    OBJECT_GRAIN,
};
use crate::types::{Array, TypeRegistry, ARRAY_TYPE, DEAD_TYPE, WEAK_REFERENCE_TYPE};

/// Bytes taken by the length prefix of an image file.
pub const IMAGE_HEADER_SIZE: usize = 8;

/// Reserves an output buffer of `max` bytes. Only the written prefix is ever
/// touched.
pub(crate) fn reserve_buffer(max: usize) -> std::io::Result<Region> {
    RegionOptions::new().len(max).overcommit(true).reserve()
}

/// Splits an image file into its body, checking the length prefix.
pub(crate) fn image_body(bytes: &[u8], max: usize) -> Result<&[u8], ImageError> {
    let Some((prefix, body)) = bytes.split_first_chunk::<IMAGE_HEADER_SIZE>() else {
        return Err(ImageError::Truncated {
            expected: IMAGE_HEADER_SIZE,
            found: bytes.len(),
        });
    };
    let declared = u64::from_le_bytes(*prefix);
    let Ok(declared) = usize::try_from(declared) else {
        return Err(ImageError::TooLarge { max });
    };
    if declared > max {
        return Err(ImageError::TooLarge { max });
    }
    if body.len() < declared {
        return Err(ImageError::Truncated {
            expected: declared,
            found: body.len(),
        });
    }
    Ok(&body[..declared])
}

// ============================================================================
// ImageWriter
// ============================================================================

/// How the writer remembers which objects it already copied.
pub(crate) enum Visited {
    /// Overwrite each original's behavior word with the offset of its copy.
    /// Leaves the heap unusable afterwards.
    Destructive,
    /// Keep an identity map and leave the originals alone.
    Table(HashMap<ObjectRef, usize>),
}

/// Copies a graph into a buffer, rewriting references to offsets.
pub(crate) struct ImageWriter<'a> {
    buffer: Region,
    max: usize,
    len: usize,
    visited: Visited,
    reason: MarkReason,
    pending: Vec<usize>,
    registry: &'a TypeRegistry,
    objects: usize,
    error: Option<ImageError>,
}

impl<'a> ImageWriter<'a> {
    pub(crate) fn new(
        buffer: Region,
        max: usize,
        visited: Visited,
        reason: MarkReason,
        registry: &'a TypeRegistry,
    ) -> Self {
        debug_assert!(matches!(
            reason,
            MarkReason::SavingImage | MarkReason::Flattening
        ));
        let max = max.min(buffer.len());
        Self {
            buffer,
            max,
            len: 0,
            visited,
            reason,
            pending: Vec::new(),
            registry,
            objects: 0,
            error: None,
        }
    }

    fn base(&self) -> usize {
        self.buffer.ptr() as usize
    }

    fn visited_offset(&self, obj: ObjectRef) -> Option<usize> {
        match &self.visited {
            Visited::Destructive => match unsafe { obj.header() }.behavior() {
                Some(Behavior::SaveOffset(offset)) => Some(offset),
                _ => None,
            },
            Visited::Table(map) => map.get(&obj).copied(),
        }
    }

    /// Copies `obj` if it has not been copied yet and returns its offset.
    fn copy(&mut self, obj: ObjectRef) -> usize {
        if let Some(offset) = self.visited_offset(obj) {
            return offset;
        }
        if self.error.is_some() {
            return 0;
        }

        // SAFETY: `obj` is a reachable heap object.
        let header = unsafe { obj.header() };
        let size = header.size();
        let behavior = header.behavior();
        let has_references = header.has_references();
        if self.len + size > self.max {
            self.error = Some(ImageError::TooLarge { max: self.max });
            return 0;
        }

        let offset = self.len;
        let copy = ObjectRef::from_addr(self.base() + offset);
        unsafe { ptr::copy_nonoverlapping(obj.addr() as *const u8, copy.addr() as *mut u8, size) };
        self.len += size;
        self.objects += 1;

        match &mut self.visited {
            Visited::Destructive => unsafe {
                obj.header_mut()
                    .set_behavior_word(BehaviorWord::encode(Behavior::SaveOffset(offset)));
            },
            Visited::Table(map) => {
                map.insert(obj, offset);
            }
        }

        let copy_header = unsafe { copy.header_mut() };
        copy_header.clear_mark();
        copy_header.clear_old_space();
        match behavior {
            Some(Behavior::Object(behavior_obj)) => {
                let behavior_offset = self.copy(behavior_obj);
                let word = BehaviorWord::encode(Behavior::Object(ObjectRef::from_offset(
                    behavior_offset,
                )));
                unsafe { copy.header_mut() }.set_behavior_word(word);
            }
            Some(Behavior::Primitive(_)) => {}
            Some(Behavior::SaveOffset(_)) | None => {
                self.error = Some(ImageError::corrupt(offset, "object has no valid behavior"));
            }
        }

        if has_references {
            self.pending.push(offset);
        }
        offset
    }

    /// Traces the copies queued so far until none are left.
    pub(crate) fn drain(&mut self) {
        let registry = self.registry;
        while let Some(offset) = self.pending.pop() {
            if self.error.is_some() {
                return;
            }
            let copy = ObjectRef::from_addr(self.base() + offset);
            let type_number = unsafe { copy.header() }.type_number();
            let Some(info) = registry.get(type_number) else {
                self.error = Some(ImageError::UnknownType {
                    offset,
                    type_number,
                });
                return;
            };
            // SAFETY: the copy has the layout of the registered type.
            unsafe { (info.live_general)(copy, self) };
        }
    }

    /// Objects copied so far.
    pub(crate) const fn objects(&self) -> usize {
        self.objects
    }

    /// Ends the pass, returning the buffer and the number of bytes written.
    pub(crate) fn finish(self) -> Result<(Region, usize), ImageError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok((self.buffer, self.len)),
        }
    }
}

impl MarkHandler for ImageWriter<'_> {
    fn reason(&self) -> MarkReason {
        self.reason
    }

    fn mark(&mut self, field: &mut ObjectRef) {
        if field.is_null() {
            return;
        }
        let offset = self.copy(*field);
        *field = ObjectRef::from_offset(offset);
    }
}

// ============================================================================
// Relocation
// ============================================================================

/// Result of relocating a buffer in place.
#[derive(Debug)]
pub(crate) struct Relocated {
    pub(crate) objects: usize,
    /// Weak reference nodes found, to be put on the weak list.
    pub(crate) weak_nodes: Vec<ObjectRef>,
    /// Offset of the last object.
    pub(crate) last: usize,
}

/// Turns offset fields back into addresses.
struct RestoreHandler {
    base: usize,
    starts: Vec<bool>,
    reason: MarkReason,
    error: Option<ImageError>,
    current: usize,
}

impl RestoreHandler {
    fn resolve(&self, offset: usize) -> Option<ObjectRef> {
        if offset % OBJECT_GRAIN != 0 || offset == 0 {
            return None;
        }
        match self.starts.get(offset / OBJECT_GRAIN) {
            Some(true) => Some(ObjectRef::from_addr(self.base + offset)),
            _ => None,
        }
    }
}

impl MarkHandler for RestoreHandler {
    fn reason(&self) -> MarkReason {
        self.reason
    }

    fn mark(&mut self, field: &mut ObjectRef) {
        if field.is_null() {
            return;
        }
        let offset = field.offset();
        if let Some(obj) = self.resolve(offset) {
            *field = obj;
        } else {
            *field = ObjectRef::NULL;
            if self.error.is_none() {
                self.error = Some(ImageError::corrupt(
                    self.current,
                    format!("reference to {offset:#x} is not an object start"),
                ));
            }
        }
    }
}

/// Validates every header in `[base, base + len)` and records object starts.
fn scan_headers(
    base: usize,
    len: usize,
    registry: &TypeRegistry,
) -> Result<(Vec<bool>, usize, usize), ImageError> {
    let mut starts = vec![false; len / OBJECT_GRAIN + 1];
    let mut offset = 0;
    let mut objects = 0;
    let mut last = 0;
    while offset < len {
        let header = unsafe { ObjectRef::from_addr(base + offset).header() };
        let size = header.size();
        if size < MINIMUM_OBJECT_SIZE || size > MAXIMUM_OBJECT_SIZE || size % OBJECT_GRAIN != 0 {
            return Err(ImageError::corrupt(offset, format!("bad object size {size}")));
        }
        if size > len - offset {
            return Err(ImageError::corrupt(offset, "object overruns the buffer"));
        }
        let type_number = header.type_number();
        let info = match registry.get(type_number) {
            Some(info) if type_number != DEAD_TYPE => info,
            _ => {
                return Err(ImageError::UnknownType {
                    offset,
                    type_number,
                })
            }
        };
        if size < info.min_size {
            return Err(ImageError::corrupt(
                offset,
                format!("{} of {size} bytes is smaller than its type's {}", info.name, info.min_size),
            ));
        }
        if type_number == ARRAY_TYPE {
            let slots = unsafe { ObjectRef::from_addr(base + offset).as_ref::<Array>() }.len();
            if Array::size_for(slots).map_or(true, |needed| needed > size) {
                return Err(ImageError::corrupt(offset, format!("array of {slots} slots overruns its object")));
            }
        }
        starts[offset / OBJECT_GRAIN] = true;
        last = offset;
        offset += size;
        objects += 1;
    }
    Ok((starts, objects, last))
}

/// Relocates a buffer already copied to `base`.
///
/// Every object gets its behavior relocated and its mark set for `mark_word`.
/// Restoring also flags objects old space; unflattening leaves them in new
/// space. Each object's `live_general` then fixes its own fields.
pub(crate) fn relocate(
    base: usize,
    len: usize,
    registry: &TypeRegistry,
    mark_word: MarkWord,
    reason: MarkReason,
) -> Result<Relocated, ImageError> {
    debug_assert!(matches!(
        reason,
        MarkReason::RestoringImage | MarkReason::Unflattening
    ));
    if len < MINIMUM_OBJECT_SIZE || len % OBJECT_GRAIN != 0 {
        return Err(ImageError::corrupt(0, format!("bad buffer length {len}")));
    }
    let (starts, objects, last) = scan_headers(base, len, registry)?;
    let mut handler = RestoreHandler {
        base,
        starts,
        reason,
        error: None,
        current: 0,
    };
    let mut weak_nodes = Vec::new();

    let mut offset = 0;
    while offset < len {
        let obj = ObjectRef::from_addr(base + offset);
        let header = unsafe { obj.header_mut() };
        let size = header.size();
        match header.behavior() {
            Some(Behavior::Primitive(_)) => {}
            Some(Behavior::Object(stored)) => {
                let Some(behavior) = handler.resolve(stored.offset()) else {
                    return Err(ImageError::corrupt(offset, "behavior is not an object start"));
                };
                header.set_behavior(Behavior::Object(behavior));
            }
            Some(Behavior::SaveOffset(_)) | None => {
                return Err(ImageError::corrupt(offset, "invalid behavior word"));
            }
        }
        if reason == MarkReason::RestoringImage {
            header.set_old_space();
        } else {
            header.clear_old_space();
        }
        header.set_live(mark_word);

        let type_number = header.type_number();
        if type_number == WEAK_REFERENCE_TYPE {
            weak_nodes.push(obj);
        }
        if header.has_references() {
            handler.current = offset;
            if let Some(info) = registry.get(type_number) {
                // SAFETY: the header was validated against the registry.
                unsafe { (info.live_general)(obj, &mut handler) };
            }
            if let Some(err) = handler.error.take() {
                return Err(err);
            }
        }
        offset += size;
    }

    Ok(Relocated {
        objects,
        weak_nodes,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_body_checks_prefix() {
        assert!(matches!(
            image_body(&[1, 2, 3], 1024),
            Err(ImageError::Truncated { expected: 8, found: 3 })
        ));

        let mut bytes = 64u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 32]);
        assert!(matches!(
            image_body(&bytes, 1024),
            Err(ImageError::Truncated { expected: 64, found: 32 })
        ));
        assert!(matches!(image_body(&bytes, 16), Err(ImageError::TooLarge { max: 16 })));

        bytes.extend_from_slice(&[0; 40]);
        assert_eq!(image_body(&bytes, 1024).unwrap().len(), 64);
    }

    #[test]
    fn test_relocate_rejects_zero_size() {
        let mut buffer = vec![0u128; 4];
        let base = buffer.as_mut_ptr() as usize;
        let err = relocate(
            base,
            64,
            &TypeRegistry::new(),
            MarkWord::INITIAL,
            MarkReason::Unflattening,
        )
        .unwrap_err();
        assert!(matches!(err, ImageError::Corrupt { offset: 0, .. }));
    }

    #[repr(C)]
    struct Triple {
        header: crate::object::ObjectHeader,
        values: [u64; 3],
    }

    unsafe impl crate::types::HeapObject for Triple {
        const NAME: &'static str = "Triple";
        const HAS_REFERENCES: bool = false;

        fn live(&mut self, _marker: &mut crate::mark::Marker<'_>) {}

        fn live_general(&mut self, _handler: &mut dyn MarkHandler) {}
    }

    #[test]
    fn test_relocate_rejects_object_smaller_than_its_type() {
        let mut registry = TypeRegistry::new();
        let triple = registry.register::<Triple>();
        let mut buffer = vec![0u128; 2];
        let base = buffer.as_mut_ptr() as usize;
        unsafe { ObjectRef::from_addr(base).header_mut() }.initialize(
            triple,
            MINIMUM_OBJECT_SIZE,
            false,
            MarkWord::INITIAL,
        );
        let err = relocate(base, 32, &registry, MarkWord::INITIAL, MarkReason::Unflattening)
            .unwrap_err();
        assert!(matches!(err, ImageError::Corrupt { offset: 0, .. }));
    }
}
