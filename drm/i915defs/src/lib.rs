// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structures and constants from the Linux i915 DRM uAPI (`i915_drm.h`)
//! needed to enumerate hardware execution engines and per-context engine
//! maps.
//!
//! Only the subset used for engine topology discovery is defined here. All
//! structures are exchanged with the kernel by pointer through ioctls, so
//! layouts must match the C ABI exactly; sizes are checked below.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Upper bound on engines in a query or context map supported by this
/// library.
///
/// The kernel does not bound engine counts in the ABI; this limit exists so
/// that query and map buffers can be fixed-size, and matches the most rings
/// addressable through the execbuffer interface. Hardware exceeding it means
/// the library is out of date for the device.
pub const MAX_ENGINES: usize = 64;

/// Hardware execution engine class (`enum drm_i915_gem_engine_class`).
///
/// An open enum: the kernel may report classes newer than this library, so
/// any `u16` is representable.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EngineClass(pub u16);

impl EngineClass {
    /// 3D rendering and (on older parts) compute.
    pub const RENDER: Self = Self(0);
    /// Copy (blitter) engine.
    pub const COPY: Self = Self(1);
    /// Video decode/encode engine.
    pub const VIDEO: Self = Self(2);
    /// Video enhancement engine.
    pub const VIDEO_ENHANCE: Self = Self(3);
    /// Sentinel used together with an invalid-instance marker, e.g. for
    /// load-balanced virtual engines. `I915_ENGINE_CLASS_INVALID`.
    pub const INVALID: Self = Self(0xffff);
}

impl fmt::Debug for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RENDER => f.write_str("RENDER"),
            Self::COPY => f.write_str("COPY"),
            Self::VIDEO => f.write_str("VIDEO"),
            Self::VIDEO_ENHANCE => f.write_str("VIDEO_ENHANCE"),
            Self::INVALID => f.write_str("INVALID"),
            Self(n) => write!(f, "EngineClass({n})"),
        }
    }
}

/// Instance marker for "no engine" (`I915_ENGINE_CLASS_INVALID_NONE`).
pub const ENGINE_INSTANCE_INVALID_NONE: u16 = 0xffff;

/// Instance marker for a load-balanced virtual engine
/// (`I915_ENGINE_CLASS_INVALID_VIRTUAL`).
pub const ENGINE_INSTANCE_INVALID_VIRTUAL: u16 = 0xfffe;

/// An engine identity: class plus ordinal within the class
/// (`struct i915_engine_class_instance`).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EngineClassInstance {
    /// Engine class, an [`EngineClass`] value.
    pub engine_class: EngineClass,
    /// Ordinal of the engine within its class.
    pub engine_instance: u16,
}

impl EngineClassInstance {
    /// True for the (invalid, invalid-virtual) pair the kernel reports for
    /// load-balanced virtual engine slots.
    pub fn is_virtual(&self) -> bool {
        self.engine_class == EngineClass::INVALID
            && self.engine_instance == ENGINE_INSTANCE_INVALID_VIRTUAL
    }
}

/// `DRM_I915_QUERY_ENGINE_INFO` query id.
pub const QUERY_ENGINE_INFO: u64 = 2;

/// One item of a `DRM_IOCTL_I915_QUERY` request
/// (`struct drm_i915_query_item`).
///
/// On return the kernel overwrites `length` with the number of bytes written,
/// or with a negative errno if this particular item failed.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryItem {
    /// Which query to run, e.g. [`QUERY_ENGINE_INFO`].
    pub query_id: u64,
    /// In: capacity of the buffer at `data_ptr` (0 to size the buffer).
    /// Out: bytes written, or a negative errno.
    pub length: i32,
    /// Per-query flags, must be zero for the engine info query.
    pub flags: u32,
    /// Userspace address of the result buffer.
    pub data_ptr: u64,
}

/// Top-level `DRM_IOCTL_I915_QUERY` argument (`struct drm_i915_query`).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Query {
    /// Number of [`QueryItem`]s at `items_ptr`.
    pub num_items: u32,
    /// Unused, must be zero.
    pub flags: u32,
    /// Userspace address of the item array.
    pub items_ptr: u64,
}

/// Description of one engine returned by the engine info query
/// (`struct drm_i915_engine_info`).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EngineInfo {
    /// The engine's identity.
    pub engine: EngineClassInstance,
    /// Reserved.
    pub rsvd0: u32,
    /// `I915_ENGINE_INFO_*` validity flags.
    pub flags: u64,
    /// `I915_*_CLASS_CAPABILITY_*` capability bits.
    pub capabilities: u64,
    /// Reserved.
    pub rsvd1: [u64; 4],
}

/// Fixed-capacity result buffer for the engine info query
/// (`struct drm_i915_query_engine_info` with its tail array sized to
/// [`MAX_ENGINES`]).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryEngineInfo {
    /// Number of valid entries in `engines`.
    pub num_engines: u32,
    /// Reserved.
    pub rsvd: [u32; 3],
    /// The engines, in kernel-reported order.
    pub engines: [EngineInfo; MAX_ENGINES],
}

/// `I915_CONTEXT_PARAM_ENGINES` context parameter id.
pub const CONTEXT_PARAM_ENGINES: u64 = 0xa;

/// `DRM_IOCTL_I915_GEM_CONTEXT_{GET,SET}PARAM` argument
/// (`struct drm_i915_gem_context_param`).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GemContextParam {
    /// The context to operate on.
    pub ctx_id: u32,
    /// Size in bytes of the buffer at `value` for pointer-valued parameters.
    /// The kernel updates it on getparam; zero means the parameter is unset.
    pub size: u32,
    /// Parameter id, e.g. [`CONTEXT_PARAM_ENGINES`].
    pub param: u64,
    /// Parameter value, or userspace address of the parameter buffer.
    pub value: u64,
}

/// Fixed-capacity per-context engine map
/// (`struct i915_context_param_engines` with its tail array sized to
/// [`MAX_ENGINES`]).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ContextParamEngines {
    /// Chain of `i915_context_engines_*` extensions; zero for none.
    pub extensions: u64,
    /// Logical slot to engine bindings.
    pub engines: [EngineClassInstance; MAX_ENGINES],
}

/// Byte size of a [`ContextParamEngines`] holding `n` engines, i.e. the
/// offset of tail-array element `n`. This is what goes in
/// [`GemContextParam::size`].
pub const fn context_param_engines_size(n: usize) -> u32 {
    (size_of::<u64>() + n * size_of::<EngineClassInstance>()) as u32
}

/// Inverse of [`context_param_engines_size`]: the engine count encoded by a
/// getparam-reported byte size.
pub const fn engine_count_from_size(size: u32) -> usize {
    (size as usize - size_of::<u64>()) / size_of::<EngineClassInstance>()
}

/// `DRM_IOCTL_I915_GEM_EXECBUFFER2` argument
/// (`struct drm_i915_gem_execbuffer2`).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[expect(missing_docs)] // matches the C structure field for field
pub struct GemExecbuffer2 {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

/// One execbuffer object slot (`struct drm_i915_gem_exec_object2`).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[expect(missing_docs)] // matches the C structure field for field
pub struct GemExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

/// Ring selector bits of [`GemExecbuffer2::flags`] (`I915_EXEC_RING_MASK`).
pub const EXEC_RING_MASK: u64 = 0x3f;
/// Submit to the context's default engine (`I915_EXEC_DEFAULT`).
pub const EXEC_DEFAULT: u64 = 0;
/// Submit to the render ring (`I915_EXEC_RENDER`).
pub const EXEC_RENDER: u64 = 1;
/// Submit to a video (BSD) ring (`I915_EXEC_BSD`).
pub const EXEC_BSD: u64 = 2;
/// Submit to the blitter ring (`I915_EXEC_BLT`).
pub const EXEC_BLT: u64 = 3;
/// Submit to the video enhancement ring (`I915_EXEC_VEBOX`).
pub const EXEC_VEBOX: u64 = 4;

/// Mask of the explicit BSD ring selector (`I915_EXEC_BSD_MASK`).
pub const EXEC_BSD_MASK: u64 = 3 << 13;
/// Select the first BSD ring explicitly (`I915_EXEC_BSD_RING1`).
pub const EXEC_BSD_RING1: u64 = 1 << 13;
/// Select the second BSD ring explicitly (`I915_EXEC_BSD_RING2`).
pub const EXEC_BSD_RING2: u64 = 2 << 13;

/// `I915_PARAM_HAS_BSD2` getparam id.
pub const PARAM_HAS_BSD2: i32 = 31;

/// `DRM_IOCTL_I915_GETPARAM` argument (`drm_i915_getparam_t`).
///
/// Carries a real pointer rather than a `u64`, matching the C definition.
#[repr(C)]
#[derive(Debug)]
pub struct GetParam {
    /// Parameter id, e.g. [`PARAM_HAS_BSD2`].
    pub param: i32,
    /// Where the kernel writes the value.
    pub value: *mut i32,
}

// Layout checks against the C ABI. The tail-array buffers must equal
// offsetof(engines[MAX_ENGINES]) of their unsized C counterparts.
static_assertions::const_assert_eq!(size_of::<EngineClassInstance>(), 4);
static_assertions::const_assert_eq!(size_of::<QueryItem>(), 24);
static_assertions::const_assert_eq!(size_of::<Query>(), 16);
static_assertions::const_assert_eq!(size_of::<EngineInfo>(), 56);
static_assertions::const_assert_eq!(size_of::<QueryEngineInfo>(), 16 + MAX_ENGINES * 56);
static_assertions::const_assert_eq!(size_of::<GemContextParam>(), 24);
static_assertions::const_assert_eq!(size_of::<ContextParamEngines>(), 8 + MAX_ENGINES * 4);
static_assertions::const_assert_eq!(size_of::<GemExecbuffer2>(), 64);
static_assertions::const_assert_eq!(size_of::<GemExecObject2>(), 56);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_map_size_arithmetic() {
        assert_eq!(context_param_engines_size(0), 8);
        assert_eq!(context_param_engines_size(2), 16);
        assert_eq!(
            context_param_engines_size(MAX_ENGINES) as usize,
            size_of::<ContextParamEngines>()
        );
        for n in [0, 1, 5, MAX_ENGINES] {
            assert_eq!(engine_count_from_size(context_param_engines_size(n)), n);
        }
    }

    #[test]
    fn virtual_engine_marker() {
        let virt = EngineClassInstance {
            engine_class: EngineClass::INVALID,
            engine_instance: ENGINE_INSTANCE_INVALID_VIRTUAL,
        };
        assert!(virt.is_virtual());
        let rcs0 = EngineClassInstance {
            engine_class: EngineClass::RENDER,
            engine_instance: 0,
        };
        assert!(!rcs0.is_virtual());
    }
}
