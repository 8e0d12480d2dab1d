// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Discovery and enumeration of the hardware execution engines an i915 GPU
//! exposes, and of the engine maps bound to GEM contexts.
//!
//! The kernel reports engines through the versioned
//! `DRM_I915_QUERY_ENGINE_INFO` query and binds a logical slot order per
//! context through `I915_CONTEXT_PARAM_ENGINES`. Older kernels support
//! neither; for those, discovery falls back to a static table of the legacy
//! engines, filtered to the rings the device actually has.
//!
//! Discovery goes through the [`DrmDriver`] trait so it can run against a
//! real DRM device node ([`ioctl::DrmDevice`]) or an in-process fake in
//! tests. A resulting [`EngineSet`] is a plain owned value; it is populated
//! once and only its iteration cursor mutates afterward.

#![warn(missing_docs)]
// UNSAFETY: needed for the raw DRM ioctl calls in the Linux backend.
#![cfg_attr(target_os = "linux", expect(unsafe_code))]

pub mod legacy;

#[cfg(target_os = "linux")]
pub mod ioctl;

pub use i915defs::EngineClass;
pub use i915defs::EngineClassInstance;
pub use i915defs::MAX_ENGINES;

use i915defs::ENGINE_INSTANCE_INVALID_VIRTUAL;
use thiserror::Error;

/// Sentinel for [`EngineDescriptor::flags`] of an engine whose class this
/// library does not recognize.
pub const INVALID_FLAGS: u64 = u64::MAX;

/// A discovered hardware execution engine.
///
/// Identity is `(class, instance)`; `name` and `flags` are derived
/// conveniences. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDescriptor {
    /// Engine class.
    pub class: EngineClass,
    /// Ordinal within the class.
    pub instance: u16,
    /// Short name, class mnemonic plus instance (`rcs0`, `vcs1`, ...).
    pub name: String,
    /// Execbuffer selector for this engine: the context map slot index when
    /// discovered from a context, or legacy `EXEC_*` ring bits from the
    /// static table. [`INVALID_FLAGS`] for unrecognized classes.
    pub flags: u64,
    /// Whether this is a load-balanced virtual engine rather than a
    /// physical one.
    pub is_virtual: bool,
}

impl EngineDescriptor {
    /// Builds a descriptor for the engine at a context map slot, deriving
    /// its name.
    ///
    /// The reserved (invalid, invalid-virtual) identity names itself
    /// `virtual` and ignores `flags` (a virtual engine has no selector of
    /// its own); an unrecognized class yields `unknown{class}-{instance}`
    /// and [`INVALID_FLAGS`].
    pub fn new(class: EngineClass, instance: u16, flags: u64) -> Self {
        if class == EngineClass::INVALID && instance == ENGINE_INSTANCE_INVALID_VIRTUAL {
            return Self {
                class,
                instance,
                name: "virtual".to_string(),
                flags: 0,
                is_virtual: true,
            };
        }

        match legacy::class_name(class) {
            Some(mnemonic) => Self {
                class,
                instance,
                name: format!("{mnemonic}{instance}"),
                flags,
                is_virtual: false,
            },
            None => {
                tracing::warn!(
                    class = class.0,
                    instance,
                    "found engine of unknown class"
                );
                Self {
                    class,
                    instance,
                    name: format!("unknown{}-{}", class.0, instance),
                    flags: INVALID_FLAGS,
                    is_virtual: false,
                }
            }
        }
    }

    /// The engine's wire identity.
    pub fn class_instance(&self) -> EngineClassInstance {
        EngineClassInstance {
            engine_class: self.class,
            engine_instance: self.instance,
        }
    }

    /// Whether two descriptors name the same hardware engine. Only the
    /// `(class, instance)` identity is compared.
    pub fn same_engine(&self, other: &EngineDescriptor) -> bool {
        self.class == other.class && self.instance == other.instance
    }
}

/// The engine map bound to a GEM context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEngineMap {
    /// The context uses the kernel's default map; no explicit slot order is
    /// configured.
    Default,
    /// An explicit map: slot `i` is bound to `engines[i]`.
    Map(Vec<EngineClassInstance>),
}

/// An error from a [`DrmDriver`] backend.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The kernel does not support per-context engine maps. This is an
    /// expected condition on old kernels, classified permanently for the
    /// life of the device; discovery handles it by falling back to the
    /// static engine table.
    #[error("per-context engine maps not supported by the kernel")]
    EngineMapUnsupported,
    /// The engine info query failed.
    #[error("DRM_I915_QUERY(ENGINE_INFO) failed")]
    QueryEngineInfo(#[source] std::io::Error),
    /// Writing a context engine map failed.
    #[error("I915_GEM_CONTEXT_SETPARAM(ENGINES) failed")]
    SetEngineMap(#[source] std::io::Error),
}

/// Driver calls needed for engine discovery.
///
/// Implemented for real device nodes by [`ioctl::DrmDevice`]. Every method
/// is one synchronous round-trip; implementations must not cache or retry.
pub trait DrmDriver {
    /// Reads the engine map of `ctx_id`.
    ///
    /// Any getparam failure is reported as
    /// [`DriverError::EngineMapUnsupported`]: the kernel either predates
    /// engine maps or rejected the parameter, and both mean no map can be
    /// read now or later.
    fn context_engine_map(&self, ctx_id: u32) -> Result<ContextEngineMap, DriverError>;

    /// Binds `engines` as the explicit engine map of `ctx_id`, slot `i` to
    /// `engines[i]`.
    fn set_context_engine_map(
        &self,
        ctx_id: u32,
        engines: &[EngineClassInstance],
    ) -> Result<(), DriverError>;

    /// Runs the engine info query, returning the device's engines in
    /// kernel-reported order.
    fn query_engines(&self) -> Result<Vec<EngineClassInstance>, DriverError>;

    /// Probes whether the device has a ring selectable by the legacy
    /// execbuffer `flags`.
    fn has_ring(&self, flags: u64) -> bool;
}

/// The engines discovered on a device, with a cursor for iteration.
#[derive(Debug, Clone)]
pub struct EngineSet {
    engines: Vec<EngineDescriptor>,
    cursor: usize,
}

impl EngineSet {
    fn new(engines: Vec<EngineDescriptor>) -> Self {
        assert!(
            engines.len() <= MAX_ENGINES,
            "unsupported engine count {} (max {MAX_ENGINES})",
            engines.len()
        );
        Self { engines, cursor: 0 }
    }

    fn from_slots(slots: &[EngineClassInstance]) -> Self {
        Self::new(
            slots
                .iter()
                .enumerate()
                .map(|(i, e)| EngineDescriptor::new(e.engine_class, e.engine_instance, i as u64))
                .collect(),
        )
    }

    /// Discovers the engines available to context `ctx_id`.
    ///
    /// If the context already has an explicit engine map, descriptors are
    /// built from it, in slot order. If it uses the default map, the device
    /// is queried for its engines and the resulting slot order is written
    /// back to the context. If the kernel supports no engine maps at all,
    /// the static legacy table provides the set, filtered to rings the
    /// device reports present.
    ///
    /// Panics if the kernel reports more than [`MAX_ENGINES`] engines; that
    /// is a library/driver mismatch, not a runtime condition.
    pub fn from_context(driver: &impl DrmDriver, ctx_id: u32) -> Result<Self, DriverError> {
        let map = match driver.context_engine_map(ctx_id) {
            Ok(map) => map,
            Err(DriverError::EngineMapUnsupported) => {
                tracing::debug!(ctx_id, "no engine map support, using static engine list");
                return Ok(Self::new(
                    legacy::ENGINES
                        .iter()
                        .filter(|e| driver.has_ring(e.flags))
                        .map(EngineDescriptor::from)
                        .collect(),
                ));
            }
            Err(err) => return Err(err),
        };

        match map {
            ContextEngineMap::Default => {
                let found = driver.query_engines()?;
                let set = Self::from_slots(&found);
                driver.set_context_engine_map(ctx_id, &found)?;
                Ok(set)
            }
            ContextEngineMap::Map(slots) => Ok(Self::from_slots(&slots)),
        }
    }

    /// Discovers the engines of the device itself, via its default context.
    pub fn from_device(driver: &impl DrmDriver) -> Result<Self, DriverError> {
        Self::from_context(driver, 0)
    }

    /// The descriptor under the cursor, or `None` once the cursor has
    /// passed the last engine (immediately, for an empty set).
    pub fn current(&self) -> Option<&EngineDescriptor> {
        self.engines.get(self.cursor)
    }

    /// Advances the cursor. Past the end this is a no-op; [`Self::current`]
    /// stays `None` indefinitely.
    pub fn advance(&mut self) {
        if self.cursor < self.engines.len() {
            self.cursor += 1;
        }
    }

    /// The next physical engine at or after the cursor, advancing past any
    /// virtual engines. `None` once only virtual engines (or nothing)
    /// remain.
    pub fn current_physical(&mut self) -> Option<&EngineDescriptor> {
        while self.current().is_some_and(|e| e.is_virtual) {
            self.advance();
        }
        self.current()
    }

    /// Number of discovered engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether no engines were discovered.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// The descriptor at `index`, independent of the cursor.
    pub fn get(&self, index: usize) -> Option<&EngineDescriptor> {
        self.engines.get(index)
    }

    /// Iterates all engines without touching the cursor.
    pub fn iter(&self) -> std::slice::Iter<'_, EngineDescriptor> {
        self.engines.iter()
    }

    /// Iterates physical engines only, without touching the cursor.
    pub fn physical(&self) -> impl Iterator<Item = &EngineDescriptor> {
        self.engines.iter().filter(|e| !e.is_virtual)
    }
}

impl<'a> IntoIterator for &'a EngineSet {
    type Item = &'a EngineDescriptor;
    type IntoIter = std::slice::Iter<'a, EngineDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.engines.iter()
    }
}

/// An error from [`lookup_context_engine`].
#[derive(Debug, Error)]
pub enum LookupError {
    /// The kernel does not support per-context engine maps.
    #[error("per-context engine maps not supported by the kernel")]
    Unsupported,
    /// The context has no explicit engine map to index into.
    #[error("context uses the default engine map")]
    DefaultEngineMap,
    /// The slot index is beyond the context's configured map.
    #[error("engine slot {slot} out of range for a map of {len} engines")]
    SlotOutOfRange {
        /// The requested slot.
        slot: u64,
        /// The map's engine count.
        len: usize,
    },
    /// The backend failed in some other way.
    #[error("engine map read failed")]
    Driver(#[source] DriverError),
}

/// Looks up the engine bound to logical `slot` in the engine map of
/// `ctx_id`.
///
/// A point lookup: one getparam round-trip per call. Map support is
/// re-probed on each call rather than cached; callers doing many lookups
/// should cache [`has_engine_topology`] themselves.
pub fn lookup_context_engine(
    driver: &impl DrmDriver,
    ctx_id: u32,
    slot: u64,
) -> Result<EngineClassInstance, LookupError> {
    let map = driver.context_engine_map(ctx_id).map_err(|err| match err {
        DriverError::EngineMapUnsupported => LookupError::Unsupported,
        other => LookupError::Driver(other),
    })?;
    match map {
        ContextEngineMap::Default => Err(LookupError::DefaultEngineMap),
        ContextEngineMap::Map(engines) => {
            let len = engines.len();
            engines
                .get(usize::try_from(slot).unwrap_or(usize::MAX))
                .copied()
                .ok_or(LookupError::SlotOutOfRange { slot, len })
        }
    }
}

/// Whether the kernel understands per-context engine maps at all, probed
/// via the default context.
pub fn has_engine_topology(driver: &impl DrmDriver) -> bool {
    driver.context_engine_map(0).is_ok()
}

/// Whether `ctx_id` has an explicit (non-default) engine map configured.
pub fn context_has_engine_map(driver: &impl DrmDriver, ctx_id: u32) -> bool {
    matches!(
        driver.context_engine_map(ctx_id),
        Ok(ContextEngineMap::Map(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use i915defs::ENGINE_INSTANCE_INVALID_VIRTUAL;
    use i915defs::EXEC_BLT;
    use i915defs::EXEC_BSD;
    use i915defs::EXEC_BSD_RING1;
    use i915defs::EXEC_RENDER;
    use std::cell::RefCell;

    fn pair(class: EngineClass, instance: u16) -> EngineClassInstance {
        EngineClassInstance {
            engine_class: class,
            engine_instance: instance,
        }
    }

    fn virtual_pair() -> EngineClassInstance {
        pair(EngineClass::INVALID, ENGINE_INSTANCE_INVALID_VIRTUAL)
    }

    /// In-process driver: `map` of `None` models a kernel without engine
    /// map support.
    #[derive(Default)]
    struct FakeDriver {
        map: Option<ContextEngineMap>,
        device_engines: Vec<EngineClassInstance>,
        rings: Vec<u64>,
        set_maps: RefCell<Vec<(u32, Vec<EngineClassInstance>)>>,
    }

    impl DrmDriver for FakeDriver {
        fn context_engine_map(&self, _ctx_id: u32) -> Result<ContextEngineMap, DriverError> {
            self.map.clone().ok_or(DriverError::EngineMapUnsupported)
        }

        fn set_context_engine_map(
            &self,
            ctx_id: u32,
            engines: &[EngineClassInstance],
        ) -> Result<(), DriverError> {
            self.set_maps.borrow_mut().push((ctx_id, engines.to_vec()));
            Ok(())
        }

        fn query_engines(&self) -> Result<Vec<EngineClassInstance>, DriverError> {
            Ok(self.device_engines.clone())
        }

        fn has_ring(&self, flags: u64) -> bool {
            self.rings.contains(&flags)
        }
    }

    #[test]
    fn discovery_via_query_preserves_order_and_maps_context() {
        let engines = vec![
            pair(EngineClass::RENDER, 0),
            pair(EngineClass::COPY, 0),
            pair(EngineClass::VIDEO, 0),
            pair(EngineClass::VIDEO, 1),
            pair(EngineClass::VIDEO_ENHANCE, 0),
        ];
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Default),
            device_engines: engines.clone(),
            ..Default::default()
        };

        let set = EngineSet::from_context(&driver, 7).unwrap();
        assert_eq!(set.len(), engines.len());
        for (i, e) in set.iter().enumerate() {
            assert_eq!(e.class_instance(), engines[i]);
            assert_eq!(e.flags, i as u64);
            assert!(!e.is_virtual);
        }
        let names: Vec<_> = set.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["rcs0", "bcs0", "vcs0", "vcs1", "vecs0"]);

        // Identities are unique.
        for (i, a) in set.iter().enumerate() {
            for b in set.iter().skip(i + 1) {
                assert!(!a.same_engine(b));
            }
        }

        // The queried order was written back as the context's map.
        assert_eq!(driver.set_maps.borrow().as_slice(), &[(7, engines)]);
    }

    #[test]
    fn discovery_from_explicit_map() {
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Map(vec![
                pair(EngineClass::VIDEO, 1),
                virtual_pair(),
                pair(EngineClass::RENDER, 0),
            ])),
            ..Default::default()
        };

        let set = EngineSet::from_context(&driver, 1).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(0).unwrap().name, "vcs1");
        assert_eq!(set.get(1).unwrap().name, "virtual");
        assert!(set.get(1).unwrap().is_virtual);
        // Virtual engines carry no selector, whatever slot they occupy.
        assert_eq!(set.get(1).unwrap().flags, 0);
        assert_eq!(set.get(2).unwrap().name, "rcs0");
        // No map write-back when one is already configured.
        assert!(driver.set_maps.borrow().is_empty());
    }

    #[test]
    fn discovery_fallback_uses_static_table_filtered_by_ring_probe() {
        let driver = FakeDriver {
            map: None,
            rings: vec![EXEC_RENDER, EXEC_BLT, EXEC_BSD | EXEC_BSD_RING1],
            ..Default::default()
        };

        let set = EngineSet::from_device(&driver).unwrap();
        let names: Vec<_> = set.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["rcs0", "bcs0", "vcs0"]);
        assert!(set.iter().all(|e| !e.is_virtual));
        assert_eq!(set.get(0).unwrap().flags, EXEC_RENDER);
    }

    #[test]
    fn iteration_terminates_and_empty_set_yields_none() {
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Map(vec![
                pair(EngineClass::RENDER, 0),
                pair(EngineClass::COPY, 0),
            ])),
            ..Default::default()
        };
        let mut set = EngineSet::from_context(&driver, 0).unwrap();

        assert_eq!(set.current().unwrap().name, "rcs0");
        set.advance();
        assert_eq!(set.current().unwrap().name, "bcs0");
        set.advance();
        assert!(set.current().is_none());
        // Terminal state is sticky.
        set.advance();
        assert!(set.current().is_none());

        let empty = EngineSet::new(Vec::new());
        assert!(empty.is_empty());
        assert!(empty.current().is_none());
    }

    #[test]
    fn physical_iteration_skips_virtual_engines() {
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Map(vec![
                virtual_pair(),
                pair(EngineClass::RENDER, 0),
                virtual_pair(),
                pair(EngineClass::COPY, 0),
                virtual_pair(),
            ])),
            ..Default::default()
        };
        let mut set = EngineSet::from_context(&driver, 0).unwrap();

        assert_eq!(set.current_physical().unwrap().name, "rcs0");
        set.advance();
        assert_eq!(set.current_physical().unwrap().name, "bcs0");
        set.advance();
        assert!(set.current_physical().is_none());

        assert!(set.physical().all(|e| !e.is_virtual));
        assert_eq!(set.physical().count(), 2);
    }

    #[test]
    #[should_panic(expected = "unsupported engine count")]
    fn too_many_engines_aborts() {
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Default),
            device_engines: vec![pair(EngineClass::VIDEO, 0); MAX_ENGINES + 1],
            ..Default::default()
        };
        let _ = EngineSet::from_context(&driver, 0);
    }

    #[test]
    fn unknown_class_gets_generic_name_and_invalid_flags() {
        let e = EngineDescriptor::new(EngineClass(7), 2, 0);
        assert_eq!(e.name, "unknown7-2");
        assert_eq!(e.flags, INVALID_FLAGS);
        assert!(!e.is_virtual);
    }

    #[test]
    fn lookup_returns_bound_engine() {
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Map(vec![
                pair(EngineClass::RENDER, 0),
                pair(EngineClass::VIDEO, 1),
            ])),
            ..Default::default()
        };
        assert_eq!(
            lookup_context_engine(&driver, 3, 1).unwrap(),
            pair(EngineClass::VIDEO, 1)
        );
    }

    #[test]
    fn lookup_rejects_out_of_range_slot() {
        let driver = FakeDriver {
            map: Some(ContextEngineMap::Map(vec![pair(EngineClass::RENDER, 0)])),
            ..Default::default()
        };
        assert!(matches!(
            lookup_context_engine(&driver, 0, 1),
            Err(LookupError::SlotOutOfRange { slot: 1, len: 1 })
        ));
        assert!(matches!(
            lookup_context_engine(&driver, 0, u64::MAX),
            Err(LookupError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn lookup_distinguishes_unsupported_and_default_map() {
        let unsupported = FakeDriver::default();
        assert!(matches!(
            lookup_context_engine(&unsupported, 0, 0),
            Err(LookupError::Unsupported)
        ));

        let default_map = FakeDriver {
            map: Some(ContextEngineMap::Default),
            ..Default::default()
        };
        assert!(matches!(
            lookup_context_engine(&default_map, 0, 0),
            Err(LookupError::DefaultEngineMap)
        ));
    }

    #[test]
    fn capability_probes() {
        let unsupported = FakeDriver::default();
        assert!(!has_engine_topology(&unsupported));
        assert!(!context_has_engine_map(&unsupported, 0));

        let default_map = FakeDriver {
            map: Some(ContextEngineMap::Default),
            ..Default::default()
        };
        assert!(has_engine_topology(&default_map));
        assert!(!context_has_engine_map(&default_map, 0));

        let mapped = FakeDriver {
            map: Some(ContextEngineMap::Map(vec![pair(EngineClass::RENDER, 0)])),
            ..Default::default()
        };
        assert!(context_has_engine_map(&mapped, 0));
    }
}
