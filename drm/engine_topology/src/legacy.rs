// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The static table of legacy engines, for kernels that predate the engine
//! info query, and the mapping between engines and legacy execbuffer ring
//! selectors.

use crate::EngineClass;
use crate::EngineDescriptor;
use crate::INVALID_FLAGS;
use i915defs::ENGINE_INSTANCE_INVALID_NONE;
use i915defs::EXEC_BLT;
use i915defs::EXEC_BSD;
use i915defs::EXEC_BSD_MASK;
use i915defs::EXEC_BSD_RING1;
use i915defs::EXEC_BSD_RING2;
use i915defs::EXEC_DEFAULT;
use i915defs::EXEC_RENDER;
use i915defs::EXEC_RING_MASK;
use i915defs::EXEC_VEBOX;

/// An entry of the static engine table.
#[derive(Debug, Clone, Copy)]
pub struct LegacyEngine {
    /// Canonical engine name.
    pub name: &'static str,
    /// Engine class.
    pub class: EngineClass,
    /// Ordinal within the class.
    pub instance: u16,
    /// Legacy execbuffer ring selector bits.
    pub flags: u64,
}

/// Every engine addressable through the legacy execbuffer ring selectors.
///
/// Presence still has to be probed per device; see
/// [`DrmDriver::has_ring`](crate::DrmDriver::has_ring).
pub const ENGINES: &[LegacyEngine] = &[
    LegacyEngine {
        name: "rcs0",
        class: EngineClass::RENDER,
        instance: 0,
        flags: EXEC_RENDER,
    },
    LegacyEngine {
        name: "bcs0",
        class: EngineClass::COPY,
        instance: 0,
        flags: EXEC_BLT,
    },
    LegacyEngine {
        name: "vcs0",
        class: EngineClass::VIDEO,
        instance: 0,
        flags: EXEC_BSD | EXEC_BSD_RING1,
    },
    LegacyEngine {
        name: "vcs1",
        class: EngineClass::VIDEO,
        instance: 1,
        flags: EXEC_BSD | EXEC_BSD_RING2,
    },
    LegacyEngine {
        name: "vecs0",
        class: EngineClass::VIDEO_ENHANCE,
        instance: 0,
        flags: EXEC_VEBOX,
    },
];

/// Short mnemonic for an engine class, or `None` for classes this library
/// does not know.
pub fn class_name(class: EngineClass) -> Option<&'static str> {
    match class {
        EngineClass::RENDER => Some("rcs"),
        EngineClass::COPY => Some("bcs"),
        EngineClass::VIDEO => Some("vcs"),
        EngineClass::VIDEO_ENHANCE => Some("vecs"),
        _ => None,
    }
}

impl From<&LegacyEngine> for EngineDescriptor {
    fn from(e: &LegacyEngine) -> Self {
        Self {
            class: e.class,
            instance: e.instance,
            name: e.name.to_string(),
            flags: e.flags,
            is_virtual: false,
        }
    }
}

/// Maps legacy execbuffer ring-selection `flags` back to an engine.
///
/// `EXEC_DEFAULT` yields a descriptor named `default` with an invalid
/// identity; selector bits matching no table entry yield one named
/// `invalid`.
pub fn engine_from_execbuf_flags(flags: u64) -> EngineDescriptor {
    let ring = flags & (EXEC_RING_MASK | EXEC_BSD_MASK);
    let invalid = EngineDescriptor {
        class: EngineClass::INVALID,
        instance: ENGINE_INSTANCE_INVALID_NONE,
        name: String::new(),
        flags: INVALID_FLAGS,
        is_virtual: false,
    };

    if ring == EXEC_DEFAULT {
        return EngineDescriptor {
            name: "default".to_string(),
            flags: EXEC_DEFAULT,
            ..invalid
        };
    }

    match ENGINES.iter().find(|e| e.flags == ring) {
        Some(e) => e.into(),
        None => EngineDescriptor {
            name: "invalid".to_string(),
            ..invalid
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The table must stay consistent with the class mnemonics: name ==
    /// mnemonic + instance, identities unique.
    #[test]
    fn table_is_consistent() {
        for (i, e) in ENGINES.iter().enumerate() {
            let mnemonic = class_name(e.class).expect("table entry with unnamed class");
            assert_eq!(e.name, format!("{}{}", mnemonic, e.instance));
            for other in &ENGINES[i + 1..] {
                assert!(e.class != other.class || e.instance != other.instance);
                assert_ne!(e.flags, other.flags);
            }
        }
    }

    #[test]
    fn execbuf_flags_round_trip() {
        for e in ENGINES {
            assert_eq!(engine_from_execbuf_flags(e.flags).name, e.name);
        }
    }

    #[test]
    fn execbuf_flags_sentinels() {
        let default = engine_from_execbuf_flags(EXEC_DEFAULT);
        assert_eq!(default.name, "default");
        assert_eq!(default.flags, EXEC_DEFAULT);
        assert_eq!(default.class, EngineClass::INVALID);

        // Bits outside the ring selectors are ignored.
        assert_eq!(engine_from_execbuf_flags(EXEC_RENDER | 1 << 20).name, "rcs0");

        let bogus = engine_from_execbuf_flags(0x3f);
        assert_eq!(bogus.name, "invalid");
        assert_eq!(bogus.flags, INVALID_FLAGS);
    }
}
