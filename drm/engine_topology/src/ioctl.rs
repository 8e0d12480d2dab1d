// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The real driver backend: DRM ioctls against an open i915 device node.

use crate::ContextEngineMap;
use crate::DriverError;
use crate::DrmDriver;
use i915defs::context_param_engines_size;
use i915defs::engine_count_from_size;
use i915defs::ContextParamEngines;
use i915defs::EngineClassInstance;
use i915defs::GemContextParam;
use i915defs::GemExecObject2;
use i915defs::GemExecbuffer2;
use i915defs::GetParam;
use i915defs::Query;
use i915defs::QueryEngineInfo;
use i915defs::QueryItem;
use i915defs::CONTEXT_PARAM_ENGINES;
use i915defs::EXEC_BSD;
use i915defs::EXEC_BSD_MASK;
use i915defs::EXEC_BSD_RING2;
use i915defs::MAX_ENGINES;
use i915defs::PARAM_HAS_BSD2;
use i915defs::QUERY_ENGINE_INFO;
use nix::errno::Errno;
use nix::sys::stat::fstat;
use nix::sys::stat::major;
use nix::sys::stat::minor;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;
use zerocopy::FromZeros;

mod ioctls {
    use i915defs::GemContextParam;
    use i915defs::GemExecbuffer2;
    use i915defs::GetParam;
    use i915defs::Query;
    use nix::ioctl_readwrite;
    use nix::ioctl_write_ptr;

    const DRM_IOCTL_BASE: u8 = b'd';
    const DRM_COMMAND_BASE: u8 = 0x40;

    // #define DRM_IOCTL_I915_GETPARAM DRM_IOWR(DRM_COMMAND_BASE + 0x06, drm_i915_getparam_t)
    ioctl_readwrite!(i915_getparam, DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x06, GetParam);
    // #define DRM_IOCTL_I915_GEM_EXECBUFFER2 DRM_IOW(DRM_COMMAND_BASE + 0x29, struct drm_i915_gem_execbuffer2)
    ioctl_write_ptr!(
        i915_gem_execbuffer2,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x29,
        GemExecbuffer2
    );
    // #define DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM DRM_IOWR(DRM_COMMAND_BASE + 0x34, struct drm_i915_gem_context_param)
    ioctl_readwrite!(
        i915_gem_context_getparam,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x34,
        GemContextParam
    );
    // #define DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM DRM_IOWR(DRM_COMMAND_BASE + 0x35, struct drm_i915_gem_context_param)
    ioctl_readwrite!(
        i915_gem_context_setparam,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + 0x35,
        GemContextParam
    );
    // #define DRM_IOCTL_I915_QUERY DRM_IOWR(DRM_COMMAND_BASE + 0x39, struct drm_i915_query)
    ioctl_readwrite!(i915_query, DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x39, Query);
}

/// Whether a ring probe for `flags` must first consult the HAS_BSD2
/// parameter: the kernel accepts the second BSD ring selector on any device
/// that has BSD at all, so execbuffer validation alone cannot rule it out.
/// The first BSD ring (and the unselected BSD alias) probe fine without it.
fn needs_bsd2_check(flags: u64) -> bool {
    flags & !EXEC_BSD_MASK == EXEC_BSD && flags & EXEC_BSD_RING2 != 0
}

/// Restart interrupted calls, as libdrm's drmIoctl() does.
fn drm_ioctl(mut call: impl FnMut() -> nix::Result<libc::c_int>) -> nix::Result<libc::c_int> {
    loop {
        match call() {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            other => return other,
        }
    }
}

/// An error from [`DrmDevice::open`].
#[derive(Debug, Error)]
#[error("failed to open DRM device {path}")]
pub struct OpenError {
    path: String,
    #[source]
    err: io::Error,
}

/// An open i915 DRM device node.
///
/// Owns its file descriptor; each user should open its own device rather
/// than share one.
pub struct DrmDevice {
    file: fs::File,
}

impl DrmDevice {
    /// Opens the device node at `path`, e.g. `/dev/dri/card0`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| OpenError {
                path: path.display().to_string(),
                err,
            })?;
        Ok(Self { file })
    }

    /// Adopts an already-open device node.
    pub fn new(file: fs::File) -> Self {
        Self { file }
    }

    fn getparam(&self, param: i32) -> nix::Result<i32> {
        let mut value: i32 = 0;
        let mut gp = GetParam {
            param,
            value: &mut value,
        };
        // SAFETY: gp points at a live i32 for the kernel to fill in.
        drm_ioctl(|| unsafe { ioctls::i915_getparam(self.file.as_raw_fd(), &mut gp) })?;
        Ok(value)
    }

    /// The sysfs directory holding this device's per-engine attribute
    /// directories, e.g. `/sys/dev/char/226:0/engine`.
    pub fn engine_sysfs_dir(&self) -> io::Result<PathBuf> {
        let st = fstat(self.file.as_raw_fd()).map_err(io::Error::from)?;
        Ok(PathBuf::from(format!(
            "/sys/dev/char/{}:{}/engine",
            major(st.st_rdev),
            minor(st.st_rdev)
        )))
    }

    /// Reads a sysfs attribute of an engine, e.g.
    /// `("rcs0", "heartbeat_interval_ms")`, trimmed of whitespace.
    pub fn engine_property(&self, engine: &str, attr: &str) -> io::Result<String> {
        let path = self.engine_sysfs_dir()?.join(engine).join(attr);
        Ok(fs_err::read_to_string(path)?.trim().to_string())
    }

    /// The MMIO base address of an engine, from its sysfs `mmio_base`
    /// attribute.
    pub fn engine_mmio_base(&self, engine: &str) -> io::Result<u32> {
        let value = self.engine_property(engine, "mmio_base")?;
        let digits = value.strip_prefix("0x").unwrap_or(&value);
        u32::from_str_radix(digits, 16)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl DrmDriver for DrmDevice {
    fn context_engine_map(&self, ctx_id: u32) -> Result<ContextEngineMap, DriverError> {
        let mut engines = ContextParamEngines::new_zeroed();
        let mut param = GemContextParam {
            ctx_id,
            size: size_of::<ContextParamEngines>() as u32,
            param: CONTEXT_PARAM_ENGINES,
            value: &mut engines as *mut ContextParamEngines as u64,
        };
        // SAFETY: param points at `engines`, sized to hold the largest map
        // the kernel may return.
        let r = drm_ioctl(|| unsafe {
            ioctls::i915_gem_context_getparam(self.file.as_raw_fd(), &mut param)
        });
        if let Err(err) = r {
            tracing::debug!(ctx_id, error = %err, "engine map getparam failed");
            return Err(DriverError::EngineMapUnsupported);
        }
        if param.size == 0 {
            return Ok(ContextEngineMap::Default);
        }
        // The byte size reported back encodes the engine count.
        let count = engine_count_from_size(param.size);
        assert!(
            count <= MAX_ENGINES,
            "unsupported engine count {count} (max {MAX_ENGINES})"
        );
        Ok(ContextEngineMap::Map(engines.engines[..count].to_vec()))
    }

    fn set_context_engine_map(
        &self,
        ctx_id: u32,
        map: &[EngineClassInstance],
    ) -> Result<(), DriverError> {
        assert!(
            map.len() <= MAX_ENGINES,
            "unsupported engine count {} (max {MAX_ENGINES})",
            map.len()
        );
        let mut engines = ContextParamEngines::new_zeroed();
        engines.engines[..map.len()].copy_from_slice(map);
        let mut param = GemContextParam {
            ctx_id,
            size: context_param_engines_size(map.len()),
            param: CONTEXT_PARAM_ENGINES,
            value: &engines as *const ContextParamEngines as u64,
        };
        // SAFETY: param points at `engines`, with `size` bounding the valid
        // prefix.
        drm_ioctl(|| unsafe {
            ioctls::i915_gem_context_setparam(self.file.as_raw_fd(), &mut param)
        })
        .map_err(|err| DriverError::SetEngineMap(err.into()))?;
        Ok(())
    }

    fn query_engines(&self) -> Result<Vec<EngineClassInstance>, DriverError> {
        let mut info = QueryEngineInfo::new_zeroed();
        let mut item = QueryItem {
            query_id: QUERY_ENGINE_INFO,
            length: size_of::<QueryEngineInfo>() as i32,
            flags: 0,
            data_ptr: &mut info as *mut QueryEngineInfo as u64,
        };
        let mut query = Query {
            num_items: 1,
            flags: 0,
            items_ptr: &mut item as *mut QueryItem as u64,
        };
        // SAFETY: query chains to `item` which points at `info`; all three
        // outlive the call.
        drm_ioctl(|| unsafe { ioctls::i915_query(self.file.as_raw_fd(), &mut query) })
            .map_err(|err| DriverError::QueryEngineInfo(err.into()))?;
        // Per-item failures come back as a negative errno in `length`.
        if item.length < 0 {
            return Err(DriverError::QueryEngineInfo(io::Error::from_raw_os_error(
                -item.length,
            )));
        }
        let count = info.num_engines as usize;
        assert!(
            count <= MAX_ENGINES,
            "unsupported engine count {count} (max {MAX_ENGINES})"
        );
        Ok(info.engines[..count].iter().map(|e| e.engine).collect())
    }

    fn has_ring(&self, flags: u64) -> bool {
        if needs_bsd2_check(flags) && self.getparam(PARAM_HAS_BSD2).unwrap_or(0) <= 0 {
            return false;
        }

        // A no-op submission with a single invalid buffer handle: ENOENT
        // means ring validation passed and buffer lookup failed, so the
        // ring exists; EINVAL (or anything else) means it does not.
        let exec = GemExecObject2::new_zeroed();
        let mut execbuf = GemExecbuffer2::new_zeroed();
        execbuf.buffers_ptr = &exec as *const GemExecObject2 as u64;
        execbuf.buffer_count = 1;
        execbuf.flags = flags;
        // SAFETY: execbuf points at one zeroed exec object; the kernel only
        // reads both.
        matches!(
            drm_ioctl(|| unsafe {
                ioctls::i915_gem_execbuffer2(self.file.as_raw_fd(), &execbuf)
            }),
            Err(Errno::ENOENT)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::needs_bsd2_check;
    use super::DrmDevice;
    use crate::EngineSet;
    use i915defs::EXEC_BSD;
    use i915defs::EXEC_BSD_RING1;
    use i915defs::EXEC_BSD_RING2;
    use i915defs::EXEC_RENDER;

    /// Only an explicit second-BSD-ring selector needs the HAS_BSD2
    /// parameter; the first ring and the unselected BSD alias are valid on
    /// every device with video engines.
    #[test]
    fn bsd2_check_only_for_second_ring() {
        assert!(needs_bsd2_check(EXEC_BSD | EXEC_BSD_RING2));
        assert!(!needs_bsd2_check(EXEC_BSD | EXEC_BSD_RING1));
        assert!(!needs_bsd2_check(EXEC_BSD));
        assert!(!needs_bsd2_check(EXEC_RENDER));
        // Engine map slot indexes never carry ring-selector bits.
        assert!(!needs_bsd2_check(1));
        assert!(!needs_bsd2_check(2));
    }

    /// Exercises the real backend when a DRM node is present; on machines
    /// without one (or without an i915 device) discovery degrades to an
    /// empty legacy set, which is still a valid result.
    #[test]
    fn host_device_smoke() {
        let Ok(device) = DrmDevice::open("/dev/dri/card0") else {
            return;
        };
        let set = EngineSet::from_device(&device).unwrap();
        for engine in &set {
            assert!(!engine.name.is_empty());
            assert!(!engine.is_virtual);
        }
    }
}
