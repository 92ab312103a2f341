//! Enums and flags shared by resources, the loading queue and the manager.

use std::{
    fmt,
    sync::atomic::{AtomicU16, AtomicU8, Ordering},
};

use bitflags::bitflags;
use derive_new::new;
use serde::{Deserialize, Serialize};

/// Describes the state in which a resource currently is.
///
/// The discriminants are ordered, so "wait until at least `Loaded`" can be
/// expressed as a comparison. `LoadedResourceMissing` always ends a wait,
/// independent of the requested state.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceState {
    /// The resource object exists, but no data has been loaded.
    Unloaded = 1,
    /// The resource is queued for loading or a worker is processing it.
    LoadingInProgress = 2,
    /// The resource could not be loaded. A 'missing' fallback is used, if available.
    LoadedResourceMissing = 3,
    /// The resource is loaded and usable. More quality levels may still follow.
    Loaded = 4,
}

impl ResourceState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ResourceState::Unloaded,
            2 => ResourceState::LoadingInProgress,
            3 => ResourceState::LoadedResourceMissing,
            4 => ResourceState::Loaded,
            _ => unreachable!("invalid resource state {}", value),
        }
    }

    /// Returns `true` once no more waiting for `requested` is possible.
    pub fn satisfies(self, requested: ResourceState) -> bool {
        self >= requested || self == ResourceState::LoadedResourceMissing
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Atomic storage for a `ResourceState`.
///
/// Reading the state never takes a lock, so the "already loaded" path of an
/// acquire does not contend with loading.
#[derive(Debug)]
pub(crate) struct AtomicResourceState(AtomicU8);

impl AtomicResourceState {
    pub fn new(state: ResourceState) -> Self {
        AtomicResourceState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ResourceState {
        ResourceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ResourceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

bitflags! {
    /// The flags of a resource object.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ResourceFlags: u16 {
        /// Content updates must run on the main thread.
        const UPDATE_ON_MAIN_THREAD = 1 << 0;
        /// The resource has its own loading fallback.
        const RESOURCE_HAS_FALLBACK = 1 << 1;
        /// The resource type has a loading fallback.
        const RESOURCE_HAS_TYPE_FALLBACK = 1 << 2;
        /// The resource may be reloaded.
        const IS_RELOADABLE = 1 << 3;
        /// The resource is in the loading queue or claimed by a worker.
        const IS_QUEUED_FOR_LOADING = 1 << 4;
        /// A one-shot custom loader is installed for the next load.
        const HAS_CUSTOM_DATA_LOADER = 1 << 5;
        /// No reloading from file until the flag is removed. Set when a custom loader was consumed.
        const PREVENT_FILE_RELOAD = 1 << 6;
        /// Low resolution data was provided once.
        const HAS_LOW_RES_DATA = 1 << 7;
        /// The resource was created in memory and is not file backed.
        const IS_CREATED_RESOURCE = 1 << 8;
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicResourceFlags(AtomicU16);

impl AtomicResourceFlags {
    pub fn new(flags: ResourceFlags) -> Self {
        AtomicResourceFlags(AtomicU16::new(flags.bits()))
    }

    pub fn get(&self) -> ResourceFlags {
        ResourceFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: ResourceFlags) -> bool {
        self.get().contains(flags)
    }

    pub fn insert(&self, flags: ResourceFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, flags: ResourceFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn set(&self, flags: ResourceFlags, value: bool) {
        if value {
            self.insert(flags);
        } else {
            self.remove(flags);
        }
    }
}

/// Loading priority of a resource. Lower values load earlier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourcePriority {
    /// Loaded before anything else. Blocking acquires elevate to this.
    Critical = 0,
    #[allow(missing_docs)]
    VeryHigh = 1,
    #[allow(missing_docs)]
    High = 2,
    /// The default.
    Normal = 3,
    #[allow(missing_docs)]
    Low = 4,
    #[allow(missing_docs)]
    VeryLow = 5,
}

impl Default for ResourcePriority {
    fn default() -> Self {
        ResourcePriority::Normal
    }
}

impl ResourcePriority {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ResourcePriority::Critical,
            1 => ResourcePriority::VeryHigh,
            2 => ResourcePriority::High,
            3 => ResourcePriority::Normal,
            4 => ResourcePriority::Low,
            _ => ResourcePriority::VeryLow,
        }
    }
}

/// How much of a resource needs to be available when acquiring it.
///
/// The variants are ordered; everything from `BlockTillLoaded` on loads at highest priority.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AcquireMode {
    /// Only the object is needed, no data. Never queues, never blocks, never fails.
    PointerOnly,
    /// A loading fallback is fine while the resource is not loaded yet.
    AllowLoadingFallback,
    /// Like `AllowLoadingFallback`, but a missing resource without fallback is not an error.
    AllowLoadingFallbackNeverFail,
    /// Block until the resource is loaded (not necessarily at full quality).
    BlockTillLoaded,
    /// Like `BlockTillLoaded`, but a missing resource without fallback is not an error.
    BlockTillLoadedNeverFail,
}

impl AcquireMode {
    /// Whether the caller can cope with a missing resource that has no fallback.
    pub fn is_never_fail(self) -> bool {
        match self {
            AcquireMode::AllowLoadingFallbackNeverFail | AcquireMode::BlockTillLoadedNeverFail => {
                true
            }
            _ => false,
        }
    }

    /// Whether loading fallbacks may be returned.
    pub fn allows_loading_fallback(self) -> bool {
        match self {
            AcquireMode::AllowLoadingFallback | AcquireMode::AllowLoadingFallbackNeverFail => true,
            _ => false,
        }
    }
}

/// What an acquire actually returned.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AcquireResult {
    /// Nothing; only possible with a `NeverFail` mode.
    None,
    /// The resource is missing and its type's missing fallback was returned.
    MissingFallback,
    /// The resource is still loading and a loading fallback was returned.
    LoadingFallback,
    /// The requested resource itself.
    Final,
}

/// Describes the result of creating, updating or unloading resource content.
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
pub struct LoadDesc {
    /// State the resource is in afterwards.
    pub state: ResourceState,
    /// How many quality levels could be discarded while staying usable.
    pub quality_levels_discardable: u8,
    /// How many more quality levels could still be loaded.
    pub quality_levels_loadable: u8,
}

impl LoadDesc {
    /// Fully loaded, no quality levels to discard or load.
    pub fn loaded() -> Self {
        LoadDesc::new(ResourceState::Loaded, 0, 0)
    }

    /// The content is missing.
    pub fn missing() -> Self {
        LoadDesc::new(ResourceState::LoadedResourceMissing, 0, 0)
    }

    /// No content.
    pub fn unloaded() -> Self {
        LoadDesc::new(ResourceState::Unloaded, 0, 0)
    }
}

/// How much content `Resource::unload_data` should drop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Unload {
    /// Drop everything.
    AllQualityLevels,
    /// Drop only the highest quality level.
    OneQualityLevel,
}

/// Memory held by a resource's content.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, new)]
pub struct MemoryUsage {
    /// Bytes in system memory.
    pub cpu: u64,
    /// Bytes in GPU memory.
    pub gpu: u64,
}
