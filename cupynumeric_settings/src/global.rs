/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-wide runtime settings.
//!
//! The runtime reads its settings through [`settings()`], the single
//! access point for the process-wide [`RuntimeSettings`]. The instance
//! is created exactly once:
//!
//! - explicitly, by calling [`init`] during runtime start-up, before
//!   any other thread reads settings. This is where the surrounding
//!   harness says whether the process runs in test mode;
//! - otherwise, lazily on the first call to [`settings()`], with test
//!   mode off.
//!
//! [`init`] after the instance exists fails with
//! [`SettingsError::AlreadyInitialized`].
//!
//! # Testing
//!
//! Tests that override settings or mutate the process environment
//! serialize on [`lock`]. Overrides installed through the lock are
//! removed when their guard drops.
//!
//! ```
//! use cupynumeric_settings::global;
//!
//! let lock = global::lock();
//! let settings = global::settings();
//! {
//!     let _guard = lock.override_setting(settings.warn, true).unwrap();
//!     assert!(settings.warn().unwrap());
//! }
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::SettingsError;
use crate::convert::SettingValue;
use crate::registry::ErasedValue;
use crate::runtime::RuntimeSettings;
use crate::setting::Setting;

static SETTINGS: OnceLock<RuntimeSettings> = OnceLock::new();

/// Install the process-wide settings.
///
/// Every setting is resolved once, so a malformed environment variable
/// fails here rather than at some later first use. The effective
/// configuration is logged as shell `export` lines.
pub fn init(test_mode: bool) -> Result<&'static RuntimeSettings, SettingsError> {
    if SETTINGS.get().is_some() {
        return Err(SettingsError::AlreadyInitialized);
    }
    let candidate = RuntimeSettings::new(test_mode)?;
    candidate.validate()?;

    let mut installed = false;
    let settings = SETTINGS.get_or_init(|| {
        installed = true;
        candidate
    });
    if !installed {
        return Err(SettingsError::AlreadyInitialized);
    }

    tracing::info!(
        "initialized cupynumeric settings (test mode: {}):\n{}",
        test_mode,
        settings.registry().env_exports()?.trim_end()
    );
    Ok(settings)
}

/// The process-wide settings. Created with test mode off if [`init`]
/// has not run.
pub fn settings() -> &'static RuntimeSettings {
    SETTINGS.get_or_init(|| {
        // Only fails if `RuntimeSettings::new` declares a name twice.
        RuntimeSettings::new(false).expect("runtime settings are declared with unique names")
    })
}

pub fn is_initialized() -> bool {
    SETTINGS.get().is_some()
}

/// Acquire the global settings lock.
///
/// Serializes tests that install overrides or mutate the process
/// environment, so they cannot clobber each other. Overrides are
/// created through the returned [`SettingsLock`].
pub fn lock() -> SettingsLock {
    static MUTEX: Mutex<()> = Mutex::new(());
    SettingsLock {
        _guard: MUTEX.lock().unwrap_or_else(PoisonError::into_inner),
    }
}

/// Holds the global settings lock. Override guards cannot outlive it.
pub struct SettingsLock {
    _guard: MutexGuard<'static, ()>,
}

static OVERRIDE_TOKEN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Scoped overrides of one setting. The top frame is the active
/// override; `saved` is what the registry held before the first frame
/// was pushed.
struct OverrideStack {
    saved: Option<Box<dyn ErasedValue>>,
    frames: Vec<OverrideFrame>,
}

struct OverrideFrame {
    token: u64,
    value: Box<dyn ErasedValue>,
}

static OVERRIDE_STACKS: Mutex<BTreeMap<&'static str, OverrideStack>> =
    Mutex::new(BTreeMap::new());

fn override_stacks() -> MutexGuard<'static, BTreeMap<&'static str, OverrideStack>> {
    OVERRIDE_STACKS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl SettingsLock {
    /// Override a prioritized setting of the process-wide settings
    /// until the returned guard drops.
    ///
    /// Each call pushes a frame onto the setting's override stack; the
    /// most recent live frame is the effective override. Dropping a
    /// guard removes its own frame, whatever the order. Once the last
    /// frame is gone, the override the setting had before the first
    /// guard (if any) is put back.
    pub fn override_setting<'a, T: SettingValue>(
        &'a self,
        setting: Setting<T>,
        value: T,
    ) -> Result<OverrideGuard<'a>, SettingsError> {
        let name = setting.name();
        let registry = settings().registry();
        registry.typed_entry::<T>(name)?;

        let mut stacks = override_stacks();
        let previous = registry.replace_override(name, Some(Box::new(value.clone())))?;
        let token = OVERRIDE_TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
        let stack = stacks.entry(name).or_insert_with(|| OverrideStack {
            saved: previous,
            frames: Vec::new(),
        });
        stack.frames.push(OverrideFrame {
            token,
            value: Box::new(value),
        });

        Ok(OverrideGuard {
            name,
            token,
            _phantom: PhantomData,
        })
    }
}

/// Puts back any scoped overrides whose guards were leaked, so they
/// cannot outlive the lock.
impl Drop for SettingsLock {
    fn drop(&mut self) {
        let mut stacks = override_stacks();
        if stacks.is_empty() {
            return;
        }
        let Some(settings) = SETTINGS.get() else {
            stacks.clear();
            return;
        };
        for (name, stack) in std::mem::take(&mut *stacks) {
            if let Err(e) = settings.registry().replace_override(name, stack.saved) {
                tracing::error!("failed to restore setting {}: {}", name, e);
            }
        }
    }
}

/// Removes its override frame when dropped.
pub struct OverrideGuard<'a> {
    name: &'static str,
    token: u64,
    // This is here so we can hold onto a 'a lifetime.
    _phantom: PhantomData<&'a ()>,
}

/// Dropping a guard removes its frame from the setting's stack. If it
/// was the top frame, the next frame becomes the active override. If
/// it was the last frame, the saved override is restored (or removed
/// if there was none).
impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        let mut stacks = override_stacks();
        let Some(stack) = stacks.get_mut(self.name) else {
            return;
        };
        let Some(pos) = stack.frames.iter().position(|f| f.token == self.token) else {
            return;
        };
        let was_top = pos + 1 == stack.frames.len();
        stack.frames.remove(pos);

        let restored = if stack.frames.is_empty() {
            stacks.remove(self.name).and_then(|stack| stack.saved)
        } else if was_top {
            stack.frames.last().map(|top| top.value.cloned())
        } else {
            return;
        };

        let registry = settings().registry();
        if let Err(e) = registry.replace_override(self.name, restored) {
            tracing::error!("failed to restore setting {}: {}", self.name, e);
        }
    }
}
