/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Setting declarations and typed handles.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;

use crate::convert::SettingValue;

/// A conversion from a raw environment string to a setting value.
pub type Convert<T> = fn(&str) -> Result<T, anyhow::Error>;

/// Whether a setting accepts programmatic overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Kind {
    /// Resolved from (in order) an explicit call-site value, a stored
    /// override, the environment, and the defaults.
    Prioritized,
    /// Resolved once from the environment or the defaults, then
    /// frozen. Read by the runtime at initialization time only.
    EnvOnly,
}

/// Where an effective value came from.
///
/// Declared in priority order; smaller `priority()` wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Source {
    /// Supplied by the caller for this access only.
    Explicit,
    /// Stored with [`crate::Registry::set`].
    Override,
    /// Parsed from the backing environment variable.
    Env,
    /// The declared test default, used only in test mode.
    TestDefault,
    /// The declared default.
    Default,
}

impl Source {
    /// Numeric priority; smaller number = higher precedence.
    pub fn priority(self) -> u8 {
        match self {
            Source::Explicit => 0,
            Source::Override => 1,
            Source::Env => 2,
            Source::TestDefault => 3,
            Source::Default => 4,
        }
    }
}

/// A typed handle for a declared setting.
///
/// Handles are only produced by [`crate::Registry::define`], so holding
/// one means the setting exists with value type `T`.
pub struct Setting<T: 'static> {
    name: &'static str,
    env_var: &'static str,
    kind: Kind,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: 'static> Setting<T> {
    pub(crate) fn new(name: &'static str, env_var: &'static str, kind: Kind) -> Self {
        Self {
            name,
            env_var,
            kind,
            _phantom: PhantomData,
        }
    }

    /// The setting's unique name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The environment variable backing this setting.
    pub fn env_var(&self) -> &'static str {
        self.env_var
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_env_only(&self) -> bool {
        self.kind == Kind::EnvOnly
    }
}

impl<T: 'static> Clone for Setting<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> Copy for Setting<T> {}

impl<T: 'static> fmt::Debug for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setting")
            .field("name", &self.name)
            .field("env_var", &self.env_var)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The declaration of a setting, passed to [`crate::Registry::define`].
///
/// ```
/// use cupynumeric_settings::SettingSpec;
/// use cupynumeric_settings::convert_int;
///
/// let spec = SettingSpec::env_only("min_cpu_chunk", "CUPYNUMERIC_MIN_CPU_CHUNK", 1024usize)
///     .test_default(2)
///     .convert(convert_int)
///     .help("Arrays smaller than this are not offloaded to CPU tasks.");
/// assert_eq!(spec.name(), "min_cpu_chunk");
/// ```
pub struct SettingSpec<T> {
    pub(crate) name: &'static str,
    pub(crate) env_var: &'static str,
    pub(crate) kind: Kind,
    pub(crate) default: T,
    pub(crate) test_default: Option<T>,
    pub(crate) convert: Option<Convert<T>>,
    pub(crate) help: &'static str,
}

impl<T: SettingValue> SettingSpec<T> {
    /// Declare a setting that accepts programmatic overrides.
    pub fn prioritized(name: &'static str, env_var: &'static str, default: T) -> Self {
        Self::new(name, env_var, Kind::Prioritized, default)
    }

    /// Declare a read-only setting resolved from the environment.
    pub fn env_only(name: &'static str, env_var: &'static str, default: T) -> Self {
        Self::new(name, env_var, Kind::EnvOnly, default)
    }

    fn new(name: &'static str, env_var: &'static str, kind: Kind, default: T) -> Self {
        Self {
            name,
            env_var,
            kind,
            default,
            test_default: None,
            convert: None,
            help: "",
        }
    }

    /// Value used instead of the default when the registry runs in
    /// test mode and the environment variable is unset.
    pub fn test_default(mut self, value: T) -> Self {
        self.test_default = Some(value);
        self
    }

    /// Conversion applied to the raw environment string. Without one,
    /// [`SettingValue::parse`] is used.
    pub fn convert(mut self, convert: Convert<T>) -> Self {
        self.convert = Some(convert);
        self
    }

    pub fn help(mut self, help: &'static str) -> Self {
        self.help = help;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
