/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime settings for cuPyNumeric.
//!
//! This crate provides a typed registry of runtime-tunable settings
//! backed by environment variables:
//! - [`Setting`]: a typed handle returned when a setting is declared
//! - [`Registry`]: declarations plus resolution of effective values,
//!   following the priority order `Explicit → Override → Env →
//!   TestDefault → Default`
//! - [`RuntimeSettings`]: the table of settings consumed by the
//!   execution runtime (chunk thresholds, matmul cache size, forced
//!   thunk strategy, reporting switches)
//! - [`global`]: the single process-wide instance and test helpers
//!
//! Downstream code never parses the `CUPYNUMERIC_*` environment
//! variables itself; it asks the registry for typed values.
//!
//! ```
//! use cupynumeric_settings::RuntimeSettings;
//!
//! let settings = RuntimeSettings::new(/* test_mode = */ false).unwrap();
//! let threshold: usize = settings.min_cpu_chunk().unwrap();
//! assert!(threshold > 0);
//! ```

pub mod convert;
pub mod global;
pub mod registry;
pub mod runtime;
pub mod setting;

pub use convert::SettingValue;
pub use convert::convert_bool;
pub use convert::convert_int;
pub use convert::convert_optional_str;
pub use convert::convert_str;
pub use registry::Registry;
pub use registry::ResolvedSetting;
pub use runtime::RuntimeSettings;
pub use setting::Convert;
pub use setting::Kind;
pub use setting::Setting;
pub use setting::SettingSpec;
pub use setting::Source;

/// Errors produced while declaring, resolving or overriding settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A setting with this name was already declared in the registry.
    #[error("setting {name} is already defined")]
    Duplicate { name: &'static str },

    /// The backing environment variable holds a value that the
    /// setting's conversion function rejects.
    #[error("invalid value {raw:?} in ${env_var} for setting {name}: {source}")]
    Conversion {
        name: &'static str,
        env_var: &'static str,
        raw: String,
        #[source]
        source: anyhow::Error,
    },

    /// A string override handed to [`Registry::set_from_str`] could not
    /// be converted.
    #[error("invalid value {raw:?} for setting {name}: {source}")]
    Invalid {
        name: String,
        raw: String,
        #[source]
        source: anyhow::Error,
    },

    /// Env-only settings are read-only after declaration.
    #[error("setting {name} is read from the environment only and cannot be overridden")]
    EnvOnly { name: &'static str },

    /// No setting with this name is declared.
    #[error("unknown setting {name}")]
    Unknown { name: String },

    /// The handle's value type does not match the declaration.
    #[error("setting {name} is not of type {expected}")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
    },

    /// [`global::init`] was called after the process-wide settings were
    /// already installed.
    #[error("runtime settings are already initialized")]
    AlreadyInitialized,
}
