/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The settings registry.
//!
//! A [`Registry`] holds a fixed table of declared settings and resolves
//! their effective values. Resolution consults, in order:
//!
//! 1. an explicit value supplied at the call site ([`Registry::resolve`]),
//! 2. a stored override ([`Registry::set`]),
//! 3. the backing environment variable, converted with the setting's
//!    conversion function,
//! 4. the test default, if the registry was built in test mode,
//! 5. the default.
//!
//! Steps 1 and 2 only apply to [`Kind::Prioritized`] settings.
//! [`Kind::EnvOnly`] settings are resolved from steps 3–5 once and the
//! result is cached for the lifetime of the registry.
//!
//! A conversion failure is an error at the point of access. It is never
//! papered over with the default.

use std::any::Any;
use std::collections::HashMap;
use std::env;
use std::env::VarError;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::RwLock;

use serde::Serialize;
use shell_quote::QuoteRefExt;

use crate::SettingsError;
use crate::convert::SettingValue;
use crate::setting::Kind;
use crate::setting::Setting;
use crate::setting::SettingSpec;
use crate::setting::Source;

// Type-erased setting value, so that settings of different types can
// share one table.
pub(crate) trait ErasedValue: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn to_env(&self) -> Option<String>;
    fn cloned(&self) -> Box<dyn ErasedValue>;
}

impl<T: SettingValue> ErasedValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_env(&self) -> Option<String> {
        SettingValue::to_env(self)
    }

    fn cloned(&self) -> Box<dyn ErasedValue> {
        Box::new(self.clone())
    }
}

type ErasedConvert =
    Box<dyn Fn(&str) -> Result<Box<dyn ErasedValue>, anyhow::Error> + Send + Sync>;

struct Resolved {
    value: Box<dyn ErasedValue>,
    source: Source,
}

/// A declared setting, with its value type erased.
pub(crate) struct Entry {
    env_var: &'static str,
    kind: Kind,
    help: &'static str,
    type_name: &'static str,
    default: Box<dyn ErasedValue>,
    test_default: Option<Box<dyn ErasedValue>>,
    convert: ErasedConvert,
    /// Env-only settings: the value resolved on first access. Never
    /// invalidated.
    frozen: OnceLock<Resolved>,
}

/// One setting's effective value, as reported by [`Registry::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedSetting {
    pub name: &'static str,
    pub env_var: &'static str,
    pub kind: Kind,
    pub source: Source,
    /// The value rendered as it would appear in the environment;
    /// `None` for a null value.
    pub value: Option<String>,
    /// The declared default, rendered the same way.
    pub default: Option<String>,
    pub help: &'static str,
}

/// A table of declared settings and their stored overrides.
///
/// Declarations are fixed once the registry is shared: [`define`]
/// takes `&mut self`. Reads and overrides take `&self` and are safe
/// from multiple threads.
///
/// [`define`]: Registry::define
pub struct Registry {
    test_mode: bool,
    entries: HashMap<&'static str, Entry>,
    /// Declaration order, for reporting.
    order: Vec<&'static str>,
    overrides: RwLock<HashMap<&'static str, Box<dyn ErasedValue>>>,
}

impl Registry {
    /// Create an empty registry. In `test_mode`, declared test defaults
    /// take the place of ordinary defaults.
    pub fn new(test_mode: bool) -> Self {
        Self {
            test_mode,
            entries: HashMap::new(),
            order: Vec::new(),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Declare a setting and return its typed handle.
    ///
    /// Fails if a setting with the same name is already declared; the
    /// existing declaration is left as it was.
    pub fn define<T: SettingValue>(
        &mut self,
        spec: SettingSpec<T>,
    ) -> Result<Setting<T>, SettingsError> {
        if self.entries.contains_key(spec.name) {
            return Err(SettingsError::Duplicate { name: spec.name });
        }

        let convert = spec.convert.unwrap_or(T::parse);
        let entry = Entry {
            env_var: spec.env_var,
            kind: spec.kind,
            help: spec.help,
            type_name: std::any::type_name::<T>(),
            default: Box::new(spec.default),
            test_default: spec
                .test_default
                .map(|v| Box::new(v) as Box<dyn ErasedValue>),
            convert: Box::new(move |raw| convert(raw).map(|v| Box::new(v) as Box<dyn ErasedValue>)),
            frozen: OnceLock::new(),
        };
        self.entries.insert(spec.name, entry);
        self.order.push(spec.name);

        Ok(Setting::new(spec.name, spec.env_var, spec.kind))
    }

    /// The effective value of `setting`.
    pub fn get<T: SettingValue>(&self, setting: Setting<T>) -> Result<T, SettingsError> {
        self.resolve(setting, None)
    }

    /// The effective value of `setting`, preferring `explicit` when it
    /// is given. Explicit values are only accepted for prioritized
    /// settings.
    pub fn resolve<T: SettingValue>(
        &self,
        setting: Setting<T>,
        explicit: Option<T>,
    ) -> Result<T, SettingsError> {
        self.resolve_with_source(setting, explicit)
            .map(|(value, _)| value)
    }

    /// Like [`Registry::resolve`], also reporting which source won.
    pub fn resolve_with_source<T: SettingValue>(
        &self,
        setting: Setting<T>,
        explicit: Option<T>,
    ) -> Result<(T, Source), SettingsError> {
        let name = setting.name();
        let entry = self.typed_entry::<T>(name)?;
        if let Some(value) = explicit {
            if entry.kind == Kind::EnvOnly {
                return Err(SettingsError::EnvOnly { name });
            }
            return Ok((value, Source::Explicit));
        }

        let Resolved { value, source } = self.resolve_entry(name, entry)?;
        let value = value
            .as_any()
            .downcast_ref::<T>()
            .cloned()
            .ok_or(SettingsError::TypeMismatch {
                name,
                expected: std::any::type_name::<T>(),
            })?;
        Ok((value, source))
    }

    /// Store a programmatic override for a prioritized setting. It
    /// outranks the environment until removed with [`Registry::unset`]
    /// or [`Registry::reset`].
    pub fn set<T: SettingValue>(
        &self,
        setting: Setting<T>,
        value: T,
    ) -> Result<(), SettingsError> {
        let name = setting.name();
        self.typed_entry::<T>(name)?;
        self.check_overridable(name)?;
        tracing::debug!("overriding setting {} with {:?}", name, value);
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Box::new(value));
        Ok(())
    }

    /// Store an override given as a string, converting it the same way
    /// an environment value would be. Used by in-process configuration
    /// APIs that only see names and strings.
    pub fn set_from_str(&self, name: &str, raw: &str) -> Result<(), SettingsError> {
        let (&name, entry) = self
            .entries
            .get_key_value(name)
            .ok_or_else(|| SettingsError::Unknown {
                name: name.to_string(),
            })?;
        self.check_overridable(name)?;
        let value = (entry.convert)(raw).map_err(|source| SettingsError::Invalid {
            name: name.to_string(),
            raw: raw.to_string(),
            source,
        })?;
        tracing::debug!("overriding setting {} with {:?}", name, raw);
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
        Ok(())
    }

    /// Remove the stored override for `setting`, if any.
    pub fn unset<T: SettingValue>(&self, setting: Setting<T>) -> Result<(), SettingsError> {
        let name = setting.name();
        self.check_overridable(name)?;
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }

    /// Drop every stored override.
    ///
    /// Env-only values that were already resolved stay frozen; build a
    /// new registry to observe a changed environment for those.
    pub fn reset(&self) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The effective value of the named setting, rendered as it would
    /// appear in the environment.
    pub fn display(&self, name: &str) -> Result<Option<String>, SettingsError> {
        let (&name, entry) = self
            .entries
            .get_key_value(name)
            .ok_or_else(|| SettingsError::Unknown {
                name: name.to_string(),
            })?;
        Ok(self.resolve_entry(name, entry)?.value.to_env())
    }

    /// Names of all declared settings, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.order.iter().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Help text of the named setting.
    pub fn help(&self, name: &str) -> Option<&'static str> {
        self.entries.get(name).map(|entry| entry.help)
    }

    /// Resolve every setting, in declaration order. Fails on the first
    /// setting whose environment value does not convert.
    pub fn snapshot(&self) -> Result<Vec<ResolvedSetting>, SettingsError> {
        self.order
            .iter()
            .map(|&name| {
                let entry = &self.entries[name];
                let Resolved { value, source } = self.resolve_entry(name, entry)?;
                Ok(ResolvedSetting {
                    name,
                    env_var: entry.env_var,
                    kind: entry.kind,
                    source,
                    value: value.to_env(),
                    default: entry.default.to_env(),
                    help: entry.help,
                })
            })
            .collect()
    }

    /// Render the effective configuration as shell `export` lines.
    ///
    /// Each setting's default is shown commented out. Settings whose
    /// effective value is not the declared default (including test
    /// defaults) are followed by an `export` of that value, or an
    /// `unset` when it is null, so the output can be replayed to
    /// reproduce this process's settings.
    pub fn env_exports(&self) -> Result<String, SettingsError> {
        fn export(env_var: &str, value: Option<&str>) -> String {
            match value {
                Some(value) => {
                    let env_var: String = env_var.quoted(shell_quote::Bash);
                    let value: String = value.quoted(shell_quote::Bash);
                    format!("export {}={}\n", env_var, value)
                }
                None => {
                    let env_var: String = env_var.quoted(shell_quote::Bash);
                    format!("unset {}\n", env_var)
                }
            }
        }

        let mut output = String::new();
        for setting in self.snapshot()? {
            output.push_str("# ");
            output.push_str(&export(setting.env_var, setting.default.as_deref()));
            if setting.source != Source::Default {
                output.push_str(&export(setting.env_var, setting.value.as_deref()));
            }
        }
        Ok(output)
    }

    fn entry(&self, name: &str) -> Result<&Entry, SettingsError> {
        self.entries.get(name).ok_or_else(|| SettingsError::Unknown {
            name: name.to_string(),
        })
    }

    pub(crate) fn typed_entry<T: SettingValue>(
        &self,
        name: &'static str,
    ) -> Result<&Entry, SettingsError> {
        let entry = self.entry(name)?;
        if entry.type_name != std::any::type_name::<T>() {
            return Err(SettingsError::TypeMismatch {
                name,
                expected: std::any::type_name::<T>(),
            });
        }
        Ok(entry)
    }

    fn check_overridable(&self, name: &'static str) -> Result<(), SettingsError> {
        match self.entry(name)?.kind {
            Kind::EnvOnly => Err(SettingsError::EnvOnly { name }),
            Kind::Prioritized => Ok(()),
        }
    }

    /// Resolve steps 2–5 for a declared setting.
    fn resolve_entry(
        &self,
        name: &'static str,
        entry: &Entry,
    ) -> Result<Resolved, SettingsError> {
        match entry.kind {
            Kind::Prioritized => {
                let overrides = self
                    .overrides
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(value) = overrides.get(name) {
                    return Ok(Resolved {
                        value: value.cloned(),
                        source: Source::Override,
                    });
                }
                drop(overrides);
                self.resolve_from_env(name, entry)
            }
            Kind::EnvOnly => {
                if let Some(frozen) = entry.frozen.get() {
                    return Ok(Resolved {
                        value: frozen.value.cloned(),
                        source: frozen.source,
                    });
                }
                // Racing first accesses compute the same value; the
                // first one to land is kept.
                let resolved = self.resolve_from_env(name, entry)?;
                let frozen = entry.frozen.get_or_init(|| resolved);
                tracing::debug!(
                    "resolved env-only setting {} = {:?} from {:?}",
                    name,
                    frozen.value.to_env(),
                    frozen.source
                );
                Ok(Resolved {
                    value: frozen.value.cloned(),
                    source: frozen.source,
                })
            }
        }
    }

    /// Resolve steps 3–5: environment, test default, default.
    fn resolve_from_env(
        &self,
        name: &'static str,
        entry: &Entry,
    ) -> Result<Resolved, SettingsError> {
        let raw = match env::var(entry.env_var) {
            Ok(raw) => raw,
            Err(VarError::NotPresent) => {
                return Ok(match (&entry.test_default, self.test_mode) {
                    (Some(test_default), true) => Resolved {
                        value: test_default.cloned(),
                        source: Source::TestDefault,
                    },
                    _ => Resolved {
                        value: entry.default.cloned(),
                        source: Source::Default,
                    },
                });
            }
            Err(VarError::NotUnicode(raw)) => {
                let raw = raw.to_string_lossy().into_owned();
                tracing::error!(
                    "setting {} cannot be read from ${}: value {:?} is not valid unicode",
                    name,
                    entry.env_var,
                    raw
                );
                return Err(SettingsError::Conversion {
                    name,
                    env_var: entry.env_var,
                    raw,
                    source: anyhow::anyhow!("not valid unicode"),
                });
            }
        };

        match (entry.convert)(&raw) {
            Ok(value) => Ok(Resolved {
                value,
                source: Source::Env,
            }),
            Err(source) => {
                tracing::error!(
                    "failed to convert setting {} ({}) from value \"{}\" in ${}: {}",
                    name,
                    entry.type_name,
                    raw,
                    entry.env_var,
                    source
                );
                Err(SettingsError::Conversion {
                    name,
                    env_var: entry.env_var,
                    raw,
                    source,
                })
            }
        }
    }

    /// Swap the stored override for a prioritized setting, returning
    /// the previous one. Used by scoped test overrides.
    pub(crate) fn replace_override(
        &self,
        name: &'static str,
        value: Option<Box<dyn ErasedValue>>,
    ) -> Result<Option<Box<dyn ErasedValue>>, SettingsError> {
        self.check_overridable(name)?;
        let mut overrides = self
            .overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(match value {
            Some(value) => overrides.insert(name, value),
            None => overrides.remove(name),
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("test_mode", &self.test_mode)
            .field("settings", &self.order)
            .finish()
    }
}
