/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The settings consumed by the cuPyNumeric runtime.

use crate::SettingsError;
use crate::convert::convert_bool;
use crate::convert::convert_int;
use crate::registry::Registry;
use crate::registry::ResolvedSetting;
use crate::setting::Setting;
use crate::setting::SettingSpec;

/// Typed handles for every runtime setting, together with the registry
/// that resolves them.
#[derive(Debug)]
pub struct RuntimeSettings {
    registry: Registry,

    pub preload_cudalibs: Setting<bool>,
    pub warn: Setting<bool>,
    pub report_coverage: Setting<bool>,
    pub report_dump_callstack: Setting<bool>,
    pub report_dump_csv: Setting<Option<String>>,
    pub numpy_compat: Setting<bool>,

    pub fast_math: Setting<bool>,
    pub min_gpu_chunk: Setting<usize>,
    pub min_cpu_chunk: Setting<usize>,
    pub min_omp_chunk: Setting<usize>,
    pub force_thunk: Setting<Option<String>>,
    pub matmul_cache_size: Setting<usize>,
}

impl RuntimeSettings {
    /// Declare all runtime settings on a fresh registry.
    pub fn new(test_mode: bool) -> Result<Self, SettingsError> {
        let mut registry = Registry::new(test_mode);

        let preload_cudalibs = registry.define(
            SettingSpec::prioritized("preload_cudalibs", "CUPYNUMERIC_PRELOAD_CUDALIBS", false)
                .convert(convert_bool)
                .help(
                    "Preload and initialize handles of all CUDA libraries (cuBLAS, cuSOLVER, \
                     etc.) used in cuPyNumeric.",
                ),
        )?;
        let warn = registry.define(
            SettingSpec::prioritized("warn", "CUPYNUMERIC_WARN", false)
                .convert(convert_bool)
                .help("Turn on warnings."),
        )?;
        let report_coverage = registry.define(
            SettingSpec::prioritized("report_coverage", "CUPYNUMERIC_REPORT_COVERAGE", false)
                .convert(convert_bool)
                .help("Print an overall percentage of cuPyNumeric coverage."),
        )?;
        let report_dump_callstack = registry.define(
            SettingSpec::prioritized(
                "report_dump_callstack",
                "CUPYNUMERIC_REPORT_DUMP_CALLSTACK",
                false,
            )
            .convert(convert_bool)
            .help("Print an overall percentage of cuPyNumeric coverage with a call stack."),
        )?;
        let report_dump_csv = registry.define(
            SettingSpec::prioritized(
                "report_dump_csv",
                "CUPYNUMERIC_REPORT_DUMP_CSV",
                None::<String>,
            )
            .help("Save a coverage report to a specified CSV file."),
        )?;
        let numpy_compat = registry.define(
            SettingSpec::prioritized("numpy_compat", "CUPYNUMERIC_NUMPY_COMPATIBILITY", false)
                .convert(convert_bool)
                .help(
                    "Issue additional tasks to match NumPy's results and behavior. Currently \
                     used by nanmin, nanmax, nanargmin and nanargmax.",
                ),
        )?;

        let fast_math = registry.define(
            SettingSpec::env_only("fast_math", "CUPYNUMERIC_FAST_MATH", false)
                .convert(convert_bool)
                .help(
                    "Enable optimized floating-point execution modes that may violate strict \
                     IEEE semantics, such as TF32 tensor cores for single-precision cuBLAS \
                     routines.",
                ),
        )?;
        let min_gpu_chunk = registry.define(
            SettingSpec::env_only("min_gpu_chunk", "CUPYNUMERIC_MIN_GPU_CHUNK", 1usize << 16)
                .test_default(2)
                .convert(convert_int)
                .help(
                    "Arrays smaller than this are handled by the eager fallback instead of \
                     being offloaded to GPUs.",
                ),
        )?;
        let min_cpu_chunk = registry.define(
            SettingSpec::env_only("min_cpu_chunk", "CUPYNUMERIC_MIN_CPU_CHUNK", 1usize << 10)
                .test_default(2)
                .convert(convert_int)
                .help(
                    "Arrays smaller than this are handled by the eager fallback instead of \
                     being offloaded to native CPU tasks.",
                ),
        )?;
        let min_omp_chunk = registry.define(
            SettingSpec::env_only("min_omp_chunk", "CUPYNUMERIC_MIN_OMP_CHUNK", 1usize << 13)
                .test_default(2)
                .convert(convert_int)
                .help(
                    "Arrays smaller than this are handled by the eager fallback instead of \
                     being offloaded to OpenMP tasks.",
                ),
        )?;
        let force_thunk = registry.define(
            SettingSpec::env_only("force_thunk", "CUPYNUMERIC_FORCE_THUNK", None::<String>)
                .test_default(Some("deferred".to_string()))
                .help(
                    "Always back arrays with the given strategy: \"deferred\" (managed by the \
                     distributed runtime) or \"eager\" (a local host array). Unset, the \
                     strategy is chosen per array.",
                ),
        )?;
        let matmul_cache_size = registry.define(
            SettingSpec::env_only(
                "matmul_cache_size",
                "CUPYNUMERIC_MATMUL_CACHE_SIZE",
                128usize << 20,
            )
            .test_default(4096)
            .convert(convert_int)
            .help(
                "Upper bound in bytes on temporary task slices during matmul. Larger \
                 computations are batched over the contracted dimension.",
            ),
        )?;

        Ok(Self {
            registry,
            preload_cudalibs,
            warn,
            report_coverage,
            report_dump_callstack,
            report_dump_csv,
            numpy_compat,
            fast_math,
            min_gpu_chunk,
            min_cpu_chunk,
            min_omp_chunk,
            force_thunk,
            matmul_cache_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolve every setting once, so that a malformed environment is
    /// reported before any of it is used.
    pub fn validate(&self) -> Result<Vec<ResolvedSetting>, SettingsError> {
        self.registry.snapshot()
    }

    pub fn preload_cudalibs(&self) -> Result<bool, SettingsError> {
        self.registry.get(self.preload_cudalibs)
    }

    pub fn warn(&self) -> Result<bool, SettingsError> {
        self.registry.get(self.warn)
    }

    pub fn report_coverage(&self) -> Result<bool, SettingsError> {
        self.registry.get(self.report_coverage)
    }

    pub fn report_dump_callstack(&self) -> Result<bool, SettingsError> {
        self.registry.get(self.report_dump_callstack)
    }

    /// Path of the CSV coverage report, if one was requested.
    pub fn report_dump_csv(&self) -> Result<Option<String>, SettingsError> {
        self.registry.get(self.report_dump_csv)
    }

    pub fn numpy_compat(&self) -> Result<bool, SettingsError> {
        self.registry.get(self.numpy_compat)
    }

    pub fn fast_math(&self) -> Result<bool, SettingsError> {
        self.registry.get(self.fast_math)
    }

    pub fn min_gpu_chunk(&self) -> Result<usize, SettingsError> {
        self.registry.get(self.min_gpu_chunk)
    }

    pub fn min_cpu_chunk(&self) -> Result<usize, SettingsError> {
        self.registry.get(self.min_cpu_chunk)
    }

    pub fn min_omp_chunk(&self) -> Result<usize, SettingsError> {
        self.registry.get(self.min_omp_chunk)
    }

    /// The array backing strategy to force, if any.
    pub fn force_thunk(&self) -> Result<Option<String>, SettingsError> {
        self.registry.get(self.force_thunk)
    }

    pub fn matmul_cache_size(&self) -> Result<usize, SettingsError> {
        self.registry.get(self.matmul_cache_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::Kind;

    const BOOL_VARS: [&str; 7] = [
        "CUPYNUMERIC_PRELOAD_CUDALIBS",
        "CUPYNUMERIC_WARN",
        "CUPYNUMERIC_REPORT_COVERAGE",
        "CUPYNUMERIC_REPORT_DUMP_CALLSTACK",
        "CUPYNUMERIC_NUMPY_COMPATIBILITY",
        "CUPYNUMERIC_FAST_MATH",
        // Not a bool; cleared alongside the others.
        "CUPYNUMERIC_REPORT_DUMP_CSV",
    ];

    const INT_VARS: [&str; 4] = [
        "CUPYNUMERIC_MIN_GPU_CHUNK",
        "CUPYNUMERIC_MIN_CPU_CHUNK",
        "CUPYNUMERIC_MIN_OMP_CHUNK",
        "CUPYNUMERIC_MATMUL_CACHE_SIZE",
    ];

    fn clear_env() {
        for var in BOOL_VARS
            .iter()
            .chain(INT_VARS.iter())
            .chain(["CUPYNUMERIC_FORCE_THUNK"].iter())
        {
            // SAFETY: callers hold `crate::global::lock()`.
            unsafe { std::env::remove_var(var) };
        }
    }

    fn bool_getters(settings: &RuntimeSettings) -> Vec<Result<bool, SettingsError>> {
        vec![
            settings.preload_cudalibs(),
            settings.warn(),
            settings.report_coverage(),
            settings.report_dump_callstack(),
            settings.numpy_compat(),
            settings.fast_math(),
        ]
    }

    fn int_getters(settings: &RuntimeSettings) -> Vec<Result<usize, SettingsError>> {
        vec![
            settings.min_gpu_chunk(),
            settings.min_cpu_chunk(),
            settings.min_omp_chunk(),
            settings.matmul_cache_size(),
        ]
    }

    #[test]
    fn test_defaults() {
        let _lock = crate::global::lock();
        clear_env();

        let settings = RuntimeSettings::new(false).unwrap();
        for value in bool_getters(&settings) {
            assert!(!value.unwrap());
        }
        assert_eq!(settings.report_dump_csv().unwrap(), None);
        assert_eq!(settings.force_thunk().unwrap(), None);
        assert_eq!(settings.min_gpu_chunk().unwrap(), 65536);
        assert_eq!(settings.min_cpu_chunk().unwrap(), 1024);
        assert_eq!(settings.min_omp_chunk().unwrap(), 8192);
        assert_eq!(settings.matmul_cache_size().unwrap(), 134217728);
    }

    #[test]
    fn test_test_defaults() {
        let _lock = crate::global::lock();
        clear_env();

        let settings = RuntimeSettings::new(true).unwrap();
        assert_eq!(settings.min_gpu_chunk().unwrap(), 2);
        assert_eq!(settings.min_cpu_chunk().unwrap(), 2);
        assert_eq!(settings.min_omp_chunk().unwrap(), 2);
        assert_eq!(settings.matmul_cache_size().unwrap(), 4096);
        assert_eq!(settings.force_thunk().unwrap().as_deref(), Some("deferred"));
        // No test default declared: the default stands.
        assert!(!settings.fast_math().unwrap());
        assert_eq!(settings.report_dump_csv().unwrap(), None);
    }

    #[test]
    fn test_bool_spellings() {
        let _lock = crate::global::lock();

        for (raw, expected) in [
            ("1", true),
            ("true", true),
            ("TRUE", true),
            ("0", false),
            ("false", false),
            ("FALSE", false),
            ("on", true),
            ("Off", false),
        ] {
            clear_env();
            for var in &BOOL_VARS[..6] {
                // SAFETY: test holds the global settings lock.
                unsafe { std::env::set_var(var, raw) };
            }
            let settings = RuntimeSettings::new(false).unwrap();
            for value in bool_getters(&settings) {
                assert_eq!(value.unwrap(), expected, "{raw}");
            }
        }

        clear_env();
        for var in &BOOL_VARS[..6] {
            // SAFETY: test holds the global settings lock.
            unsafe { std::env::set_var(var, "sometimes") };
        }
        let settings = RuntimeSettings::new(false).unwrap();
        for value in bool_getters(&settings) {
            assert!(matches!(value, Err(SettingsError::Conversion { .. })));
        }
        clear_env();
    }

    #[test]
    fn test_int_parsing() {
        let _lock = crate::global::lock();
        clear_env();

        for var in INT_VARS {
            // SAFETY: test holds the global settings lock.
            unsafe { std::env::set_var(var, "42") };
        }
        let settings = RuntimeSettings::new(true).unwrap();
        for value in int_getters(&settings) {
            assert_eq!(value.unwrap(), 42);
        }

        for var in INT_VARS {
            // SAFETY: test holds the global settings lock.
            unsafe { std::env::set_var(var, "abc") };
        }
        let settings = RuntimeSettings::new(true).unwrap();
        for value in int_getters(&settings) {
            match value {
                Err(SettingsError::Conversion { raw, .. }) => assert_eq!(raw, "abc"),
                other => panic!("expected a conversion error, got {other:?}"),
            }
        }
        assert!(settings.validate().is_err());
        clear_env();
    }

    #[test]
    fn test_override_outranks_env() {
        let _lock = crate::global::lock();
        clear_env();
        // SAFETY: test holds the global settings lock.
        unsafe { std::env::set_var("CUPYNUMERIC_WARN", "false") };

        let settings = RuntimeSettings::new(false).unwrap();
        assert!(!settings.warn().unwrap());
        settings.registry().set(settings.warn, true).unwrap();
        assert!(settings.warn().unwrap());

        settings
            .registry()
            .set(settings.report_dump_csv, Some("coverage.csv".to_string()))
            .unwrap();
        assert_eq!(
            settings.report_dump_csv().unwrap().as_deref(),
            Some("coverage.csv")
        );

        settings.registry().reset();
        assert!(!settings.warn().unwrap());
        assert_eq!(settings.report_dump_csv().unwrap(), None);
        clear_env();
    }

    #[test]
    fn test_env_only_override_rejected() {
        let _lock = crate::global::lock();
        clear_env();

        let settings = RuntimeSettings::new(false).unwrap();
        let before = settings.matmul_cache_size().unwrap();
        let err = settings
            .registry()
            .set(settings.matmul_cache_size, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            SettingsError::EnvOnly {
                name: "matmul_cache_size"
            }
        ));
        assert_eq!(settings.matmul_cache_size().unwrap(), before);
    }

    #[test]
    fn test_env_exports_in_test_mode() {
        let _lock = crate::global::lock();
        clear_env();

        let settings = RuntimeSettings::new(true).unwrap();
        let exports = settings.registry().env_exports().unwrap();
        let lines: Vec<&str> = exports.lines().collect();
        for line in [
            "# export CUPYNUMERIC_MIN_GPU_CHUNK=65536",
            "export CUPYNUMERIC_MIN_GPU_CHUNK=2",
            "export CUPYNUMERIC_MATMUL_CACHE_SIZE=4096",
            "# unset CUPYNUMERIC_FORCE_THUNK",
            "export CUPYNUMERIC_FORCE_THUNK=deferred",
        ] {
            assert!(lines.contains(&line), "missing {line:?} in:\n{exports}");
        }
        // Settings at their declared default only get the commented line.
        assert!(lines.contains(&"# export CUPYNUMERIC_WARN=0"));
        assert!(!lines.contains(&"export CUPYNUMERIC_WARN=0"));
    }

    #[test]
    fn test_declaration_table() {
        let _lock = crate::global::lock();
        clear_env();

        let settings = RuntimeSettings::new(false).unwrap();
        let snapshot = settings.validate().unwrap();
        let table: Vec<(&str, &str, Kind)> = snapshot
            .iter()
            .map(|s| (s.name, s.env_var, s.kind))
            .collect();
        assert_eq!(
            table,
            vec![
                ("preload_cudalibs", "CUPYNUMERIC_PRELOAD_CUDALIBS", Kind::Prioritized),
                ("warn", "CUPYNUMERIC_WARN", Kind::Prioritized),
                ("report_coverage", "CUPYNUMERIC_REPORT_COVERAGE", Kind::Prioritized),
                (
                    "report_dump_callstack",
                    "CUPYNUMERIC_REPORT_DUMP_CALLSTACK",
                    Kind::Prioritized
                ),
                ("report_dump_csv", "CUPYNUMERIC_REPORT_DUMP_CSV", Kind::Prioritized),
                ("numpy_compat", "CUPYNUMERIC_NUMPY_COMPATIBILITY", Kind::Prioritized),
                ("fast_math", "CUPYNUMERIC_FAST_MATH", Kind::EnvOnly),
                ("min_gpu_chunk", "CUPYNUMERIC_MIN_GPU_CHUNK", Kind::EnvOnly),
                ("min_cpu_chunk", "CUPYNUMERIC_MIN_CPU_CHUNK", Kind::EnvOnly),
                ("min_omp_chunk", "CUPYNUMERIC_MIN_OMP_CHUNK", Kind::EnvOnly),
                ("force_thunk", "CUPYNUMERIC_FORCE_THUNK", Kind::EnvOnly),
                ("matmul_cache_size", "CUPYNUMERIC_MATMUL_CACHE_SIZE", Kind::EnvOnly),
            ]
        );
        assert!(snapshot.iter().all(|s| !s.help.is_empty()));
    }
}
