/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Conversions from raw environment strings to typed setting values.

use std::fmt::Debug;
use std::num::ParseIntError;
use std::str::FromStr;

/// Parse a boolean setting.
///
/// Accepts `1`/`0`, `true`/`false`, `yes`/`no` and `on`/`off`,
/// case-insensitively.
/// Every other spelling is an error; there is no fallback.
pub fn convert_bool(raw: &str) -> Result<bool, anyhow::Error> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("cannot convert {:?} to a boolean", raw)),
    }
}

/// Parse a base-10 integer setting. Surrounding whitespace is ignored;
/// out-of-range values are rejected rather than wrapped.
pub fn convert_int<T>(raw: &str) -> Result<T, anyhow::Error>
where
    T: FromStr<Err = ParseIntError>,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("cannot convert {:?} to an integer: {}", raw, e))
}

/// Use the raw string verbatim.
pub fn convert_str(raw: &str) -> Result<String, anyhow::Error> {
    Ok(raw.to_string())
}

/// Use the raw string verbatim for a nullable string setting. A
/// present-but-empty variable yields `Some("")`, not `None`.
pub fn convert_optional_str(raw: &str) -> Result<Option<String>, anyhow::Error> {
    Ok(Some(raw.to_string()))
}

/// A value type that a setting may hold.
///
/// `parse` is the conversion used when a declaration does not supply
/// its own; `to_env` is its inverse, used when rendering effective
/// values (`None` for a null value).
pub trait SettingValue: Clone + Debug + Send + Sync + 'static {
    /// Convert a raw environment string.
    fn parse(raw: &str) -> Result<Self, anyhow::Error>;

    /// Render the value as it would appear in the environment.
    fn to_env(&self) -> Option<String>;
}

impl SettingValue for bool {
    fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        convert_bool(raw)
    }

    fn to_env(&self) -> Option<String> {
        Some(if *self { "1" } else { "0" }.to_string())
    }
}

impl SettingValue for String {
    fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        convert_str(raw)
    }

    fn to_env(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl SettingValue for Option<String> {
    fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        convert_optional_str(raw)
    }

    fn to_env(&self) -> Option<String> {
        self.clone()
    }
}

macro_rules! impl_int_setting_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl SettingValue for $t {
                fn parse(raw: &str) -> Result<Self, anyhow::Error> {
                    convert_int(raw)
                }

                fn to_env(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }

            impl SettingValue for Option<$t> {
                fn parse(raw: &str) -> Result<Self, anyhow::Error> {
                    convert_int(raw).map(Some)
                }

                fn to_env(&self) -> Option<String> {
                    self.map(|v| v.to_string())
                }
            }
        )*
    };
}

impl_int_setting_value!(i32, i64, u32, u64, usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_bool_accepts_conventional_spellings() {
        for raw in ["1", "true", "TRUE", "True", "yes", "YES", "on", "ON"] {
            assert!(convert_bool(raw).unwrap(), "{raw} should be true");
        }
        for raw in ["0", "false", "FALSE", "False", "no", "No", "off", "Off"] {
            assert!(!convert_bool(raw).unwrap(), "{raw} should be false");
        }
    }

    #[test]
    fn test_convert_bool_rejects_everything_else() {
        for raw in ["", "2", "truthy", "y", "onn", " true", "nope"] {
            let err = convert_bool(raw).unwrap_err();
            assert!(err.to_string().contains("boolean"), "{err}");
        }
    }

    #[test]
    fn test_convert_int() {
        assert_eq!(convert_int::<usize>("42").unwrap(), 42);
        assert_eq!(convert_int::<i64>(" -7 ").unwrap(), -7);
        assert!(convert_int::<usize>("abc").is_err());
        assert!(convert_int::<usize>("4.5").is_err());
        assert!(convert_int::<usize>("").is_err());
        // Never wraps.
        assert!(convert_int::<usize>("-1").is_err());
        assert!(convert_int::<u32>("4294967296").is_err());
    }

    #[test]
    fn test_optional_values() {
        assert_eq!(
            <Option<String>>::parse("").unwrap(),
            Some(String::new()),
            "an empty variable is still a value"
        );
        assert_eq!(<Option<u64>>::parse("12").unwrap(), Some(12));
        assert!(<Option<u64>>::parse("twelve").is_err());
        assert_eq!(None::<String>.to_env(), None);
        assert_eq!(Some(3usize).to_env(), Some("3".to_string()));
    }

    #[test]
    fn test_to_env_inverts_parse() {
        assert_eq!(true.to_env().as_deref(), Some("1"));
        assert_eq!(false.to_env().as_deref(), Some("0"));
        assert_eq!(bool::parse(&true.to_env().unwrap()).unwrap(), true);
        assert_eq!(usize::parse(&65536usize.to_env().unwrap()).unwrap(), 65536);
    }
}
