use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::{Display as StrumDisplay, EnumString};
use thiserror::Error;

/// Errors from typed PIXIT reads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PixitError {
    #[error("PIXIT parameter `{key}` is not set")]
    MissingKey { key: String },
    #[error("PIXIT parameter `{key}` is `{value}`, expected TRUE or FALSE")]
    NotABool { key: String, value: String },
    #[error("PIXIT parameter `{key}` is `{value}`, expected a millisecond count")]
    NotADuration { key: String, value: String },
    #[error("PIXIT parameter `{key}` is `{value}`, expected hex digits")]
    NotHex { key: String, value: String },
}

/// Profiles the bridge ships PIXIT defaults for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    StrumDisplay,
    EnumString,
    SerializeDisplay,
    DeserializeFromStr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Profile {
    Gap,
    Mesh,
}

/// Tester parameters for one profile, string-typed on the wire and typed
/// on read.
///
/// Seeded with the profile's defaults; individual values can be overridden
/// before a run and a few are written back during it (the IUT's own address
/// lands in `TSPX_bd_addr_iut` after the controller-info read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PixitStore {
    profile: Profile,
    values: IndexMap<String, String>,
}

impl PixitStore {
    /// Creates a store seeded with `profile`'s defaults.
    #[must_use]
    pub fn for_profile(profile: Profile) -> Self {
        let mut store = Self {
            profile,
            values: IndexMap::new(),
        };
        for (key, value) in defaults(profile) {
            store.set(*key, *value);
        }
        store
    }

    #[must_use]
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Raw string read.
    ///
    /// # Errors
    ///
    /// Returns [`PixitError::MissingKey`] for parameters that were never
    /// seeded or set.
    pub fn get(&self, key: &str) -> Result<&str, PixitError> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PixitError::MissingKey {
                key: key.to_owned(),
            })
    }

    /// Sets or overrides one parameter.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Reads a `TRUE`/`FALSE` parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PixitError::NotABool`] for any other value.
    pub fn get_bool(&self, key: &str) -> Result<bool, PixitError> {
        match self.get(key)? {
            "TRUE" => Ok(true),
            "FALSE" => Ok(false),
            other => Err(PixitError::NotABool {
                key: key.to_owned(),
                value: other.to_owned(),
            }),
        }
    }

    /// Reads a millisecond-count parameter as a [`Duration`].
    ///
    /// # Errors
    ///
    /// Returns [`PixitError::NotADuration`] when the value is not a decimal
    /// number.
    pub fn get_duration_ms(&self, key: &str) -> Result<Duration, PixitError> {
        let value = self.get(key)?;
        value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| PixitError::NotADuration {
                key: key.to_owned(),
                value: value.to_owned(),
            })
    }

    /// Reads a hex-blob parameter.
    ///
    /// # Errors
    ///
    /// Returns [`PixitError::NotHex`] when the value is not an even run of
    /// hex digits.
    pub fn get_hex(&self, key: &str) -> Result<Vec<u8>, PixitError> {
        let value = self.get(key)?;
        hex::decode(value).map_err(|_| PixitError::NotHex {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    /// Parameters in seeding order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Shared handle to one role's [`PixitStore`].
///
/// Handlers read parameters through `with`; the session writes the IUT's
/// address back after bootstrap. The lock is scoped to the closure.
#[derive(Debug, Clone)]
pub struct SharedPixit {
    inner: Arc<Mutex<PixitStore>>,
}

impl SharedPixit {
    #[must_use]
    pub fn new(store: PixitStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Runs `operation` with exclusive access to the store.
    pub fn with<T>(&self, operation: impl FnOnce(&mut PixitStore) -> T) -> T {
        let mut guard = lock(&self.inner);
        operation(&mut guard)
    }

    /// Snapshot for rendering.
    #[must_use]
    pub fn snapshot(&self) -> PixitStore {
        self.with(|store| store.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared baseline every profile starts from.
const COMMON_DEFAULTS: &[(&str, &str)] = &[
    ("TSPX_bd_addr_iut", "DEADBEEFDEAD"),
    ("TSPX_time_guard", "300000"),
    ("TSPX_use_implicit_send", "TRUE"),
    ("TSPX_mtu_size", "23"),
    ("TSPX_delete_link_key", "TRUE"),
    ("TSPX_delete_ltk", "TRUE"),
    ("TSPX_security_enabled", "FALSE"),
    ("TSPX_scan_interval", "30"),
    ("TSPX_scan_window", "30"),
    ("TSPX_scan_filter", "00"),
    ("TSPX_advertising_interval_min", "160"),
    ("TSPX_advertising_interval_max", "160"),
];

const MESH_DEFAULTS: &[(&str, &str)] = &[
    ("TSPX_tester_OOB_information", "F87F"),
    ("TSPX_device_uuid", "00000000000000000000000000000000"),
    ("TSPX_use_pb_gatt_bearer", "FALSE"),
    ("TSPX_enable_IUT_provisioner", "FALSE"),
];

fn defaults(profile: Profile) -> impl Iterator<Item = &'static (&'static str, &'static str)> {
    let extra = match profile {
        Profile::Gap => &[][..],
        Profile::Mesh => MESH_DEFAULTS,
    };
    COMMON_DEFAULTS.iter().chain(extra)
}
