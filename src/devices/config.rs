//! Persistent typed configuration parameters.
//!
//! Parameters are registered into a [`ConfigRegistry`] during start-up
//! and frozen by [`ConfigRegistry::init`], which loads the persisted
//! pool and yields the runtime [`ConfigStore`]. Registration after
//! init is unrepresentable: the registry is consumed.
//!
//! The NVM image is three fixed sections: a CRC-32 hash of the
//! concatenated parameter names (any change to the registered set
//! invalidates the pool), a CRC-32 of the value pool, and the pool
//! itself as little-endian `f32` words in registration order.

use core::cell::RefCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::hal::storage::ConfigBackend;
use crate::utilities::crc::Crc32;

/// Capacity of the registry.
pub const MAX_PARAMS: usize = 40;
/// Longest accepted parameter name.
pub const MAX_NAME_LENGTH: usize = 92;

const OFFSET_LAYOUT_HASH: usize = 0;
const OFFSET_VALUE_CRC: usize = 4;
const OFFSET_VALUES: usize = 8;

/// Save repeats the whole erase-and-write sequence this many times
/// before giving up.
const SAVE_ATTEMPTS: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamKind {
    Bool,
    Int,
    Float,
}

/// Immutable registration record. Runtime values are always carried as
/// `f32`; integer parameters must quantise exactly.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigParam {
    pub name: &'static str,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    pub kind: ParamKind,
}

/// Narrowest machine representation bracketing a parameter's declared
/// range. Checked unsigned first, then signed, then float; order
/// matters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ValueWidth {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
}

impl ConfigParam {
    pub fn is_valid_value(&self, value: f32) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.kind {
            ParamKind::Bool => value == 0.0 || value == 1.0,
            ParamKind::Int => {
                let truncated = value as i64;
                value == truncated as f32
                    && truncated.unsigned_abs() < (1 << 24)
                    && value >= self.min
                    && value <= self.max
            }
            ParamKind::Float => value >= self.min && value <= self.max,
        }
    }

    pub fn value_width(&self) -> ValueWidth {
        if self.kind == ParamKind::Float {
            return ValueWidth::F32;
        }
        let bracket =
            |low: f64, high: f64| f64::from(self.min) >= low && f64::from(self.max) <= high;
        if bracket(0.0, f64::from(u8::MAX)) {
            ValueWidth::U8
        } else if bracket(0.0, f64::from(u16::MAX)) {
            ValueWidth::U16
        } else if bracket(0.0, f64::from(u32::MAX)) {
            ValueWidth::U32
        } else if bracket(0.0, u64::MAX as f64) {
            ValueWidth::U64
        } else if bracket(f64::from(i8::MIN), f64::from(i8::MAX)) {
            ValueWidth::I8
        } else if bracket(f64::from(i16::MIN), f64::from(i16::MAX)) {
            ValueWidth::I16
        } else if bracket(f64::from(i32::MIN), f64::from(i32::MAX)) {
            ValueWidth::I32
        } else if bracket(i64::MIN as f64, i64::MAX as f64) {
            ValueWidth::I64
        } else {
            ValueWidth::F32
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    NotFound,
    InvalidArgument,
    InvalidName,
    DuplicateName,
    InvalidDefault,
    RegistryFull,
    Storage,
}

/// Outcome of loading the persisted pool during init.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitOutcome {
    /// Values restored from storage (individually invalid ones reset).
    Restored,
    /// The registered set changed since the pool was saved; defaults
    /// installed.
    LayoutMismatch,
    /// The pool failed its checksum; defaults installed.
    CrcMismatch,
    /// Storage could not be read; defaults installed.
    StorageError,
}

/// Conversion between a typed parameter and its stored `f32` form.
pub trait ParamValue: Copy {
    fn from_raw(raw: f32) -> Self;
    fn into_raw(self) -> f32;
}

impl ParamValue for f32 {
    fn from_raw(raw: f32) -> Self { raw }
    fn into_raw(self) -> f32 { self }
}

impl ParamValue for i32 {
    fn from_raw(raw: f32) -> Self { raw as i32 }
    fn into_raw(self) -> f32 { self as f32 }
}

impl ParamValue for bool {
    fn from_raw(raw: f32) -> Self { raw > 1e-6 }
    fn into_raw(self) -> f32 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

/// Typed handle to a registered parameter.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Param<T: ParamValue> {
    name: &'static str,
    default: f32,
    min: f32,
    max: f32,
    _value: PhantomData<T>,
}

impl<T: ParamValue> Param<T> {
    pub fn name(&self) -> &'static str { self.name }

    pub fn default(&self) -> T { T::from_raw(self.default) }

    pub fn min(&self) -> T { T::from_raw(self.min) }

    pub fn max(&self) -> T { T::from_raw(self.max) }

    pub fn get<B, M, const N: usize>(&self, store: &ConfigStore<B, M, N>) -> T
    where
        B: ConfigBackend,
        M: RawMutex,
    {
        T::from_raw(store.get(self.name))
    }

    pub fn set<B, M, const N: usize>(
        &self,
        store: &ConfigStore<B, M, N>,
        value: T,
    ) -> Result<(), ConfigError>
    where
        B: ConfigBackend,
        M: RawMutex,
    {
        store.set(self.name, value.into_raw())
    }

    pub fn set_and_save<B, M, const N: usize>(
        &self,
        store: &ConfigStore<B, M, N>,
        value: T,
    ) -> Result<(), ConfigError>
    where
        B: ConfigBackend,
        M: RawMutex,
    {
        self.set(store, value)?;
        store.save()
    }

    pub fn is_min<B, M, const N: usize>(&self, store: &ConfigStore<B, M, N>) -> bool
    where
        B: ConfigBackend,
        M: RawMutex,
    {
        store.get(self.name) <= self.min
    }

    pub fn is_max<B, M, const N: usize>(&self, store: &ConfigStore<B, M, N>) -> bool
    where
        B: ConfigBackend,
        M: RawMutex,
    {
        store.get(self.name) >= self.max
    }
}

/// Registration-phase collection of parameters. Consumed by
/// [`ConfigRegistry::init`], after which the set is frozen.
pub struct ConfigRegistry<const N: usize = MAX_PARAMS> {
    params: Vec<ConfigParam, N>,
}

impl<const N: usize> ConfigRegistry<N> {
    pub const fn new() -> Self { ConfigRegistry { params: Vec::new() } }

    pub fn register(&mut self, param: ConfigParam) -> Result<(), ConfigError> {
        if param.name.is_empty() || param.name.len() > MAX_NAME_LENGTH {
            return Err(ConfigError::InvalidName);
        }
        if self.params.iter().any(|p| p.name == param.name) {
            return Err(ConfigError::DuplicateName);
        }
        if !param.is_valid_value(param.default) {
            return Err(ConfigError::InvalidDefault);
        }
        self.params.push(param).map_err(|_| ConfigError::RegistryFull)
    }

    pub fn register_float(
        &mut self,
        name: &'static str,
        default: f32,
        min: f32,
        max: f32,
    ) -> Result<Param<f32>, ConfigError> {
        self.register(ConfigParam { name, default, min, max, kind: ParamKind::Float })?;
        Ok(Param { name, default, min, max, _value: PhantomData })
    }

    pub fn register_int(
        &mut self,
        name: &'static str,
        default: i32,
        min: i32,
        max: i32,
    ) -> Result<Param<i32>, ConfigError> {
        let (default, min, max) = (default as f32, min as f32, max as f32);
        self.register(ConfigParam { name, default, min, max, kind: ParamKind::Int })?;
        Ok(Param { name, default, min, max, _value: PhantomData })
    }

    pub fn register_bool(
        &mut self,
        name: &'static str,
        default: bool,
    ) -> Result<Param<bool>, ConfigError> {
        let default = default.into_raw();
        self.register(ConfigParam { name, default, min: 0.0, max: 1.0, kind: ParamKind::Bool })?;
        Ok(Param { name, default, min: 0.0, max: 1.0, _value: PhantomData })
    }

    /// CRC-32 over the concatenated registered names, in registration
    /// order. Any change to the set changes the hash.
    pub fn layout_hash(&self) -> u32 {
        let mut crc = Crc32::new();
        for param in &self.params {
            crc.update(param.name.as_bytes());
        }
        crc.value()
    }

    /// Freezes the registry, loads the persisted pool and hands over
    /// to the runtime store. Defaults are installed whenever the
    /// stored image cannot be trusted.
    pub fn init<B, M>(self, mut backend: B) -> (ConfigStore<B, M, N>, InitOutcome)
    where
        B: ConfigBackend,
        M: RawMutex,
    {
        let layout_hash = self.layout_hash();
        let (values, outcome) = Self::load(&self.params, layout_hash, &mut backend);
        let store = ConfigStore {
            params: self.params,
            layout_hash,
            inner: Mutex::new(RefCell::new(StoreInner { backend, values })),
            modification_counter: AtomicU32::new(0),
        };
        (store, outcome)
    }

    fn load(
        params: &Vec<ConfigParam, N>,
        layout_hash: u32,
        backend: &mut impl ConfigBackend,
    ) -> (Vec<f32, N>, InitOutcome) {
        let defaults: Vec<f32, N> = params.iter().map(|p| p.default).collect();

        let mut word = [0u8; 4];
        if backend.read(OFFSET_LAYOUT_HASH, &mut word).is_err() {
            return (defaults, InitOutcome::StorageError);
        }
        if u32::from_le_bytes(word) != layout_hash {
            return (defaults, InitOutcome::LayoutMismatch);
        }

        let mut values: Vec<f32, N> = Vec::new();
        let mut crc = Crc32::new();
        for index in 0..params.len() {
            if backend.read(OFFSET_VALUES + 4 * index, &mut word).is_err() {
                return (defaults, InitOutcome::StorageError);
            }
            crc.update(&word);
            let _ = values.push(f32::from_le_bytes(word));
        }
        if backend.read(OFFSET_VALUE_CRC, &mut word).is_err() {
            return (defaults, InitOutcome::StorageError);
        }
        if crc.value() != u32::from_le_bytes(word) {
            return (defaults, InitOutcome::CrcMismatch);
        }

        // The pool checks out; individually invalid values still fall
        // back to their defaults.
        for (param, value) in params.iter().zip(values.iter_mut()) {
            if !param.is_valid_value(*value) {
                *value = param.default;
            }
        }
        (values, InitOutcome::Restored)
    }
}

struct StoreInner<B, const N: usize> {
    backend: B,
    values: Vec<f32, N>,
}

/// Runtime parameter store with a frozen registry. Every read or
/// mutation of the pool and every backend access happens under the
/// store's own mutex; the modification counter is deliberately outside
/// it for lock-free change polling.
pub struct ConfigStore<B, M, const N: usize = MAX_PARAMS>
where
    B: ConfigBackend,
    M: RawMutex,
{
    params: Vec<ConfigParam, N>,
    layout_hash: u32,
    inner: Mutex<M, RefCell<StoreInner<B, N>>>,
    modification_counter: AtomicU32,
}

impl<B, M, const N: usize> ConfigStore<B, M, N>
where
    B: ConfigBackend,
    M: RawMutex,
{
    fn index_of(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Current value, or NaN when no such parameter exists.
    pub fn get(&self, name: &str) -> f32 {
        match self.index_of(name) {
            Some(index) => self.inner.lock(|cell| cell.borrow().values[index]),
            None => f32::NAN,
        }
    }

    pub fn set(&self, name: &str, value: f32) -> Result<(), ConfigError> {
        let index = self.index_of(name).ok_or(ConfigError::NotFound)?;
        if !self.params[index].is_valid_value(value) {
            return Err(ConfigError::InvalidArgument);
        }
        self.inner.lock(|cell| cell.borrow_mut().values[index] = value);
        self.modification_counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes the pool out. On any storage error the whole sequence is
    /// repeated from the erase, up to three attempts.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let StoreInner { backend, values } = &mut *inner;
            let mut crc = Crc32::new();
            for value in values.iter() {
                crc.update(&value.to_le_bytes());
            }
            for _ in 0..SAVE_ATTEMPTS {
                if Self::write_out(backend, self.layout_hash, crc.value(), values).is_ok() {
                    return Ok(());
                }
            }
            Err(ConfigError::Storage)
        })
    }

    fn write_out(
        backend: &mut B,
        layout_hash: u32,
        value_crc: u32,
        values: &[f32],
    ) -> Result<(), B::Error> {
        backend.erase()?;
        backend.write(OFFSET_LAYOUT_HASH, &layout_hash.to_le_bytes())?;
        backend.write(OFFSET_VALUE_CRC, &value_crc.to_le_bytes())?;
        for (index, value) in values.iter().enumerate() {
            backend.write(OFFSET_VALUES + 4 * index, &value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Erases the persisted pool and reinstalls defaults in memory.
    pub fn erase(&self) -> Result<(), ConfigError> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let StoreInner { backend, values } = &mut *inner;
            backend.erase().map_err(|_| ConfigError::Storage)?;
            for (param, value) in self.params.iter().zip(values.iter_mut()) {
                *value = param.default;
            }
            Ok(())
        })?;
        self.modification_counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Monotonic change counter, readable without taking the lock.
    pub fn modification_counter(&self) -> u32 {
        self.modification_counter.load(Ordering::Relaxed)
    }

    pub fn name_at(&self, index: usize) -> Option<&'static str> {
        self.params.get(index).map(|p| p.name)
    }

    pub fn descriptor(&self, name: &str) -> Option<ConfigParam> {
        self.index_of(name).map(|index| self.params[index])
    }

    pub fn len(&self) -> usize { self.params.len() }

    pub fn is_empty(&self) -> bool { self.params.is_empty() }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::doubles::storage::FakeStorage;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type TestStore = ConfigStore<FakeStorage, NoopRawMutex, MAX_PARAMS>;

    fn basic_registry() -> (ConfigRegistry, Param<i32>, Param<f32>) {
        let mut registry = ConfigRegistry::new();
        let foo = registry.register_int("foo", 1, -1, 1).unwrap();
        let bar = registry.register_float("bar", 72.12, -16.456, 100.0).unwrap();
        (registry, foo, bar)
    }

    #[test]
    fn values_round_trip_across_a_reboot() {
        // Given a blank device
        let (registry, foo, bar) = basic_registry();
        let backend = FakeStorage::new(256);
        let persisted = backend.share();
        let (store, outcome): (TestStore, _) = registry.init(backend);
        assert!(matches!(outcome, InitOutcome::LayoutMismatch | InitOutcome::CrcMismatch));
        assert_eq!(1, foo.get(&store));

        // When a value is changed, saved, and the device "reboots"
        foo.set(&store, 0).unwrap();
        store.save().unwrap();
        let (registry, foo, bar2) = basic_registry();
        let (store, outcome): (TestStore, _) = registry.init(persisted);

        // Then the modified value is restored and the rest default
        assert_eq!(InitOutcome::Restored, outcome);
        assert_eq!(0, foo.get(&store));
        assert!((bar2.get(&store) - bar.default()).abs() < 1e-4);
    }

    #[test]
    fn changing_the_registered_set_invalidates_the_pool() {
        let (registry, foo, _) = basic_registry();
        let backend = FakeStorage::new(256);
        let persisted = backend.share();
        let (store, _): (TestStore, _) = registry.init(backend);
        foo.set(&store, 0).unwrap();
        store.save().unwrap();

        // Same params plus one more; the layout hash must differ.
        let (mut registry, foo, _) = basic_registry();
        let baz = registry.register_bool("baz", true).unwrap();
        let (store, outcome): (TestStore, _) = registry.init(persisted);

        assert_eq!(InitOutcome::LayoutMismatch, outcome);
        assert_eq!(1, foo.get(&store));
        assert!(baz.get(&store));
    }

    #[test]
    fn registration_rejects_misuse() {
        let (mut registry, _, _) = basic_registry();
        assert_eq!(
            Err(ConfigError::DuplicateName),
            registry.register_int("foo", 0, 0, 10)
        );
        assert_eq!(Err(ConfigError::InvalidName), registry.register_bool("", true));
        // Default outside its own range
        assert_eq!(
            Err(ConfigError::InvalidDefault),
            registry.register_int("bad-default", 5, 0, 3)
        );
        let long_name: &'static str =
            Box::leak(String::from_utf8(vec![b'x'; MAX_NAME_LENGTH + 1]).unwrap().into_boxed_str());
        assert_eq!(Err(ConfigError::InvalidName), registry.register_bool(long_name, false));
    }

    #[test]
    fn set_enforces_kind_and_range() {
        let (registry, _, _) = basic_registry();
        let (store, _): (TestStore, _) = registry.init(FakeStorage::new(256));

        assert_eq!(Err(ConfigError::NotFound), store.set("nonexistent", 0.0));
        assert!(store.get("nonexistent").is_nan());
        // Integers must quantise exactly
        assert_eq!(Err(ConfigError::InvalidArgument), store.set("foo", 0.5));
        assert_eq!(Err(ConfigError::InvalidArgument), store.set("foo", 2.0));
        assert_eq!(Err(ConfigError::InvalidArgument), store.set("bar", f32::NAN));
        assert_eq!(Err(ConfigError::InvalidArgument), store.set("bar", 100.5));
        assert_eq!(Ok(()), store.set("bar", -16.456));
    }

    #[test]
    fn modification_counter_tracks_successful_changes_only() {
        let (registry, foo, _) = basic_registry();
        let (store, _): (TestStore, _) = registry.init(FakeStorage::new(256));

        let before = store.modification_counter();
        let _ = store.set("foo", 0.5);
        assert_eq!(before, store.modification_counter());
        foo.set(&store, -1).unwrap();
        assert_eq!(before + 1, store.modification_counter());
        store.erase().unwrap();
        assert_eq!(before + 2, store.modification_counter());
        assert_eq!(1, foo.get(&store));
    }

    #[test]
    fn save_retries_from_the_erase_and_eventually_gives_up() {
        let (registry, _, _) = basic_registry();
        let mut backend = FakeStorage::new(256);
        backend.erase_faults = 2;
        let (store, _): (TestStore, _) = registry.init(backend);
        // Two faults are absorbed by the three attempts
        assert_eq!(Ok(()), store.save());

        let (registry, _, _) = basic_registry();
        let mut backend = FakeStorage::new(256);
        backend.erase_faults = 3;
        let (store, _): (TestStore, _) = registry.init(backend);
        assert_eq!(Err(ConfigError::Storage), store.save());
    }

    #[test]
    fn individually_invalid_restored_values_fall_back_to_defaults() {
        let (registry, foo, _) = basic_registry();
        let layout_hash = registry.layout_hash();

        // Hand-craft a pool with a correct CRC but an out-of-range foo
        let mut backend = FakeStorage::new(256);
        let pool: [f32; 2] = [5.0, 10.0];
        let mut crc = Crc32::new();
        let mut image = Vec::<u8, 64>::new();
        image.extend_from_slice(&layout_hash.to_le_bytes()).unwrap();
        for value in pool {
            crc.update(&value.to_le_bytes());
        }
        image.extend_from_slice(&crc.value().to_le_bytes()).unwrap();
        for value in pool {
            image.extend_from_slice(&value.to_le_bytes()).unwrap();
        }
        backend.program(0, &image);

        let (store, outcome): (TestStore, _) = registry.init(backend);
        assert_eq!(InitOutcome::Restored, outcome);
        assert_eq!(1, foo.get(&store));
        assert!((store.get("bar") - 10.0).abs() < 1e-6);
    }

    #[test]
    fn typed_handles_expose_their_metadata() {
        let (mut registry, foo, bar) = basic_registry();
        let baz = registry.register_bool("baz", true).unwrap();
        let (store, _): (TestStore, _) = registry.init(FakeStorage::new(256));

        assert_eq!(1, foo.default());
        assert_eq!(-1, foo.min());
        assert_eq!(1, foo.max());
        assert!(baz.get(&store));
        baz.set(&store, false).unwrap();
        assert!(!baz.get(&store));

        assert!(!bar.is_min(&store));
        bar.set(&store, -16.456).unwrap();
        assert!(bar.is_min(&store));
        bar.set_and_save(&store, 100.0).unwrap();
        assert!(bar.is_max(&store));
    }

    #[test]
    fn width_deduction_prefers_the_narrowest_bracket() {
        let param = |min: f32, max: f32, kind: ParamKind| ConfigParam {
            name: "p",
            default: if kind == ParamKind::Float { min } else { 0.0f32.max(min) },
            min,
            max,
            kind,
        };

        assert_eq!(ValueWidth::U8, param(0.0, 200.0, ParamKind::Int).value_width());
        assert_eq!(ValueWidth::U8, param(0.0, 1.0, ParamKind::Bool).value_width());
        assert_eq!(ValueWidth::U16, param(0.0, 60_000.0, ParamKind::Int).value_width());
        assert_eq!(ValueWidth::U32, param(0.0, 70_000.0, ParamKind::Int).value_width());
        assert_eq!(ValueWidth::I8, param(-1.0, 1.0, ParamKind::Int).value_width());
        assert_eq!(ValueWidth::I16, param(-300.0, 300.0, ParamKind::Int).value_width());
        assert_eq!(ValueWidth::I32, param(-70_000.0, 70_000.0, ParamKind::Int).value_width());
        assert_eq!(ValueWidth::F32, param(-16.456, 100.0, ParamKind::Float).value_width());
    }

    #[test]
    fn store_enumerates_its_frozen_registry() {
        let (registry, _, _) = basic_registry();
        let (store, _): (TestStore, _) = registry.init(FakeStorage::new(256));

        assert_eq!(2, store.len());
        assert_eq!(Some("foo"), store.name_at(0));
        assert_eq!(Some("bar"), store.name_at(1));
        assert_eq!(None, store.name_at(2));
        let descriptor = store.descriptor("bar").unwrap();
        assert_eq!(ParamKind::Float, descriptor.kind);
        assert_eq!(ValueWidth::F32, descriptor.value_width());
        assert!(store.descriptor("nope").is_none());
    }
}
