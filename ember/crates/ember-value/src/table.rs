//! Hybrid array + hash table.
//!
//! Integer keys in the dense range `1..=array.len()` live in `array`;
//! everything else (non-sequential integers, strings, booleans, table and
//! closure references used as keys) lives in `hash`. The split exists
//! purely as a density optimization: `array` avoids hashing for the
//! overwhelmingly common case of sequential numeric indexing, matching
//! `ArrayAppend`/`ArrayConvertFromHash` behavior from the reference
//! implementation's table tests.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use ember_gc::{Gc, GcHeader, Trace};
use rustc_hash::FxHashMap;

use crate::error::{Result, ValueError};
use crate::value::{trace_value, Value};

/// A key normalized for storage: integers that fit the array part are kept
/// distinct from the general hash key space so [`Table::array_index`] can
/// recognize them without re-deriving it from a `Value::Number`.
enum NormalizedKey {
    ArrayIndex(usize),
    General(Value),
}

pub struct Table {
    /// 1-based conceptually; stored 0-based. `Value::Nil` marks a hole.
    array: RefCell<Vec<Value>>,
    hash: RefCell<FxHashMap<HashKey, Value>>,
    metatable: Cell<Option<Gc<Table>>>,
}

/// Wrapper giving [`Value`] the `Eq`/`Hash` a `HashMap` key needs, while
/// keeping `Value` itself free to carry `f64` without forcing callers to
/// think about hashability everywhere.
#[derive(Clone)]
struct HashKey(Value);

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HashKey {}
impl std::hash::Hash for HashKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            array: RefCell::new(Vec::new()),
            hash: RefCell::new(FxHashMap::default()),
            metatable: Cell::new(None),
        }
    }

    pub fn with_capacity(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: RefCell::new(Vec::with_capacity(array_hint)),
            hash: RefCell::new(FxHashMap::with_capacity_and_hasher(
                hash_hint,
                Default::default(),
            )),
            metatable: Cell::new(None),
        }
    }

    pub fn metatable(&self) -> Option<Gc<Table>> {
        self.metatable.get()
    }

    pub fn set_metatable(&self, mt: Option<Gc<Table>>) {
        self.metatable.set(mt);
    }

    fn normalize(key: &Value) -> Result<NormalizedKey> {
        match key {
            Value::Nil => Err(ValueError::NilKey),
            Value::Number(n) if n.is_nan() => Err(ValueError::NaNKey),
            Value::Number(n) => {
                let normalized = if *n == 0.0 { 0.0 } else { *n };
                if normalized.fract() == 0.0
                    && normalized >= 1.0
                    && normalized <= i32::MAX as f64
                {
                    Ok(NormalizedKey::ArrayIndex(normalized as usize))
                } else {
                    Ok(NormalizedKey::General(Value::Number(normalized)))
                }
            }
            other => Ok(NormalizedKey::General(*other)),
        }
    }

    /// Raw (no metamethod) lookup.
    pub fn get(&self, key: &Value) -> Value {
        match Self::normalize(key) {
            Ok(NormalizedKey::ArrayIndex(i)) => {
                let array = self.array.borrow();
                if i >= 1 && i <= array.len() {
                    array[i - 1]
                } else {
                    self.hash
                        .borrow()
                        .get(&HashKey(Value::Number(i as f64)))
                        .copied()
                        .unwrap_or(Value::Nil)
                }
            }
            Ok(NormalizedKey::General(k)) => self
                .hash
                .borrow()
                .get(&HashKey(k))
                .copied()
                .unwrap_or(Value::Nil),
            Err(_) => Value::Nil,
        }
    }

    /// Raw (no metamethod) assignment. Assigning `Nil` deletes the key.
    pub fn set(&self, key: Value, value: Value) -> Result<()> {
        let normalized = Self::normalize(&key)?;
        match normalized {
            NormalizedKey::ArrayIndex(i) => self.set_array_index(i, value),
            NormalizedKey::General(k) => {
                if value.is_nil() {
                    self.hash.borrow_mut().remove(&HashKey(k));
                } else {
                    self.hash.borrow_mut().insert(HashKey(k), value);
                    self.maybe_rehash();
                }
            }
        }
        Ok(())
    }

    fn set_array_index(&self, i: usize, value: Value) {
        let mut array = self.array.borrow_mut();
        if i >= 1 && i <= array.len() {
            array[i - 1] = value;
            return;
        }
        if i == array.len() + 1 && !value.is_nil() {
            array.push(value);
            drop(array);
            self.migrate_from_hash_if_contiguous();
            return;
        }
        drop(array);
        if value.is_nil() {
            self.hash.borrow_mut().remove(&HashKey(Value::Number(i as f64)));
        } else {
            self.hash
                .borrow_mut()
                .insert(HashKey(Value::Number(i as f64)), value);
            self.maybe_rehash();
        }
    }

    /// After appending to the array part, pulls in any now-contiguous
    /// integer keys that were previously stranded in the hash part.
    fn migrate_from_hash_if_contiguous(&self) {
        loop {
            let next_index = self.array.borrow().len() + 1;
            let key = HashKey(Value::Number(next_index as f64));
            let value = self.hash.borrow_mut().remove(&key);
            match value {
                Some(v) => self.array.borrow_mut().push(v),
                None => break,
            }
        }
    }

    /// Load factor across both parts exceeding the threshold triggers a
    /// full rehash that chooses the array size maximizing occupancy, per
    /// the data model's rehash policy.
    pub fn maybe_rehash(&self) {
        let hash_len = self.hash.borrow().len();
        let array_cap = self.array.borrow().capacity().max(1);
        if (hash_len as f64) < array_cap as f64 {
            return;
        }
        self.rehash();
    }

    fn rehash(&self) {
        let mut all_pairs: Vec<(Value, Value)> = Vec::new();
        {
            let array = self.array.borrow();
            for (idx, v) in array.iter().enumerate() {
                if !v.is_nil() {
                    all_pairs.push((Value::Number((idx + 1) as f64), *v));
                }
            }
        }
        {
            let hash = self.hash.borrow();
            for (k, v) in hash.iter() {
                all_pairs.push((k.0, *v));
            }
        }

        let mut counts_by_log2: [usize; 32] = [0; 32];
        for (k, _) in &all_pairs {
            if let Value::Number(n) = k {
                if n.fract() == 0.0 && *n >= 1.0 && *n <= i32::MAX as f64 {
                    let i = *n as u64;
                    let bucket = 64 - i.leading_zeros() as usize;
                    if bucket < 32 {
                        counts_by_log2[bucket] += 1;
                    }
                }
            }
        }

        let mut best_size = 0usize;
        let mut cumulative = 0usize;
        for log2 in 0..32 {
            cumulative += counts_by_log2[log2];
            let size = 1usize << log2;
            if cumulative * 2 > size {
                best_size = size;
            }
        }

        let mut new_array = vec![Value::Nil; best_size];
        let mut new_hash = FxHashMap::default();
        for (k, v) in all_pairs {
            if let Value::Number(n) = k {
                if n.fract() == 0.0 && n >= 1.0 && (n as usize) <= best_size {
                    new_array[(n as usize) - 1] = v;
                    continue;
                }
            }
            new_hash.insert(HashKey(k), v);
        }

        *self.array.borrow_mut() = new_array;
        *self.hash.borrow_mut() = new_hash;
    }

    /// A boundary `n` such that `t[n] != nil` and `t[n+1] == nil`, found by
    /// binary search within the array part when possible.
    pub fn length(&self) -> usize {
        let array = self.array.borrow();
        if array.is_empty() || array.last().map(|v| v.is_nil()).unwrap_or(true) {
            if array.is_empty() {
                return self.length_from_hash(0);
            }
            let mut lo = 0usize;
            let mut hi = array.len();
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        self.length_from_hash(array.len())
    }

    fn length_from_hash(&self, base: usize) -> usize {
        let hash = self.hash.borrow();
        let mut n = base;
        while hash.contains_key(&HashKey(Value::Number((n + 1) as f64))) {
            n += 1;
        }
        n
    }

    /// Stateless iteration matching `next`: array slots first in index
    /// order, then hash entries in an unspecified but stable-between-
    /// mutations order.
    pub fn next(&self, key: &Value) -> Option<(Value, Value)> {
        let array = self.array.borrow();
        let hash = self.hash.borrow();

        let start_array_idx = match key {
            Value::Nil => 0,
            Value::Number(n) if *n >= 1.0 && n.fract() == 0.0 && (*n as usize) <= array.len() => {
                *n as usize
            }
            _ => array.len() + 1,
        };

        if start_array_idx <= array.len() {
            for i in start_array_idx..array.len() {
                if !array[i].is_nil() {
                    return Some((Value::Number((i + 1) as f64), array[i]));
                }
            }
            return hash.iter().next().map(|(k, v)| (k.0, *v));
        }

        let mut found_key = false;
        for (k, v) in hash.iter() {
            if found_key {
                return Some((k.0, *v));
            }
            if k.0 == *key {
                found_key = true;
            }
        }
        None
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace for Table {
    fn trace(&self, push: &mut dyn FnMut(NonNull<GcHeader>)) {
        for v in self.array.borrow().iter() {
            trace_value(v, push);
        }
        for (k, v) in self.hash.borrow().iter() {
            trace_value(&k.0, push);
            trace_value(v, push);
        }
        if let Some(mt) = self.metatable.get() {
            push(mt.header());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_zero_and_zero_key_alias() {
        let t = Table::new();
        t.set(Value::Number(-0.0), Value::Boolean(true)).unwrap();
        assert_eq!(t.get(&Value::Number(0.0)), Value::Boolean(true));
    }

    #[test]
    fn array_append_then_read_back() {
        let t = Table::new();
        for i in 1..=4 {
            t.set(Value::Number(i as f64), Value::Number(i as f64 * 10.0))
                .unwrap();
        }
        for i in 1..=4 {
            assert_eq!(t.get(&Value::Number(i as f64)), Value::Number(i as f64 * 10.0));
        }
    }

    #[test]
    fn out_of_order_integer_keys_migrate_into_array() {
        let t = Table::new();
        for i in [4, 5, 6, 7, 1, 2, 3] {
            t.set(Value::Number(i as f64), Value::Number(i as f64))
                .unwrap();
        }
        for i in 1..=7 {
            assert_eq!(t.get(&Value::Number(i as f64)), Value::Number(i as f64));
        }
        assert_eq!(t.get(&Value::Number(8.0)), Value::Nil);
    }

    #[test]
    fn nan_key_is_rejected() {
        let t = Table::new();
        let err = t.set(Value::Number(f64::NAN), Value::Boolean(true));
        assert!(matches!(err, Err(ValueError::NaNKey)));
    }

    #[test]
    fn assigning_nil_deletes_key() {
        let t = Table::new();
        t.set(Value::Number(1.0), Value::Boolean(true)).unwrap();
        t.set(Value::Number(1.0), Value::Nil).unwrap();
        assert_eq!(t.get(&Value::Number(1.0)), Value::Nil);
    }

    #[test]
    fn length_finds_array_boundary() {
        let t = Table::new();
        for i in 1..=5 {
            t.set(Value::Number(i as f64), Value::Number(i as f64))
                .unwrap();
        }
        assert_eq!(t.length(), 5);
    }
}
