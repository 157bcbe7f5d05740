//! Array keys and the array/array-entry machinery.
//!
//! An array variable owns dense storage addressed by canonical string keys
//! derived from index tuples. An array-entry variable is a named view over a
//! single key, derived from a declared prefix plus a 1-based numeric suffix
//! (`value3` views key `"2"` of the array owning prefix `value`). Entry
//! variables are materialized lazily on first reference.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical string identifying one element of a (possibly N-dimensional)
/// array variable.
///
/// 1-D keys are the 0-based index as a decimal string; N-D keys are the
/// comma-joined index tuple (`"1,2"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayKey(String);

impl ArrayKey {
    /// Key for a 1-D index.
    pub fn from_index(index: usize) -> Self {
        ArrayKey(index.to_string())
    }

    /// Key for an N-dimensional index tuple.
    pub fn from_indices(indices: &[usize]) -> Self {
        let parts: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        ArrayKey(parts.join(","))
    }

    /// The raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the key back into an index tuple.
    ///
    /// Returns `None` for keys that were not produced by `from_index` /
    /// `from_indices`.
    pub fn indices(&self) -> Option<Vec<usize>> {
        self.0
            .split(',')
            .map(|part| part.parse::<usize>().ok())
            .collect()
    }

    /// The flat offset of this key into dense storage of the given size.
    ///
    /// Row-major: the last dimension varies fastest. Returns `None` when the
    /// key is out of bounds or has the wrong rank.
    pub fn flat_offset(&self, size: &[usize]) -> Option<usize> {
        let indices = self.indices()?;
        if indices.len() != size.len() {
            return None;
        }
        let mut offset = 0;
        for (&idx, &dim) in indices.iter().zip(size.iter()) {
            if idx >= dim {
                return None;
            }
            offset = offset * dim + idx;
        }
        Some(offset)
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArrayKey {
    fn from(s: &str) -> Self {
        ArrayKey(s.to_string())
    }
}

/// Total number of elements of an array of the given size.
///
/// An array with no dimensions (a scalar misuse) has zero elements; a
/// zero-length dimension makes the whole array empty.
pub fn total_keys(size: &[usize]) -> usize {
    if size.is_empty() {
        0
    } else {
        size.iter().product()
    }
}

/// All keys of an array of the given size, in row-major order.
pub fn all_array_keys(size: &[usize]) -> Vec<ArrayKey> {
    let count = total_keys(size);
    let mut keys = Vec::with_capacity(count);
    if count == 0 {
        return keys;
    }
    let mut indices = vec![0usize; size.len()];
    loop {
        keys.push(ArrayKey::from_indices(&indices));
        // Odometer increment, last dimension fastest.
        let mut dim = size.len();
        loop {
            if dim == 0 {
                return keys;
            }
            dim -= 1;
            indices[dim] += 1;
            if indices[dim] < size[dim] {
                break;
            }
            indices[dim] = 0;
        }
    }
}

/// Derive the entry-variable name owning a given 1-D key.
///
/// Entry names are 1-based: key `"0"` of prefix `value` is `value1`.
pub fn entry_name_for_key(prefix: &str, key: &ArrayKey) -> Option<String> {
    let indices = key.indices()?;
    if indices.len() != 1 {
        return None;
    }
    Some(format!("{}{}", prefix, indices[0] + 1))
}

/// Parse an entry-variable name against a declared prefix.
///
/// `value3` with prefix `value` yields key `"2"`. Returns `None` when the
/// name does not carry the prefix plus a positive numeric suffix.
pub fn entry_key_for_name(prefix: &str, name: &str) -> Option<ArrayKey> {
    let suffix = name.strip_prefix(prefix)?;
    let ordinal: usize = suffix.parse().ok()?;
    if ordinal == 0 {
        return None;
    }
    Some(ArrayKey::from_index(ordinal - 1))
}

/// Essential-storage key for one array element.
///
/// Array essentials live beside scalar essentials in the same per-component
/// map, namespaced as `var:key`.
pub fn essential_key(var: &str, key: &ArrayKey) -> String {
    format!("{}:{}", var, key)
}

/// Split an essential-storage key back into variable name and array key.
pub fn split_essential_key(raw: &str) -> Option<(&str, ArrayKey)> {
    let (var, key) = raw.split_once(':')?;
    Some((var, ArrayKey::from(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_conversions() {
        assert_eq!(ArrayKey::from_index(3).as_str(), "3");
        assert_eq!(ArrayKey::from_indices(&[1, 2]).as_str(), "1,2");
        assert_eq!(ArrayKey::from("1,2").indices(), Some(vec![1, 2]));
        assert_eq!(ArrayKey::from("x").indices(), None);
    }

    #[test]
    fn test_flat_offset_row_major() {
        let key = ArrayKey::from_indices(&[1, 2]);
        assert_eq!(key.flat_offset(&[2, 3]), Some(5));
        assert_eq!(key.flat_offset(&[2, 2]), None); // out of bounds
        assert_eq!(key.flat_offset(&[4]), None); // wrong rank
    }

    #[test]
    fn test_all_array_keys() {
        let keys = all_array_keys(&[2, 2]);
        let raw: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(raw, vec!["0,0", "0,1", "1,0", "1,1"]);
        assert!(all_array_keys(&[0]).is_empty());
        assert!(all_array_keys(&[]).is_empty());
    }

    #[test]
    fn test_entry_name_convention_is_one_based() {
        let key = ArrayKey::from_index(0);
        assert_eq!(entry_name_for_key("value", &key), Some("value1".into()));
        assert_eq!(entry_key_for_name("value", "value3"), Some(ArrayKey::from_index(2)));
        assert_eq!(entry_key_for_name("value", "value0"), None);
        assert_eq!(entry_key_for_name("value", "other2"), None);
        assert_eq!(entry_key_for_name("value", "value"), None);
    }

    #[test]
    fn test_essential_key_round_trip() {
        let key = ArrayKey::from_indices(&[1, 2]);
        let raw = essential_key("values", &key);
        assert_eq!(raw, "values:1,2");
        let (var, back) = split_essential_key(&raw).unwrap();
        assert_eq!(var, "values");
        assert_eq!(back, key);
    }
}
