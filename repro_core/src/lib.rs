//! Program model of the reproducer analyzer.

use ahash::{AHashMap, AHashSet};

pub mod mutation;
pub mod parse;
pub mod prog;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;
