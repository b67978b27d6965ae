use anyhow::{Result, bail};
use indexmap::IndexMap;

/// The arguments of one caller invocation, as the caller supplied them:
/// positionally, by name, or a mix of both.
#[derive(Debug, Clone)]
pub struct CallArgs<V> {
    pub positional: Vec<V>,
    pub named: IndexMap<String, V>,
}

impl<V> Default for CallArgs<V> {
    fn default() -> Self {
        Self {
            positional: Vec::new(),
            named: IndexMap::new(),
        }
    }
}

impl<V> CallArgs<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: impl IntoIterator<Item = V>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            named: IndexMap::new(),
        }
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: V) -> Self {
        self.positional.push(value);
        self
    }

    /// Adds a named argument.
    pub fn named(mut self, key: impl Into<String>, value: V) -> Self {
        self.named.insert(key.into(), value);
        self
    }
}

/// Column-major packing of a batch of calls: one column per parameter, each
/// of length `batch_size`, in batch order.
///
/// The batch handler receives this in place of the scalar arguments of a
/// single call. Parameters passed positionally arrive as `positional`
/// columns; parameters passed by name arrive under their key in `named`.
/// No normalization happens between the two forms, so every call in a batch
/// must use the same shape: the same positional arity and the same set of
/// named keys (key order may differ between calls).
#[derive(Debug)]
pub struct ArgColumns<V> {
    pub batch_size: usize,
    pub positional: Vec<Vec<V>>,
    pub named: IndexMap<String, Vec<V>>,
}

impl<V> ArgColumns<V> {
    /// Packs per-call arguments into columns. Shape mismatches are per-batch
    /// errors; the coordinator broadcasts them to every caller in the batch.
    pub(crate) fn pack(calls: Vec<CallArgs<V>>) -> Result<Self> {
        let batch_size = calls.len();
        let mut calls = calls.into_iter();
        let Some(first) = calls.next() else {
            bail!("cannot pack an empty batch");
        };

        let arity = first.positional.len();
        let mut positional: Vec<Vec<V>> = first
            .positional
            .into_iter()
            .map(|value| {
                let mut column = Vec::with_capacity(batch_size);
                column.push(value);
                column
            })
            .collect();
        let mut named: IndexMap<String, Vec<V>> = first
            .named
            .into_iter()
            .map(|(key, value)| {
                let mut column = Vec::with_capacity(batch_size);
                column.push(value);
                (key, column)
            })
            .collect();

        for call in calls {
            if call.positional.len() != arity {
                bail!(
                    "all calls in a batch must pass the same number of positional arguments \
                     (expected {arity}, got {})",
                    call.positional.len()
                );
            }
            for (column, value) in positional.iter_mut().zip(call.positional) {
                column.push(value);
            }

            if call.named.len() != named.len() {
                bail!(
                    "all calls in a batch must pass the same set of named arguments \
                     (expected {} keys, got {})",
                    named.len(),
                    call.named.len()
                );
            }
            for (key, value) in call.named {
                let Some(column) = named.get_mut(&key) else {
                    bail!(
                        "all calls in a batch must pass the same set of named arguments \
                         (unexpected `{key}`)"
                    );
                };
                column.push(value);
            }
        }

        Ok(Self {
            batch_size,
            positional,
            named,
        })
    }

    /// Resolves one parameter's column, whether the callers passed it at
    /// positional slot `slot` or under the name `name`.
    pub fn column(&self, slot: usize, name: &str) -> Option<&[V]> {
        self.positional
            .get(slot)
            .or_else(|| self.named.get(name))
            .map(Vec::as_slice)
    }

    /// Like [`column`](Self::column), but moves the column out, leaving an
    /// empty one behind. Handy when outputs are built from owned values.
    pub fn take_column(&mut self, slot: usize, name: &str) -> Option<Vec<V>> {
        if let Some(column) = self.positional.get_mut(slot) {
            return Some(std::mem::take(column));
        }
        self.named.shift_remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_positional_columns() {
        let columns = ArgColumns::pack(vec![
            CallArgs::positional(["a1", "a2"]),
            CallArgs::positional(["b1", "b2"]),
        ])
        .unwrap();

        assert_eq!(columns.batch_size, 2);
        assert_eq!(columns.positional, vec![vec!["a1", "b1"], vec!["a2", "b2"]]);
        assert!(columns.named.is_empty());
    }

    #[test]
    fn packs_named_columns_in_any_key_order() {
        let columns = ArgColumns::pack(vec![
            CallArgs::new().named("key1", "a1").named("key2", "a2"),
            CallArgs::new().named("key2", "b2").named("key1", "b1"),
        ])
        .unwrap();

        assert_eq!(columns.named["key1"], vec!["a1", "b1"]);
        assert_eq!(columns.named["key2"], vec!["a2", "b2"]);
    }

    #[test]
    fn rejects_positional_arity_mismatch() {
        let err = ArgColumns::pack(vec![
            CallArgs::positional(["a1", "a2"]),
            CallArgs::positional(["b1"]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("positional arguments"));
    }

    #[test]
    fn rejects_named_key_mismatch() {
        let err = ArgColumns::pack(vec![
            CallArgs::new().named("key1", "a1"),
            CallArgs::new().named("key2", "b1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("unexpected `key2`"));
    }

    #[test]
    fn column_resolves_slot_then_name() {
        let mut columns = ArgColumns::pack(vec![
            CallArgs::new().arg("a1").named("key2", "a2"),
            CallArgs::new().arg("b1").named("key2", "b2"),
        ])
        .unwrap();

        assert_eq!(columns.column(0, "key1"), Some(&["a1", "b1"][..]));
        assert_eq!(columns.column(1, "key2"), Some(&["a2", "b2"][..]));
        assert_eq!(columns.column(2, "key3"), None);

        assert_eq!(columns.take_column(1, "key2"), Some(vec!["a2", "b2"]));
        assert_eq!(columns.take_column(1, "key2"), None);
    }
}
