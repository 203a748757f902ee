/// WeightMap: named parameter dictionaries and their algebra.
///
/// A checkpoint is a WeightMap — canonical parameter name → flat f32 tensor
/// with shape metadata. Exports are independent snapshots of a client's live
/// model, never aliases. Keys are held in a BTreeMap so iteration order is
/// deterministic across rounds.
///
/// Naming scheme:
///   encoder parameters:  "enc/<structural path>"
///   decoder parameters:  "dec/<task>/<structural path>"
/// Raw export keys may carry instantiation-order suffixes on any path
/// segment ("dense_3/kernel" from a rebuilt model); `canonical_key` strips
/// them so repeatedly-rebuilt models compare correctly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AggregateError, Result};

/// Fixed prefix shared by all encoder parameter names.
pub const ENC_PREFIX: &str = "enc/";
/// Prefix under which per-task decoder parameter names live.
pub const DEC_PREFIX: &str = "dec/";

/// Flat f32 tensor with shape metadata. Row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor { data: vec![0.0; n], shape: shape.to_vec() }
    }

    pub fn from_flat(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor { data, shape }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Canonical parameter name → tensor. One client checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightMap {
    entries: BTreeMap<String, Tensor>,
}

impl WeightMap {
    pub fn new() -> Self {
        WeightMap { entries: BTreeMap::new() }
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.entries.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in deterministic (sorted) order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    /// Keys carrying the encoder prefix, in deterministic order.
    pub fn encoder_keys(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.starts_with(ENC_PREFIX))
            .cloned()
            .collect()
    }

    /// Keys belonging to one task's decoder, in deterministic order.
    pub fn decoder_keys(&self, task: &str) -> Vec<String> {
        let prefix = format!("{DEC_PREFIX}{task}/");
        self.entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Sub-map restricted to `keys`. Missing keys are silently omitted —
    /// this is the documented contract (callers pick optional subsets), not
    /// an error path.
    pub fn pick(&self, keys: &[String]) -> WeightMap {
        let mut out = WeightMap::new();
        for k in keys {
            if let Some(t) = self.entries.get(k) {
                out.insert(k.clone(), t.clone());
            }
        }
        out
    }
}

// ── Canonical naming ──────────────────────────────────────────────────

/// Strip instantiation-order suffixes from every path segment.
///
/// "enc/dense_3/kernel" → "enc/dense/kernel". Strips repeatedly so the
/// function is idempotent even on doubled suffixes.
pub fn canonical_key(raw: &str) -> String {
    raw.split('/')
        .map(strip_instance_suffix)
        .collect::<Vec<_>>()
        .join("/")
}

fn strip_instance_suffix(segment: &str) -> &str {
    let mut s = segment;
    loop {
        match s.rfind('_') {
            Some(pos) => {
                let tail = &s[pos + 1..];
                if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
                    s = &s[..pos];
                } else {
                    return s;
                }
            }
            None => return s,
        }
    }
}

/// Re-key a raw export under canonical names. Two raw keys collapsing onto
/// one canonical name is a hard error — silent data loss here would corrupt
/// every downstream delta.
pub fn canonicalize(raw: &WeightMap) -> Result<WeightMap> {
    let mut out = WeightMap::new();
    let mut sources: BTreeMap<String, String> = BTreeMap::new();
    for (k, t) in raw.iter() {
        let canon = canonical_key(k);
        if let Some(prev) = sources.get(&canon) {
            return Err(AggregateError::KeyCollision {
                first: prev.clone(),
                second: k.clone(),
                canonical: canon,
            });
        }
        sources.insert(canon.clone(), k.clone());
        out.insert(canon, t.clone());
    }
    Ok(out)
}

// ── Dictionary algebra ────────────────────────────────────────────────

/// Elementwise a − b over `keys`. A key absent from either map is an error:
/// a delta with holes is meaningless.
pub fn delta(a: &WeightMap, b: &WeightMap, keys: &[String]) -> Result<WeightMap> {
    let mut out = WeightMap::new();
    for k in keys {
        let ta = a.get(k).ok_or_else(|| AggregateError::ShapeMismatch {
            key: k.clone(),
            detail: "missing from minuend".into(),
        })?;
        let tb = b.get(k).ok_or_else(|| AggregateError::ShapeMismatch {
            key: k.clone(),
            detail: "missing from subtrahend".into(),
        })?;
        if ta.shape != tb.shape {
            return Err(AggregateError::ShapeMismatch {
                key: k.clone(),
                detail: format!("{:?} vs {:?}", ta.shape, tb.shape),
            });
        }
        let data: Vec<f32> = ta.data.iter().zip(&tb.data).map(|(x, y)| x - y).collect();
        out.insert(k.clone(), Tensor::from_flat(data, ta.shape.clone()));
    }
    Ok(out)
}

/// Elementwise mean across N maps. All maps must agree exactly on key set
/// and shapes.
pub fn mean_soup(maps: &[WeightMap]) -> Result<WeightMap> {
    let Some(first) = maps.first() else {
        return Ok(WeightMap::new());
    };
    let inv = 1.0 / maps.len() as f32;
    let mut out = WeightMap::new();
    for (k, t0) in first.iter() {
        let mut acc = vec![0.0f32; t0.numel()];
        for m in maps {
            let t = m.get(k).ok_or_else(|| AggregateError::ShapeMismatch {
                key: k.clone(),
                detail: "missing from one of the maps".into(),
            })?;
            if t.shape != t0.shape {
                return Err(AggregateError::ShapeMismatch {
                    key: k.clone(),
                    detail: format!("{:?} vs {:?}", t.shape, t0.shape),
                });
            }
            for (a, &x) in acc.iter_mut().zip(&t.data) {
                *a += x * inv;
            }
        }
        out.insert(k.clone(), Tensor::from_flat(acc, t0.shape.clone()));
    }
    for m in maps {
        if m.len() != first.len() {
            return Err(AggregateError::ShapeMismatch {
                key: String::new(),
                detail: format!("key count {} vs {}", m.len(), first.len()),
            });
        }
    }
    Ok(out)
}

// ── Flatten / unflatten ───────────────────────────────────────────────

/// Concatenate the tensors under `keys` (in the given order) into one
/// contiguous vector. Exact inverse of `unflatten` for the same key order.
pub fn flatten(map: &WeightMap, keys: &[String]) -> Result<Vec<f32>> {
    let mut flat = Vec::new();
    for k in keys {
        let t = map.get(k).ok_or_else(|| AggregateError::ShapeMismatch {
            key: k.clone(),
            detail: "missing from map during flatten".into(),
        })?;
        flat.extend_from_slice(&t.data);
    }
    Ok(flat)
}

/// Split a flat vector back into named tensors. `keys` and `shapes` run in
/// parallel and must consume `flat` exactly.
pub fn unflatten(flat: &[f32], keys: &[String], shapes: &[Vec<usize>]) -> Result<WeightMap> {
    debug_assert_eq!(keys.len(), shapes.len());
    let mut out = WeightMap::new();
    let mut offset = 0usize;
    for (k, shape) in keys.iter().zip(shapes) {
        let n: usize = shape.iter().product();
        if offset + n > flat.len() {
            return Err(AggregateError::ShapeMismatch {
                key: k.clone(),
                detail: format!("flat vector too short: need {} past {}", n, offset),
            });
        }
        out.insert(
            k.clone(),
            Tensor::from_flat(flat[offset..offset + n].to_vec(), shape.clone()),
        );
        offset += n;
    }
    if offset != flat.len() {
        return Err(AggregateError::ShapeMismatch {
            key: String::new(),
            detail: format!("flat vector has {} trailing elements", flat.len() - offset),
        });
    }
    Ok(out)
}

/// Shapes of the tensors under `keys`, in key order. Companion to `flatten`.
pub fn shapes_of(map: &WeightMap, keys: &[String]) -> Result<Vec<Vec<usize>>> {
    keys.iter()
        .map(|k| {
            map.get(k)
                .map(|t| t.shape.clone())
                .ok_or_else(|| AggregateError::ShapeMismatch {
                    key: k.clone(),
                    detail: "missing from map".into(),
                })
        })
        .collect()
}

// ── Relative / absolute decoder keys ──────────────────────────────────

/// Strip the per-task prefix from an absolute decoder key, leaving the
/// task-agnostic structural suffix. Fails on keys outside the task's
/// namespace — truncating here would let blocks from different tasks alias.
pub fn rel_decoder_key(abs: &str, task: &str) -> Result<String> {
    let prefix = format!("{DEC_PREFIX}{task}/");
    match abs.strip_prefix(&prefix) {
        Some(rest) if !rest.is_empty() => Ok(rest.to_string()),
        _ => Err(AggregateError::MalformedKey {
            key: abs.to_string(),
            expected: prefix,
        }),
    }
}

/// Restore a task-qualified absolute key from a relative one. Exact inverse
/// of `rel_decoder_key`.
pub fn abs_decoder_key(rel: &str, task: &str) -> String {
    format!("{DEC_PREFIX}{task}/{rel}")
}
