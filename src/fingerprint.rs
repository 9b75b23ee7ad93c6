//! The fingerprint engine (`spec.md` §4.2): pure functions from
//! `(package, task, inputs, env, global context)` to a 16-hex-character
//! fingerprint.
//!
//! Every fingerprint is built through [`Canon`], a small canonical byte
//! writer: maps are written as their sorted `(key, value)` pairs, sets as
//! their sorted sequence, and every variable-length field is length-prefixed
//! so that `"ab" + "c"` can never collide with `"a" + "bc"`. The resulting
//! byte string is fed to BLAKE3 and truncated to 16 hex characters.

use std::collections::{BTreeMap, BTreeSet};

use tracing::instrument;

use crate::hash::Blake3;

const FINGERPRINT_HEX_LEN: usize = 16;

/// A 16-hex-character content fingerprint (`spec.md` §3).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, derive_more::Display)]
#[display("{_0}")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Accumulates canonical, order-independent byte fields for hashing.
///
/// Every `field_*` method appends a length prefix followed by the field's
/// bytes, so callers never need to worry about delimiter collisions. Maps
/// and sets are accepted as `BTreeMap`/`BTreeSet` so sortedness is a type
/// guarantee rather than a call-site discipline.
#[derive(Default)]
pub struct Canon {
    fields: Vec<u8>,
}

impl Canon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_bytes(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.fields
            .extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.fields.extend_from_slice(bytes);
        self
    }

    pub fn field_str(&mut self, s: impl AsRef<str>) -> &mut Self {
        self.field_bytes(s.as_ref().as_bytes())
    }

    pub fn field_bool(&mut self, b: bool) -> &mut Self {
        self.field_bytes([b as u8])
    }

    /// A sorted sequence of strings (a "set" field, per `spec.md` §4.2).
    pub fn field_str_set<'a>(&mut self, items: impl IntoIterator<Item = &'a String>) -> &mut Self {
        let sorted: BTreeSet<&str> = items.into_iter().map(String::as_str).collect();
        self.field_bytes((sorted.len() as u64).to_le_bytes());
        for item in sorted {
            self.field_str(item);
        }
        self
    }

    /// A sorted sequence of `(key, value)` pairs (a "map" field).
    pub fn field_str_map<'a>(
        &mut self,
        items: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> &mut Self {
        let sorted: BTreeMap<&str, &str> = items
            .into_iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.field_bytes((sorted.len() as u64).to_le_bytes());
        for (key, value) in sorted {
            self.field_str(key);
            self.field_str(value);
        }
        self
    }

    /// An already-ordered sequence of opaque values (e.g. upstream
    /// fingerprints in topological order): order is preserved, not sorted.
    pub fn field_ordered<'a>(&mut self, items: impl IntoIterator<Item = &'a str>) -> &mut Self {
        let items: Vec<&str> = items.into_iter().collect();
        self.field_bytes((items.len() as u64).to_le_bytes());
        for item in items {
            self.field_str(item);
        }
        self
    }

    pub fn finish(&self) -> Fingerprint {
        let digest = Blake3::from_buffer(&self.fields);
        Fingerprint(digest.truncated(FINGERPRINT_HEX_LEN))
    }
}

/// The literal pepper constant folded into every global fingerprint.
/// Changing it invalidates every cache entry in existence — the coarse
/// cache-busting knob named in `spec.md` §4.2.
const FINGERPRINT_PEPPER: &str = "monorail-fingerprint-v1";

/// Inputs to the once-per-run global fingerprint (`spec.md` §4.2).
pub struct GlobalFingerprintInputs<'a> {
    pub root_external_dependency_digest: &'a str,
    /// Built-in env names plus the run's configured global env-var set,
    /// already resolved to `NAME=VALUE` pairs by the caller.
    pub env_pairs: BTreeMap<String, String>,
    pub canonicalized_pipeline_config_hash: &'a str,
    /// Hashes of user-declared global file-dependency globs, already
    /// resolved against the repo root.
    pub global_file_hashes: BTreeMap<String, String>,
}

#[instrument(skip_all, name = "fingerprint::global")]
pub fn global_fingerprint(inputs: &GlobalFingerprintInputs<'_>) -> Fingerprint {
    let mut canon = Canon::new();
    canon
        .field_str(FINGERPRINT_PEPPER)
        .field_str(inputs.root_external_dependency_digest)
        .field_str_map(inputs.env_pairs.iter())
        .field_str(inputs.canonicalized_pipeline_config_hash)
        .field_str_map(inputs.global_file_hashes.iter());
    canon.finish()
}

/// Inputs to the once-per-package fingerprint (`spec.md` §4.2).
pub struct PackageFingerprintInputs<'a> {
    /// Anchored path -> content hash, as produced by the file hasher.
    pub file_hashes: &'a BTreeMap<String, String>,
    pub external_dependency_digest: &'a str,
    /// Fingerprints of this package's internal dependencies, already in
    /// topological order (order is significant and preserved, not sorted).
    pub internal_dependency_fingerprints: &'a [Fingerprint],
}

#[instrument(skip_all, name = "fingerprint::package")]
pub fn package_fingerprint(inputs: &PackageFingerprintInputs<'_>) -> Fingerprint {
    let mut canon = Canon::new();
    canon
        .field_str_map(inputs.file_hashes.iter())
        .field_str(inputs.external_dependency_digest)
        .field_ordered(
            inputs
                .internal_dependency_fingerprints
                .iter()
                .map(Fingerprint::as_str),
        );
    canon.finish()
}

/// Inputs to the once-per-task-node fingerprint (`spec.md` §4.2).
pub struct TaskFingerprintInputs<'a> {
    pub package_fingerprint: &'a Fingerprint,
    pub task_name: &'a str,
    pub resolved_outputs: &'a [String],
    /// Pass-through CLI arguments that actually target this task.
    pub pass_through_args: &'a [String],
    /// The task's declared `env` set, resolved against the process
    /// environment. Absent variables are rendered as `NAME=` so the shape
    /// of the hash is stable regardless of which vars happen to be set.
    pub env_values: &'a BTreeMap<String, Option<String>>,
}

#[instrument(skip_all, name = "fingerprint::task")]
pub fn task_fingerprint(inputs: &TaskFingerprintInputs<'_>) -> Fingerprint {
    let env_pairs: BTreeMap<String, String> = inputs
        .env_values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
        .collect();

    let mut canon = Canon::new();
    canon
        .field_str(inputs.package_fingerprint.as_str())
        .field_str(inputs.task_name)
        .field_str_set(inputs.resolved_outputs.iter())
        .field_ordered(inputs.pass_through_args.iter().map(String::as_str))
        .field_str_map(env_pairs.iter());
    canon.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canon_distinguishes_field_boundaries() {
        let mut a = Canon::new();
        a.field_str("ab").field_str("c");
        let mut b = Canon::new();
        b.field_str("a").field_str("bc");
        assert_ne!(a.finish().as_str(), b.finish().as_str());
    }

    #[test]
    fn canon_maps_are_order_invariant() {
        let mut a = Canon::new();
        a.field_str_map(
            [
                ("x".to_owned(), "1".to_owned()),
                ("y".to_owned(), "2".to_owned()),
            ]
            .iter()
            .map(|(k, v)| (k, v)),
        );
        let mut b = Canon::new();
        b.field_str_map(
            [
                ("y".to_owned(), "2".to_owned()),
                ("x".to_owned(), "1".to_owned()),
            ]
            .iter()
            .map(|(k, v)| (k, v)),
        );
        assert_eq!(a.finish().as_str(), b.finish().as_str());
    }

    #[test]
    fn canon_ordered_sequences_are_order_sensitive() {
        let mut a = Canon::new();
        a.field_ordered(["x", "y"]);
        let mut b = Canon::new();
        b.field_ordered(["y", "x"]);
        assert_ne!(a.finish().as_str(), b.finish().as_str());
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let fp = Canon::new().finish();
        assert_eq!(fp.as_str().len(), 16);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn task_fingerprint_identical_inputs_match() {
        let pkg_fp = Canon::new().finish();
        let env = BTreeMap::from([("CI".to_owned(), Some("1".to_owned()))]);
        let inputs_a = TaskFingerprintInputs {
            package_fingerprint: &pkg_fp,
            task_name: "build",
            resolved_outputs: &["dist/**".to_owned()],
            pass_through_args: &[],
            env_values: &env,
        };
        let inputs_b = TaskFingerprintInputs {
            package_fingerprint: &pkg_fp,
            task_name: "build",
            resolved_outputs: &["dist/**".to_owned()],
            pass_through_args: &[],
            env_values: &env,
        };
        assert_eq!(
            task_fingerprint(&inputs_a).as_str(),
            task_fingerprint(&inputs_b).as_str()
        );
    }

    #[test]
    fn task_fingerprint_is_invariant_to_outputs_order() {
        let pkg_fp = Canon::new().finish();
        let env = BTreeMap::new();
        let a = TaskFingerprintInputs {
            package_fingerprint: &pkg_fp,
            task_name: "build",
            resolved_outputs: &["dist/**".to_owned(), "lib/**".to_owned()],
            pass_through_args: &[],
            env_values: &env,
        };
        let b = TaskFingerprintInputs {
            package_fingerprint: &pkg_fp,
            task_name: "build",
            resolved_outputs: &["lib/**".to_owned(), "dist/**".to_owned()],
            pass_through_args: &[],
            env_values: &env,
        };
        assert_eq!(task_fingerprint(&a).as_str(), task_fingerprint(&b).as_str());
    }

    #[test]
    fn task_fingerprint_absent_env_var_is_stable() {
        let pkg_fp = Canon::new().finish();
        let env = BTreeMap::from([("MISSING".to_owned(), None)]);
        let inputs = TaskFingerprintInputs {
            package_fingerprint: &pkg_fp,
            task_name: "build",
            resolved_outputs: &[],
            pass_through_args: &[],
            env_values: &env,
        };
        // Must not panic and must be deterministic.
        let a = task_fingerprint(&inputs);
        let b = task_fingerprint(&inputs);
        assert_eq!(a.as_str(), b.as_str());
    }
}
