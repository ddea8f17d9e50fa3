//! Input resources (model data, initial values, inverse metrics).
//!
//! A resource file is parsed into a [`VarContext`], a read-only map from
//! variable names to rectangular arrays of `f64`. The [`ResourceResolver`]
//! turns a per-run [`ResourceList`] into one context per chain, parsing
//! every distinct file at most once and sharing the parsed context between
//! chains through an [`Arc`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::RunError;
use crate::settings::ConfigError;

/// The role a resource plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Data,
    Inits,
    Metric,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Data => "data",
            ResourceKind::Inits => "inits",
            ResourceKind::Metric => "metric",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("file does not exist: {0:?}")]
    Missing(PathBuf),
    #[error("could not open file (permission denied?): {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file must contain a JSON object (starting with '{{'): {0:?}")]
    NotAnObject(PathBuf),
    #[error("malformed JSON in {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for variable '{name}' in {path:?}: {reason}")]
    InvalidVariable {
        path: PathBuf,
        name: String,
        reason: String,
    },
}

/// A rectangular array of values stored in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    dims: Vec<usize>,
    values: Vec<f64>,
}

impl Variable {
    pub fn scalar(value: f64) -> Self {
        Self {
            dims: vec![],
            values: vec![value],
        }
    }

    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            dims: vec![values.len()],
            values,
        }
    }

    /// Build a matrix from its rows. Returns `None` for ragged input.
    pub fn matrix(rows: &[Vec<f64>]) -> Option<Self> {
        let ncols = rows.first().map(|row| row.len()).unwrap_or(0);
        if rows.iter().any(|row| row.len() != ncols) {
            return None;
        }
        Some(Self {
            dims: vec![rows.len(), ncols],
            values: rows.iter().flatten().copied().collect(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Number(num) => num
                .as_f64()
                .map(Variable::scalar)
                .ok_or_else(|| format!("number {} is not representable as f64", num)),
            Value::String(text) => parse_special_float(text)
                .map(Variable::scalar)
                .ok_or_else(|| format!("unexpected string \"{}\"", text)),
            Value::Array(items) => {
                let Some(first) = items.first() else {
                    return Ok(Variable::vector(vec![]));
                };
                let first = Variable::from_json(first)?;
                let inner_dims = first.dims.clone();
                let mut values = first.values;
                for item in &items[1..] {
                    let item = Variable::from_json(item)?;
                    if item.dims != inner_dims {
                        return Err("array is not rectangular".to_string());
                    }
                    values.extend(item.values);
                }
                let mut dims = Vec::with_capacity(inner_dims.len() + 1);
                dims.push(items.len());
                dims.extend(inner_dims);
                Ok(Variable { dims, values })
            }
            Value::Bool(_) => Err("boolean values are not supported".to_string()),
            Value::Null => Err("null values are not supported".to_string()),
            Value::Object(_) => Err("nested objects are not supported".to_string()),
        }
    }
}

fn parse_special_float(text: &str) -> Option<f64> {
    match text.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

/// A parsed resource: named variables read from one file.
///
/// The empty context stands in for "no file given".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarContext {
    source: Option<PathBuf>,
    vars: BTreeMap<String, Variable>,
}

impl VarContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_vars<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = (S, Variable)>,
        S: Into<String>,
    {
        Self {
            source: None,
            vars: vars.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Parse the text of a JSON resource file.
    pub fn from_json_str(text: &str, path: &Path) -> Result<Self, ResourceError> {
        if !text.trim_start().starts_with('{') {
            return Err(ResourceError::NotAnObject(path.to_path_buf()));
        }
        let value: Value = serde_json::from_str(text).map_err(|source| ResourceError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        let Value::Object(map) = value else {
            return Err(ResourceError::NotAnObject(path.to_path_buf()));
        };

        let mut vars = BTreeMap::new();
        for (name, value) in map {
            let var =
                Variable::from_json(&value).map_err(|reason| ResourceError::InvalidVariable {
                    path: path.to_path_buf(),
                    name: name.clone(),
                    reason,
                })?;
            vars.insert(name, var);
        }
        Ok(Self {
            source: Some(path.to_path_buf()),
            vars,
        })
    }

    /// The file this context was read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(|name| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, var: Variable) -> Option<Variable> {
        self.vars.insert(name.into(), var)
    }

    /// Read a vector variable of exactly `len` elements.
    pub fn vector(&self, name: &str, len: usize) -> Result<&[f64], String> {
        let var = self
            .get(name)
            .ok_or_else(|| format!("variable '{}' not found", name))?;
        if var.dims != [len] {
            return Err(format!(
                "variable '{}' has dimensions {:?}, expected [{}]",
                name, var.dims, len
            ));
        }
        Ok(&var.values)
    }

    /// Read a `size x size` matrix variable, returned in row-major order.
    pub fn square_matrix(&self, name: &str, size: usize) -> Result<&[f64], String> {
        let var = self
            .get(name)
            .ok_or_else(|| format!("variable '{}' not found", name))?;
        if var.dims != [size, size] {
            return Err(format!(
                "variable '{}' has dimensions {:?}, expected [{}, {}]",
                name, var.dims, size, size
            ));
        }
        Ok(&var.values)
    }

    /// Look up a single element by flattened name.
    ///
    /// `"sigma"` addresses a scalar, `"theta.2"` or `"beta.1.3"` address
    /// array elements with 1-based indices.
    pub fn lookup_flat(&self, name: &str) -> Option<f64> {
        if let Some(var) = self.get(name) {
            return var.is_scalar().then(|| var.values[0]);
        }
        let mut parts = name.split('.');
        let var = self.get(parts.next()?)?;
        let indices: Vec<usize> = parts.map(|part| part.parse().ok()).collect::<Option<_>>()?;
        if indices.len() != var.dims.len() {
            return None;
        }
        let mut offset = 0;
        for (&idx, &dim) in indices.iter().zip(&var.dims) {
            if idx == 0 || idx > dim {
                return None;
            }
            offset = offset * dim + (idx - 1);
        }
        var.values.get(offset).copied()
    }
}

/// Turns a file path into a [`VarContext`].
pub trait ResourceParser: Sync {
    /// Parse the file at `path`. An empty path yields the empty context.
    fn parse(&self, path: &Path) -> Result<VarContext, ResourceError>;
}

/// Reads resources from JSON files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResourceParser;

impl ResourceParser for JsonResourceParser {
    fn parse(&self, path: &Path) -> Result<VarContext, ResourceError> {
        if path.as_os_str().is_empty() {
            return Ok(VarContext::empty());
        }
        if !path.exists() {
            return Err(ResourceError::Missing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ResourceError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        VarContext::from_json_str(&text, path)
    }
}

/// Read the model data file.
///
/// Runs take an already built [`Model`](crate::Model); callers use this to
/// read the data the model is built from. Failure maps to
/// [`RunError::Data`], which is fatal.
pub fn load_data<P: ResourceParser + ?Sized>(
    parser: &P,
    path: &Path,
) -> Result<Arc<VarContext>, RunError> {
    parser
        .parse(path)
        .map(Arc::new)
        .map_err(|source| RunError::Data(Arc::new(source)))
}

/// An ordered list of resource files for a run.
///
/// A list with zero or one entries applies to every chain, otherwise it
/// must hold exactly one file per chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(Vec<PathBuf>);

impl ResourceList {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }

    /// Enforce the broadcast rule: `len() ∈ {0, 1, num_chains}`.
    pub fn check(&self, kind: ResourceKind, num_chains: usize) -> Result<(), ConfigError> {
        match self.len() {
            0 | 1 => Ok(()),
            found if found == num_chains => Ok(()),
            found => Err(ConfigError::Cardinality {
                kind,
                num_chains,
                found,
            }),
        }
    }

    /// The file that applies to `chain`, or `None` if the list is empty.
    pub fn file_for_chain(&self, chain: usize) -> Option<&Path> {
        match self.0.as_slice() {
            [] => None,
            [single] => Some(single),
            files => files.get(chain).map(|path| path.as_path()),
        }
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for ResourceList {
    fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// The outcome of loading one resource; errors are shared between the
/// chains that refer to the same file.
pub type LoadedResource = Result<Arc<VarContext>, Arc<ResourceError>>;

/// Resolves resource lists into per-chain contexts.
///
/// Each distinct file is parsed at most once, and every chain referring to
/// it receives a clone of the same [`Arc`].
pub struct ResourceResolver<'p, P: ResourceParser + ?Sized> {
    parser: &'p P,
    empty: Arc<VarContext>,
    cache: HashMap<PathBuf, LoadedResource>,
}

impl<'p, P: ResourceParser + ?Sized> ResourceResolver<'p, P> {
    pub fn new(parser: &'p P) -> Self {
        Self {
            parser,
            empty: Arc::new(VarContext::empty()),
            cache: HashMap::new(),
        }
    }

    /// Number of distinct files parsed so far.
    pub fn files_parsed(&self) -> usize {
        self.cache.len()
    }

    fn load(&mut self, path: Option<&Path>) -> LoadedResource {
        let Some(path) = path else {
            return Ok(self.empty.clone());
        };
        if let Some(loaded) = self.cache.get(path) {
            return loaded.clone();
        }
        debug!(path = ?path, "parsing resource file");
        let loaded = self.parser.parse(path).map(Arc::new).map_err(Arc::new);
        self.cache.insert(path.to_path_buf(), loaded.clone());
        loaded
    }

    /// The resource for `chain_index`. Assumes `list` passed [`ResourceList::check`].
    pub fn resolve(&mut self, list: &ResourceList, chain_index: usize) -> LoadedResource {
        self.load(list.file_for_chain(chain_index))
    }

    /// Resolve one resource per chain. The cardinality rule is checked
    /// before any file is opened.
    pub fn resolve_all(
        &mut self,
        list: &ResourceList,
        kind: ResourceKind,
        num_chains: usize,
    ) -> Result<Vec<LoadedResource>, ConfigError> {
        list.check(kind, num_chains)?;
        Ok((0..num_chains)
            .map(|chain| self.resolve(list, chain))
            .collect())
    }

    /// Resolve a resource every chain depends on; any load failure aborts the run.
    pub fn resolve_required(
        &mut self,
        list: &ResourceList,
        kind: ResourceKind,
        num_chains: usize,
    ) -> Result<Vec<Arc<VarContext>>, RunError> {
        self.resolve_all(list, kind, num_chains)?
            .into_iter()
            .enumerate()
            .map(|(chain, loaded)| {
                loaded.map_err(|source| RunError::ResourceLoad {
                    kind,
                    chain: chain + 1,
                    source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    struct CountingParser {
        calls: AtomicUsize,
    }

    impl CountingParser {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ResourceParser for CountingParser {
        fn parse(&self, path: &Path) -> Result<VarContext, ResourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = path.to_string_lossy();
            if name.starts_with("missing") {
                return Err(ResourceError::Missing(path.to_path_buf()));
            }
            Ok(VarContext::from_vars([(
                "file",
                Variable::vector(name.bytes().map(f64::from).collect()),
            )]))
        }
    }

    fn names(n: usize) -> ResourceList {
        (0..n).map(|i| format!("file{}.json", i)).collect()
    }

    #[test]
    fn parse_json_context() {
        let text = r#"{"mu": 1.5, "theta": [1, 2, 3], "m": [[1, 2], [3, 4]], "s": "-inf"}"#;
        let ctx = VarContext::from_json_str(text, Path::new("x.json")).unwrap();
        assert_eq!(ctx.names().collect::<Vec<_>>(), vec!["m", "mu", "s", "theta"]);
        assert_eq!(ctx.get("mu").unwrap().dims(), &[] as &[usize]);
        assert_eq!(ctx.get("m").unwrap().dims(), &[2, 2]);
        assert_eq!(ctx.lookup_flat("mu"), Some(1.5));
        assert_eq!(ctx.lookup_flat("theta.3"), Some(3.));
        assert_eq!(ctx.lookup_flat("m.2.1"), Some(3.));
        assert_eq!(ctx.lookup_flat("m.3.1"), None);
        assert_eq!(ctx.lookup_flat("theta"), None);
        assert_eq!(ctx.lookup_flat("s"), Some(f64::NEG_INFINITY));
        assert_eq!(ctx.vector("theta", 3).unwrap(), &[1., 2., 3.]);
        assert!(ctx.vector("theta", 2).is_err());
        assert_eq!(ctx.square_matrix("m", 2).unwrap(), &[1., 2., 3., 4.]);
    }

    #[test]
    fn reject_bad_json() {
        let path = Path::new("bad.json");
        assert!(matches!(
            VarContext::from_json_str("[1, 2]", path),
            Err(ResourceError::NotAnObject(_))
        ));
        assert!(matches!(
            VarContext::from_json_str("{\"a\": [1, 2", path),
            Err(ResourceError::Malformed { .. })
        ));
        assert!(matches!(
            VarContext::from_json_str("{\"a\": [[1, 2], [3]]}", path),
            Err(ResourceError::InvalidVariable { .. })
        ));
    }

    #[test]
    fn json_parser_files() {
        let dir = tempfile::tempdir().unwrap();
        let parser = JsonResourceParser;

        assert!(parser.parse(Path::new("")).unwrap().is_empty());

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            parser.parse(&missing),
            Err(ResourceError::Missing(_))
        ));

        let good = dir.path().join("good.json");
        std::fs::write(&good, "  {\"x\": 2}").unwrap();
        let ctx = parser.parse(&good).unwrap();
        assert_eq!(ctx.lookup_flat("x"), Some(2.));
        assert_eq!(ctx.source(), Some(good.as_path()));
    }

    #[test]
    fn missing_data_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_data(&JsonResourceParser, &dir.path().join("data.json")).unwrap_err();
        assert_eq!(err.status_code(), crate::error::STATUS_PARSING);
        assert!(err.to_string().contains("data.json"));

        let data = load_data(&JsonResourceParser, Path::new("")).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn broadcast_single_file() {
        let parser = CountingParser::new();
        let mut resolver = ResourceResolver::new(&parser);
        let list = ResourceList::new(["shared.json"]);
        let resolved = resolver.resolve_all(&list, ResourceKind::Inits, 4).unwrap();

        assert_eq!(resolved.len(), 4);
        let first = resolved[0].as_ref().unwrap();
        for other in &resolved[1..] {
            assert!(Arc::ptr_eq(first, other.as_ref().unwrap()));
        }
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_list_gives_empty_context() {
        let parser = CountingParser::new();
        let mut resolver = ResourceResolver::new(&parser);
        let resolved = resolver
            .resolve_required(&ResourceList::default(), ResourceKind::Inits, 3)
            .unwrap();
        assert!(resolved.iter().all(|ctx| ctx.is_empty()));
        assert_eq!(parser.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn per_chain_files_are_independent() {
        let parser = CountingParser::new();
        let mut resolver = ResourceResolver::new(&parser);
        let list = names(3);
        let resolved = resolver.resolve_required(&list, ResourceKind::Metric, 3).unwrap();
        for (i, ctx) in resolved.iter().enumerate() {
            let expected: Vec<f64> = format!("file{}.json", i).bytes().map(f64::from).collect();
            assert_eq!(ctx.get("file").unwrap().values(), expected.as_slice());
        }
        assert!(!Arc::ptr_eq(&resolved[0], &resolved[1]));
        assert_eq!(resolver.files_parsed(), 3);
    }

    #[test]
    fn required_failure_names_chain() {
        let parser = CountingParser::new();
        let mut resolver = ResourceResolver::new(&parser);
        let list = ResourceList::new(["ok.json", "missing.json"]);
        let err = resolver
            .resolve_required(&list, ResourceKind::Inits, 2)
            .unwrap_err();
        match err {
            RunError::ResourceLoad { kind, chain, .. } => {
                assert_eq!(kind, ResourceKind::Inits);
                assert_eq!(chain, 2);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn cardinality_error_before_parsing() {
        let parser = CountingParser::new();
        let mut resolver = ResourceResolver::new(&parser);
        let err = resolver
            .resolve_all(&names(3), ResourceKind::Metric, 2)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("metric"));
        assert!(msg.contains("1 file"));
        assert!(msg.contains("2 files"));
        assert_eq!(parser.calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn resolution_succeeds_iff_broadcast_rule(len in 0usize..8, chains in 1usize..8) {
            let parser = CountingParser::new();
            let mut resolver = ResourceResolver::new(&parser);
            let result = resolver.resolve_all(&names(len), ResourceKind::Inits, chains);
            let allowed = len == 0 || len == 1 || len == chains;
            prop_assert_eq!(result.is_ok(), allowed);
            if !allowed {
                prop_assert_eq!(parser.calls.load(Ordering::SeqCst), 0);
            }
        }
    }
}
