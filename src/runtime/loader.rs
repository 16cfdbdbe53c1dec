//! Program sources and the shared program cache.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::interpreter::{ActionNode, InterpreterError, Program, Result, parse_document};

/// Where program documents come from.
pub trait ProgramSource: Send + Sync {
    /// Current modification time of a program; `MissingProgram` if absent.
    fn modified(&self, id: &str) -> Result<SystemTime>;

    /// Parse the program's top-level nodes.
    fn load(&self, id: &str) -> Result<Vec<ActionNode>>;
}

/// Programs stored as XML documents under a root directory.
#[derive(Debug, Clone)]
pub struct FileProgramSource {
    root: PathBuf,
    extension: String,
}

impl FileProgramSource {
    /// Source mapping `id` to `<root>/<id>.xml`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "xml".to_string(),
        }
    }

    /// Program root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing a program id. Ids escaping the root have no file.
    pub fn path_for(&self, id: &str) -> Option<PathBuf> {
        if id.split('/').any(|segment| segment == ".." || segment.is_empty()) {
            return None;
        }
        let suffix = format!(".{}", self.extension);
        let file = if id.ends_with(&suffix) {
            id.to_string()
        } else {
            format!("{id}{suffix}")
        };
        Some(self.root.join(file))
    }

    /// Every program id under the root, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        collect_ids(&self.root, &self.root, &self.extension, &mut ids)?;
        ids.sort();
        Ok(ids)
    }
}

fn collect_ids(root: &Path, dir: &Path, extension: &str, ids: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_ids(root, &path, extension, ids)?;
        } else if path.extension().is_some_and(|ext| ext == extension) {
            if let Ok(relative) = path.with_extension("").strip_prefix(root) {
                let id = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                ids.push(id);
            }
        }
    }
    Ok(())
}

impl ProgramSource for FileProgramSource {
    fn modified(&self, id: &str) -> Result<SystemTime> {
        let path = self
            .path_for(id)
            .ok_or_else(|| InterpreterError::MissingProgram(id.to_string()))?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(meta.modified()?),
            Ok(_) => Err(InterpreterError::MissingProgram(id.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(InterpreterError::MissingProgram(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn load(&self, id: &str) -> Result<Vec<ActionNode>> {
        let path = self
            .path_for(id)
            .ok_or_else(|| InterpreterError::MissingProgram(id.to_string()))?;
        let document = std::fs::read_to_string(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => InterpreterError::MissingProgram(id.to_string()),
            _ => err.into(),
        })?;
        parse_document(&document)
    }
}

/// Programs held in memory; handy for embedding and tests.
///
/// Every insert bumps a generation counter that stands in for the
/// modification time, so replaced programs are reparsed.
#[derive(Debug, Default)]
pub struct MemoryProgramSource {
    programs: RwLock<HashMap<String, (SystemTime, Vec<ActionNode>)>>,
    generation: RwLock<u64>,
}

impl MemoryProgramSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a program.
    pub fn insert(&self, id: impl Into<String>, nodes: Vec<ActionNode>) {
        let stamp = {
            let mut generation = self.generation.write();
            *generation += 1;
            SystemTime::UNIX_EPOCH + Duration::from_nanos(*generation)
        };
        self.programs.write().insert(id.into(), (stamp, nodes));
    }

    /// Add or replace a program from its XML document.
    pub fn insert_document(&self, id: impl Into<String>, document: &str) -> Result<()> {
        let nodes = parse_document(document)?;
        self.insert(id, nodes);
        Ok(())
    }
}

impl ProgramSource for MemoryProgramSource {
    fn modified(&self, id: &str) -> Result<SystemTime> {
        self.programs
            .read()
            .get(id)
            .map(|(stamp, _)| *stamp)
            .ok_or_else(|| InterpreterError::MissingProgram(id.to_string()))
    }

    fn load(&self, id: &str) -> Result<Vec<ActionNode>> {
        self.programs
            .read()
            .get(id)
            .map(|(_, nodes)| nodes.clone())
            .ok_or_else(|| InterpreterError::MissingProgram(id.to_string()))
    }
}

/// Parsed programs keyed by source id, shared across requests.
///
/// An entry is reused while its source reports the same modification time;
/// otherwise the program is reparsed and the entry replaced as a whole.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl ProgramCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a program, reparsing it when the source changed.
    ///
    /// `validate` runs on freshly parsed programs before they are cached.
    pub fn get<F>(&self, source: &dyn ProgramSource, id: &str, validate: F) -> Result<Arc<Program>>
    where
        F: FnOnce(&Program) -> Result<()>,
    {
        let modified = source.modified(id)?;
        let cached = self.programs.read().get(id).cloned();
        if let Some(program) = cached {
            if program.modified == modified {
                return Ok(program);
            }
            debug!(program = id, "source changed, reparsing");
        }

        let program = Program::new(id, source.load(id)?, modified);
        validate(&program)?;
        let program = Arc::new(program);
        self.programs
            .write()
            .insert(id.to_string(), Arc::clone(&program));
        debug!(
            program = id,
            nodes = program.nodes.len(),
            loaded_at = %program.loaded_at,
            "program loaded"
        );
        Ok(program)
    }

    /// Number of cached programs.
    pub fn len(&self) -> usize {
        self.programs.read().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.programs.read().is_empty()
    }

    /// Drop one entry.
    pub fn invalidate(&self, id: &str) {
        self.programs.write().remove(id);
    }
}

/// Resolve a sub-program reference.
///
/// A leading `/` is rooted at the program root; anything else is relative
/// to the directory of `base`. `.` and `..` segments are normalised, and
/// `..` never climbs above the root.
pub fn resolve_reference(base: Option<&str>, reference: &str) -> String {
    let reference = reference.trim();
    let joined = match reference.strip_prefix('/') {
        Some(rooted) => rooted.to_string(),
        None => match base.and_then(|base| base.rsplit_once('/')) {
            Some((dir, _)) => format!("{dir}/{reference}"),
            None => reference.to_string(),
        },
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
