//! Shared fixtures for integration tests

#![allow(dead_code)]

use actionflow::interpreter::{Flow, InstructionCatalog};
use actionflow::{Engine, EngineConfig};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Initialize an engine root in a temp dir and write the given programs.
pub fn engine_root(programs: &[(&str, &str)]) -> (TempDir, EngineConfig) {
    let temp = TempDir::new().unwrap();
    let config = EngineConfig::with_root(temp.path());
    Engine::init(&config).unwrap();
    for (id, document) in programs {
        write_program(&config.program_root(), id, document);
    }
    (temp, config)
}

/// Write one program document below `root`.
pub fn write_program(root: &Path, id: &str, document: &str) {
    let path = root.join(format!("{id}.xml"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, document).unwrap();
}

/// Engine whose catalog also has a `count` instruction bumping the returned counter.
pub fn counting_engine(config: EngineConfig) -> (Engine, Arc<AtomicUsize>) {
    let catalog = InstructionCatalog::with_builtins();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    catalog.register("count", move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Flow::Next)
    });
    (Engine::new(config).with_registry(catalog.snapshot()), hits)
}

/// Object literal to request parameters.
pub fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
