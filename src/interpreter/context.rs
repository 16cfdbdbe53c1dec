//! Per-request execution scope.
//!
//! The context owns three kinds of state: caller-defined fields written by
//! instructions (`ref` attributes name them), the `form` record that loops
//! and sub-calls bind their current element into, and a few reserved slots
//! (loop index, resolution base, call depth).

use serde_json::{Map, Value};

use super::value;
use super::{InterpreterError, Result};

/// Path prefix addressing the form record explicitly (`form.name`).
pub const FORM_PREFIX: &str = "form.";

/// Reserved name resolving to the current loop index.
pub const INDEX_FIELD: &str = "index";

/// Mutable, hierarchical key/value scope threaded through one program run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    fields: Map<String, Value>,
    form: Map<String, Value>,
    index: Option<usize>,
    eval_base: Option<String>,
    call_depth: usize,
}

/// Saved `form` and `index`, restored when a loop exits.
#[derive(Debug, Clone)]
pub struct ScopeSnapshot {
    form: Map<String, Value>,
    index: Option<usize>,
}

impl ExecutionContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose form record starts as the given request parameters.
    pub fn with_params(params: Map<String, Value>) -> Self {
        Self {
            form: params,
            ..Self::default()
        }
    }

    /// Read a field. `form.x` addresses the form record, `index` the loop
    /// index; anything else is a caller field (dotted paths allowed).
    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix(FORM_PREFIX) {
            return value::lookup(&self.form, rest).cloned();
        }
        if path == "form" {
            return Some(Value::Object(self.form.clone()));
        }
        if path == INDEX_FIELD {
            if let Some(index) = self.index {
                return Some(Value::from(index));
            }
        }
        value::lookup(&self.fields, path).cloned()
    }

    /// Write a field (same addressing rules as [`get`](Self::get)).
    pub fn set(&mut self, path: &str, value: Value) {
        if let Some(rest) = path.strip_prefix(FORM_PREFIX) {
            value::assign(&mut self.form, rest, value);
        } else if path == "form" {
            self.form = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
        } else {
            value::assign(&mut self.fields, path, value);
        }
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        match path.strip_prefix(FORM_PREFIX) {
            Some(rest) => value::remove(&mut self.form, rest),
            None => value::remove(&mut self.fields, path),
        }
    }

    /// Mutable access to a field, for in-place edits (stack pops, write-backs).
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        match path.strip_prefix(FORM_PREFIX) {
            Some(rest) => value::lookup_mut(&mut self.form, rest),
            None => value::lookup_mut(&mut self.fields, path),
        }
    }

    /// Resolve a name for template expansion: form first, then caller fields.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        if path.starts_with(FORM_PREFIX) || path == INDEX_FIELD {
            return self.get(path);
        }
        value::lookup(&self.form, path)
            .or_else(|| value::lookup(&self.fields, path))
            .cloned()
    }

    /// Caller-defined fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The current-record scope.
    pub fn form(&self) -> &Map<String, Value> {
        &self.form
    }

    /// Mutable current-record scope.
    pub fn form_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.form
    }

    /// Bind a loop element into the form.
    ///
    /// Objects are merged into the form unless `field` names a slot; scalars
    /// and arrays without a `field` land in `value`.
    pub fn bind(&mut self, element: Value, field: Option<&str>) {
        match (field, element) {
            (Some(field), element) => value::assign(&mut self.form, field, element),
            (None, Value::Object(map)) => {
                for (key, value) in map {
                    self.form.insert(key, value);
                }
            }
            (None, element) => {
                self.form.insert("value".to_string(), element);
            }
        }
    }

    /// Capture form and index before a loop.
    pub fn save_scope(&self) -> ScopeSnapshot {
        ScopeSnapshot {
            form: self.form.clone(),
            index: self.index,
        }
    }

    /// Restore form and index after a loop.
    pub fn restore_scope(&mut self, snapshot: ScopeSnapshot) {
        self.form = snapshot.form;
        self.index = snapshot.index;
    }

    /// Current iteration position.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Set the iteration position.
    pub fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    /// Source id relative sub-program references resolve against.
    pub fn eval_base(&self) -> Option<&str> {
        self.eval_base.as_deref()
    }

    /// Replace the resolution base, returning the previous one.
    pub fn replace_eval_base(&mut self, base: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.eval_base, base)
    }

    /// Current nesting depth of sub-program invocations.
    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    /// Enter a nested invocation, failing once `limit` would be exceeded.
    pub fn enter_call(&mut self, limit: usize) -> Result<()> {
        if self.call_depth >= limit {
            return Err(InterpreterError::RecursionLimit {
                depth: self.call_depth + 1,
                limit,
            });
        }
        self.call_depth += 1;
        Ok(())
    }

    /// Leave a nested invocation.
    pub fn leave_call(&mut self) {
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    /// Fresh context for an isolated invocation at the current depth.
    pub fn isolated_child(&self, params: Map<String, Value>, eval_base: String) -> Self {
        Self {
            form: params,
            eval_base: Some(eval_base),
            call_depth: self.call_depth,
            ..Self::default()
        }
    }

    /// Copy fields carrying the export marker into `parent`, marker stripped.
    ///
    /// Returns the number of exported fields.
    pub fn export_into(&self, parent: &mut ExecutionContext, marker: &str) -> usize {
        let mut exported = 0;
        for (name, value) in &self.fields {
            if let Some(stripped) = name.strip_prefix(marker) {
                if !stripped.is_empty() {
                    parent.fields.insert(stripped.to_string(), value.clone());
                    exported += 1;
                }
            }
        }
        exported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn form_prefix_and_plain_fields_are_separate() {
        let mut ctx = ExecutionContext::new();
        ctx.set("name", json!("field"));
        ctx.set("form.name", json!("form"));
        assert_eq!(ctx.get("name"), Some(json!("field")));
        assert_eq!(ctx.get("form.name"), Some(json!("form")));
        // Templates see the form first.
        assert_eq!(ctx.resolve("name"), Some(json!("form")));
    }

    #[test]
    fn bind_merges_objects_and_slots_scalars() {
        let mut ctx = ExecutionContext::with_params(
            json!({"keep": 1}).as_object().cloned().unwrap_or_default(),
        );
        ctx.bind(json!({"a": 2}), None);
        ctx.bind(json!(3), None);
        ctx.bind(json!([4]), Some("row"));
        assert_eq!(
            Value::Object(ctx.form().clone()),
            json!({"keep": 1, "a": 2, "value": 3, "row": [4]})
        );
    }

    #[test]
    fn scope_snapshot_restores_form_and_index() {
        let mut ctx = ExecutionContext::new();
        ctx.set("form.x", json!(1));
        let saved = ctx.save_scope();
        ctx.set("form.x", json!(2));
        ctx.set_index(Some(7));
        ctx.restore_scope(saved);
        assert_eq!(ctx.get("form.x"), Some(json!(1)));
        assert_eq!(ctx.index(), None);
        assert_eq!(ctx.get(INDEX_FIELD), None);
    }

    #[test]
    fn enter_call_enforces_limit() {
        let mut ctx = ExecutionContext::new();
        ctx.enter_call(2).unwrap();
        ctx.enter_call(2).unwrap();
        let err = ctx.enter_call(2).unwrap_err();
        assert!(matches!(
            err,
            InterpreterError::RecursionLimit { depth: 3, limit: 2 }
        ));
        ctx.leave_call();
        assert_eq!(ctx.call_depth(), 1);
    }

    #[test]
    fn export_copies_only_marked_fields() {
        let mut parent = ExecutionContext::new();
        let mut child = parent.isolated_child(Map::new(), "sub".to_string());
        child.set("@total", json!(42));
        child.set("scratch", json!("private"));
        assert_eq!(child.export_into(&mut parent, "@"), 1);
        assert_eq!(parent.get("total"), Some(json!(42)));
        assert_eq!(parent.get("scratch"), None);
    }
}
