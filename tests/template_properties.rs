//! Property tests for template expansion and loop control.

use actionflow::interpreter::ExecutionContext;
use actionflow::runtime::loader::MemoryProgramSource;
use actionflow::runtime::response::{Envelope, Outcome};
use actionflow::runtime::services::{BraceTemplates, BufferedExchange, TemplateEngine};
use actionflow::{Engine, EngineConfig};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

fn engine(id: &str, document: &str) -> Engine {
    let source = MemoryProgramSource::new();
    source.insert_document(id, document).unwrap();
    Engine::new(EngineConfig::default()).with_source(source)
}

fn payload(engine: &Engine, id: &str, params: Value) -> Value {
    let params = match params {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    match engine.run(id, params, &BufferedExchange::new()).outcome {
        Outcome::Envelope(Envelope { status: 200, payload, .. }) => payload,
        other => panic!("unexpected outcome {other:?}"),
    }
}

const SKIPPING: &str = r#"<program>
  <set ref="kept" value="[]" json="true"/>
  <traverse source="form.items">
    <continue condition="{skip} == 1"/>
    <push ref="kept" value="{n}"/>
  </traverse>
  <reply ref="kept"/>
</program>"#;

const NESTED_BREAK: &str = r#"<program>
  <set ref="cells" value="[]" json="true"/>
  <loop count="{rows}" field="row">
    <loop count="{cols}" field="col">
      <break condition="{col} == {stop}"/>
      <push ref="cells" value="{row}:{col}"/>
    </loop>
    <push ref="rows_done" value="{row}"/>
  </loop>
  <reply value='{"cells": {cells}, "rows_done": {rows_done}}' json="true"/>
</program>"#;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A reference expands to the field's text; unknown names expand to nothing.
    #[test]
    fn brace_references_expand(
        name in "[a-z][a-z0-9_]{0,7}",
        value in "[A-Za-z0-9 ,.:-]{0,24}",
    ) {
        prop_assume!(name != "index" && name != "form");
        let mut form = Map::new();
        form.insert(name.clone(), Value::String(value.clone()));
        let ctx = ExecutionContext::with_params(form);

        let expanded = BraceTemplates
            .expand(&format!("<{{{name}}}|{{{name}_unset}}>"), &ctx)
            .unwrap();
        prop_assert_eq!(expanded, format!("<{value}|>"));
    }

    /// Text without references passes through unchanged, JSON braces included.
    #[test]
    fn text_without_references_is_untouched(text in r#"[A-Za-z0-9 "{}:,\[\]]{0,40}"#) {
        let reference = regex::Regex::new(r"\{[A-Za-z0-9_@]").unwrap();
        prop_assume!(!reference.is_match(&text));
        let ctx = ExecutionContext::new();
        prop_assert_eq!(BraceTemplates.expand(&text, &ctx).unwrap(), text);
    }

    /// `continue` skips exactly the flagged elements, order preserved.
    #[test]
    fn continue_skips_flagged_elements(
        items in prop::collection::vec((0u32..1000, any::<bool>()), 0..12),
    ) {
        let engine = engine("skip", SKIPPING);
        let elements: Vec<Value> = items
            .iter()
            .map(|(n, skip)| json!({"n": n, "skip": u8::from(*skip)}))
            .collect();
        let expected: Vec<Value> = items
            .iter()
            .filter(|(_, skip)| !skip)
            .map(|(n, _)| Value::String(n.to_string()))
            .collect();

        let kept = payload(&engine, "skip", json!({"items": elements}));
        prop_assert_eq!(kept, Value::Array(expected));
    }

    /// `break` leaves only the innermost loop; the outer loop runs to the end.
    #[test]
    fn break_is_local(rows in 1usize..5, cols in 0usize..6, stop in 0usize..7) {
        let engine = engine("grid", NESTED_BREAK);
        let result = payload(&engine, "grid", json!({"rows": rows, "cols": cols, "stop": stop}));

        let per_row = cols.min(stop);
        let expected_cells: Vec<Value> = (0..rows)
            .flat_map(|row| (0..per_row).map(move |col| Value::String(format!("{row}:{col}"))))
            .collect();
        let expected_rows: Vec<Value> = (0..rows)
            .map(|row| Value::String(row.to_string()))
            .collect();
        prop_assert_eq!(&result["cells"], &Value::Array(expected_cells));
        prop_assert_eq!(&result["rows_done"], &Value::Array(expected_rows));
    }
}
