use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{ActionNode, InterpreterError, Result};

/// Parse an action program document.
///
/// The document has a single root element (its name is not significant);
/// the root's element children become the program's top-level nodes. Every
/// element maps to an [`ActionNode`], attributes keep document order, and
/// text/CDATA content is concatenated into the node's `text`.
pub fn parse_document(source: &str) -> Result<Vec<ActionNode>> {
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<ActionNode> = Vec::new();
    let mut roots: Vec<ActionNode> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(node_from_start(&start)?),
            Ok(Event::Empty(start)) => {
                let node = node_from_start(&start)?;
                attach(&mut stack, &mut roots, node);
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| syntax_error("closing tag without matching opening tag"))?;
                attach(&mut stack, &mut roots, node);
            }
            Ok(Event::Text(text)) => {
                if let Some(top) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|err| syntax_error(&err.to_string()))?;
                    append_text(top, &text);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(top) = stack.last_mut() {
                    let bytes = data.into_inner();
                    append_text(top, &String::from_utf8_lossy(&bytes));
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(syntax_error(&format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    err
                )));
            }
            Ok(_) => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(syntax_error(&format!("unclosed element <{}>", open.name)));
    }

    let mut roots = roots.into_iter();
    match (roots.next(), roots.next()) {
        (Some(root), None) => Ok(root.children),
        (None, _) => Err(syntax_error("document has no root element")),
        (Some(_), Some(_)) => Err(syntax_error("document has more than one root element")),
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<ActionNode> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|err| syntax_error(&err.to_string()))?
        .to_string();
    let mut node = ActionNode::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|err| syntax_error(&err.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| syntax_error(&err.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| syntax_error(&err.to_string()))?
            .into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn attach(stack: &mut [ActionNode], roots: &mut Vec<ActionNode>, node: ActionNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

fn append_text(node: &mut ActionNode, text: &str) {
    match node.text.as_mut() {
        Some(existing) => existing.push_str(text),
        None => node.text = Some(text.to_string()),
    }
}

fn syntax_error(message: &str) -> InterpreterError {
    InterpreterError::Parse(message.to_string())
}
