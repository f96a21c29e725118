//! Script parsing: node arena, typed node tree and the lexer entry points.
//!
//! A parsed script is a [`ScriptBuffer`]: the raw text plus an arena of
//! [`Node`]s that reference byte ranges into that text. Nodes never own
//! strings; slicing the buffer always recovers the original source.

pub mod lexer;

use std::rc::Rc;

use thiserror::Error;

/// Index of a node in its owning [`ScriptBuffer`] arena.
pub type NodeId = usize;

/// The kind tag of a parsed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
  Comment,
  Escape,
  DeferredText,
  ImmediateText,
  Name,
  NamePrefix,
  NamePart,
  Arg,
  /// `=` (deferred value)
  DefineDeferred,
  /// `?=` (conditional, deferred value)
  DefineQuestioned,
  /// `:=` (immediate value)
  DefineSingleColoned,
  /// `::=` (immediate value)
  DefineDoubleColoned,
  /// `!=` (shell capture, immediate value)
  DefineNot,
  /// `+=` (append)
  DefineAppend,
  /// `targets : prerequisites`
  RuleSingleColoned,
  /// `targets :: prerequisites`
  RuleDoubleColoned,
  Targets,
  Prerequisites,
  Recipes,
  Recipe,
  Call,
}

impl NodeKind {
  /// True for the five assignment kinds.
  pub fn is_define(self) -> bool {
    matches!(
      self,
      NodeKind::DefineDeferred
        | NodeKind::DefineQuestioned
        | NodeKind::DefineSingleColoned
        | NodeKind::DefineDoubleColoned
        | NodeKind::DefineNot
        | NodeKind::DefineAppend
    )
  }

  /// True for both rule kinds.
  pub fn is_rule(self) -> bool {
    matches!(self, NodeKind::RuleSingleColoned | NodeKind::RuleDoubleColoned)
  }
}

/// One node of the parse tree.
///
/// `pos..end` is a byte range into the owning buffer's text. Children are
/// ordered and their ranges nest within the parent's range.
#[derive(Debug, Clone)]
pub struct Node {
  pub kind: NodeKind,
  pub pos: usize,
  pub end: usize,
  pub children: Vec<NodeId>,
}

impl Node {
  pub fn len(&self) -> usize {
    self.end - self.pos
  }

  pub fn is_empty(&self) -> bool {
    self.end <= self.pos
  }
}

/// A source position captured for diagnostics.
///
/// Line and column are 1-based; the column counts bytes from the line start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
  pub script: String,
  pub offset: usize,
  pub line: usize,
  pub column: usize,
}

impl std::fmt::Display for SourceLocation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}:{}", self.script, self.line, self.column)
  }
}

/// A parsed script: name, raw text, node arena and top-level node list.
#[derive(Debug)]
pub struct ScriptBuffer {
  pub name: String,
  pub text: String,
  pub nodes: Vec<Node>,
  pub roots: Vec<NodeId>,
}

impl ScriptBuffer {
  pub fn node(&self, id: NodeId) -> &Node {
    &self.nodes[id]
  }

  /// The raw source text covered by a node.
  pub fn str_of(&self, id: NodeId) -> &str {
    let n = &self.nodes[id];
    &self.text[n.pos..n.end.max(n.pos)]
  }

  /// Derive 1-based line and column for a byte offset.
  pub fn line_col(&self, offset: usize) -> (usize, usize) {
    let offset = offset.min(self.text.len());
    let before = &self.text[..offset];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
      Some(i) => offset - i,
      None => offset + 1,
    };
    (line, column)
  }

  pub fn location(&self, offset: usize) -> SourceLocation {
    let (line, column) = self.line_col(offset);
    SourceLocation {
      script: self.name.clone(),
      offset,
      line,
      column,
    }
  }
}

/// Syntax errors, reported with file, line and column.
#[derive(Debug, Error)]
pub enum ParseError {
  #[error("{script}: invalid UTF-8 encoding")]
  InvalidUtf8 { script: String },

  #[error("{script}:{line}:{column}: unterminated call")]
  UnterminatedCall {
    script: String,
    line: usize,
    column: usize,
  },

  #[error("{script}:{line}:{column}: assignment with empty name")]
  EmptyAssignName {
    script: String,
    line: usize,
    column: usize,
  },
}

impl ParseError {
  pub fn code(&self) -> i32 {
    match self {
      ParseError::InvalidUtf8 { .. } => 1,
      ParseError::UnterminatedCall { .. } => 2,
      ParseError::EmptyAssignName { .. } => 3,
    }
  }
}

/// Parse raw bytes into a shared [`ScriptBuffer`].
///
/// The bytes must be valid UTF-8; anything else is a syntax error.
pub fn parse_bytes(name: &str, bytes: Vec<u8>) -> Result<Rc<ScriptBuffer>, ParseError> {
  let text = String::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8 {
    script: name.to_string(),
  })?;
  parse_script(name, text)
}

/// Parse script text into a shared [`ScriptBuffer`].
pub fn parse_script(name: &str, text: impl Into<String>) -> Result<Rc<ScriptBuffer>, ParseError> {
  let buf = lexer::Lexer::new(name, text.into()).parse()?;
  Ok(Rc::new(buf))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn line_col_derivation() {
    let buf = parse_script("t", "a = 1\nbb = 2\n").unwrap();
    assert_eq!(buf.line_col(0), (1, 1));
    assert_eq!(buf.line_col(4), (1, 5));
    assert_eq!(buf.line_col(6), (2, 1));
    assert_eq!(buf.line_col(8), (2, 3));
  }

  #[test]
  fn invalid_utf8_is_a_syntax_error() {
    let err = parse_bytes("t", vec![b'a', 0xff, 0xfe]).unwrap_err();
    assert!(matches!(err, ParseError::InvalidUtf8 { .. }));
    assert_eq!(err.code(), 1);
  }
}
