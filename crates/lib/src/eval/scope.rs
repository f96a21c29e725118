//! Variable scopes: definitions, values and fragment storage.
//!
//! A definition's value is an ordered list of fragments. A text fragment is
//! immediate; a node fragment references parsed source and is re-expanded on
//! every call, which is what makes `=` definitions lazy.

use std::collections::HashMap;
use std::rc::Rc;

use crate::parse::{NodeId, ScriptBuffer, SourceLocation};

/// One piece of a definition's value.
#[derive(Debug, Clone)]
pub enum Fragment {
  /// Literal text, captured at definition time.
  Text(String),
  /// An unexpanded parse node, re-resolved on every expansion.
  Node(Rc<ScriptBuffer>, NodeId),
}

/// An ordered fragment sequence; fragments join with a single space when the
/// value expands.
#[derive(Debug, Clone, Default)]
pub struct Value {
  fragments: Vec<Fragment>,
}

impl Value {
  pub fn empty() -> Self {
    Value::default()
  }

  pub fn text(s: impl Into<String>) -> Self {
    Value {
      fragments: vec![Fragment::Text(s.into())],
    }
  }

  pub fn node(buf: Rc<ScriptBuffer>, id: NodeId) -> Self {
    Value {
      fragments: vec![Fragment::Node(buf, id)],
    }
  }

  pub fn push(&mut self, fragment: Fragment) {
    self.fragments.push(fragment);
  }

  pub fn fragments(&self) -> &[Fragment] {
    &self.fragments
  }

  /// True when the leading fragment is an unexpanded node, meaning the
  /// definition was captured lazily.
  pub fn starts_deferred(&self) -> bool {
    matches!(self.fragments.first(), Some(Fragment::Node(..)))
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::text(s)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::text(s)
  }
}

/// A named variable definition.
#[derive(Debug, Clone)]
pub struct Definition {
  pub name: String,
  pub value: Value,
  pub readonly: bool,
  pub location: Option<SourceLocation>,
}

/// A name to definition map with a save/restore stack for temporary bindings.
#[derive(Debug, Default)]
pub struct Scope {
  defines: HashMap<String, Definition>,
  saved: Vec<HashMap<String, Option<Definition>>>,
}

impl Scope {
  pub fn new() -> Self {
    Scope::default()
  }

  pub fn get(&self, name: &str) -> Option<&Definition> {
    self.defines.get(name)
  }

  pub fn get_mut(&mut self, name: &str) -> Option<&mut Definition> {
    self.defines.get_mut(name)
  }

  /// Install or replace a definition. Writing to a readonly definition is
  /// refused; the caller decides how loudly to complain.
  pub fn set(&mut self, name: &str, value: Value, location: Option<SourceLocation>) -> bool {
    match self.defines.get_mut(name) {
      Some(d) if d.readonly => false,
      Some(d) => {
        d.value = value;
        d.location = location;
        true
      }
      None => {
        self.defines.insert(
          name.to_string(),
          Definition {
            name: name.to_string(),
            value,
            readonly: false,
            location,
          },
        );
        true
      }
    }
  }

  /// Install a readonly definition, replacing whatever was there.
  pub fn set_readonly(&mut self, name: &str, value: Value) {
    self.defines.insert(
      name.to_string(),
      Definition {
        name: name.to_string(),
        value,
        readonly: true,
        location: None,
      },
    );
  }

  /// Remove the named definitions and remember them; returns a save index
  /// for [`Scope::restore`].
  pub fn save(&mut self, names: &[&str]) -> usize {
    let mut saved = HashMap::with_capacity(names.len());
    for &name in names {
      saved.insert(name.to_string(), self.defines.remove(name));
    }
    let index = self.saved.len();
    self.saved.push(saved);
    index
  }

  /// Undo a [`Scope::save`], restoring the prior definitions.
  pub fn restore(&mut self, index: usize) {
    while self.saved.len() > index {
      let saved = self.saved.pop().expect("unbalanced scope restore");
      for (name, entry) in saved {
        match entry {
          Some(d) => {
            self.defines.insert(name, d);
          }
          None => {
            self.defines.remove(&name);
          }
        }
      }
    }
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.defines.keys().map(String::as_str)
  }
}
