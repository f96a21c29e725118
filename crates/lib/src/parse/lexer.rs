//! The stack-driven lexer.
//!
//! An explicit stack of `(node, return-state, counters, delimiter)` frames
//! drives the state machine, so calls can nest arbitrarily inside definition
//! values and rule lines without recursive descent. End of input performs one
//! synthetic step per remaining open frame so trailing constructs without a
//! terminating newline still produce their nodes.

use super::{Node, NodeId, NodeKind, ParseError, ScriptBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Global,
  Comment,
  LineHeadText,
  Define,
  DefineTextLine,
  Rule,
  RuleTextLine,
  InlineRecipe,
  TabbedRecipes,
  RecipeLine,
  Dollar,
  CallName,
  CallArg,
  AppendNode,
}

struct Frame {
  node: NodeId,
  /// State to return to when this frame pops.
  ret: State,
  /// Small per-frame counter: skip-leading-spaces flag, prefix-seen flag,
  /// nesting depth for arguments.
  code: u32,
  /// Closing delimiter for call frames.
  delim: char,
  /// Assignment kind picked up at the line head, consumed by `Define`.
  marker: Option<NodeKind>,
}

pub struct Lexer {
  name: String,
  text: String,
  /// Byte position just past the last read character.
  pos: usize,
  /// Last character from `get`; `None` marks the synthetic end-of-input step.
  ch: Option<char>,
  ch_len: usize,
  step: State,
  stack: Vec<Frame>,
  nodes: Vec<Node>,
  roots: Vec<NodeId>,
}

impl Lexer {
  pub fn new(name: &str, text: String) -> Self {
    Lexer {
      name: name.to_string(),
      text,
      pos: 0,
      ch: None,
      ch_len: 0,
      step: State::Global,
      stack: Vec::new(),
      nodes: Vec::new(),
      roots: Vec::new(),
    }
  }

  pub fn parse(mut self) -> Result<ScriptBuffer, ParseError> {
    let end = self.text.len();
    while self.pos < end {
      self.step_once()?;
    }

    // One synthetic step per remaining frame flushes pending nodes. A frame
    // that makes no progress is popped; an open call frame at this point is
    // an unterminated construct.
    while let Some(top) = self.stack.last() {
      let depth = self.stack.len();
      let node = top.node;
      self.step_once()?;
      let unchanged = self.stack.len() == depth && self.stack.last().map(|f| f.node) == Some(node);
      if unchanged {
        if matches!(self.step, State::Dollar | State::CallName | State::CallArg) {
          let (line, column) = line_col(&self.text, self.pos);
          return Err(ParseError::UnterminatedCall {
            script: self.name,
            line,
            column,
          });
        }
        self.pop();
      }
    }

    Ok(ScriptBuffer {
      name: self.name,
      text: self.text,
      nodes: self.nodes,
      roots: self.roots,
    })
  }

  // ---- character cursor ----

  fn get(&mut self) -> bool {
    if self.pos == self.text.len() {
      // Give every state one extra step to observe end of input.
      if self.ch.is_some() {
        self.ch = None;
        self.ch_len = 0;
        return true;
      }
      return false;
    }
    let c = self.text[self.pos..].chars().next().unwrap();
    if c == '\0' {
      return false;
    }
    self.ch = Some(c);
    self.ch_len = c.len_utf8();
    self.pos += self.ch_len;
    true
  }

  fn peek(&self) -> Option<char> {
    self.text[self.pos..].chars().next()
  }

  fn unget(&mut self) {
    debug_assert!(self.ch.is_some() && self.ch_len > 0);
    self.pos -= self.ch_len;
    self.ch = None;
    self.ch_len = 0;
  }

  /// Step back over trailing whitespace, returning the new end offset.
  fn backward_non_space(&self, mut i: usize) -> usize {
    while i > 0 {
      let c = self.text[..i].chars().next_back().unwrap();
      if c.is_whitespace() {
        i -= c.len_utf8();
      } else {
        break;
      }
    }
    i
  }

  // ---- node and frame plumbing ----

  fn new_node(&mut self, kind: NodeKind) -> NodeId {
    self.nodes.push(Node {
      kind,
      pos: self.pos,
      end: self.pos,
      children: Vec::new(),
    });
    self.nodes.len() - 1
  }

  fn push(&mut self, kind: NodeKind, next: State) -> usize {
    let node = self.new_node(kind);
    self.stack.push(Frame {
      node,
      ret: self.step,
      code: 0,
      delim: '\0',
      marker: None,
    });
    self.step = next;
    self.stack.len() - 1
  }

  fn pop(&mut self) -> Frame {
    let frame = self.stack.pop().expect("pop on empty lexer stack");
    self.step = frame.ret;
    frame
  }

  fn top(&mut self) -> &mut Frame {
    self.stack.last_mut().expect("top on empty lexer stack")
  }

  fn attach_to_top(&mut self, child: NodeId) {
    match self.stack.last() {
      Some(f) => {
        let parent = f.node;
        self.nodes[parent].children.push(child);
      }
      None => self.roots.push(child),
    }
  }

  /// Close the pending node's end, excluding a consumed newline.
  fn finish_node(&mut self, node: NodeId) {
    let mut end = self.pos;
    if self.ch == Some('\n') {
      end -= 1;
    }
    let n = &mut self.nodes[node];
    n.end = end.max(n.pos);
  }

  // ---- state dispatch ----

  fn step_once(&mut self) -> Result<(), ParseError> {
    match self.step {
      State::Global => self.state_global(),
      State::Comment => self.state_comment(),
      State::LineHeadText => self.state_line_head_text(),
      State::Define => self.state_define()?,
      State::DefineTextLine => self.state_define_text_line(),
      State::Rule => self.state_rule(),
      State::RuleTextLine => self.state_rule_text_line(),
      State::InlineRecipe => self.state_inline_recipe(),
      State::TabbedRecipes => self.state_tabbed_recipes(),
      State::RecipeLine => self.state_recipe_line(),
      State::Dollar => self.state_dollar(),
      State::CallName => self.state_call_name(),
      State::CallArg => self.state_call_arg(),
      State::AppendNode => self.state_append_node(),
    }
    Ok(())
  }

  fn state_global(&mut self) {
    while self.get() {
      match self.ch {
        Some('#') => {
          let i = self.push(NodeKind::Comment, State::Comment);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some(c) if !c.is_whitespace() => {
          self.unget();
          self.push(NodeKind::ImmediateText, State::LineHeadText);
          return;
        }
        _ => {}
      }
    }
  }

  fn state_comment(&mut self) {
    while self.get() {
      match self.ch {
        Some('\\') => {
          // A continued comment line stays in the same node.
          if self.peek() == Some('\n') {
            self.get();
          }
        }
        Some('\n') if self.peek() == Some('#') => {
          // Merge immediately following comment lines into one block.
        }
        Some('\n') | None => {
          let frame = self.pop();
          self.finish_node(frame.node);
          self.attach_to_top(frame.node);
          return;
        }
        _ => {}
      }
    }
  }

  fn state_line_head_text(&mut self) {
    while self.get() {
      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some('=') => {
          self.top().marker = Some(NodeKind::DefineDeferred);
          self.step = State::Define;
          return;
        }
        Some('?') if self.peek() == Some('=') => {
          self.get();
          self.top().marker = Some(NodeKind::DefineQuestioned);
          self.step = State::Define;
          return;
        }
        Some('!') if self.peek() == Some('=') => {
          self.get();
          self.top().marker = Some(NodeKind::DefineNot);
          self.step = State::Define;
          return;
        }
        Some('+') if self.peek() == Some('=') => {
          self.get();
          self.top().marker = Some(NodeKind::DefineAppend);
          self.step = State::Define;
          return;
        }
        Some(':') => {
          if self.peek() == Some('=') {
            self.get();
            self.top().marker = Some(NodeKind::DefineSingleColoned);
            self.step = State::Define;
          } else {
            let end = self.backward_non_space(self.pos - 1);
            let node = self.top().node;
            self.nodes[node].end = end;
            self.step = State::Rule;
          }
          return;
        }
        Some('.') => {
          let part = self.new_node(NodeKind::NamePart);
          self.nodes[part].pos = self.pos - 1;
          let node = self.top().node;
          self.nodes[node].children.push(part);
        }
        Some('#') | Some('\n') => {
          let frame = self.pop();
          self.nodes[frame.node].end = self.pos - 1;
          self.roots.push(frame.node);
          if self.ch == Some('#') {
            let i = self.push(NodeKind::Comment, State::Comment);
            self.nodes[self.stack[i].node].pos -= 1;
          }
          return;
        }
        _ => {
          let node = self.top().node;
          self.escape_text_line(node);
        }
      }
    }
  }

  fn state_define(&mut self) -> Result<(), ParseError> {
    let name_frame = self.pop();
    let kind = name_frame.marker.unwrap_or(NodeKind::DefineDeferred);

    // Token width decides how far the name extends; value nodes of the
    // immediate kinds expand at definition time.
    let (token_len, value_kind) = match kind {
      NodeKind::DefineDeferred => (1, NodeKind::DeferredText),
      NodeKind::DefineDoubleColoned => (3, NodeKind::ImmediateText),
      NodeKind::DefineSingleColoned | NodeKind::DefineNot => (2, NodeKind::ImmediateText),
      _ => (2, NodeKind::DeferredText),
    };

    let name = name_frame.node;
    let name_end = self.backward_non_space(self.pos - token_len);
    self.nodes[name].end = name_end;
    if self.nodes[name].is_empty() && self.nodes[name].children.is_empty() {
      let (line, column) = line_col(&self.text, self.nodes[name].pos);
      return Err(ParseError::EmptyAssignName {
        script: self.name.clone(),
        line,
        column,
      });
    }

    let i = self.push(kind, State::AppendNode);
    let define = self.stack[i].node;
    // The whole statement, name included, so child ranges nest.
    self.nodes[define].pos = self.nodes[name].pos;
    self.nodes[define].children.push(name);

    let j = self.push(value_kind, State::DefineTextLine);
    let value = self.stack[j].node;
    self.nodes[define].children.push(value);
    Ok(())
  }

  fn state_define_text_line(&mut self) {
    while self.get() {
      if self.top().code == 0 {
        match self.ch {
          Some(c) if !c.is_whitespace() => {
            let (pos, len) = (self.pos, self.ch_len);
            let top = self.top();
            top.code = 1;
            let node = top.node;
            self.nodes[node].pos = pos - len;
          }
          Some(c) if c != '\n' => {
            let pos = self.pos;
            let node = self.top().node;
            self.nodes[node].pos = pos;
            continue;
          }
          _ => {}
        }
      }

      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some('#') => {
          self.unget();
          let frame = self.pop();
          self.finish_node(frame.node);
          return;
        }
        Some('\n') | None => {
          let frame = self.pop();
          self.finish_node(frame.node);
          return;
        }
        _ => {
          let node = self.top().node;
          self.escape_text_line(node);
        }
      }
    }
  }

  fn state_rule(&mut self) {
    let mut kind = NodeKind::RuleSingleColoned;
    if self.peek() == Some(':') {
      self.get();
      if self.peek() == Some('=') {
        // `::=` turned out to be a definition after all.
        self.get();
        self.top().marker = Some(NodeKind::DefineDoubleColoned);
        self.step = State::Define;
        return;
      }
      kind = NodeKind::RuleDoubleColoned;
    }

    let targets_frame = self.pop();
    let targets = targets_frame.node;
    self.nodes[targets].kind = NodeKind::Targets;

    let i = self.push(kind, State::AppendNode);
    let rule = self.stack[i].node;
    // The rule starts at its first target, so child ranges nest.
    self.nodes[rule].pos = self.nodes[targets].pos;
    self.nodes[rule].children.push(targets);

    let j = self.push(NodeKind::Prerequisites, State::RuleTextLine);
    let prerequisites = self.stack[j].node;
    self.nodes[rule].children.push(prerequisites);
  }

  fn state_rule_text_line(&mut self) {
    while self.get() {
      if self.top().code == 0 {
        let head = match self.ch {
          Some('\n') => true,
          Some(c) => !c.is_whitespace(),
          None => false,
        };
        if head {
          let (pos, len) = (self.pos, self.ch_len);
          let top = self.top();
          top.code = 1;
          let node = top.node;
          self.nodes[node].pos = pos - len;
        }
      }

      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some('#') | Some(';') | Some('\n') | None => {
          let frame = self.pop();
          let mut end = self.pos;
          if self.ch.is_some() {
            end -= 1;
          }
          let n = &mut self.nodes[frame.node];
          n.end = end.max(n.pos);

          match self.ch {
            Some(';') => {
              let end = self.backward_non_space(self.pos - 1);
              let n = &mut self.nodes[frame.node];
              n.end = end.max(n.pos);
              self.push(NodeKind::Recipe, State::InlineRecipe);
            }
            Some('#') => {
              let i = self.push(NodeKind::Comment, State::Comment);
              self.nodes[self.stack[i].node].pos -= 1;
            }
            Some('\n') => {
              if matches!(self.peek(), Some('\t') | Some('#')) {
                self.push(NodeKind::Recipes, State::TabbedRecipes);
              }
            }
            _ => {}
          }
          return;
        }
        _ => {
          let node = self.top().node;
          self.escape_text_line(node);
        }
      }
    }
  }

  fn state_inline_recipe(&mut self) {
    while self.get() {
      if self.top().code == 0
        && let Some(c) = self.ch
        && !c.is_whitespace()
      {
        let (pos, len) = (self.pos, self.ch_len);
        let top = self.top();
        top.code = 1;
        let node = top.node;
        self.nodes[node].pos = pos - len;
      }

      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some('\n') | None => {
          let frame = self.pop();
          self.finish_node(frame.node);
          self.attach_to_top(frame.node);
          if self.peek() == Some('#') {
            let i = self.push(NodeKind::Comment, State::Comment);
            self.nodes[self.stack[i].node].pos -= 1;
          }
          return;
        }
        _ => {
          let node = self.top().node;
          self.escape_text_line(node);
        }
      }
    }
  }

  fn state_tabbed_recipes(&mut self) {
    if !self.get() {
      return;
    }
    match self.ch {
      Some('\t') => {
        self.push(NodeKind::Recipe, State::RecipeLine);
      }
      Some('#') => {
        let i = self.push(NodeKind::Comment, State::Comment);
        self.nodes[self.stack[i].node].pos -= 1;
      }
      _ => {
        // A non-tab line ends the recipe block; hand the character back so
        // the next construct starts cleanly.
        if matches!(self.ch, Some(c) if c != '\n') {
          self.unget();
        }
        let frame = self.pop();
        self.finish_node(frame.node);
        self.attach_to_top(frame.node);
      }
    }
  }

  fn state_recipe_line(&mut self) {
    while self.get() {
      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some('\n') | None => {
          let frame = self.pop();
          self.finish_node(frame.node);
          self.attach_to_top(frame.node);
          return;
        }
        _ => {}
      }
    }
  }

  fn state_dollar(&mut self) {
    if !self.get() {
      return;
    }
    match self.ch {
      Some('(') => {
        let i = self.push(NodeKind::Name, State::CallName);
        self.stack[i].delim = ')';
      }
      Some('{') => {
        let i = self.push(NodeKind::Name, State::CallName);
        self.stack[i].delim = '}';
      }
      _ => {
        // Bare form: the single next character is the whole call.
        let name = self.new_node(NodeKind::Name);
        self.nodes[name].pos = self.pos - self.ch_len;
        let call = self.top().node;
        self.nodes[call].children.push(name);
        self.end_call();
      }
    }
  }

  fn state_call_name(&mut self) {
    let delim = self.top().delim;
    while self.get() {
      let prefix_seen = self.top().code;
      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some(':') if prefix_seen == 0 => {
          let prefix = self.new_node(NodeKind::NamePrefix);
          self.nodes[prefix].pos = self.pos - 1;
          let top = self.top();
          top.code += 1;
          let node = top.node;
          self.nodes[node].children.push(prefix);
        }
        Some('.') => {
          let part = self.new_node(NodeKind::NamePart);
          self.nodes[part].pos = self.pos - 1;
          let node = self.top().node;
          self.nodes[node].children.push(part);
        }
        Some('\\') => {
          let node = self.top().node;
          self.escape_text_line(node);
        }
        Some(c) if c == ' ' || c == delim => {
          let frame = self.pop();
          self.nodes[frame.node].end = self.pos - 1;
          let call = self.top().node;
          self.nodes[call].children.push(frame.node);
          if c == delim {
            self.end_call();
          } else {
            let i = self.push(NodeKind::Arg, State::CallArg);
            self.stack[i].delim = delim;
          }
          return;
        }
        _ => {}
      }
    }
  }

  fn state_call_arg(&mut self) {
    let delim = self.top().delim;
    let open = if delim == ')' { '(' } else { '{' };
    while self.get() {
      let depth = self.top().code;
      match self.ch {
        Some('$') => {
          let i = self.push(NodeKind::Call, State::Dollar);
          self.nodes[self.stack[i].node].pos -= 1;
          return;
        }
        Some('\\') => {
          let node = self.top().node;
          self.escape_text_line(node);
        }
        Some(c) if c == open => {
          // Nested same-kind parentheses stay part of the argument text.
          self.top().code += 1;
        }
        Some(c) if c == delim && depth > 0 => {
          self.top().code -= 1;
        }
        Some(c) if (c == ',' || c == delim) && depth == 0 => {
          let frame = self.pop();
          self.nodes[frame.node].end = self.pos - 1;
          let call = self.top().node;
          self.nodes[call].children.push(frame.node);
          if c == delim {
            self.end_call();
          } else {
            let i = self.push(NodeKind::Arg, State::CallArg);
            self.stack[i].delim = delim;
          }
          return;
        }
        _ => {}
      }
    }
  }

  fn state_append_node(&mut self) {
    let frame = self.pop();
    let n = &mut self.nodes[frame.node];
    if n.end < self.pos {
      n.end = self.pos;
      if self.ch == Some('\n') {
        n.end -= 1;
      }
    }
    self.roots.push(frame.node);
  }

  fn end_call(&mut self) {
    let frame = self.pop();
    self.nodes[frame.node].end = self.pos;
    self.attach_to_top(frame.node);
  }

  /// Turn `\#` and `\<newline>` into explicit escape child nodes.
  fn escape_text_line(&mut self, node: NodeId) {
    if self.ch != Some('\\') {
      return;
    }
    if self.get()
      && let Some(c) = self.ch
      && (c == '#' || c == '\n')
    {
      let escape = self.new_node(NodeKind::Escape);
      self.nodes[escape].pos -= 2;
      self.nodes[node].children.push(escape);
    }
  }
}

fn line_col(text: &str, offset: usize) -> (usize, usize) {
  let offset = offset.min(text.len());
  let before = &text[..offset];
  let line = before.matches('\n').count() + 1;
  let column = match before.rfind('\n') {
    Some(i) => offset - i,
    None => offset + 1,
  };
  (line, column)
}

#[cfg(test)]
mod tests {
  use crate::parse::{NodeKind, parse_script};

  #[test]
  fn comment_block_merges_following_lines() {
    let buf = parse_script("t", "# one\n# two\nx = 1\n").unwrap();
    assert_eq!(buf.roots.len(), 2);
    let comment = buf.node(buf.roots[0]);
    assert_eq!(comment.kind, NodeKind::Comment);
    assert_eq!(buf.str_of(buf.roots[0]), "# one\n# two");
  }

  #[test]
  fn define_kinds_are_distinguished() {
    let cases = [
      ("a = 1\n", NodeKind::DefineDeferred),
      ("a ?= 1\n", NodeKind::DefineQuestioned),
      ("a := 1\n", NodeKind::DefineSingleColoned),
      ("a ::= 1\n", NodeKind::DefineDoubleColoned),
      ("a != echo 1\n", NodeKind::DefineNot),
      ("a += 1\n", NodeKind::DefineAppend),
    ];
    for (src, kind) in cases {
      let buf = parse_script("t", src).unwrap();
      assert_eq!(buf.roots.len(), 1, "source {src:?}");
      let define = buf.node(buf.roots[0]);
      assert_eq!(define.kind, kind, "source {src:?}");
      assert_eq!(buf.str_of(define.children[0]), "a", "source {src:?}");
    }
  }

  #[test]
  fn define_without_trailing_newline_is_flushed() {
    let buf = parse_script("t", "name = value").unwrap();
    assert_eq!(buf.roots.len(), 1);
    let define = buf.node(buf.roots[0]);
    assert_eq!(define.kind, NodeKind::DefineDeferred);
    assert_eq!(buf.str_of(define.children[0]), "name");
    assert_eq!(buf.str_of(define.children[1]), "value");
  }

  #[test]
  fn node_ranges_nest_within_parents() {
    let buf = parse_script("t", "a = x $(f u,v) y\n").unwrap();
    for (id, node) in buf.nodes.iter().enumerate() {
      assert!(node.end <= buf.text.len(), "node {id} range past buffer end");
      for &c in &node.children {
        let child = buf.node(c);
        assert!(
          node.pos <= child.pos && child.end <= node.end,
          "child {c} range escapes parent {id}"
        );
      }
    }
  }

  #[test]
  fn call_with_args_splits_name_and_arguments() {
    let buf = parse_script("t", "a = $(join x,y z)\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    assert_eq!(call.kind, NodeKind::Call);
    assert_eq!(buf.str_of(call.children[0]), "join");
    assert_eq!(buf.str_of(call.children[1]), "x");
    assert_eq!(buf.str_of(call.children[2]), "y z");
  }

  #[test]
  fn nested_call_inside_argument() {
    let buf = parse_script("t", "a = $(f $(g x),y)\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    assert_eq!(call.children.len(), 3);
    let arg = buf.node(call.children[1]);
    assert_eq!(arg.kind, NodeKind::Arg);
    let inner = buf.node(arg.children[0]);
    assert_eq!(inner.kind, NodeKind::Call);
    assert_eq!(buf.str_of(inner.children[0]), "g");
  }

  #[test]
  fn nested_parentheses_do_not_close_the_call() {
    let buf = parse_script("t", "a = $(f (x, y) z)\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    assert_eq!(buf.str_of(call.children[0]), "f");
    // The parenthesized group stays inside one argument.
    assert_eq!(buf.str_of(call.children[1]), "(x, y) z");
  }

  #[test]
  fn bare_dollar_call_takes_one_character() {
    let buf = parse_script("t", "a = $x\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    assert_eq!(call.kind, NodeKind::Call);
    assert_eq!(buf.str_of(call.children[0]), "x");
  }

  #[test]
  fn curly_call_form() {
    let buf = parse_script("t", "a = ${f x}\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    assert_eq!(buf.str_of(call.children[0]), "f");
    assert_eq!(buf.str_of(call.children[1]), "x");
  }

  #[test]
  fn rule_with_tabbed_recipes() {
    let buf = parse_script("t", "out : in1 in2\n\techo one\n\techo two\nx = 1\n").unwrap();
    assert_eq!(buf.roots.len(), 2);
    let rule = buf.node(buf.roots[0]);
    assert_eq!(rule.kind, NodeKind::RuleSingleColoned);
    assert_eq!(buf.str_of(rule.children[0]), "out");
    assert_eq!(buf.str_of(rule.children[1]), "in1 in2");
    let recipes = buf.node(rule.children[2]);
    assert_eq!(recipes.kind, NodeKind::Recipes);
    let lines: Vec<&str> = recipes.children.iter().map(|&c| buf.str_of(c)).collect();
    assert_eq!(lines, ["echo one", "echo two"]);
    // The following definition still parses.
    assert_eq!(buf.node(buf.roots[1]).kind, NodeKind::DefineDeferred);
  }

  #[test]
  fn double_colon_rule() {
    let buf = parse_script("t", "out :: in\n").unwrap();
    let rule = buf.node(buf.roots[0]);
    assert_eq!(rule.kind, NodeKind::RuleDoubleColoned);
  }

  #[test]
  fn inline_recipe_after_semicolon() {
    let buf = parse_script("t", "out : in ; echo hi\n").unwrap();
    let rule = buf.node(buf.roots[0]);
    assert_eq!(rule.children.len(), 3);
    assert_eq!(buf.str_of(rule.children[1]), "in");
    let recipe = buf.node(rule.children[2]);
    assert_eq!(recipe.kind, NodeKind::Recipe);
    assert_eq!(buf.str_of(rule.children[2]), "echo hi");
  }

  #[test]
  fn escapes_are_preserved_as_child_nodes() {
    let buf = parse_script("t", "a = x\\#y\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let escape = buf.node(value.children[0]);
    assert_eq!(escape.kind, NodeKind::Escape);
    assert_eq!(buf.str_of(value.children[0]), "\\#");
    // The raw source is still recoverable from the value range.
    assert_eq!(buf.str_of(define.children[1]), "x\\#y");
  }

  #[test]
  fn unterminated_call_is_an_error() {
    let err = parse_script("t", "a = $(foo bar").unwrap_err();
    assert!(matches!(
      err,
      crate::parse::ParseError::UnterminatedCall { .. }
    ));
  }

  #[test]
  fn empty_assignment_name_is_an_error() {
    let err = parse_script("t", " = 1\n").unwrap_err();
    assert!(matches!(
      err,
      crate::parse::ParseError::EmptyAssignName { .. }
    ));
  }

  #[test]
  fn compound_name_parts_are_marked() {
    let buf = parse_script("t", "a = $(me.src)\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    let name = buf.node(call.children[0]);
    let parts: Vec<_> = name.children.iter().map(|&c| buf.node(c).kind).collect();
    assert_eq!(parts, [NodeKind::NamePart]);
  }

  #[test]
  fn prefixed_name_is_marked() {
    let buf = parse_script("t", "a = $(gcc:flags)\n").unwrap();
    let define = buf.node(buf.roots[0]);
    let value = buf.node(define.children[1]);
    let call = buf.node(value.children[0]);
    let name = buf.node(call.children[0]);
    let kinds: Vec<_> = name.children.iter().map(|&c| buf.node(c).kind).collect();
    assert_eq!(kinds, [NodeKind::NamePrefix]);
  }
}
