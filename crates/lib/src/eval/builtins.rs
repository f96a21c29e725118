//! The builtin table: the name to function registry invoked during
//! expansion.
//!
//! Arguments arrive unexpanded so conditionals can skip evaluating the
//! branch they do not take; most builtins expand everything up front.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::module::PendingBuild;

use super::scope::Value;
use super::{Context, EvalError};

pub(crate) type Builtin = fn(&mut Context, &[Value]) -> Result<Value, EvalError>;

pub(crate) fn lookup(name: &str) -> Option<Builtin> {
  Some(match name {
    "dir" => builtin_dir,
    "info" => builtin_info,
    "upper" => builtin_upper,
    "lower" => builtin_lower,
    "title" => builtin_title,
    "when" => builtin_when,
    "unless" => builtin_unless,
    "let" => builtin_let,
    "set" => builtin_set,
    "expr" => builtin_expr,
    "=" => builtin_assign,
    "?=" => builtin_assign_conditional,
    "+=" => builtin_append,
    "call" => builtin_call,
    "module" => builtin_module,
    "use" => builtin_use,
    "build" => builtin_build,
    _ => return None,
  })
}

fn expand_all(ctx: &mut Context, args: &[Value]) -> Result<Vec<String>, EvalError> {
  args.iter().map(|a| ctx.expand_value(a)).collect()
}

fn join(words: Vec<String>) -> Value {
  Value::text(
    words
      .into_iter()
      .filter(|w| !w.is_empty())
      .collect::<Vec<_>>()
      .join(" "),
  )
}

fn builtin_dir(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let dirs = expand_all(ctx, args)?
    .into_iter()
    .map(|a| dirname(&a))
    .collect();
  Ok(join(dirs))
}

fn dirname(path: &str) -> String {
  match Path::new(path).parent() {
    Some(p) if !p.as_os_str().is_empty() => p.display().to_string(),
    _ => ".".to_string(),
  }
}

fn builtin_info(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let text = expand_all(ctx, args)?.join(" ");
  println!("{text}");
  Ok(Value::empty())
}

fn builtin_upper(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let words = expand_all(ctx, args)?
    .into_iter()
    .map(|s| s.to_uppercase())
    .collect();
  Ok(join(words))
}

fn builtin_lower(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let words = expand_all(ctx, args)?
    .into_iter()
    .map(|s| s.to_lowercase())
    .collect();
  Ok(join(words))
}

fn builtin_title(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let words = expand_all(ctx, args)?
    .into_iter()
    .map(|s| title_case(&s))
    .collect();
  Ok(join(words))
}

fn title_case(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut at_word_start = true;
  for c in text.chars() {
    if c.is_whitespace() {
      at_word_start = true;
      out.push(c);
    } else if at_word_start {
      out.extend(c.to_uppercase());
      at_word_start = false;
    } else {
      out.extend(c.to_lowercase());
    }
  }
  out
}

/// `$(when cond, value...)`: expand values only when the condition is
/// non-empty.
fn builtin_when(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(cond) = args.first() else {
    return Ok(Value::empty());
  };
  if ctx.expand_value(cond)?.trim().is_empty() {
    return Ok(Value::empty());
  }
  Ok(join(expand_all(ctx, &args[1..])?))
}

/// `$(unless cond, value...)`: the inverse of `when`.
fn builtin_unless(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(cond) = args.first() else {
    return Ok(Value::empty());
  };
  if !ctx.expand_value(cond)?.trim().is_empty() {
    return Ok(Value::empty());
  }
  Ok(join(expand_all(ctx, &args[1..])?))
}

/// `$(let name, value, body...)`: expand the body with a temporary binding,
/// restoring the prior definition afterwards.
fn builtin_let(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  if args.len() < 2 {
    return Ok(Value::empty());
  }
  let name = ctx.expand_value(&args[0])?.trim().to_string();
  let bound = ctx.expand_value(&args[1])?;

  let (scoped, prefix, parts) = Context::expand_name_string(&name);
  let Some(ns) = ctx.find_namespace(scoped, &prefix, &parts) else {
    return Err(EvalError::NoNamespace { name });
  };
  let sym = parts.last().expect("name with no parts").clone();
  let mark = ctx
    .scope_mut_ref(&ns)
    .ok_or(EvalError::NoNamespace { name: name.clone() })?
    .save(&[sym.as_str()]);
  ctx.set_with_details(scoped, &prefix, &parts, Value::text(bound))?;

  let body = expand_all(ctx, &args[2..]);
  if let Some(scope) = ctx.scope_mut_ref(&ns) {
    scope.restore(mark);
  }
  Ok(join(body?))
}

/// `$(set name, value...)`: immediate assignment.
fn builtin_set(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(name) = args.first() else {
    return Ok(Value::empty());
  };
  let name = ctx.expand_value(name)?.trim().to_string();
  let text = expand_all(ctx, &args[1..])?.join(" ");
  ctx.set(&name, Value::text(text))?;
  Ok(Value::empty())
}

/// `$(= name, value...)`: deferred assignment, keeping the arguments
/// unexpanded.
fn builtin_assign(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(name) = args.first() else {
    return Ok(Value::empty());
  };
  let name = ctx.expand_value(name)?.trim().to_string();
  ctx.set(&name, deferred_value(&args[1..]))?;
  Ok(Value::empty())
}

/// `$(?= name, value...)`: assign only when the name expands empty.
fn builtin_assign_conditional(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(name) = args.first() else {
    return Ok(Value::empty());
  };
  let name = ctx.expand_value(name)?.trim().to_string();
  if ctx.expand_call(&name)?.is_empty() {
    ctx.set(&name, deferred_value(&args[1..]))?;
  }
  Ok(Value::empty())
}

/// `$(+= name, value...)`: append, with the same lazy or eager behavior as
/// the `+=` statement.
fn builtin_append(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(name) = args.first() else {
    return Ok(Value::empty());
  };
  let name = ctx.expand_value(name)?.trim().to_string();
  let (scoped, prefix, parts) = Context::expand_name_string(&name);
  let fragments: Vec<_> = args[1..]
    .iter()
    .flat_map(|a| a.fragments().iter().cloned())
    .collect();
  ctx.append_with_details(scoped, &prefix, &parts, &fragments)?;
  Ok(Value::empty())
}

fn deferred_value(args: &[Value]) -> Value {
  let mut value = Value::empty();
  for a in args {
    for fragment in a.fragments() {
      value.push(fragment.clone());
    }
  }
  value
}

/// `$(call name, a, b...)`: indirect expansion with positional arguments
/// bound as `1`, `2`, ...
fn builtin_call(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(name) = args.first() else {
    return Ok(Value::empty());
  };
  let name = ctx.expand_value(name)?.trim().to_string();
  let positional = expand_all(ctx, &args[1..])?;

  let numbers: Vec<String> = (1..=positional.len()).map(|i| i.to_string()).collect();
  let names: Vec<&str> = numbers.iter().map(String::as_str).collect();
  let mark = ctx.globals_mut().save(&names);
  for (i, arg) in positional.into_iter().enumerate() {
    ctx.globals_mut().set(&(i + 1).to_string(), Value::text(arg), None);
  }
  let result = ctx.expand_call(&name);
  ctx.globals_mut().restore(mark);
  Ok(Value::text(result?))
}

/// `$(expr ...)`: integer arithmetic over the expanded argument text.
fn builtin_expr(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let text = expand_all(ctx, args)?.join(" ");
  let value = eval_expr(&text)?;
  Ok(Value::text(value.to_string()))
}

/// `$(module name, toolset, kind, NAME=value...)`: declare or reopen a
/// module and hand the rest to the toolset.
fn builtin_module(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let expanded = expand_all(ctx, args)?;
  let arg = |i: usize| expanded.get(i).map(|s| s.trim()).unwrap_or("");

  let name = arg(0).to_string();
  let toolset_name = arg(1).to_string();
  let kind = arg(2).to_string();
  if name.is_empty() {
    ctx.set_current_module(None);
    return Ok(Value::empty());
  }

  let id = ctx.declare_module(&name, &toolset_name, &kind)?;
  ctx.set_current_module(Some(id));

  let (vars, rest) = split_var_args(&expanded[expanded.len().min(3)..]);
  if let Some(toolset) = ctx.toolset(&toolset_name) {
    if !toolset.config_module(ctx, id, &rest, &vars) {
      warn!(module = %name, toolset = %toolset_name, "toolset refused module configuration");
    }
  } else if !toolset_name.is_empty() {
    return Err(EvalError::UnknownToolset { name: toolset_name });
  }
  Ok(Value::empty())
}

/// Split `NAME=value` arguments from plain ones.
fn split_var_args(args: &[String]) -> (HashMap<String, String>, Vec<String>) {
  let mut vars = HashMap::new();
  let mut rest = Vec::new();
  for a in args {
    let a = a.trim();
    if a.is_empty() {
      continue;
    }
    match a.split_once('=') {
      Some((name, value)) if !name.is_empty() => {
        vars.insert(name.trim().to_string(), value.trim().to_string());
      }
      _ => rest.push(a.to_string()),
    }
  }
  (vars, rest)
}

/// `$(use names...)`: record dependency edges for the current module.
fn builtin_use(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(current) = ctx.current_module() else {
    return Err(EvalError::NoModule);
  };
  if ctx.module(current).toolset.is_empty() {
    return Err(EvalError::NoToolset {
      name: ctx.module(current).name.clone(),
    });
  }

  for a in expand_all(ctx, args)? {
    for name in a.split_whitespace() {
      let other = ctx.stub_module(name);
      ctx.module_mut(current).using.push(other);
      ctx.module_mut(other).used_by.push(current);
      debug!(module = %ctx.module(current).name, uses = %name, "dependency edge");
      let toolset_name = ctx.module(current).toolset.clone();
      if let Some(toolset) = ctx.toolset(&toolset_name) {
        toolset.use_module(ctx, current, other);
      }
    }
  }
  Ok(Value::empty())
}

/// `$(build args...)`: pend the current module onto the session build list.
fn builtin_build(ctx: &mut Context, args: &[Value]) -> Result<Value, EvalError> {
  let Some(current) = ctx.current_module() else {
    return Err(EvalError::NoModule);
  };
  let args = expand_all(ctx, args)?
    .into_iter()
    .map(|a| a.trim().to_string())
    .filter(|a| !a.is_empty())
    .collect();
  debug!(module = %ctx.module(current).name, "pending build");
  ctx.pending.push_back(PendingBuild {
    module: current,
    args,
  });
  Ok(Value::empty())
}

// ---- expression evaluation ----

struct ExprParser<'a> {
  text: &'a [u8],
  pos: usize,
}

/// Evaluate `+ - * / %` with parentheses over signed integers.
fn eval_expr(text: &str) -> Result<i64, EvalError> {
  let mut parser = ExprParser {
    text: text.as_bytes(),
    pos: 0,
  };
  let value = parser.sum()?;
  parser.skip_spaces();
  if parser.pos != parser.text.len() {
    return Err(EvalError::Expr {
      message: format!("trailing input in `{text}`"),
    });
  }
  Ok(value)
}

impl ExprParser<'_> {
  fn skip_spaces(&mut self) {
    while self.pos < self.text.len() && self.text[self.pos].is_ascii_whitespace() {
      self.pos += 1;
    }
  }

  fn peek(&mut self) -> Option<u8> {
    self.skip_spaces();
    self.text.get(self.pos).copied()
  }

  fn sum(&mut self) -> Result<i64, EvalError> {
    let mut value = self.product()?;
    while let Some(op) = self.peek() {
      match op {
        b'+' => {
          self.pos += 1;
          value = value.wrapping_add(self.product()?);
        }
        b'-' => {
          self.pos += 1;
          value = value.wrapping_sub(self.product()?);
        }
        _ => break,
      }
    }
    Ok(value)
  }

  fn product(&mut self) -> Result<i64, EvalError> {
    let mut value = self.atom()?;
    while let Some(op) = self.peek() {
      match op {
        b'*' => {
          self.pos += 1;
          value = value.wrapping_mul(self.atom()?);
        }
        b'/' | b'%' => {
          self.pos += 1;
          let rhs = self.atom()?;
          if rhs == 0 {
            return Err(EvalError::Expr {
              message: "division by zero".to_string(),
            });
          }
          value = if op == b'/' { value / rhs } else { value % rhs };
        }
        _ => break,
      }
    }
    Ok(value)
  }

  fn atom(&mut self) -> Result<i64, EvalError> {
    match self.peek() {
      Some(b'(') => {
        self.pos += 1;
        let value = self.sum()?;
        if self.peek() != Some(b')') {
          return Err(EvalError::Expr {
            message: "missing closing parenthesis".to_string(),
          });
        }
        self.pos += 1;
        Ok(value)
      }
      Some(b'-') => {
        self.pos += 1;
        Ok(-self.atom()?)
      }
      Some(c) if c.is_ascii_digit() => {
        let start = self.pos;
        while self.pos < self.text.len() && self.text[self.pos].is_ascii_digit() {
          self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.text[start..self.pos]).expect("ascii digits");
        digits.parse().map_err(|_| EvalError::Expr {
          message: format!("number out of range: {digits}"),
        })
      }
      other => Err(EvalError::Expr {
        message: match other {
          Some(c) => format!("unexpected `{}`", c as char),
          None => "unexpected end of expression".to_string(),
        },
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use super::*;
  use crate::driver::BuildOptions;
  use crate::parse::parse_script;
  use crate::toolset::BasicToolset;

  fn context() -> Context {
    Context::new(BuildOptions::default())
  }

  fn process(ctx: &mut Context, source: &str) {
    let buf = parse_script("test.smelt", source).unwrap();
    ctx.process_buffer(&buf).unwrap();
  }

  #[test]
  fn dir_builtin() {
    let mut ctx = context();
    process(&mut ctx, "x = $(dir src/a/b.c,lib.c)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "src/a .");
  }

  #[test]
  fn case_builtins() {
    let mut ctx = context();
    process(
      &mut ctx,
      "u = $(upper abc)\nl = $(lower ABC)\nt = $(title hello world)\n",
    );
    assert_eq!(ctx.expand_call("u").unwrap(), "ABC");
    assert_eq!(ctx.expand_call("l").unwrap(), "abc");
    assert_eq!(ctx.expand_call("t").unwrap(), "Hello World");
  }

  #[test]
  fn when_takes_the_truthy_branch() {
    let mut ctx = context();
    process(&mut ctx, "cond = yes\nx = $(when $(cond),on)\ny = $(when $(nope),on)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "on");
    assert_eq!(ctx.expand_call("y").unwrap(), "");
  }

  #[test]
  fn unless_is_the_inverse() {
    let mut ctx = context();
    process(&mut ctx, "x = $(unless $(missing),fallback)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "fallback");
  }

  #[test]
  fn let_binds_temporarily() {
    let mut ctx = context();
    process(&mut ctx, "v = outer\nx := $(let v,inner,$(v))\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "inner");
    assert_eq!(ctx.expand_call("v").unwrap(), "outer");
  }

  #[test]
  fn set_assigns_immediately() {
    let mut ctx = context();
    process(&mut ctx, "a = 1\nignored := $(set x,$(a))\na = 2\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "1");
  }

  #[test]
  fn assign_builtin_is_deferred() {
    let mut ctx = context();
    process(&mut ctx, "a = 1\nignored := $(= x,$(a))\na = 2\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "2");
  }

  #[test]
  fn conditional_assign_builtin() {
    let mut ctx = context();
    process(&mut ctx, "i1 := $(?= x,first)\ni2 := $(?= x,second)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "first");
  }

  #[test]
  fn append_builtin() {
    let mut ctx = context();
    process(&mut ctx, "x = foo\ni := $(+= x,bar)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "foo bar");
  }

  #[test]
  fn call_binds_positional_arguments() {
    let mut ctx = context();
    process(&mut ctx, "greet = $(1), $(2)!\nx := $(call greet,hello,world)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "hello, world!");
  }

  #[test]
  fn expr_arithmetic() {
    assert_eq!(eval_expr("1 + 2 * 3").unwrap(), 7);
    assert_eq!(eval_expr("(1 + 2) * 3").unwrap(), 9);
    assert_eq!(eval_expr("10 / 3").unwrap(), 3);
    assert_eq!(eval_expr("10 % 3").unwrap(), 1);
    assert_eq!(eval_expr("-4 + 1").unwrap(), -3);
  }

  #[test]
  fn expr_division_by_zero_errors() {
    assert!(matches!(eval_expr("1 / 0"), Err(EvalError::Expr { .. })));
  }

  #[test]
  fn expr_through_script() {
    let mut ctx = context();
    process(&mut ctx, "n = 3\nx := $(expr $(n) * 7)\n");
    assert_eq!(ctx.expand_call("x").unwrap(), "21");
  }

  #[test]
  fn module_requires_registered_toolset() {
    let mut ctx = context();
    let buf = parse_script("test.smelt", "$(module demo, missing, exe)\n").unwrap();
    let err = ctx.process_buffer(&buf).unwrap_err();
    assert!(matches!(err, EvalError::UnknownToolset { .. }));
  }

  #[test]
  fn module_declares_and_scopes() {
    let mut ctx = context();
    ctx.register_toolset("fake", Rc::new(BasicToolset)).unwrap();
    process(
      &mut ctx,
      "$(module demo, fake, exe)\nme.src = a.c b.c\nx := $(demo.src)\n",
    );
    let id = ctx.module_id("demo").unwrap();
    assert_eq!(ctx.module(id).toolset, "fake");
    assert_eq!(ctx.module(id).kind, "exe");
    assert_eq!(ctx.expand_call("x").unwrap(), "a.c b.c");
  }

  #[test]
  fn module_redeclaration_conflict_is_fatal() {
    let mut ctx = context();
    ctx.register_toolset("fake", Rc::new(BasicToolset)).unwrap();
    ctx.register_toolset("other", Rc::new(BasicToolset)).unwrap();
    process(&mut ctx, "$(module demo, fake, exe)\n");
    let buf = parse_script("test.smelt", "$(module demo, other, exe)\n").unwrap();
    let err = ctx.process_buffer(&buf).unwrap_err();
    assert!(matches!(err, EvalError::ModuleConflict { .. }));
  }

  #[test]
  fn module_redeclaration_may_add_information() {
    let mut ctx = context();
    ctx.register_toolset("fake", Rc::new(BasicToolset)).unwrap();
    process(&mut ctx, "$(use helper)\n$(module demo, fake, exe)\n");
    // A stub created by use() has no toolset yet; redeclaring it with one
    // fills in the blanks.
    process(&mut ctx, "$(module helper, fake, lib)\n");
    let id = ctx.module_id("helper").unwrap();
    assert_eq!(ctx.module(id).toolset, "fake");
  }

  #[test]
  fn use_creates_stub_modules_and_edges() {
    let mut ctx = context();
    ctx.register_toolset("fake", Rc::new(BasicToolset)).unwrap();
    process(&mut ctx, "$(module demo, fake, exe)\n$(use dep1 dep2)\n");
    let demo = ctx.module_id("demo").unwrap();
    let dep1 = ctx.module_id("dep1").unwrap();
    assert_eq!(ctx.module(demo).using.len(), 2);
    assert_eq!(ctx.module(dep1).used_by, vec![demo]);
  }

  #[test]
  fn use_outside_module_is_fatal() {
    let mut ctx = context();
    let buf = parse_script("test.smelt", "$(use dep)\n").unwrap();
    let err = ctx.process_buffer(&buf).unwrap_err();
    assert!(matches!(err, EvalError::NoModule));
  }

  #[test]
  fn build_pends_the_current_module() {
    let mut ctx = context();
    ctx.register_toolset("fake", Rc::new(BasicToolset)).unwrap();
    process(&mut ctx, "$(module demo, fake, exe)\n$(build)\n");
    assert_eq!(ctx.pending.len(), 1);
  }

  #[test]
  fn var_args_split() {
    let (vars, rest) = split_var_args(&[
      "PLATFORM=android-9".to_string(),
      "extra".to_string(),
      " ".to_string(),
    ]);
    assert_eq!(vars.get("PLATFORM").map(String::as_str), Some("android-9"));
    assert_eq!(rest, ["extra"]);
  }
}
