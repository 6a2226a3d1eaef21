//! The handful of globals the execution engine needs a script-visible
//! surface to exercise: `error`/`pcall`/`assert` for protected calls,
//! `rawget`/`rawset`/`rawequal`/`next`/`setmetatable`/`getmetatable` for
//! the data model's raw-access and metatable machinery, `type`/`tostring`/
//! `tonumber`/`select` for basic value introspection, and `pairs`/`ipairs`
//! so generic `for` has something to iterate.
//!
//! String, math, table and io libraries are deliberately absent -- they're
//! out of scope for this core, layered on top of the embedding API by an
//! external collaborator instead.

use ember_value::{Closure, NativeContext, Table, Value};

use crate::state::State;
use crate::vm::format_number;

pub fn install(state: &State) {
    let mut define = |name: &'static str, f: ember_value::NativeFn| {
        let closure = state.heap().alloc(Closure::new_native(f, name, vec![]));
        state
            .globals
            .set(Value::String(state.intern(name)), Value::Closure(closure))
            .expect("interned string keys are never nil");
    };

    define("error", error_fn);
    define("assert", assert_fn);
    define("pcall", pcall_fn);
    define("type", type_fn);
    define("tostring", tostring_fn);
    define("tonumber", tonumber_fn);
    define("rawequal", rawequal_fn);
    define("rawget", rawget_fn);
    define("rawset", rawset_fn);
    define("rawlen", rawlen_fn);
    define("next", next_fn);
    define("pairs", pairs_fn);
    define("ipairs", ipairs_fn);
    define("setmetatable", setmetatable_fn);
    define("getmetatable", getmetatable_fn);
    define("select", select_fn);
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::Nil)
}

/// `error(message, [level])`: raises `message` as the protected-call error
/// object. A string message is prefixed with the call site's position
/// unless `level == 0`, matching the data model's `"<chunk>:<line>:
/// <message>"` convention for runtime errors.
fn error_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let message = arg(args, 0);
    let level = arg(args, 1).as_number().unwrap_or(1.0);
    let raised = match message {
        Value::String(s) if level != 0.0 => {
            let (chunk, line) = ctx.position();
            Value::String(ctx.intern(&format!("{chunk}:{line}: {}", s.as_str())))
        }
        other => other,
    };
    Err(raised)
}

/// `assert(v, [message])`: returns all arguments if `v` is truthy,
/// otherwise raises `message` (default `"assertion failed!"`).
fn assert_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    if arg(args, 0).is_truthy() {
        Ok(args.to_vec())
    } else {
        let message = args
            .get(1)
            .copied()
            .unwrap_or_else(|| Value::String(ctx.intern("assertion failed!")));
        Err(message)
    }
}

/// `pcall(f, ...)`: calls `f` with the remaining arguments, catching any
/// error it raises instead of propagating it. Returns `true, results...`
/// on success or `false, errorobject` on failure -- the concrete
/// mechanism behind the data model's protected-call scenario.
fn pcall_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    if args.is_empty() {
        return Err(Value::String(
            ctx.intern("bad argument #1 to 'pcall' (value expected)"),
        ));
    }
    let callee = args[0];
    let rest = args[1..].to_vec();
    match ctx.call_value(callee, rest) {
        Ok(mut results) => {
            let mut out = Vec::with_capacity(results.len() + 1);
            out.push(Value::Boolean(true));
            out.append(&mut results);
            Ok(out)
        }
        Err(errval) => Ok(vec![Value::Boolean(false), errval]),
    }
}

fn type_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    Ok(vec![Value::String(ctx.intern(arg(args, 0).type_name()))])
}

fn metamethod_via_ctx(ctx: &mut dyn NativeContext, v: &Value, name: &str) -> Option<Value> {
    let mt = match v {
        Value::Table(t) => t.metatable(),
        Value::UserData(u) => u.metatable(),
        _ => None,
    }?;
    let found = mt.get(&Value::String(ctx.intern(name)));
    if found.is_nil() {
        None
    } else {
        Some(found)
    }
}

pub(crate) fn default_tostring(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::String(s) => s.as_str().to_string(),
        Value::Table(t) => format!("table: {:p}", t.as_ptr()),
        Value::Closure(c) => format!("function: {:p}", c.as_ptr()),
        Value::UserData(u) => format!("userdata: {:p}", u.as_ptr()),
        Value::LightUserData(p) => format!("userdata: {:p}", p),
        Value::Prototype(p) => format!("prototype: {:p}", p.as_ptr()),
        Value::UpValue(u) => format!("upvalue: {:p}", u.as_ptr()),
    }
}

/// `tostring(v)`: honors `__tostring` before falling back to a default
/// rendering, matching the data model's "metatable-driven operator
/// dispatch" core feature rather than being a string-library function.
fn tostring_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let v = arg(args, 0);
    if let Some(handler) = metamethod_via_ctx(ctx, &v, "__tostring") {
        let results = ctx.call_value(handler, vec![v])?;
        return Ok(vec![results.into_iter().next().unwrap_or(Value::Nil)]);
    }
    Ok(vec![Value::String(ctx.intern(&default_tostring(&v)))])
}

fn tonumber_fn(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    Ok(vec![arg(args, 0).as_number().map(Value::Number).unwrap_or(Value::Nil)])
}

fn rawequal_fn(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    Ok(vec![Value::Boolean(arg(args, 0) == arg(args, 1))])
}

fn rawget_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    match arg(args, 0) {
        Value::Table(t) => Ok(vec![t.get(&arg(args, 1))]),
        other => Err(Value::String(
            ctx.intern(&format!("bad argument #1 to 'rawget' (table expected, got {})", other.type_name())),
        )),
    }
}

fn rawset_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    match arg(args, 0) {
        Value::Table(t) => {
            t.set(arg(args, 1), arg(args, 2))
                .map_err(|e| Value::String(ctx.intern(&e.to_string())))?;
            Ok(vec![Value::Table(t)])
        }
        other => Err(Value::String(
            ctx.intern(&format!("bad argument #1 to 'rawset' (table expected, got {})", other.type_name())),
        )),
    }
}

fn rawlen_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    match arg(args, 0) {
        Value::Table(t) => Ok(vec![Value::Number(t.length() as f64)]),
        Value::String(s) => Ok(vec![Value::Number(s.len() as f64)]),
        other => Err(Value::String(
            ctx.intern(&format!("table or string expected, got {}", other.type_name())),
        )),
    }
}

fn next_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    match arg(args, 0) {
        Value::Table(t) => match t.next(&arg(args, 1)) {
            Some((k, v)) => Ok(vec![k, v]),
            None => Ok(vec![Value::Nil]),
        },
        other => Err(Value::String(
            ctx.intern(&format!("bad argument #1 to 'next' (table expected, got {})", other.type_name())),
        )),
    }
}

/// `pairs(t)` returns `next, t, nil` -- the stateless iterator triple a
/// compiled generic `for` drives via `TFORLOOP`.
fn pairs_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let table = arg(args, 0);
    if !matches!(table, Value::Table(_)) {
        return Err(Value::String(
            ctx.intern(&format!("bad argument #1 to 'pairs' (table expected, got {})", table.type_name())),
        ));
    }
    let next_closure = ctx.heap().alloc(Closure::new_native(next_fn, "next", vec![]));
    Ok(vec![Value::Closure(next_closure), table, Value::Nil])
}

fn ipairs_iter(_ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let table = arg(args, 0);
    let i = arg(args, 1).as_number().unwrap_or(0.0) + 1.0;
    let Value::Table(t) = table else {
        return Ok(vec![Value::Nil]);
    };
    let v = t.get(&Value::Number(i));
    if v.is_nil() {
        Ok(vec![Value::Nil])
    } else {
        Ok(vec![Value::Number(i), v])
    }
}

/// `ipairs(t)` returns a stateless `(iterator, t, 0)` triple that walks
/// the dense array part from index 1 until the first hole.
fn ipairs_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let table = arg(args, 0);
    if !matches!(table, Value::Table(_)) {
        return Err(Value::String(
            ctx.intern(&format!("bad argument #1 to 'ipairs' (table expected, got {})", table.type_name())),
        ));
    }
    let iter = ctx.heap().alloc(Closure::new_native(ipairs_iter, "ipairs_iterator", vec![]));
    Ok(vec![Value::Closure(iter), table, Value::Number(0.0)])
}

fn setmetatable_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let Value::Table(t) = arg(args, 0) else {
        return Err(Value::String(
            ctx.intern(&format!("bad argument #1 to 'setmetatable' (table expected, got {})", arg(args, 0).type_name())),
        ));
    };
    match arg(args, 1) {
        Value::Nil => t.set_metatable(None),
        Value::Table(mt) => t.set_metatable(Some(mt)),
        other => {
            return Err(Value::String(
                ctx.intern(&format!("bad argument #2 to 'setmetatable' (nil or table expected, got {})", other.type_name())),
            ))
        }
    }
    Ok(vec![Value::Table(t)])
}

fn getmetatable_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let mt = match arg(args, 0) {
        Value::Table(t) => t.metatable(),
        Value::UserData(u) => u.metatable(),
        _ => None,
    };
    match mt {
        Some(mt) => {
            let guard = mt.get(&Value::String(ctx.intern("__metatable")));
            Ok(vec![if guard.is_nil() { Value::Table(mt) } else { guard }])
        }
        None => Ok(vec![Value::Nil]),
    }
}

/// `select('#', ...)` returns the argument count; `select(n, ...)` returns
/// every argument from the `n`th onward.
fn select_fn(ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Vec<Value>, Value> {
    let rest = &args[1.min(args.len())..];
    match arg(args, 0) {
        Value::String(s) if s.as_str() == "#" => Ok(vec![Value::Number(rest.len() as f64)]),
        selector => {
            let n = selector
                .as_number()
                .ok_or_else(|| Value::String(ctx.intern("bad argument #1 to 'select' (number expected)")))?;
            let n = n as isize;
            let n = if n < 0 { (rest.len() as isize + n).max(0) } else { n - 1 };
            let n = n.max(0) as usize;
            Ok(rest.get(n..).map(|s| s.to_vec()).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::MULTRET;
    use crate::state::State;

    /// Loads and runs `source`, leaving the `State` positioned so its
    /// results can be read back through the embedding API's `to_*`
    /// accessors (tests inspect them directly rather than collecting into
    /// `Value`, since a `Value::String` from one `State` is never equal to
    /// one from another -- identity is per-heap).
    fn run(source: &str) -> State {
        let state = State::open();
        state.load(source, "test").expect("source should compile");
        state.call(0, MULTRET).expect("chunk should run");
        state
    }

    #[test]
    fn pairs_visits_every_entry() {
        let state = run(
            r#"
            local t = { a = 1, b = 2, c = 3 }
            local sum = 0
            for k, v in pairs(t) do sum = sum + v end
            return sum
            "#,
        );
        assert_eq!(state.to_number(1), Some(6.0));
    }

    #[test]
    fn ipairs_stops_at_first_hole() {
        let state = run(
            r#"
            local t = { 10, 20, 30 }
            t[5] = 50
            local count = 0
            for i, v in ipairs(t) do count = count + 1 end
            return count
            "#,
        );
        assert_eq!(state.to_number(1), Some(3.0));
    }

    #[test]
    fn select_hash_returns_count_and_n_returns_tail() {
        let state = run(r#"return select("#", 1, 2, 3)"#);
        assert_eq!(state.to_number(1), Some(3.0));

        let state = run(r#"local a, b = select(2, "x", "y", "z"); return a, b"#);
        assert_eq!(state.to_string_value(1).as_deref(), Some("y"));
        assert_eq!(state.to_string_value(2).as_deref(), Some("z"));
    }

    #[test]
    fn assert_passes_through_truthy_and_raises_on_falsy() {
        let state = run(r#"return assert(42, "unused")"#);
        assert_eq!(state.to_number(1), Some(42.0));

        let state = State::open();
        state
            .load(r#"return assert(false, "custom message")"#, "test")
            .expect("source should compile");
        assert_ne!(state.pcall(0, MULTRET, 0), 0);
        assert_eq!(state.to_string_value(-1).as_deref(), Some("custom message"));
    }

    #[test]
    fn tonumber_and_tostring_round_trip() {
        let state = run(r#"return tonumber("42") + 1, tostring(42)"#);
        assert_eq!(state.to_number(1), Some(43.0));
        assert_eq!(state.to_string_value(2).as_deref(), Some("42"));
    }
}
