//! The allow-listed built-in functions. Nothing here touches the filesystem,
//! the network, the clock or the environment.
//!
//! Every result goes through [`Interpreter::string`], [`Interpreter::list`] or
//! [`Interpreter::copy_items`] so it is counted against the allocation
//! budget; results whose size is known up front are refused before they are
//! built.

use super::interp::{Interpreter, Value};
use super::SandboxError;

/// Every built-in name, in documentation order.
pub const BUILTINS: &[&str] = &[
    "len", "min", "max", "floor", "range", "str", "trim", "trim_start", "trim_end", "strip_end",
    "collapse_ws", "take", "last", "slice", "lower", "upper", "contains", "find_all", "matches",
    "replace_all", "join", "push",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn arity(name: &str, args: &[Value], want: usize) -> Result<(), SandboxError> {
    if args.len() != want {
        return Err(SandboxError::Runtime(format!(
            "{name}() takes {want} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn type_error(name: &str, args: &[Value]) -> SandboxError {
    let kinds: Vec<&str> = args.iter().map(Value::type_name).collect();
    SandboxError::Runtime(format!("{name}() does not accept ({})", kinds.join(", ")))
}

/// Clamp a length-like argument to `usize` (negative becomes 0).
fn count(v: i64) -> usize {
    usize::try_from(v.max(0)).unwrap_or(usize::MAX)
}

/// Work charge for a string of `len` bytes.
fn cost(len: usize) -> u64 {
    1 + (len as u64) / 256
}

pub fn call(it: &mut Interpreter<'_>, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
    use Value::*;
    match name {
        "len" => {
            arity(name, &args, 1)?;
            match &args[0] {
                Str(s) => {
                    it.tick(cost(s.len()))?;
                    Ok(Int(s.chars().count() as i64))
                }
                List(xs) => Ok(Int(xs.len() as i64)),
                _ => Err(type_error(name, &args)),
            }
        }
        "min" | "max" => {
            let nums: &[Value] = match args.as_slice() {
                [List(xs)] => xs,
                _ => &args,
            };
            let Some(first) = nums.first() else {
                return Err(SandboxError::Runtime(format!("{name}() of nothing")));
            };
            it.tick(1 + nums.len() as u64 / 64)?;
            let mut best = first;
            for v in nums {
                let (Some(a), Some(b)) = (v.as_f64(), best.as_f64()) else {
                    return Err(type_error(name, &args));
                };
                if (name == "min" && a < b) || (name == "max" && a > b) {
                    best = v;
                }
            }
            Ok(best.clone())
        }
        "floor" => {
            arity(name, &args, 1)?;
            match args[0] {
                Int(n) => Ok(Int(n)),
                Float(x) if x.is_finite() && x.abs() < 9.0e15 => Ok(Int(x.floor() as i64)),
                _ => Err(type_error(name, &args)),
            }
        }
        "range" => {
            let (start, end) = match args.as_slice() {
                [Int(n)] => (0, *n),
                [Int(a), Int(b)] => (*a, *b),
                _ => return Err(type_error(name, &args)),
            };
            let n = count(end.saturating_sub(start));
            if n > it.limits.max_list_items {
                return Err(SandboxError::ResourceLimit("list length"));
            }
            it.tick(1 + n as u64 / 64)?;
            it.list((start..end).map(Int).collect())
        }
        "str" => {
            arity(name, &args, 1)?;
            it.ensure_room(args[0].display_bound())?;
            let s = args[0].to_string();
            it.tick(cost(s.len()))?;
            it.string(s)
        }
        "trim" | "trim_start" | "trim_end" | "collapse_ws" | "lower" | "upper" => {
            arity(name, &args, 1)?;
            let Str(s) = &args[0] else {
                return Err(type_error(name, &args));
            };
            it.tick(cost(s.len()))?;
            let out = match name {
                "trim" => s.trim().to_string(),
                "trim_start" => s.trim_start().to_string(),
                "trim_end" => s.trim_end().to_string(),
                "collapse_ws" => s.split_whitespace().collect::<Vec<_>>().join(" "),
                "lower" => s.to_lowercase(),
                _ => s.to_uppercase(),
            };
            it.string(out)
        }
        "strip_end" => {
            arity(name, &args, 2)?;
            let (Str(s), Str(set)) = (&args[0], &args[1]) else {
                return Err(type_error(name, &args));
            };
            it.tick(cost(s.len()))?;
            it.string(s.trim_end_matches(|c: char| set.contains(c)).to_string())
        }
        "take" | "last" => {
            arity(name, &args, 2)?;
            let Int(n) = args[1] else {
                return Err(type_error(name, &args));
            };
            let n = count(n);
            match &args[0] {
                Str(s) => {
                    it.tick(cost(s.len()))?;
                    let out: String = if name == "take" {
                        s.chars().take(n).collect()
                    } else {
                        let total = s.chars().count();
                        s.chars().skip(total.saturating_sub(n)).collect()
                    };
                    it.string(out)
                }
                List(xs) => {
                    let picked = if name == "take" {
                        &xs[..n.min(xs.len())]
                    } else {
                        &xs[xs.len().saturating_sub(n)..]
                    };
                    it.copy_items(picked)
                }
                _ => Err(type_error(name, &args)),
            }
        }
        "slice" => {
            arity(name, &args, 3)?;
            let (Int(a), Int(b)) = (&args[1], &args[2]) else {
                return Err(type_error(name, &args));
            };
            let (a, b) = (count(*a), count(*b));
            let n = b.saturating_sub(a);
            match &args[0] {
                Str(s) => {
                    it.tick(cost(s.len()))?;
                    it.string(s.chars().skip(a).take(n).collect())
                }
                List(xs) => {
                    let from = a.min(xs.len());
                    let to = from.saturating_add(n).min(xs.len());
                    it.copy_items(&xs[from..to])
                }
                _ => Err(type_error(name, &args)),
            }
        }
        "contains" => {
            arity(name, &args, 2)?;
            match (&args[0], &args[1]) {
                (Str(hay), Str(needle)) => {
                    it.tick(cost(hay.len()))?;
                    Ok(Bool(hay.contains(needle.as_str())))
                }
                (List(xs), v) => {
                    it.tick(1 + xs.len() as u64 / 64)?;
                    Ok(Bool(xs.contains(v)))
                }
                _ => Err(type_error(name, &args)),
            }
        }
        "find_all" | "matches" => {
            arity(name, &args, 2)?;
            let (Str(text), Str(pattern)) = (&args[0], &args[1]) else {
                return Err(type_error(name, &args));
            };
            let re = it.regex(pattern)?;
            it.tick(cost(text.len()))?;
            if name == "matches" {
                return Ok(Bool(re.is_match(text)));
            }
            let found: Vec<Value> = re
                .find_iter(text)
                .take(it.limits.max_list_items + 1)
                .map(|m| Str(m.as_str().to_string()))
                .collect();
            let bytes: usize = found.iter().map(Value::footprint).sum();
            it.charge_bytes(bytes)?;
            it.list(found)
        }
        "replace_all" => {
            arity(name, &args, 3)?;
            let (Str(text), Str(pattern), Str(with)) = (&args[0], &args[1], &args[2]) else {
                return Err(type_error(name, &args));
            };
            let re = it.regex(pattern)?;
            it.tick(cost(text.len()))?;
            if !with.is_empty() {
                let hits = re.find_iter(text).count();
                it.ensure_room(text.len().saturating_add(hits.saturating_mul(with.len())))?;
            }
            let out = re.replace_all(text, regex::NoExpand(with)).into_owned();
            it.string(out)
        }
        "join" => {
            arity(name, &args, 2)?;
            let (List(xs), Str(sep)) = (&args[0], &args[1]) else {
                return Err(type_error(name, &args));
            };
            let bound = xs
                .iter()
                .map(Value::display_bound)
                .fold(sep.len().saturating_mul(xs.len().saturating_sub(1)), usize::saturating_add);
            it.ensure_room(bound)?;
            let parts: Vec<String> = xs.iter().map(Value::to_string).collect();
            let out = parts.join(sep.as_str());
            it.tick(cost(out.len()))?;
            it.string(out)
        }
        "push" => {
            arity(name, &args, 2)?;
            let mut args = args;
            let item = args.pop();
            match (args.pop(), item) {
                (Some(List(mut xs)), Some(item)) => {
                    xs.push(item);
                    it.list(xs)
                }
                _ => Err(SandboxError::Runtime("push() takes (list, value)".into())),
            }
        }
        other => Err(SandboxError::Runtime(format!("unknown built-in '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::interp::Limits;
    use crate::sandbox::lang::parse;
    use std::time::{Duration, Instant};

    fn eval(expr: &str, text: &str) -> Result<Value, SandboxError> {
        let src = format!("fn f(text, max_len)\nreturn {expr}\nend");
        let program = parse(&src).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        Interpreter::new(&program, Limits::default(), deadline)
            .call("f", vec![Value::Str(text.to_string()), Value::Int(10)])
    }

    fn s(v: &str) -> Value {
        Value::Str(v.to_string())
    }

    #[test]
    fn test_len_counts_chars() {
        assert_eq!(eval("len(text)", "héllo").unwrap(), Value::Int(5));
    }

    #[test]
    fn test_min_max_floor() {
        assert_eq!(eval("min(3, 1, 2)", "").unwrap(), Value::Int(1));
        assert_eq!(eval("max([1, 2.5])", "").unwrap(), Value::Float(2.5));
        assert_eq!(eval("floor(max_len * 0.65)", "").unwrap(), Value::Int(6));
    }

    #[test]
    fn test_take_last_slice() {
        assert_eq!(eval("take(text, 3)", "abcdef").unwrap(), s("abc"));
        assert_eq!(eval("last(text, 2)", "abcdef").unwrap(), s("ef"));
        assert_eq!(eval("last(text, 0)", "abcdef").unwrap(), s(""));
        assert_eq!(eval("slice(text, 1, 4)", "abcdef").unwrap(), s("bcd"));
        assert_eq!(eval("take(text, 99)", "ab").unwrap(), s("ab"));
    }

    #[test]
    fn test_whitespace_helpers() {
        assert_eq!(eval("collapse_ws(text)", "  a \n\t b  ").unwrap(), s("a b"));
        assert_eq!(eval("trim_end(text)", " a ").unwrap(), s(" a"));
        assert_eq!(eval("strip_end(text, \"?!.:\")", "term?!").unwrap(), s("term"));
    }

    #[test]
    fn test_regex_builtins() {
        let kws = eval("find_all(text, \"(?i)\\b(?:goal|error)\\b\")", "Goal: avoid error. goals").unwrap();
        assert_eq!(kws, Value::List(vec![s("Goal"), s("error")]));
        assert_eq!(eval("matches(text, \"^a+$\")", "aaa").unwrap(), Value::Bool(true));
        assert_eq!(eval("replace_all(text, \"\\s+\", \"$1\")", "a  b").unwrap(), s("a$1b"));
    }

    #[test]
    fn test_runtime_pattern_with_nested_quantifier_denied() {
        let err = eval("matches(text, \"(\" + \"a+\" + \")+\")", "aaa").unwrap_err();
        assert!(matches!(err, SandboxError::Denied(_)));
    }

    #[test]
    fn test_join_push_contains() {
        assert_eq!(eval("join(push([\"a\"], \"b\"), \"-\")", "").unwrap(), s("a-b"));
        assert_eq!(eval("contains(text, \"ell\")", "hello").unwrap(), Value::Bool(true));
        assert_eq!(eval("contains([1, 2], 2)", "").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_join_refused_before_building_oversized_result() {
        let program = parse("fn f(text, max_len)\nreturn join([text, text, text, text, text], \"\")\nend").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut it = Interpreter::new(&program, Limits::default(), deadline);
        let big = "z".repeat(900_000);
        let err = it.call("f", vec![Value::Str(big), Value::Int(10)]).unwrap_err();
        assert_eq!(err, SandboxError::ResourceLimit("string length"));
        // The five reads were paid for; the 4.5 MB join never was.
        assert!(it.allocated() < 5 * 900_000 + 1_000);
    }

    #[test]
    fn test_replace_all_growth_refused_up_front() {
        let src = "fn f(text, max_len)\nlet w = text + text + text + text\nreturn replace_all(text, \".\", w)\nend";
        let program = parse(src).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut it = Interpreter::new(&program, Limits::default(), deadline);
        let err = it.call("f", vec![s(&"q".repeat(2_000)), Value::Int(10)]).unwrap_err();
        assert_eq!(err, SandboxError::ResourceLimit("string length"));
    }

    #[test]
    fn test_list_copies_are_paid_for() {
        let program = parse("fn f(text, max_len)\nlet xs = [text, text]\nlet ys = take(xs, 2)\nreturn text\nend").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut it = Interpreter::new(&program, Limits::default(), deadline);
        it.call("f", vec![s(&"k".repeat(10_000)), Value::Int(10)]).unwrap();
        // two reads into xs, one read of xs, the take copy, the final read
        assert!(it.allocated() >= 10_000 * 6);
    }

    #[test]
    fn test_range_cap() {
        assert!(matches!(eval("len(range(5))", "").unwrap(), Value::Int(5)));
        assert_eq!(eval("range(100000)", "").unwrap_err(), SandboxError::ResourceLimit("list length"));
    }

    #[test]
    fn test_type_errors() {
        assert!(eval("len(5)", "").is_err());
        assert!(eval("take(text, \"x\")", "").is_err());
        assert!(eval("trim(1, 2)", "").is_err());
    }

    #[test]
    fn test_every_builtin_is_dispatched() {
        for name in BUILTINS {
            let err = call_unknown_shape(name);
            assert!(!err.contains("unknown built-in"), "{name} not dispatched");
        }
    }

    fn call_unknown_shape(name: &str) -> String {
        let program = parse("fn f(a, b)\nreturn a\nend").unwrap();
        let mut it = Interpreter::new(&program, Limits::default(), Instant::now() + Duration::from_secs(1));
        match call(&mut it, name, vec![]) {
            Ok(_) => String::new(),
            Err(e) => e.to_string(),
        }
    }
}
