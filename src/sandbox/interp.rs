//! Tree-walking interpreter with a cooperative step budget.
//!
//! Every statement, loop iteration, expression node and built-in call is
//! charged against [`Limits::max_steps`], and the wall-clock deadline is
//! checked on every charge. Built-ins that touch whole strings pay in
//! proportion to their input size.
//!
//! Memory is bounded per invocation: every byte a call materializes
//! (variable reads copy their value, built-ins build new strings and lists)
//! is counted against [`Limits::max_alloc_bytes`] and paid for in steps.
//! Results whose size is known up front are checked before allocating.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use regex::Regex;

use super::builtins;
use super::lang::{BinOp, Expr, Program, Stmt, UnaryOp};
use super::SandboxError;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::List(xs) => !xs.is_empty(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Heap bytes a deep copy of this value allocates.
    pub fn footprint(&self) -> usize {
        match self {
            Value::Str(s) => s.len(),
            Value::List(xs) => footprint_of(xs),
            _ => 0,
        }
    }

    /// Upper bound on the byte length of `to_string()`.
    pub fn display_bound(&self) -> usize {
        match self {
            Value::Int(_) => 20,
            // `{}` on f64 never uses exponent notation.
            Value::Float(_) => 330,
            Value::Bool(_) => 5,
            Value::Str(s) => s.len(),
            Value::List(xs) => {
                2 + xs.iter().map(|x| x.display_bound().saturating_add(2)).fold(0usize, usize::saturating_add)
            }
        }
    }
}

const SLOT: usize = std::mem::size_of::<Value>();

/// Lists nested deeper than this are refused.
pub const MAX_NESTING: usize = 64;

/// Heap bytes a deep copy of `xs` allocates, slots included.
pub fn footprint_of(xs: &[Value]) -> usize {
    xs.iter().map(|x| SLOT.saturating_add(x.footprint())).fold(0usize, usize::saturating_add)
}

fn nesting(xs: &[Value]) -> usize {
    1 + xs
        .iter()
        .filter_map(|x| match x {
            Value::List(ys) => Some(nesting(ys)),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
            Value::List(xs) => {
                f.write_str("[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: u64,
    pub max_string_chars: usize,
    pub max_list_items: usize,
    pub max_call_depth: usize,
    /// Compiled-size cap passed to the regex builder, in bytes.
    pub regex_size_limit: usize,
    /// Total bytes one invocation may materialize.
    pub max_alloc_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_string_chars: 1_000_000,
            max_list_items: 10_000,
            max_call_depth: 32,
            regex_size_limit: 1 << 20,
            max_alloc_bytes: 64 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

type Env = HashMap<String, Value>;

enum Flow {
    Next,
    Return(Value),
}

const REGEX_CACHE_CAP: usize = 32;

pub struct Interpreter<'p> {
    program: &'p Program,
    pub(super) limits: Limits,
    deadline: Instant,
    steps: u64,
    allocated: usize,
    depth: usize,
    regexes: HashMap<String, Regex>,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program, limits: Limits, deadline: Instant) -> Self {
        Self { program, limits, deadline, steps: 0, allocated: 0, depth: 0, regexes: HashMap::new() }
    }

    /// Steps consumed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Bytes materialized so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Call a program function by name.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        let program: &'p Program = self.program;
        let func = program
            .function(name)
            .ok_or_else(|| SandboxError::MissingFunction(name.to_string()))?;
        if func.params.len() != args.len() {
            return Err(SandboxError::Runtime(format!(
                "'{name}' takes {} arguments, got {}",
                func.params.len(),
                args.len()
            )));
        }
        if self.depth >= self.limits.max_call_depth {
            return Err(SandboxError::ResourceLimit("call depth"));
        }
        self.tick(1)?;
        let mut env: Env = func.params.iter().cloned().zip(args).collect();
        self.depth += 1;
        let flow = self.exec_block(&func.body, &mut env);
        self.depth -= 1;
        match flow? {
            Flow::Return(v) => Ok(v),
            Flow::Next => Err(SandboxError::Runtime(format!("'{name}' ended without return"))),
        }
    }

    /// Charge `cost` steps and check the deadline.
    pub(super) fn tick(&mut self, cost: u64) -> Result<(), SandboxError> {
        self.steps = self.steps.saturating_add(cost);
        if self.steps > self.limits.max_steps {
            return Err(SandboxError::StepBudgetExhausted);
        }
        if Instant::now() >= self.deadline {
            return Err(SandboxError::Timeout);
        }
        Ok(())
    }

    /// Count `bytes` against the allocation budget and charge for them.
    pub(super) fn charge_bytes(&mut self, bytes: usize) -> Result<(), SandboxError> {
        let total = self.allocated.saturating_add(bytes);
        if total > self.limits.max_alloc_bytes {
            return Err(SandboxError::ResourceLimit("memory"));
        }
        self.allocated = total;
        self.tick(1 + (bytes as u64) / 256)
    }

    /// Refuse a string of `bytes` before building it: over the length cap
    /// even at four bytes per char, or over what is left of the budget.
    pub(super) fn ensure_room(&self, bytes: usize) -> Result<(), SandboxError> {
        if bytes > self.limits.max_string_chars.saturating_mul(4) {
            return Err(SandboxError::ResourceLimit("string length"));
        }
        if self.allocated.saturating_add(bytes) > self.limits.max_alloc_bytes {
            return Err(SandboxError::ResourceLimit("memory"));
        }
        Ok(())
    }

    /// Wrap a produced string, enforcing the length cap and paying for it.
    pub(super) fn string(&mut self, s: String) -> Result<Value, SandboxError> {
        let max = self.limits.max_string_chars;
        if s.len() > max && s.chars().count() > max {
            return Err(SandboxError::ResourceLimit("string length"));
        }
        self.charge_bytes(s.len())?;
        Ok(Value::Str(s))
    }

    /// Wrap a produced list, enforcing the item and nesting caps. Items were
    /// paid for when they were produced; only the slots are charged here.
    pub(super) fn list(&mut self, xs: Vec<Value>) -> Result<Value, SandboxError> {
        if xs.len() > self.limits.max_list_items {
            return Err(SandboxError::ResourceLimit("list length"));
        }
        if nesting(&xs) > MAX_NESTING {
            return Err(SandboxError::ResourceLimit("list nesting"));
        }
        self.charge_bytes(xs.len().saturating_mul(SLOT))?;
        Ok(Value::List(xs))
    }

    /// Deep-copy `xs` after paying for the copy.
    pub(super) fn copy_items(&mut self, xs: &[Value]) -> Result<Value, SandboxError> {
        self.charge_bytes(footprint_of(xs))?;
        Ok(Value::List(xs.to_vec()))
    }

    /// Compile (or fetch) a run-time pattern after the nested-quantifier check.
    pub(super) fn regex(&mut self, pattern: &str) -> Result<Regex, SandboxError> {
        if let Some(re) = self.regexes.get(pattern) {
            return Ok(re.clone());
        }
        if super::deny::has_nested_quantifier(pattern) {
            return Err(super::DenyReason::NestedQuantifier(pattern.to_string()).into());
        }
        self.tick(1 + pattern.len() as u64)?;
        let re = regex::RegexBuilder::new(pattern)
            .size_limit(self.limits.regex_size_limit)
            .dfa_size_limit(self.limits.regex_size_limit)
            .build()
            .map_err(|e| SandboxError::Runtime(format!("bad pattern: {e}")))?;
        if self.regexes.len() >= REGEX_CACHE_CAP {
            self.regexes.clear();
        }
        self.regexes.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    fn exec_block(&mut self, body: &'p [Stmt], env: &mut Env) -> Result<Flow, SandboxError> {
        for stmt in body {
            if let Flow::Return(v) = self.exec(stmt, env)? {
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, stmt: &'p Stmt, env: &mut Env) -> Result<Flow, SandboxError> {
        self.tick(1)?;
        match stmt {
            Stmt::Let { name, value } => {
                let v = self.eval(value, env)?;
                env.insert(name.clone(), v);
            }
            Stmt::Assign { name, value } => {
                if !env.contains_key(name) {
                    return Err(SandboxError::Runtime(format!("assignment to undeclared '{name}'")));
                }
                let v = self.eval(value, env)?;
                env.insert(name.clone(), v);
            }
            Stmt::If { cond, then_body, else_body } => {
                let branch = if self.eval(cond, env)?.truthy() { then_body } else { else_body };
                return self.exec_block(branch, env);
            }
            Stmt::While { cond, body } => loop {
                self.tick(1)?;
                if !self.eval(cond, env)?.truthy() {
                    break;
                }
                if let Flow::Return(v) = self.exec_block(body, env)? {
                    return Ok(Flow::Return(v));
                }
            },
            Stmt::For { var, iter, body } => {
                let items = match self.eval(iter, env)? {
                    Value::List(xs) => xs,
                    Value::Str(s) => {
                        self.charge_bytes(s.len().saturating_mul(SLOT + 4))?;
                        s.chars().map(|c| Value::Str(c.to_string())).collect()
                    }
                    other => {
                        return Err(SandboxError::Runtime(format!(
                            "cannot iterate over {}",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    self.tick(1)?;
                    env.insert(var.clone(), item);
                    if let Flow::Return(v) = self.exec_block(body, env)? {
                        return Ok(Flow::Return(v));
                    }
                }
            }
            Stmt::Return(expr) => return Ok(Flow::Return(self.eval(expr, env)?)),
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
            }
        }
        Ok(Flow::Next)
    }

    fn eval(&mut self, expr: &'p Expr, env: &Env) -> Result<Value, SandboxError> {
        self.tick(1)?;
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(x) => Ok(Value::Float(*x)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::List(items) => {
                let xs = items.iter().map(|e| self.eval(e, env)).collect::<Result<Vec<_>, _>>()?;
                self.list(xs)
            }
            Expr::Var(name) => {
                let v = env
                    .get(name)
                    .ok_or_else(|| SandboxError::Runtime(format!("undefined variable '{name}'")))?;
                // Reads copy; pay before the copy is made.
                let bytes = v.footprint();
                if bytes > 0 {
                    self.charge_bytes(bytes)?;
                }
                Ok(v.clone())
            }
            Expr::Unary { op, expr } => {
                let v = self.eval(expr, env)?;
                match (op, v) {
                    (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
                    (UnaryOp::Neg, Value::Int(n)) => n
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| SandboxError::Runtime("integer overflow".into())),
                    (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
                    (UnaryOp::Neg, other) => {
                        Err(SandboxError::Runtime(format!("cannot negate {}", other.type_name())))
                    }
                }
            }
            Expr::Binary { op: BinOp::And, lhs, rhs } => {
                if !self.eval(lhs, env)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(rhs, env)?.truthy()))
            }
            Expr::Binary { op: BinOp::Or, lhs, rhs } => {
                if self.eval(lhs, env)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(rhs, env)?.truthy()))
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs, env)?;
                let r = self.eval(rhs, env)?;
                self.binary(*op, l, r)
            }
            Expr::Call { name, args } => {
                let args = args.iter().map(|e| self.eval(e, env)).collect::<Result<Vec<_>, _>>()?;
                if builtins::is_builtin(name) {
                    builtins::call(self, name, args)
                } else {
                    self.call(name, args)
                }
            }
            Expr::Index { target, index } => {
                let t = self.eval(target, env)?;
                let i = match self.eval(index, env)? {
                    Value::Int(i) => i,
                    other => {
                        return Err(SandboxError::Runtime(format!(
                            "index must be int, got {}",
                            other.type_name()
                        )))
                    }
                };
                let out_of_range = || SandboxError::Runtime(format!("index {i} out of range"));
                let i = usize::try_from(i).map_err(|_| out_of_range())?;
                match t {
                    Value::List(xs) => xs.into_iter().nth(i).ok_or_else(out_of_range),
                    Value::Str(s) => {
                        self.tick(1 + (i as u64) / 256)?;
                        s.chars().nth(i).map(|c| Value::Str(c.to_string())).ok_or_else(out_of_range)
                    }
                    other => Err(SandboxError::Runtime(format!("cannot index {}", other.type_name()))),
                }
            }
        }
    }

    fn binary(&mut self, op: BinOp, l: Value, r: Value) -> Result<Value, SandboxError> {
        use Value::*;
        let overflow = || SandboxError::Runtime("integer overflow".into());
        match (op, l, r) {
            (BinOp::Eq, l, r) => Ok(Bool(values_equal(&l, &r))),
            (BinOp::Ne, l, r) => Ok(Bool(!values_equal(&l, &r))),
            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, l, r) => {
                let ord = match (&l, &r) {
                    (Str(a), Str(b)) => a.partial_cmp(b),
                    _ => match (l.as_f64(), r.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    },
                }
                .ok_or_else(|| {
                    SandboxError::Runtime(format!("cannot compare {} with {}", l.type_name(), r.type_name()))
                })?;
                Ok(Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            (BinOp::Add, Str(a), Str(b)) => {
                let total = a.len().saturating_add(b.len());
                self.ensure_room(total)?;
                self.string(a + &b)
            }
            (BinOp::Add, List(mut a), List(b)) => {
                if a.len().saturating_add(b.len()) > self.limits.max_list_items {
                    return Err(SandboxError::ResourceLimit("list length"));
                }
                a.extend(b);
                self.list(a)
            }
            (op, Int(a), Int(b)) => match op {
                BinOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
                BinOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
                BinOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
                BinOp::Div | BinOp::Rem if b == 0 => Err(SandboxError::Runtime("division by zero".into())),
                BinOp::Div => a.checked_div(b).map(Int).ok_or_else(overflow),
                BinOp::Rem => a.checked_rem(b).map(Int).ok_or_else(overflow),
                _ => unreachable_op(op),
            },
            (op, l, r) => {
                let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                    return Err(SandboxError::Runtime(format!(
                        "unsupported operands {} and {}",
                        l.type_name(),
                        r.type_name()
                    )));
                };
                let x = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div | BinOp::Rem if b == 0.0 => {
                        return Err(SandboxError::Runtime("division by zero".into()))
                    }
                    BinOp::Div => a / b,
                    BinOp::Rem => a % b,
                    _ => return unreachable_op(op),
                };
                if x.is_finite() {
                    Ok(Float(x))
                } else {
                    Err(SandboxError::Runtime("non-finite result".into()))
                }
            }
        }
    }
}

fn unreachable_op(op: BinOp) -> Result<Value, SandboxError> {
    Err(SandboxError::Runtime(format!("operator {op:?} not valid here")))
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}
