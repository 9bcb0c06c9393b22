//! Tree-walking interpreter for the sandbox language.
//!
//! Values are plain data (no shared mutability), the namespace is a flat
//! map owned by the caller, and every loop iteration checks a cooperative
//! deadline so runaway code cannot hold the thread past its budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::SandboxError;

use super::ast::{BinOp, BoolOp, CmpOp, Expr, FStringPart, Stmt, Target};
use super::helpers::{HelperDispatcher, build_request, is_helper_name};

type EvalResult<T> = std::result::Result<T, SandboxError>;

/// Upper bound on `range()` materialisation.
const MAX_RANGE_LEN: i64 = 1_000_000;

/// Safe builtin functions available inside the sandbox.
pub const SAFE_BUILTINS: &[&str] = &[
    "abs", "bool", "enumerate", "float", "int", "len", "list", "max", "min", "range", "round",
    "sorted", "str", "sum", "zip",
];

/// Runtime values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `None`
    None,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
    /// List.
    List(Vec<Value>),
    /// Tuple.
    Tuple(Vec<Value>),
    /// Dict as ordered key/value pairs.
    Dict(Vec<(Value, Value)>),
    /// User lambda with a captured environment snapshot.
    Lambda {
        /// Parameter names.
        params: Vec<String>,
        /// Body expression.
        body: Arc<Expr>,
        /// Captured environment.
        captured: HashMap<String, Value>,
    },
    /// A safe builtin.
    Builtin(&'static str),
    /// A bound method on a value.
    Method {
        /// Receiver.
        recv: Box<Value>,
        /// Method name.
        name: String,
    },
    /// A helper capability.
    Helper(&'static str),
}

impl Value {
    /// Python-style truthiness.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(v) | Self::Tuple(v) => !v.is_empty(),
            Self::Dict(v) => !v.is_empty(),
            _ => true,
        }
    }

    /// Display form, repr-like for nested strings.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Self::List(items) => format!(
                "[{}]",
                items.iter().map(Self::repr).collect::<Vec<_>>().join(", ")
            ),
            Self::Tuple(items) => {
                if items.len() == 1 {
                    format!("({},)", items[0].repr())
                } else {
                    format!(
                        "({})",
                        items.iter().map(Self::repr).collect::<Vec<_>>().join(", ")
                    )
                }
            }
            Self::Dict(pairs) => format!(
                "{{{}}}",
                pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::Lambda { params, .. } => format!("<lambda({})>", params.join(", ")),
            Self::Builtin(name) => format!("<builtin {name}>"),
            Self::Method { name, .. } => format!("<method {name}>"),
            Self::Helper(name) => format!("<helper {name}>"),
        }
    }

    /// str()-style form (strings unquoted).
    #[must_use]
    pub fn to_display(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Converts to JSON for the worker protocol and helper responses.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::None => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => {
                serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) | Self::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Dict(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    map.insert(k.to_display(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
            other => serde_json::Value::String(other.repr()),
        }
    }

    /// Converts from JSON (helper responses, worker protocol).
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(0.0)),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (Self::Str(k.clone()), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Lambda { .. } => "function",
            Self::Builtin(_) => "builtin",
            Self::Method { .. } => "method",
            Self::Helper(_) => "helper",
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

fn eval_err(message: impl Into<String>) -> SandboxError {
    SandboxError::Eval {
        message: message.into(),
    }
}

/// Executes a statement list against a namespace.
///
/// Returns the value of the final bare-expression statement, or `None`
/// when the program ends with a non-expression statement (assignment,
/// loop, and so on), matching the contract a REPL uses.
///
/// # Errors
///
/// Returns [`SandboxError::Eval`] for runtime failures and
/// [`SandboxError::Timeout`] when the cooperative deadline expires.
pub fn execute<'env, 'h>(
    stmts: &[Stmt],
    env: &'env mut HashMap<String, Value>,
    helpers: Option<&'h mut dyn HelperDispatcher>,
    deadline: Option<(Instant, u64)>,
) -> EvalResult<Value> {
    let mut interp: Interp<'env, 'h> = Interp {
        env,
        helpers,
        deadline,
    };
    interp.run(stmts)
}

struct Interp<'a, 'h> {
    env: &'a mut HashMap<String, Value>,
    helpers: Option<&'h mut dyn HelperDispatcher>,
    deadline: Option<(Instant, u64)>,
}

impl Interp<'_, '_> {
    fn check_deadline(&self) -> EvalResult<()> {
        if let Some((deadline, seconds)) = self.deadline
            && Instant::now() > deadline
        {
            return Err(SandboxError::Timeout { seconds });
        }
        Ok(())
    }

    fn run(&mut self, stmts: &[Stmt]) -> EvalResult<Value> {
        let mut last = Value::None;
        for stmt in stmts {
            last = self.exec_stmt(stmt)?;
        }
        Ok(last)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> EvalResult<Value> {
        self.check_deadline()?;
        match stmt {
            Stmt::Expr(expr) => self.eval(expr),
            Stmt::Pass => Ok(Value::None),
            Stmt::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
                Ok(Value::None)
            }
            Stmt::AugAssign { target, op, value } => {
                let current = self.read_target(target)?;
                let rhs = self.eval(value)?;
                let updated = binary_op(*op, &current, &rhs)?;
                self.assign(target, updated)?;
                Ok(Value::None)
            }
            Stmt::Del(target) => {
                self.delete(target)?;
                Ok(Value::None)
            }
            Stmt::If { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.run(body).map(|_| Value::None)
                } else {
                    self.run(orelse).map(|_| Value::None)
                }
            }
            Stmt::For { var, iter, body } => {
                let iterable = self.clone_eval(iter)?;
                let items = self.iterate(&iterable)?;
                for item in items {
                    self.check_deadline()?;
                    self.env.insert(var.clone(), item);
                    self.run(body)?;
                }
                Ok(Value::None)
            }
        }
    }

    // Helper so the borrow on `self` for eval doesn't overlap with env
    // mutation in the for loop.
    fn clone_eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.eval(expr)
    }

    fn assign(&mut self, target: &Target, value: Value) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                self.env.insert(name.clone(), value);
                Ok(())
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let Expr::Name(name) = container else {
                    return Err(eval_err("only name[index] assignment is supported"));
                };
                let index = self.eval(index)?;
                let entry = self
                    .env
                    .get_mut(name)
                    .ok_or_else(|| eval_err(format!("name '{name}' is not defined")))?;
                match entry {
                    Value::Dict(pairs) => {
                        if let Some(pair) = pairs.iter_mut().find(|(k, _)| *k == index) {
                            pair.1 = value;
                        } else {
                            pairs.push((index, value));
                        }
                        Ok(())
                    }
                    Value::List(items) => {
                        let idx = normalize_index(&index, items.len())?;
                        items[idx] = value;
                        Ok(())
                    }
                    other => Err(eval_err(format!(
                        "'{}' does not support item assignment",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn read_target(&mut self, target: &Target) -> EvalResult<Value> {
        match target {
            Target::Name(name) => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| eval_err(format!("name '{name}' is not defined"))),
            Target::Subscript { value, index } => {
                let container = self.eval(value)?;
                let index = self.eval(index)?;
                subscript(&container, &index)
            }
        }
    }

    fn delete(&mut self, target: &Target) -> EvalResult<()> {
        match target {
            Target::Name(name) => {
                self.env
                    .remove(name)
                    .ok_or_else(|| eval_err(format!("name '{name}' is not defined")))?;
                Ok(())
            }
            Target::Subscript { value, index } => {
                let Expr::Name(name) = value else {
                    return Err(eval_err("only del name[index] is supported"));
                };
                let index = self.eval(index)?;
                let entry = self
                    .env
                    .get_mut(name)
                    .ok_or_else(|| eval_err(format!("name '{name}' is not defined")))?;
                match entry {
                    Value::Dict(pairs) => {
                        let before = pairs.len();
                        pairs.retain(|(k, _)| *k != index);
                        if pairs.len() == before {
                            return Err(eval_err(format!("key not found: {}", index.repr())));
                        }
                        Ok(())
                    }
                    Value::List(items) => {
                        let idx = normalize_index(&index, items.len())?;
                        items.remove(idx);
                        Ok(())
                    }
                    other => Err(eval_err(format!(
                        "'{}' does not support item deletion",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.check_deadline()?;
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(s) => out.push_str(s),
                        FStringPart::Expr(e) => out.push_str(&self.eval(e)?.to_display()),
                    }
                }
                Ok(Value::Str(out))
            }
            Expr::Name(name) => self.resolve(name),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(Value::List(values))
            }
            Expr::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(Value::Tuple(values))
            }
            Expr::Dict(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((self.eval(k)?, self.eval(v)?));
                }
                Ok(Value::Dict(out))
            }
            Expr::Neg(operand) => match self.eval(operand)? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(eval_err(format!("cannot negate '{}'", other.type_name()))),
            },
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, &left, &right)
            }
            Expr::Compare { left, rest } => {
                let mut current = self.eval(left)?;
                for (op, right_expr) in rest {
                    let right = self.eval(right_expr)?;
                    if !compare_op(*op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::BoolChain { op, values } => {
                let mut last = Value::None;
                for value_expr in values {
                    last = self.eval(value_expr)?;
                    match op {
                        BoolOp::And if !last.truthy() => return Ok(last),
                        BoolOp::Or if last.truthy() => return Ok(last),
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                let index = self.eval(index)?;
                subscript(&container, &index)
            }
            Expr::Attribute { value, attr } => {
                let recv = self.eval(value)?;
                Ok(Value::Method {
                    recv: Box::new(recv),
                    name: attr.clone(),
                })
            }
            Expr::Call { func, args, kwargs } => {
                let callee = self.eval(func)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    kwarg_values.push((name.clone(), self.eval(value)?));
                }
                self.call(callee, arg_values, kwarg_values)
            }
            Expr::Lambda { params, body } => Ok(Value::Lambda {
                params: params.clone(),
                body: Arc::new((**body).clone()),
                captured: self.env.clone(),
            }),
            Expr::Conditional { body, test, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::ListComp {
                elt,
                var,
                iter,
                cond,
            } => {
                let iterable = self.eval(iter)?;
                let items = self.iterate(&iterable)?;
                let saved = self.env.get(var).cloned();
                let mut out = Vec::new();
                for item in items {
                    self.check_deadline()?;
                    self.env.insert(var.clone(), item);
                    if let Some(cond) = cond
                        && !self.eval(cond)?.truthy()
                    {
                        continue;
                    }
                    out.push(self.eval(elt)?);
                }
                match saved {
                    Some(value) => {
                        self.env.insert(var.clone(), value);
                    }
                    None => {
                        self.env.remove(var);
                    }
                }
                Ok(Value::List(out))
            }
        }
    }

    fn resolve(&mut self, name: &str) -> EvalResult<Value> {
        if let Some(value) = self.env.get(name) {
            return Ok(value.clone());
        }
        if is_helper_name(name) {
            // Resolved even on the worker path so the error surfaces at
            // call time with a useful message.
            if let Some(helper) = super::helpers::HELPER_NAMES
                .iter()
                .copied()
                .find(|h| *h == name)
            {
                return Ok(Value::Helper(helper));
            }
        }
        if let Some(builtin) = SAFE_BUILTINS.iter().copied().find(|b| *b == name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(eval_err(format!("name '{name}' is not defined")))
    }

    fn call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        match callee {
            Value::Builtin(name) => {
                if !kwargs.is_empty() && name != "sorted" {
                    return Err(eval_err(format!("{name}() takes no keyword arguments")));
                }
                self.call_builtin(name, args, kwargs)
            }
            Value::Helper(name) => {
                let request = build_request(name, &args, &kwargs)?;
                let helpers = self.helpers.as_deref_mut().ok_or_else(|| {
                    eval_err(format!(
                        "helper {name}() is unavailable in the isolated worker"
                    ))
                })?;
                let response = helpers.dispatch(request).map_err(|e| eval_err(e.to_string()))?;
                Ok(Value::from_json(&response))
            }
            Value::Lambda {
                params,
                body,
                captured,
            } => {
                if args.len() != params.len() {
                    return Err(eval_err(format!(
                        "lambda expected {} arguments, got {}",
                        params.len(),
                        args.len()
                    )));
                }
                let mut local = captured;
                for (param, arg) in params.iter().zip(args) {
                    local.insert(param.clone(), arg);
                }
                let mut inner = Interp {
                    env: &mut local,
                    helpers: self.helpers.take(),
                    deadline: self.deadline,
                };
                let result = inner.eval(&body);
                self.helpers = inner.helpers;
                result
            }
            Value::Method { recv, name } => call_method(&recv, &name, &args),
            other => Err(eval_err(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalResult<Value> {
        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(eval_err(format!(
                    "{name}() expected {expected} argument(s), got {}",
                    args.len()
                )))
            }
        };

        match name {
            "len" => {
                arity(1)?;
                match &args[0] {
                    Value::Str(s) => Ok(Value::Int(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))),
                    Value::List(v) | Value::Tuple(v) => {
                        Ok(Value::Int(i64::try_from(v.len()).unwrap_or(i64::MAX)))
                    }
                    Value::Dict(v) => Ok(Value::Int(i64::try_from(v.len()).unwrap_or(i64::MAX))),
                    other => Err(eval_err(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    ))),
                }
            }
            "str" => {
                arity(1)?;
                Ok(Value::Str(args[0].to_display()))
            }
            "int" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    #[allow(clippy::cast_possible_truncation)]
                    Value::Float(f) => Ok(Value::Int(*f as i64)),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        eval_err(format!("invalid literal for int(): {s:?}"))
                    }),
                    other => Err(eval_err(format!("cannot convert '{}' to int", other.type_name()))),
                }
            }
            "float" => {
                arity(1)?;
                match &args[0] {
                    #[allow(clippy::cast_precision_loss)]
                    Value::Int(i) => Ok(Value::Float(*i as f64)),
                    Value::Float(f) => Ok(Value::Float(*f)),
                    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        eval_err(format!("invalid literal for float(): {s:?}"))
                    }),
                    other => Err(eval_err(format!(
                        "cannot convert '{}' to float",
                        other.type_name()
                    ))),
                }
            }
            "bool" => {
                arity(1)?;
                Ok(Value::Bool(args[0].truthy()))
            }
            "abs" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(i.abs())),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(eval_err(format!("bad operand for abs(): '{}'", other.type_name()))),
                }
            }
            "round" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    #[allow(clippy::cast_possible_truncation)]
                    Value::Float(f) => Ok(Value::Int(f.round() as i64)),
                    other => Err(eval_err(format!("bad operand for round(): '{}'", other.type_name()))),
                }
            }
            "min" | "max" => {
                let items = if args.len() == 1 {
                    self.iterate(&args[0])?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(eval_err(format!("{name}() arg is an empty sequence")));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let keep_new = if name == "min" {
                        compare_op(CmpOp::Lt, item, &best)?
                    } else {
                        compare_op(CmpOp::Gt, item, &best)?
                    };
                    if keep_new {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            "sum" => {
                arity(1)?;
                let items = self.iterate(&args[0])?;
                let mut acc = Value::Int(0);
                for item in &items {
                    acc = binary_op(BinOp::Add, &acc, item)?;
                }
                Ok(acc)
            }
            "sorted" => {
                if args.len() != 1 {
                    return Err(eval_err("sorted() expected 1 argument"));
                }
                let mut items = self.iterate(&args[0])?;
                let key = kwargs.iter().find(|(n, _)| n == "key").map(|(_, v)| v.clone());
                let mut error: Option<SandboxError> = None;
                if let Some(key_fn) = key {
                    let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
                    for item in items {
                        let k = self.call(key_fn.clone(), vec![item.clone()], vec![])?;
                        keyed.push((k, item));
                    }
                    keyed.sort_by(|a, b| {
                        compare_for_sort(&a.0, &b.0).unwrap_or_else(|e| {
                            error.get_or_insert(e);
                            std::cmp::Ordering::Equal
                        })
                    });
                    if let Some(e) = error {
                        return Err(e);
                    }
                    Ok(Value::List(keyed.into_iter().map(|(_, v)| v).collect()))
                } else {
                    items.sort_by(|a, b| {
                        compare_for_sort(a, b).unwrap_or_else(|e| {
                            error.get_or_insert(e);
                            std::cmp::Ordering::Equal
                        })
                    });
                    if let Some(e) = error {
                        return Err(e);
                    }
                    Ok(Value::List(items))
                }
            }
            "list" => {
                arity(1)?;
                Ok(Value::List(self.iterate(&args[0])?))
            }
            "range" => {
                let (start, stop, step) = match args.len() {
                    1 => (0, int_arg(&args[0], "range")?, 1),
                    2 => (int_arg(&args[0], "range")?, int_arg(&args[1], "range")?, 1),
                    3 => (
                        int_arg(&args[0], "range")?,
                        int_arg(&args[1], "range")?,
                        int_arg(&args[2], "range")?,
                    ),
                    _ => return Err(eval_err("range() expected 1-3 arguments")),
                };
                if step == 0 {
                    return Err(eval_err("range() step must not be zero"));
                }
                let span = if step > 0 {
                    stop.saturating_sub(start).max(0)
                } else {
                    start.saturating_sub(stop).max(0)
                };
                let step_abs = step.saturating_abs().max(1);
                let len = span.div_euclid(step_abs) + i64::from(span % step_abs != 0);
                if len > MAX_RANGE_LEN {
                    return Err(eval_err(format!("range too large: {len} elements")));
                }
                let mut out = Vec::new();
                let mut current = start;
                while (step > 0 && current < stop) || (step < 0 && current > stop) {
                    out.push(Value::Int(current));
                    let Some(next) = current.checked_add(step) else {
                        break;
                    };
                    current = next;
                }
                Ok(Value::List(out))
            }
            "enumerate" => {
                arity(1)?;
                let items = self.iterate(&args[0])?;
                Ok(Value::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| {
                            Value::Tuple(vec![
                                Value::Int(i64::try_from(i).unwrap_or(i64::MAX)),
                                v,
                            ])
                        })
                        .collect(),
                ))
            }
            "zip" => {
                arity(2)?;
                let a = self.iterate(&args[0])?;
                let b = self.iterate(&args[1])?;
                Ok(Value::List(
                    a.into_iter()
                        .zip(b)
                        .map(|(x, y)| Value::Tuple(vec![x, y]))
                        .collect(),
                ))
            }
            other => Err(eval_err(format!("unknown builtin: {other}"))),
        }
    }

    fn iterate(&self, value: &Value) -> EvalResult<Vec<Value>> {
        match value {
            Value::List(items) | Value::Tuple(items) => Ok(items.clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Dict(pairs) => Ok(pairs.iter().map(|(k, _)| k.clone()).collect()),
            other => Err(eval_err(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }
}

fn int_arg(value: &Value, func: &str) -> EvalResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(eval_err(format!(
            "{func}() expects integers, got '{}'",
            other.type_name()
        ))),
    }
}

fn normalize_index(index: &Value, len: usize) -> EvalResult<usize> {
    let Value::Int(i) = index else {
        return Err(eval_err("indices must be integers"));
    };
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let idx = if *i < 0 { len_i + i } else { *i };
    if idx < 0 || idx >= len_i {
        return Err(eval_err(format!("index out of range: {i}")));
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(idx as usize)
}

fn subscript(container: &Value, index: &Value) -> EvalResult<Value> {
    match container {
        Value::List(items) | Value::Tuple(items) => {
            let idx = normalize_index(index, items.len())?;
            Ok(items[idx].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(index, chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        Value::Dict(pairs) => pairs
            .iter()
            .find(|(k, _)| k == index)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| eval_err(format!("key not found: {}", index.repr()))),
        other => Err(eval_err(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> EvalResult<Value> {
    use Value::{Float, Int, List, Str};

    match (op, left, right) {
        (BinOp::Add, Int(a), Int(b)) => a
            .checked_add(*b)
            .map(Int)
            .ok_or_else(|| eval_err("integer overflow")),
        (BinOp::Sub, Int(a), Int(b)) => a
            .checked_sub(*b)
            .map(Int)
            .ok_or_else(|| eval_err("integer overflow")),
        (BinOp::Mul, Int(a), Int(b)) => a
            .checked_mul(*b)
            .map(Int)
            .ok_or_else(|| eval_err("integer overflow")),
        (BinOp::Div, Int(a), Int(b)) => {
            if *b == 0 {
                Err(eval_err("division by zero"))
            } else {
                #[allow(clippy::cast_precision_loss)]
                Ok(Float(*a as f64 / *b as f64))
            }
        }
        (BinOp::FloorDiv, Int(a), Int(b)) => {
            if *b == 0 {
                Err(eval_err("division by zero"))
            } else {
                Ok(Int(a.div_euclid(*b)))
            }
        }
        (BinOp::Mod, Int(a), Int(b)) => {
            if *b == 0 {
                Err(eval_err("modulo by zero"))
            } else {
                Ok(Int(a.rem_euclid(*b)))
            }
        }
        (BinOp::Pow, Int(a), Int(b)) => {
            if *b >= 0 {
                let exp = u32::try_from(*b).map_err(|_| eval_err("exponent too large"))?;
                a.checked_pow(exp)
                    .map(Int)
                    .ok_or_else(|| eval_err("integer overflow"))
            } else {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                Ok(Float((*a as f64).powi(*b as i32)))
            }
        }
        (BinOp::Add, Str(a), Str(b)) => Ok(Str(format!("{a}{b}"))),
        (BinOp::Add, List(a), List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(List(out))
        }
        (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
            let n = usize::try_from((*n).max(0)).unwrap_or(0);
            if s.len().saturating_mul(n) > 10_000_000 {
                return Err(eval_err("string repetition too large"));
            }
            Ok(Str(s.repeat(n)))
        }
        (op, l, r) => {
            // Mixed numeric promotion.
            let as_float = |v: &Value| -> Option<f64> {
                match v {
                    #[allow(clippy::cast_precision_loss)]
                    Int(i) => Some(*i as f64),
                    Float(f) => Some(*f),
                    _ => None,
                }
            };
            if let (Some(a), Some(b)) = (as_float(l), as_float(r)) {
                let out = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Err(eval_err("division by zero"));
                        }
                        a / b
                    }
                    BinOp::FloorDiv => {
                        if b == 0.0 {
                            return Err(eval_err("division by zero"));
                        }
                        (a / b).floor()
                    }
                    BinOp::Mod => {
                        if b == 0.0 {
                            return Err(eval_err("modulo by zero"));
                        }
                        a.rem_euclid(b)
                    }
                    BinOp::Pow => a.powf(b),
                };
                return Ok(Float(out));
            }
            Err(eval_err(format!(
                "unsupported operand types for {op:?}: '{}' and '{}'",
                l.type_name(),
                r.type_name()
            )))
        }
    }
}

fn compare_for_sort(a: &Value, b: &Value) -> EvalResult<std::cmp::Ordering> {
    if compare_op(CmpOp::Lt, a, b)? {
        Ok(std::cmp::Ordering::Less)
    } else if compare_op(CmpOp::Gt, a, b)? {
        Ok(std::cmp::Ordering::Greater)
    } else {
        Ok(std::cmp::Ordering::Equal)
    }
}

fn compare_op(op: CmpOp, left: &Value, right: &Value) -> EvalResult<bool> {
    use Value::{Float, Int, Str};

    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::NotEq => Ok(!values_equal(left, right)),
        CmpOp::In | CmpOp::NotIn => {
            let found = match right {
                Value::List(items) | Value::Tuple(items) => {
                    items.iter().any(|v| values_equal(v, left))
                }
                Value::Dict(pairs) => pairs.iter().any(|(k, _)| values_equal(k, left)),
                Str(haystack) => match left {
                    Str(needle) => haystack.contains(needle.as_str()),
                    _ => return Err(eval_err("'in <string>' requires a string operand")),
                },
                other => {
                    return Err(eval_err(format!(
                        "argument of type '{}' is not a container",
                        other.type_name()
                    )));
                }
            };
            Ok(if op == CmpOp::In { found } else { !found })
        }
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            let ordering = match (left, right) {
                (Int(a), Int(b)) => a.partial_cmp(b),
                (Str(a), Str(b)) => a.partial_cmp(b),
                (l, r) => {
                    let as_float = |v: &Value| -> Option<f64> {
                        match v {
                            #[allow(clippy::cast_precision_loss)]
                            Int(i) => Some(*i as f64),
                            Float(f) => Some(*f),
                            _ => None,
                        }
                    };
                    match (as_float(l), as_float(r)) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
            };
            let Some(ordering) = ordering else {
                return Err(eval_err(format!(
                    "'{}' and '{}' are not orderable",
                    left.type_name(),
                    right.type_name()
                )));
            };
            Ok(match op {
                CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                CmpOp::LtE => ordering != std::cmp::Ordering::Greater,
                CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
                CmpOp::GtE => ordering != std::cmp::Ordering::Less,
                _ => false,
            })
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    use Value::{Float, Int};
    match (a, b) {
        #[allow(clippy::cast_precision_loss)]
        (Int(i), Float(f)) | (Float(f), Int(i)) => (*i as f64 - f).abs() < f64::EPSILON,
        (a, b) => a == b,
    }
}

#[allow(clippy::too_many_lines)]
fn call_method(recv: &Value, name: &str, args: &[Value]) -> EvalResult<Value> {
    let str_arg = |i: usize| -> EvalResult<&str> {
        match args.get(i) {
            Some(Value::Str(s)) => Ok(s.as_str()),
            Some(other) => Err(eval_err(format!(
                "{name}() expects a string argument, got '{}'",
                other.type_name()
            ))),
            None => Err(eval_err(format!("{name}() missing argument {i}"))),
        }
    };

    match (recv, name) {
        (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "split") => {
            let parts: Vec<Value> = if args.is_empty() {
                s.split_whitespace()
                    .map(|p| Value::Str(p.to_string()))
                    .collect()
            } else {
                s.split(str_arg(0)?)
                    .map(|p| Value::Str(p.to_string()))
                    .collect()
            };
            Ok(Value::List(parts))
        }
        (Value::Str(sep), "join") => {
            let Some(Value::List(items) | Value::Tuple(items)) = args.first() else {
                return Err(eval_err("join() expects a list argument"));
            };
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(s) => parts.push(s.clone()),
                    other => {
                        return Err(eval_err(format!(
                            "join() sequence item must be str, got '{}'",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Value::Str(parts.join(sep)))
        }
        (Value::Str(s), "startswith") => Ok(Value::Bool(s.starts_with(str_arg(0)?))),
        (Value::Str(s), "endswith") => Ok(Value::Bool(s.ends_with(str_arg(0)?))),
        (Value::Str(s), "replace") => {
            Ok(Value::Str(s.replace(str_arg(0)?, str_arg(1)?)))
        }
        (Value::Str(s), "find") => {
            let needle = str_arg(0)?;
            Ok(Value::Int(s.find(needle).map_or(-1, |i| {
                i64::try_from(s[..i].chars().count()).unwrap_or(-1)
            })))
        }
        (Value::List(items), "count") => {
            let Some(target) = args.first() else {
                return Err(eval_err("count() missing argument"));
            };
            Ok(Value::Int(
                i64::try_from(items.iter().filter(|v| values_equal(v, target)).count())
                    .unwrap_or(i64::MAX),
            ))
        }
        (Value::List(items), "index") => {
            let Some(target) = args.first() else {
                return Err(eval_err("index() missing argument"));
            };
            items
                .iter()
                .position(|v| values_equal(v, target))
                .map(|i| Value::Int(i64::try_from(i).unwrap_or(i64::MAX)))
                .ok_or_else(|| eval_err("value not in list"))
        }
        (Value::Dict(pairs), "keys") => {
            Ok(Value::List(pairs.iter().map(|(k, _)| k.clone()).collect()))
        }
        (Value::Dict(pairs), "values") => {
            Ok(Value::List(pairs.iter().map(|(_, v)| v.clone()).collect()))
        }
        (Value::Dict(pairs), "items") => Ok(Value::List(
            pairs
                .iter()
                .map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        (Value::Dict(pairs), "get") => {
            let Some(key) = args.first() else {
                return Err(eval_err("get() missing argument"));
            };
            let default = args.get(1).cloned().unwrap_or(Value::None);
            Ok(pairs
                .iter()
                .find(|(k, _)| values_equal(k, key))
                .map_or(default, |(_, v)| v.clone()))
        }
        (recv, name) => Err(eval_err(format!(
            "'{}' object has no method '{name}'",
            recv.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ast::parse;

    fn run(code: &str) -> EvalResult<Value> {
        let stmts = parse(code)?;
        let mut env = HashMap::new();
        execute(&stmts, &mut env, None, None)
    }

    fn run_with_env(code: &str, env: &mut HashMap<String, Value>) -> EvalResult<Value> {
        let stmts = parse(code)?;
        execute(&stmts, env, None, None)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(run("7 // 2").unwrap(), Value::Int(3));
        assert_eq!(run("7 % 3").unwrap(), Value::Int(1));
        assert_eq!(run("2 ** 10").unwrap(), Value::Int(1024));
        assert_eq!(run("7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(run("-(3 + 4)").unwrap(), Value::Int(-7));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(run("1 / 0").is_err());
        assert!(run("1 // 0").is_err());
        assert!(run("1 % 0").is_err());
    }

    #[test]
    fn test_namespace_persistence() {
        let mut env = HashMap::new();
        assert_eq!(run_with_env("x = 42", &mut env).unwrap(), Value::None);
        assert_eq!(run_with_env("x", &mut env).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_repl_returns_last_expression() {
        assert_eq!(run("x = 42; x").unwrap(), Value::Int(42));
    }

    #[test]
    fn test_strings_and_fstrings() {
        assert_eq!(
            run("'a' + 'b' * 3").unwrap(),
            Value::Str("abbb".to_string())
        );
        assert_eq!(
            run("n = 2\nf\"n is {n + 1}\"").unwrap(),
            Value::Str("n is 3".to_string())
        );
    }

    #[test]
    fn test_collections_and_subscripts() {
        assert_eq!(run("[1, 2, 3][1]").unwrap(), Value::Int(2));
        assert_eq!(run("[1, 2, 3][-1]").unwrap(), Value::Int(3));
        assert_eq!(run("{'a': 5}['a']").unwrap(), Value::Int(5));
        assert_eq!(
            run("'hello'[0]").unwrap(),
            Value::Str("h".to_string())
        );
        assert!(run("[1][5]").is_err());
    }

    #[test]
    fn test_dict_assignment_and_del() {
        let code = "d = {}\nd['k'] = 1\nd['k'] += 4\ndel d['k']\nd";
        assert_eq!(run(code).unwrap(), Value::Dict(vec![]));
    }

    #[test]
    fn test_if_and_for() {
        let code = "total = 0\nfor i in [1, 2, 3, 4]:\n    if i % 2 == 0:\n        total += i\ntotal";
        assert_eq!(run(code).unwrap(), Value::Int(6));
    }

    #[test]
    fn test_comparison_chain() {
        assert_eq!(run("1 < 2 <= 2").unwrap(), Value::Bool(true));
        assert_eq!(run("1 < 2 < 2").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_membership() {
        assert_eq!(run("2 in [1, 2]").unwrap(), Value::Bool(true));
        assert_eq!(run("'ell' in 'hello'").unwrap(), Value::Bool(true));
        assert_eq!(run("3 not in [1, 2]").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_bool_short_circuit() {
        assert_eq!(run("0 or 'fallback'").unwrap(), Value::Str("fallback".to_string()));
        assert_eq!(run("1 and 2").unwrap(), Value::Int(2));
        // The right side of a short-circuited `and` must not evaluate.
        assert_eq!(run("0 and undefined_name").unwrap(), Value::Int(0));
    }

    #[test]
    fn test_builtins() {
        assert_eq!(run("len('abc')").unwrap(), Value::Int(3));
        assert_eq!(run("sum([1, 2, 3])").unwrap(), Value::Int(6));
        assert_eq!(run("max([3, 1, 2])").unwrap(), Value::Int(3));
        assert_eq!(run("min(4, 2)").unwrap(), Value::Int(2));
        assert_eq!(
            run("sorted([3, 1, 2])").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            run("range(3)").unwrap(),
            Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
        );
        assert_eq!(run("int('42')").unwrap(), Value::Int(42));
        assert_eq!(run("str(42)").unwrap(), Value::Str("42".to_string()));
    }

    #[test]
    fn test_range_too_large_rejected() {
        assert!(run("range(100000000)").is_err());
    }

    #[test]
    fn test_lambda_and_sorted_key() {
        assert_eq!(run("(lambda a, b: a + b)(2, 3)").unwrap(), Value::Int(5));
        assert_eq!(
            run("sorted(['bb', 'a', 'ccc'], key=lambda s: len(s))").unwrap(),
            Value::List(vec![
                Value::Str("a".to_string()),
                Value::Str("bb".to_string()),
                Value::Str("ccc".to_string()),
            ])
        );
    }

    #[test]
    fn test_list_comprehension() {
        assert_eq!(
            run("[x * x for x in range(4) if x > 0]").unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(4), Value::Int(9)])
        );
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(run("'Hi'.upper()").unwrap(), Value::Str("HI".to_string()));
        assert_eq!(
            run("' x '.strip()").unwrap(),
            Value::Str("x".to_string())
        );
        assert_eq!(
            run("'a,b'.split(',')").unwrap(),
            Value::List(vec![Value::Str("a".to_string()), Value::Str("b".to_string())])
        );
        assert_eq!(
            run("'-'.join(['a', 'b'])").unwrap(),
            Value::Str("a-b".to_string())
        );
        assert_eq!(run("'abc'.startswith('ab')").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_dict_methods() {
        assert_eq!(
            run("{'a': 1}.get('b', 9)").unwrap(),
            Value::Int(9)
        );
        assert_eq!(
            run("{'a': 1}.keys()").unwrap(),
            Value::List(vec![Value::Str("a".to_string())])
        );
    }

    #[test]
    fn test_undefined_name() {
        let err = run("nope").unwrap_err();
        assert!(err.to_string().contains("not defined"));
    }

    #[test]
    fn test_cooperative_deadline() {
        let stmts = parse("total = 0\nfor i in range(1000000):\n    total += i").unwrap();
        let mut env = HashMap::new();
        let deadline = Some((Instant::now(), 1));
        let result = execute(&stmts, &mut env, None, deadline);
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
    }

    #[test]
    fn test_helper_unavailable_without_dispatcher() {
        let err = run("peek(0, 10)").unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn test_json_round_trip() {
        let value = Value::Dict(vec![
            (Value::Str("a".to_string()), Value::Int(1)),
            (
                Value::Str("b".to_string()),
                Value::List(vec![Value::Bool(true), Value::None]),
            ),
        ]);
        let json = value.to_json();
        let back = Value::from_json(&json);
        assert_eq!(back, value);
    }

    #[test]
    fn test_repr() {
        assert_eq!(Value::Int(3).repr(), "3");
        assert_eq!(Value::Str("x".to_string()).repr(), "'x'");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("a".to_string())]).repr(),
            "[1, 'a']"
        );
        assert_eq!(Value::Bool(true).repr(), "True");
        assert_eq!(Value::Float(2.0).repr(), "2.0");
    }
}
