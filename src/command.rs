//! Command registry and handlers
//!
//! Maps upper-cased command names to a handler, an arity contract and a
//! durability flag. Durable commands are the ones that must be written to the
//! append-only log.

use crate::protocol::Value;
use crate::store::Store;
use std::collections::HashMap;
use tracing::warn;

/// Handler signature. Arguments exclude the command name and have already
/// passed the arity check.
pub type Handler = fn(&dyn Store, &[String]) -> Value;

/// Accepted argument counts, not counting the command name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(expected) => n == expected,
            Arity::AtLeast(min) => n >= min,
        }
    }
}

/// One registered command
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: Arity,
    pub durable: bool,
    handler: Handler,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl CommandSpec {
    /// Check arity and run the handler.
    pub fn execute(&self, store: &dyn Store, args: &[String]) -> Value {
        match self.check_arity(args) {
            Ok(()) => (self.handler)(store, args),
            Err(error) => error,
        }
    }

    pub fn check_arity(&self, args: &[String]) -> Result<(), Value> {
        if self.arity.accepts(args.len()) {
            Ok(())
        } else {
            Err(Value::error(format!(
                "ERR wrong number of arguments for '{}' command",
                self.name.to_ascii_lowercase()
            )))
        }
    }
}

/// A decoded client request: `[name, arg, ...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Upper-cased command name
    pub name: String,
    pub args: Vec<String>,
}

impl Request {
    /// Validate the shape of a decoded value. Anything other than a non-empty
    /// array of bulk strings is answered with an error reply.
    pub fn from_value(value: &Value) -> Result<Self, Value> {
        let Value::Array(items) = value else {
            return Err(Value::error("ERR request must be an array of bulk strings"));
        };

        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::BulkString(s) => parts.push(s.clone()),
                _ => return Err(Value::error("ERR request must be an array of bulk strings")),
            }
        }

        let mut parts = parts.into_iter();
        let name = parts
            .next()
            .ok_or_else(|| Value::error("ERR empty command"))?
            .to_ascii_uppercase();

        Ok(Self {
            name,
            args: parts.collect(),
        })
    }
}

/// Fixed table of supported commands
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let specs = [
            spec("PING", Arity::AtLeast(0), false, ping),
            spec("SET", Arity::Exact(2), true, set),
            spec("GET", Arity::Exact(1), false, get),
            spec("DEL", Arity::AtLeast(1), true, del),
            spec("HSET", Arity::Exact(3), true, hset),
            spec("HGET", Arity::Exact(2), false, hget),
            spec("HGETALL", Arity::Exact(1), false, hgetall),
            spec("HDEL", Arity::AtLeast(2), true, hdel),
            spec("KEYS", Arity::Exact(1), false, keys),
        ];

        Self {
            commands: specs.into_iter().map(|s| (s.name, s)).collect(),
        }
    }

    /// Look up a command by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name.to_ascii_uppercase().as_str())
    }

    pub fn is_durable(&self, name: &str) -> bool {
        self.get(name).map_or(false, |spec| spec.durable)
    }

    /// Execute a request without logging it. Unknown commands yield `None`.
    pub fn dispatch(&self, store: &dyn Store, request: &Request) -> Option<Value> {
        self.get(&request.name)
            .map(|spec| spec.execute(store, &request.args))
    }

    /// Re-execute one logged record, discarding the reply.
    pub fn replay(&self, store: &dyn Store, record: &Value) {
        match Request::from_value(record) {
            Ok(request) => {
                if self.dispatch(store, &request).is_none() {
                    warn!(command = %request.name, "skipping unknown command in log");
                }
            }
            Err(_) => warn!("skipping malformed log record"),
        }
    }
}

fn spec(name: &'static str, arity: Arity, durable: bool, handler: Handler) -> CommandSpec {
    CommandSpec {
        name,
        arity,
        durable,
        handler,
    }
}

fn ping(_store: &dyn Store, args: &[String]) -> Value {
    match args.first() {
        Some(message) => Value::simple(message.clone()),
        None => Value::simple("PONG"),
    }
}

fn set(store: &dyn Store, args: &[String]) -> Value {
    store.set(args[0].clone(), args[1].clone());
    Value::simple("OK")
}

fn get(store: &dyn Store, args: &[String]) -> Value {
    match store.get(&args[0]) {
        Some(value) => Value::BulkString(value),
        None => Value::NullBulkString,
    }
}

fn del(store: &dyn Store, args: &[String]) -> Value {
    Value::Integer(store.delete(args) as i64)
}

fn hset(store: &dyn Store, args: &[String]) -> Value {
    store.hset(args[0].clone(), args[1].clone(), args[2].clone());
    Value::simple("OK")
}

fn hget(store: &dyn Store, args: &[String]) -> Value {
    match store.hget(&args[0], &args[1]) {
        Some(value) => Value::BulkString(value),
        None => Value::NullBulkString,
    }
}

// Values only, ordered by field name.
fn hgetall(store: &dyn Store, args: &[String]) -> Value {
    match store.hgetall(&args[0]) {
        Some(pairs) => Value::Array(pairs.into_iter().map(|(_, v)| Value::BulkString(v)).collect()),
        None => Value::NullBulkString,
    }
}

fn hdel(store: &dyn Store, args: &[String]) -> Value {
    Value::Integer(store.hdel(&args[0], &args[1..]) as i64)
}

fn keys(store: &dyn Store, args: &[String]) -> Value {
    Value::Array(store.keys(&args[0]).into_iter().map(Value::BulkString).collect())
}
