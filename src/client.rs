//! Client library for connecting to a RedVault server
//!
//! Speaks the same RESP framing as the server: requests go out as arrays of
//! bulk strings, replies are decoded with [`RespReader`].

use crate::error::{RedVaultError, Result};
use crate::protocol::{RespReader, Value};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Client for connecting to a RedVault server
pub struct Client {
    reader: RespReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Client {
    /// Connect to a RedVault server
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: RespReader::new(read_half),
            writer: BufWriter::new(write_half),
        })
    }

    /// Send an arbitrary command and return the raw reply
    pub async fn command(&mut self, parts: &[&str]) -> Result<Value> {
        self.send(&Value::command(parts)).await
    }

    /// Send any value (not necessarily a well-formed request) and read one reply
    pub async fn send(&mut self, value: &Value) -> Result<Value> {
        self.writer.write_all(&value.to_bytes()).await?;
        self.writer.flush().await?;

        self.reader
            .read_value()
            .await?
            .ok_or_else(|| RedVaultError::Client("connection closed by server".to_string()))
    }

    pub async fn ping(&mut self, message: Option<&str>) -> Result<String> {
        let reply = match message {
            Some(m) => self.command(&["PING", m]).await?,
            None => self.command(&["PING"]).await?,
        };
        match reply {
            Value::SimpleString(s) => Ok(s),
            other => Err(unexpected("PING", other)),
        }
    }

    /// Set a key-value pair
    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        expect_ok("SET", self.command(&["SET", key, value]).await?)
    }

    /// Get a value by key
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        optional_bulk("GET", self.command(&["GET", key]).await?)
    }

    /// Delete keys, returning how many existed
    pub async fn del(&mut self, keys: &[&str]) -> Result<i64> {
        let mut parts = vec!["DEL"];
        parts.extend_from_slice(keys);
        integer("DEL", self.command(&parts).await?)
    }

    pub async fn hset(&mut self, hash: &str, field: &str, value: &str) -> Result<()> {
        expect_ok("HSET", self.command(&["HSET", hash, field, value]).await?)
    }

    pub async fn hget(&mut self, hash: &str, field: &str) -> Result<Option<String>> {
        optional_bulk("HGET", self.command(&["HGET", hash, field]).await?)
    }

    /// Values of every field in a hash, or `None` if the hash does not exist
    pub async fn hgetall(&mut self, hash: &str) -> Result<Option<Vec<String>>> {
        match self.command(&["HGETALL", hash]).await? {
            Value::NullBulkString => Ok(None),
            Value::Array(items) => Ok(Some(bulk_strings("HGETALL", items)?)),
            other => Err(unexpected("HGETALL", other)),
        }
    }

    pub async fn hdel(&mut self, hash: &str, fields: &[&str]) -> Result<i64> {
        let mut parts = vec!["HDEL", hash];
        parts.extend_from_slice(fields);
        integer("HDEL", self.command(&parts).await?)
    }

    pub async fn keys(&mut self, pattern: &str) -> Result<Vec<String>> {
        match self.command(&["KEYS", pattern]).await? {
            Value::Array(items) => bulk_strings("KEYS", items),
            other => Err(unexpected("KEYS", other)),
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn unexpected(command: &str, reply: Value) -> RedVaultError {
    match reply {
        Value::Error(e) => RedVaultError::Server(e),
        other => RedVaultError::Protocol(format!("unexpected reply to {}: {:?}", command, other)),
    }
}

fn expect_ok(command: &str, reply: Value) -> Result<()> {
    match reply {
        Value::SimpleString(s) if s == "OK" => Ok(()),
        other => Err(unexpected(command, other)),
    }
}

fn optional_bulk(command: &str, reply: Value) -> Result<Option<String>> {
    match reply {
        Value::BulkString(s) => Ok(Some(s)),
        Value::NullBulkString => Ok(None),
        other => Err(unexpected(command, other)),
    }
}

fn integer(command: &str, reply: Value) -> Result<i64> {
    match reply {
        Value::Integer(n) => Ok(n),
        other => Err(unexpected(command, other)),
    }
}

fn bulk_strings(command: &str, items: Vec<Value>) -> Result<Vec<String>> {
    items
        .into_iter()
        .map(|item| match item {
            Value::BulkString(s) => Ok(s),
            other => Err(unexpected(command, other)),
        })
        .collect()
}
