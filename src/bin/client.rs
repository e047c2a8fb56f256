//! Standalone client binary for testing a RedVault server
//!
//! Sends whitespace-separated commands and prints replies redis-cli style

use redvault::{Client, Value};
use std::env;
use std::io::{self, Write};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let server_addr = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:6379".to_string());

    println!("Connecting to RedVault server at {}...", server_addr);
    let mut client = Client::connect(&server_addr).await?;
    println!("Connected! Type 'help' for available commands or 'quit' to exit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => print_help(),
            _ => {
                let parts: Vec<&str> = input.split_whitespace().collect();
                match client.command(&parts).await {
                    Ok(reply) => println!("{}", format_reply(&reply, 0)),
                    Err(e) => {
                        println!("Error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    client.close().await?;
    Ok(())
}

fn format_reply(reply: &Value, indent: usize) -> String {
    match reply {
        Value::SimpleString(s) => s.clone(),
        Value::Error(e) => format!("(error) {}", e),
        Value::Integer(n) => format!("(integer) {}", n),
        Value::BulkString(s) => format!("\"{}\"", s),
        Value::NullBulkString => "(nil)".to_string(),
        Value::Array(items) if items.is_empty() => "(empty array)".to_string(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let pad = if i == 0 { String::new() } else { " ".repeat(indent) };
                format!("{}{}) {}", pad, i + 1, format_reply(item, indent + 3))
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  PING [message]              - Check the connection");
    println!("  SET <key> <value>           - Set a key-value pair");
    println!("  GET <key>                   - Get value by key");
    println!("  DEL <key> [key ...]         - Delete keys");
    println!("  HSET <hash> <field> <value> - Set a hash field");
    println!("  HGET <hash> <field>         - Get a hash field");
    println!("  HGETALL <hash>              - Get all values in a hash");
    println!("  HDEL <hash> <field> [...]   - Delete hash fields");
    println!("  KEYS <pattern>              - List keys containing pattern (* for all)");
    println!("  help                        - Show this help message");
    println!("  quit                        - Exit the client");
}
