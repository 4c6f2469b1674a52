//! Interactive console (component C10), grounded in
//! `original_source/lib/core/components/impl/socketappserver.py`'s
//! `SocketConsole.raw_input`/`_run_interactive`: a line-oriented REPL that
//! turns typed commands into the application server's `app_data` objects
//! (spec.md §4.6's command table) and prints back its `Envelope` responses.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use crate::server::wire;
use crate::server::wire::Envelope;

pub async fn run_interactive<S>(mut stream: S, service: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    print_prompt();
    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            print_prompt();
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }

        match parse_command(line, service) {
            Ok(request) => {
                wire::send(&mut stream, &request).await?;
                match wire::recv::<_, Envelope>(&mut stream).await? {
                    Some(envelope) => print_envelope(&envelope),
                    None => {
                        println!("server closed the connection");
                        break;
                    }
                }
            }
            Err(err) => println!("error: {}", err),
        }
        print_prompt();
    }
    Ok(())
}

/// Builds one `app_data` object per spec.md §4.6's command table.
fn parse_command(line: &str, service: &str) -> Result<Value> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or("");
    match command {
        "poll" | "kill" => {
            let appid: u64 = words
                .next()
                .ok_or_else(|| anyhow::anyhow!("usage: {} <appid>", command))?
                .parse()
                .map_err(|_| anyhow::anyhow!("appid must be a number"))?;
            Ok(json!({"service": service, "command": command, "appid": appid}))
        }
        "submit" => {
            let title = words.next().ok_or_else(|| anyhow::anyhow!("usage: submit <title> [args...]"))?.to_string();
            let args: Vec<String> = words.map(String::from).collect();
            Ok(json!({
                "service": service,
                "command": "submit",
                "title": title,
                "args": args,
                "write_request": false,
                "mode": "asynch",
            }))
        }
        "interact" => Ok(json!({"service": service, "command": "interact"})),
        other => bail!("unknown command '{}' (try: submit, poll, kill, interact, quit)", other),
    }
}

fn print_envelope(envelope: &Envelope) {
    match envelope.status {
        wire::Status::Ok => println!("OK: {}", envelope.message),
        wire::Status::Failed => println!("failed: {}", envelope.message),
    }
}

fn print_prompt() {
    use std::io::Write;
    print!("ddm> ");
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submit_with_args() {
        let request = parse_command("submit resync /a/b/c T2_US", "ddm").unwrap();
        assert_eq!(request["command"], "submit");
        assert_eq!(request["title"], "resync");
        assert_eq!(request["args"][0], "/a/b/c");
        assert_eq!(request["args"][1], "T2_US");
    }

    #[test]
    fn parses_poll_requires_numeric_id() {
        assert!(parse_command("poll not-a-number", "ddm").is_err());
        let request = parse_command("poll 7", "ddm").unwrap();
        assert_eq!(request["command"], "poll");
        assert_eq!(request["appid"], 7);
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(parse_command("bogus", "ddm").is_err());
    }
}
