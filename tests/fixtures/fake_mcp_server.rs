//! A minimal MCP server speaking JSON-RPC 2.0 over stdio, used only by the
//! integration tests in this crate. Not part of the published binary.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

fn write_line(stdout: &mut io::Stdout, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    let _ = stdout.write_all(line.as_bytes());
    let _ = stdout.flush();
}

fn main() {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut bonus_tool_visible = false;
    let mut health_ok = true;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let id = msg.get("id").cloned();
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();

        match method {
            "initialize" => {
                write_line(
                    &mut stdout,
                    &json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": "2024-11-05",
                            "serverInfo": {"name": "fake-mcp-server", "version": "0.0.0"},
                            "capabilities": {},
                        },
                    }),
                );
            }
            "notifications/initialized" => {}
            "tools/list" => {
                let mut tools = vec![json!({
                    "name": "echo",
                    "description": "echoes its arguments back",
                    "inputSchema": {"type": "object"},
                })];
                if bonus_tool_visible {
                    tools.push(json!({
                        "name": "bonus",
                        "description": "only visible after trigger_change",
                        "inputSchema": {"type": "object"},
                    }));
                }
                write_line(
                    &mut stdout,
                    &json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}}),
                );
            }
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

                match name {
                    "echo" => {
                        write_line(
                            &mut stdout,
                            &json!({"jsonrpc": "2.0", "id": id, "result": {"echoed": arguments}}),
                        );
                    }
                    "slow" => {
                        let token = id.clone().unwrap_or(Value::Null);
                        for pct in [0.25_f64, 0.75] {
                            write_line(
                                &mut stdout,
                                &json!({
                                    "jsonrpc": "2.0",
                                    "method": "notifications/progress",
                                    "params": {"progressToken": token, "progress": pct, "total": 1.0},
                                }),
                            );
                            std::thread::sleep(std::time::Duration::from_millis(40));
                        }
                        write_line(
                            &mut stdout,
                            &json!({"jsonrpc": "2.0", "id": id, "result": {"done": true}}),
                        );
                    }
                    "trigger_change" => {
                        bonus_tool_visible = true;
                        write_line(
                            &mut stdout,
                            &json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}}),
                        );
                        write_line(
                            &mut stdout,
                            &json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
                        );
                    }
                    "crash" => {
                        std::process::exit(7);
                    }
                    "break_health" => {
                        health_ok = false;
                        write_line(
                            &mut stdout,
                            &json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}}),
                        );
                    }
                    "health" => {
                        if health_ok {
                            write_line(
                                &mut stdout,
                                &json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}}),
                            );
                        } else {
                            write_line(
                                &mut stdout,
                                &json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "error": {"code": -32000, "message": "unhealthy"},
                                }),
                            );
                        }
                    }
                    other => {
                        write_line(
                            &mut stdout,
                            &json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {"code": -32601, "message": format!("unknown tool: {other}")},
                            }),
                        );
                    }
                }
            }
            _ => {}
        }
    }
}
