use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_core::{Handle, Runtime, TaskStatus};

/// Tether chat client options
#[derive(Parser)]
struct Opts {
    /// Server port
    #[arg(short, long, default_value = "6969")]
    port: u16,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

/// Forward stdin lines to the server. Closes the connection on end of input.
fn forward_stdin(rt: &Runtime, conn: Handle) {
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        if rt.write(conn, format!("{}\n", line).as_bytes()).is_err() {
            return;
        }
    }
    let _ = rt.close_connection(conn);
}

/// Turn one server line into what the user sees.
fn render(line: &str) -> String {
    match line.strip_prefix("USER ") {
        Some(name) => format!("You are {}", name),
        None => line.to_string(),
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    tether_core::init_logging("warn");

    let rt = Arc::new(Runtime::with_defaults().context("starting runtime")?);
    let address = format!("{}:{}", opts.host, opts.port);
    let conn = rt
        .connect(&address)
        .with_context(|| format!("failed to connect to {}", address))?;
    println!("Connected to {}", address);

    let forwarder = {
        let rt_task = rt.clone();
        rt.tasks().launch_detached(move || forward_stdin(&rt_task, conn))
    };

    let mut stdout = io::stdout();
    let mut buf = [0u8; 1024];
    let mut pending = Vec::new();
    while let Ok(n) = rt.read(conn, &mut buf) {
        pending.extend_from_slice(&buf[..n]);
        while let Some(end) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            writeln!(stdout, "{}", render(&String::from_utf8_lossy(&line[..end])))?;
        }
        stdout.flush()?;
    }
    println!("Disconnected.");
    let _ = rt.close_connection(conn);

    match rt.tasks().poll(forwarder)? {
        TaskStatus::Completed(_) => Ok(()),
        // still blocked on stdin; nothing left to clean up
        TaskStatus::Running => std::process::exit(0),
    }
}
