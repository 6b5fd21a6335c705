//! Interactive prompt
//!
//! Every plain line is a statement run on the `cli` tab. Ctrl-C while a
//! statement runs cancels it; at an idle prompt it is ignored.

use std::future::Future;
use std::io::Write;

use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::errors::{ServiceError, ServiceResult};
use crate::models::{CellValue, ConnectionInfo, ExportFormat, HistoryEntry, QueryResult};
use crate::service::Service;

/// Tab id the prompt runs its statements under.
pub const CLI_TAB: &str = "cli";

const DEFAULT_HISTORY_LIMIT: i64 = 20;

const HELP: &str = "\
  <sql>                     run a statement (Ctrl-C cancels it)
  \\connect <url>            connect to a postgres:// URL
  \\c <database>             switch database on the current server
  \\conninfo                 show the current connection
  \\l                        list databases
  \\explain <sql>            show the plan
  \\analyze <sql>            run EXPLAIN ANALYZE
  \\export csv|json <sql>    write the result to stdout
  \\history [n|clear]        recent statements
  \\disconnect               drop the connection
  \\q                        quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Sql(String),
    Connect(String),
    Disconnect,
    SwitchDatabase(String),
    ConnInfo,
    ListDatabases,
    Explain(String),
    Analyze(String),
    Export { format: ExportFormat, sql: String },
    History(i64),
    ClearHistory,
    Help,
    Quit,
}

/// Parse one prompt line.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(meta) = line.strip_prefix('\\') else {
        return Ok(Command::Sql(line.trim_end_matches(';').trim_end().to_string()));
    };

    let (name, rest) = match meta.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (meta, ""),
    };
    let required = |what: &str| {
        if rest.is_empty() {
            Err(format!("\\{} needs {}", name, what))
        } else {
            Ok(rest.to_string())
        }
    };

    match name {
        "q" | "quit" => Ok(Command::Quit),
        "?" | "h" | "help" => Ok(Command::Help),
        "connect" => required("a URL").map(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "c" => required("a database name").map(Command::SwitchDatabase),
        "conninfo" => Ok(Command::ConnInfo),
        "l" => Ok(Command::ListDatabases),
        "explain" => required("a statement").map(Command::Explain),
        "analyze" => required("a statement").map(Command::Analyze),
        "export" => {
            let (format, sql) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: \\export csv|json <sql>".to_string())?;
            Ok(Command::Export {
                format: format.parse()?,
                sql: sql.trim().to_string(),
            })
        }
        "history" => match rest {
            "" => Ok(Command::History(DEFAULT_HISTORY_LIMIT)),
            "clear" => Ok(Command::ClearHistory),
            n => n
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .map(Command::History)
                .ok_or_else(|| format!("invalid history limit '{}'", n)),
        },
        other => Err(format!("unknown command \\{}, try \\?", other)),
    }
}

/// Read commands from stdin until EOF or `\q`.
pub async fn run_prompt(service: &Service) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("pglet> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                continue;
            }
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        match parse_command(&line) {
            Ok(Command::Quit) => return Ok(()),
            Ok(command) => execute(service, command).await,
            Err(message) => eprintln!("{}", message),
        }
    }
}

async fn execute(service: &Service, command: Command) {
    debug!("prompt command {:?}", command);
    let outcome: ServiceResult<()> = async {
        match command {
            Command::Empty | Command::Quit => {}
            Command::Help => println!("{}", HELP),
            Command::Sql(sql) => {
                let result = interruptible(service.run_query(CLI_TAB, &sql), || {
                    service.cancel_query(CLI_TAB)
                })
                .await?;
                print!("{}", format_table(&result));
            }
            Command::Connect(url) => print_info(&service.connect(&url).await?),
            Command::Disconnect => {
                service.disconnect().await;
                println!("disconnected");
            }
            Command::SwitchDatabase(name) => print_info(&service.switch_database(&name).await?),
            Command::ConnInfo => match service.current_info().await? {
                Some(info) => print_info(&info),
                None => println!("not connected"),
            },
            Command::ListDatabases => {
                for name in service.databases().await? {
                    println!("{}", name);
                }
            }
            Command::Explain(sql) => {
                let cancel = CancellationToken::new();
                let plan = interruptible(service.explain_query(&sql, &cancel), || cancel.cancel()).await?;
                print!("{}", format_table(&plan));
            }
            Command::Analyze(sql) => {
                let cancel = CancellationToken::new();
                let plan = interruptible(service.analyze_query(&sql, &cancel), || cancel.cancel()).await?;
                print!("{}", format_table(&plan));
            }
            Command::Export { format, sql } => {
                let cancel = CancellationToken::new();
                let export = service.export_to(&sql, format, std::io::stdout(), &cancel);
                let rows = interruptible(export, || cancel.cancel()).await?;
                eprintln!("exported {} rows as {}", rows, format);
            }
            Command::History(limit) => {
                let page = service.list_history(limit, 0).await?;
                for entry in page.entries.iter().rev() {
                    println!("{}", format_history(entry));
                }
                println!("({} of {} entries)", page.entries.len(), page.total);
            }
            Command::ClearHistory => {
                service.clear_history().await?;
                println!("history cleared");
            }
        }
        Ok::<(), ServiceError>(())
    }
    .await;

    if let Err(e) = outcome {
        eprintln!("ERROR: {}", e);
    }
}

/// Drive `work` to completion, calling `interrupt` on every Ctrl-C.
async fn interruptible<F: Future>(work: F, interrupt: impl Fn()) -> F::Output {
    tokio::pin!(work);
    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("cancel requested");
                interrupt();
            }
        }
    }
}

fn print_info(info: &ConnectionInfo) {
    println!(
        "connected to \"{}\" as \"{}\" on {}:{} (server {})",
        info.database,
        info.user,
        info.host,
        info.port,
        if info.version.is_empty() { "unknown" } else { info.version.as_str() }
    );
}

fn format_history(entry: &HistoryEntry) -> String {
    let status = if entry.is_success() {
        format!("{} rows", entry.row_count)
    } else {
        format!("error: {}", entry.error)
    };
    format!(
        "{} [{}] {} ms, {}: {}",
        entry.executed_at, entry.database, entry.duration_ms, status, entry.sql
    )
}

/// Plain aligned table with a `(n rows, t ms)` footer. NULL prints as `NULL`.
pub fn format_table(result: &QueryResult) -> String {
    let display = |cell: &CellValue| -> String {
        match cell {
            CellValue::Null => "NULL".to_string(),
            CellValue::Text(text) => text.replace('\n', "\\n"),
        }
    };
    let rendered: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(display).collect())
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.chars().count()).collect();
    for row in &rendered {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect();
        padded.join(" | ").trim_end().to_string()
    };

    let mut out = String::new();
    if !result.columns.is_empty() {
        out.push_str(&line(&result.columns));
        out.push('\n');
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&rule.join("-+-"));
        out.push('\n');
    }
    for row in &rendered {
        out.push_str(&line(row));
        out.push('\n');
    }
    let noun = if result.row_count == 1 { "row" } else { "rows" };
    out.push_str(&format!("({} {}, {} ms)\n", result.row_count, noun, result.duration_ms));
    out
}
