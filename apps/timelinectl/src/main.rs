use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use timeline_kernel::{TimelineBuilder, TimelineKernel};
use timeline_protocol::{RequestContext, StreamEvent, UNIFIED_TIMELINE_STREAM, build_stream_id};
use timeline_routing::RouteTable;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "timelinectl")]
#[command(about = "Append to and read the realtime timeline store")]
struct Cli {
    /// JSON array of route records.
    #[arg(long, env = "TIMELINE_ROUTES")]
    routes: PathBuf,
    #[arg(long, env = "TIMELINE_TENANT_ID")]
    tenant_id: String,
    #[arg(long, env = "TIMELINE_PROJECT_ID")]
    project_id: String,
    #[arg(long, env = "TIMELINE_ENV", default_value = "lab")]
    env: String,
    #[arg(long)]
    mode: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the backend the route table resolves for this scope.
    Backend,
    /// Append one truth event to a thread.
    Append {
        #[arg(long)]
        thread: String,
        #[arg(long = "type")]
        event_type: String,
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Append loose JSON envelopes, one per line.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print stored events as JSON lines.
    List {
        #[arg(long, conflicts_with = "unified")]
        thread: Option<String>,
        #[arg(long)]
        unified: bool,
        #[arg(long)]
        after: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let routes = RouteTable::load(&cli.routes)
        .with_context(|| format!("failed to load route table {}", cli.routes.display()))?;
    let kernel = TimelineBuilder::new(routes)
        .scope(&cli.tenant_id, &cli.env, &cli.project_id)
        .build()?;

    let mut context = RequestContext::new(cli.tenant_id.as_str(), cli.project_id.as_str())
        .with_env(cli.env.as_str());
    if let Some(mode) = &cli.mode {
        context = context.with_mode(mode.as_str());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(&kernel, &context, cli.command, &mut out).await
}

async fn execute(
    kernel: &TimelineKernel,
    context: &RequestContext,
    command: Command,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::Backend => match kernel.backend() {
            Some(backend) => writeln!(out, "{}", serde_json::to_string(backend)?)?,
            None => bail!("kernel was not built from a route table"),
        },
        Command::Append {
            thread,
            event_type,
            data,
        } => {
            let data: Value = serde_json::from_str(&data).context("--data must be JSON")?;
            let event = StreamEvent::truth(event_type, context.routing_for_thread(thread), data);
            let appended = kernel.append_event(event, context).await?;
            info!(event_id = %appended.event_id, stream_id = %appended.stream_id(), "event appended");
            write_event(out, &appended)?;
        }
        Command::Import { file } => {
            let reader = BufReader::new(
                std::fs::File::open(&file)
                    .with_context(|| format!("failed to open {}", file.display()))?,
            );
            let mut imported = 0usize;
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(&line)
                    .with_context(|| format!("line {} is not JSON", index + 1))?;
                let appended = kernel
                    .append_value(value, context)
                    .await
                    .with_context(|| format!("line {} rejected", index + 1))?;
                write_event(out, &appended)?;
                imported += 1;
            }
            info!(imported, file = %file.display(), "import complete");
        }
        Command::List {
            thread,
            unified,
            after,
        } => {
            let stream_id = match (thread, unified) {
                (_, true) => UNIFIED_TIMELINE_STREAM.to_owned(),
                (Some(thread), false) => build_stream_id(&context.routing_for_thread(thread)),
                (None, false) => bail!("either --thread or --unified is required"),
            };
            for event in kernel
                .list_after(&stream_id, context, after.as_deref())
                .await?
            {
                write_event(out, &event)?;
            }
        }
    }
    Ok(())
}

fn write_event(out: &mut impl Write, event: &StreamEvent) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string(event)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use serde_json::Value;
    use timeline_kernel::TimelineKernel;
    use timeline_protocol::RequestContext;
    use timeline_store::InMemoryTimelineStore;

    use super::{Command, execute};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn lines(out: &[u8]) -> Result<Vec<Value>> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    async fn run(kernel: &TimelineKernel, command: Command) -> Result<Vec<Value>> {
        let context = RequestContext::new("t_demo", "p1");
        let mut out = Vec::new();
        execute(kernel, &context, command, &mut out).await?;
        lines(&out)
    }

    #[tokio::test]
    async fn append_then_list_thread_and_unified() -> Result<()> {
        let kernel = TimelineKernel::with_store(Arc::new(InMemoryTimelineStore::new()), 8);
        let appended = run(
            &kernel,
            Command::Append {
                thread: "th1".into(),
                event_type: "user_message".into(),
                data: r#"{"text":"hi"}"#.into(),
            },
        )
        .await?;
        assert_eq!(appended[0]["meta"]["priority"], "truth");

        let thread = run(
            &kernel,
            Command::List {
                thread: Some("th1".into()),
                unified: false,
                after: None,
            },
        )
        .await?;
        let unified = run(
            &kernel,
            Command::List {
                thread: None,
                unified: true,
                after: None,
            },
        )
        .await?;
        assert_eq!(thread.len(), 1);
        assert_eq!(unified.len(), 1);
        assert_eq!(thread[0]["event_id"], appended[0]["event_id"]);
        Ok(())
    }

    #[tokio::test]
    async fn list_after_skips_through_cursor() -> Result<()> {
        let kernel = TimelineKernel::with_store(Arc::new(InMemoryTimelineStore::new()), 8);
        let mut ids = Vec::new();
        for text in ["a", "b"] {
            let appended = run(
                &kernel,
                Command::Append {
                    thread: "th1".into(),
                    event_type: "user_message".into(),
                    data: format!(r#"{{"text":"{text}"}}"#),
                },
            )
            .await?;
            ids.push(appended[0]["event_id"].as_str().unwrap().to_owned());
        }

        let rest = run(
            &kernel,
            Command::List {
                thread: Some("th1".into()),
                unified: false,
                after: Some(ids[0].clone()),
            },
        )
        .await?;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0]["event_id"], ids[1].as_str());
        Ok(())
    }

    #[tokio::test]
    async fn import_rejects_foreign_tenant_lines() -> Result<()> {
        let root = unique_test_root("timelinectl-import");
        std::fs::create_dir_all(&root)?;
        let file = root.join("events.jsonl");
        std::fs::write(
            &file,
            concat!(
                r#"{"type":"note","routing":{"tenant_id":"t_demo","project_id":"p1","thread_id":"th1"},"data":{}}"#,
                "\n\n",
                r#"{"type":"note","routing":{"tenant_id":"t_other","project_id":"p1","thread_id":"th1"},"data":{}}"#,
                "\n",
            ),
        )?;

        let kernel = TimelineKernel::with_store(Arc::new(InMemoryTimelineStore::new()), 8);
        let context = RequestContext::new("t_demo", "p1");
        let mut out = Vec::new();
        let result = execute(&kernel, &context, Command::Import { file }, &mut out).await;
        assert!(result.is_err());
        assert_eq!(lines(&out)?.len(), 1);

        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn backend_requires_routed_kernel() {
        let kernel = TimelineKernel::with_store(Arc::new(InMemoryTimelineStore::new()), 8);
        assert!(run(&kernel, Command::Backend).await.is_err());
    }

    #[tokio::test]
    async fn list_needs_a_target() {
        let kernel = TimelineKernel::with_store(Arc::new(InMemoryTimelineStore::new()), 8);
        let result = run(
            &kernel,
            Command::List {
                thread: None,
                unified: false,
                after: None,
            },
        )
        .await;
        assert!(result.is_err());
    }
}
