use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tether_core::{
    ApprovalPolicy, AskEveryTime, AskResolution, AskSayController, ConfigStore, DryRunTools,
    EngineRuntime, JsonFileStore, RepetitionGuard, RuleApprovalPolicy, Task,
};
use tether_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use tether_types::{AskReply, AskResponse, ContentBlock, ProtocolFamily, StreamChunk};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether-engine")]
#[command(about = "Headless Tether conversation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replays recorded stream chunks (one JSON object per line) through the
    /// orchestrator. Each `done` chunk closes a turn.
    Replay {
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, env = "TETHER_STATE_DIR")]
        state_dir: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
        #[arg(long, default_value = "Replay the recorded conversation.")]
        prompt: String,
        #[arg(long)]
        protocol_family: Option<String>,
    },
    /// Runs the repetition guard over a reasoning transcript.
    ScanReasoning { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            events,
            config,
            state_dir,
            auto_approve,
            prompt,
            protocol_family,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let overrides = build_cli_overrides(protocol_family)?;
            let report = run_replay(ReplayArgs {
                events,
                config_path: config.unwrap_or_else(|| state_dir.join("config.json")),
                state_dir,
                auto_approve,
                prompt,
                overrides,
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ScanReasoning { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let detection = RepetitionGuard::scan(&text);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "chars": text.chars().count(),
                    "detection": detection,
                }))?
            );
        }
    }

    Ok(())
}

struct ReplayArgs {
    events: PathBuf,
    config_path: PathBuf,
    state_dir: PathBuf,
    auto_approve: bool,
    prompt: String,
    overrides: Option<Value>,
}

async fn run_replay(args: ReplayArgs) -> anyhow::Result<Value> {
    let turns = split_turns(read_stream_chunks(&args.events).await?);
    let config = ConfigStore::new(&args.config_path, args.overrides).await?.get().await;
    let persistence = Arc::new(JsonFileStore::new(args.state_dir.join("tasks")).await?);
    let policy: Arc<dyn ApprovalPolicy> = if args.auto_approve {
        Arc::new(RuleApprovalPolicy::allow_all_tools())
    } else {
        Arc::new(AskEveryTime)
    };
    let runtime = EngineRuntime::new(config, persistence, Arc::new(DryRunTools::new()), policy)?;

    let mut events = runtime.event_bus().subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(event_type = %event.event_type, properties = %event.properties, "engine event");
        }
    });

    let mut root = runtime.create_task().await?;
    root.submit_user_content(vec![ContentBlock::text(args.prompt)])
        .await?;

    let mut stack: Vec<Task> = vec![root];
    let mut turn_reports = Vec::new();
    let mut finished = Vec::new();

    for segment in turns {
        let Some(current) = stack.last_mut() else { break };
        let responder = (!args.auto_approve).then(|| spawn_stdin_responder(current.ask_say().clone()));
        if !current.pending_results().is_empty() {
            current.submit_user_content(Vec::new()).await?;
        }
        let result = current
            .run_turn(futures::stream::iter(segment.into_iter().map(Ok)))
            .await;
        if let Some(responder) = responder {
            responder.abort();
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(task_id = current.id(), error = %err, "replay stopped");
                turn_reports.push(json!({
                    "taskID": current.id(),
                    "error": err.to_string(),
                    "code": err.code(),
                }));
                break;
            }
        };
        turn_reports.push(json!({ "taskID": current.id(), "outcome": outcome }));

        if let Some(call) = &outcome.delegation {
            let child = runtime.spawn_child(current, call).await?;
            stack.push(child);
        } else if stack.len() > 1 && !outcome.needs_follow_up() {
            let Some(child) = stack.pop() else { break };
            finished.push(task_snapshot(&child).await);
            let Some(parent) = stack.last_mut() else { break };
            runtime.finish_child(parent, child, &outcome.text).await?;
        }
    }

    let mut tasks = Vec::new();
    for task in &stack {
        tasks.push(task_snapshot(task).await);
    }
    tasks.extend(finished);

    runtime.shutdown().await;
    event_log.abort();
    Ok(json!({ "turns": turn_reports, "tasks": tasks }))
}

async fn task_snapshot(task: &Task) -> Value {
    json!({
        "taskID": task.id(),
        "parentID": task.parent_id(),
        "transcript": task.transcript(),
        "messages": task.ask_say().messages().await,
    })
}

/// Answers pending asks from stdin: `y` approves, `n` rejects, anything else
/// is sent as a message.
fn spawn_stdin_responder(ask_say: AskSayController) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let pending = ask_say
                .pending_ask()
                .await
                .filter(|pending| pending.resolution == AskResolution::Unresolved);
            let Some(pending) = pending else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };
            eprintln!(
                "[{}] {} (y/n/message)",
                pending.ask_type.as_str(),
                pending.text.as_deref().unwrap_or("")
            );
            match lines.next_line().await {
                Ok(Some(line)) => ask_say.respond(parse_reply(&line)).await,
                _ => return,
            }
        }
    })
}

fn parse_reply(line: &str) -> AskReply {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => AskReply::new(AskResponse::YesButtonClicked),
        "n" | "no" => AskReply::new(AskResponse::NoButtonClicked),
        _ => {
            let mut reply = AskReply::new(AskResponse::MessageResponse);
            reply.text = Some(line.trim().to_string());
            reply
        }
    }
}

async fn read_stream_chunks(path: &Path) -> anyhow::Result<Vec<StreamChunk>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut chunks = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let chunk: StreamChunk = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid stream chunk", path.display(), idx + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Splits a recording into turns after each `done` chunk. Trailing chunks
/// without `done` still form a turn.
fn split_turns(chunks: Vec<StreamChunk>) -> Vec<Vec<StreamChunk>> {
    let mut turns = Vec::new();
    let mut current = Vec::new();
    for chunk in chunks {
        let closes = matches!(chunk, StreamChunk::Done { .. });
        current.push(chunk);
        if closes {
            turns.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        turns.push(current);
    }
    turns
}

fn build_cli_overrides(protocol_family: Option<String>) -> anyhow::Result<Option<Value>> {
    let Some(family) = protocol_family else {
        return Ok(None);
    };
    let family: ProtocolFamily = serde_json::from_value(Value::String(
        family.trim().to_ascii_lowercase().replace('-', "_"),
    ))
    .map_err(|_| {
        anyhow::anyhow!("unsupported protocol family `{family}`; expected anthropic or openai_compatible")
    })?;
    Ok(Some(json!({ "protocol_family": family })))
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag.filter(|dir| !dir.as_os_str().is_empty()) {
        return dir;
    }
    dirs::data_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_turns_closes_on_done() {
        let turns = split_turns(vec![
            StreamChunk::TextDelta { text: "a".into() },
            StreamChunk::Done { finish_reason: None },
            StreamChunk::TextDelta { text: "b".into() },
        ]);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].len(), 2);
        assert_eq!(turns[1].len(), 1);
    }

    #[test]
    fn parse_reply_maps_buttons_and_messages() {
        assert_eq!(parse_reply("Y").response, AskResponse::YesButtonClicked);
        assert_eq!(parse_reply(" no ").response, AskResponse::NoButtonClicked);
        let reply = parse_reply("use the other file");
        assert_eq!(reply.response, AskResponse::MessageResponse);
        assert_eq!(reply.text.as_deref(), Some("use the other file"));
    }

    #[test]
    fn build_cli_overrides_validates_family() {
        assert_eq!(build_cli_overrides(None).expect("none"), None);
        assert_eq!(
            build_cli_overrides(Some("OpenAI-Compatible".into())).expect("family"),
            Some(json!({ "protocol_family": "openai_compatible" }))
        );
        assert!(build_cli_overrides(Some("gopher".into())).is_err());
    }

    #[test]
    fn resolve_state_dir_prefers_flag() {
        assert_eq!(
            resolve_state_dir(Some(PathBuf::from("/tmp/tether-state"))),
            PathBuf::from("/tmp/tether-state")
        );
    }

    #[tokio::test]
    async fn read_stream_chunks_reports_bad_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("good.jsonl");
        tokio::fs::write(
            &good,
            "{\"type\":\"text_delta\",\"text\":\"hi\"}\n\n{\"type\":\"done\"}\n",
        )
        .await
        .expect("write");
        assert_eq!(read_stream_chunks(&good).await.expect("chunks").len(), 2);

        let bad = dir.path().join("bad.jsonl");
        tokio::fs::write(&bad, "{\"type\":\"nope\"}\n").await.expect("write");
        let err = read_stream_chunks(&bad).await.expect_err("bad line");
        assert!(err.to_string().contains(":1: invalid stream chunk"));
    }

    #[tokio::test]
    async fn replay_runs_a_delegation_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let events = dir.path().join("events.jsonl");
        let lines = [
            json!({"type": "tool_call_end", "id": "d1", "name": "new_task", "arguments": "{\"message\":\"write docs\"}"}),
            json!({"type": "done"}),
            json!({"type": "text_delta", "text": "docs written"}),
            json!({"type": "done"}),
            json!({"type": "text_delta", "text": "all done"}),
            json!({"type": "done"}),
        ];
        let body: Vec<String> = lines.iter().map(Value::to_string).collect();
        tokio::fs::write(&events, body.join("\n")).await.expect("write");

        let report = run_replay(ReplayArgs {
            events,
            config_path: dir.path().join("config.json"),
            state_dir: dir.path().to_path_buf(),
            auto_approve: true,
            prompt: "document the crate".into(),
            overrides: None,
        })
        .await
        .expect("replay");

        let turns = report["turns"].as_array().expect("turns");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0]["outcome"]["delegation"]["id"], "d1");
        assert_ne!(turns[1]["taskID"], turns[0]["taskID"]);
        assert_eq!(turns[2]["taskID"], turns[0]["taskID"]);

        let tasks = report["tasks"].as_array().expect("tasks");
        assert_eq!(tasks.len(), 2);
        let parent_transcript = tasks[0]["transcript"].as_array().expect("transcript");
        // user prompt, delegation call, child result, final answer
        assert_eq!(parent_transcript.len(), 4);
        assert_eq!(parent_transcript[2]["content"][0]["tool_use_id"], "d1");
        assert_eq!(parent_transcript[2]["content"][0]["content"], "docs written");
    }
}
